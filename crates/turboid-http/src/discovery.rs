//! # HTML Discovery
//!
//! Resolves a user-supplied identifier to its provider:
//!
//! 1. [`normalize`] the identifier into a URL
//! 2. fetch it, following redirects; the final URL is the claimed identifier
//! 3. read the `<link rel>` tags in the document head
//!
//! OpenID 2.0 links (`openid2.provider`, `openid2.local_id`) take precedence
//! over OpenID 1.1 links (`openid.server`, `openid.delegate`). Yadis/XRDS and
//! XRI identifiers are not supported.

use std::borrow::Cow;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::LOCATION;
use tracing::{debug, instrument, warn};
use turboid::{Discovery, DiscoveryError, ProtocolVersion, ProviderEndpoint, TransportError};
use url::Url;

use crate::client::{HttpTransportConfig, build_client, pinned_client, read_limited, request_error};
use crate::ssrf::SsrfValidator;

/// Normalize a user-supplied identifier: add `http://` when no scheme is
/// given, lowercase scheme and host, add the trailing slash of a bare host,
/// drop any fragment.
///
/// # Errors
///
/// Returns [`DiscoveryError::InvalidIdentifier`] for empty input, XRIs,
/// unparseable URLs and schemes other than `http`/`https`.
pub fn normalize(identifier: &str) -> Result<String, DiscoveryError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(DiscoveryError::InvalidIdentifier("empty identifier".to_string()));
    }
    if trimmed.starts_with(['=', '@', '+', '$', '!', '('])
        || trimmed.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("xri://"))
    {
        return Err(DiscoveryError::InvalidIdentifier(format!(
            "XRI identifiers are not supported: {trimmed}"
        )));
    }

    let has_scheme = trimmed.split_once("://").is_some_and(|(scheme, _)| {
        !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    });
    let with_scheme = if has_scheme {
        Cow::Borrowed(trimmed)
    } else {
        Cow::Owned(format!("http://{trimmed}"))
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| DiscoveryError::InvalidIdentifier(format!("{trimmed}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DiscoveryError::InvalidIdentifier(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(DiscoveryError::InvalidIdentifier(format!("{trimmed}: no host")));
    }
    url.set_fragment(None);
    Ok(url.into())
}

/// OpenID `<link>` targets found in a document head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlLinks {
    /// `openid.server`
    pub server: Option<String>,
    /// `openid.delegate`
    pub delegate: Option<String>,
    /// `openid2.provider`
    pub provider: Option<String>,
    /// `openid2.local_id`
    pub local_id: Option<String>,
}

impl HtmlLinks {
    /// Extract OpenID links from an HTML document. Only the head is searched
    /// and comments are skipped; the first link for each relation wins.
    pub fn parse(html: &str) -> Self {
        static COMMENT_RE: OnceLock<Regex> = OnceLock::new();
        static LINK_RE: OnceLock<Regex> = OnceLock::new();
        static ATTR_RE: OnceLock<Regex> = OnceLock::new();

        let comment_re = COMMENT_RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
        let link_re = LINK_RE.get_or_init(|| Regex::new(r"(?is)<link\b([^>]*)>").unwrap());
        let attr_re = ATTR_RE.get_or_init(|| {
            Regex::new(r#"(?is)([a-z][a-z0-9_:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
                .unwrap()
        });

        let html = comment_re.replace_all(html, "");
        let lower = html.to_ascii_lowercase();
        let head_end = [lower.find("</head"), lower.find("<body")]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(html.len());
        let head = &html[..head_end];

        let mut links = Self::default();
        for tag in link_re.captures_iter(head) {
            let mut rel = None;
            let mut href = None;
            for attr in attr_re.captures_iter(&tag[1]) {
                let value = attr
                    .get(2)
                    .or_else(|| attr.get(3))
                    .or_else(|| attr.get(4))
                    .map_or("", |m| m.as_str());
                match attr[1].to_ascii_lowercase().as_str() {
                    "rel" => rel = Some(value.to_string()),
                    "href" => href = Some(decode_entities(value.trim())),
                    _ => {}
                }
            }
            let (Some(rel), Some(href)) = (rel, href) else {
                continue;
            };

            for relation in rel.split_ascii_whitespace() {
                let slot = match relation.to_ascii_lowercase().as_str() {
                    "openid.server" => &mut links.server,
                    "openid.delegate" => &mut links.delegate,
                    "openid2.provider" => &mut links.provider,
                    "openid2.local_id" => &mut links.local_id,
                    _ => continue,
                };
                if slot.is_none() {
                    *slot = Some(href.clone());
                }
            }
        }
        links
    }

    /// Provider endpoint for the page at `claimed_id`, resolving relative
    /// links against it. `None` when the page advertises no provider.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Transport`] when a link is not a valid URL.
    pub fn endpoint(&self, claimed_id: &Url) -> Result<Option<ProviderEndpoint>, DiscoveryError> {
        let (server, local_id, version) = match (&self.provider, &self.server) {
            (Some(provider), _) => (provider, &self.local_id, ProtocolVersion::V2_0),
            (None, Some(server)) => (server, &self.delegate, ProtocolVersion::V1_1),
            (None, None) => return Ok(None),
        };

        let resolve = |href: &str| {
            claimed_id.join(href).map(String::from).map_err(|e| {
                DiscoveryError::Transport(TransportError::MalformedResponse(format!(
                    "link {href} on {claimed_id}: {e}"
                )))
            })
        };

        let mut endpoint = ProviderEndpoint::new(resolve(server.as_str())?, claimed_id.as_str(), version);
        if let Some(local_id) = local_id {
            endpoint = endpoint.with_local_id(resolve(local_id.as_str())?);
        }
        Ok(Some(endpoint))
    }
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// A fetched identity page.
#[derive(Debug)]
struct Page {
    /// Final URL after redirects
    url: Url,
    body: String,
}

/// Discovery over HTTP using HTML `<link>` tags
///
/// Every request, including each redirect hop, passes the SSRF policy from
/// the [`HttpTransportConfig`] and connects only to the addresses it checked.
#[derive(Clone)]
pub struct HtmlDiscovery {
    client: reqwest::Client,
    ssrf: SsrfValidator,
    config: HttpTransportConfig,
}

impl HtmlDiscovery {
    /// Create a discovery client with default configuration
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client creation fails
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_config(HttpTransportConfig::default())
    }

    /// Create a discovery client with custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client creation fails
    pub fn with_config(config: HttpTransportConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(&config)?,
            ssrf: SsrfValidator::new(config.ssrf_policy.clone()),
            config,
        })
    }

    /// Follow redirects from `url` and return the final URL.
    ///
    /// # Errors
    ///
    /// Blocked, failed or redirect-looping requests.
    pub async fn canonicalize(&self, url: &str) -> Result<String, DiscoveryError> {
        self.fetch(url).await.map(|page| page.url.into())
    }

    /// Fetch `url` and return its final URL with the OpenID links it carries.
    ///
    /// # Errors
    ///
    /// See [`HtmlDiscovery::canonicalize`].
    pub async fn retrieve_links(&self, url: &str) -> Result<(String, HtmlLinks), DiscoveryError> {
        let page = self.fetch(url).await?;
        Ok((page.url.into(), HtmlLinks::parse(&page.body)))
    }

    async fn fetch(&self, url: &str) -> Result<Page, DiscoveryError> {
        let timeout = self.config.timeout;
        let mut current = Url::parse(url)
            .map_err(|e| DiscoveryError::InvalidIdentifier(format!("{url}: {e}")))?;

        for _ in 0..=self.config.max_redirects {
            let addrs = self
                .ssrf
                .resolve_url(&current)
                .await
                .map_err(TransportError::from)?;
            let client = pinned_client(&self.client, &self.config, &current, &addrs)?;

            let response = client
                .get(current.clone())
                .header(reqwest::header::ACCEPT, "text/html, application/xhtml+xml")
                .send()
                .await
                .map_err(|e| request_error(current.as_str(), timeout, &e))?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        TransportError::MalformedResponse(format!(
                            "redirect from {current} without Location"
                        ))
                    })?;
                let mut next = current.join(location).map_err(|e| {
                    TransportError::MalformedResponse(format!("redirect to {location}: {e}"))
                })?;
                next.set_fragment(None);
                debug!(from = %current, to = %next, "Following redirect");
                current = next;
                continue;
            }
            if !status.is_success() {
                warn!(url = %current, status = status.as_u16(), "Identity page fetch failed");
                return Err(TransportError::UnexpectedStatus {
                    endpoint: current.into(),
                    status: status.as_u16(),
                }
                .into());
            }

            let (body, truncated) =
                read_limited(response, current.as_str(), timeout, self.config.max_response_size)
                    .await?;
            if truncated {
                debug!(url = %current, "Identity page truncated to size limit");
            }
            return Ok(Page {
                url: current,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        warn!(url, max = self.config.max_redirects, "Too many redirects");
        Err(TransportError::RequestFailed {
            endpoint: url.to_string(),
            reason: format!("more than {} redirects", self.config.max_redirects),
        }
        .into())
    }
}

impl std::fmt::Debug for HtmlDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HtmlDiscovery")
            .field("client", &"<reqwest::Client>")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Discovery for HtmlDiscovery {
    #[instrument(skip(self))]
    async fn discover(&self, identifier: &str) -> Result<ProviderEndpoint, DiscoveryError> {
        let normalized = normalize(identifier)?;
        let page = self.fetch(&normalized).await?;
        let links = HtmlLinks::parse(&page.body);

        match links.endpoint(&page.url)? {
            Some(endpoint) => {
                debug!(
                    claimed_id = %endpoint.claimed_id,
                    provider = %endpoint.server_url,
                    version = ?endpoint.version,
                    "Discovered provider"
                );
                Ok(endpoint)
            }
            None => {
                debug!(url = %page.url, "No OpenID links on identity page");
                Err(DiscoveryError::NoProvider(page.url.into()))
            }
        }
    }
}
