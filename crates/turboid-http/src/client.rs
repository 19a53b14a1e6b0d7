//! reqwest-backed [`Transport`]
//!
//! ## Security Configuration
//!
//! The client is configured to:
//! - NOT follow redirects (direct communication goes to the endpoint discovery
//!   named, nowhere else)
//! - check every endpoint against an [`SsrfValidator`] before sending, and
//!   connect only to the addresses that passed the check (no second DNS
//!   lookup a rebinding resolver could answer differently)
//! - cap the response body size
//! - use rustls for TLS (no OpenSSL dependency)

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};
use turboid::{ParameterSet, Transport, TransportError};
use url::{Host, Url};

use crate::ssrf::{SsrfError, SsrfPolicy, SsrfValidator};

/// Settings shared by [`HttpTransport`] and
/// [`HtmlDiscovery`](crate::discovery::HtmlDiscovery).
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Per-request timeout (default: 30 seconds)
    pub timeout: Duration,

    /// Maximum response body in bytes (default: 256 KiB). Discovery reads up
    /// to this many bytes of a page; direct replies over it are rejected.
    pub max_response_size: usize,

    /// Redirects discovery follows while canonicalizing an identifier
    /// (default: 5)
    pub max_redirects: usize,

    /// User agent for HTTP requests
    pub user_agent: String,

    /// Outbound request policy
    pub ssrf_policy: SsrfPolicy,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_response_size: 256 * 1024,
            max_redirects: 5,
            user_agent: format!("TurboID/{}", env!("CARGO_PKG_VERSION")),
            ssrf_policy: SsrfPolicy::default(),
        }
    }
}

fn client_builder(config: &HttpTransportConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(config.timeout)
        .user_agent(&config.user_agent)
}

/// Build the redirect-free client both collaborators use.
pub(crate) fn build_client(config: &HttpTransportConfig) -> Result<reqwest::Client, reqwest::Error> {
    client_builder(config).build()
}

/// Client for one request to `url`, connecting only to `addrs`.
///
/// IP-literal hosts need no pinning and use `shared`.
pub(crate) fn pinned_client(
    shared: &reqwest::Client,
    config: &HttpTransportConfig,
    url: &Url,
    addrs: &[SocketAddr],
) -> Result<reqwest::Client, TransportError> {
    match url.host() {
        Some(Host::Domain(domain)) => client_builder(config)
            .resolve_to_addrs(domain, addrs)
            .build()
            .map_err(|e| TransportError::RequestFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }),
        _ => Ok(shared.clone()),
    }
}

pub(crate) fn request_error(endpoint: &str, timeout: Duration, err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            operation: format!("request to {endpoint}"),
            timeout,
        }
    } else {
        TransportError::RequestFailed {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Read at most `max` bytes of the body. The flag is set when the body was
/// longer and has been cut off.
pub(crate) async fn read_limited(
    mut response: reqwest::Response,
    endpoint: &str,
    timeout: Duration,
    max: usize,
) -> Result<(Vec<u8>, bool), TransportError> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| request_error(endpoint, timeout, &e))?
    {
        let room = max - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            return Ok((body, true));
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body, false))
}

/// HTTP transport for direct provider communication
///
/// Sends `application/x-www-form-urlencoded` POSTs and decodes key-value form
/// replies. HTTP 400 replies are decoded too, since OpenID error responses
/// (including `unsupported-type`) use that status.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    ssrf: SsrfValidator,
    config: HttpTransportConfig,
}

impl HttpTransport {
    /// Create a transport with security-hardened defaults
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client creation fails
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_config(HttpTransportConfig::default())
    }

    /// Create a transport with custom configuration
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

    /// Active configuration
    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("client", &"<reqwest::Client>")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, params), fields(mode = params.get("mode")))]
    async fn post_form(
        &self,
        endpoint: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, TransportError> {
        let url = Url::parse(endpoint)
            .map_err(|e| SsrfError::InvalidUrl(format!("Failed to parse URL: {e}")))?;
        let addrs = self.ssrf.resolve_url(&url).await?;
        let client = pinned_client(&self.client, &self.config, &url, &addrs)?;

        let response = client
            .post(url)
            .form(&params.to_wire_pairs())
            .send()
            .await
            .map_err(|e| request_error(endpoint, self.config.timeout, &e))?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            warn!(endpoint, status = status.as_u16(), "Unexpected status from provider");
            return Err(TransportError::UnexpectedStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let max = self.config.max_response_size;
        let (body, truncated) = read_limited(response, endpoint, self.config.timeout, max).await?;
        if truncated {
            warn!(endpoint, max, "Provider reply exceeds size limit");
            return Err(TransportError::ResponseTooLarge {
                size: max + 1,
                max,
            });
        }

        let text = String::from_utf8(body)
            .map_err(|e| TransportError::MalformedResponse(format!("reply is not UTF-8: {e}")))?;
        let reply = ParameterSet::from_kv_form(&text)?;
        debug!(endpoint, status = status.as_u16(), fields = reply.len(), "Provider replied");
        Ok(reply)
    }
}
