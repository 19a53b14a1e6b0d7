//! Authentication request construction
//!
//! Builds the indirect `checkid_immediate` / `checkid_setup` message the user
//! agent is redirected with. Requests are not signed; the association handle
//! only tells the provider which key to sign its response with.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::ConsumerConfig;
use crate::error::{OpenIdError, Result};
use crate::extension::Extension;
use crate::message::ParameterSet;
use crate::negotiator::Negotiator;
use crate::nonce::generate_nonce;
use crate::transport::{Discovery, with_timeout};
use crate::types::{Mode, OPENID2_NS, ProviderEndpoint};

/// A built authentication request.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// URL to redirect the user agent to
    pub redirect_url: String,
    /// Provider the request targets
    pub endpoint: ProviderEndpoint,
    /// Handle the provider was asked to sign with; `None` in stateless mode
    pub assoc_handle: Option<String>,
    /// `return_to` as sent, including the consumer nonce for OpenID 1.1
    pub return_to: String,
}

/// Builds `checkid_*` redirects.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    negotiator: Negotiator,
    discovery: Arc<dyn Discovery>,
    config: Arc<ConsumerConfig>,
}

impl RequestBuilder {
    /// Create a builder.
    pub fn new(
        negotiator: Negotiator,
        discovery: Arc<dyn Discovery>,
        config: Arc<ConsumerConfig>,
    ) -> Self {
        Self {
            negotiator,
            discovery,
            config,
        }
    }

    /// Discover the provider for `identity` and build the redirect.
    ///
    /// An association is reused or negotiated first. If that fails the error
    /// is returned, unless stateless fallback is enabled, in which case the
    /// request goes out without `assoc_handle`.
    ///
    /// # Errors
    ///
    /// - [`OpenIdError::MissingParameter`] for a non-checkid mode or an
    ///   unparseable `return_to`
    /// - [`OpenIdError::Discovery`] when the identifier cannot be resolved
    /// - negotiation errors when stateless fallback is off
    /// - [`OpenIdError::Extension`] when a hook fails
    #[instrument(skip(self, extension))]
    pub async fn checkid(
        &self,
        mode: Mode,
        identity: &str,
        return_to: &str,
        trust_root: Option<&str>,
        extension: Option<&mut (dyn Extension + '_)>,
    ) -> Result<AuthRequest> {
        if !mode.is_checkid() {
            return Err(OpenIdError::MissingParameter(format!(
                "openid.mode must be checkid_immediate or checkid_setup, got {mode}"
            )));
        }

        let endpoint = with_timeout("discovery", self.config.network_timeout, async {
            self.discovery
                .discover(identity)
                .await
                .map_err(OpenIdError::from)
        })
        .await?;

        let assoc_handle = match self.negotiator.find_or_associate(&endpoint).await {
            Ok(assoc) => Some(assoc.handle.clone()),
            Err(e) if self.config.stateless_fallback => {
                warn!(provider = %endpoint.server_url, error = %e, "Association failed, continuing statelessly");
                None
            }
            Err(e) => return Err(e),
        };

        self.build(mode, endpoint, assoc_handle, return_to, trust_root, extension)
    }

    /// Build the redirect for an already discovered endpoint.
    ///
    /// # Errors
    ///
    /// See [`RequestBuilder::checkid`].
    pub fn build(
        &self,
        mode: Mode,
        endpoint: ProviderEndpoint,
        assoc_handle: Option<String>,
        return_to: &str,
        trust_root: Option<&str>,
        extension: Option<&mut (dyn Extension + '_)>,
    ) -> Result<AuthRequest> {
        let v2 = endpoint.version.is_v2();
        let return_to = if v2 {
            return_to.to_string()
        } else {
            // 1.1 responses carry no provider nonce
            self.with_consumer_nonce(return_to)?
        };

        let mut params = ParameterSet::new()
            .with("mode", mode.as_str())
            .with("identity", endpoint.local_identifier())
            .with("return_to", return_to.as_str());
        if v2 {
            params.set("ns", OPENID2_NS);
            params.set("claimed_id", endpoint.claimed_id.as_str());
        }
        if let Some(trust_root) = trust_root {
            params.set(if v2 { "realm" } else { "trust_root" }, trust_root);
        }
        if let Some(handle) = &assoc_handle {
            params.set("assoc_handle", handle.as_str());
        }

        if let Some(extension) = extension {
            extension
                .on_request(&mut params)
                .map_err(OpenIdError::Extension)?;
        }

        let redirect_url = params.append_to_url(&endpoint.server_url)?;
        debug!(provider = %endpoint.server_url, %mode, stateless = assoc_handle.is_none(), "Built authentication request");
        Ok(AuthRequest {
            redirect_url,
            endpoint,
            assoc_handle,
            return_to,
        })
    }

    fn with_consumer_nonce(&self, return_to: &str) -> Result<String> {
        let mut url = Url::parse(return_to)
            .map_err(|e| OpenIdError::MissingParameter(format!("openid.return_to {return_to}: {e}")))?;
        let nonce = generate_nonce(Utc::now())?;
        url.query_pairs_mut()
            .append_pair(&self.config.nonce_param, &nonce);
        Ok(url.into())
    }
}
