//! Association negotiation
//!
//! Runs the `associate` exchange with a provider, recovers the MAC key and
//! hands it to the [`AssociationStore`]. A provider that does not support the
//! requested association or session type names the one it prefers; the
//! negotiator retries exactly once with that preference.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, instrument, warn};

use crate::association::{Association, AssociationSecret};
use crate::config::ConsumerConfig;
use crate::dh::{DhGroup, DhSession};
use crate::error::{OpenIdError, Result};
use crate::message::ParameterSet;
use crate::store::AssociationStore;
use crate::transport::{Transport, with_timeout};
use crate::types::{AssociationType, Mode, OPENID2_NS, ProtocolVersion, ProviderEndpoint, SessionType};

const UNSUPPORTED_TYPE: &str = "unsupported-type";

/// Outcome of a single associate round-trip.
enum Reply {
    Established(Association),
    Unsupported {
        assoc_type: AssociationType,
        session_type: SessionType,
    },
}

/// Negotiates associations with providers.
#[derive(Debug, Clone)]
pub struct Negotiator {
    store: Arc<dyn AssociationStore>,
    transport: Arc<dyn Transport>,
    config: Arc<ConsumerConfig>,
    group: DhGroup,
}

impl Negotiator {
    /// Create a negotiator using the default DH group.
    pub fn new(
        store: Arc<dyn AssociationStore>,
        transport: Arc<dyn Transport>,
        config: Arc<ConsumerConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            group: DhGroup::default(),
        }
    }

    /// Use a non-default DH group; its parameters are sent with each request.
    #[must_use]
    pub fn with_group(mut self, group: DhGroup) -> Self {
        self.group = group;
        self
    }

    /// Reuse a stored association for the provider, negotiating a new one on a
    /// miss.
    ///
    /// # Errors
    ///
    /// See [`Negotiator::associate`]; store failures other than a miss pass
    /// through.
    pub async fn find_or_associate(&self, endpoint: &ProviderEndpoint) -> Result<Association> {
        match self.store.find_any(&endpoint.server_url).await {
            Ok(assoc) if !assoc.is_expired() => {
                debug!(provider = %endpoint.server_url, handle = %assoc.handle, "Reusing association");
                Ok(assoc)
            }
            Ok(_) => self.associate(endpoint).await,
            Err(e) if e.is_not_found() => self.associate(endpoint).await,
            Err(e) => Err(e),
        }
    }

    /// Negotiate and store a new association with the provider.
    ///
    /// # Errors
    ///
    /// - [`OpenIdError::AssociationFailed`] for an error reply, a malformed or
    ///   incomplete reply, or a second type mismatch
    /// - [`OpenIdError::Transport`] when the provider cannot be reached in time
    #[instrument(skip(self, endpoint), fields(provider = %endpoint.server_url))]
    pub async fn associate(&self, endpoint: &ProviderEndpoint) -> Result<Association> {
        let https = endpoint.is_https();
        let assoc_type = match endpoint.version {
            // 1.1 only defines HMAC-SHA1
            ProtocolVersion::V1_1 => AssociationType::HmacSha1,
            ProtocolVersion::V2_0 => self.config.assoc_type,
        };
        let session_type = self.config.session_for(assoc_type, https);

        let (assoc_type, session_type) =
            match self.request(endpoint, assoc_type, session_type).await? {
                Reply::Established(assoc) => return Ok(assoc),
                Reply::Unsupported {
                    assoc_type: suggested_assoc,
                    session_type: suggested_session,
                } => {
                    if (suggested_assoc, suggested_session) == (assoc_type, session_type) {
                        return Err(OpenIdError::association_failed(
                            &endpoint.server_url,
                            "provider rejected the type it suggests",
                        ));
                    }
                    if !suggested_session.supports(suggested_assoc) {
                        return Err(OpenIdError::association_failed(
                            &endpoint.server_url,
                            format!("suggested {suggested_session} cannot carry {suggested_assoc}"),
                        ));
                    }
                    if !suggested_session.is_diffie_hellman() && !https {
                        return Err(OpenIdError::association_failed(
                            &endpoint.server_url,
                            "provider suggests a plaintext session over an unencrypted connection",
                        ));
                    }
                    debug!(
                        %suggested_assoc,
                        %suggested_session,
                        "Retrying association with the provider's preference"
                    );
                    (suggested_assoc, suggested_session)
                }
            };

        match self.request(endpoint, assoc_type, session_type).await? {
            Reply::Established(assoc) => Ok(assoc),
            Reply::Unsupported { .. } => {
                warn!("Provider rejected its own suggested association type");
                Err(OpenIdError::association_failed(
                    &endpoint.server_url,
                    "second unsupported-type reply",
                ))
            }
        }
    }

    async fn request(
        &self,
        endpoint: &ProviderEndpoint,
        assoc_type: AssociationType,
        session_type: SessionType,
    ) -> Result<Reply> {
        let provider = endpoint.server_url.as_str();
        let failed = |reason: String| OpenIdError::association_failed(provider, reason);

        let session = if session_type.is_diffie_hellman() {
            Some(
                DhSession::generate_in(self.group.clone(), session_type)
                    .map_err(|e| failed(e.to_string()))?,
            )
        } else {
            None
        };

        let mut params = ParameterSet::new()
            .with("mode", Mode::Associate.as_str())
            .with("assoc_type", assoc_type.as_str());
        if endpoint.version.is_v2() {
            params.set("ns", OPENID2_NS);
        }
        let wire_session = session_type.wire_value(endpoint.version);
        if !wire_session.is_empty() {
            params.set("session_type", wire_session);
        }
        if let Some(dh) = &session {
            params.set("dh_consumer_public", dh.public_key_base64());
            if !self.group.is_default() {
                params.set("dh_modulus", self.group.modulus_base64());
                params.set("dh_gen", self.group.generator_base64());
            }
        }

        debug!(%assoc_type, %session_type, "Sending associate request");
        let reply = with_timeout(
            "associate",
            self.config.network_timeout,
            self.transport.post_form(provider, &params),
        )
        .await?;

        if reply.get("error_code") == Some(UNSUPPORTED_TYPE) {
            let suggested_assoc = reply
                .get("assoc_type")
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| failed("unsupported-type reply without a usable assoc_type".into()))?;
            let suggested_session = reply
                .get("session_type")
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| failed("unsupported-type reply without a usable session_type".into()))?;
            return Ok(Reply::Unsupported {
                assoc_type: suggested_assoc,
                session_type: suggested_session,
            });
        }
        if reply.get("mode") == Some(Mode::Error.as_str()) || reply.contains("error") {
            return Err(failed(
                reply.get("error").unwrap_or("unspecified provider error").to_string(),
            ));
        }

        let field = |key: &str| {
            reply
                .get(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| failed(format!("reply is missing {key}")))
        };

        let handle = field("assoc_handle")?;
        let expires_in: u64 = field("expires_in")?
            .parse()
            .map_err(|_| failed("expires_in is not a non-negative integer".into()))?;

        let replied_type: AssociationType = field("assoc_type")?.parse().map_err(failed)?;
        if replied_type != assoc_type {
            return Err(failed(format!(
                "requested {assoc_type}, provider answered {replied_type}"
            )));
        }
        // 1.1 providers omit session_type for plaintext sessions
        let replied_session: SessionType =
            reply.get("session_type").unwrap_or("").parse().map_err(failed)?;
        if replied_session != session_type {
            return Err(failed(format!(
                "requested {session_type} session, provider answered {replied_session}"
            )));
        }

        let secret = match &session {
            Some(dh) => dh
                .extract_secret(field("dh_server_public")?, field("enc_mac_key")?)
                .map_err(|e| failed(e.to_string()))?,
            None => AssociationSecret::from_base64(field("mac_key")?)
                .map_err(|e| failed(format!("mac_key: {e}")))?,
        };
        if secret.len() != assoc_type.secret_len() {
            return Err(failed(format!(
                "{assoc_type} key must be {} bytes, got {}",
                assoc_type.secret_len(),
                secret.len()
            )));
        }

        let expires_in = Duration::from_secs(expires_in);
        if SystemTime::now().checked_add(expires_in).is_none() {
            return Err(failed(format!("expires_in of {}s is out of range", expires_in.as_secs())));
        }
        let assoc = self
            .store
            .store(provider, handle, secret, assoc_type, expires_in)
            .await?;
        info!(handle, %assoc_type, ?expires_in, "Established association");
        Ok(Reply::Established(assoc))
    }
}
