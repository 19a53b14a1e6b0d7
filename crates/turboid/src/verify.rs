//! Response verification
//!
//! A positive assertion (`id_res`) is accepted only after passing, in order:
//!
//! 1. mode check
//! 2. identity check, including claimed-identifier rediscovery for OpenID 2.0
//! 3. signed-field coverage
//! 4. nonce age and replay check
//! 5. signature check, locally with a stored association or, when the handle
//!    is unknown, by asking the provider (`check_authentication`)
//! 6. expiry re-check of the association used
//! 7. extension `on_response` hook
//!
//! Each stage fails with its own [`OpenIdError`] variant and nothing after a
//! failed stage runs.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::check_auth::check_authentication;
use crate::config::ConsumerConfig;
use crate::error::{OpenIdError, Result};
use crate::extension::Extension;
use crate::message::ParameterSet;
use crate::nonce::ReplayGuard;
use crate::signature::verify_signature;
use crate::store::AssociationStore;
use crate::transport::{Discovery, Transport, with_timeout};
use crate::types::{IDENTIFIER_SELECT, Mode, OPENID1_NS, OPENID2_NS, ProtocolVersion, ProviderEndpoint};

/// Fields every positive assertion must sign.
const REQUIRED_SIGNED: &[&str] = &["mode", "identity", "return_to", "assoc_handle"];

/// Additional fields an OpenID 2.0 assertion must sign.
const REQUIRED_SIGNED_V2: &[&str] = &["op_endpoint", "response_nonce"];

/// Terminal state of a successful verification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The provider vouches for the identity.
    Verified(VerifiedIdentity),
    /// An immediate request needs user interaction at the provider.
    SetupNeeded {
        /// Where to send the user, when the provider supplied it (OpenID 1.1)
        user_setup_url: Option<String>,
    },
}

/// An identity proven by a verified assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// The user's identifier (claimed identifier for OpenID 2.0)
    pub identity: String,
    /// Provider-local identifier asserted in `openid.identity`
    pub local_id: String,
    /// Provider endpoint that signed the assertion
    pub provider: String,
    /// Protocol revision of the assertion
    pub version: ProtocolVersion,
    /// Whether the stateless path was used
    pub stateless: bool,
}

/// Verifies provider responses.
#[derive(Debug, Clone)]
pub struct ResponseVerifier {
    store: Arc<dyn AssociationStore>,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    guard: ReplayGuard,
    config: Arc<ConsumerConfig>,
}

/// Identity facts established by the identity check.
struct Asserted {
    identity: String,
    local_id: String,
    provider: String,
}

impl ResponseVerifier {
    /// Create a verifier.
    pub fn new(
        store: Arc<dyn AssociationStore>,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
        guard: ReplayGuard,
        config: Arc<ConsumerConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            discovery,
            guard,
            config,
        }
    }

    /// Verify a provider response against the identity the login started with.
    ///
    /// Pass [`IDENTIFIER_SELECT`] as `expected_identity` when the user let the
    /// provider choose the identifier; the asserted claimed identifier is then
    /// accepted after rediscovery confirms the provider may speak for it.
    ///
    /// # Errors
    ///
    /// Returns the variant of the first failing stage; see the module docs.
    #[instrument(skip(self, params, extension), fields(mode = params.get("mode")))]
    pub async fn verify(
        &self,
        params: &ParameterSet,
        expected_identity: &str,
        extension: Option<&mut (dyn Extension + '_)>,
    ) -> Result<VerificationOutcome> {
        // 1. mode
        let mode = params.get("mode").unwrap_or_default();
        match mode.parse::<Mode>() {
            Ok(Mode::IdRes) => {
                if let Some(url) = params.get("user_setup_url") {
                    debug!("Immediate request needs setup");
                    return Ok(VerificationOutcome::SetupNeeded {
                        user_setup_url: Some(url.to_string()),
                    });
                }
            }
            Ok(Mode::SetupNeeded) => {
                return Ok(VerificationOutcome::SetupNeeded {
                    user_setup_url: params.get("user_setup_url").map(str::to_string),
                });
            }
            _ => {
                debug!(mode, "Provider did not assert an identity");
                return Err(OpenIdError::ResponseRejected {
                    mode: mode.to_string(),
                    error: params.get("error").map(str::to_string),
                });
            }
        }
        let version = message_version(params)?;

        // 2. identity
        let asserted = match version {
            ProtocolVersion::V2_0 => self.check_identity_v2(params, expected_identity).await?,
            ProtocolVersion::V1_1 => self.check_identity_v1(params, expected_identity).await?,
        };

        // 3. signed-field coverage
        check_signed_fields(params, version)?;

        // 4. nonce
        let nonce = match version {
            ProtocolVersion::V2_0 => params.require("response_nonce")?.to_string(),
            ProtocolVersion::V1_1 => self.consumer_nonce(params)?,
        };
        let checked = self
            .guard
            .check(&asserted.provider, &nonce, Utc::now())
            .await?;

        // 5 + 6. signature
        let stateless = self.check_signature(params, &asserted.provider).await?;

        self.guard.commit(&checked).await?;

        // 7. extensions
        if let Some(extension) = extension {
            extension
                .on_response(params)
                .map_err(OpenIdError::Extension)?;
        }

        debug!(identity = %asserted.identity, provider = %asserted.provider, stateless, "Assertion verified");
        Ok(VerificationOutcome::Verified(VerifiedIdentity {
            identity: asserted.identity,
            local_id: asserted.local_id,
            provider: asserted.provider,
            version,
            stateless,
        }))
    }

    async fn discover(&self, identifier: &str) -> Result<ProviderEndpoint> {
        with_timeout("discovery", self.config.network_timeout, async {
            self.discovery
                .discover(identifier)
                .await
                .map_err(OpenIdError::from)
        })
        .await
    }

    async fn check_identity_v2(&self, params: &ParameterSet, expected: &str) -> Result<Asserted> {
        let claimed_id = params.require("claimed_id")?;
        let local_id = params.require("identity")?;
        let op_endpoint = params.require("op_endpoint")?;

        // fragments distinguish recycled identifiers but are not part of discovery
        let claimed_base = strip_fragment(claimed_id);
        if expected != IDENTIFIER_SELECT && strip_fragment(expected) != claimed_base {
            warn!(expected, claimed_id, "Assertion is for a different identity");
            return Err(OpenIdError::IdentityMismatch {
                expected: expected.to_string(),
                actual: claimed_id.to_string(),
            });
        }

        let endpoint = self.discover(claimed_base).await?;
        if endpoint.server_url != op_endpoint {
            warn!(discovered = %endpoint.server_url, op_endpoint, "Provider may not speak for this identity");
            return Err(OpenIdError::IdentityMismatch {
                expected: endpoint.server_url,
                actual: op_endpoint.to_string(),
            });
        }
        if endpoint.local_identifier() != local_id {
            warn!(discovered = endpoint.local_identifier(), local_id, "Local identifier does not match discovery");
            return Err(OpenIdError::IdentityMismatch {
                expected: endpoint.local_identifier().to_string(),
                actual: local_id.to_string(),
            });
        }

        Ok(Asserted {
            identity: claimed_id.to_string(),
            local_id: local_id.to_string(),
            provider: op_endpoint.to_string(),
        })
    }

    async fn check_identity_v1(&self, params: &ParameterSet, expected: &str) -> Result<Asserted> {
        let actual = params.require("identity")?;
        if expected == IDENTIFIER_SELECT {
            // 1.1 has no directed identity
            return Err(OpenIdError::IdentityMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        // 1.1 responses name no provider; rediscovery supplies it
        let endpoint = self.discover(expected).await?;
        if actual != expected
            && actual != endpoint.claimed_id
            && actual != endpoint.local_identifier()
        {
            warn!(expected, actual, "Assertion is for a different identity");
            return Err(OpenIdError::IdentityMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(Asserted {
            identity: endpoint.claimed_id,
            local_id: actual.to_string(),
            provider: endpoint.server_url,
        })
    }

    fn consumer_nonce(&self, params: &ParameterSet) -> Result<String> {
        let return_to = params.require("return_to")?;
        let url = Url::parse(return_to)
            .map_err(|e| OpenIdError::MissingParameter(format!("openid.return_to: {e}")))?;
        url.query_pairs()
            .find(|(key, _)| *key == self.config.nonce_param)
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| {
                OpenIdError::MissingParameter(format!(
                    "{} in openid.return_to",
                    self.config.nonce_param
                ))
            })
    }

    /// Returns whether the stateless path was taken.
    async fn check_signature(&self, params: &ParameterSet, provider: &str) -> Result<bool> {
        let handle = params.require("assoc_handle")?;

        match self.store.retrieve(provider, handle).await {
            Ok(assoc) => {
                if let Err(e) = verify_signature(&assoc, params) {
                    warn!(provider, handle, "Signature mismatch");
                    return Err(e);
                }
                if assoc.is_expired() {
                    warn!(provider, handle, "Association expired during verification");
                    return Err(OpenIdError::ExpiredOnDelivery {
                        handle: handle.to_string(),
                    });
                }
                debug!(provider, handle, "Signature verified with stored association");
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                debug!(provider, handle, "No stored association, asking the provider");
                let reply = check_authentication(
                    self.transport.as_ref(),
                    provider,
                    params,
                    self.config.network_timeout,
                )
                .await?;

                if let Some(invalid) = &reply.invalidate_handle {
                    self.store.invalidate(provider, invalid).await?;
                }
                if !reply.is_valid || reply.invalidate_handle.is_some() {
                    warn!(provider, handle, is_valid = reply.is_valid, "Provider denied verification");
                    return Err(OpenIdError::VerificationDenied {
                        invalidated_handle: reply.invalidate_handle,
                    });
                }
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

/// Determine the protocol revision from `openid.ns`.
fn message_version(params: &ParameterSet) -> Result<ProtocolVersion> {
    match params.get("ns") {
        Some(OPENID2_NS) => Ok(ProtocolVersion::V2_0),
        None | Some(OPENID1_NS) => Ok(ProtocolVersion::V1_1),
        Some(other) => Err(OpenIdError::MissingParameter(format!(
            "openid.ns has unknown namespace {other}"
        ))),
    }
}

/// Check that `openid.signed` covers every mandatory field.
///
/// # Errors
///
/// Returns [`OpenIdError::MissingSignedFields`] naming each uncovered field.
pub fn check_signed_fields(params: &ParameterSet, version: ProtocolVersion) -> Result<()> {
    let signed = params.signed_fields();
    let mut required: Vec<&str> = REQUIRED_SIGNED.to_vec();
    if version.is_v2() {
        required.extend_from_slice(REQUIRED_SIGNED_V2);
        if params.contains("claimed_id") {
            required.push("claimed_id");
        }
    }

    let missing: Vec<String> = required
        .into_iter()
        .filter(|field| !signed.contains(field))
        .map(str::to_string)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        warn!(?missing, "Mandatory fields are not signed");
        Err(OpenIdError::MissingSignedFields { missing })
    }
}

fn strip_fragment(url: &str) -> &str {
    url.split_once('#').map_or(url, |(base, _)| base)
}
