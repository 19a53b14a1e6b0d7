//! Stateless verification (`check_authentication`)
//!
//! The consumer forwards the provider's assertion back to the provider with the
//! mode rewritten; the provider checks the signature against its own record of
//! the (private) association and answers in key-value form.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::{OpenIdError, Result};
use crate::message::ParameterSet;
use crate::transport::{Transport, with_timeout};
use crate::types::Mode;

/// The provider's answer to a `check_authentication` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckAuthResponse {
    /// Whether the provider vouches for the signature
    pub is_valid: bool,
    /// Handle the provider asks the consumer to forget
    pub invalidate_handle: Option<String>,
}

impl CheckAuthResponse {
    /// Interpret a key-value form reply.
    ///
    /// # Errors
    ///
    /// - [`OpenIdError::ResponseRejected`] if the provider answered with an error
    /// - [`OpenIdError::MissingParameter`] if `is_valid` is absent
    pub fn from_reply(reply: &ParameterSet) -> Result<Self> {
        if reply.get("mode") == Some(Mode::Error.as_str()) || reply.contains("error") {
            return Err(OpenIdError::ResponseRejected {
                mode: Mode::Error.as_str().to_string(),
                error: reply.get("error").map(str::to_string),
            });
        }
        let is_valid = reply
            .get("is_valid")
            .ok_or_else(|| OpenIdError::MissingParameter("is_valid".to_string()))?;

        Ok(Self {
            // anything other than the literal "true" is a denial
            is_valid: is_valid == "true",
            invalidate_handle: reply
                .get("invalidate_handle")
                .filter(|h| !h.is_empty())
                .map(str::to_string),
        })
    }
}

/// Ask `provider` to verify `params`.
///
/// Every field of the original assertion is forwarded; only `openid.mode`
/// changes.
///
/// # Errors
///
/// Transport failures (including the timeout) pass through as
/// [`OpenIdError::Transport`]; see [`CheckAuthResponse::from_reply`] for the rest.
#[instrument(skip(transport, params), fields(handle = params.get("assoc_handle")))]
pub async fn check_authentication(
    transport: &dyn Transport,
    provider: &str,
    params: &ParameterSet,
    timeout: Duration,
) -> Result<CheckAuthResponse> {
    let mut request = params.clone();
    request.set("mode", Mode::CheckAuthentication.as_str());

    let reply = with_timeout(
        "check_authentication",
        timeout,
        transport.post_form(provider, &request),
    )
    .await?;
    let response = CheckAuthResponse::from_reply(&reply)?;
    debug!(
        is_valid = response.is_valid,
        invalidate_handle = ?response.invalidate_handle,
        "check_authentication answered"
    );
    Ok(response)
}
