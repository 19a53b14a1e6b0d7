//! Error types for the relying-party engine.
//!
//! Every failure the engine can report is a distinct [`OpenIdError`] variant so
//! callers can pick a remediation (renegotiate, reject the login, raise an
//! alert) by matching on the kind instead of parsing messages.

use std::time::Duration;

use thiserror::Error;

/// A specialized `Result` type for relying-party operations.
pub type Result<T> = std::result::Result<T, OpenIdError>;

/// Boxed error produced by an extension hook.
pub type ExtensionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by association negotiation, request building and response
/// verification.
#[derive(Debug, Error)]
pub enum OpenIdError {
    /// The association store has no valid record for the lookup.
    #[error("No valid association found for provider {provider}")]
    NotFound {
        /// Provider endpoint that was looked up
        provider: String,
        /// Handle that was looked up, if the lookup was by handle
        handle: Option<String>,
    },

    /// Association negotiation with the provider failed.
    #[error("Association with {provider} failed: {reason}")]
    AssociationFailed {
        /// Provider endpoint
        provider: String,
        /// Why negotiation failed
        reason: String,
    },

    /// The provider answered with `cancel`, `error` or an unexpected mode.
    #[error("Provider rejected the request (mode: {mode}){}", .error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    ResponseRejected {
        /// Mode found in the response
        mode: String,
        /// `openid.error` text when the provider supplied one
        error: Option<String>,
    },

    /// The asserted identity is not the one the caller expected.
    #[error("Identity mismatch: expected {expected}, response asserts {actual}")]
    IdentityMismatch {
        /// Identity the caller expected (or the discovered one)
        expected: String,
        /// Identity found in the response
        actual: String,
    },

    /// Mandatory fields are not covered by `openid.signed`.
    #[error("Fields not covered by signature: {}", .missing.join(", "))]
    MissingSignedFields {
        /// The mandatory fields that were not signed
        missing: Vec<String>,
    },

    /// A required field is absent or malformed.
    #[error("Missing or malformed parameter: {0}")]
    MissingParameter(String),

    /// The response nonce has already been accepted once.
    #[error("Replay detected for nonce {nonce}")]
    ReplayDetected {
        /// The replayed nonce
        nonce: String,
    },

    /// The response nonce is too old or too far in the future.
    #[error("Stale response: nonce age {age_seconds}s is outside the {max_age_seconds}s window")]
    StaleResponse {
        /// Signed distance between now and the nonce timestamp
        age_seconds: i64,
        /// Accepted window in seconds
        max_age_seconds: u64,
    },

    /// The locally recomputed signature does not match `openid.sig`.
    #[error("Signature mismatch for association {handle}")]
    SignatureMismatch {
        /// Association handle used for verification
        handle: String,
    },

    /// The provider refused to vouch for the response in `check_authentication`.
    #[error("Provider denied verification{}", .invalidated_handle.as_ref().map(|h| format!(" (invalidated handle {h})")).unwrap_or_default())]
    VerificationDenied {
        /// Handle the provider asked us to invalidate, if any
        invalidated_handle: Option<String>,
    },

    /// The association expired between retrieval and verification.
    #[error("Association {handle} expired before the response could be verified")]
    ExpiredOnDelivery {
        /// Association handle
        handle: String,
    },

    /// The transport collaborator failed (passed through unmodified).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The discovery collaborator failed (passed through unmodified).
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// An extension hook failed (passed through as-is).
    #[error("Extension hook failed: {0}")]
    Extension(#[source] ExtensionError),

    /// The association store failed for a reason other than a miss.
    #[error("Association store error: {0}")]
    Storage(String),

    /// A cryptographic primitive (the system random generator) failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

impl OpenIdError {
    /// Build a [`OpenIdError::NotFound`] for a handle lookup.
    pub fn not_found(provider: impl Into<String>, handle: impl Into<String>) -> Self {
        Self::NotFound {
            provider: provider.into(),
            handle: Some(handle.into()),
        }
    }

    /// Build a [`OpenIdError::AssociationFailed`].
    pub fn association_failed(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AssociationFailed {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Whether this is a store miss.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the failure indicates a likely attack rather than a benign
    /// protocol condition.
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::ReplayDetected { .. }
                | Self::SignatureMismatch { .. }
                | Self::IdentityMismatch { .. }
        )
    }
}

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The request could not be sent or the connection failed.
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed {
        /// Target endpoint
        endpoint: String,
        /// Underlying failure
        reason: String,
    },

    /// The provider answered with a status the protocol does not allow.
    #[error("Unexpected HTTP status {status} from {endpoint}")]
    UnexpectedStatus {
        /// Target endpoint
        endpoint: String,
        /// HTTP status code
        status: u16,
    },

    /// The response body could not be decoded.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Response size exceeds the configured maximum.
    #[error("Response size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    ResponseTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Configured maximum in bytes
        max: usize,
    },

    /// The target endpoint was refused before any request was made.
    #[error("Endpoint blocked: {0}")]
    Blocked(String),

    /// The call did not complete within the caller-supplied timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The timeout that was exceeded
        timeout: Duration,
    },
}

impl TransportError {
    /// Whether retrying the same call later might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RequestFailed { .. } | Self::UnexpectedStatus { .. }
        )
    }
}

/// Errors raised by a [`Discovery`](crate::transport::Discovery) implementation.
#[derive(Debug, Error, Clone)]
pub enum DiscoveryError {
    /// The identifier is not a usable URL.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The identity page carries no provider link.
    #[error("No OpenID provider advertised at {0}")]
    NoProvider(String),

    /// Fetching the identity page failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
