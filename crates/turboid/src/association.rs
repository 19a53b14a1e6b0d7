//! Associations: shared secrets negotiated with a provider.

use std::fmt;
use std::time::{Duration, SystemTime};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use zeroize::Zeroize;

use crate::error::{OpenIdError, Result};
use crate::types::AssociationType;

/// MAC key of an association.
///
/// Zeroized on drop and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct AssociationSecret(Vec<u8>);

impl AssociationSecret {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decode a base64 `mac_key`.
    ///
    /// # Errors
    ///
    /// Returns the decoder error if the input is not valid base64.
    pub fn from_base64(encoded: &str) -> std::result::Result<Self, base64::DecodeError> {
        STANDARD.decode(encoded).map(Self)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Zeroize for AssociationSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for AssociationSecret {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for AssociationSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssociationSecret([REDACTED; {} bytes])", self.0.len())
    }
}

/// A shared secret negotiated with one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    /// Provider endpoint the secret is shared with
    pub provider: String,
    /// Provider-issued handle
    pub handle: String,
    /// MAC key
    pub secret: AssociationSecret,
    /// MAC algorithm the key is used with
    pub assoc_type: AssociationType,
    /// Absolute expiry
    pub expires_at: SystemTime,
}

impl Association {
    /// Create an association expiring `expires_in` after `now`.
    ///
    /// # Errors
    ///
    /// Returns [`OpenIdError::AssociationFailed`] when `now + expires_in` is
    /// not representable.
    pub fn new(
        provider: impl Into<String>,
        handle: impl Into<String>,
        secret: AssociationSecret,
        assoc_type: AssociationType,
        now: SystemTime,
        expires_in: Duration,
    ) -> Result<Self> {
        let provider = provider.into();
        let Some(expires_at) = now.checked_add(expires_in) else {
            return Err(OpenIdError::AssociationFailed {
                provider,
                reason: format!("expires_in of {}s is out of range", expires_in.as_secs()),
            });
        };
        Ok(Self {
            provider,
            handle: handle.into(),
            secret,
            assoc_type,
            expires_at,
        })
    }

    /// Whether the association has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Whether the association has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Time left before expiry, zero once expired.
    #[must_use]
    pub fn expires_in(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}
