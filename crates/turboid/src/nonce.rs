//! Nonce tracking and replay protection
//!
//! OpenID 2.0 providers put a signed `openid.response_nonce` in every positive
//! assertion: a UTC timestamp (`2005-05-15T17:11:51Z`) followed by up to 255
//! printable characters making it unique. OpenID 1.1 has no provider nonce, so
//! the consumer appends its own nonce in the same format to `return_to`.
//!
//! A response is accepted at most once per `(provider, nonce)` pair and only
//! while its timestamp lies within the configured window.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, warn};

use crate::error::{OpenIdError, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const TIMESTAMP_LEN: usize = 20;
const SALT_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const SALT_LEN: usize = 8;

/// Generate a nonce stamped with `now`.
///
/// # Errors
///
/// Returns [`OpenIdError::Crypto`] if the system random generator fails.
pub fn generate_nonce(now: DateTime<Utc>) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new().fill(&mut salt).map_err(rng_failed)?;

    let mut nonce = now.format(TIMESTAMP_FORMAT).to_string();
    nonce.extend(
        salt.iter()
            .map(|b| SALT_CHARS[usize::from(*b) % SALT_CHARS.len()] as char),
    );
    Ok(nonce)
}

fn rng_failed(_: ring::error::Unspecified) -> OpenIdError {
    OpenIdError::Crypto("random number generation failed".to_string())
}

/// Parse the timestamp prefix of a nonce.
///
/// Returns `None` when the nonce does not start with a valid UTC timestamp.
#[must_use]
pub fn parse_nonce_timestamp(nonce: &str) -> Option<DateTime<Utc>> {
    let stamp = nonce.get(..TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Storage for nonces that have already been accepted.
///
/// Implementations shared between processes must make
/// [`check_and_insert`](NonceStore::check_and_insert) atomic.
#[async_trait]
pub trait NonceStore: Send + Sync + fmt::Debug {
    /// Whether the nonce was already accepted for this provider.
    async fn is_used(&self, provider: &str, nonce: &str) -> Result<bool>;

    /// Record the nonce, returning `false` if it was already present.
    async fn check_and_insert(&self, provider: &str, nonce: &str, issued_at: i64) -> Result<bool>;

    /// Forget nonces too old to pass the age check, returning how many were
    /// dropped.
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// In-memory nonce store.
#[derive(Debug)]
pub struct MemoryNonceStore {
    used: DashMap<(String, String), i64>,
    /// Records older than this are dropped by `cleanup_expired`
    retention: Duration,
}

impl MemoryNonceStore {
    /// Create a store retaining nonces for ten minutes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(Duration::from_secs(600))
    }

    /// Create a store retaining nonces for `retention`.
    ///
    /// Retention must cover the verifier's maximum nonce age plus clock skew,
    /// otherwise a replay could slip in after cleanup.
    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            used: DashMap::new(),
            retention,
        }
    }

    /// Number of tracked nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.used.len()
    }

    /// Whether no nonces are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

impl Default for MemoryNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn is_used(&self, provider: &str, nonce: &str) -> Result<bool> {
        Ok(self
            .used
            .contains_key(&(provider.to_string(), nonce.to_string())))
    }

    async fn check_and_insert(&self, provider: &str, nonce: &str, issued_at: i64) -> Result<bool> {
        match self.used.entry((provider.to_string(), nonce.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(issued_at);
                Ok(true)
            }
        }
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - self.retention.as_secs() as i64;
        let before = self.used.len();
        self.used.retain(|_, issued_at| *issued_at > cutoff);
        let removed = before.saturating_sub(self.used.len());
        if removed > 0 {
            debug!(removed, "Cleaned up expired nonces");
        }
        Ok(removed)
    }
}

/// Age and replay checks over a [`NonceStore`].
///
/// Checking and committing are separate steps: a nonce is checked before the
/// signature is verified but only recorded once the whole response has been
/// accepted, so a forged response cannot burn a legitimate nonce.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    store: Arc<dyn NonceStore>,
    max_age: Duration,
    max_skew: Duration,
}

/// A nonce that passed [`ReplayGuard::check`] and can be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedNonce {
    /// Provider the nonce is scoped to
    pub provider: String,
    /// The nonce string
    pub nonce: String,
    /// Unix timestamp from the nonce prefix
    pub issued_at: i64,
}

impl ReplayGuard {
    /// Create a guard accepting nonces up to `max_age` old and at most
    /// `max_skew` in the future.
    pub fn new(store: Arc<dyn NonceStore>, max_age: Duration, max_skew: Duration) -> Self {
        Self {
            store,
            max_age,
            max_skew,
        }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn NonceStore> {
        &self.store
    }

    /// Validate format, age and novelty of `nonce` at `now`.
    ///
    /// # Errors
    ///
    /// - [`OpenIdError::MissingParameter`] if the nonce has no valid timestamp
    /// - [`OpenIdError::StaleResponse`] if it is older than `max_age` or more
    ///   than `max_skew` in the future
    /// - [`OpenIdError::ReplayDetected`] if it was already accepted
    pub async fn check(
        &self,
        provider: &str,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckedNonce> {
        let issued = parse_nonce_timestamp(nonce).ok_or_else(|| {
            OpenIdError::MissingParameter(format!("nonce {nonce:?} has no valid timestamp"))
        })?;

        let age = now.signed_duration_since(issued).num_seconds();
        if age > self.max_age.as_secs() as i64 {
            warn!(provider, age, "Rejected stale nonce");
            return Err(OpenIdError::StaleResponse {
                age_seconds: age,
                max_age_seconds: self.max_age.as_secs(),
            });
        }
        if -age > self.max_skew.as_secs() as i64 {
            warn!(provider, age, "Rejected nonce from the future");
            return Err(OpenIdError::StaleResponse {
                age_seconds: age,
                max_age_seconds: self.max_skew.as_secs(),
            });
        }

        if self.store.is_used(provider, nonce).await? {
            warn!(provider, nonce, "Replay detected");
            return Err(OpenIdError::ReplayDetected {
                nonce: nonce.to_string(),
            });
        }

        Ok(CheckedNonce {
            provider: provider.to_string(),
            nonce: nonce.to_string(),
            issued_at: issued.timestamp(),
        })
    }

    /// Record a checked nonce as used.
    ///
    /// # Errors
    ///
    /// Returns [`OpenIdError::ReplayDetected`] if a concurrent verification
    /// committed the same nonce first.
    pub async fn commit(&self, checked: &CheckedNonce) -> Result<()> {
        if self
            .store
            .check_and_insert(&checked.provider, &checked.nonce, checked.issued_at)
            .await?
        {
            Ok(())
        } else {
            warn!(provider = %checked.provider, nonce = %checked.nonce, "Replay detected on commit");
            Err(OpenIdError::ReplayDetected {
                nonce: checked.nonce.clone(),
            })
        }
    }
}
