//! Association storage
//!
//! The engine persists associations through the [`AssociationStore`] trait and
//! never caches them itself. Implementations must never hand out an expired or
//! invalidated association; the verifier re-checks expiry anyway.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::association::{Association, AssociationSecret};
use crate::error::{OpenIdError, Result};
use crate::types::AssociationType;

/// Persistent association storage keyed by `(provider, handle)`.
///
/// Implementations must be safe for concurrent use; the engine performs no
/// locking of its own. Conformance can be checked with
/// `turboid::testing::assert_store_conformance` (feature `test-utils`).
#[async_trait]
pub trait AssociationStore: Send + Sync + fmt::Debug {
    /// Persist a freshly negotiated association expiring `expires_in` from now.
    async fn store(
        &self,
        provider: &str,
        handle: &str,
        secret: AssociationSecret,
        assoc_type: AssociationType,
        expires_in: Duration,
    ) -> Result<Association>;

    /// Fetch a currently valid association.
    ///
    /// Fails with [`OpenIdError::NotFound`] if the record is absent, expired or
    /// invalidated.
    async fn retrieve(&self, provider: &str, handle: &str) -> Result<Association>;

    /// Remove an association. Removing an absent record is not an error.
    async fn invalidate(&self, provider: &str, handle: &str) -> Result<()>;

    /// Fetch any valid association for the provider.
    ///
    /// The default always misses, so a fresh association is negotiated for
    /// every request.
    async fn find_any(&self, provider: &str) -> Result<Association> {
        Err(OpenIdError::NotFound {
            provider: provider.to_string(),
            handle: None,
        })
    }
}

#[async_trait]
impl<T: AssociationStore + ?Sized> AssociationStore for Arc<T> {
    async fn store(
        &self,
        provider: &str,
        handle: &str,
        secret: AssociationSecret,
        assoc_type: AssociationType,
        expires_in: Duration,
    ) -> Result<Association> {
        (**self)
            .store(provider, handle, secret, assoc_type, expires_in)
            .await
    }

    async fn retrieve(&self, provider: &str, handle: &str) -> Result<Association> {
        (**self).retrieve(provider, handle).await
    }

    async fn invalidate(&self, provider: &str, handle: &str) -> Result<()> {
        (**self).invalidate(provider, handle).await
    }

    async fn find_any(&self, provider: &str) -> Result<Association> {
        (**self).find_any(provider).await
    }
}

/// In-memory association store for development, tests and single-process
/// deployments.
#[derive(Debug)]
pub struct MemoryAssociationStore {
    associations: RwLock<HashMap<(String, String), Association>>,
    /// Associations closer than this to expiry are not offered by `find_any`
    reuse_margin: Duration,
}

impl MemoryAssociationStore {
    /// Create a store with a 30 second reuse margin.
    #[must_use]
    pub fn new() -> Self {
        Self::with_reuse_margin(Duration::from_secs(30))
    }

    /// Create a store that stops offering associations for reuse once less
    /// than `reuse_margin` of their lifetime remains.
    ///
    /// Pre-expiring avoids starting a login whose association expires before
    /// the provider's response comes back.
    #[must_use]
    pub fn with_reuse_margin(reuse_margin: Duration) -> Self {
        Self {
            associations: RwLock::new(HashMap::new()),
            reuse_margin,
        }
    }

    /// Number of records, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.associations.read().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.associations.read().await.is_empty()
    }

    /// Drop expired records, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut associations = self.associations.write().await;
        let before = associations.len();
        associations.retain(|_, assoc| !assoc.is_expired_at(now));
        before - associations.len()
    }
}

impl Default for MemoryAssociationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssociationStore for MemoryAssociationStore {
    async fn store(
        &self,
        provider: &str,
        handle: &str,
        secret: AssociationSecret,
        assoc_type: AssociationType,
        expires_in: Duration,
    ) -> Result<Association> {
        let assoc = Association::new(
            provider,
            handle,
            secret,
            assoc_type,
            SystemTime::now(),
            expires_in,
        )?;
        self.associations.write().await.insert(
            (provider.to_string(), handle.to_string()),
            assoc.clone(),
        );
        debug!(provider, handle, ?expires_in, "Stored association");
        Ok(assoc)
    }

    async fn retrieve(&self, provider: &str, handle: &str) -> Result<Association> {
        let key = (provider.to_string(), handle.to_string());
        match self.associations.read().await.get(&key) {
            Some(assoc) if !assoc.is_expired() => Ok(assoc.clone()),
            _ => Err(OpenIdError::not_found(provider, handle)),
        }
    }

    async fn invalidate(&self, provider: &str, handle: &str) -> Result<()> {
        let removed = self
            .associations
            .write()
            .await
            .remove(&(provider.to_string(), handle.to_string()))
            .is_some();
        debug!(provider, handle, removed, "Invalidated association");
        Ok(())
    }

    async fn find_any(&self, provider: &str) -> Result<Association> {
        let cutoff = SystemTime::now() + self.reuse_margin;
        self.associations
            .read()
            .await
            .iter()
            .filter(|((p, _), assoc)| p == provider && !assoc.is_expired_at(cutoff))
            .max_by_key(|(_, assoc)| assoc.expires_at)
            .map(|(_, assoc)| assoc.clone())
            .ok_or_else(|| OpenIdError::NotFound {
                provider: provider.to_string(),
                handle: None,
            })
    }
}
