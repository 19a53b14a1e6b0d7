//! Collaborator traits for network access
//!
//! The engine performs no I/O of its own. Direct communication with providers
//! goes through [`Transport`] and identifier resolution through [`Discovery`];
//! `turboid-http` ships reqwest-based implementations of both.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DiscoveryError, TransportError};
use crate::message::ParameterSet;
use crate::types::ProviderEndpoint;

/// Direct (server-to-server) communication with a provider.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// POST `params` form-encoded to `endpoint` and decode the key-value form
    /// reply.
    ///
    /// OpenID error replies (HTTP 400 with a key-value body) must be decoded
    /// and returned as `Ok` so the caller can read `error_code`.
    async fn post_form(
        &self,
        endpoint: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, TransportError>;
}

/// Resolution of a user-supplied identifier to its provider.
#[async_trait]
pub trait Discovery: Send + Sync + fmt::Debug {
    /// Discover the provider endpoint for `identifier`.
    async fn discover(&self, identifier: &str) -> Result<ProviderEndpoint, DiscoveryError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn post_form(
        &self,
        endpoint: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, TransportError> {
        (**self).post_form(endpoint, params).await
    }
}

#[async_trait]
impl<T: Discovery + ?Sized> Discovery for Arc<T> {
    async fn discover(&self, identifier: &str) -> Result<ProviderEndpoint, DiscoveryError> {
        (**self).discover(identifier).await
    }
}

/// Run a collaborator call under `timeout`, mapping elapsed time to
/// [`TransportError::Timeout`].
pub(crate) async fn with_timeout<T, E, F>(operation: &str, timeout: Duration, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TransportError>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            operation: operation.to_string(),
            timeout,
        }
        .into()),
    }
}
