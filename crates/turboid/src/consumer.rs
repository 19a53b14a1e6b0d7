//! Relying-party façade
//!
//! [`Consumer`] wires the negotiator, request builder and response verifier to
//! one set of collaborators and one configuration.

use std::sync::Arc;

use tracing::instrument;

use crate::association::Association;
use crate::check_auth::{self, CheckAuthResponse};
use crate::config::ConsumerConfig;
use crate::dh::DhGroup;
use crate::error::{OpenIdError, Result};
use crate::extension::Extension;
use crate::message::ParameterSet;
use crate::negotiator::Negotiator;
use crate::nonce::{MemoryNonceStore, NonceStore, ReplayGuard};
use crate::request::{AuthRequest, RequestBuilder};
use crate::store::{AssociationStore, MemoryAssociationStore};
use crate::transport::{Discovery, Transport, with_timeout};
use crate::types::Mode;
use crate::verify::{ResponseVerifier, VerificationOutcome};

/// OpenID relying party.
///
/// Cheap to clone; clones share collaborators.
#[derive(Debug, Clone)]
pub struct Consumer {
    config: Arc<ConsumerConfig>,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    nonce_store: Arc<dyn NonceStore>,
    negotiator: Negotiator,
    requests: RequestBuilder,
    verifier: ResponseVerifier,
}

impl Consumer {
    /// Start building a consumer around the two network collaborators.
    pub fn builder(
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
    ) -> ConsumerBuilder {
        ConsumerBuilder {
            transport,
            discovery,
            config: None,
            store: None,
            nonce_store: None,
            group: None,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Build a non-interactive authentication request.
    ///
    /// # Errors
    ///
    /// See [`RequestBuilder::checkid`].
    pub async fn checkid_immediate(
        &self,
        identity: &str,
        return_to: &str,
        trust_root: Option<&str>,
        extension: Option<&mut (dyn Extension + '_)>,
    ) -> Result<AuthRequest> {
        self.checkid(Mode::CheckidImmediate, identity, return_to, trust_root, extension)
            .await
    }

    /// Build an interactive authentication request.
    ///
    /// # Errors
    ///
    /// See [`RequestBuilder::checkid`].
    pub async fn checkid_setup(
        &self,
        identity: &str,
        return_to: &str,
        trust_root: Option<&str>,
        extension: Option<&mut (dyn Extension + '_)>,
    ) -> Result<AuthRequest> {
        self.checkid(Mode::CheckidSetup, identity, return_to, trust_root, extension)
            .await
    }

    /// Build an authentication request in the given checkid mode.
    ///
    /// # Errors
    ///
    /// See [`RequestBuilder::checkid`].
    pub async fn checkid(
        &self,
        mode: Mode,
        identity: &str,
        return_to: &str,
        trust_root: Option<&str>,
        extension: Option<&mut (dyn Extension + '_)>,
    ) -> Result<AuthRequest> {
        self.requests
            .checkid(mode, identity, return_to, trust_root, extension)
            .await
    }

    /// Discover the provider for `identity` and negotiate a fresh association.
    ///
    /// # Errors
    ///
    /// Discovery and negotiation failures.
    #[instrument(skip(self))]
    pub async fn associate(&self, identity: &str) -> Result<Association> {
        let endpoint = with_timeout("discovery", self.config.network_timeout, async {
            self.discovery
                .discover(identity)
                .await
                .map_err(OpenIdError::from)
        })
        .await?;
        self.negotiator.associate(&endpoint).await
    }

    /// Verify a provider response (`id_res`, `cancel`, `setup_needed`, ...).
    ///
    /// # Errors
    ///
    /// See [`ResponseVerifier::verify`].
    pub async fn verify(
        &self,
        params: &ParameterSet,
        expected_identity: &str,
        extension: Option<&mut (dyn Extension + '_)>,
    ) -> Result<VerificationOutcome> {
        self.verifier
            .verify(params, expected_identity, extension)
            .await
    }

    /// Verify the query string the provider redirected the user agent back
    /// with.
    ///
    /// # Errors
    ///
    /// See [`ResponseVerifier::verify`].
    pub async fn verify_query(
        &self,
        query: &str,
        expected_identity: &str,
        extension: Option<&mut (dyn Extension + '_)>,
    ) -> Result<VerificationOutcome> {
        let params = ParameterSet::from_query(query);
        self.verify(&params, expected_identity, extension).await
    }

    /// Ask `provider` directly whether `params` carries a valid signature.
    ///
    /// # Errors
    ///
    /// See [`check_auth::check_authentication`].
    pub async fn check_authentication(
        &self,
        provider: &str,
        params: &ParameterSet,
    ) -> Result<CheckAuthResponse> {
        check_auth::check_authentication(
            self.transport.as_ref(),
            provider,
            params,
            self.config.network_timeout,
        )
        .await
    }

    /// Drop nonces too old to matter, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Nonce store failures.
    pub async fn cleanup_nonces(&self) -> Result<usize> {
        self.nonce_store.cleanup_expired().await
    }
}

/// Builder for [`Consumer`]
#[derive(Debug)]
pub struct ConsumerBuilder {
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    config: Option<ConsumerConfig>,
    store: Option<Arc<dyn AssociationStore>>,
    nonce_store: Option<Arc<dyn NonceStore>>,
    group: Option<DhGroup>,
}

impl ConsumerBuilder {
    /// Set the configuration (default: [`ConsumerConfig::default`])
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the association store (default: in-memory)
    pub fn association_store(mut self, store: Arc<dyn AssociationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the nonce store (default: in-memory, retaining nonces for the
    /// configured age plus skew)
    pub fn nonce_store(mut self, store: Arc<dyn NonceStore>) -> Self {
        self.nonce_store = Some(store);
        self
    }

    /// Use a non-default Diffie-Hellman group
    pub fn dh_group(mut self, group: DhGroup) -> Self {
        self.group = Some(group);
        self
    }

    /// Build the consumer
    pub fn build(self) -> Consumer {
        let config = Arc::new(self.config.unwrap_or_default());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryAssociationStore::new()));
        let nonce_store = self.nonce_store.unwrap_or_else(|| {
            Arc::new(MemoryNonceStore::with_retention(config.nonce_retention()))
        });

        let mut negotiator = Negotiator::new(store.clone(), self.transport.clone(), config.clone());
        if let Some(group) = self.group {
            negotiator = negotiator.with_group(group);
        }
        let guard = ReplayGuard::new(
            nonce_store.clone(),
            config.max_nonce_age,
            config.max_clock_skew,
        );

        Consumer {
            requests: RequestBuilder::new(
                negotiator.clone(),
                self.discovery.clone(),
                config.clone(),
            ),
            verifier: ResponseVerifier::new(
                store,
                self.transport.clone(),
                self.discovery.clone(),
                guard,
                config.clone(),
            ),
            negotiator,
            nonce_store,
            transport: self.transport,
            discovery: self.discovery,
            config,
        }
    }
}
