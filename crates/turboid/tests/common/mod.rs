//! Common test utilities for integration tests
//!
//! [`MockProvider`] plays an OpenID provider in-process: it answers associate
//! and check_authentication requests, resolves identifiers, and issues signed
//! assertions. [`RecordingStore`] wraps the in-memory store and logs every call.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;

use turboid::association::{Association, AssociationSecret};
use turboid::dh::{DhGroup, DhSession, parse_btwoc_base64};
use turboid::nonce::generate_nonce;
use turboid::signature::sign_message;
use turboid::types::OPENID2_NS;
use turboid::{
    AssociationStore, AssociationType, Consumer, ConsumerConfig, Discovery, DiscoveryError,
    MemoryAssociationStore, ParameterSet, ProtocolVersion, ProviderEndpoint, SessionType,
    Transport, TransportError,
};

pub const OP_ENDPOINT: &str = "https://op.example.com/server";
pub const ALICE: &str = "https://alice.example.com/";
pub const RETURN_TO: &str = "https://rp.example.com/return";

/// Scripted answer for check_authentication
#[derive(Debug, Clone, Default)]
pub struct CheckAuthScript {
    /// Force `is_valid` instead of checking the signature
    pub is_valid: Option<bool>,
    pub invalidate_handle: Option<String>,
}

#[derive(Debug, Default)]
struct ProviderState {
    /// Associations shared with the consumer, by handle
    shared: HashMap<String, Association>,
    /// Associations only the provider knows (stateless mode)
    private: HashMap<String, Association>,
    endpoints: HashMap<String, ProviderEndpoint>,
    next_handle: u32,
    associate_requests: Vec<ParameterSet>,
    check_auth_requests: Vec<ParameterSet>,
    discovery_calls: usize,
    check_auth_script: CheckAuthScript,
}

/// In-process OpenID provider
#[derive(Debug)]
pub struct MockProvider {
    endpoint: String,
    supported: Vec<(AssociationType, SessionType)>,
    expires_in: u64,
    fail_associate: bool,
    state: Mutex<ProviderState>,
}

impl MockProvider {
    /// Provider supporting every association and session type
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn builder() -> MockProviderBuilder {
        MockProviderBuilder {
            supported: vec![
                (AssociationType::HmacSha256, SessionType::DhSha256),
                (AssociationType::HmacSha1, SessionType::DhSha1),
                (AssociationType::HmacSha256, SessionType::NoEncryption),
                (AssociationType::HmacSha1, SessionType::NoEncryption),
            ],
            expires_in: 3600,
            fail_associate: false,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register an identifier this provider speaks for
    pub fn register(&self, endpoint: ProviderEndpoint) {
        let mut state = self.state.lock().unwrap();
        state.endpoints.insert(endpoint.claimed_id.clone(), endpoint);
    }

    /// Register an OpenID 2.0 identifier without delegation
    pub fn register_v2(&self, claimed_id: &str) {
        self.register(ProviderEndpoint::new(&self.endpoint, claimed_id, ProtocolVersion::V2_0));
    }

    pub fn script_check_auth(&self, script: CheckAuthScript) {
        self.state.lock().unwrap().check_auth_script = script;
    }

    pub fn associate_requests(&self) -> Vec<ParameterSet> {
        self.state.lock().unwrap().associate_requests.clone()
    }

    pub fn check_auth_requests(&self) -> Vec<ParameterSet> {
        self.state.lock().unwrap().check_auth_requests.clone()
    }

    pub fn discovery_calls(&self) -> usize {
        self.state.lock().unwrap().discovery_calls
    }

    /// Create an association only the provider knows, as for a stateless request
    pub fn private_association(&self) -> Association {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let assoc = Association::new(
            &self.endpoint,
            format!("private-{}", state.next_handle),
            AssociationSecret::new(vec![0x5a; 32]),
            AssociationType::HmacSha256,
            std::time::SystemTime::now(),
            Duration::from_secs(3600),
        )
        .unwrap();
        state.private.insert(assoc.handle.clone(), assoc.clone());
        assoc
    }

    /// A shared association by handle
    pub fn shared_association(&self, handle: &str) -> Option<Association> {
        self.state.lock().unwrap().shared.get(handle).cloned()
    }

    /// Signed OpenID 2.0 positive assertion for `claimed_id`
    pub fn assert_v2(&self, claimed_id: &str, return_to: &str, assoc: &Association) -> ParameterSet {
        let local_id = self
            .state
            .lock()
            .unwrap()
            .endpoints
            .get(claimed_id)
            .map_or_else(|| claimed_id.to_string(), |e| e.local_identifier().to_string());

        let mut params = ParameterSet::new()
            .with("ns", OPENID2_NS)
            .with("mode", "id_res")
            .with("op_endpoint", self.endpoint.as_str())
            .with("claimed_id", claimed_id)
            .with("identity", local_id)
            .with("return_to", return_to)
            .with("response_nonce", generate_nonce(Utc::now()).unwrap());
        sign_message(
            assoc,
            &mut params,
            &[
                "op_endpoint",
                "claimed_id",
                "identity",
                "return_to",
                "response_nonce",
                "assoc_handle",
                "mode",
            ],
        )
        .unwrap();
        params
    }

    /// Signed OpenID 1.1 positive assertion; `return_to` must carry the
    /// consumer nonce
    pub fn assert_v1(&self, identity: &str, return_to: &str, assoc: &Association) -> ParameterSet {
        let mut params = ParameterSet::new()
            .with("mode", "id_res")
            .with("identity", identity)
            .with("return_to", return_to);
        sign_message(
            assoc,
            &mut params,
            &["mode", "identity", "return_to", "assoc_handle"],
        )
        .unwrap();
        params
    }

    fn associate(&self, request: &ParameterSet) -> ParameterSet {
        let mut state = self.state.lock().unwrap();
        state.associate_requests.push(request.clone());

        if self.fail_associate {
            return ParameterSet::new().with("error", "association disabled");
        }

        let assoc_type: AssociationType = request.get("assoc_type").unwrap().parse().unwrap();
        let session_type: SessionType = request.get("session_type").unwrap_or("").parse().unwrap();
        if !self.supported.contains(&(assoc_type, session_type)) {
            let (preferred_assoc, preferred_session) = self.supported[0];
            return ParameterSet::new()
                .with("ns", OPENID2_NS)
                .with("error", "type not supported")
                .with("error_code", "unsupported-type")
                .with("assoc_type", preferred_assoc.as_str())
                .with("session_type", preferred_session.as_str());
        }

        state.next_handle += 1;
        let handle = format!("shared-{}", state.next_handle);
        let secret: Vec<u8> = (0..assoc_type.secret_len())
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(state.next_handle as u8))
            .collect();

        let mut reply = ParameterSet::new()
            .with("ns", OPENID2_NS)
            .with("assoc_handle", handle.as_str())
            .with("assoc_type", assoc_type.as_str())
            .with("session_type", session_type.as_str())
            .with("expires_in", self.expires_in.to_string());

        if session_type.is_diffie_hellman() {
            let group = match (request.get("dh_modulus"), request.get("dh_gen")) {
                (Some(p), Some(g)) => {
                    DhGroup::new(parse_btwoc_base64(p).unwrap(), parse_btwoc_base64(g).unwrap())
                        .unwrap()
                }
                _ => DhGroup::default(),
            };
            let server = DhSession::generate_in(group, session_type).unwrap();
            let consumer_public =
                parse_btwoc_base64(request.get("dh_consumer_public").unwrap()).unwrap();
            let masked = server.mask(&consumer_public, &secret).unwrap();
            reply.set("dh_server_public", server.public_key_base64());
            reply.set("enc_mac_key", STANDARD.encode(masked));
        } else {
            reply.set("mac_key", STANDARD.encode(&secret));
        }

        state.shared.insert(
            handle.clone(),
            Association::new(
                &self.endpoint,
                handle,
                AssociationSecret::new(secret),
                assoc_type,
                std::time::SystemTime::now(),
                Duration::from_secs(self.expires_in),
            )
            .unwrap(),
        );
        reply
    }

    fn check_authentication(&self, request: &ParameterSet) -> ParameterSet {
        let mut state = self.state.lock().unwrap();
        state.check_auth_requests.push(request.clone());
        let script = state.check_auth_script.clone();

        let is_valid = script.is_valid.unwrap_or_else(|| {
            let handle = request.get("assoc_handle").unwrap_or_default();
            let Some(assoc) = state.private.get(handle).or_else(|| state.shared.get(handle)) else {
                return false;
            };
            // the provider checks the assertion as it was issued
            let mut issued = request.clone();
            issued.set("mode", "id_res");
            turboid::signature::verify_signature(assoc, &issued).is_ok()
        });

        let mut reply = ParameterSet::new()
            .with("ns", OPENID2_NS)
            .with("is_valid", if is_valid { "true" } else { "false" });
        if let Some(handle) = script.invalidate_handle {
            reply.set("invalidate_handle", handle);
        }
        reply
    }
}

#[async_trait]
impl Transport for MockProvider {
    async fn post_form(
        &self,
        endpoint: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, TransportError> {
        if endpoint != self.endpoint {
            return Err(TransportError::RequestFailed {
                endpoint: endpoint.to_string(),
                reason: "unknown host".to_string(),
            });
        }
        match params.get("mode") {
            Some("associate") => Ok(self.associate(params)),
            Some("check_authentication") => Ok(self.check_authentication(params)),
            other => Ok(ParameterSet::new().with("error", format!("unexpected mode {other:?}"))),
        }
    }
}

#[async_trait]
impl Discovery for MockProvider {
    async fn discover(&self, identifier: &str) -> Result<ProviderEndpoint, DiscoveryError> {
        let mut state = self.state.lock().unwrap();
        state.discovery_calls += 1;
        state
            .endpoints
            .get(identifier)
            .cloned()
            .ok_or_else(|| DiscoveryError::NoProvider(identifier.to_string()))
    }
}

pub struct MockProviderBuilder {
    supported: Vec<(AssociationType, SessionType)>,
    expires_in: u64,
    fail_associate: bool,
}

impl MockProviderBuilder {
    /// Supported (assoc_type, session_type) pairs; the first is the preference
    pub fn supported(mut self, supported: Vec<(AssociationType, SessionType)>) -> Self {
        self.supported = supported;
        self
    }

    pub fn expires_in(mut self, seconds: u64) -> Self {
        self.expires_in = seconds;
        self
    }

    pub fn fail_associate(mut self) -> Self {
        self.fail_associate = true;
        self
    }

    pub fn build(self) -> Arc<MockProvider> {
        Arc::new(MockProvider {
            endpoint: OP_ENDPOINT.to_string(),
            supported: self.supported,
            expires_in: self.expires_in,
            fail_associate: self.fail_associate,
            state: Mutex::new(ProviderState::default()),
        })
    }
}

/// Store operation observed by [`RecordingStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Store(String),
    Retrieve(String),
    Invalidate(String),
    FindAny,
}

/// Association store that records every call
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryAssociationStore,
    calls: Mutex<Vec<StoreCall>>,
    expire_on_retrieve: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn inner(&self) -> &MemoryAssociationStore {
        &self.inner
    }

    /// Hand out associations that expire between lookup and use
    pub fn expire_on_retrieve(&self, enabled: bool) {
        self.expire_on_retrieve.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl AssociationStore for RecordingStore {
    async fn store(
        &self,
        provider: &str,
        handle: &str,
        secret: AssociationSecret,
        assoc_type: AssociationType,
        expires_in: Duration,
    ) -> turboid::Result<Association> {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::Store(handle.to_string()));
        self.inner
            .store(provider, handle, secret, assoc_type, expires_in)
            .await
    }

    async fn retrieve(&self, provider: &str, handle: &str) -> turboid::Result<Association> {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::Retrieve(handle.to_string()));
        let mut assoc = self.inner.retrieve(provider, handle).await?;
        if self.expire_on_retrieve.load(Ordering::SeqCst) {
            assoc.expires_at = SystemTime::now() - Duration::from_secs(1);
        }
        Ok(assoc)
    }

    async fn invalidate(&self, provider: &str, handle: &str) -> turboid::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::Invalidate(handle.to_string()));
        self.inner.invalidate(provider, handle).await
    }

    async fn find_any(&self, provider: &str) -> turboid::Result<Association> {
        self.calls.lock().unwrap().push(StoreCall::FindAny);
        self.inner.find_any(provider).await
    }
}

/// Consumer wired to `provider` and `store`
pub fn consumer(
    provider: &Arc<MockProvider>,
    store: &Arc<RecordingStore>,
    config: ConsumerConfig,
) -> Consumer {
    Consumer::builder(provider.clone(), provider.clone())
        .association_store(store.clone())
        .config(config)
        .build()
}

/// Install a test subscriber once so `RUST_LOG` shows engine traces
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
