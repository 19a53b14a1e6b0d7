//! End-to-end relying-party flows against an in-process provider
//!
//! Each test drives a [`Consumer`] through discovery, association, request
//! construction and response verification the way a web application would.

mod common;

use std::time::{Duration, SystemTime};

use pretty_assertions::assert_eq;
use url::Url;

use common::{ALICE, MockProvider, OP_ENDPOINT, RETURN_TO, RecordingStore, StoreCall, consumer};
use turboid::error::ExtensionError;
use turboid::types::IDENTIFIER_SELECT;
use turboid::{
    AssociationType, ConsumerConfig, Extension, OpenIdError, ParameterSet,
    ProtocolVersion, ProviderEndpoint, SessionType, VerificationOutcome,
};

fn query_of(redirect_url: &str) -> ParameterSet {
    let url = Url::parse(redirect_url).unwrap();
    ParameterSet::from_query(url.query().unwrap_or_default())
}

fn verified(outcome: VerificationOutcome) -> turboid::VerifiedIdentity {
    match outcome {
        VerificationOutcome::Verified(identity) => identity,
        other => panic!("expected Verified, got {other:?}"),
    }
}

/// Negotiate an association with a 3600s lifetime and immediately verify an
/// assertion signed with it.
#[tokio::test]
async fn test_associate_then_verify() {
    common::init_tracing();
    let provider = MockProvider::builder().expires_in(3600).build();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let assoc = consumer.associate(ALICE).await.unwrap();
    assert_eq!(assoc.provider, OP_ENDPOINT);
    assert_eq!(assoc.assoc_type, AssociationType::HmacSha256);
    assert!(assoc.expires_in() > Duration::from_secs(3590));
    assert!(assoc.expires_in() <= Duration::from_secs(3600));

    // both sides derived the same MAC key through Diffie-Hellman
    let issued = provider.shared_association(&assoc.handle).unwrap();
    assert_eq!(assoc.secret.expose(), issued.secret.expose());

    let request = provider.associate_requests().remove(0);
    assert_eq!(request.get("session_type"), Some("DH-SHA256"));
    assert!(request.get("dh_consumer_public").is_some());
    assert!(request.get("dh_modulus").is_none());

    let assertion = provider.assert_v2(ALICE, RETURN_TO, &issued);
    let identity = verified(consumer.verify(&assertion, ALICE, None).await.unwrap());
    assert_eq!(identity.identity, ALICE);
    assert_eq!(identity.local_id, ALICE);
    assert_eq!(identity.provider, OP_ENDPOINT);
    assert_eq!(identity.version, ProtocolVersion::V2_0);
    assert!(!identity.stateless);
    assert!(provider.check_auth_requests().is_empty());
}

#[tokio::test]
async fn test_checkid_setup_round_trip() {
    let provider = MockProvider::new();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let request = consumer
        .checkid_setup(ALICE, RETURN_TO, Some("https://rp.example.com/"), None)
        .await
        .unwrap();
    assert!(request.redirect_url.starts_with(OP_ENDPOINT));
    assert_eq!(request.return_to, RETURN_TO);

    let sent = query_of(&request.redirect_url);
    assert_eq!(sent.get("mode"), Some("checkid_setup"));
    assert_eq!(sent.get("ns"), Some(turboid::types::OPENID2_NS));
    assert_eq!(sent.get("claimed_id"), Some(ALICE));
    assert_eq!(sent.get("identity"), Some(ALICE));
    assert_eq!(sent.get("realm"), Some("https://rp.example.com/"));
    assert_eq!(sent.get("return_to"), Some(RETURN_TO));
    let handle = sent.get("assoc_handle").unwrap();
    assert_eq!(request.assoc_handle.as_deref(), Some(handle));

    // the provider redirects back with a signed assertion in the query
    let assoc = provider.shared_association(handle).unwrap();
    let response = provider.assert_v2(ALICE, sent.get("return_to").unwrap(), &assoc);
    let outcome = consumer
        .verify_query(&response.to_form_urlencoded(), ALICE, None)
        .await
        .unwrap();
    assert_eq!(verified(outcome).identity, ALICE);
}

#[tokio::test]
async fn test_checkid_immediate_uses_immediate_mode() {
    let provider = MockProvider::new();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let request = consumer
        .checkid_immediate(ALICE, RETURN_TO, None, None)
        .await
        .unwrap();
    let sent = query_of(&request.redirect_url);
    assert_eq!(sent.get("mode"), Some("checkid_immediate"));
    assert!(sent.get("realm").is_none());
}

#[tokio::test]
async fn test_association_is_reused_across_requests() {
    let provider = MockProvider::new();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let first = consumer
        .checkid_setup(ALICE, RETURN_TO, None, None)
        .await
        .unwrap();
    let second = consumer
        .checkid_setup(ALICE, RETURN_TO, None, None)
        .await
        .unwrap();

    assert_eq!(first.assoc_handle, second.assoc_handle);
    assert_eq!(provider.associate_requests().len(), 1);
}

#[tokio::test]
async fn test_negotiation_follows_provider_preference() {
    // GIVEN: a provider that only speaks HMAC-SHA1 over DH-SHA1
    let provider = MockProvider::builder()
        .supported(vec![(AssociationType::HmacSha1, SessionType::DhSha1)])
        .build();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    // WHEN: the consumer asks for its default HMAC-SHA256
    let assoc = consumer.associate(ALICE).await.unwrap();

    // THEN: it retries once with the suggested types
    assert_eq!(assoc.assoc_type, AssociationType::HmacSha1);
    let requests = provider.associate_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].get("assoc_type"), Some("HMAC-SHA256"));
    assert_eq!(requests[1].get("assoc_type"), Some("HMAC-SHA1"));
    assert_eq!(requests[1].get("session_type"), Some("DH-SHA1"));

    let issued = provider.shared_association(&assoc.handle).unwrap();
    assert_eq!(assoc.secret.expose(), issued.secret.expose());
}

#[tokio::test]
async fn test_plaintext_session_over_https_when_allowed() {
    let provider = MockProvider::new();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let config = ConsumerConfig::builder().plaintext_over_https(true).build();
    let consumer = consumer(&provider, &store, config);

    let assoc = consumer.associate(ALICE).await.unwrap();
    let request = provider.associate_requests().remove(0);
    assert_eq!(request.get("session_type"), Some("no-encryption"));
    assert!(request.get("dh_consumer_public").is_none());

    let issued = provider.shared_association(&assoc.handle).unwrap();
    assert_eq!(assoc.secret.expose(), issued.secret.expose());
}

#[tokio::test]
async fn test_association_keeps_declared_lifetime() {
    let thirty_days = Duration::from_secs(30 * 24 * 3600);
    let provider = MockProvider::builder().expires_in(thirty_days.as_secs()).build();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let before = SystemTime::now();
    let assoc = consumer.associate(ALICE).await.unwrap();

    assert!(assoc.expires_at >= before + thirty_days);
    assert!(assoc.expires_at <= SystemTime::now() + thirty_days);
}

#[tokio::test]
async fn test_association_failure_is_returned_without_fallback() {
    let provider = MockProvider::builder().fail_associate().build();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let err = consumer
        .checkid_setup(ALICE, RETURN_TO, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OpenIdError::AssociationFailed { .. }), "{err}");
}

/// Without an association the request goes out stateless and the response is
/// confirmed with check_authentication.
#[tokio::test]
async fn test_stateless_fallback_flow() {
    let provider = MockProvider::builder().fail_associate().build();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let config = ConsumerConfig::builder().stateless_fallback(true).build();
    let consumer = consumer(&provider, &store, config);

    let request = consumer
        .checkid_setup(ALICE, RETURN_TO, None, None)
        .await
        .unwrap();
    assert_eq!(request.assoc_handle, None);
    assert!(query_of(&request.redirect_url).get("assoc_handle").is_none());

    let private = provider.private_association();
    let response = provider.assert_v2(ALICE, RETURN_TO, &private);
    let identity = verified(consumer.verify(&response, ALICE, None).await.unwrap());
    assert!(identity.stateless);

    let check = provider.check_auth_requests();
    assert_eq!(check.len(), 1);
    assert_eq!(check[0].get("mode"), Some("check_authentication"));
    assert_eq!(check[0].get("sig"), response.get("sig"));
}

/// Stateful miss: the handle is unknown locally, the provider vouches for it.
#[tokio::test]
async fn test_unknown_handle_verified_by_provider() {
    let provider = MockProvider::new();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let private = provider.private_association();
    let response = provider.assert_v2(ALICE, RETURN_TO, &private);
    let identity = verified(consumer.verify(&response, ALICE, None).await.unwrap());

    assert!(identity.stateless);
    assert_eq!(
        store.calls(),
        [StoreCall::Retrieve(private.handle.clone())]
    );
}

#[tokio::test]
async fn test_openid1_flow_with_delegation() {
    const LOCAL_ID: &str = "https://alice.op.example.com/";
    let provider = MockProvider::new();
    provider.register(
        ProviderEndpoint::new(OP_ENDPOINT, ALICE, ProtocolVersion::V1_1).with_local_id(LOCAL_ID),
    );
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let request = consumer
        .checkid_setup(ALICE, RETURN_TO, Some("https://rp.example.com/"), None)
        .await
        .unwrap();

    // 1.1: no namespace, HMAC-SHA1 only, trust_root instead of realm
    let associate = provider.associate_requests().remove(0);
    assert!(associate.get("ns").is_none());
    assert_eq!(associate.get("assoc_type"), Some("HMAC-SHA1"));
    assert_eq!(associate.get("session_type"), Some("DH-SHA1"));

    let sent = query_of(&request.redirect_url);
    assert!(sent.get("ns").is_none());
    assert!(sent.get("claimed_id").is_none());
    assert_eq!(sent.get("identity"), Some(LOCAL_ID));
    assert_eq!(sent.get("trust_root"), Some("https://rp.example.com/"));

    // the consumer nonce rides on return_to
    let return_to = Url::parse(&request.return_to).unwrap();
    assert!(
        return_to
            .query_pairs()
            .any(|(k, _)| k == consumer.config().nonce_param)
    );
    assert_eq!(sent.get("return_to"), Some(request.return_to.as_str()));

    let assoc = provider
        .shared_association(request.assoc_handle.as_deref().unwrap())
        .unwrap();
    let response = provider.assert_v1(LOCAL_ID, &request.return_to, &assoc);
    let identity = verified(consumer.verify(&response, ALICE, None).await.unwrap());
    assert_eq!(identity.identity, ALICE);
    assert_eq!(identity.local_id, LOCAL_ID);
    assert_eq!(identity.version, ProtocolVersion::V1_1);

    // the consumer nonce is single-use too
    let err = consumer.verify(&response, ALICE, None).await.unwrap_err();
    assert!(matches!(err, OpenIdError::ReplayDetected { .. }), "{err}");
}

#[tokio::test]
async fn test_identifier_select() {
    let provider = MockProvider::new();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let assoc = consumer.associate(ALICE).await.unwrap();
    let issued = provider.shared_association(&assoc.handle).unwrap();
    let response = provider.assert_v2(ALICE, RETURN_TO, &issued);

    let identity = verified(
        consumer
            .verify(&response, IDENTIFIER_SELECT, None)
            .await
            .unwrap(),
    );
    assert_eq!(identity.identity, ALICE);
}

#[tokio::test]
async fn test_setup_needed_responses() {
    let provider = MockProvider::new();
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let v2 = ParameterSet::new()
        .with("ns", turboid::types::OPENID2_NS)
        .with("mode", "setup_needed");
    assert_eq!(
        consumer.verify(&v2, ALICE, None).await.unwrap(),
        VerificationOutcome::SetupNeeded {
            user_setup_url: None
        }
    );

    let v1 = ParameterSet::new()
        .with("mode", "id_res")
        .with("user_setup_url", "https://op.example.com/setup?x=1");
    assert_eq!(
        consumer.verify(&v1, ALICE, None).await.unwrap(),
        VerificationOutcome::SetupNeeded {
            user_setup_url: Some("https://op.example.com/setup?x=1".to_string())
        }
    );
    assert!(store.calls().is_empty());
}

/// Simple registration extension used to exercise both hooks.
#[derive(Debug, Default)]
struct SimpleRegistration {
    nickname: Option<String>,
}

impl Extension for SimpleRegistration {
    fn on_request(&mut self, params: &mut ParameterSet) -> Result<(), ExtensionError> {
        params.set("ns.sreg", "http://openid.net/extensions/sreg/1.1");
        params.set("sreg.required", "nickname");
        Ok(())
    }

    fn on_response(&mut self, params: &ParameterSet) -> Result<(), ExtensionError> {
        self.nickname = params.get("sreg.nickname").map(str::to_string);
        Ok(())
    }
}

#[tokio::test]
async fn test_extension_hooks_run_on_request_and_response() {
    let provider = MockProvider::new();
    provider.register_v2(ALICE);
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());

    let mut sreg = SimpleRegistration::default();
    let request = consumer
        .checkid_setup(ALICE, RETURN_TO, None, Some(&mut sreg))
        .await
        .unwrap();
    let sent = query_of(&request.redirect_url);
    assert_eq!(sent.get("sreg.required"), Some("nickname"));

    let assoc = provider
        .shared_association(request.assoc_handle.as_deref().unwrap())
        .unwrap();
    let mut response = provider.assert_v2(ALICE, RETURN_TO, &assoc);
    response.set("sreg.nickname", "alice");

    verified(
        consumer
            .verify(&response, ALICE, Some(&mut sreg))
            .await
            .unwrap(),
    );
    assert_eq!(sreg.nickname.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_cleanup_nonces_on_fresh_consumer() {
    let provider = MockProvider::new();
    let store = RecordingStore::new();
    let consumer = consumer(&provider, &store, ConsumerConfig::default());
    assert_eq!(consumer.cleanup_nonces().await.unwrap(), 0);
}
