//! Conformance checks for [`AssociationStore`] implementations.
//!
//! Any store backing a [`Consumer`](crate::Consumer) (file, database, cache)
//! should pass the same suite as [`MemoryAssociationStore`](crate::MemoryAssociationStore):
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn my_store_conforms() {
//!     let store = MyDatabaseStore::connect(...).await;
//!     turboid::testing::assert_store_conformance(&store).await;
//! }
//! ```

use std::time::{Duration, SystemTime};

use crate::association::AssociationSecret;
use crate::store::AssociationStore;
use crate::types::AssociationType;

const PROVIDER: &str = "https://conformance.example.com/openid";

/// Run the association store property suite, panicking on the first violation.
///
/// The suite writes records under a dedicated provider URL and cleans up after
/// itself.
pub async fn assert_store_conformance<S: AssociationStore + ?Sized>(store: &S) {
    // store/retrieve round-trip, expiry carried exactly
    let before = SystemTime::now();
    let stored = store
        .store(
            PROVIDER,
            "conformance-1",
            AssociationSecret::new(vec![1, 2, 3, 4, 5]),
            AssociationType::HmacSha1,
            Duration::from_secs(3600),
        )
        .await
        .expect("store must accept a fresh association");
    let after = SystemTime::now();
    assert!(
        stored.expires_at >= before + Duration::from_secs(3600)
            && stored.expires_at <= after + Duration::from_secs(3600),
        "expires_at must equal store time + expires_in"
    );

    let retrieved = store
        .retrieve(PROVIDER, "conformance-1")
        .await
        .expect("stored association must be retrievable");
    assert_eq!(retrieved.handle, "conformance-1");
    assert_eq!(retrieved.provider, PROVIDER);
    assert_eq!(retrieved.secret.expose(), &[1, 2, 3, 4, 5]);
    assert_eq!(retrieved.assoc_type, AssociationType::HmacSha1);
    assert_eq!(retrieved.expires_at, stored.expires_at);

    // unknown handle and unknown provider miss with NotFound
    assert!(
        store
            .retrieve(PROVIDER, "conformance-missing")
            .await
            .expect_err("unknown handle must miss")
            .is_not_found()
    );
    assert!(
        store
            .retrieve("https://elsewhere.example.com/", "conformance-1")
            .await
            .expect_err("handle is scoped to its provider")
            .is_not_found()
    );

    // find_any either misses or returns a valid association for this provider
    match store.find_any(PROVIDER).await {
        Ok(found) => {
            assert_eq!(found.provider, PROVIDER);
            assert!(!found.is_expired(), "find_any returned an expired association");
        }
        Err(err) => assert!(err.is_not_found(), "find_any must fail with NotFound, got {err}"),
    }

    // invalidate is idempotent and final
    store
        .invalidate(PROVIDER, "conformance-1")
        .await
        .expect("invalidate must succeed");
    store
        .invalidate(PROVIDER, "conformance-1")
        .await
        .expect("second invalidate must succeed");
    assert!(
        store
            .retrieve(PROVIDER, "conformance-1")
            .await
            .expect_err("invalidated association must miss")
            .is_not_found()
    );

    // expired associations are never returned
    store
        .store(
            PROVIDER,
            "conformance-expired",
            AssociationSecret::new(vec![9; 20]),
            AssociationType::HmacSha256,
            Duration::ZERO,
        )
        .await
        .expect("store must accept an association");
    assert!(
        store
            .retrieve(PROVIDER, "conformance-expired")
            .await
            .expect_err("expired association must miss")
            .is_not_found()
    );
    if let Ok(found) = store.find_any(PROVIDER).await {
        assert_ne!(found.handle, "conformance-expired");
        assert_ne!(found.handle, "conformance-1");
    }
    store
        .invalidate(PROVIDER, "conformance-expired")
        .await
        .expect("invalidate must succeed");
}
