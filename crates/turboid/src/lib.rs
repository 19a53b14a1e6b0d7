//! # TurboID - OpenID Relying-Party Engine
//!
//! Association negotiation and response verification for the consumer side of
//! OpenID Authentication 1.1 and 2.0.
//!
//! ## Design Principles
//!
//! - **Fail closed**: every verification stage has its own error variant and
//!   nothing after a failed stage runs
//! - **Pluggable collaborators**: storage, transport and discovery are traits
//!   held as `Arc<dyn ...>`; the engine performs no I/O of its own
//! - **Secrets stay secret**: MAC keys and DH exponents are zeroized on drop and
//!   redacted from `Debug`
//!
//! ## Architecture
//!
//! - [`association`] - `Association` and its zeroizing secret
//! - [`store`] - `AssociationStore` contract and in-memory implementation
//! - [`dh`] - Diffie-Hellman sessions and `btwoc` encoding
//! - [`negotiator`] - the `associate` exchange with one preference retry
//! - [`request`] - `checkid_immediate` / `checkid_setup` redirects
//! - [`verify`] - the `id_res` verification pipeline
//! - [`check_auth`] - stateless verification round-trip
//! - [`nonce`] - nonce format, `NonceStore`, `ReplayGuard`
//! - [`signature`] - HMAC signing and constant-time verification
//! - [`extension`] - extension hooks
//! - [`transport`] - `Transport` and `Discovery` traits
//! - [`consumer`] - the `Consumer` façade
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use turboid::{Consumer, ConsumerConfig, VerificationOutcome};
//! use turboid_http::{HtmlDiscovery, HttpTransport};
//!
//! let transport = Arc::new(HttpTransport::new()?);
//! let discovery = Arc::new(HtmlDiscovery::new()?);
//! let consumer = Consumer::builder(transport, discovery)
//!     .config(ConsumerConfig::default())
//!     .build();
//!
//! let request = consumer
//!     .checkid_setup("alice.example.com", "https://rp.example.com/return", None, None)
//!     .await?;
//! // redirect the user agent to request.redirect_url, then on return:
//! match consumer.verify_query(query, &request.endpoint.claimed_id, None).await? {
//!     VerificationOutcome::Verified(who) => println!("signed in as {}", who.identity),
//!     VerificationOutcome::SetupNeeded { .. } => { /* retry with checkid_setup */ }
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `test-utils` - exports [`testing`], a conformance suite for
//!   `AssociationStore` implementations

pub mod association;
pub mod check_auth;
pub mod config;
pub mod consumer;
pub mod dh;
pub mod error;
pub mod extension;
pub mod message;
pub mod negotiator;
pub mod nonce;
pub mod request;
pub mod signature;
pub mod store;
pub mod transport;
pub mod types;
pub mod verify;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

#[doc(inline)]
pub use association::{Association, AssociationSecret};
#[doc(inline)]
pub use check_auth::CheckAuthResponse;
#[doc(inline)]
pub use config::{ConsumerConfig, ConsumerConfigBuilder};
#[doc(inline)]
pub use consumer::{Consumer, ConsumerBuilder};
#[doc(inline)]
pub use dh::{DhGroup, DhSession};
#[doc(inline)]
pub use error::{DiscoveryError, ExtensionError, OpenIdError, Result, TransportError};
#[doc(inline)]
pub use extension::{Extension, ExtensionChain};
#[doc(inline)]
pub use message::ParameterSet;
#[doc(inline)]
pub use negotiator::Negotiator;
#[doc(inline)]
pub use nonce::{MemoryNonceStore, NonceStore, ReplayGuard};
#[doc(inline)]
pub use request::{AuthRequest, RequestBuilder};
#[doc(inline)]
pub use store::{AssociationStore, MemoryAssociationStore};
#[doc(inline)]
pub use transport::{Discovery, Transport};
#[doc(inline)]
pub use types::{AssociationType, Mode, ProtocolVersion, ProviderEndpoint, SessionType};
#[doc(inline)]
pub use verify::{ResponseVerifier, VerificationOutcome, VerifiedIdentity};
