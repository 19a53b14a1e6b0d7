//! # TurboID HTTP
//!
//! Network collaborators for the [`turboid`] relying-party engine:
//!
//! - [`HttpTransport`] - direct communication (`associate`,
//!   `check_authentication`) over reqwest, decoding key-value form replies
//! - [`HtmlDiscovery`] - identifier normalization, redirect canonicalization
//!   and HTML `<link rel>` discovery for OpenID 1.1 and 2.0
//! - [`ssrf`] - outbound request policy applied by both
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use turboid::Consumer;
//! use turboid_http::{HtmlDiscovery, HttpTransport};
//!
//! # fn main() -> Result<(), reqwest::Error> {
//! let consumer = Consumer::builder(
//!     Arc::new(HttpTransport::new()?),
//!     Arc::new(HtmlDiscovery::new()?),
//! )
//! .build();
//! # let _ = consumer;
//! # Ok(())
//! # }
//! ```
//!
//! Both collaborators refuse private, loopback and link-local targets by
//! default; see [`SsrfPolicy`].

pub mod client;
pub mod discovery;
pub mod ssrf;

pub use client::{HttpTransport, HttpTransportConfig};
pub use discovery::{HtmlDiscovery, HtmlLinks, normalize};
pub use ssrf::{SsrfError, SsrfPolicy, SsrfPolicyBuilder, SsrfValidator};
