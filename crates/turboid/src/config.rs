//! Consumer configuration
//!
//! [`ConsumerConfig`] deserializes with per-field defaults, so a partial
//! configuration file only needs to name what it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AssociationType, SessionType};

/// Relying-party behavior settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Preferred association type (default: HMAC-SHA256)
    #[serde(default = "default_assoc_type")]
    pub assoc_type: AssociationType,
    /// Preferred Diffie-Hellman session type (default: DH-SHA256)
    #[serde(default = "default_session_type")]
    pub session_type: SessionType,
    /// Send the MAC key in the clear when the provider endpoint is HTTPS
    #[serde(default)]
    pub plaintext_over_https: bool,
    /// Upper bound for every associate, check_authentication and discovery call
    #[serde(default = "default_network_timeout")]
    pub network_timeout: Duration,
    /// Oldest acceptable nonce timestamp (default: 5 minutes)
    #[serde(default = "default_max_nonce_age")]
    pub max_nonce_age: Duration,
    /// How far in the future a nonce timestamp may lie (default: 60s)
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew: Duration,
    /// Continue without an association when negotiation fails and rely on
    /// check_authentication (stateless mode)
    #[serde(default)]
    pub stateless_fallback: bool,
    /// Query parameter carrying the consumer nonce on OpenID 1.1 return_to URLs
    #[serde(default = "default_nonce_param")]
    pub nonce_param: String,
}

fn default_assoc_type() -> AssociationType {
    AssociationType::HmacSha256
}

fn default_session_type() -> SessionType {
    SessionType::DhSha256
}

fn default_network_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_nonce_age() -> Duration {
    Duration::from_secs(300)
}

fn default_max_clock_skew() -> Duration {
    Duration::from_secs(60)
}

fn default_nonce_param() -> String {
    "turboid_nonce".to_string()
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            assoc_type: default_assoc_type(),
            session_type: default_session_type(),
            plaintext_over_https: false,
            network_timeout: default_network_timeout(),
            max_nonce_age: default_max_nonce_age(),
            max_clock_skew: default_max_clock_skew(),
            stateless_fallback: false,
            nonce_param: default_nonce_param(),
        }
    }
}

impl ConsumerConfig {
    /// Start building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }

    /// Session type to request for `assoc_type` at an endpoint.
    ///
    /// Plaintext is only chosen for HTTPS endpoints and only when enabled; a
    /// preferred DH session whose digest does not fit `assoc_type` is replaced
    /// by the matching one.
    #[must_use]
    pub fn session_for(&self, assoc_type: AssociationType, https: bool) -> SessionType {
        if https && self.plaintext_over_https {
            SessionType::NoEncryption
        } else if self.session_type.is_diffie_hellman() && self.session_type.supports(assoc_type) {
            self.session_type
        } else {
            assoc_type.matching_dh_session()
        }
    }

    /// Total nonce retention a [`NonceStore`](crate::nonce::NonceStore) needs
    /// for replay checks to stay sound.
    #[must_use]
    pub fn nonce_retention(&self) -> Duration {
        self.max_nonce_age + self.max_clock_skew
    }
}

/// Builder for [`ConsumerConfig`]
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    assoc_type: Option<AssociationType>,
    session_type: Option<SessionType>,
    plaintext_over_https: Option<bool>,
    network_timeout: Option<Duration>,
    max_nonce_age: Option<Duration>,
    max_clock_skew: Option<Duration>,
    stateless_fallback: Option<bool>,
    nonce_param: Option<String>,
}

impl ConsumerConfigBuilder {
    /// Set the preferred association type
    pub fn assoc_type(mut self, assoc_type: AssociationType) -> Self {
        self.assoc_type = Some(assoc_type);
        self
    }

    /// Set the preferred Diffie-Hellman session type
    pub fn session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = Some(session_type);
        self
    }

    /// Allow plaintext sessions with HTTPS endpoints
    pub fn plaintext_over_https(mut self, allow: bool) -> Self {
        self.plaintext_over_https = Some(allow);
        self
    }

    /// Set the network timeout
    pub fn network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    /// Set the maximum nonce age
    pub fn max_nonce_age(mut self, age: Duration) -> Self {
        self.max_nonce_age = Some(age);
        self
    }

    /// Set the tolerated clock skew
    pub fn max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = Some(skew);
        self
    }

    /// Enable or disable stateless fallback
    pub fn stateless_fallback(mut self, enabled: bool) -> Self {
        self.stateless_fallback = Some(enabled);
        self
    }

    /// Set the OpenID 1.1 return_to nonce parameter name
    pub fn nonce_param(mut self, name: impl Into<String>) -> Self {
        self.nonce_param = Some(name.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> ConsumerConfig {
        let default = ConsumerConfig::default();
        ConsumerConfig {
            assoc_type: self.assoc_type.unwrap_or(default.assoc_type),
            session_type: self.session_type.unwrap_or(default.session_type),
            plaintext_over_https: self
                .plaintext_over_https
                .unwrap_or(default.plaintext_over_https),
            network_timeout: self.network_timeout.unwrap_or(default.network_timeout),
            max_nonce_age: self.max_nonce_age.unwrap_or(default.max_nonce_age),
            max_clock_skew: self.max_clock_skew.unwrap_or(default.max_clock_skew),
            stateless_fallback: self
                .stateless_fallback
                .unwrap_or(default.stateless_fallback),
            nonce_param: self.nonce_param.unwrap_or(default.nonce_param),
        }
    }
}
