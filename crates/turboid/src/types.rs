//! Core protocol types
//!
//! Modes, protocol versions, association/session types and the discovered
//! provider endpoint shared by the request builder and the response verifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Namespace URI carried in `openid.ns` by OpenID 2.0 messages.
pub const OPENID2_NS: &str = "http://specs.openid.net/auth/2.0";

/// Namespace URI some OpenID 1.1 providers send in `openid.ns`.
pub const OPENID1_NS: &str = "http://openid.net/signon/1.1";

/// Claimed-identifier placeholder used for directed identity (OpenID 2.0).
pub const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";

/// Protocol message modes (`openid.mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Association request
    Associate,
    /// Non-interactive authentication request
    CheckidImmediate,
    /// Interactive authentication request
    CheckidSetup,
    /// Positive assertion
    IdRes,
    /// Negative assertion
    Cancel,
    /// Immediate request needs user interaction (OpenID 2.0)
    SetupNeeded,
    /// Provider-side error
    Error,
    /// Stateless verification request
    CheckAuthentication,
}

impl Mode {
    /// Wire value of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Associate => "associate",
            Self::CheckidImmediate => "checkid_immediate",
            Self::CheckidSetup => "checkid_setup",
            Self::IdRes => "id_res",
            Self::Cancel => "cancel",
            Self::SetupNeeded => "setup_needed",
            Self::Error => "error",
            Self::CheckAuthentication => "check_authentication",
        }
    }

    /// Whether this mode starts an authentication redirect.
    #[must_use]
    pub fn is_checkid(self) -> bool {
        matches!(self, Self::CheckidImmediate | Self::CheckidSetup)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "associate" => Self::Associate,
            "checkid_immediate" => Self::CheckidImmediate,
            "checkid_setup" => Self::CheckidSetup,
            "id_res" => Self::IdRes,
            "cancel" => Self::Cancel,
            "setup_needed" => Self::SetupNeeded,
            "error" => Self::Error,
            "check_authentication" => Self::CheckAuthentication,
            other => return Err(format!("unknown mode: {other}")),
        })
    }
}

/// OpenID protocol revision spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProtocolVersion {
    /// OpenID Authentication 1.1
    V1_1,
    /// OpenID Authentication 2.0
    #[default]
    V2_0,
}

impl ProtocolVersion {
    /// Whether messages for this version carry `openid.ns`.
    #[must_use]
    pub fn is_v2(self) -> bool {
        matches!(self, Self::V2_0)
    }
}

/// MAC algorithm of an association (`openid.assoc_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationType {
    /// HMAC-SHA1, the only type OpenID 1.1 knows
    #[serde(rename = "HMAC-SHA1")]
    HmacSha1,
    /// HMAC-SHA256 (OpenID 2.0)
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
}

impl AssociationType {
    /// Wire value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha1 => "HMAC-SHA1",
            Self::HmacSha256 => "HMAC-SHA256",
        }
    }

    /// Length of the MAC key in bytes.
    #[must_use]
    pub fn secret_len(self) -> usize {
        match self {
            Self::HmacSha1 => 20,
            Self::HmacSha256 => 32,
        }
    }

    /// The DH session type whose digest size matches this MAC key.
    #[must_use]
    pub fn matching_dh_session(self) -> SessionType {
        match self {
            Self::HmacSha1 => SessionType::DhSha1,
            Self::HmacSha256 => SessionType::DhSha256,
        }
    }
}

impl fmt::Display for AssociationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssociationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HMAC-SHA1" => Ok(Self::HmacSha1),
            "HMAC-SHA256" => Ok(Self::HmacSha256),
            other => Err(format!("unknown association type: {other}")),
        }
    }
}

/// How the MAC key travels during association (`openid.session_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    /// MAC key sent in the clear; only acceptable over TLS
    #[serde(rename = "no-encryption")]
    NoEncryption,
    /// Diffie-Hellman, key masked with SHA-1
    #[serde(rename = "DH-SHA1")]
    DhSha1,
    /// Diffie-Hellman, key masked with SHA-256
    #[serde(rename = "DH-SHA256")]
    DhSha256,
}

impl SessionType {
    /// Wire value. OpenID 1.1 providers expect an empty `session_type` for
    /// plaintext sessions; [`SessionType::wire_value`] handles that.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoEncryption => "no-encryption",
            Self::DhSha1 => "DH-SHA1",
            Self::DhSha256 => "DH-SHA256",
        }
    }

    /// Value to send for the given protocol version.
    #[must_use]
    pub fn wire_value(self, version: ProtocolVersion) -> &'static str {
        match (self, version) {
            (Self::NoEncryption, ProtocolVersion::V1_1) => "",
            _ => self.as_str(),
        }
    }

    /// Whether the session uses a Diffie-Hellman exchange.
    #[must_use]
    pub fn is_diffie_hellman(self) -> bool {
        !matches!(self, Self::NoEncryption)
    }

    /// Whether this session can carry a key for the given association type.
    #[must_use]
    pub fn supports(self, assoc_type: AssociationType) -> bool {
        match self {
            Self::NoEncryption => true,
            Self::DhSha1 => assoc_type == AssociationType::HmacSha1,
            Self::DhSha256 => assoc_type == AssociationType::HmacSha256,
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // OpenID 1.1 signals plaintext with an empty or absent session_type
            "" | "no-encryption" => Ok(Self::NoEncryption),
            "DH-SHA1" => Ok(Self::DhSha1),
            "DH-SHA256" => Ok(Self::DhSha256),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

/// The provider behind an identifier, as resolved by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Provider endpoint URL (`openid.server` / `openid2.provider`)
    pub server_url: String,
    /// Claimed identifier after normalization and canonicalization
    pub claimed_id: String,
    /// Provider-local identifier (`openid.delegate` / `openid2.local_id`)
    pub local_id: Option<String>,
    /// Protocol revision the endpoint speaks
    pub version: ProtocolVersion,
}

impl ProviderEndpoint {
    /// Create an endpoint without delegation.
    pub fn new(
        server_url: impl Into<String>,
        claimed_id: impl Into<String>,
        version: ProtocolVersion,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            claimed_id: claimed_id.into(),
            local_id: None,
            version,
        }
    }

    /// Set the provider-local identifier.
    #[must_use]
    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    /// Identifier to send as `openid.identity`.
    #[must_use]
    pub fn local_identifier(&self) -> &str {
        self.local_id.as_deref().unwrap_or(&self.claimed_id)
    }

    /// Whether the endpoint is reached over TLS.
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.server_url
            .get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
    }
}
