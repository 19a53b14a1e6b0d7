//! # SSRF (Server-Side Request Forgery) Protection
//!
//! Identifier URLs and provider endpoints come from users and from pages the
//! user controls, so every outbound request is checked before it is sent.
//!
//! ## Attack Vectors Prevented
//!
//! - **Private Network Access**: RFC 1918 ranges and IPv6 unique local addresses
//! - **Localhost Access**: 127.0.0.0/8, ::1
//! - **Link-Local**: 169.254.0.0/16 and fe80::/10
//! - **Cloud Metadata**: 169.254.169.254
//! - **Redirect Pivoting**: discovery re-validates every redirect hop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use turboid_http::ssrf::{SsrfPolicy, SsrfValidator};
//!
//! let validator = SsrfValidator::new(
//!     SsrfPolicy::builder()
//!         .require_https(true)
//!         .hostname_allowlist(vec!["op.example.com".into()])
//!         .build(),
//! );
//! validator.validate_url("https://op.example.com/server").await?;
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tracing::{debug, warn};
use turboid::TransportError;
use url::{Host, Url};

const CLOUD_METADATA: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// SSRF protection errors
#[derive(Debug, Clone, Error)]
pub enum SsrfError {
    /// URL validation failed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL scheme not allowed
    #[error("URL scheme not allowed: {0}")]
    InvalidScheme(String),

    /// IP address is blocked by policy
    #[error("IP address blocked: {0} ({1})")]
    BlockedIpAddress(IpAddr, String),

    /// Hostname resolution failed
    #[error("Failed to resolve hostname: {0}")]
    ResolutionFailed(String),

    /// Cloud metadata endpoint access attempt
    #[error("Access to cloud metadata endpoint blocked: {0}")]
    CloudMetadataBlocked(IpAddr),
}

impl From<SsrfError> for TransportError {
    fn from(err: SsrfError) -> Self {
        TransportError::Blocked(err.to_string())
    }
}

/// SSRF protection policy configuration
#[derive(Debug, Clone)]
pub struct SsrfPolicy {
    /// Allow access to private network ranges (RFC 1918)
    pub allow_private_networks: bool,

    /// Allow access to localhost (127.0.0.0/8, ::1)
    pub allow_localhost: bool,

    /// Allow access to link-local addresses (169.254.0.0/16, fe80::/10)
    pub allow_link_local: bool,

    /// Allow access to cloud metadata endpoints (169.254.169.254)
    pub allow_cloud_metadata: bool,

    /// Only allow `https` URLs. Off by default: OpenID 1.1 identifiers are
    /// commonly plain `http`, and association keys travel under
    /// Diffie-Hellman there.
    pub require_https: bool,

    /// Custom IP address allowlist (if Some, only these IPs are allowed)
    pub ip_allowlist: Option<Vec<IpAddr>>,

    /// Custom IP address denylist (these IPs are always blocked)
    pub ip_denylist: Vec<IpAddr>,

    /// Custom hostname allowlist (if Some, only these hostnames are allowed)
    pub hostname_allowlist: Option<Vec<String>>,
}

impl Default for SsrfPolicy {
    fn default() -> Self {
        Self {
            allow_private_networks: false,
            allow_localhost: false,
            allow_link_local: false,
            allow_cloud_metadata: false,
            require_https: false,
            ip_allowlist: None,
            ip_denylist: Vec::new(),
            hostname_allowlist: None,
        }
    }
}

impl SsrfPolicy {
    /// Create a builder for constructing policies
    pub fn builder() -> SsrfPolicyBuilder {
        SsrfPolicyBuilder::default()
    }

    /// Policy for talking to a provider on the local machine, e.g. in
    /// integration tests. Cloud metadata stays blocked.
    pub fn local_only() -> Self {
        Self {
            allow_localhost: true,
            ip_allowlist: Some(vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ]),
            ..Self::default()
        }
    }
}

/// Builder for SSRF policies
#[derive(Debug, Default)]
pub struct SsrfPolicyBuilder {
    allow_private_networks: Option<bool>,
    allow_localhost: Option<bool>,
    allow_link_local: Option<bool>,
    allow_cloud_metadata: Option<bool>,
    require_https: Option<bool>,
    ip_allowlist: Option<Option<Vec<IpAddr>>>,
    ip_denylist: Option<Vec<IpAddr>>,
    hostname_allowlist: Option<Option<Vec<String>>>,
}

impl SsrfPolicyBuilder {
    /// Allow or deny access to private networks
    pub fn allow_private_networks(mut self, allow: bool) -> Self {
        self.allow_private_networks = Some(allow);
        self
    }

    /// Allow or deny access to localhost
    pub fn allow_localhost(mut self, allow: bool) -> Self {
        self.allow_localhost = Some(allow);
        self
    }

    /// Allow or deny access to link-local addresses
    pub fn allow_link_local(mut self, allow: bool) -> Self {
        self.allow_link_local = Some(allow);
        self
    }

    /// Allow or deny access to cloud metadata endpoints
    pub fn allow_cloud_metadata(mut self, allow: bool) -> Self {
        self.allow_cloud_metadata = Some(allow);
        self
    }

    /// Require HTTPS scheme
    pub fn require_https(mut self, require: bool) -> Self {
        self.require_https = Some(require);
        self
    }

    /// Set custom IP allowlist
    pub fn ip_allowlist(mut self, ips: Vec<IpAddr>) -> Self {
        self.ip_allowlist = Some(Some(ips));
        self
    }

    /// Set custom IP denylist
    pub fn ip_denylist(mut self, ips: Vec<IpAddr>) -> Self {
        self.ip_denylist = Some(ips);
        self
    }

    /// Set custom hostname allowlist
    pub fn hostname_allowlist(mut self, hostnames: Vec<String>) -> Self {
        self.hostname_allowlist = Some(Some(hostnames));
        self
    }

    /// Build the policy
    pub fn build(self) -> SsrfPolicy {
        let default = SsrfPolicy::default();
        SsrfPolicy {
            allow_private_networks: self
                .allow_private_networks
                .unwrap_or(default.allow_private_networks),
            allow_localhost: self.allow_localhost.unwrap_or(default.allow_localhost),
            allow_link_local: self.allow_link_local.unwrap_or(default.allow_link_local),
            allow_cloud_metadata: self
                .allow_cloud_metadata
                .unwrap_or(default.allow_cloud_metadata),
            require_https: self.require_https.unwrap_or(default.require_https),
            ip_allowlist: self.ip_allowlist.unwrap_or(default.ip_allowlist),
            ip_denylist: self.ip_denylist.unwrap_or(default.ip_denylist),
            hostname_allowlist: self
                .hostname_allowlist
                .unwrap_or(default.hostname_allowlist),
        }
    }
}

/// SSRF validator
#[derive(Debug, Clone, Default)]
pub struct SsrfValidator {
    policy: SsrfPolicy,
}

impl SsrfValidator {
    /// Create a new SSRF validator with the given policy
    pub fn new(policy: SsrfPolicy) -> Self {
        Self { policy }
    }

    /// Validate a URL before fetching. Hostnames are resolved and every
    /// resolved address is checked; IP literals are checked directly.
    ///
    /// # Errors
    ///
    /// Returns [`SsrfError`] if the URL fails validation
    pub async fn validate_url(&self, url_str: &str) -> Result<Url, SsrfError> {
        let url = Url::parse(url_str)
            .map_err(|e| SsrfError::InvalidUrl(format!("Failed to parse URL: {e}")))?;
        self.check_url(&url).await?;
        Ok(url)
    }

    /// [`SsrfValidator::validate_url`] for an already parsed URL
    ///
    /// # Errors
    ///
    /// Returns [`SsrfError`] if the URL fails validation
    pub async fn check_url(&self, url: &Url) -> Result<(), SsrfError> {
        self.resolve_url(url).await.map(|_| ())
    }

    /// Validate `url` and return the socket addresses that passed the
    /// policy. Connections must go to these addresses only; resolving the
    /// host again would let a rebinding DNS server swap in a blocked one.
    ///
    /// # Errors
    ///
    /// Returns [`SsrfError`] if the URL fails validation
    pub async fn resolve_url(&self, url: &Url) -> Result<Vec<SocketAddr>, SsrfError> {
        match url.scheme() {
            "https" => {}
            "http" if !self.policy.require_https => {}
            other => return Err(SsrfError::InvalidScheme(other.to_string())),
        }

        let host = url
            .host()
            .ok_or_else(|| SsrfError::InvalidUrl("URL has no host".to_string()))?;

        if let Some(ref allowlist) = self.policy.hostname_allowlist
            && let Some(name) = url.host_str()
            && !allowlist.iter().any(|allowed| allowed.eq_ignore_ascii_case(name))
        {
            debug!(host = name, "Hostname not in allowlist");
            return Err(SsrfError::InvalidUrl(format!(
                "Hostname not in allowlist: {name}"
            )));
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let ip = match host {
            Host::Ipv4(ip) => IpAddr::V4(ip),
            Host::Ipv6(ip) => IpAddr::V6(ip),
            Host::Domain(name) => return self.resolve_hostname(name, port).await,
        };
        self.validate_ip_address(&ip)?;
        Ok(vec![SocketAddr::new(ip, port)])
    }

    /// Resolve a hostname and check every address it maps to.
    async fn resolve_hostname(&self, hostname: &str, port: u16) -> Result<Vec<SocketAddr>, SsrfError> {
        let addrs: Vec<_> = tokio::net::lookup_host((hostname, port))
            .await
            .map_err(|e| SsrfError::ResolutionFailed(format!("{hostname}: {e}")))?
            .collect();

        if addrs.is_empty() {
            return Err(SsrfError::ResolutionFailed(format!(
                "No IP addresses resolved for: {hostname}"
            )));
        }

        for socket_addr in &addrs {
            self.validate_ip_address(&socket_addr.ip())?;
        }
        Ok(addrs)
    }

    /// Validate an IP address against the policy
    ///
    /// # Errors
    ///
    /// Returns [`SsrfError`] if the IP is blocked by policy
    pub fn validate_ip_address(&self, ip: &IpAddr) -> Result<(), SsrfError> {
        // metadata is checked before the allowlist so no policy can reach it by accident
        if !self.policy.allow_cloud_metadata && *ip == IpAddr::V4(CLOUD_METADATA) {
            warn!(%ip, "Cloud metadata endpoint access attempt");
            return Err(SsrfError::CloudMetadataBlocked(*ip));
        }

        if let Some(ref allowlist) = self.policy.ip_allowlist {
            if !allowlist.contains(ip) {
                debug!(%ip, "IP not in allowlist");
                return Err(SsrfError::BlockedIpAddress(
                    *ip,
                    "IP not in allowlist".to_string(),
                ));
            }
            return Ok(());
        }

        if self.policy.ip_denylist.contains(ip) {
            warn!(%ip, "IP in denylist");
            return Err(SsrfError::BlockedIpAddress(
                *ip,
                "IP in denylist".to_string(),
            ));
        }

        match ip {
            IpAddr::V4(ipv4) => self.validate_ipv4(ipv4),
            IpAddr::V6(ipv6) => self.validate_ipv6(ipv6),
        }
    }

    fn validate_ipv4(&self, ip: &Ipv4Addr) -> Result<(), SsrfError> {
        let blocked = |reason: &str| Err(SsrfError::BlockedIpAddress(IpAddr::V4(*ip), reason.to_string()));

        if !self.policy.allow_private_networks && ip.is_private() {
            debug!(%ip, "Private network access blocked");
            return blocked("Private network (RFC 1918)");
        }
        if !self.policy.allow_localhost && ip.is_loopback() {
            debug!(%ip, "Localhost access blocked");
            return blocked("Localhost");
        }
        if !self.policy.allow_link_local && ip.is_link_local() {
            debug!(%ip, "Link-local access blocked");
            return blocked("Link-local");
        }
        if ip.is_unspecified() {
            return blocked("Unspecified address (0.0.0.0)");
        }
        if ip.is_broadcast() {
            return blocked("Broadcast address");
        }
        if ip.is_documentation() {
            return blocked("Documentation address range");
        }
        Ok(())
    }

    fn validate_ipv6(&self, ip: &Ipv6Addr) -> Result<(), SsrfError> {
        // ::ffff:a.b.c.d reaches the IPv4 host
        if let Some(mapped) = ip.to_ipv4_mapped() {
            return self.validate_ipv4(&mapped);
        }

        let blocked = |reason: &str| Err(SsrfError::BlockedIpAddress(IpAddr::V6(*ip), reason.to_string()));

        if !self.policy.allow_localhost && ip.is_loopback() {
            debug!(%ip, "Localhost access blocked");
            return blocked("Localhost (::1)");
        }
        if ip.is_unspecified() {
            return blocked("Unspecified address (::)");
        }
        // unique local addresses (fc00::/7)
        if !self.policy.allow_private_networks && ip.segments()[0] & 0xfe00 == 0xfc00 {
            debug!(%ip, "Private network access blocked");
            return blocked("Unique local address (fc00::/7)");
        }
        if !self.policy.allow_link_local && ip.segments()[0] & 0xffc0 == 0xfe80 {
            debug!(%ip, "Link-local access blocked");
            return blocked("Link-local (fe80::/10)");
        }
        Ok(())
    }

    /// Get the policy
    pub fn policy(&self) -> &SsrfPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_blocks_private_networks() {
        let validator = SsrfValidator::default();

        for ip in [
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
        ] {
            assert!(validator.validate_ip_address(&IpAddr::V4(ip)).is_err());
        }
    }

    #[test]
    fn test_default_policy_blocks_localhost() {
        let validator = SsrfValidator::default();

        assert!(
            validator
                .validate_ip_address(&IpAddr::V4(Ipv4Addr::LOCALHOST))
                .is_err()
        );
        assert!(
            validator
                .validate_ip_address(&IpAddr::V6(Ipv6Addr::LOCALHOST))
                .is_err()
        );
    }

    #[test]
    fn test_cloud_metadata_blocked_even_when_allowlisted() {
        let policy = SsrfPolicy::builder()
            .ip_allowlist(vec![IpAddr::V4(CLOUD_METADATA)])
            .build();
        let validator = SsrfValidator::new(policy);

        assert!(matches!(
            validator.validate_ip_address(&IpAddr::V4(CLOUD_METADATA)),
            Err(SsrfError::CloudMetadataBlocked(_))
        ));
    }

    #[test]
    fn test_default_policy_allows_public_ip() {
        let validator = SsrfValidator::default();

        assert!(
            validator
                .validate_ip_address(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
                .is_ok()
        );
        assert!(
            validator
                .validate_ip_address(&IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)))
                .is_ok()
        );
    }

    #[test]
    fn test_ipv4_mapped_ipv6_checked_as_ipv4() {
        let validator = SsrfValidator::default();
        let mapped = Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped();
        assert!(validator.validate_ip_address(&IpAddr::V6(mapped)).is_err());
    }

    #[test]
    fn test_ipv6_unique_local_and_link_local_blocked() {
        let validator = SsrfValidator::default();

        let ula = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);
        assert!(validator.validate_ip_address(&IpAddr::V6(ula)).is_err());

        let link_local = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
        assert!(validator.validate_ip_address(&IpAddr::V6(link_local)).is_err());
    }

    #[test]
    fn test_denylist() {
        let policy = SsrfPolicy::builder()
            .ip_denylist(vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))])
            .build();
        let validator = SsrfValidator::new(policy);
        assert!(
            validator
                .validate_ip_address(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_scheme_checks() {
        let validator = SsrfValidator::default();
        assert!(validator.validate_url("http://8.8.8.8/").await.is_ok());
        assert!(matches!(
            validator.validate_url("ftp://8.8.8.8/").await,
            Err(SsrfError::InvalidScheme(_))
        ));

        let strict = SsrfValidator::new(SsrfPolicy::builder().require_https(true).build());
        assert!(matches!(
            strict.validate_url("http://8.8.8.8/").await,
            Err(SsrfError::InvalidScheme(_))
        ));
        assert!(strict.validate_url("https://8.8.8.8/").await.is_ok());
    }

    #[tokio::test]
    async fn test_ip_literal_urls_checked_without_resolution() {
        let validator = SsrfValidator::default();
        assert!(matches!(
            validator.validate_url("http://127.0.0.1:8080/server").await,
            Err(SsrfError::BlockedIpAddress(..))
        ));
        assert!(matches!(
            validator.validate_url("http://[::1]/").await,
            Err(SsrfError::BlockedIpAddress(..))
        ));
        assert!(matches!(
            validator.validate_url("http://169.254.169.254/latest/meta-data").await,
            Err(SsrfError::CloudMetadataBlocked(_))
        ));
    }

    #[tokio::test]
    async fn test_hostname_allowlist() {
        let validator = SsrfValidator::new(
            SsrfPolicy::builder()
                .hostname_allowlist(vec!["op.example.com".to_string()])
                .build(),
        );
        assert!(matches!(
            validator.validate_url("https://evil.example.com/").await,
            Err(SsrfError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_local_only_policy() {
        let validator = SsrfValidator::new(SsrfPolicy::local_only());
        assert!(validator.validate_url("http://127.0.0.1:8080/").await.is_ok());
        assert!(validator.validate_url("http://8.8.8.8/").await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_url_returns_checked_addresses() {
        let validator = SsrfValidator::new(SsrfPolicy::local_only());

        let url = Url::parse("http://127.0.0.1:8080/server").unwrap();
        assert_eq!(
            validator.resolve_url(&url).await.unwrap(),
            vec![SocketAddr::from(([127, 0, 0, 1], 8080))]
        );

        let url = Url::parse("http://localhost:9/").unwrap();
        let addrs = validator.resolve_url(&url).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.ip().is_loopback() && a.port() == 9));
    }

    #[tokio::test]
    async fn test_hostname_resolving_to_blocked_address() {
        let validator = SsrfValidator::default();
        let url = Url::parse("http://localhost/").unwrap();
        assert!(matches!(
            validator.resolve_url(&url).await,
            Err(SsrfError::BlockedIpAddress(..))
        ));
    }

    #[test]
    fn test_error_converts_to_transport_blocked() {
        let err: TransportError = SsrfError::InvalidScheme("ftp".into()).into();
        assert!(matches!(err, TransportError::Blocked(msg) if msg.contains("ftp")));
    }
}
