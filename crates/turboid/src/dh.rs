//! Diffie-Hellman key exchange for association sessions
//!
//! The consumer sends `g^x mod p`; the provider answers with `g^y mod p` and
//! the MAC key XORed with `H(btwoc(g^xy mod p))`, where `H` is SHA-1 or
//! SHA-256 depending on the session type.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use num_bigint_dig::BigUint;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroize;

use crate::association::AssociationSecret;
use crate::types::SessionType;

/// Default OpenID DH modulus (OpenID Authentication 2.0, Appendix B).
pub const DEFAULT_MODULUS_HEX: &[u8] = b"\
DCF93A0B883972EC0E19989AC5A2CE310E1D37717E8D9571BB7623731866E61E\
F75A2E27898B057F9891C2E27A639C3F29B60814581CD3B2CA3986D268370557\
7D45C2E7E52DC81C7A171876E5CEA74B1448BFDFAF18828EFD2519F14E45E382\
6634AF1949E5B535CC829A483B8A76223E5D490A257F05BDFF16F2FB22C583AB";

/// Default OpenID DH generator.
pub const DEFAULT_GENERATOR: u32 = 2;

/// Errors raised while running the exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DhError {
    /// The system random generator failed.
    #[error("random number generation failed")]
    Rng,
    /// The session type does not use Diffie-Hellman.
    #[error("session type {0} is not a Diffie-Hellman session")]
    NotDiffieHellman(SessionType),
    /// A modulus or generator is unusable.
    #[error("invalid group parameters: {0}")]
    InvalidGroup(String),
    /// The peer's public key is malformed or outside `(1, p-1)`.
    #[error("invalid peer public key: {0}")]
    InvalidPeerKey(String),
    /// The masked key has the wrong length for the session's digest.
    #[error("masked key is {actual} bytes, expected {expected}")]
    KeyLength {
        /// Digest length of the session type
        expected: usize,
        /// Length received
        actual: usize,
    },
}

/// Encode a non-negative integer as big-endian two's complement, the OpenID
/// `btwoc` encoding: a leading zero byte is added when the high bit is set.
#[must_use]
pub fn btwoc(value: &BigUint) -> Vec<u8> {
    let mut bytes = value.to_bytes_be();
    if bytes.is_empty() {
        bytes.push(0);
    } else if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    bytes
}

/// Decode a base64 `btwoc` integer.
///
/// # Errors
///
/// Returns [`DhError::InvalidPeerKey`] on bad base64 or an empty value.
pub fn parse_btwoc_base64(encoded: &str) -> Result<BigUint, DhError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| DhError::InvalidPeerKey(e.to_string()))?;
    if bytes.is_empty() {
        return Err(DhError::InvalidPeerKey("empty value".to_string()));
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

fn session_digest(session_type: SessionType) -> Result<&'static digest::Algorithm, DhError> {
    match session_type {
        SessionType::DhSha1 => Ok(&digest::SHA1_FOR_LEGACY_USE_ONLY),
        SessionType::DhSha256 => Ok(&digest::SHA256),
        SessionType::NoEncryption => Err(DhError::NotDiffieHellman(session_type)),
    }
}

/// The group a session runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    /// Prime modulus `p`
    pub modulus: BigUint,
    /// Generator `g`
    pub generator: BigUint,
}

impl DhGroup {
    /// Build a group from explicit parameters.
    ///
    /// # Errors
    ///
    /// Returns [`DhError::InvalidGroup`] if `p <= 3` or `g` is outside `(1, p-1)`.
    pub fn new(modulus: BigUint, generator: BigUint) -> Result<Self, DhError> {
        let one = BigUint::from(1u32);
        if modulus <= BigUint::from(3u32) {
            return Err(DhError::InvalidGroup("modulus too small".to_string()));
        }
        if generator <= one || generator >= &modulus - &one {
            return Err(DhError::InvalidGroup("generator out of range".to_string()));
        }
        Ok(Self { modulus, generator })
    }

    /// Whether this is the OpenID default group, which is never sent on the wire.
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// `btwoc` base64 encoding of the modulus (`openid.dh_modulus`).
    #[must_use]
    pub fn modulus_base64(&self) -> String {
        STANDARD.encode(btwoc(&self.modulus))
    }

    /// `btwoc` base64 encoding of the generator (`openid.dh_gen`).
    #[must_use]
    pub fn generator_base64(&self) -> String {
        STANDARD.encode(btwoc(&self.generator))
    }
}

impl Default for DhGroup {
    fn default() -> Self {
        Self {
            modulus: BigUint::parse_bytes(DEFAULT_MODULUS_HEX, 16)
                .unwrap_or_else(|| BigUint::from(0u32)),
            generator: BigUint::from(DEFAULT_GENERATOR),
        }
    }
}

/// One ephemeral Diffie-Hellman key pair.
///
/// The private exponent is zeroized on drop.
pub struct DhSession {
    group: DhGroup,
    session_type: SessionType,
    private: BigUint,
    public: BigUint,
}

impl DhSession {
    /// Generate a key pair in the default group.
    ///
    /// # Errors
    ///
    /// Fails for non-DH session types or when the RNG fails.
    pub fn generate(session_type: SessionType) -> Result<Self, DhError> {
        Self::generate_in(DhGroup::default(), session_type)
    }

    /// Generate a key pair in `group`.
    ///
    /// # Errors
    ///
    /// Fails for non-DH session types or when the RNG fails.
    pub fn generate_in(group: DhGroup, session_type: SessionType) -> Result<Self, DhError> {
        session_digest(session_type)?;

        let rng = SystemRandom::new();
        let mut bytes = vec![0u8; group.modulus.to_bytes_be().len() + 8];
        rng.fill(&mut bytes).map_err(|_| DhError::Rng)?;

        // x in [1, p-2]
        let two = BigUint::from(2u32);
        let private = BigUint::from_bytes_be(&bytes) % (&group.modulus - &two) + BigUint::from(1u32);
        bytes.zeroize();

        let public = group.generator.modpow(&private, &group.modulus);
        Ok(Self {
            group,
            session_type,
            private,
            public,
        })
    }

    /// Session type this key pair was generated for.
    #[must_use]
    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    /// Group parameters.
    #[must_use]
    pub fn group(&self) -> &DhGroup {
        &self.group
    }

    /// Public key `g^x mod p`.
    #[must_use]
    pub fn public_key(&self) -> &BigUint {
        &self.public
    }

    /// `btwoc` base64 public key (`openid.dh_consumer_public`).
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(btwoc(&self.public))
    }

    /// Compute `peer^x mod p` after checking `1 < peer < p-1`.
    ///
    /// # Errors
    ///
    /// Returns [`DhError::InvalidPeerKey`] for out-of-range keys.
    pub fn shared_secret(&self, peer_public: &BigUint) -> Result<BigUint, DhError> {
        let one = BigUint::from(1u32);
        if *peer_public <= one || *peer_public >= &self.group.modulus - &one {
            return Err(DhError::InvalidPeerKey("outside (1, p-1)".to_string()));
        }
        Ok(peer_public.modpow(&self.private, &self.group.modulus))
    }

    /// XOR `key` with `H(btwoc(peer^x mod p))`.
    ///
    /// The operation is its own inverse: the provider masks the MAC key with
    /// it and the consumer unmasks with it.
    ///
    /// # Errors
    ///
    /// Fails for an invalid peer key or when `key` is not exactly one digest long.
    pub fn mask(&self, peer_public: &BigUint, key: &[u8]) -> Result<Vec<u8>, DhError> {
        let algorithm = session_digest(self.session_type)?;
        if key.len() != algorithm.output_len() {
            return Err(DhError::KeyLength {
                expected: algorithm.output_len(),
                actual: key.len(),
            });
        }
        let mut shared = btwoc(&self.shared_secret(peer_public)?);
        let hashed = digest::digest(algorithm, &shared);
        shared.zeroize();
        Ok(hashed
            .as_ref()
            .iter()
            .zip(key)
            .map(|(h, k)| h ^ k)
            .collect())
    }

    /// Recover the MAC key from the provider's `dh_server_public` and
    /// `enc_mac_key` fields.
    ///
    /// # Errors
    ///
    /// Fails on malformed base64, an out-of-range server key or a length mismatch.
    pub fn extract_secret(
        &self,
        dh_server_public: &str,
        enc_mac_key: &str,
    ) -> Result<AssociationSecret, DhError> {
        let server_public = parse_btwoc_base64(dh_server_public)?;
        let masked = STANDARD
            .decode(enc_mac_key.trim())
            .map_err(|e| DhError::InvalidPeerKey(format!("enc_mac_key: {e}")))?;
        self.mask(&server_public, &masked).map(AssociationSecret::new)
    }
}

impl Drop for DhSession {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl fmt::Debug for DhSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhSession")
            .field("session_type", &self.session_type)
            .field("default_group", &self.group.is_default())
            .field("private", &"[REDACTED]")
            .finish()
    }
}
