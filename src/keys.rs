//! WireGuard Key Material
//!
//! X25519 key generation and encoding. A private key remembers when it was
//! generated so rotation policy can be evaluated against its age.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// WireGuard private key (Curve25519) with its creation timestamp.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "PrivateKeyRepr", into = "PrivateKeyRepr")]
pub struct PrivateKey {
    secret: StaticSecret,
    created_at: SystemTime,
}

impl PrivateKey {
    /// Generate a new random private key, created now.
    ///
    /// The timestamp is truncated to whole seconds, the precision the
    /// persisted encoding carries, so a stored key round-trips exactly.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
            created_at: unix_seconds_now(),
        }
    }

    /// Create from raw bytes and a creation timestamp.
    pub fn from_bytes(bytes: [u8; 32], created_at: SystemTime) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
            created_at,
        }
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Get raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Encode the scalar as base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// When this key was generated.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Age of the key relative to now. Zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or(Duration::ZERO)
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes() && self.created_at == other.created_at
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted], created {:?})", self.created_at)
    }
}

/// Serialized shape: base64 scalar + unix timestamp.
#[derive(Serialize, Deserialize)]
struct PrivateKeyRepr {
    key: String,
    created_at: u64,
}

impl From<PrivateKey> for PrivateKeyRepr {
    fn from(key: PrivateKey) -> Self {
        let created_at = key
            .created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Self {
            key: key.to_base64(),
            created_at,
        }
    }
}

impl TryFrom<PrivateKeyRepr> for PrivateKey {
    type Error = KeyError;

    fn try_from(repr: PrivateKeyRepr) -> Result<Self, Self::Error> {
        let bytes = decode_key_bytes(&repr.key)?;
        let created_at = UNIX_EPOCH + Duration::from_secs(repr.created_at);
        Ok(Self::from_bytes(bytes, created_at))
    }
}

/// WireGuard public key (Curve25519).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Create from base64 string.
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key_bytes(s).map(Self::from_bytes)
    }

    /// Get raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_base64()
    }
}

impl TryFrom<String> for PublicKey {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_base64(&s)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

fn unix_seconds_now() -> SystemTime {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn decode_key_bytes(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;

    if bytes.len() != 32 {
        return Err(KeyError::InvalidLength);
    }

    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Key parsing errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}
