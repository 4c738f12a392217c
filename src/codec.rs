//! Configuration Codec
//!
//! Serializes a [`TunnelConfiguration`] to the opaque blob persisted in the
//! secure store. The first byte of every blob is a format-version tag so the
//! layout can evolve without breaking records written by older builds.

use crate::config::TunnelConfiguration;

/// Highest blob format version this build understands.
pub const FORMAT_VERSION: u8 = 1;

/// Codec errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Stored configuration data is corrupt")]
    CorruptData,

    #[error("Unsupported configuration format version {0}")]
    UnsupportedVersion(u8),
}

/// Encode a configuration into a versioned blob.
pub fn encode(config: &TunnelConfiguration) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(config).map_err(|_| CodecError::CorruptData)?;

    let mut blob = Vec::with_capacity(1 + payload.len());
    blob.push(FORMAT_VERSION);
    blob.extend_from_slice(&payload);
    Ok(blob)
}

/// Decode a versioned blob back into a configuration.
pub fn decode(blob: &[u8]) -> Result<TunnelConfiguration, CodecError> {
    let (&version, payload) = blob.split_first().ok_or(CodecError::CorruptData)?;

    if version > FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    serde_json::from_slice(payload).map_err(|_| CodecError::CorruptData)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, PeerConfig};
    use crate::keys::PrivateKey;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn sample_config() -> TunnelConfiguration {
        let mut config = TunnelConfiguration::new();
        config.addresses = vec![
            IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2)),
            IpAddr::V6("fc00::2".parse::<Ipv6Addr>().unwrap()),
        ];
        config.peers = vec![PeerConfig::new(
            PrivateKey::generate().public_key(),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(185, 213, 154, 68)), 51820),
        )];
        config
    }

    #[test]
    fn test_roundtrip() {
        let config = sample_config();

        let blob = encode(&config).unwrap();
        let restored = decode(&blob).unwrap();

        assert_eq!(config, restored);
    }

    #[test]
    fn test_version_tag_is_first_byte() {
        let blob = encode(&sample_config()).unwrap();
        assert_eq!(blob[0], FORMAT_VERSION);
    }

    #[test]
    fn test_empty_blob_is_corrupt() {
        assert!(matches!(decode(&[]), Err(CodecError::CorruptData)));
    }

    #[test]
    fn test_garbage_payload_is_corrupt() {
        let blob = [FORMAT_VERSION, 0xde, 0xad, 0xbe, 0xef];
        assert!(matches!(decode(&blob), Err(CodecError::CorruptData)));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut blob = encode(&sample_config()).unwrap();
        blob[0] = FORMAT_VERSION + 1;

        assert!(matches!(
            decode(&blob),
            Err(CodecError::UnsupportedVersion(v)) if v == FORMAT_VERSION + 1
        ));
    }
}
