//! Tunnel Configuration
//!
//! The in-memory shape of a device's WireGuard credentials: its private key,
//! the tunnel addresses assigned by the relay infrastructure, and the peers
//! it connects through. Instances are transient; they are reconstructed from
//! the secure store on each read and re-encoded after mutation.

use crate::keys::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Convert to SocketAddr
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// WireGuard peer record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer's public key
    pub public_key: PublicKey,
    /// Peer's endpoint
    pub endpoint: Endpoint,
    /// Allowed IPs (prefix + length) routed through this peer
    pub allowed_ips: Vec<(IpAddr, u8)>,
}

impl PeerConfig {
    /// Create a peer routing all traffic (0.0.0.0/0 and ::/0)
    pub fn new(public_key: PublicKey, endpoint: Endpoint) -> Self {
        Self {
            public_key,
            endpoint,
            allowed_ips: vec![
                (IpAddr::V4([0, 0, 0, 0].into()), 0),
                (IpAddr::V6([0u16; 8].into()), 0),
            ],
        }
    }
}

/// A device's complete tunnel credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    /// The device private key
    pub private_key: PrivateKey,
    /// Tunnel addresses assigned to this device, in assignment order
    pub addresses: Vec<IpAddr>,
    /// Peers this device connects through
    pub peers: Vec<PeerConfig>,
}

impl TunnelConfiguration {
    /// Create a configuration with a freshly generated private key and no
    /// assigned addresses yet.
    pub fn new() -> Self {
        Self {
            private_key: PrivateKey::generate(),
            addresses: Vec::new(),
            peers: Vec::new(),
        }
    }

    /// The public key matching the stored private key.
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }
}

impl Default for TunnelConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_endpoint_display() {
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 51820);
        assert_eq!(ep.to_string(), "192.168.1.1:51820");
    }

    #[test]
    fn test_peer_routes_everything_by_default() {
        let peer = PeerConfig::new(
            PrivateKey::generate().public_key(),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 51820),
        );

        assert_eq!(peer.allowed_ips.len(), 2);
        assert!(peer.allowed_ips.iter().all(|(_, prefix)| *prefix == 0));
    }

    #[test]
    fn test_public_key_derivation() {
        let config = TunnelConfiguration::new();
        assert_eq!(config.public_key(), config.private_key.public_key());
    }
}
