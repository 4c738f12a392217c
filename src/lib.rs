//! wg-keyvault - Encrypted Credential Store and Key Rotation
//!
//! Manages a device's WireGuard tunnel credentials (private key, assigned
//! addresses, peer records) inside an encrypted attribute store, and rotates
//! the private key by coordinating with a remote key-exchange service. The
//! locally stored configuration and the server-side registered public key
//! never diverge: the exchange always precedes the local commit, and the
//! commit is a compare-and-swap that retries past concurrent writers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  KeyRotationEngine   │── replace_key ──▶ remote key-exchange API
//! └──────────┬───────────┘
//!            │ load / update (optimistic CAS retry)
//! ┌──────────▼───────────┐
//! │    ConfigManager     │── encode/decode ──▶ versioned blob codec
//! └──────────┬───────────┘
//!            │ add / find_first / update / delete
//! ┌──────────▼───────────┐
//! │     SecureStore      │  MemoryStore | EncryptedFileStore
//! └──────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! Every operation is async and lock-free above the store boundary.
//! Correctness under concurrent writers rests on the store's CAS `update`:
//! a version-constrained write either matches-and-applies atomically or
//! fails, and the manager restarts its read-transform-write cycle on
//! failure. Cancellation is drop-based; dropping a rotation before its
//! commit leaves the stored configuration fully intact.

mod api;
mod codec;
mod config;
mod keys;
mod manager;
mod rotation;
mod store;

pub use api::{ApiError, AssignedAddresses, KeyExchangeApi, RestKeyExchange};
pub use codec::{CodecError, FORMAT_VERSION, decode, encode};
pub use config::{Endpoint, PeerConfig, TunnelConfiguration};
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use manager::{ConfigEntry, ConfigManager, MgrError, SearchTerm};
pub use rotation::{
    DEFAULT_ROTATION_INTERVAL, KeyRotationEngine, RotationError, RotationOutcome,
    RotationPrecondition,
};
pub use store::{
    Attributes, EncryptedFileStore, MemoryStore, RecordView, SecureStore, StoreError,
};
