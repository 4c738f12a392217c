//! Key Rotation Engine
//!
//! Periodically replaces the device's WireGuard private key. A rotation is a
//! pipeline: load the stored configuration, check the rotation policy
//! against the current key's age, register a freshly generated key with the
//! remote key-exchange service, then commit the new key and the newly
//! assigned addresses through the configuration manager's
//! optimistic-concurrency update. The exchange always happens before the
//! local commit, so the stored private key's public half is never unknown to
//! the server. Concurrent rotations for one account are individually safe;
//! the last commit wins and callers must not assume their own rotation is
//! the one that remains authoritative.
//!
//! Cancellation is drop-based: dropping the future at any await point before
//! the commit leaves the prior configuration fully intact.

use crate::api::{ApiError, KeyExchangeApi};
use crate::keys::PrivateKey;
use crate::manager::{ConfigManager, MgrError, SearchTerm};
use crate::store::SecureStore;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default key age after which a scheduled rotation proceeds.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Policy deciding whether a rotation attempt should proceed now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPrecondition {
    /// Rotate unconditionally.
    Always,
    /// Rotate only once the current key is at least this old.
    WhenAgedEnough(Duration),
}

impl Default for RotationPrecondition {
    fn default() -> Self {
        Self::WhenAgedEnough(DEFAULT_ROTATION_INTERVAL)
    }
}

impl RotationPrecondition {
    fn should_rotate(&self, key: &PrivateKey) -> bool {
        match self {
            Self::Always => true,
            Self::WhenAgedEnough(threshold) => key.age() >= *threshold,
        }
    }
}

/// What a completed rotation attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// A new key was registered and committed.
    Rotated,
    /// The precondition was not met; nothing was changed.
    NotRotated,
}

/// Rotation failures, wrapping the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// Reading the stored configuration failed.
    #[error("Failed to read the stored tunnel configuration")]
    ReadConfig(#[source] MgrError),

    /// The remote key exchange failed; nothing was changed locally.
    #[error("Key exchange failed")]
    Exchange(#[source] ApiError),

    /// The exchange succeeded but the local commit failed.
    #[error("Failed to commit the rotated key")]
    Commit(#[source] MgrError),
}

/// Coordinates key replacement between the remote key-exchange service and
/// the local configuration store.
pub struct KeyRotationEngine<S, A> {
    manager: ConfigManager<S>,
    api: A,
}

impl<S: SecureStore, A: KeyExchangeApi> KeyRotationEngine<S, A> {
    pub fn new(manager: ConfigManager<S>, api: A) -> Self {
        Self { manager, api }
    }

    /// Rotate the private key of the configuration addressed by
    /// `search_term`, if `precondition` allows it.
    pub async fn rotate_private_key(
        &self,
        search_term: &SearchTerm,
        precondition: RotationPrecondition,
    ) -> Result<RotationOutcome, RotationError> {
        let entry = self
            .manager
            .load(search_term)
            .await
            .map_err(RotationError::ReadConfig)?;

        if !precondition.should_rotate(&entry.config.private_key) {
            debug!(
                account = %entry.account_token,
                key_age_secs = entry.config.private_key.age().as_secs(),
                "rotation precondition not met"
            );
            return Ok(RotationOutcome::NotRotated);
        }

        let old_public_key = entry.config.public_key();
        let new_private_key = PrivateKey::generate();
        let new_public_key = new_private_key.public_key();

        let addresses = self
            .api
            .replace_key(&entry.account_token, &old_public_key, &new_public_key)
            .await
            .map_err(RotationError::Exchange)?;

        // The server now holds the new key. If the process dies before the
        // commit below lands, the caller re-runs rotation with `Always` on
        // next launch; log enough to diagnose that window.
        warn!(
            account = %entry.account_token,
            new_public_key = %new_public_key,
            "key registered remotely, committing locally"
        );

        self.manager
            .update(search_term, |config| {
                config.private_key = new_private_key.clone();
                config.addresses = vec![
                    IpAddr::V4(addresses.ipv4_address),
                    IpAddr::V6(addresses.ipv6_address),
                ];
            })
            .await
            .map_err(RotationError::Commit)?;

        info!(account = %entry.account_token, "private key rotated");
        Ok(RotationOutcome::Rotated)
    }
}
