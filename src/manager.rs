//! Configuration Manager
//!
//! CRUD façade over the secure attribute store for tunnel configurations,
//! keyed by account token or persistent reference. Mutation goes through an
//! optimistic-concurrency loop: read the record and its modification
//! version, transform, then write back constrained on the version that was
//! observed. A concurrent writer invalidates the constraint, the store
//! reports the constrained update as not-found, and the whole
//! read-transform-write cycle restarts. The loop is unbounded and has no
//! backoff; it is built for low-contention single-device writers where a
//! retry succeeds within an iteration or two.

use crate::codec::{self, CodecError};
use crate::config::TunnelConfiguration;
use crate::store::{Attributes, SecureStore, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Addresses exactly one stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTerm {
    /// The account token the record was created under
    AccountToken(String),
    /// The store-assigned stable handle
    PersistentReference(Vec<u8>),
}

impl SearchTerm {
    pub fn by_account(token: impl Into<String>) -> Self {
        Self::AccountToken(token.into())
    }

    pub fn by_reference(reference: impl Into<Vec<u8>>) -> Self {
        Self::PersistentReference(reference.into())
    }

    fn apply(&self, attributes: &mut Attributes) {
        match self {
            Self::AccountToken(token) => {
                attributes.account = Some(token.clone());
            }
            Self::PersistentReference(reference) => {
                attributes.persistent_reference = Some(reference.clone());
            }
        }
    }
}

/// Manager errors, wrapping the store or codec failure that caused them.
#[derive(Debug, thiserror::Error)]
pub enum MgrError {
    #[error("Failed to encode tunnel configuration")]
    Encode(#[source] CodecError),

    #[error("Failed to decode tunnel configuration")]
    Decode(#[source] CodecError),

    #[error("Failed to add configuration to the store")]
    AddToStore(#[source] StoreError),

    #[error("Failed to update configuration in the store")]
    UpdateStore(#[source] StoreError),

    #[error("Failed to remove configuration from the store")]
    RemoveFromStore(#[source] StoreError),

    #[error("Failed to read configuration from the store")]
    GetFromStore(#[source] StoreError),

    #[error("Failed to obtain a persistent store reference")]
    GetPersistentReference(#[source] StoreError),
}

/// A loaded configuration together with the account it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub account_token: String,
    pub config: TunnelConfiguration,
}

/// CRUD operations for tunnel configurations.
///
/// Cloning is cheap; clones share the underlying store.
pub struct ConfigManager<S> {
    store: Arc<S>,
}

impl<S> Clone for ConfigManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: SecureStore> ConfigManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Load and decode the configuration addressed by `search_term`.
    pub async fn load(&self, search_term: &SearchTerm) -> Result<ConfigEntry, MgrError> {
        let mut query = Attributes::default();
        search_term.apply(&mut query);

        let view = self
            .store
            .find_first(&query)
            .await
            .map_err(MgrError::GetFromStore)?
            .ok_or(MgrError::GetFromStore(StoreError::ItemNotFound))?;

        let config = codec::decode(&view.value_data).map_err(MgrError::Decode)?;

        Ok(ConfigEntry {
            account_token: view.account,
            config,
        })
    }

    /// Encode and insert a new record for `account_token`. Fails with a
    /// wrapped [`StoreError::DuplicateItem`] if the account already has one;
    /// an existing record is never overwritten.
    pub async fn add(
        &self,
        config: &TunnelConfiguration,
        account_token: impl Into<String>,
    ) -> Result<(), MgrError> {
        let value_data = codec::encode(config).map_err(MgrError::Encode)?;

        let attributes = Attributes {
            account: Some(account_token.into()),
            value_data: Some(value_data),
            ..Default::default()
        };

        self.store
            .add(attributes)
            .await
            .map(|_| ())
            .map_err(MgrError::AddToStore)
    }

    /// Delete the record addressed by `search_term`.
    pub async fn remove(&self, search_term: &SearchTerm) -> Result<(), MgrError> {
        let mut query = Attributes::default();
        search_term.apply(&mut query);

        self.store
            .delete(&query)
            .await
            .map_err(MgrError::RemoveFromStore)
    }

    /// Mutate the record addressed by `search_term` through `transform`,
    /// retrying the whole read-transform-write cycle whenever a concurrent
    /// writer commits in between.
    pub async fn update(
        &self,
        search_term: &SearchTerm,
        mut transform: impl FnMut(&mut TunnelConfiguration),
    ) -> Result<(), MgrError> {
        let mut query = Attributes::default();
        search_term.apply(&mut query);

        loop {
            let view = self
                .store
                .find_first(&query)
                .await
                .map_err(MgrError::GetFromStore)?
                .ok_or(MgrError::GetFromStore(StoreError::ItemNotFound))?;

            let mut config = codec::decode(&view.value_data).map_err(MgrError::Decode)?;
            transform(&mut config);
            let value_data = codec::encode(&config).map_err(MgrError::Encode)?;

            // Constrain the write on the version observed above so an
            // intervening writer's record is never overwritten.
            let mut constrained = Attributes::default();
            search_term.apply(&mut constrained);
            constrained.modification_version = Some(view.modification_version);

            let changes = Attributes {
                value_data: Some(value_data),
                ..Default::default()
            };

            match self.store.update(&constrained, changes).await {
                Ok(()) => return Ok(()),
                Err(StoreError::ItemNotFound) => {
                    debug!(
                        version = view.modification_version,
                        "record changed underneath the update, retrying"
                    );
                    continue;
                }
                Err(err) => return Err(MgrError::UpdateStore(err)),
            }
        }
    }

    /// Fetch the store's stable handle for `account_token` without decoding
    /// or exposing the key material.
    pub async fn persistent_reference(
        &self,
        account_token: &str,
    ) -> Result<Vec<u8>, MgrError> {
        let query = Attributes {
            account: Some(account_token.to_string()),
            ..Default::default()
        };

        self.store
            .find_first(&query)
            .await
            .map_err(MgrError::GetPersistentReference)?
            .map(|view| view.persistent_reference)
            .ok_or(MgrError::GetPersistentReference(StoreError::ItemNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RecordView};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample_config() -> TunnelConfiguration {
        let mut config = TunnelConfiguration::new();
        config.addresses = vec![IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2))];
        config
    }

    #[tokio::test]
    async fn test_add_then_load() {
        let manager = ConfigManager::new(MemoryStore::new());
        let config = sample_config();

        manager.add(&config, "A1").await.unwrap();
        let entry = manager.load(&SearchTerm::by_account("A1")).await.unwrap();

        assert_eq!(entry.account_token, "A1");
        assert_eq!(entry.config, config);
    }

    #[tokio::test]
    async fn test_load_by_persistent_reference() {
        let manager = ConfigManager::new(MemoryStore::new());
        let config = sample_config();
        manager.add(&config, "A1").await.unwrap();

        let reference = manager.persistent_reference("A1").await.unwrap();
        let entry = manager
            .load(&SearchTerm::by_reference(reference))
            .await
            .unwrap();

        assert_eq!(entry.account_token, "A1");
        assert_eq!(entry.config, config);
    }

    #[tokio::test]
    async fn test_load_missing_account() {
        let manager = ConfigManager::new(MemoryStore::new());

        let result = manager.load(&SearchTerm::by_account("absent")).await;
        assert!(matches!(
            result,
            Err(MgrError::GetFromStore(StoreError::ItemNotFound))
        ));
    }

    #[tokio::test]
    async fn test_add_duplicate_never_overwrites() {
        let manager = ConfigManager::new(MemoryStore::new());
        let original = sample_config();
        manager.add(&original, "A1").await.unwrap();

        let result = manager.add(&sample_config(), "A1").await;
        assert!(matches!(
            result,
            Err(MgrError::AddToStore(StoreError::DuplicateItem))
        ));

        let entry = manager.load(&SearchTerm::by_account("A1")).await.unwrap();
        assert_eq!(entry.config, original);
    }

    #[tokio::test]
    async fn test_remove() {
        let manager = ConfigManager::new(MemoryStore::new());
        manager.add(&sample_config(), "A1").await.unwrap();

        manager.remove(&SearchTerm::by_account("A1")).await.unwrap();

        let result = manager.load(&SearchTerm::by_account("A1")).await;
        assert!(matches!(result, Err(MgrError::GetFromStore(_))));
    }

    #[tokio::test]
    async fn test_update_applies_transform() {
        let manager = ConfigManager::new(MemoryStore::new());
        manager.add(&sample_config(), "A1").await.unwrap();

        let new_addr = IpAddr::V4(Ipv4Addr::new(10, 99, 0, 7));
        manager
            .update(&SearchTerm::by_account("A1"), |config| {
                config.addresses = vec![new_addr];
            })
            .await
            .unwrap();

        let entry = manager.load(&SearchTerm::by_account("A1")).await.unwrap();
        assert_eq!(entry.config.addresses, vec![new_addr]);
    }

    /// Store wrapper that lets a concurrent writer sneak in one out-of-band
    /// update between a reader's `find_first` and its constrained `update`.
    struct ContendedStore {
        inner: MemoryStore,
        interfere_once: AtomicBool,
    }

    impl ContendedStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                interfere_once: AtomicBool::new(true),
            }
        }
    }

    impl SecureStore for ContendedStore {
        async fn add(&self, attributes: Attributes) -> Result<Vec<u8>, StoreError> {
            self.inner.add(attributes).await
        }

        async fn find_first(
            &self,
            query: &Attributes,
        ) -> Result<Option<RecordView>, StoreError> {
            self.inner.find_first(query).await
        }

        async fn update(&self, query: &Attributes, changes: Attributes) -> Result<(), StoreError> {
            if self.interfere_once.swap(false, Ordering::SeqCst) {
                // Simulated concurrent writer: rotate the stored payload out
                // from underneath the pending constrained update.
                let account_query = Attributes {
                    account: query.account.clone(),
                    ..Default::default()
                };
                let sneak = Attributes {
                    value_data: Some(
                        codec::encode(&sample_config()).unwrap(),
                    ),
                    ..Default::default()
                };
                self.inner.update(&account_query, sneak).await.unwrap();
            }
            self.inner.update(query, changes).await
        }

        async fn delete(&self, query: &Attributes) -> Result<(), StoreError> {
            self.inner.delete(query).await
        }
    }

    #[tokio::test]
    async fn test_update_retries_past_concurrent_writer() {
        let manager = ConfigManager::new(ContendedStore::new(MemoryStore::new()));
        manager.add(&sample_config(), "A1").await.unwrap();

        let new_addr = IpAddr::V4(Ipv4Addr::new(10, 99, 0, 7));
        let mut transform_runs = 0u32;
        manager
            .update(&SearchTerm::by_account("A1"), |config| {
                transform_runs += 1;
                config.addresses = vec![new_addr];
            })
            .await
            .unwrap();

        // First attempt lost the race, the cycle restarted from a fresh read.
        assert_eq!(transform_runs, 2);

        let entry = manager.load(&SearchTerm::by_account("A1")).await.unwrap();
        assert_eq!(entry.config.addresses, vec![new_addr]);
    }

    #[tokio::test]
    async fn test_persistent_reference_missing_account() {
        let manager = ConfigManager::new(MemoryStore::new());

        let result = manager.persistent_reference("absent").await;
        assert!(matches!(
            result,
            Err(MgrError::GetPersistentReference(StoreError::ItemNotFound))
        ));
    }
}
