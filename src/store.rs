//! Secure Attribute Store
//!
//! Key/value-with-metadata persistence for credential blobs, addressed by
//! partial attribute sets rather than a single primary key. Every backend
//! guarantees compare-and-swap semantics on [`SecureStore::update`]: a query
//! carrying a `modification_version` constraint either matches-and-applies
//! atomically or fails with [`StoreError::ItemNotFound`] as a whole. The
//! layer above builds its optimistic-concurrency loop on exactly that
//! guarantee.
//!
//! Two backends are provided:
//! - [`MemoryStore`] — mutex-guarded, for in-process use and tests
//! - [`EncryptedFileStore`] — a single ChaCha20-Poly1305-sealed file,
//!   rewritten on every mutation (no in-memory caching)

use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Store errors. The numeric codes mirror platform secure-store conventions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("No item matched the query")]
    ItemNotFound,

    #[error("An item with the same account already exists")]
    DuplicateItem,

    #[error("The secure store is not available")]
    StoreUnavailable,

    #[error("Secure store failure (code {0})")]
    Unknown(i32),
}

/// Malformed request (missing required attributes).
const ERR_PARAM: i32 = -50;
/// Stored data could not be decoded or authenticated.
const ERR_DECODE: i32 = -26275;

/// Sparse attribute set used both as a query (absent = "don't filter") and
/// as a change set (absent = "don't change").
#[derive(Debug, Default, Clone)]
pub struct Attributes {
    /// Account the record belongs to
    pub account: Option<String>,
    /// Opaque payload bytes
    pub value_data: Option<Vec<u8>>,
    /// Store-assigned version, advanced on every mutation
    pub modification_version: Option<u64>,
    /// Store-assigned stable opaque handle
    pub persistent_reference: Option<Vec<u8>>,
}

/// A read-only view of one stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordView {
    pub account: String,
    pub value_data: Vec<u8>,
    pub modification_version: u64,
    pub persistent_reference: Vec<u8>,
}

/// Attribute-addressed persistence with CAS update semantics.
pub trait SecureStore: Send + Sync {
    /// Insert a new record. Requires `account` and `value_data`; fails with
    /// [`StoreError::DuplicateItem`] if the account already has a record.
    /// Returns the persistent reference assigned to the new record.
    fn add(
        &self,
        attributes: Attributes,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, StoreError>> + Send;

    /// Return the first record matching every populated query field.
    fn find_first(
        &self,
        query: &Attributes,
    ) -> impl std::future::Future<Output = Result<Option<RecordView>, StoreError>> + Send;

    /// Atomically apply `changes` to the records matching `query`. Fails
    /// with [`StoreError::ItemNotFound`] when the query (including any
    /// `modification_version` constraint) matches nothing.
    fn update(
        &self,
        query: &Attributes,
        changes: Attributes,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Delete the records matching `query`; [`StoreError::ItemNotFound`]
    /// when none match.
    fn delete(
        &self,
        query: &Attributes,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    account: String,
    value_data: Vec<u8>,
    modification_version: u64,
    persistent_reference: Vec<u8>,
}

impl StoredRecord {
    fn matches(&self, query: &Attributes) -> bool {
        if let Some(account) = &query.account {
            if *account != self.account {
                return false;
            }
        }
        if let Some(version) = query.modification_version {
            if version != self.modification_version {
                return false;
            }
        }
        if let Some(reference) = &query.persistent_reference {
            if *reference != self.persistent_reference {
                return false;
            }
        }
        true
    }

    fn view(&self) -> RecordView {
        RecordView {
            account: self.account.clone(),
            value_data: self.value_data.clone(),
            modification_version: self.modification_version,
            persistent_reference: self.persistent_reference.clone(),
        }
    }
}

/// The record table plus the version counter, shared by both backends.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    records: Vec<StoredRecord>,
    next_version: u64,
}

impl StoreState {
    fn add(&mut self, attributes: Attributes) -> Result<Vec<u8>, StoreError> {
        let account = attributes.account.ok_or(StoreError::Unknown(ERR_PARAM))?;
        let value_data = attributes
            .value_data
            .ok_or(StoreError::Unknown(ERR_PARAM))?;

        if self.records.iter().any(|record| record.account == account) {
            return Err(StoreError::DuplicateItem);
        }

        let mut persistent_reference = vec![0u8; 16];
        OsRng.fill_bytes(&mut persistent_reference);

        let record = StoredRecord {
            account,
            value_data,
            modification_version: self.advance_version(),
            persistent_reference: persistent_reference.clone(),
        };

        debug!(account = %record.account, version = record.modification_version, "added record");
        self.records.push(record);
        Ok(persistent_reference)
    }

    fn find_first(&self, query: &Attributes) -> Option<RecordView> {
        self.records
            .iter()
            .find(|record| record.matches(query))
            .map(StoredRecord::view)
    }

    fn update(&mut self, query: &Attributes, changes: Attributes) -> Result<(), StoreError> {
        let mut matched = false;

        // Version advances per matched record; the whole pass runs under the
        // backend's lock, so the match-and-apply is atomic.
        let mut version = self.next_version;
        for record in self.records.iter_mut().filter(|record| record.matches(query)) {
            matched = true;

            if let Some(value_data) = &changes.value_data {
                record.value_data = value_data.clone();
            }
            if let Some(account) = &changes.account {
                record.account = account.clone();
            }

            record.modification_version = version;
            version += 1;
        }

        if !matched {
            return Err(StoreError::ItemNotFound);
        }

        self.next_version = version;
        Ok(())
    }

    fn delete(&mut self, query: &Attributes) -> Result<(), StoreError> {
        let before = self.records.len();
        self.records.retain(|record| !record.matches(query));

        if self.records.len() == before {
            Err(StoreError::ItemNotFound)
        } else {
            Ok(())
        }
    }

    fn advance_version(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }
}

/// In-process store backed by a mutex-guarded record table.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemoryStore {
    async fn add(&self, attributes: Attributes) -> Result<Vec<u8>, StoreError> {
        self.state.lock().await.add(attributes)
    }

    async fn find_first(&self, query: &Attributes) -> Result<Option<RecordView>, StoreError> {
        Ok(self.state.lock().await.find_first(query))
    }

    async fn update(&self, query: &Attributes, changes: Attributes) -> Result<(), StoreError> {
        self.state.lock().await.update(query, changes)
    }

    async fn delete(&self, query: &Attributes) -> Result<(), StoreError> {
        self.state.lock().await.delete(query)
    }
}

/// File-backed store sealed with ChaCha20-Poly1305.
///
/// The whole record table is one AEAD blob (12-byte random nonce prepended)
/// under a key derived from the caller's device secret. Every operation
/// reloads the file, mutates, and rewrites it via a temp-file rename; there
/// is no in-memory cache, so external writers are picked up on the next
/// operation.
pub struct EncryptedFileStore {
    path: PathBuf,
    cipher: ChaCha20Poly1305,
    io_lock: Mutex<()>,
}

const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &[u8] = b"wg-keyvault storage key v1";

impl EncryptedFileStore {
    /// Open (or create on first write) the store at `path`, sealed under a
    /// key derived from `device_secret`.
    pub fn new(path: impl AsRef<Path>, device_secret: &[u8]) -> Self {
        let digest = Blake2s256::new()
            .chain_update(KEY_CONTEXT)
            .chain_update(device_secret)
            .finalize();

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&digest);

        Self {
            path: path.as_ref().to_path_buf(),
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key_bytes)),
            io_lock: Mutex::new(()),
        }
    }

    async fn load_state(&self) -> Result<StoreState, StoreError> {
        let blob = match tokio::fs::read(&self.path).await {
            Ok(blob) => blob,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(StoreState::default());
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "store file unreadable");
                return Err(StoreError::StoreUnavailable);
            }
        };

        if blob.len() < NONCE_LEN {
            return Err(StoreError::Unknown(ERR_DECODE));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Unknown(ERR_DECODE))?;

        serde_json::from_slice(&plaintext).map_err(|_| StoreError::Unknown(ERR_DECODE))
    }

    async fn save_state(&self, state: &StoreState) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(state).map_err(|_| StoreError::Unknown(ERR_DECODE))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::Unknown(ERR_DECODE))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        // Write-then-rename so a crash mid-write never truncates the store.
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &blob)
            .await
            .map_err(|_| StoreError::StoreUnavailable)?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|_| StoreError::StoreUnavailable)
    }
}

impl SecureStore for EncryptedFileStore {
    async fn add(&self, attributes: Attributes) -> Result<Vec<u8>, StoreError> {
        let _guard = self.io_lock.lock().await;
        let mut state = self.load_state().await?;
        let reference = state.add(attributes)?;
        self.save_state(&state).await?;
        Ok(reference)
    }

    async fn find_first(&self, query: &Attributes) -> Result<Option<RecordView>, StoreError> {
        let _guard = self.io_lock.lock().await;
        Ok(self.load_state().await?.find_first(query))
    }

    async fn update(&self, query: &Attributes, changes: Attributes) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let mut state = self.load_state().await?;
        state.update(query, changes)?;
        self.save_state(&state).await
    }

    async fn delete(&self, query: &Attributes) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let mut state = self.load_state().await?;
        state.delete(query)?;
        self.save_state(&state).await
    }
}
