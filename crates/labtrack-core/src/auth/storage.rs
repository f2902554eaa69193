//! Key-value storage backends for the credential store.
//!
//! The credential store only needs `get`/`set`/`delete` over string keys.
//! Three backends are provided:
//!
//! - `FileStore`: one JSON document on disk, replaced atomically on write
//! - `KeyringStore`: one OS keychain entry per key
//! - `MemoryStore`: process-local map, used for ephemeral sessions and tests

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use keyring::Entry;
use thiserror::Error;
use tracing::debug;

/// Keychain service name used by `KeyringStore`.
const SERVICE_NAME: &str = "labtrack";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Keychain access failed for {key}: {source}")]
    Keyring {
        key: String,
        #[source]
        source: keyring::Error,
    },

    #[error("Stored value for {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Minimal persistence contract used by [`CredentialStore`](super::CredentialStore).
///
/// Implementations must report failures instead of returning defaults; a
/// missing key is `Ok(None)`, an unreadable one is an error.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

// ============================================================================
// File store
// ============================================================================

/// Stores every key in a single JSON object on disk.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves the previous document intact.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the document.
    lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Store at `<dir>/session.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("session.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_document(&self) -> Result<HashMap<String, String>, StorageError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_str(&contents).map_err(|e| StorageError::Corrupt {
            key: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn write_document(&self, doc: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let contents = serde_json::to_string_pretty(doc).map_err(|e| StorageError::Corrupt {
            key: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_document()?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document()?;
        doc.insert(key.to_string(), value.to_string());
        self.write_document(&doc)?;
        debug!(key, path = %self.path.display(), "Stored value");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_document()?;
        if doc.remove(key).is_some() {
            self.write_document(&doc)?;
        }
        Ok(())
    }
}

// ============================================================================
// OS keychain store
// ============================================================================

/// Stores each key as a separate entry in the OS keychain.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Entry::new(&self.service, key).map_err(|source| StorageError::Keyring {
            key: key.to_string(),
            source,
        })
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(source) => Err(StorageError::Keyring {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|source| StorageError::Keyring {
                key: key.to_string(),
                source,
            })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(source) => Err(StorageError::Keyring {
                key: key.to_string(),
                source,
            }),
        }
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store. Supports fault injection so callers can verify that
/// storage failures surface instead of being defaulted.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    deletes: Mutex<HashMap<String, usize>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing_sets: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every `set` of `key` fail.
    pub fn fail_sets_of(&self, key: &str) {
        let mut keys = self.failing_sets.lock().unwrap_or_else(|e| e.into_inner());
        keys.insert(key.to_string());
    }

    /// Make every `delete` of `key` fail.
    pub fn fail_deletes_of(&self, key: &str) {
        let mut keys = self.failing_deletes.lock().unwrap_or_else(|e| e.into_inner());
        keys.insert(key.to_string());
    }

    fn key_fails(keys: &Mutex<HashSet<String>>, key: &str) -> bool {
        keys.lock().unwrap_or_else(|e| e.into_inner()).contains(key)
    }

    /// Number of `delete` calls that actually removed `key`.
    pub fn delete_count(&self, key: &str) -> usize {
        let deletes = self.deletes.lock().unwrap_or_else(|e| e.into_inner());
        deletes.get(key).copied().unwrap_or(0)
    }

    /// Raw value under `key`, bypassing fault injection.
    pub fn peek(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("read of {} failed", key)));
        }
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) || Self::key_fails(&self.failing_sets, key) {
            return Err(StorageError::Unavailable(format!("write of {} failed", key)));
        }
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) || Self::key_fails(&self.failing_deletes, key) {
            return Err(StorageError::Unavailable(format!("delete of {} failed", key)));
        }
        let removed = {
            let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
            values.remove(key).is_some()
        };
        if removed {
            let mut deletes = self.deletes.lock().unwrap_or_else(|e| e.into_inner());
            *deletes.entry(key.to_string()).or_insert(0) += 1;
        }
        Ok(())
    }
}
