//! Persistent-tier backends.
//!
//! The cache only needs a flat string key/value namespace, so any durable
//! store can back the persistent tier by implementing `PersistentStore`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tracing::debug;

use crate::error::StorageError;
use crate::lock::{rw_read, rw_write};

/// Minimal key/value interface for the persistent tier.
///
/// Implementations use interior mutability and must be safe to share across
/// threads; the sweep runs concurrently with foreground reads and writes.
pub trait PersistentStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Fails with `StorageError::QuotaExceeded` when the backend is full.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Remove `key` only if its current value satisfies `predicate`. The
    /// check and the removal happen under one lock, so a write that lands
    /// after the caller last read the item is never discarded.
    ///
    /// Returns whether the item was removed.
    fn remove_if(
        &self,
        key: &str,
        predicate: &dyn Fn(&str) -> bool,
    ) -> Result<bool, StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-process backend with an optional byte capacity.
///
/// Capacity is measured as the sum of key and value lengths. Writes can be
/// made to fail on demand to exercise degraded persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, String>>,
    capacity: Option<u64>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            capacity: Some(capacity_bytes),
            ..Self::default()
        }
    }

    /// Make every subsequent `set_item` fail with `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn used_bytes(&self) -> u64 {
        rw_read(&self.items, "memory_store.used_bytes")
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.items, "memory_store.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(rw_read(&self.items, "memory_store.get_item").get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "writes disabled on memory store".to_string(),
            ));
        }

        let mut items = rw_write(&self.items, "memory_store.set_item");
        if let Some(capacity) = self.capacity {
            let used: u64 = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            let needed = used + (key.len() + value.len()) as u64;
            if needed > capacity {
                return Err(StorageError::QuotaExceeded { needed, capacity });
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        rw_write(&self.items, "memory_store.remove_item").remove(key);
        Ok(())
    }

    fn remove_if(
        &self,
        key: &str,
        predicate: &dyn Fn(&str) -> bool,
    ) -> Result<bool, StorageError> {
        let mut items = rw_write(&self.items, "memory_store.remove_if");
        match items.get(key) {
            Some(value) if predicate(value) => {
                items.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(rw_read(&self.items, "memory_store.keys")
            .keys()
            .cloned()
            .collect())
    }
}

// ============================================================================
// File backend
// ============================================================================

/// Extension for item files inside the store directory.
const ITEM_EXTENSION: &str = ".json";

/// Directory-backed store: one file per key.
///
/// File names are a percent-encoding of the key, so keys may contain `:`,
/// `/` or any other character. The total size of item files is bounded by
/// `capacity_bytes`.
pub struct FileStore {
    dir: PathBuf,
    capacity_bytes: u64,
    // Serializes writers so the capacity check and the write are atomic
    // with respect to other writers in this process.
    guard: RwLock<()>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>, capacity_bytes: u64) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!(?dir, capacity_bytes, "Opened file store");
        Ok(Self {
            dir,
            capacity_bytes,
            guard: RwLock::new(()),
        })
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(key), ITEM_EXTENSION))
    }

    fn used_bytes(&self) -> Result<u64, StorageError> {
        let mut total = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(ITEM_EXTENSION) {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

impl PersistentStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _read = rw_read(&self.guard, "file_store.get_item");
        match std::fs::read_to_string(self.item_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _write = rw_write(&self.guard, "file_store.set_item");
        let path = self.item_path(key);

        let existing = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let needed = self.used_bytes()? - existing + value.len() as u64;
        if needed > self.capacity_bytes {
            return Err(StorageError::QuotaExceeded {
                needed,
                capacity: self.capacity_bytes,
            });
        }

        // Write-then-rename so readers never observe a partial item
        let tmp = self.dir.join(format!(".{}.tmp", encode_key(key)));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let _write = rw_write(&self.guard, "file_store.remove_item");
        match std::fs::remove_file(self.item_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_if(
        &self,
        key: &str,
        predicate: &dyn Fn(&str) -> bool,
    ) -> Result<bool, StorageError> {
        let _write = rw_write(&self.guard, "file_store.remove_if");
        let path = self.item_path(key);

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !predicate(&contents) {
            return Ok(false);
        }

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let _read = rw_read(&self.guard, "file_store.keys");
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            let Some(encoded) = name.strip_suffix(ITEM_EXTENSION) else {
                continue;
            };
            match decode_key(encoded) {
                Some(key) => keys.push(key),
                None => debug!(file = %name, "Skipping file with undecodable name"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9_-]`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
