//! Durable storage tier behind the cache
//!
//! The cache mirrors every write into a [`DurableTier`] so entries survive a
//! restart. Implementations are swappable; the engine treats every failure
//! from this layer as non-fatal.

use async_trait::async_trait;
use bulwark_error::{BulwarkError, Result};
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Key/value storage holding serialized cache records
#[async_trait]
pub trait DurableTier: Send + Sync + std::fmt::Debug {
    /// Read a record; `Ok(None)` when the key is absent
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Write (or overwrite) a record
    async fn write(&self, key: &str, serialized: String) -> Result<()>;

    /// Delete a record; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// All stored keys starting with `prefix`
    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process durable tier
///
/// Useful for tests and for hosts without persistent storage. It can be taken
/// offline with [`MemoryDurableTier::set_available`] to simulate an outage.
#[derive(Debug)]
pub struct MemoryDurableTier {
    records: DashMap<String, String>,
    available: AtomicBool,
}

impl MemoryDurableTier {
    /// Create an empty, available tier
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Bring the tier online or take it offline
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Store a raw record, bypassing the cache
    pub fn insert_raw(&self, key: impl Into<String>, raw: impl Into<String>) {
        self.records.insert(key.into(), raw.into());
    }

    /// Raw record for `key`, regardless of availability
    pub fn raw(&self, key: &str) -> Option<String> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BulwarkError::StorageUnavailable("memory tier offline".to_string()))
        }
    }
}

impl Default for MemoryDurableTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableTier for MemoryDurableTier {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        Ok(self.raw(key))
    }

    async fn write(&self, key: &str, serialized: String) -> Result<()> {
        self.ensure_available()?;
        self.records.insert(key.to_string(), serialized);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.records.remove(key);
        Ok(())
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self
            .records
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| r.key().clone())
            .collect())
    }
}

/// Durable tier storing one JSON file per key in a directory
///
/// File names are the hex-encoded key, so any key is a valid file name.
#[derive(Debug, Clone)]
pub struct FileDurableTier {
    dir: PathBuf,
}

impl FileDurableTier {
    /// Open (creating if needed) a directory-backed tier
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(".json")?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

fn storage_error(path: &Path, err: std::io::Error) -> BulwarkError {
    BulwarkError::StorageUnavailable(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl DurableTier for FileDurableTier {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(&path, e)),
        }
    }

    async fn write(&self, key: &str, serialized: String) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized)
            .await
            .map_err(|e| storage_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error(&path, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&path, e)),
        }
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_error(&self.dir, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error(&self.dir, e))?
        {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(Self::key_for) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
