//! L3: durable entries on the local filesystem.
//!
//! Layout: `<root>/entries/<first 2 hex>/<remaining hex>.json`, where the
//! hex is the SHA-256 of the cache key. Writes go through a temp file in the
//! shard directory and a rename, so readers never see a partial entry.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{CacheEntry, CacheError, CacheResult, CacheTier};

pub struct FsTier {
    entries_dir: PathBuf,
}

impl FsTier {
    /// Tier rooted at `root`. Creates `root/entries/` if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let entries_dir = root.as_ref().join("entries");
        std::fs::create_dir_all(&entries_dir)?;
        Ok(Self { entries_dir })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let hex = hex::encode(Sha256::digest(key.as_bytes()));
        self.entries_dir
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]))
    }

    async fn blocking<T, F>(f: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CacheResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?
    }
}

fn read_entry(path: &Path) -> CacheResult<Option<CacheEntry>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_file(path: &Path) -> CacheResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Every entry file under `dir`, one shard level deep.
fn entry_files(dir: &Path) -> CacheResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for shard in std::fs::read_dir(dir)? {
        let shard = shard?.path();
        if !shard.is_dir() {
            continue;
        }
        for file in std::fs::read_dir(&shard)? {
            let file = file?.path();
            if file.extension().is_some_and(|ext| ext == "json") {
                files.push(file);
            }
        }
    }
    Ok(files)
}

#[async_trait]
impl CacheTier for FsTier {
    fn name(&self) -> &str {
        "fs"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let path = self.entry_path(key);
        Self::blocking(move || read_entry(&path)).await
    }

    async fn put(&self, entry: &CacheEntry) -> CacheResult<()> {
        let path = self.entry_path(&entry.key);
        let bytes = serde_json::to_vec(entry)?;
        Self::blocking(move || {
            let shard_dir = path
                .parent()
                .ok_or_else(|| CacheError::Task(format!("no parent for {}", path.display())))?;
            std::fs::create_dir_all(shard_dir)?;
            let mut tmp = NamedTempFile::new_in(shard_dir)?;
            tmp.write_all(&bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> CacheResult<bool> {
        let path = self.entry_path(key);
        Self::blocking(move || remove_file(&path)).await
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        let dir = self.entries_dir.clone();
        Self::blocking(move || {
            let mut keys = Vec::new();
            for file in entry_files(&dir)? {
                if let Some(entry) = read_entry(&file)? {
                    keys.push(entry.key);
                }
            }
            Ok(keys)
        })
        .await
    }

    async fn purge_expired(&self) -> CacheResult<usize> {
        let dir = self.entries_dir.clone();
        let removed = Self::blocking(move || {
            let now = Utc::now().timestamp_millis();
            let mut removed = 0;
            for file in entry_files(&dir)? {
                // Unreadable entries are dropped along with expired ones.
                let expired = match read_entry(&file) {
                    Ok(Some(entry)) => entry.is_expired_at(now),
                    Ok(None) => false,
                    Err(_) => true,
                };
                if expired && remove_file(&file)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await?;
        if removed > 0 {
            debug!(removed, "cache: purged expired fs entries");
        }
        Ok(removed)
    }
}
