// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable record stores backing the artifact registry.
//!
//! `JsonFileStore` keeps every record in one JSON document. Writes go to a
//! temp file that is synced and atomically renamed over the document while an
//! exclusive lock on a sibling `.lock` file is held, so a crash mid-write never
//! leaves a truncated registry behind.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::DownloadedArtifact;
use crate::error::{ArtifactError, ArtifactResult};

/// Default timeout for acquiring the registry lock file.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Current on-disk document version.
const DOCUMENT_VERSION: u32 = 1;

/// Id-keyed durable storage for [`DownloadedArtifact`] records.
///
/// Implementations only need simple CRUD; the registry keeps its own
/// in-memory index and enforces uniqueness.
pub trait RecordStore: Send + Sync {
    /// Load every stored record.
    fn load(&self) -> ArtifactResult<Vec<DownloadedArtifact>>;

    /// Insert or replace the record for `record.id`.
    fn put(&self, record: &DownloadedArtifact) -> ArtifactResult<()>;

    /// Remove the record for `id`. Removing an absent id is not an error.
    fn remove(&self, id: &str) -> ArtifactResult<()>;
}

/// On-disk registry document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    last_saved: Option<DateTime<Utc>>,
    records: BTreeMap<String, DownloadedArtifact>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            last_saved: None,
            records: BTreeMap::new(),
        }
    }
}

/// Registry persisted as a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonFileStore {
    /// Create a store writing to `path` (e.g., `<storage>/registry.json`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Override the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Acquire an exclusive lock on `path`, retrying until `timeout`.
    fn acquire_exclusive_lock(path: &Path, timeout: Duration) -> ArtifactResult<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArtifactError::storage(parent, e))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ArtifactError::storage(path, e))?;

        let start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(ArtifactError::storage(
                            path,
                            io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!(
                                    "timed out waiting for registry lock after {:?}; \
                                     another instance may be writing",
                                    timeout
                                ),
                            ),
                        ));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(ArtifactError::storage(path, e)),
            }
        }
    }

    fn read_document(&self) -> ArtifactResult<RegistryDocument> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(RegistryDocument::default())
            }
            Err(e) => return Err(ArtifactError::storage(&self.path, e)),
        };
        serde_json::from_str(&content).map_err(|e| {
            ArtifactError::Config(format!(
                "failed to parse registry {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write_document(&self, document: &mut RegistryDocument) -> ArtifactResult<()> {
        document.last_saved = Some(Utc::now());
        document.version = DOCUMENT_VERSION;

        let content = serde_json::to_string_pretty(document)
            .map_err(|e| ArtifactError::Config(format!("failed to serialize registry: {}", e)))?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| ArtifactError::storage(&temp_path, e))?;
            temp_file
                .write_all(content.as_bytes())
                .map_err(|e| ArtifactError::storage(&temp_path, e))?;
            temp_file
                .sync_all()
                .map_err(|e| ArtifactError::storage(&temp_path, e))?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| ArtifactError::storage(&self.path, e))
    }

    /// Read-modify-write the document under the exclusive lock.
    fn update<F>(&self, mutate: F) -> ArtifactResult<()>
    where
        F: FnOnce(&mut RegistryDocument),
    {
        let _lock_guard = Self::acquire_exclusive_lock(&self.lock_path(), self.lock_timeout)?;
        let mut document = self.read_document()?;
        mutate(&mut document);
        self.write_document(&mut document)
    }
}

impl RecordStore for JsonFileStore {
    fn load(&self) -> ArtifactResult<Vec<DownloadedArtifact>> {
        Ok(self.read_document()?.records.into_values().collect())
    }

    fn put(&self, record: &DownloadedArtifact) -> ArtifactResult<()> {
        self.update(|document| {
            document.records.insert(record.id.clone(), record.clone());
        })
    }

    fn remove(&self, id: &str) -> ArtifactResult<()> {
        self.update(|document| {
            document.records.remove(id);
        })
    }
}

/// Volatile store for tests and embedders that persist records elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, DownloadedArtifact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with records.
    pub fn with_records(records: impl IntoIterator<Item = DownloadedArtifact>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, DownloadedArtifact>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for MemoryStore {
    fn load(&self) -> ArtifactResult<Vec<DownloadedArtifact>> {
        Ok(self.records().values().cloned().collect())
    }

    fn put(&self, record: &DownloadedArtifact) -> ArtifactResult<()> {
        self.records().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> ArtifactResult<()> {
        self.records().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ArtifactKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(id: &str, dir: &Path) -> DownloadedArtifact {
        DownloadedArtifact {
            id: id.to_string(),
            name: id.to_string(),
            kind: ArtifactKind::Transcription,
            local_path: dir.join(format!("{}.bin", id)),
            downloaded_at: Utc::now(),
            actual_size_bytes: 42,
            checksum: None,
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp.path().join("registry.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_put_remove_roundtrip_on_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        let store = JsonFileStore::new(&path);

        store.put(&record("whisper-small", temp.path())).unwrap();
        store.put(&record("whisper-base", temp.path())).unwrap();

        // A fresh store sees what the first one persisted
        let reopened = JsonFileStore::new(&path);
        let mut ids: Vec<_> = reopened.load().unwrap().into_iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["whisper-base", "whisper-small"]);

        reopened.remove("whisper-small").unwrap();
        reopened.remove("never-existed").unwrap();
        let ids: Vec<_> = store.load().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["whisper-base"]);

        assert!(!path.with_extension("tmp").exists(), "temp file must be renamed away");
    }

    #[test]
    fn test_corrupt_document_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        fs::write(&path, "{ truncated").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(ArtifactError::Config(_))));
    }

    #[test]
    fn test_lock_timeout() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("registry.lock");

        let held = JsonFileStore::acquire_exclusive_lock(&lock_path, Duration::from_secs(1));
        assert!(held.is_ok());

        let start = Instant::now();
        let second =
            JsonFileStore::acquire_exclusive_lock(&lock_path, Duration::from_millis(150));
        assert!(second.is_err(), "second exclusive lock should time out");
        assert!(start.elapsed() >= Duration::from_millis(100));

        drop(held);
        assert!(JsonFileStore::acquire_exclusive_lock(&lock_path, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_concurrent_puts_are_serialized() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        let dir = temp.path().to_path_buf();
        let written = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = JsonFileStore::new(&path).with_lock_timeout(Duration::from_secs(10));
                let dir = dir.clone();
                let written = Arc::clone(&written);
                thread::spawn(move || {
                    for i in 0..5 {
                        store.put(&record(&format!("m-{}-{}", t, i), &dir)).unwrap();
                        written.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }

        assert_eq!(written.load(Ordering::SeqCst), 20);
        assert_eq!(JsonFileStore::new(&path).load().unwrap().len(), 20);
    }

    #[test]
    fn test_memory_store() {
        let temp = TempDir::new().unwrap();
        let store = MemoryStore::with_records([record("a", temp.path())]);
        store.put(&record("b", temp.path())).unwrap();
        store.remove("a").unwrap();
        let ids: Vec<_> = store.load().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b"]);
    }
}
