// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable registry of downloaded artifacts.
//!
//! A record is only created once a transfer has completed and passed
//! verification. Records are not re-verified continuously; stale entries are
//! detected by [`ArtifactRegistry::validate_and_reconcile`].
//!
//! The registry keeps an in-memory index in front of a [`RecordStore`].
//! Readers copy what they need out of the index and never hold the lock
//! across a filesystem call. Store writes run on the blocking thread pool.

mod store;

pub use store::{JsonFileStore, MemoryStore, RecordStore};

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ArtifactKind;
use crate::error::{ArtifactError, ArtifactResult};
use crate::sync::{read_lock, write_lock};

/// A completed, locally stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadedArtifact {
    /// Catalog id
    pub id: String,
    /// Display name at download time
    pub name: String,
    /// Artifact kind
    pub kind: ArtifactKind,
    /// Absolute path of the file
    pub local_path: PathBuf,
    /// When the transfer completed
    pub downloaded_at: DateTime<Utc>,
    /// Size on disk at completion
    pub actual_size_bytes: u64,
    /// Lowercase hex SHA-256, if one was declared or computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records whose file is present
    pub valid: Vec<DownloadedArtifact>,
    /// Ids whose record was deleted because the file is gone
    pub removed: Vec<String>,
}

/// Id-keyed registry of downloaded artifacts.
pub struct ArtifactRegistry {
    store: Arc<dyn RecordStore>,
    records: RwLock<HashMap<String, DownloadedArtifact>>,
    /// Serializes check-then-write mutations against the store.
    mutation: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ArtifactRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRegistry")
            .field("records", &read_lock(&self.records).len())
            .finish()
    }
}

impl ArtifactRegistry {
    /// Open a registry, loading every record from `store`.
    pub fn open(store: Arc<dyn RecordStore>) -> ArtifactResult<Self> {
        let records: HashMap<_, _> = store
            .load()?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        tracing::debug!("Registry opened with {} records", records.len());
        Ok(Self {
            store,
            records: RwLock::new(records),
            mutation: tokio::sync::Mutex::new(()),
        })
    }

    /// A registry with no durable backing.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            records: RwLock::new(HashMap::new()),
            mutation: tokio::sync::Mutex::new(()),
        }
    }

    /// Run a store operation off the async worker threads.
    async fn with_store<T, F>(&self, op: F) -> ArtifactResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RecordStore) -> ArtifactResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| {
                ArtifactError::storage(
                    "registry",
                    io::Error::new(io::ErrorKind::Other, format!("store task failed: {}", e)),
                )
            })?
    }

    /// Persist a new record.
    ///
    /// Fails with `AlreadyExists` if the id already has a record.
    pub async fn create(&self, record: DownloadedArtifact) -> ArtifactResult<DownloadedArtifact> {
        let _mutation = self.mutation.lock().await;
        if read_lock(&self.records).contains_key(&record.id) {
            return Err(ArtifactError::AlreadyExists { id: record.id });
        }
        let stored = record.clone();
        self.with_store(move |store| store.put(&stored)).await?;
        write_lock(&self.records).insert(record.id.clone(), record.clone());
        tracing::info!(
            "Registered {} at {} ({} bytes)",
            record.id,
            record.local_path.display(),
            record.actual_size_bytes
        );
        Ok(record)
    }

    /// Delete the record for `id`, returning it if one existed.
    pub async fn delete(&self, id: &str) -> ArtifactResult<Option<DownloadedArtifact>> {
        let _mutation = self.mutation.lock().await;
        if !read_lock(&self.records).contains_key(id) {
            return Ok(None);
        }
        let key = id.to_string();
        self.with_store(move |store| store.remove(&key)).await?;
        Ok(write_lock(&self.records).remove(id))
    }

    /// Get a copy of the record for `id`.
    pub fn get(&self, id: &str) -> Option<DownloadedArtifact> {
        read_lock(&self.records).get(id).cloned()
    }

    /// Whether a record exists for `id`, regardless of its file.
    pub fn contains(&self, id: &str) -> bool {
        read_lock(&self.records).contains_key(id)
    }

    /// Snapshot of every record, sorted by id.
    pub fn list(&self) -> Vec<DownloadedArtifact> {
        let mut records: Vec<_> = read_lock(&self.records).values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// The record for `id` if its file is currently present.
    pub async fn valid_record(&self, id: &str) -> Option<DownloadedArtifact> {
        let record = self.get(id)?;
        match file_state(&record.local_path).await {
            FileState::Present => Some(record),
            FileState::Missing | FileState::Unknown(_) => None,
        }
    }

    /// Drop records whose backing file is missing.
    ///
    /// Idempotent: a second call with no filesystem changes removes nothing.
    /// Records that cannot be checked or deleted are logged and left for the
    /// next pass rather than failing the whole reconciliation.
    pub async fn validate_and_reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for record in self.list() {
            match file_state(&record.local_path).await {
                FileState::Present => report.valid.push(record),
                FileState::Unknown(e) => {
                    tracing::warn!(
                        "Could not stat {} for {}: {}; keeping record",
                        record.local_path.display(),
                        record.id,
                        e
                    );
                    report.valid.push(record);
                }
                FileState::Missing => match self.delete(&record.id).await {
                    Ok(_) => {
                        tracing::warn!(
                            "Removed registry record {}: {} no longer exists",
                            record.id,
                            record.local_path.display()
                        );
                        report.removed.push(record.id);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to remove stale record {}: {}", record.id, e);
                    }
                },
            }
        }

        report
    }
}

enum FileState {
    Present,
    Missing,
    Unknown(io::Error),
}

async fn file_state(path: &Path) -> FileState {
    match tokio::fs::metadata(path).await {
        Ok(_) => FileState::Present,
        Err(e) if e.kind() == io::ErrorKind::NotFound => FileState::Missing,
        Err(e) => FileState::Unknown(e),
    }
}
