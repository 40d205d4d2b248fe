// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streaming transfer coordinator.
//!
//! Each transfer runs on its own tokio task. The task streams the response
//! body into `<storage_dir>/<target_filename>`, publishes throttled progress,
//! verifies the declared checksum and finally registers the artifact. Any
//! failure or cancellation deletes the partial file before the terminal event
//! is published.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use super::progress::{ProgressThrottle, DEFAULT_BYTE_STEP, DEFAULT_PERCENT_STEP};
use super::state::{TransferGuard, TransferTable};
use super::types::{TransferOutcome, TransferState};
use crate::catalog::{ManifestCatalog, ManifestEntry};
use crate::error::{ArtifactError, ArtifactResult};
use crate::events::{EventChannel, LifecycleEvent};
use crate::integrity::IntegrityVerifier;
use crate::registry::{ArtifactRegistry, DownloadedArtifact};

/// Default HTTP connect timeout. Transfers themselves have no deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("modelstash/", env!("CARGO_PKG_VERSION"));

/// Tunables for transfers.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub connect_timeout: Duration,
    pub percent_step: u8,
    pub byte_step: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            percent_step: DEFAULT_PERCENT_STEP,
            byte_step: DEFAULT_BYTE_STEP,
        }
    }
}

/// Handle to a running transfer.
///
/// Dropping the handle detaches it; the transfer keeps running.
#[derive(Debug)]
pub struct TransferHandle {
    id: String,
    task: JoinHandle<ArtifactResult<TransferOutcome>>,
}

impl TransferHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the transfer task has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal outcome.
    pub async fn wait(self) -> ArtifactResult<TransferOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ArtifactError::download(
                self.id,
                format!("transfer task aborted: {}", e),
            )),
        }
    }
}

/// Starts, tracks and cancels transfers.
pub struct DownloadCoordinator {
    catalog: Arc<ManifestCatalog>,
    registry: Arc<ArtifactRegistry>,
    events: EventChannel,
    transfers: Arc<TransferTable>,
    client: reqwest::Client,
    verifier: IntegrityVerifier,
    storage_dir: PathBuf,
    settings: TransferSettings,
    /// Serializes file access per id so a restarted transfer never races the
    /// cleanup of the one it replaced.
    file_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("storage_dir", &self.storage_dir)
            .field("active", &self.transfers.len())
            .finish()
    }
}

impl DownloadCoordinator {
    /// Create a coordinator writing into `storage_dir`.
    pub fn new(
        catalog: Arc<ManifestCatalog>,
        registry: Arc<ArtifactRegistry>,
        events: EventChannel,
        storage_dir: impl Into<PathBuf>,
        settings: TransferSettings,
    ) -> ArtifactResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ArtifactError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            catalog,
            registry,
            events,
            transfers: Arc::new(TransferTable::new()),
            client,
            verifier: IntegrityVerifier::new(),
            storage_dir: storage_dir.into(),
            settings,
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Where `entry` is written.
    pub fn target_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.storage_dir.join(&entry.target_filename)
    }

    /// Start downloading `id` in the background.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the catalog has no such id
    /// - `AlreadyDownloaded` if a valid local copy exists
    /// - `TransferInProgress` if a transfer for `id` is already running
    pub async fn start_download(&self, id: &str) -> ArtifactResult<TransferHandle> {
        let entry = self
            .catalog
            .get(id)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound { id: id.to_string() })?;

        if self.registry.valid_record(id).await.is_some() {
            return Err(ArtifactError::AlreadyDownloaded { id: id.to_string() });
        }
        if self.transfers.contains(id) {
            return Err(ArtifactError::TransferInProgress { id: id.to_string() });
        }
        if self.registry.contains(id) {
            // Record without a file; it would block registration at the end.
            tracing::warn!("Dropping stale registry record for {} before download", id);
            self.registry.delete(id).await?;
        }

        let guard = self
            .transfers
            .register(TransferState::new(id, entry.declared_size_bytes))?;

        let job = TransferJob {
            path: self.target_path(&entry),
            storage_dir: self.storage_dir.clone(),
            entry,
            guard,
            file_lock: self.file_lock(id),
            client: self.client.clone(),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            verifier: self.verifier,
            throttle: ProgressThrottle::new(self.settings.percent_step, self.settings.byte_step),
        };

        tracing::info!("Starting download of {} from {}", id, job.entry.download_url);
        let task = tokio::spawn(job.run());

        Ok(TransferHandle {
            id: id.to_string(),
            task,
        })
    }

    /// Cancel the running transfer for `id`.
    ///
    /// The state is removed immediately; the task deletes its partial file and
    /// then publishes `cancelled`.
    pub fn cancel_download(&self, id: &str) -> ArtifactResult<()> {
        let state = self.transfers.cancel(id)?;
        tracing::info!(
            "Cancelling download of {} at {} bytes",
            id,
            state.bytes_downloaded
        );
        Ok(())
    }

    /// Snapshot of all in-flight transfers.
    pub fn active_transfers(&self) -> Vec<TransferState> {
        self.transfers.snapshot()
    }

    /// Current state of the transfer for `id`, if one is running.
    pub fn transfer_state(&self, id: &str) -> Option<TransferState> {
        self.transfers.get(id)
    }

    pub fn is_downloading(&self, id: &str) -> bool {
        self.transfers.contains(id)
    }

    fn file_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .file_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}

/// Why a transfer stopped without completing.
enum Interrupt {
    Cancelled,
    Failed(ArtifactError),
}

impl From<ArtifactError> for Interrupt {
    fn from(err: ArtifactError) -> Self {
        Interrupt::Failed(err)
    }
}

/// Everything one transfer task owns.
struct TransferJob {
    entry: ManifestEntry,
    path: PathBuf,
    storage_dir: PathBuf,
    guard: TransferGuard,
    file_lock: Arc<tokio::sync::Mutex<()>>,
    client: reqwest::Client,
    registry: Arc<ArtifactRegistry>,
    events: EventChannel,
    verifier: IntegrityVerifier,
    throttle: ProgressThrottle,
}

impl TransferJob {
    async fn run(mut self) -> ArtifactResult<TransferOutcome> {
        let file_lock = Arc::clone(&self.file_lock);
        let _file_guard = file_lock.lock().await;

        let id = self.entry.id.clone();
        let result = self.execute().await;

        let (event, outcome) = match result {
            Ok(artifact) => {
                tracing::info!(
                    "Completed download of {} ({} bytes)",
                    id,
                    artifact.actual_size_bytes
                );
                (
                    LifecycleEvent::Completed {
                        id: id.clone(),
                        artifact: artifact.clone(),
                    },
                    Ok(TransferOutcome::Completed(artifact)),
                )
            }
            Err(Interrupt::Cancelled) => {
                remove_partial(&self.path).await;
                tracing::info!("Download of {} cancelled", id);
                (
                    LifecycleEvent::Cancelled { id: id.clone() },
                    Ok(TransferOutcome::Cancelled),
                )
            }
            Err(Interrupt::Failed(err)) => {
                remove_partial(&self.path).await;
                tracing::warn!("Download of {} failed: {}", id, err);
                (
                    LifecycleEvent::Error {
                        id: id.clone(),
                        kind: err.kind(),
                        cause: err.to_string(),
                    },
                    Err(err),
                )
            }
        };

        // Release the table entry before announcing the terminal state.
        let events = self.events.clone();
        drop(self);
        events.publish(event);
        outcome
    }

    async fn execute(&mut self) -> Result<DownloadedArtifact, Interrupt> {
        let flag = self.guard.flag().clone();

        let mut state = match self.stream_to_disk().await {
            Ok(state) => state,
            // An error surfacing after a cancel request is the cancellation.
            Err(Interrupt::Failed(_)) if flag.is_cancelled() => return Err(Interrupt::Cancelled),
            Err(interrupt) => return Err(interrupt),
        };

        let digest = tokio::select! {
            biased;
            _ = flag.cancelled() => return Err(Interrupt::Cancelled),
            digest = self.verifier.compute(&self.path) => digest,
        };
        let actual = digest.map_err(|e| ArtifactError::download(&self.entry.id, e))?;
        if let Some(expected) = &self.entry.checksum {
            if &actual != expected {
                return Err(ArtifactError::ChecksumMismatch {
                    id: self.entry.id.clone(),
                    expected: expected.clone(),
                    actual,
                }
                .into());
            }
            tracing::debug!("Checksum verified for {}", self.entry.id);
        }

        if self.throttle.last_percent().unwrap_or(0) < 100 {
            state.progress_percent = 100;
            state.eta_seconds = Some(0);
            self.guard.update(|entry| entry.clone_from(&state));
            self.publish_progress(state.clone());
        }

        if !self.guard.try_commit() {
            return Err(Interrupt::Cancelled);
        }

        let local_path = tokio::fs::canonicalize(&self.path)
            .await
            .map_err(|e| ArtifactError::download(&self.entry.id, e))?;
        let actual_size_bytes = tokio::fs::metadata(&local_path)
            .await
            .map_err(|e| ArtifactError::download(&self.entry.id, e))?
            .len();

        let record = DownloadedArtifact {
            id: self.entry.id.clone(),
            name: self.entry.name.clone(),
            kind: self.entry.kind,
            local_path,
            downloaded_at: Utc::now(),
            actual_size_bytes,
            checksum: Some(actual),
        };
        Ok(self.registry.create(record).await?)
    }

    /// Stream the response body to disk, returning the final transfer state.
    ///
    /// Only network waits race the cancellation signal; file operations are
    /// always allowed to finish so the partial file can be cleaned up.
    async fn stream_to_disk(&mut self) -> Result<TransferState, Interrupt> {
        let id = self.entry.id.clone();
        let flag = self.guard.flag().clone();

        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| ArtifactError::download(&id, e))?;

        let response = tokio::select! {
            biased;
            _ = flag.cancelled() => return Err(Interrupt::Cancelled),
            response = self.client.get(&self.entry.download_url).send() => response
                .map_err(|e| ArtifactError::download(&id, describe_request_error(&e)))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ArtifactError::download(
                &id,
                format!("server responded with HTTP {}", status),
            )
            .into());
        }

        let content_length = response.content_length();
        let total = content_length.unwrap_or(self.entry.declared_size_bytes);
        let mut state = TransferState::new(&id, total);
        self.guard.update(|entry| entry.total_bytes = total);

        let mut file = File::create(&self.path)
            .await
            .map_err(|e| ArtifactError::download(&id, e))?;

        let started = Instant::now();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = flag.cancelled() => break,
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };

            let chunk =
                chunk.map_err(|e| ArtifactError::download(&id, describe_request_error(&e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ArtifactError::download(&id, e))?;
            written += chunk.len() as u64;

            state.record_bytes(written, started.elapsed().as_secs_f64());
            self.guard.update(|entry| entry.clone_from(&state));

            if self.throttle.should_publish(state.progress_percent, written) {
                tracing::debug!(
                    "{}: {}% ({}/{} bytes)",
                    id,
                    state.progress_percent,
                    written,
                    total
                );
                self.publish_progress(state.clone());
            }
        }

        file.flush().await.map_err(|e| ArtifactError::download(&id, e))?;
        file.sync_all()
            .await
            .map_err(|e| ArtifactError::download(&id, e))?;
        drop(file);

        if flag.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        if let Some(expected) = content_length {
            if written != expected {
                return Err(ArtifactError::download(
                    &id,
                    format!(
                        "response body ended early: expected {} bytes, received {}",
                        expected, written
                    ),
                )
                .into());
            }
        }

        Ok(state)
    }

    fn publish_progress(&self, state: TransferState) {
        self.events.publish(LifecycleEvent::Progress {
            id: self.entry.id.clone(),
            state,
        });
    }
}

fn describe_request_error(e: &reqwest::Error) -> String {
    if e.is_connect() {
        format!("cannot connect to server: {}", e)
    } else if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_body() || e.is_decode() {
        format!("response body interrupted: {}", e)
    } else {
        e.to_string()
    }
}

/// Delete a partial file, tolerating its absence.
async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial file {}: {}", path.display(), e),
    }
}
