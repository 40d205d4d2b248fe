// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Consumer-facing facade over the catalog, registry, coordinator and
//! selection policy.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{ManifestCatalog, ManifestEntry};
use crate::config::Config;
use crate::download::{DownloadCoordinator, TransferHandle, TransferSettings, TransferState};
use crate::error::{ArtifactError, ArtifactResult};
use crate::events::{EventChannel, LifecycleEvent, Subscription};
use crate::integrity::IntegrityVerifier;
use crate::registry::{ArtifactRegistry, DownloadedArtifact, JsonFileStore, ReconcileReport};
use crate::selection::{default_preference_order, SelectionPolicy};

/// Local status of a catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Available,
    Downloading { percent: u8 },
    Downloaded,
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => f.write_str("available"),
            Self::Downloading { percent } => write!(f, "downloading {}%", percent),
            Self::Downloaded => f.write_str("downloaded"),
        }
    }
}

/// A catalog entry with its local status.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AvailableArtifact {
    #[serde(flatten)]
    pub entry: ManifestEntry,
    #[serde(flatten)]
    pub status: ArtifactStatus,
}

/// Owns every component. Construct one per process and share it by reference
/// or `Arc`.
#[derive(Debug)]
pub struct ArtifactManager {
    catalog: Arc<ManifestCatalog>,
    registry: Arc<ArtifactRegistry>,
    events: EventChannel,
    coordinator: DownloadCoordinator,
    selection: SelectionPolicy,
    verifier: IntegrityVerifier,
}

impl ArtifactManager {
    /// Build a manager from configuration and reconcile the registry once.
    pub async fn open(config: &Config) -> ArtifactResult<Self> {
        let storage_dir = config.storage_dir()?;
        tokio::fs::create_dir_all(&storage_dir)
            .await
            .map_err(|e| ArtifactError::storage(&storage_dir, e))?;

        let catalog = config.catalog()?;
        let registry =
            ArtifactRegistry::open(Arc::new(JsonFileStore::new(config.registry_path()?)))?;

        let manager = Self::new(
            catalog,
            registry,
            storage_dir,
            config.transfer_settings(),
            config.preference_order.clone(),
        )?;

        let report = manager.validate().await;
        tracing::info!(
            "Artifact manager ready: {} downloaded, {} stale records removed",
            report.valid.len(),
            report.removed.len()
        );
        Ok(manager)
    }

    /// Assemble a manager from already-built parts without touching the
    /// filesystem.
    pub fn new(
        catalog: ManifestCatalog,
        registry: ArtifactRegistry,
        storage_dir: impl Into<PathBuf>,
        settings: TransferSettings,
        preference_order: Option<Vec<String>>,
    ) -> ArtifactResult<Self> {
        let preference_order =
            preference_order.unwrap_or_else(|| default_preference_order(&catalog));
        let catalog = Arc::new(catalog);
        let registry = Arc::new(registry);
        let events = EventChannel::new();

        let coordinator = DownloadCoordinator::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            events.clone(),
            storage_dir,
            settings,
        )?;
        let selection =
            SelectionPolicy::new(Arc::clone(&registry), events.clone(), preference_order);

        Ok(Self {
            catalog,
            registry,
            events,
            coordinator,
            selection,
            verifier: IntegrityVerifier::new(),
        })
    }

    pub fn catalog(&self) -> &ManifestCatalog {
        &self.catalog
    }

    pub fn storage_dir(&self) -> &std::path::Path {
        self.coordinator.storage_dir()
    }

    /// Start a background download of `id`.
    pub async fn start_download(&self, id: &str) -> ArtifactResult<TransferHandle> {
        self.coordinator.start_download(id).await
    }

    /// Cancel the running download of `id`.
    pub fn cancel_download(&self, id: &str) -> ArtifactResult<()> {
        self.coordinator.cancel_download(id)
    }

    /// Remove a downloaded artifact and its record.
    ///
    /// A file that is already gone is tolerated. If the artifact was selected,
    /// the selection falls back immediately.
    pub async fn delete_artifact(&self, id: &str) -> ArtifactResult<DownloadedArtifact> {
        if self.coordinator.is_downloading(id) {
            return Err(ArtifactError::TransferInProgress { id: id.to_string() });
        }
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| ArtifactError::NotDownloaded { id: id.to_string() })?;

        match tokio::fs::remove_file(&record.local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} was already missing", record.local_path.display());
            }
            Err(e) => return Err(ArtifactError::storage(&record.local_path, e)),
        }
        self.registry.delete(id).await?;

        tracing::info!("Deleted {}", id);
        self.events
            .publish(LifecycleEvent::Deleted { id: id.to_string() });
        self.selection.on_deleted(id).await;
        Ok(record)
    }

    /// Select `id` as the active artifact.
    pub async fn set_selected(&self, id: &str) -> ArtifactResult<PathBuf> {
        self.selection.set_selected(id).await
    }

    /// The selected id, without validating it.
    pub fn selected(&self) -> Option<String> {
        self.selection.selected()
    }

    /// Path of the active artifact, applying the fallback rules.
    pub async fn resolve_active_path(&self) -> Option<PathBuf> {
        self.selection.resolve_active_path().await
    }

    /// Every registry record, sorted by id.
    pub fn list_downloaded(&self) -> Vec<DownloadedArtifact> {
        self.registry.list()
    }

    /// Every catalog entry with its local status, in catalog order.
    pub async fn list_available(&self) -> Vec<AvailableArtifact> {
        let mut available = Vec::with_capacity(self.catalog.len());
        for entry in self.catalog.entries() {
            let status = if let Some(state) = self.coordinator.transfer_state(&entry.id) {
                ArtifactStatus::Downloading {
                    percent: state.progress_percent,
                }
            } else if self.registry.valid_record(&entry.id).await.is_some() {
                ArtifactStatus::Downloaded
            } else {
                ArtifactStatus::Available
            };
            available.push(AvailableArtifact {
                entry: entry.clone(),
                status,
            });
        }
        available
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Snapshot of in-flight transfers.
    pub fn active_transfers(&self) -> Vec<TransferState> {
        self.coordinator.active_transfers()
    }

    /// Drop registry records whose files are gone.
    pub async fn validate(&self) -> ReconcileReport {
        self.registry.validate_and_reconcile().await
    }

    /// Re-hash a downloaded artifact and compare it to its recorded checksum.
    ///
    /// Records without a checksum are reported as intact.
    pub async fn verify_artifact(&self, id: &str) -> ArtifactResult<bool> {
        let record = self
            .registry
            .valid_record(id)
            .await
            .ok_or_else(|| ArtifactError::NotDownloaded { id: id.to_string() })?;
        match &record.checksum {
            Some(expected) => self.verifier.verify(&record.local_path, expected).await,
            None => Ok(true),
        }
    }
}
