// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Active artifact selection.
//!
//! The selected id lives for the process lifetime only. Whenever it is
//! missing or points at an artifact without a valid local file, the first
//! valid id in the preference order takes its place.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::catalog::{ArtifactKind, ManifestCatalog};
use crate::error::{ArtifactError, ArtifactResult};
use crate::events::{EventChannel, LifecycleEvent, SelectionReason};
use crate::registry::ArtifactRegistry;
use crate::sync::{read_lock, write_lock};

/// Attempts before giving up on a selection that keeps changing underneath us.
const MAX_RESOLVE_ATTEMPTS: usize = 4;

#[derive(Debug, Default)]
struct SelectionState {
    selected: Option<String>,
    /// Whether `cleared` was already published for the current empty state.
    announced_empty: bool,
}

/// Resolves which artifact is active.
#[derive(Debug)]
pub struct SelectionPolicy {
    registry: Arc<ArtifactRegistry>,
    events: EventChannel,
    preference_order: Vec<String>,
    state: RwLock<SelectionState>,
}

/// Preference order derived from a catalog: transcription models in catalog
/// order, which lists the highest quality first.
pub fn default_preference_order(catalog: &ManifestCatalog) -> Vec<String> {
    catalog
        .entries()
        .filter(|entry| entry.kind == ArtifactKind::Transcription)
        .map(|entry| entry.id.clone())
        .collect()
}

impl SelectionPolicy {
    pub fn new(
        registry: Arc<ArtifactRegistry>,
        events: EventChannel,
        preference_order: Vec<String>,
    ) -> Self {
        Self {
            registry,
            events,
            preference_order,
            state: RwLock::new(SelectionState::default()),
        }
    }

    pub fn preference_order(&self) -> &[String] {
        &self.preference_order
    }

    /// The currently selected id, valid or not.
    pub fn selected(&self) -> Option<String> {
        read_lock(&self.state).selected.clone()
    }

    /// Select `id` explicitly.
    ///
    /// Fails with `NotDownloaded` unless `id` has a valid local artifact.
    pub async fn set_selected(&self, id: &str) -> ArtifactResult<PathBuf> {
        let record = self
            .registry
            .valid_record(id)
            .await
            .ok_or_else(|| ArtifactError::NotDownloaded { id: id.to_string() })?;

        let old = {
            let mut state = write_lock(&self.state);
            state.announced_empty = false;
            state.selected.replace(id.to_string())
        };

        tracing::info!("Selected {}", id);
        self.events.publish(LifecycleEvent::SelectionChanged {
            old,
            new: Some(id.to_string()),
            reason: SelectionReason::Manual,
            path: Some(record.local_path.clone()),
        });
        Ok(record.local_path)
    }

    /// Path of the active artifact, falling back through the preference
    /// order when the selection is missing or invalid.
    pub async fn resolve_active_path(&self) -> Option<PathBuf> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let current = self.selected();

            if let Some(id) = &current {
                if let Some(record) = self.registry.valid_record(id).await {
                    return Some(record.local_path);
                }
            }

            let mut fallback = None;
            for id in &self.preference_order {
                if let Some(record) = self.registry.valid_record(id).await {
                    fallback = Some(record);
                    break;
                }
            }

            let event = {
                let mut state = write_lock(&self.state);
                if state.selected != current {
                    // Selection changed while we were checking files; re-evaluate.
                    continue;
                }
                match &fallback {
                    Some(record) => {
                        state.selected = Some(record.id.clone());
                        state.announced_empty = false;
                        Some(LifecycleEvent::SelectionChanged {
                            old: current.clone(),
                            new: Some(record.id.clone()),
                            reason: SelectionReason::AutoFallback,
                            path: Some(record.local_path.clone()),
                        })
                    }
                    None => {
                        state.selected = None;
                        if state.announced_empty {
                            None
                        } else {
                            state.announced_empty = true;
                            Some(LifecycleEvent::SelectionChanged {
                                old: current.clone(),
                                new: None,
                                reason: SelectionReason::Cleared,
                                path: None,
                            })
                        }
                    }
                }
            };

            match &fallback {
                Some(record) => tracing::info!(
                    "Selection fell back from {:?} to {}",
                    current,
                    record.id
                ),
                None if event.is_some() => {
                    tracing::warn!("No downloaded artifact available to select")
                }
                None => {}
            }
            if let Some(event) = event {
                self.events.publish(event);
            }
            return fallback.map(|record| record.local_path);
        }

        tracing::warn!("Selection kept changing during resolution; giving up");
        None
    }

    /// React to the removal of `id`: re-resolve immediately if it was selected.
    pub async fn on_deleted(&self, id: &str) -> Option<PathBuf> {
        if self.selected().as_deref() == Some(id) {
            self.resolve_active_path().await
        } else {
            None
        }
    }
}
