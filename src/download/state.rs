// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory table of active transfers.
//!
//! The table holds at most one entry per artifact id. Each transfer task owns
//! a [`TransferGuard`] that removes its entry when dropped, on every exit path
//! including panics. Entries carry a generation number so a guard never
//! removes a newer transfer of the same id that was started after a cancel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;

use super::types::{TransferState, TransferStatus};
use crate::error::{ArtifactError, ArtifactResult};
use crate::sync::{read_lock, write_lock};

/// Cooperative cancellation signal shared between a transfer and its table entry.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<FlagInner>,
}

#[derive(Debug, Default)]
struct FlagInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct TransferEntry {
    generation: u64,
    state: TransferState,
    flag: CancellationFlag,
    /// Set once the transfer is registering its record; no longer cancellable.
    committing: bool,
}

/// Id-keyed table of in-flight transfers.
#[derive(Debug, Default)]
pub struct TransferTable {
    entries: RwLock<HashMap<String, TransferEntry>>,
    next_generation: AtomicU64,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer for `state.artifact_id`.
    ///
    /// Fails with `TransferInProgress` if the id already has an entry.
    pub fn register(self: &Arc<Self>, state: TransferState) -> ArtifactResult<TransferGuard> {
        let id = state.artifact_id.clone();
        let mut entries = write_lock(&self.entries);
        if entries.contains_key(&id) {
            return Err(ArtifactError::TransferInProgress { id });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let flag = CancellationFlag::new();
        entries.insert(
            id.clone(),
            TransferEntry {
                generation,
                state,
                flag: flag.clone(),
                committing: false,
            },
        );

        Ok(TransferGuard {
            table: Arc::clone(self),
            id,
            generation,
            flag,
        })
    }

    /// Mark the transfer cancelling, signal it and drop it from the table.
    ///
    /// Returns the final state, or `NotFound` if nothing cancellable is
    /// running for `id`. A transfer that is already registering its record
    /// counts as finished.
    pub fn cancel(&self, id: &str) -> ArtifactResult<TransferState> {
        let mut entries = write_lock(&self.entries);
        let cancellable = entries
            .get(id)
            .map(|entry| !entry.committing)
            .unwrap_or(false);
        if !cancellable {
            return Err(ArtifactError::NotFound { id: id.to_string() });
        }

        let mut entry = match entries.remove(id) {
            Some(entry) => entry,
            None => return Err(ArtifactError::NotFound { id: id.to_string() }),
        };
        drop(entries);

        entry.state.status = TransferStatus::Cancelling;
        entry.flag.cancel();
        Ok(entry.state)
    }

    pub fn contains(&self, id: &str) -> bool {
        read_lock(&self.entries).contains_key(id)
    }

    /// Copy of the state for `id`.
    pub fn get(&self, id: &str) -> Option<TransferState> {
        read_lock(&self.entries).get(id).map(|entry| entry.state.clone())
    }

    /// Copy of every active state, sorted by id.
    pub fn snapshot(&self) -> Vec<TransferState> {
        let mut states: Vec<_> = read_lock(&self.entries)
            .values()
            .map(|entry| entry.state.clone())
            .collect();
        states.sort_by(|a, b| a.artifact_id.cmp(&b.artifact_id));
        states
    }

    pub fn len(&self) -> usize {
        read_lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.entries).is_empty()
    }

    fn update(&self, id: &str, generation: u64, apply: impl FnOnce(&mut TransferState)) {
        if let Some(entry) = write_lock(&self.entries).get_mut(id) {
            if entry.generation == generation {
                apply(&mut entry.state);
            }
        }
    }

    fn release(&self, id: &str, generation: u64) {
        let mut entries = write_lock(&self.entries);
        if entries.get(id).map(|entry| entry.generation) == Some(generation) {
            entries.remove(id);
        }
    }
}

/// Scoped ownership of one table entry.
#[derive(Debug)]
pub struct TransferGuard {
    table: Arc<TransferTable>,
    id: String,
    generation: u64,
    flag: CancellationFlag,
}

impl TransferGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn flag(&self) -> &CancellationFlag {
        &self.flag
    }

    /// Update this transfer's state if it is still the registered one.
    pub fn update(&self, apply: impl FnOnce(&mut TransferState)) {
        self.table.update(&self.id, self.generation, apply);
    }

    /// Claim the entry for registration.
    ///
    /// Returns `false` if the transfer was cancelled first. After a successful
    /// claim, `cancel` reports the id as not found.
    pub fn try_commit(&self) -> bool {
        let mut entries = write_lock(&self.table.entries);
        match entries.get_mut(&self.id) {
            Some(entry) if entry.generation == self.generation => {
                entry.committing = true;
                true
            }
            _ => false,
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.table.release(&self.id, self.generation);
    }
}
