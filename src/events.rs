// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lifecycle event fan-out.
//!
//! Publishing is fire-and-forget. Each subscriber owns an unbounded queue, so
//! a slow or dropped subscriber never blocks the publisher or its peers.
//! Events from a single publisher reach every subscriber in publish order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::download::TransferState;
use crate::error::ErrorKind;
use crate::registry::DownloadedArtifact;
use crate::sync::{read_lock, write_lock};

/// Why the selected artifact changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionReason {
    /// The user picked it
    Manual,
    /// The previous selection was invalid and the next best was chosen
    AutoFallback,
    /// Nothing valid is left to select
    Cleared,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::AutoFallback => f.write_str("auto-fallback"),
            Self::Cleared => f.write_str("cleared"),
        }
    }
}

/// Event published over the [`EventChannel`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Progress {
        id: String,
        state: TransferState,
    },
    Completed {
        id: String,
        artifact: DownloadedArtifact,
    },
    Error {
        id: String,
        kind: ErrorKind,
        cause: String,
    },
    Cancelled {
        id: String,
    },
    Deleted {
        id: String,
    },
    SelectionChanged {
        old: Option<String>,
        new: Option<String>,
        reason: SelectionReason,
        /// Path of the newly selected artifact, if any
        path: Option<PathBuf>,
    },
}

impl LifecycleEvent {
    /// The artifact id this event concerns, if it concerns exactly one.
    pub fn artifact_id(&self) -> Option<&str> {
        match self {
            Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Error { id, .. }
            | Self::Cancelled { id }
            | Self::Deleted { id } => Some(id),
            Self::SelectionChanged { .. } => None,
        }
    }

    /// Whether this event ends a transfer.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }
}

type Subscribers = RwLock<BTreeMap<u64, mpsc::UnboundedSender<LifecycleEvent>>>;

#[derive(Debug, Default)]
struct ChannelInner {
    next_id: AtomicU64,
    subscribers: Subscribers,
}

/// Multi-subscriber publisher of [`LifecycleEvent`]s.
///
/// Cloning yields another handle to the same channel.
#[derive(Debug, Clone, Default)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        write_lock(&self.inner.subscribers).insert(id, tx);
        tracing::debug!("Event subscriber {} registered", id);
        Subscription {
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: LifecycleEvent) {
        let senders: Vec<_> = read_lock(&self.inner.subscribers)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, tx) in senders {
            if tx.send(event.clone()).is_err() {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            let mut subscribers = write_lock(&self.inner.subscribers);
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        read_lock(&self.inner.subscribers).len()
    }
}

/// Receiving end of a subscription.
///
/// Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    channel: std::sync::Weak<ChannelInner>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving new events. Already queued events stay readable.
    pub fn unsubscribe(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            if write_lock(&inner.subscribers).remove(&self.id).is_some() {
                tracing::debug!("Event subscriber {} removed", self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
