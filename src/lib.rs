// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modelstash - Artifact download and lifecycle manager
//!
//! Fetches large model files, verifies them, remembers what is on disk and
//! decides which one is active.
//!
//! **Catalog** -> **Transfer** -> **Verify** -> **Registry** -> **Selection**
//!
//! # Core Modules
//!
//! - [`catalog`] - Static list of obtainable artifacts
//! - [`download`] - Streaming transfers with progress and cancellation
//! - [`integrity`] - SHA-256 verification
//! - [`registry`] - Durable records of downloaded artifacts
//! - [`selection`] - Active artifact resolution with fallback
//! - [`events`] - Lifecycle event subscriptions
//! - [`manager`] - Facade tying everything together
//! - [`config`] - Configuration file handling
//! - [`error`] - Error types

pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod integrity;
pub mod manager;
pub mod registry;
pub mod selection;
pub mod sync;

pub use catalog::{ArtifactKind, ManifestCatalog, ManifestEntry};
pub use config::Config;
pub use download::{TransferHandle, TransferOutcome, TransferState, TransferStatus};
pub use error::{ArtifactError, ArtifactResult, ErrorKind};
pub use events::{EventChannel, LifecycleEvent, SelectionReason, Subscription};
pub use integrity::IntegrityVerifier;
pub use manager::{ArtifactManager, ArtifactStatus, AvailableArtifact};
pub use registry::{ArtifactRegistry, DownloadedArtifact, ReconcileReport, RecordStore};
