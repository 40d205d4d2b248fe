// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Artifact transfers.
//!
//! This module streams artifacts from their download URL into the storage
//! directory with:
//! - One concurrent transfer per artifact id
//! - Throttled progress events
//! - Cooperative cancellation that never leaves a partial file behind
//! - Checksum verification before a record is created
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐     ┌─────────────────┐
//! │ DownloadCoordinator │────▶│ TransferJob     │
//! │                     │     │ (tokio task)    │
//! └──────────┬──────────┘     └────────┬────────┘
//!            │                         │
//!            ▼                         ▼
//! ┌─────────────────────┐     ┌─────────────────┐
//! │ TransferTable       │     │ Integrity +     │
//! │ (in-memory)         │     │ Registry        │
//! └─────────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use modelstash::{ArtifactManager, Config};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = ArtifactManager::open(&Config::load()?).await?;
//!
//! let handle = manager.start_download("whisper-small").await?;
//! let outcome = handle.wait().await?;
//! println!("Finished: {:?}", outcome.artifact().map(|a| &a.local_path));
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod progress;
pub mod state;
pub mod types;

pub use coordinator::{DownloadCoordinator, TransferHandle, TransferSettings};
pub use progress::ProgressThrottle;
pub use state::{CancellationFlag, TransferGuard, TransferTable};
pub use types::{percent_of, TransferOutcome, TransferState, TransferStatus};
