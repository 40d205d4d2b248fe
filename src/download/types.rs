// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer types shared by the coordinator and its consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::DownloadedArtifact;

/// Status of an in-flight transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Bytes are flowing
    Downloading,
    /// Cancellation was requested; the task is winding down
    Cancelling,
}

/// Snapshot of one in-flight transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferState {
    /// Artifact being transferred
    pub artifact_id: String,
    /// Current status
    pub status: TransferStatus,
    /// Bytes written to disk so far
    pub bytes_downloaded: u64,
    /// Response length, or the manifest estimate when the server sent none
    pub total_bytes: u64,
    /// `floor(bytes_downloaded * 100 / total_bytes)`, clamped to 0..=100
    pub progress_percent: u8,
    /// Average throughput since the transfer started
    pub speed_bps: Option<u64>,
    /// Estimated seconds remaining at the average speed
    pub eta_seconds: Option<u64>,
    /// When the transfer was registered
    pub started_at: DateTime<Utc>,
}

impl TransferState {
    /// A fresh transfer with nothing written yet.
    pub fn new(artifact_id: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            status: TransferStatus::Downloading,
            bytes_downloaded: 0,
            total_bytes,
            progress_percent: 0,
            speed_bps: None,
            eta_seconds: None,
            started_at: Utc::now(),
        }
    }

    /// Record the running byte count and refresh the derived fields.
    pub fn record_bytes(&mut self, bytes_downloaded: u64, elapsed_secs: f64) {
        self.bytes_downloaded = bytes_downloaded;
        self.progress_percent = percent_of(bytes_downloaded, self.total_bytes);

        if elapsed_secs > 0.0 {
            let speed = (bytes_downloaded as f64 / elapsed_secs) as u64;
            self.speed_bps = Some(speed);
            self.eta_seconds = if speed > 0 && self.total_bytes > 0 {
                Some(self.total_bytes.saturating_sub(bytes_downloaded) / speed)
            } else {
                None
            };
        }
    }

    /// Get formatted speed string.
    pub fn speed_string(&self) -> Option<String> {
        self.speed_bps.map(|bps| {
            if bps >= 1_073_741_824 {
                format!("{:.1} GB/s", bps as f64 / 1_073_741_824.0)
            } else if bps >= 1_048_576 {
                format!("{:.1} MB/s", bps as f64 / 1_048_576.0)
            } else if bps >= 1024 {
                format!("{:.1} KB/s", bps as f64 / 1024.0)
            } else {
                format!("{} B/s", bps)
            }
        })
    }

    /// Get formatted ETA string.
    pub fn eta_string(&self) -> Option<String> {
        self.eta_seconds.map(|secs| {
            if secs >= 3600 {
                format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
            } else if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        })
    }
}

/// Integer percentage of `bytes` over `total`, clamped to 0..=100.
///
/// An unknown (zero) total always yields 0.
pub fn percent_of(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (bytes as u128 * 100) / total as u128;
    percent.min(100) as u8
}

/// Terminal outcome of a transfer that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// Verified and registered
    Completed(DownloadedArtifact),
    /// Stopped by `cancel_download`; nothing was kept
    Cancelled,
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The registered artifact, if the transfer completed.
    pub fn artifact(&self) -> Option<&DownloadedArtifact> {
        match self {
            Self::Completed(artifact) => Some(artifact),
            Self::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_floor_and_clamp() {
        assert_eq!(percent_of(0, 100), 0);
        assert_eq!(percent_of(199, 1000), 19);
        assert_eq!(percent_of(1000, 1000), 100);
        assert_eq!(percent_of(5000, 1000), 100);
        assert_eq!(percent_of(10, 0), 0);
        assert_eq!(percent_of(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn test_record_bytes_updates_speed_and_eta() {
        let mut state = TransferState::new("whisper-small", 1000);
        state.record_bytes(250, 1.0);
        assert_eq!(state.progress_percent, 25);
        assert_eq!(state.speed_bps, Some(250));
        assert_eq!(state.eta_seconds, Some(3));
    }

    #[test]
    fn test_record_bytes_without_elapsed_time() {
        let mut state = TransferState::new("whisper-small", 1000);
        state.record_bytes(10, 0.0);
        assert_eq!(state.progress_percent, 1);
        assert!(state.speed_bps.is_none());
        assert!(state.eta_seconds.is_none());
    }

    #[test]
    fn test_speed_string() {
        let mut state = TransferState::new("a", 0);
        state.speed_bps = Some(500);
        assert_eq!(state.speed_string(), Some("500 B/s".to_string()));

        state.speed_bps = Some(1536);
        assert_eq!(state.speed_string(), Some("1.5 KB/s".to_string()));

        state.speed_bps = Some(1_572_864);
        assert_eq!(state.speed_string(), Some("1.5 MB/s".to_string()));
    }

    #[test]
    fn test_eta_string() {
        let mut state = TransferState::new("a", 0);
        state.eta_seconds = Some(30);
        assert_eq!(state.eta_string(), Some("30s".to_string()));

        state.eta_seconds = Some(90);
        assert_eq!(state.eta_string(), Some("1m 30s".to_string()));

        state.eta_seconds = Some(3665);
        assert_eq!(state.eta_string(), Some("1h 1m".to_string()));
    }
}
