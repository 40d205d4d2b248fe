// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for artifact operations.
//!
//! Every failure is locally recoverable: callers may retry after any error,
//! since a failed operation never leaves a partial file, a dangling transfer
//! or a registry record behind.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Result type for artifact operations.
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Errors that can occur while managing artifacts.
#[derive(Debug)]
pub enum ArtifactError {
    /// The id is not in the catalog, or has no active transfer to cancel.
    NotFound { id: String },

    /// A registry record exists and its file is present on disk.
    AlreadyDownloaded { id: String },

    /// A transfer for the id is already running.
    TransferInProgress { id: String },

    /// The downloaded bytes do not hash to the declared checksum.
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// Network, transport or filesystem failure during a transfer.
    Download { id: String, cause: String },

    /// The id has no valid local artifact.
    NotDownloaded { id: String },

    /// The registry already holds a record for the id.
    AlreadyExists { id: String },

    /// Reading or writing durable storage failed.
    Storage { path: PathBuf, source: io::Error },

    /// Invalid configuration or manifest.
    Config(String),
}

/// Discriminant of an [`ArtifactError`], carried by error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyDownloaded,
    TransferInProgress,
    ChecksumMismatch,
    DownloadError,
    NotDownloaded,
    AlreadyExists,
    Storage,
    Config,
}

impl ArtifactError {
    /// Build a download failure from any displayable cause.
    pub fn download(id: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Download {
            id: id.into(),
            cause: cause.to_string(),
        }
    }

    /// Build a storage failure for `path`.
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyDownloaded { .. } => ErrorKind::AlreadyDownloaded,
            Self::TransferInProgress { .. } => ErrorKind::TransferInProgress,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::Download { .. } => ErrorKind::DownloadError,
            Self::NotDownloaded { .. } => ErrorKind::NotDownloaded,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// A short actionable hint for the command line.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NotFound { .. } => Some("Run `modelstash list` to see known artifact ids"),
            Self::AlreadyDownloaded { .. } => {
                Some("Delete it first with `modelstash delete <id>` to download again")
            }
            Self::TransferInProgress { .. } => Some("Wait for the running transfer to finish"),
            Self::ChecksumMismatch { .. } | Self::Download { .. } => {
                Some("Retry the download; no partial file was kept")
            }
            Self::NotDownloaded { .. } => Some("Download it first with `modelstash download <id>`"),
            Self::AlreadyExists { .. } => Some("Run `modelstash validate` to reconcile the registry"),
            Self::Storage { .. } => Some("Check permissions and free space in the storage directory"),
            Self::Config(_) => Some("Check ~/.modelstash/config.json and the manifest file"),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::AlreadyDownloaded => "already_downloaded",
            Self::TransferInProgress => "transfer_in_progress",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::DownloadError => "download_error",
            Self::NotDownloaded => "not_downloaded",
            Self::AlreadyExists => "already_exists",
            Self::Storage => "storage",
            Self::Config => "config",
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "artifact not found: {}", id),
            Self::AlreadyDownloaded { id } => write!(f, "artifact {} is already downloaded", id),
            Self::TransferInProgress { id } => {
                write!(f, "a transfer for {} is already in progress", id)
            }
            Self::ChecksumMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch for {}: expected {}, got {}",
                id, expected, actual
            ),
            Self::Download { id, cause } => write!(f, "failed to download {}: {}", id, cause),
            Self::NotDownloaded { id } => write!(f, "artifact {} is not downloaded", id),
            Self::AlreadyExists { id } => write!(f, "a registry record for {} already exists", id),
            Self::Storage { path, source } => {
                write!(f, "storage error at {}: {}", path.display(), source)
            }
            Self::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ArtifactError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ArtifactError::NotFound {
            id: "whisper-small".to_string(),
        };
        assert_eq!(err.to_string(), "artifact not found: whisper-small");
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = ArtifactError::ChecksumMismatch {
            id: "m-small".to_string(),
            expected: "abc123".to_string(),
            actual: "zzz999".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("checksum mismatch"));
        assert!(msg.contains("abc123"));
        assert!(msg.contains("zzz999"));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ArtifactError::download("a", "connection reset").kind(),
            ErrorKind::DownloadError
        );
        assert_eq!(
            ArtifactError::TransferInProgress { id: "a".into() }.kind(),
            ErrorKind::TransferInProgress
        );
        assert_eq!(ArtifactError::Config("bad".into()).kind(), ErrorKind::Config);
    }

    #[test]
    fn test_storage_error_has_source() {
        use std::error::Error;
        let err = ArtifactError::storage(
            "/tmp/registry.json",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.source().is_some());
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_every_kind_has_hint() {
        let errors = [
            ArtifactError::NotFound { id: "a".into() },
            ArtifactError::NotDownloaded { id: "a".into() },
            ArtifactError::AlreadyExists { id: "a".into() },
        ];
        for err in errors {
            assert!(err.hint().is_some());
        }
    }
}
