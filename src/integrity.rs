// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SHA-256 verification of completed downloads.
//!
//! This is advisory integrity: it catches truncated or corrupted transfers,
//! it is not a trust boundary. The algorithm is fixed for every artifact.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{ArtifactError, ArtifactResult};

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Buffer size for reading files during hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Streaming checksum calculator and verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Calculate the lowercase hex SHA-256 of a file.
    pub async fn compute(&self, path: &Path) -> ArtifactResult<String> {
        let mut file = File::open(path)
            .await
            .map_err(|e| ArtifactError::storage(path, e))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            let bytes_read = file
                .read(&mut buffer)
                .await
                .map_err(|e| ArtifactError::storage(path, e))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Check a file against an expected lowercase hex digest.
    ///
    /// Comparison is exact string equality; a wrong-case or truncated
    /// expectation never matches.
    pub async fn verify(&self, path: &Path, expected: &str) -> ArtifactResult<bool> {
        let actual = self.compute(path).await?;
        Ok(actual == expected)
    }
}
