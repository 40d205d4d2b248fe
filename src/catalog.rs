// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Static catalog of obtainable artifacts.
//!
//! The catalog is loaded once at startup, either from the built-in list or
//! from a JSON manifest file, and is never mutated afterwards.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ArtifactError, ArtifactResult};

/// Kind of artifact, recorded as the `kind` of a downloaded artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// Speech-to-text model weights.
    Transcription,
    /// Voice activity detection model.
    Vad,
    /// Text post-processing language model.
    Polish,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transcription => f.write_str("transcription"),
            Self::Vad => f.write_str("vad"),
            Self::Polish => f.write_str("polish"),
        }
    }
}

/// One obtainable artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Stable unique id (e.g., "whisper-small")
    pub id: String,
    /// Display name
    pub name: String,
    /// Artifact kind
    pub kind: ArtifactKind,
    /// Size estimate used when the server sends no Content-Length
    pub declared_size_bytes: u64,
    /// Where to fetch the bytes from
    pub download_url: String,
    /// File name inside the storage directory
    pub target_filename: String,
    /// Lowercase hex SHA-256 of the file, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ManifestEntry {
    /// Create an entry without a checksum.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: ArtifactKind,
        declared_size_bytes: u64,
        download_url: impl Into<String>,
        target_filename: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            declared_size_bytes,
            download_url: download_url.into(),
            target_filename: target_filename.into(),
            checksum: None,
        }
    }

    /// Attach a checksum.
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    fn validate(&self) -> ArtifactResult<()> {
        if self.id.trim().is_empty() {
            return Err(ArtifactError::Config("manifest entry with empty id".into()));
        }
        if self.download_url.trim().is_empty() {
            return Err(ArtifactError::Config(format!(
                "manifest entry {} has no download url",
                self.id
            )));
        }
        // The target must stay inside the storage directory.
        let plain_name = Path::new(&self.target_filename)
            .file_name()
            .map(|name| name == self.target_filename.as_str())
            .unwrap_or(false);
        if !plain_name {
            return Err(ArtifactError::Config(format!(
                "manifest entry {} has invalid target filename {:?}",
                self.id, self.target_filename
            )));
        }
        Ok(())
    }
}

/// Read-only, ordered list of obtainable artifacts.
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
    entries: IndexMap<String, ManifestEntry>,
}

impl ManifestCatalog {
    /// Build a catalog from entries, rejecting duplicates and invalid entries.
    ///
    /// Ids and target filenames must both be unique; checksums are kept
    /// verbatim.
    pub fn from_entries(entries: Vec<ManifestEntry>) -> ArtifactResult<Self> {
        let mut map: IndexMap<String, ManifestEntry> = IndexMap::with_capacity(entries.len());
        for entry in entries {
            entry.validate()?;
            if map.contains_key(&entry.id) {
                return Err(ArtifactError::Config(format!(
                    "duplicate manifest id {}",
                    entry.id
                )));
            }
            if let Some(other) = map
                .values()
                .find(|other| other.target_filename == entry.target_filename)
            {
                return Err(ArtifactError::Config(format!(
                    "manifest entries {} and {} share target filename {}",
                    other.id, entry.id, entry.target_filename
                )));
            }
            map.insert(entry.id.clone(), entry);
        }
        Ok(Self { entries: map })
    }

    /// Load a catalog from a JSON array of entries.
    pub fn load(path: &Path) -> ArtifactResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| ArtifactError::storage(path, e))?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&content).map_err(|e| {
            ArtifactError::Config(format!("failed to parse manifest {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_entries(entries)?;
        tracing::info!(
            "Loaded {} manifest entries from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Get an entry by id.
    pub fn get(&self, id: &str) -> Option<&ManifestEntry> {
        self.entries.get(id)
    }

    /// Whether the catalog knows `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// All entries in manifest order.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    /// Ids in manifest order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ManifestCatalog {
    fn default() -> Self {
        Self {
            entries: builtin_entries()
                .into_iter()
                .map(|entry| (entry.id.clone(), entry))
                .collect(),
        }
    }
}

const WHISPER_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Built-in entries, transcription models listed highest quality first.
fn builtin_entries() -> Vec<ManifestEntry> {
    let whisper = |id: &str, name: &str, size: u64, file: &str| {
        ManifestEntry::new(
            id,
            name,
            ArtifactKind::Transcription,
            size,
            format!("{}/{}", WHISPER_BASE_URL, file),
            file,
        )
    };

    vec![
        whisper(
            "whisper-large-v3-turbo",
            "Whisper Large v3 Turbo",
            1_624_555_275,
            "ggml-large-v3-turbo.bin",
        ),
        whisper("whisper-medium", "Whisper Medium", 1_533_763_059, "ggml-medium.bin"),
        whisper("whisper-small", "Whisper Small", 487_601_967, "ggml-small.bin"),
        whisper("whisper-base", "Whisper Base", 147_951_465, "ggml-base.bin"),
        whisper("whisper-tiny", "Whisper Tiny", 77_691_713, "ggml-tiny.bin"),
        ManifestEntry::new(
            "silero-vad",
            "Silero VAD v4",
            ArtifactKind::Vad,
            1_807_522,
            "https://github.com/snakers4/silero-vad/releases/download/v4.0/silero_vad.onnx",
            "silero_vad.onnx",
        ),
    ]
}
