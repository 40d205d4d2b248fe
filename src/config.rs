// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration file handling.
//!
//! Configuration lives in `~/.modelstash/config.json`. Setting
//! `MODELSTASH_HOME` moves the whole base directory. A missing file yields
//! defaults; command-line flags are applied on top by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::ManifestCatalog;
use crate::download::progress::{DEFAULT_BYTE_STEP, DEFAULT_PERCENT_STEP};
use crate::download::TransferSettings;
use crate::error::{ArtifactError, ArtifactResult};

/// Environment variable overriding the base directory.
pub const HOME_ENV: &str = "MODELSTASH_HOME";

const CONFIG_FILE: &str = "config.json";
const REGISTRY_FILE: &str = "registry.json";

/// Persistent settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Where artifacts are stored (default: `<base>/models`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
    /// JSON manifest replacing the built-in catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    /// Fallback order for the active artifact (default: catalog quality order)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference_order: Option<Vec<String>>,
    /// HTTP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Minimum percent increase between progress events (default 1).
    ///
    /// Together with `progress_byte_step` this tunes the progress throttle;
    /// the defaults give the standard "1 percent or 1 MiB" cadence and only
    /// embedders with unusual artifact sizes should need to change them.
    #[serde(default = "default_progress_percent_step")]
    pub progress_percent_step: u8,
    /// Byte interval between progress events (default 1 MiB)
    #[serde(default = "default_progress_byte_step")]
    pub progress_byte_step: u64,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_progress_percent_step() -> u8 {
    DEFAULT_PERCENT_STEP
}

fn default_progress_byte_step() -> u64 {
    DEFAULT_BYTE_STEP
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: None,
            manifest_path: None,
            preference_order: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            progress_percent_step: default_progress_percent_step(),
            progress_byte_step: default_progress_byte_step(),
        }
    }
}

/// Base directory: `$MODELSTASH_HOME` if set, else `~/.modelstash`.
pub fn base_dir() -> ArtifactResult<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| ArtifactError::Config("could not find home directory".into()))?;
    Ok(home.join(".modelstash"))
}

impl Config {
    /// Path of the config file.
    pub fn path() -> ArtifactResult<PathBuf> {
        Ok(base_dir()?.join(CONFIG_FILE))
    }

    /// Load the config file, or defaults if it does not exist.
    pub fn load() -> ArtifactResult<Self> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> ArtifactResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| ArtifactError::storage(path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            ArtifactError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn save(&self) -> ArtifactResult<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> ArtifactResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArtifactError::storage(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ArtifactError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, content).map_err(|e| ArtifactError::storage(path, e))
    }

    /// The storage directory, defaulting to `<base>/models`.
    pub fn storage_dir(&self) -> ArtifactResult<PathBuf> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(base_dir()?.join("models")),
        }
    }

    /// Where the registry document lives.
    pub fn registry_path(&self) -> ArtifactResult<PathBuf> {
        Ok(self.storage_dir()?.join(REGISTRY_FILE))
    }

    /// The catalog: the configured manifest, or the built-in list.
    pub fn catalog(&self) -> ArtifactResult<ManifestCatalog> {
        match &self.manifest_path {
            Some(path) => ManifestCatalog::load(path),
            None => Ok(ManifestCatalog::default()),
        }
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            percent_step: self.progress_percent_step,
            byte_step: self.progress_byte_step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_from(&temp.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.progress_byte_step, 1024 * 1024);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{"storage_dir": "/srv/models", "progress_percent_step": 5}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage_dir, Some(PathBuf::from("/srv/models")));
        assert_eq!(config.progress_percent_step, 5);
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(
            config.registry_path().unwrap(),
            PathBuf::from("/srv/models/registry.json")
        );
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");
        let config = Config {
            preference_order: Some(vec!["whisper-small".into()]),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ArtifactError::Config(_))
        ));
    }

    #[test]
    fn test_default_throttle_is_one_percent_or_one_mib() {
        let settings = Config::default().transfer_settings();
        assert_eq!(settings.percent_step, 1);
        assert_eq!(settings.byte_step, 1024 * 1024);
    }

    #[test]
    fn test_transfer_settings() {
        let config = Config {
            connect_timeout_secs: 0,
            progress_percent_step: 2,
            progress_byte_step: 4096,
            ..Config::default()
        };
        let settings = config.transfer_settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(1));
        assert_eq!(settings.percent_step, 2);
        assert_eq!(settings.byte_step, 4096);
    }

    #[test]
    fn test_builtin_catalog_without_manifest() {
        let catalog = Config::default().catalog().unwrap();
        assert!(catalog.contains("whisper-small"));
    }
}
