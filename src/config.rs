// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache configuration.
//!
//! Layering, lowest to highest precedence: built-in defaults, the JSON file
//! at `<config dir>/uricache/config.json`, the `URICACHE_ROOT` environment
//! variable, then CLI flags (applied by the binary).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::KeyPolicy;
use crate::download::http::DEFAULT_CONNECT_TIMEOUT;

/// Environment variable overriding the cache root.
pub const ROOT_ENV_VAR: &str = "URICACHE_ROOT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cached files.
    pub root: PathBuf,
    /// Which request inputs identify an entry.
    pub key_policy: KeyPolicy,
    /// Transfer time limit when a request sets none.
    pub default_timeout_secs: Option<u64>,
    /// Abort a transfer once every waiter has detached.
    pub cancel_orphaned: bool,
    pub connect_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            key_policy: KeyPolicy::default(),
            default_timeout_secs: None,
            cancel_orphaned: true,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
        }
    }
}

impl CacheConfig {
    /// Config rooted at `root`, everything else default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Path of the user config file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("uricache").join("config.json"))
            .unwrap_or_else(|| PathBuf::from(".uricache/config.json"))
    }

    /// Load the user config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        if let Some(root) = std::env::var_os(ROOT_ENV_VAR).filter(|v| !v.is_empty()) {
            config.root = PathBuf::from(root);
        }
        Ok(config)
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Write to `path` via temp file + rename.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let content = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to JSON")?;

        let temp_path = path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} -> {:?}", temp_path, path))?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }
}

fn default_root() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("uricache").join("images"))
        .unwrap_or_else(|| PathBuf::from(".uricache"))
}
