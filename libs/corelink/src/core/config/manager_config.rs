// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Manager configuration via `corelink.yaml`.

use crate::core::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the helper executable.
pub const HELPER_PATH_ENV: &str = "CORELINK_HELPER_PATH";
/// Environment variable overriding the handshake timeout in milliseconds.
pub const HANDSHAKE_TIMEOUT_ENV: &str = "CORELINK_HANDSHAKE_TIMEOUT_MS";

pub const DEFAULT_HELPER_NAME: &str = "corelink-helper";
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Where the core runs relative to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerStrategy {
    /// Dedicated thread in the host process.
    #[default]
    CoLocated,
    /// Separate helper process.
    Isolated,
}

/// Manager configuration from `corelink.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub strategy: ManagerStrategy,

    /// Helper executable. Resolved next to the current executable, then on
    /// `PATH`, when unset.
    pub helper_path: Option<PathBuf>,

    /// Extra arguments appended to the helper's command line.
    pub helper_args: Vec<String>,

    /// Environment variables set for the helper.
    pub helper_env: BTreeMap<String, String>,

    pub handshake_timeout_ms: u64,

    pub shutdown_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            strategy: ManagerStrategy::default(),
            helper_path: None,
            helper_args: Vec::new(),
            helper_env: BTreeMap::new(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ManagerConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "corelink.yaml";

    /// Load configuration from a directory. Returns error if the file is
    /// missing or cannot be parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(Self::FILE_NAME);

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            CoreError::Configuration(format!("Failed to read {}: {}", config_path.display(), e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            CoreError::Configuration(format!("Failed to parse {}: {}", config_path.display(), e))
        })?;

        tracing::info!("Loaded manager config from {}", config_path.display());
        Ok(config.with_env_overrides())
    }

    /// Load configuration from a directory, returning defaults if the file is
    /// missing or unparseable.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            tracing::debug!(
                "No {} found in {}, using defaults",
                Self::FILE_NAME,
                dir.display()
            );
            return Self::default().with_env_overrides();
        }

        match Self::load(dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default().with_env_overrides()
            }
        }
    }

    /// Apply `CORELINK_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(path) = std::env::var_os(HELPER_PATH_ENV) {
            self.helper_path = Some(PathBuf::from(path));
        }
        if let Ok(raw) = std::env::var(HANDSHAKE_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.handshake_timeout_ms = ms,
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", HANDSHAKE_TIMEOUT_ENV, raw, e),
            }
        }
        self
    }

    pub fn with_strategy(mut self, strategy: ManagerStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_helper_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.helper_path = Some(path.into());
        self
    }

    pub fn with_helper_arg(mut self, arg: impl Into<String>) -> Self {
        self.helper_args.push(arg.into());
        self
    }

    pub fn with_helper_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.helper_env.insert(key.into(), value.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Configured helper path, else a sibling of the current executable
    /// (or of its parent, for test binaries under `deps/`), else the bare
    /// name for `PATH` lookup.
    pub fn resolved_helper_path(&self) -> PathBuf {
        if let Some(path) = &self.helper_path {
            return path.clone();
        }
        let file_name = format!("{}{}", DEFAULT_HELPER_NAME, std::env::consts::EXE_SUFFIX);
        if let Ok(exe) = std::env::current_exe() {
            for dir in exe.ancestors().skip(1).take(2) {
                let candidate = dir.join(&file_name);
                if candidate.is_file() {
                    return candidate;
                }
            }
        }
        PathBuf::from(file_name)
    }
}
