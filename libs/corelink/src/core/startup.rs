// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Startup parameters handed to a manager before `load_rom`.

use crate::core::types::ShaderConfig;
use crate::core::{CoreError, Result};
use serde::{Deserialize, Serialize};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Checksum algorithms a host may record for a ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
    Crc32,
}

/// Everything a core needs to load one game.
///
/// Created once by the caller and never mutated afterwards; the manager owns
/// it for its whole lifetime and ships a copy to the helper on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupInfo {
    pub rom_path: PathBuf,
    #[serde(default)]
    pub hashes: BTreeMap<HashKind, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rom_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rom_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_region: Option<String>,
    /// Persisted display-mode selection, keyed by mode group.
    #[serde(default)]
    pub display_mode_info: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shader: Option<ShaderConfig>,
    pub core_plugin: PathBuf,
    pub system_plugin: PathBuf,
}

impl StartupInfo {
    pub fn builder(
        rom_path: impl Into<PathBuf>,
        core_plugin: impl Into<PathBuf>,
        system_plugin: impl Into<PathBuf>,
    ) -> StartupInfoBuilder {
        StartupInfoBuilder {
            info: StartupInfo {
                rom_path: rom_path.into(),
                hashes: BTreeMap::new(),
                rom_header: None,
                rom_serial: None,
                system_region: None,
                display_mode_info: BTreeMap::new(),
                shader: None,
                core_plugin: core_plugin.into(),
                system_plugin: system_plugin.into(),
            },
        }
    }

    /// Build startup info for a ROM on disk, recording every [`HashKind`].
    pub fn for_rom(
        rom_path: impl Into<PathBuf>,
        core_plugin: impl Into<PathBuf>,
        system_plugin: impl Into<PathBuf>,
    ) -> Result<Self> {
        let rom_path = rom_path.into();
        let hashes = rom_hashes(&rom_path)?;
        let mut builder = Self::builder(rom_path, core_plugin, system_plugin);
        for (kind, hex) in hashes {
            builder = builder.with_hash(kind, hex);
        }
        Ok(builder.build())
    }

    /// Registry key of the core plugin: the locator's file stem.
    pub fn core_identifier(&self) -> Result<String> {
        plugin_identifier(&self.core_plugin)
    }

    pub fn system_identifier(&self) -> Result<String> {
        plugin_identifier(&self.system_plugin)
    }

    pub fn hash(&self, kind: HashKind) -> Option<&str> {
        self.hashes.get(&kind).map(String::as_str)
    }
}

pub struct StartupInfoBuilder {
    info: StartupInfo,
}

impl StartupInfoBuilder {
    pub fn with_hash(mut self, kind: HashKind, hex: impl Into<String>) -> Self {
        self.info.hashes.insert(kind, hex.into().to_lowercase());
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.info.rom_header = Some(header.into());
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.info.rom_serial = Some(serial.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.info.system_region = Some(region.into());
        self
    }

    pub fn with_display_mode(mut self, group: impl Into<String>, mode: impl Into<String>) -> Self {
        self.info.display_mode_info.insert(group.into(), mode.into());
        self
    }

    pub fn with_shader(mut self, shader: ShaderConfig) -> Self {
        self.info.shader = Some(shader);
        self
    }

    pub fn build(self) -> StartupInfo {
        self.info
    }
}

fn plugin_identifier(locator: &Path) -> Result<String> {
    locator
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CoreError::PluginInvalid(format!("{}", locator.display())))
}

const HASH_CHUNK: usize = 64 * 1024;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Lowercase hex digests of a file, all computed in one read.
pub fn rom_hashes(path: &Path) -> Result<BTreeMap<HashKind, String>> {
    let mut file = std::fs::File::open(path)?;
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut crc32 = crc32fast::Hasher::new();

    let mut chunk = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        let bytes = &chunk[..read];
        md5.update(bytes);
        sha1.update(bytes);
        sha256.update(bytes);
        crc32.update(bytes);
    }

    Ok(BTreeMap::from([
        (HashKind::Md5, hex(&md5.finalize())),
        (HashKind::Sha1, hex(&sha1.finalize())),
        (HashKind::Sha256, hex(&sha256.finalize())),
        (HashKind::Crc32, format!("{:08x}", crc32.finalize())),
    ]))
}
