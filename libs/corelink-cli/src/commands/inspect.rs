// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::path::Path;

use anyhow::{Context, Result};
use corelink::{CoreRegistry, StartupInfo};

/// System plugin locator the CLI reports for every ROM.
pub const CLI_SYSTEM: &str = "corelink-cli";

/// Print the startup info `run` would hand to the core.
pub fn run(rom: &Path, core: &Path) -> Result<()> {
    let info = StartupInfo::for_rom(rom, core, CLI_SYSTEM)
        .with_context(|| format!("Failed to read {}", rom.display()))?;

    let identifier = info.core_identifier()?;
    let registry = CoreRegistry::with_builtin_cores();
    match registry.info(&identifier) {
        Some(plugin) => println!("Core: {} {}", plugin.identifier, plugin.version),
        None => println!("Core: {} (not available in this build)", identifier),
    }
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

/// Print the identifiers of the built-in cores.
pub fn cores() {
    let registry = CoreRegistry::with_builtin_cores();
    for identifier in registry.identifiers() {
        match registry.info(identifier) {
            Some(info) if info.out_of_support => {
                println!("{} {} (out of support)", info.identifier, info.version)
            }
            Some(info) => println!("{} {}", info.identifier, info.version),
            None => println!("{}", identifier),
        }
    }
}
