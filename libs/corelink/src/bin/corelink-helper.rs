// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! corelink helper binary
//!
//! Hosts one emulation core on behalf of an isolated core manager. Spawned by
//! the manager; stdin/stdout carry the control channel. Provides the built-in
//! cores; the host's `--core` arguments pick which of them resolve.

use corelink::core::helper::helper_main;
use corelink::core::plugin::CoreRegistry;

fn main() -> anyhow::Result<()> {
    helper_main(CoreRegistry::with_builtin_cores())
}
