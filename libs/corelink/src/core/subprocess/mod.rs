// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Subprocess infrastructure for isolated cores.
//!
//! The isolated manager runs its core in a helper process so a crashing core
//! cannot take the host down. This module owns spawning, exit observation
//! and forced termination of that process.

mod process_handle;

pub use process_handle::{ExitWatcher, ProcessExit, ProcessHandle, SubprocessConfig};
