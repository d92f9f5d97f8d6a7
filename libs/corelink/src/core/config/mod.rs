// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Manager configuration.

mod manager_config;

pub use manager_config::{
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HELPER_NAME, DEFAULT_SHUTDOWN_TIMEOUT_MS,
    HANDSHAKE_TIMEOUT_ENV, HELPER_PATH_ENV, ManagerConfig, ManagerStrategy,
};
