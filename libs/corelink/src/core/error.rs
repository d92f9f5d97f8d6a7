// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Helper could not start its connection: {0}")]
    HelperCouldNotStartConnection(String),

    #[error("Incorrect file: {0}")]
    IncorrectFile(String),

    #[error("Helper is not running: {0}")]
    HelperNotRunning(String),

    #[error("Connection timed out: {0}")]
    ConnectionTimedOut(String),

    #[error("Invalid helper connection: {0}")]
    InvalidConnection(String),

    #[error("Handshake returned no root proxy")]
    NilRootProxy,

    #[error("Plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    #[error("Plugin invalid: {0}")]
    PluginInvalid(String),

    #[error("Plugin out of support: {0}")]
    PluginOutOfSupport(String),

    #[error("Core is not running")]
    NotRunning,

    #[error("Core not ready: {0}")]
    NotReady(String),

    #[error("Invalid lifecycle transition: {0}")]
    InvalidTransition(String),

    #[error("Core rejected command: {0}")]
    Rejected(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Surface transport error: {0}")]
    SurfaceTransport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub const HELPER_COULD_NOT_START_CONNECTION: i32 = -1;
    pub const INCORRECT_FILE: i32 = -2;
    pub const HELPER_NOT_RUNNING: i32 = -3;
    pub const CONNECTION_TIMED_OUT: i32 = -4;
    pub const INVALID_HELPER_CONNECTION: i32 = -5;
    pub const NIL_ROOT_PROXY: i32 = -6;
    pub const PLUGIN_ALREADY_LOADED: i32 = -1000;
    pub const PLUGIN_INVALID: i32 = -1001;
    pub const PLUGIN_OUT_OF_SUPPORT: i32 = -1002;

    /// Stable numeric code, for the variants that have one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::HelperCouldNotStartConnection(_) => Some(Self::HELPER_COULD_NOT_START_CONNECTION),
            Self::IncorrectFile(_) => Some(Self::INCORRECT_FILE),
            Self::HelperNotRunning(_) | Self::NotRunning => Some(Self::HELPER_NOT_RUNNING),
            Self::ConnectionTimedOut(_) => Some(Self::CONNECTION_TIMED_OUT),
            Self::InvalidConnection(_) => Some(Self::INVALID_HELPER_CONNECTION),
            Self::NilRootProxy => Some(Self::NIL_ROOT_PROXY),
            Self::PluginAlreadyLoaded(_) => Some(Self::PLUGIN_ALREADY_LOADED),
            Self::PluginInvalid(_) => Some(Self::PLUGIN_INVALID),
            Self::PluginOutOfSupport(_) => Some(Self::PLUGIN_OUT_OF_SUPPORT),
            _ => None,
        }
    }

    /// True for errors raised because the connection to the core went away.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConnection(_) | Self::HelperNotRunning(_)
        )
    }

    pub(crate) fn connection_lost(context: &str) -> Self {
        Self::InvalidConnection(format!("connection invalidated: {}", context))
    }
}

/// Error representation carried across the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: Option<i32>,
    pub message: String,
}

impl From<&CoreError> for WireError {
    fn from(err: &CoreError) -> Self {
        let message = match err {
            CoreError::HelperCouldNotStartConnection(m)
            | CoreError::IncorrectFile(m)
            | CoreError::HelperNotRunning(m)
            | CoreError::ConnectionTimedOut(m)
            | CoreError::InvalidConnection(m)
            | CoreError::PluginAlreadyLoaded(m)
            | CoreError::PluginInvalid(m)
            | CoreError::PluginOutOfSupport(m)
            | CoreError::Rejected(m) => m.clone(),
            other => other.to_string(),
        };
        Self {
            code: err.code(),
            message,
        }
    }
}

impl From<CoreError> for WireError {
    fn from(err: CoreError) -> Self {
        Self::from(&err)
    }
}

impl From<WireError> for CoreError {
    fn from(err: WireError) -> Self {
        match err.code {
            Some(CoreError::HELPER_COULD_NOT_START_CONNECTION) => {
                Self::HelperCouldNotStartConnection(err.message)
            }
            Some(CoreError::INCORRECT_FILE) => Self::IncorrectFile(err.message),
            Some(CoreError::HELPER_NOT_RUNNING) => Self::HelperNotRunning(err.message),
            Some(CoreError::CONNECTION_TIMED_OUT) => Self::ConnectionTimedOut(err.message),
            Some(CoreError::INVALID_HELPER_CONNECTION) => Self::InvalidConnection(err.message),
            Some(CoreError::NIL_ROOT_PROXY) => Self::NilRootProxy,
            Some(CoreError::PLUGIN_ALREADY_LOADED) => Self::PluginAlreadyLoaded(err.message),
            Some(CoreError::PLUGIN_INVALID) => Self::PluginInvalid(err.message),
            Some(CoreError::PLUGIN_OUT_OF_SUPPORT) => Self::PluginOutOfSupport(err.message),
            _ => Self::Rejected(err.message),
        }
    }
}
