// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod channel;
pub mod config;
pub mod error;
pub mod helper;
pub mod lifecycle;
pub mod manager;
pub mod owner;
pub mod plugin;
pub mod session;
pub mod session_id;
pub mod startup;
pub mod subprocess;
pub mod surface;
pub mod types;

pub use channel::{CommandOutput, CoreCommand, Notification};
pub use config::{ManagerConfig, ManagerStrategy};
pub use error::*;
pub use lifecycle::{LifecycleEvent, LifecycleState};
pub use manager::{BoxFuture, CoreManager, ProcessCoreManager, ThreadCoreManager, create_manager};
pub use owner::{ChannelOwner, CoreOwner, NoOwner, OwnerEvent, no_owner};
pub use plugin::{CoreEvents, CorePluginInfo, CoreRegistry, GameCore, PatternCore, PatternRom};
pub use session_id::SessionId;
pub use startup::{HashKind, StartupInfo, StartupInfoBuilder};
pub use surface::{PresentationLayer, RenderContextHandle};
pub use types::*;
