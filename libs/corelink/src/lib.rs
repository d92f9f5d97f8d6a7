// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host-side control layer for emulation cores.
//!
//! A [`CoreManager`] drives one core through load, setup, run and stop,
//! whether the core lives on a thread of this process
//! ([`ThreadCoreManager`]) or inside a `corelink-helper` process
//! ([`ProcessCoreManager`]). Owners receive the core's requests through
//! [`CoreOwner`] and display its output through a [`PresentationLayer`].

#![allow(clippy::type_complexity)] // Callback types are clear in context

pub mod core;

pub use crate::core::{
    BindingEvent, CapturedImage, ChannelOwner, Cheat, CommandOutput, CoreCommand, CoreError, CoreManager,
    CoreOwner, CoreRegistry, DisplayMode, EffectsMode, GameCore, IntSize, KeyEvent,
    LifecycleState, ManagerConfig, ManagerStrategy, MouseEvent, MouseEventKind, Notification,
    OutputBounds, OwnerEvent, PatternCore, PatternRom, PresentationLayer, ProcessCoreManager,
    RenderContextHandle, Result, SessionId, SetupResult, ShaderConfig, StartupInfo,
    ThreadCoreManager, Volume, create_manager, no_owner,
};
