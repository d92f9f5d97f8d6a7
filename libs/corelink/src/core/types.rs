// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Value types shared by the manager, the session and the wire protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Integer pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntSize {
    pub width: u32,
    pub height: u32,
}

impl IntSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Byte length of an RGBA8 buffer of this size.
    pub fn rgba_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl std::fmt::Display for IntSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Result of `setup`: the core's output size and its display aspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupResult {
    pub screen_size: IntSize,
    pub aspect_size: IntSize,
}

/// Destination rectangle of the host's presentation layer, in points.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl OutputBounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Shader selection plus its parameter bindings.
///
/// A new config replaces every binding of the previous one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShaderConfig {
    pub url: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, f32>,
}

impl ShaderConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: f32) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// One entry of the core's display-mode list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cheat {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub enabled: bool,
}

/// How the compositor treats paused emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectsMode {
    /// Stop presenting new composited frames while paused.
    #[default]
    Reflect,
    /// Keep compositing the last frame while paused.
    DisplayAlways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseEventKind {
    Moved,
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouseEvent {
    pub kind: MouseEventKind,
    pub button: u8,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key_code: u32,
    pub pressed: bool,
    #[serde(default)]
    pub modifiers: u32,
}

impl KeyEvent {
    pub fn down(key_code: u32) -> Self {
        Self {
            key_code,
            pressed: true,
            modifiers: 0,
        }
    }

    pub fn up(key_code: u32) -> Self {
        Self {
            key_code,
            pressed: false,
            modifiers: 0,
        }
    }
}

/// Input assigned to (or removed from) one player's system control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingEvent {
    /// System control the input drives, e.g. `"button_a"`.
    pub binding: String,
    /// 1-based player number; 0 for controls that belong to no player.
    pub player: u32,
    pub event: KeyEvent,
}

impl BindingEvent {
    pub fn new(binding: impl Into<String>, player: u32, event: KeyEvent) -> Self {
        Self {
            binding: binding.into(),
            player,
            event,
        }
    }
}

/// RGBA8 image returned by the capture operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedImage {
    pub size: IntSize,
    pub pixels: Vec<u8>,
}

/// Volume in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Volume(f32);

impl Volume {
    pub const MUTED: Volume = Volume(0.0);
    pub const FULL: Volume = Volume(1.0);

    /// Clamp an arbitrary caller value. NaN maps to silence.
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            return Self::MUTED;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::FULL
    }
}
