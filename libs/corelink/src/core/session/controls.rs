// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::core::types::{EffectsMode, OutputBounds, ShaderConfig, Volume};
use parking_lot::Mutex;
use std::sync::Arc;

/// Values the render and audio contexts consult once per frame or block.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSnapshot {
    pub paused: bool,
    pub volume: Volume,
    pub audio_device: Option<u32>,
    pub shader: Option<ShaderConfig>,
    pub bounds: OutputBounds,
    pub backing_scale_factor: f64,
    pub effects_mode: EffectsMode,
}

impl Default for ControlSnapshot {
    fn default() -> Self {
        Self {
            paused: false,
            volume: Volume::default(),
            audio_device: None,
            shader: None,
            bounds: OutputBounds::default(),
            backing_scale_factor: 1.0,
            effects_mode: EffectsMode::default(),
        }
    }
}

/// Pending control parameters shared between the control thread and the
/// render/audio contexts.
#[derive(Debug, Clone, Default)]
pub struct ControlParams {
    inner: Arc<Mutex<ControlSnapshot>>,
}

impl ControlParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        self.inner.lock().clone()
    }

    pub fn volume(&self) -> Volume {
        self.inner.lock().volume
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    pub fn set_volume(&self, volume: Volume) {
        self.inner.lock().volume = volume;
    }

    pub fn set_audio_device(&self, device: u32) {
        self.inner.lock().audio_device = Some(device);
    }

    /// Replace the shader and all of its parameter bindings.
    pub fn set_shader(&self, shader: ShaderConfig) {
        self.inner.lock().shader = Some(shader);
    }

    pub fn set_shader_parameter(&self, name: &str, value: f32) {
        let mut inner = self.inner.lock();
        let shader = inner.shader.get_or_insert_with(ShaderConfig::default);
        shader.parameters.insert(name.to_string(), value);
    }

    pub fn set_bounds(&self, bounds: OutputBounds) {
        self.inner.lock().bounds = bounds;
    }

    pub fn set_backing_scale_factor(&self, scale: f64) {
        self.inner.lock().backing_scale_factor = scale;
    }

    pub fn set_effects_mode(&self, mode: EffectsMode) {
        self.inner.lock().effects_mode = mode;
    }
}
