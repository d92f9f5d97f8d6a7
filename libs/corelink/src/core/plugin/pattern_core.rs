// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Deterministic reference core.
//!
//! Its "ROM" is a JSON descriptor; it renders a scrolling test pattern and a
//! sine tone, and persists save states as JSON.

use super::{CoreEvents, GameCore};
use crate::core::channel::Notification;
use crate::core::startup::StartupInfo;
use crate::core::surface::Frame;
use crate::core::types::{BindingEvent, Cheat, DisplayMode, IntSize, KeyEvent, SetupResult};
use crate::core::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.25;
const FRAME_RATE: u32 = 60;
/// Largest width or height a display mode may declare.
pub const MAX_SCREEN_DIMENSION: u32 = 8192;

/// One display mode of a pattern ROM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRomMode {
    pub name: String,
    pub screen: IntSize,
    pub aspect: IntSize,
}

/// ROM descriptor understood by [`PatternCore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRom {
    pub title: String,
    pub display_modes: Vec<PatternRomMode>,
    #[serde(default = "default_discs")]
    pub discs: u32,
    /// Key code → owner request raised when that key is pressed.
    #[serde(default)]
    pub key_bindings: HashMap<u32, Notification>,
    /// Key code that makes the core panic, for crash drills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_key: Option<u32>,
}

fn default_discs() -> u32 {
    1
}

impl PatternRom {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            display_modes: vec![PatternRomMode {
                name: "Standard".into(),
                screen: IntSize::new(64, 48),
                aspect: IntSize::new(4, 3),
            }],
            discs: 1,
            key_bindings: HashMap::new(),
            crash_key: None,
        }
    }

    pub fn with_mode(mut self, name: impl Into<String>, screen: IntSize, aspect: IntSize) -> Self {
        self.display_modes.push(PatternRomMode {
            name: name.into(),
            screen,
            aspect,
        });
        self
    }

    pub fn with_discs(mut self, discs: u32) -> Self {
        self.discs = discs;
        self
    }

    pub fn with_key_binding(mut self, key_code: u32, request: Notification) -> Self {
        self.key_bindings.insert(key_code, request);
        self
    }

    pub fn with_crash_key(mut self, key_code: u32) -> Self {
        self.crash_key = Some(key_code);
        self
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.display_modes.is_empty() {
            return Err(CoreError::IncorrectFile("ROM declares no display modes".into()));
        }
        if let Some(mode) = self
            .display_modes
            .iter()
            .find(|m| m.screen.is_empty() || m.aspect.is_empty())
        {
            return Err(CoreError::IncorrectFile(format!(
                "display mode '{}' has an empty size",
                mode.name
            )));
        }
        if let Some(mode) = self.display_modes.iter().find(|m| {
            m.screen.width > MAX_SCREEN_DIMENSION || m.screen.height > MAX_SCREEN_DIMENSION
        }) {
            return Err(CoreError::IncorrectFile(format!(
                "display mode '{}' is {}, larger than {}x{}",
                mode.name, mode.screen, MAX_SCREEN_DIMENSION, MAX_SCREEN_DIMENSION
            )));
        }
        if self.discs == 0 {
            return Err(CoreError::IncorrectFile("ROM declares zero discs".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PatternState {
    title: String,
    frame: u64,
    mode: String,
    disc: u32,
    inserted_files: Vec<PathBuf>,
    #[serde(default)]
    bindings: Vec<BindingEvent>,
}

/// The built-in reference core, registered as `"pattern"`.
#[derive(Debug, Default)]
pub struct PatternCore {
    rom: Option<PatternRom>,
    mode_index: usize,
    disc: u32,
    frame: u64,
    tone_phase: f32,
    inserted_files: Vec<PathBuf>,
    cheats: Vec<Cheat>,
    /// Player system bindings, at most one input per (player, control).
    bindings: Vec<BindingEvent>,
    paused: bool,
}

impl PatternCore {
    pub const IDENTIFIER: &'static str = "pattern";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    fn rom(&self) -> Result<&PatternRom> {
        self.rom
            .as_ref()
            .ok_or_else(|| CoreError::NotReady("no ROM loaded".into()))
    }

    fn mode(&self) -> Option<&PatternRomMode> {
        self.rom.as_ref()?.display_modes.get(self.mode_index)
    }
}

impl GameCore for PatternCore {
    fn load_rom(&mut self, info: &StartupInfo) -> Result<()> {
        let bytes = std::fs::read(&info.rom_path).map_err(|e| {
            CoreError::IncorrectFile(format!("{}: {}", info.rom_path.display(), e))
        })?;
        let rom: PatternRom = serde_json::from_slice(&bytes).map_err(|e| {
            CoreError::IncorrectFile(format!("{}: {}", info.rom_path.display(), e))
        })?;
        rom.validate()?;

        self.mode_index = info
            .display_mode_info
            .values()
            .find_map(|wanted| rom.display_modes.iter().position(|m| &m.name == wanted))
            .unwrap_or(0);
        self.disc = 1;
        self.frame = 0;
        tracing::info!("Pattern core loaded '{}'", rom.title);
        self.rom = Some(rom);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.rom()?;
        self.frame = 0;
        self.tone_phase = 0.0;
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / FRAME_RATE
    }

    fn screen_size(&self) -> IntSize {
        self.mode().map(|m| m.screen).unwrap_or_default()
    }

    fn aspect_size(&self) -> IntSize {
        self.mode().map(|m| m.aspect).unwrap_or_default()
    }

    fn setup(&mut self) -> Result<SetupResult> {
        self.rom()?;
        Ok(SetupResult {
            screen_size: self.screen_size(),
            aspect_size: self.aspect_size(),
        })
    }

    fn disc_count(&self) -> u32 {
        self.rom.as_ref().map(|r| r.discs).unwrap_or(1)
    }

    fn display_modes(&self) -> Vec<DisplayMode> {
        let Some(rom) = self.rom.as_ref() else {
            return Vec::new();
        };
        rom.display_modes
            .iter()
            .enumerate()
            .map(|(i, m)| DisplayMode {
                name: m.name.clone(),
                group: Some("video".into()),
                selected: i == self.mode_index,
            })
            .collect()
    }

    fn run_frame(
        &mut self,
        video: &mut Frame,
        audio: &mut Vec<f32>,
        _events: &CoreEvents,
    ) -> Result<()> {
        let shift = self.frame as usize;
        let blue = (self.disc.saturating_mul(40)).min(255) as u8;
        let row_len = (video.size.width as usize).checked_mul(4).filter(|len| *len > 0);
        if let Some(row_len) = row_len {
            for (y, row) in video.pixels.chunks_exact_mut(row_len).enumerate() {
                for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
                    pixel[0] = (x.wrapping_add(shift) & 0xff) as u8;
                    pixel[1] = (y.wrapping_add(shift) & 0xff) as u8;
                    pixel[2] = blue;
                    pixel[3] = 0xff;
                }
            }
        }

        let rate = self.audio_sample_rate() as f32;
        let frames = self.audio_sample_rate() / FRAME_RATE;
        let step = TONE_HZ / rate;
        for _ in 0..frames {
            let sample = (self.tone_phase * std::f32::consts::TAU).sin() * TONE_AMPLITUDE;
            audio.push(sample);
            audio.push(sample);
            self.tone_phase = (self.tone_phase + step).fract();
        }

        self.frame += 1;
        Ok(())
    }

    fn save_state(&mut self, path: &Path) -> Result<()> {
        let rom = self.rom()?;
        let state = PatternState {
            title: rom.title.clone(),
            frame: self.frame,
            mode: self.mode().map(|m| m.name.clone()).unwrap_or_default(),
            disc: self.disc,
            inserted_files: self.inserted_files.clone(),
            bindings: self.bindings.clone(),
        };
        std::fs::write(path, serde_json::to_vec(&state)?)?;
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .map_err(|e| CoreError::IncorrectFile(format!("{}: {}", path.display(), e)))?;
        let state: PatternState = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::IncorrectFile(format!("{}: {}", path.display(), e)))?;

        let rom = self.rom()?;
        if state.title != rom.title {
            return Err(CoreError::IncorrectFile(format!(
                "save state belongs to '{}'",
                state.title
            )));
        }
        let mode_index = rom
            .display_modes
            .iter()
            .position(|m| m.name == state.mode)
            .ok_or_else(|| {
                CoreError::IncorrectFile(format!("unknown display mode '{}'", state.mode))
            })?;
        if state.disc == 0 || state.disc > rom.discs {
            return Err(CoreError::IncorrectFile(format!("disc {} out of range", state.disc)));
        }

        self.mode_index = mode_index;
        self.disc = state.disc;
        self.frame = state.frame;
        self.inserted_files = state.inserted_files;
        self.bindings = state.bindings;
        Ok(())
    }

    fn set_cheat(&mut self, cheat: &Cheat) -> Result<()> {
        self.cheats.retain(|c| c.code != cheat.code);
        if cheat.enabled {
            self.cheats.push(cheat.clone());
        }
        Ok(())
    }

    fn set_disc(&mut self, disc: u32) -> Result<()> {
        let discs = self.rom()?.discs;
        if disc == 0 || disc > discs {
            return Err(CoreError::Rejected(format!(
                "disc {} out of range 1..={}",
                disc, discs
            )));
        }
        self.disc = disc;
        Ok(())
    }

    fn change_display_mode(&mut self, name: &str) -> Result<()> {
        let index = self
            .rom()?
            .display_modes
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| CoreError::Rejected(format!("unknown display mode '{}'", name)))?;
        self.mode_index = index;
        Ok(())
    }

    fn insert_file(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(CoreError::IncorrectFile(format!(
                "{} is not a readable file",
                path.display()
            )));
        }
        self.inserted_files.push(path.to_path_buf());
        Ok(())
    }

    fn handle_key_event(&mut self, event: &KeyEvent, events: &CoreEvents) {
        if !event.pressed {
            return;
        }
        let Some(rom) = self.rom.as_ref() else {
            return;
        };
        if rom.crash_key == Some(event.key_code) {
            panic!("pattern core crash key {} pressed", event.key_code);
        }
        if let Some(request) = rom.key_bindings.get(&event.key_code) {
            events.request(request.clone());
        }
    }

    fn system_binding_set(&mut self, binding: &BindingEvent) {
        self.bindings
            .retain(|b| !(b.player == binding.player && b.binding == binding.binding));
        self.bindings.push(binding.clone());
    }

    fn system_binding_unset(&mut self, binding: &BindingEvent) {
        self.bindings.retain(|b| b != binding);
    }
}
