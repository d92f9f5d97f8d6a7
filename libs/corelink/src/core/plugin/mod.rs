// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Emulation core plugin interface and the injected registry that resolves
//! core-plugin locators to core factories.

mod pattern_core;

pub use pattern_core::{PatternCore, PatternRom, PatternRomMode};

use crate::core::channel::Notification;
use crate::core::startup::StartupInfo;
use crate::core::surface::Frame;
use crate::core::types::{BindingEvent, Cheat, DisplayMode, IntSize, KeyEvent, MouseEvent, SetupResult};
use crate::core::{CoreError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Sink for core-originated notifications.
pub type NotificationSink = Arc<dyn Fn(Notification) + Send + Sync>;

/// Handle a core uses to ask its owner for host-level actions.
#[derive(Clone)]
pub struct CoreEvents {
    sink: NotificationSink,
}

impl CoreEvents {
    pub fn new(sink: NotificationSink) -> Self {
        Self { sink }
    }

    /// Fire-and-forget; never waits on the host.
    pub fn request(&self, notification: Notification) {
        (self.sink)(notification);
    }
}

/// An emulation core.
///
/// All methods are called from the session's control thread, one at a time.
pub trait GameCore: Send {
    /// Load the game described by `info`. Structurally invalid content must
    /// fail with [`CoreError::IncorrectFile`].
    fn load_rom(&mut self, info: &StartupInfo) -> Result<()>;

    fn setup(&mut self) -> Result<SetupResult> {
        Ok(SetupResult {
            screen_size: self.screen_size(),
            aspect_size: self.aspect_size(),
        })
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_paused(&mut self, _paused: bool) {}

    fn frame_interval(&self) -> Duration {
        Duration::from_micros(16_667)
    }

    /// Interleaved stereo sample rate of the audio `run_frame` produces.
    fn audio_sample_rate(&self) -> u32 {
        48_000
    }

    fn screen_size(&self) -> IntSize;

    fn aspect_size(&self) -> IntSize;

    fn disc_count(&self) -> u32 {
        1
    }

    fn display_modes(&self) -> Vec<DisplayMode> {
        Vec::new()
    }

    /// Emulate one frame into `video` (already sized to `screen_size`) and
    /// append interleaved stereo samples to `audio`.
    fn run_frame(&mut self, video: &mut Frame, audio: &mut Vec<f32>, events: &CoreEvents)
    -> Result<()>;

    fn save_state(&mut self, path: &Path) -> Result<()>;

    fn load_state(&mut self, path: &Path) -> Result<()>;

    fn set_cheat(&mut self, _cheat: &Cheat) -> Result<()> {
        Err(CoreError::NotSupported("cheats".into()))
    }

    fn set_disc(&mut self, _disc: u32) -> Result<()> {
        Err(CoreError::NotSupported("disc selection".into()))
    }

    fn change_display_mode(&mut self, _name: &str) -> Result<()> {
        Err(CoreError::NotSupported("display modes".into()))
    }

    fn insert_file(&mut self, _path: &Path) -> Result<()> {
        Err(CoreError::NotSupported("file insertion".into()))
    }

    fn handle_mouse_event(&mut self, _event: &MouseEvent, _events: &CoreEvents) {}

    fn handle_key_event(&mut self, _event: &KeyEvent, _events: &CoreEvents) {}

    fn system_binding_set(&mut self, _binding: &BindingEvent) {}

    fn system_binding_unset(&mut self, _binding: &BindingEvent) {}
}

pub type CoreFactory = Arc<dyn Fn() -> Box<dyn GameCore> + Send + Sync>;

/// Registry metadata for one core plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorePluginInfo {
    pub identifier: String,
    pub version: String,
    pub out_of_support: bool,
}

impl CorePluginInfo {
    pub fn new(identifier: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            version: version.into(),
            out_of_support: false,
        }
    }

    pub fn out_of_support(mut self) -> Self {
        self.out_of_support = true;
        self
    }
}

#[derive(Clone)]
struct CoreEntry {
    info: CorePluginInfo,
    factory: CoreFactory,
}

/// Core plugins available to a manager. Passed in explicitly, never global.
#[derive(Clone, Default)]
pub struct CoreRegistry {
    entries: HashMap<String, CoreEntry>,
}

impl CoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the cores that ship with this crate.
    pub fn with_builtin_cores() -> Self {
        let mut registry = Self::new();
        if let Err(e) = registry.register(
            CorePluginInfo::new(PatternCore::IDENTIFIER, env!("CARGO_PKG_VERSION")),
            || Box::new(PatternCore::new()),
        ) {
            tracing::warn!("Failed to register built-in core: {}", e);
        }
        registry
    }

    pub fn register<F>(&mut self, info: CorePluginInfo, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn GameCore> + Send + Sync + 'static,
    {
        if self.entries.contains_key(&info.identifier) {
            return Err(CoreError::PluginAlreadyLoaded(info.identifier));
        }
        tracing::debug!("Registered core plugin '{}' {}", info.identifier, info.version);
        self.entries.insert(
            info.identifier.clone(),
            CoreEntry {
                info,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn info(&self, identifier: &str) -> Option<&CorePluginInfo> {
        self.entries.get(identifier).map(|e| &e.info)
    }

    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn plugins(&self) -> impl Iterator<Item = &CorePluginInfo> {
        self.entries.values().map(|e| &e.info)
    }

    /// The cores of this registry that `allowed` names, with the support
    /// status `allowed` gives them. Identifiers this registry cannot provide
    /// stay unresolvable.
    pub fn restricted_to<'a>(&self, allowed: impl IntoIterator<Item = &'a CorePluginInfo>) -> Self {
        let mut restricted = Self::new();
        for wanted in allowed {
            match self.entries.get(&wanted.identifier) {
                Some(entry) => {
                    let mut entry = entry.clone();
                    entry.info.out_of_support = wanted.out_of_support;
                    restricted.entries.insert(wanted.identifier.clone(), entry);
                }
                None => tracing::warn!(
                    "Core plugin '{}' is not available in this process",
                    wanted.identifier
                ),
            }
        }
        restricted
    }

    /// Create a fresh core for `identifier`.
    pub fn instantiate(&self, identifier: &str) -> Result<Box<dyn GameCore>> {
        let entry = self
            .entries
            .get(identifier)
            .ok_or_else(|| CoreError::PluginInvalid(format!("no core plugin '{}'", identifier)))?;
        if entry.info.out_of_support {
            return Err(CoreError::PluginOutOfSupport(format!(
                "{} {}",
                entry.info.identifier, entry.info.version
            )));
        }
        Ok((entry.factory)())
    }
}

impl std::fmt::Debug for CoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRegistry")
            .field("plugins", &self.identifiers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_has_pattern_core() {
        let registry = CoreRegistry::with_builtin_cores();
        assert_eq!(registry.identifiers(), vec![PatternCore::IDENTIFIER]);
        assert!(registry.instantiate(PatternCore::IDENTIFIER).is_ok());
    }

    #[test]
    fn test_duplicate_registration_is_already_loaded() {
        let mut registry = CoreRegistry::with_builtin_cores();
        let err = registry
            .register(CorePluginInfo::new(PatternCore::IDENTIFIER, "2"), || {
                Box::new(PatternCore::new())
            })
            .unwrap_err();
        assert_eq!(err.code(), Some(CoreError::PLUGIN_ALREADY_LOADED));
    }

    #[test]
    fn test_unknown_core_is_invalid_plugin() {
        let registry = CoreRegistry::new();
        let err = registry.instantiate("missing").err().unwrap();
        assert_eq!(err.code(), Some(CoreError::PLUGIN_INVALID));
    }

    #[test]
    fn test_out_of_support_core_is_refused() {
        let mut registry = CoreRegistry::new();
        registry
            .register(CorePluginInfo::new("old", "0.1").out_of_support(), || {
                Box::new(PatternCore::new())
            })
            .unwrap();
        let err = registry.instantiate("old").err().unwrap();
        assert_eq!(err.code(), Some(CoreError::PLUGIN_OUT_OF_SUPPORT));
    }

    #[test]
    fn test_core_events_forward_to_sink() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let events = CoreEvents::new(Arc::new(move |n: Notification| {
            let _ = tx.send(n);
        }));
        events.request(Notification::QuickSave);
        assert_eq!(rx.try_recv().unwrap(), Notification::QuickSave);
    }

    #[test]
    fn test_restricted_registry_follows_allowed_list() {
        let provided = CoreRegistry::with_builtin_cores();

        let none = provided.restricted_to(std::iter::empty());
        assert!(none.identifiers().is_empty());

        let retired = CorePluginInfo::new(PatternCore::IDENTIFIER, "1").out_of_support();
        let unknown = CorePluginInfo::new("custom", "1");
        let restricted = provided.restricted_to([&retired, &unknown]);
        assert_eq!(restricted.identifiers(), vec![PatternCore::IDENTIFIER]);
        let err = restricted.instantiate(PatternCore::IDENTIFIER).err().unwrap();
        assert_eq!(err.code(), Some(CoreError::PLUGIN_OUT_OF_SUPPORT));
        let err = restricted.instantiate("custom").err().unwrap();
        assert_eq!(err.code(), Some(CoreError::PLUGIN_INVALID));
    }
}
