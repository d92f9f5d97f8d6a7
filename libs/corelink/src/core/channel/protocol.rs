// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Messages exchanged between a manager and its core.
//!
//! Commands flow host → core and are answered by exactly one reply.
//! Notifications flow core → host and are never answered.

use crate::core::error::WireError;
use crate::core::lifecycle::LifecycleEvent;
use crate::core::startup::StartupInfo;
use crate::core::types::{
    BindingEvent, CapturedImage, Cheat, DisplayMode, EffectsMode, IntSize, KeyEvent, MouseEvent, OutputBounds,
    SetupResult, ShaderConfig,
};
use crate::core::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Bumped whenever a message layout changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Operation sent to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
pub enum CoreCommand {
    Load(StartupInfo),
    Setup,
    Start,
    Reset,
    Stop,
    SetPauseEmulation(bool),
    SetVolume(f32),
    SetAudioOutputDevice(u32),
    SetOutputBounds(OutputBounds),
    SetBackingScaleFactor(f64),
    SetShader(ShaderConfig),
    SetShaderParameterValue { name: String, value: f32 },
    SaveState(PathBuf),
    LoadState(PathBuf),
    SetCheat(Cheat),
    SetDisc(u32),
    ChangeDisplayMode(String),
    InsertFile(PathBuf),
    HandleMouseEvent(MouseEvent),
    HandleKeyEvent(KeyEvent),
    SystemBindingSet(BindingEvent),
    SystemBindingUnset(BindingEvent),
    SetHandleEvents(bool),
    SetHandleKeyboardEvents(bool),
    SetEffectsMode(EffectsMode),
    CaptureOutputImage,
    CaptureSourceImage,
}

impl CoreCommand {
    /// Capture commands read live render state and bypass the control queue.
    pub fn is_capture(&self) -> bool {
        matches!(self, Self::CaptureOutputImage | Self::CaptureSourceImage)
    }

    /// Lifecycle event this command applies when it is accepted.
    pub fn lifecycle_event(&self) -> Option<LifecycleEvent> {
        match self {
            Self::Start => Some(LifecycleEvent::Start),
            Self::SetPauseEmulation(true) => Some(LifecycleEvent::Pause),
            Self::SetPauseEmulation(false) => Some(LifecycleEvent::Resume),
            Self::Stop => Some(LifecycleEvent::Stop),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Setup => "setup",
            Self::Start => "start",
            Self::Reset => "reset",
            Self::Stop => "stop",
            Self::SetPauseEmulation(_) => "set_pause_emulation",
            Self::SetVolume(_) => "set_volume",
            Self::SetAudioOutputDevice(_) => "set_audio_output_device",
            Self::SetOutputBounds(_) => "set_output_bounds",
            Self::SetBackingScaleFactor(_) => "set_backing_scale_factor",
            Self::SetShader(_) => "set_shader",
            Self::SetShaderParameterValue { .. } => "set_shader_parameter_value",
            Self::SaveState(_) => "save_state",
            Self::LoadState(_) => "load_state",
            Self::SetCheat(_) => "set_cheat",
            Self::SetDisc(_) => "set_disc",
            Self::ChangeDisplayMode(_) => "change_display_mode",
            Self::InsertFile(_) => "insert_file",
            Self::HandleMouseEvent(_) => "handle_mouse_event",
            Self::HandleKeyEvent(_) => "handle_key_event",
            Self::SystemBindingSet(_) => "system_binding_set",
            Self::SystemBindingUnset(_) => "system_binding_unset",
            Self::SetHandleEvents(_) => "set_handle_events",
            Self::SetHandleKeyboardEvents(_) => "set_handle_keyboard_events",
            Self::SetEffectsMode(_) => "set_effects_mode",
            Self::CaptureOutputImage => "capture_output_image",
            Self::CaptureSourceImage => "capture_source_image",
        }
    }
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandOutput {
    Unit,
    Setup(SetupResult),
    Image(CapturedImage),
}

impl CommandOutput {
    pub fn into_unit(self) -> Result<()> {
        match self {
            Self::Unit => Ok(()),
            other => Err(unexpected("unit", &other)),
        }
    }

    pub fn into_setup(self) -> Result<SetupResult> {
        match self {
            Self::Setup(result) => Ok(result),
            other => Err(unexpected("setup", &other)),
        }
    }

    pub fn into_image(self) -> Result<CapturedImage> {
        match self {
            Self::Image(image) => Ok(image),
            other => Err(unexpected("image", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &CommandOutput) -> CoreError {
    let kind = match got {
        CommandOutput::Unit => "unit",
        CommandOutput::Setup(_) => "setup",
        CommandOutput::Image(_) => "image",
    };
    CoreError::InvalidConnection(format!("expected {} reply, got {}", expected, kind))
}

/// Core → owner message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Notification {
    SaveState,
    LoadState,
    QuickSave,
    QuickLoad,
    ToggleFullScreen,
    ToggleAudioMute,
    VolumeUp,
    VolumeDown,
    StopEmulation,
    ResetEmulation,
    ToggleEmulationPaused,
    TakeScreenshot,
    FastForwardGameplay(bool),
    RewindGameplay(bool),
    StepGameplayFrameForward,
    StepGameplayFrameBackward,
    NextDisplayMode,
    LastDisplayMode,
    SetScreenSize { screen: IntSize, aspect: IntSize },
    SetDiscCount(u32),
    SetDisplayModes(Vec<DisplayMode>),
    PublishRenderContext { context_id: u32, size: IntSize },
    GameCoreDidTerminate,
}

/// Host → helper frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Connect {
        session_id: Uuid,
        protocol_version: u32,
    },
    Request {
        id: u64,
        command: CoreCommand,
    },
    Disconnect,
}

/// Helper → host frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperMessage {
    /// Handshake answer. `root_proxy` names the exported core object.
    Accept {
        root_proxy: Option<u64>,
        pid: u32,
    },
    Reply {
        id: u64,
        result: std::result::Result<CommandOutput, WireError>,
    },
    Notify {
        notification: Notification,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let json = serde_json::to_value(CoreCommand::SetVolume(0.5)).unwrap();
        assert_eq!(json["cmd"], "set_volume");
        assert_eq!(json["args"], 0.5);

        let json = serde_json::to_value(CoreCommand::Setup).unwrap();
        assert_eq!(json["cmd"], "setup");
    }

    #[test]
    fn test_only_captures_are_capture() {
        assert!(CoreCommand::CaptureOutputImage.is_capture());
        assert!(CoreCommand::CaptureSourceImage.is_capture());
        assert!(!CoreCommand::SaveState("a".into()).is_capture());
    }

    #[test]
    fn test_pause_maps_to_lifecycle_events() {
        assert_eq!(
            CoreCommand::SetPauseEmulation(true).lifecycle_event(),
            Some(LifecycleEvent::Pause)
        );
        assert_eq!(
            CoreCommand::SetPauseEmulation(false).lifecycle_event(),
            Some(LifecycleEvent::Resume)
        );
        assert_eq!(CoreCommand::SetDisc(2).lifecycle_event(), None);
    }

    #[test]
    fn test_reply_carries_wire_error() {
        let msg = HelperMessage::Reply {
            id: 7,
            result: Err(WireError {
                code: Some(-2),
                message: "corrupt".into(),
            }),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: HelperMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_output_kind_mismatch_is_connection_error() {
        let err = CommandOutput::Unit.into_setup().unwrap_err();
        assert!(err.is_connection_error());
    }
}
