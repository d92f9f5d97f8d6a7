// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host-side core managers.
//!
//! A [`CoreManager`] drives one core through its lifecycle. Two strategies
//! implement it: [`ThreadCoreManager`] runs the core on a thread of the host
//! process, [`ProcessCoreManager`] runs it inside a helper process. Callers
//! pick one through [`create_manager`] and otherwise don't care which.

mod funnel;
mod process_manager;
mod thread_manager;

pub use process_manager::ProcessCoreManager;
pub use thread_manager::ThreadCoreManager;

use crate::core::channel::{CommandOutput, CoreCommand};
use crate::core::config::{ManagerConfig, ManagerStrategy};
use crate::core::lifecycle::LifecycleState;
use crate::core::owner::CoreOwner;
use crate::core::plugin::CoreRegistry;
use crate::core::session_id::SessionId;
use crate::core::startup::StartupInfo;
use crate::core::surface::{PresentationLayer, RenderContextHandle};
use crate::core::types::{
    BindingEvent, CapturedImage, Cheat, EffectsMode, KeyEvent, MouseEvent, OutputBounds, SetupResult,
    ShaderConfig, Volume,
};
use crate::core::{CoreError, Result};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Weak};

/// Boxed future type for async trait methods (required for dyn compatibility).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Unified interface for driving a core.
///
/// Implemented by `ThreadCoreManager` (co-located) and `ProcessCoreManager`
/// (isolated helper). Callers use this trait and don't need to know which.
///
/// # Submission
///
/// Every async operation is submitted when it is called, not when the
/// returned future is first polled. Completions resolve in submission order,
/// except captures, which sample the live render state.
///
/// # Lifecycle
///
/// Only `load_rom` is accepted in `Created`. While `Loading`, `setup` is
/// accepted and control operations submitted after it are replayed once the
/// core is ready. After `stop` is accepted, and in every terminal state,
/// operations fail with [`CoreError::NotRunning`] without reaching the core.
pub trait CoreManager: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn state(&self) -> LifecycleState;

    /// Startup info passed to `load_rom`, once it has been called.
    fn startup_info(&self) -> Option<StartupInfo>;

    /// Submit one command. All async operations funnel through here.
    #[must_use]
    fn submit(&self, command: CoreCommand) -> BoxFuture<'static, Result<CommandOutput>>;

    /// Attach a presentation layer to a published render context.
    fn bind_render_context(&self, handle: RenderContextHandle) -> Result<PresentationLayer>;

    /// Tear the manager down without waiting for the core. Suppresses the
    /// termination callback.
    fn shutdown(&self);

    // =========================================================================
    // Operations
    // =========================================================================

    #[must_use]
    fn load_rom(&self, info: StartupInfo) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::Load(info)))
    }

    #[must_use]
    fn setup(&self) -> BoxFuture<'static, Result<SetupResult>> {
        let pending = self.submit(CoreCommand::Setup);
        Box::pin(async move { pending.await?.into_setup() })
    }

    #[must_use]
    fn start(&self) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::Start))
    }

    #[must_use]
    fn reset(&self) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::Reset))
    }

    #[must_use]
    fn stop(&self) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::Stop))
    }

    #[must_use]
    fn set_pause_emulation(&self, paused: bool) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetPauseEmulation(paused)))
    }

    /// Values outside `[0, 1]` are clamped; NaN mutes.
    #[must_use]
    fn set_volume(&self, volume: f32) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetVolume(Volume::clamped(volume).get())))
    }

    #[must_use]
    fn set_audio_output_device(&self, device: u32) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetAudioOutputDevice(device)))
    }

    #[must_use]
    fn set_output_bounds(&self, bounds: OutputBounds) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetOutputBounds(bounds)))
    }

    #[must_use]
    fn set_backing_scale_factor(&self, scale: f64) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetBackingScaleFactor(scale)))
    }

    #[must_use]
    fn set_shader(&self, shader: ShaderConfig) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetShader(shader)))
    }

    #[must_use]
    fn set_shader_parameter_value(&self, name: &str, value: f32) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetShaderParameterValue {
            name: name.to_string(),
            value,
        }))
    }

    #[must_use]
    fn save_state(&self, path: PathBuf) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SaveState(path)))
    }

    #[must_use]
    fn load_state(&self, path: PathBuf) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::LoadState(path)))
    }

    #[must_use]
    fn set_cheat(&self, cheat: Cheat) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetCheat(cheat)))
    }

    #[must_use]
    fn set_disc(&self, disc: u32) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetDisc(disc)))
    }

    #[must_use]
    fn change_display_mode(&self, name: &str) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::ChangeDisplayMode(name.to_string())))
    }

    #[must_use]
    fn insert_file(&self, path: PathBuf) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::InsertFile(path)))
    }

    #[must_use]
    fn handle_mouse_event(&self, event: MouseEvent) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::HandleMouseEvent(event)))
    }

    #[must_use]
    fn handle_key_event(&self, event: KeyEvent) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::HandleKeyEvent(event)))
    }

    /// The host bound `binding.event` to a player's system control.
    #[must_use]
    fn set_system_binding(&self, binding: BindingEvent) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SystemBindingSet(binding)))
    }

    #[must_use]
    fn unset_system_binding(&self, binding: BindingEvent) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SystemBindingUnset(binding)))
    }

    #[must_use]
    fn set_handle_events(&self, enabled: bool) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetHandleEvents(enabled)))
    }

    #[must_use]
    fn set_handle_keyboard_events(&self, enabled: bool) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetHandleKeyboardEvents(enabled)))
    }

    #[must_use]
    fn set_effects_mode(&self, mode: EffectsMode) -> BoxFuture<'static, Result<()>> {
        unit(self.submit(CoreCommand::SetEffectsMode(mode)))
    }

    #[must_use]
    fn capture_output_image(&self) -> BoxFuture<'static, Result<CapturedImage>> {
        image(self.submit(CoreCommand::CaptureOutputImage))
    }

    #[must_use]
    fn capture_source_image(&self) -> BoxFuture<'static, Result<CapturedImage>> {
        image(self.submit(CoreCommand::CaptureSourceImage))
    }
}

fn unit(pending: BoxFuture<'static, Result<CommandOutput>>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move { pending.await?.into_unit() })
}

fn image(
    pending: BoxFuture<'static, Result<CommandOutput>>,
) -> BoxFuture<'static, Result<CapturedImage>> {
    Box::pin(async move { pending.await?.into_image() })
}

/// Already-failed submission.
pub(crate) fn rejected(error: CoreError) -> BoxFuture<'static, Result<CommandOutput>> {
    Box::pin(std::future::ready(Err(error)))
}

/// Create the manager `config.strategy` asks for.
///
/// The isolated strategy needs a tokio runtime; call from within one.
pub fn create_manager(
    config: &ManagerConfig,
    registry: CoreRegistry,
    owner: Weak<dyn CoreOwner>,
) -> Result<Arc<dyn CoreManager>> {
    match config.strategy {
        ManagerStrategy::CoLocated => Ok(Arc::new(ThreadCoreManager::new(registry, owner)?)),
        ManagerStrategy::Isolated => {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
                CoreError::Configuration(format!("isolated manager needs a tokio runtime: {}", e))
            })?;
            Ok(Arc::new(ProcessCoreManager::new(
                config.clone(),
                &registry,
                owner,
                runtime,
            )?))
        }
    }
}
