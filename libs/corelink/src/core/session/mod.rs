// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Control execution context for one core.
//!
//! A session owns the live core on a dedicated thread. Commands arrive on a
//! run queue and are executed one at a time; between commands the thread
//! steps frames on the core's frame clock, composites them into the
//! published surface and feeds the audio context. The co-located manager
//! drives a session directly, the helper process drives one on behalf of a
//! remote manager.

mod audio;
mod compositor;
mod controls;

pub use audio::{AudioMonitor, AudioPump, AudioSink, NullAudioSink};
pub use compositor::Compositor;
pub use controls::{ControlParams, ControlSnapshot};

use crate::core::channel::{CommandOutput, CoreCommand, Notification, Responder};
use crate::core::plugin::{CoreEvents, CoreRegistry, GameCore, NotificationSink};
use crate::core::session_id::SessionId;
use crate::core::surface::{Frame, ProducerSurface, SurfaceBackend, SurfaceBroker};
use crate::core::types::{CapturedImage, DisplayMode, IntSize, Volume};
use crate::core::{CoreError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Everything a session needs besides its channels.
pub struct SessionConfig {
    pub session: SessionId,
    pub registry: CoreRegistry,
    pub surface_backend: SurfaceBackend,
    pub audio_sink: Box<dyn AudioSink>,
}

/// How a session thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// The core was stopped or the session was shut down.
    Finished,
    /// The core panicked; the message is the panic payload when printable.
    Panicked(String),
}

pub type ExitCallback = Box<dyn FnOnce(SessionExit) + Send + 'static>;

enum SessionMessage {
    Command(CoreCommand, Responder),
    Shutdown,
}

/// Last raw and composited frames, read by capture commands without going
/// through the run queue.
#[derive(Debug, Clone, Default)]
pub struct CaptureTap {
    inner: Arc<Mutex<CapturedFrames>>,
}

#[derive(Debug, Default)]
struct CapturedFrames {
    source: Option<Arc<Frame>>,
    output: Option<Arc<Frame>>,
}

impl CaptureTap {
    fn update(&self, source: &Frame, output: &Frame) {
        let source = Arc::new(source.clone());
        let output = Arc::new(output.clone());
        let mut inner = self.inner.lock();
        inner.source = Some(source);
        inner.output = Some(output);
    }

    /// Serve a capture command.
    pub fn capture(&self, command: &CoreCommand) -> Result<CommandOutput> {
        let frame = {
            let inner = self.inner.lock();
            match command {
                CoreCommand::CaptureOutputImage => inner.output.clone(),
                CoreCommand::CaptureSourceImage => inner.source.clone(),
                other => {
                    return Err(CoreError::Configuration(format!(
                        "'{}' is not a capture command",
                        other.name()
                    )));
                }
            }
        };
        frame
            .map(|f| CommandOutput::Image(f.to_image()))
            .ok_or_else(|| CoreError::NotReady("no frame rendered yet".into()))
    }

    pub fn output_image(&self) -> Option<CapturedImage> {
        self.inner.lock().output.as_ref().map(|f| f.to_image())
    }
}

/// Owner-side handle to a running session thread.
pub struct SessionHandle {
    session: SessionId,
    tx: Sender<SessionMessage>,
    tap: CaptureTap,
    audio_monitor: Arc<AudioMonitor>,
    thread: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Start the session thread. `notify` receives every core notification;
    /// `on_exit` runs once on the session thread when it ends.
    pub fn spawn(config: SessionConfig, notify: NotificationSink, on_exit: ExitCallback) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let tap = CaptureTap::default();
        let audio_monitor = Arc::new(AudioMonitor::default());
        let session = config.session;

        let state = SessionState::new(config, notify, tap.clone(), Arc::clone(&audio_monitor));
        let thread = std::thread::Builder::new()
            .name(format!("corelink-core-{}", session.short()))
            .spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
                    let mut state = state;
                    state.run(rx);
                }));
                let exit = match outcome {
                    Ok(()) => SessionExit::Finished,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!("[{}] Core panicked: {}", session.short(), message);
                        SessionExit::Panicked(message)
                    }
                };
                on_exit(exit);
            })?;

        tracing::info!("[{}] Session thread started", session.short());
        Ok(Self {
            session,
            tx,
            tap,
            audio_monitor,
            thread: Some(thread),
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queue a command. Hands the responder back if the session is gone.
    pub fn submit(
        &self,
        command: CoreCommand,
        responder: Responder,
    ) -> std::result::Result<(), Responder> {
        self.tx
            .send(SessionMessage::Command(command, responder))
            .map_err(|e| match e.into_inner() {
                SessionMessage::Command(_, responder) => responder,
                SessionMessage::Shutdown => Responder::detached("shutdown"),
            })
    }

    pub fn capture_tap(&self) -> &CaptureTap {
        &self.tap
    }

    pub fn audio_monitor(&self) -> Arc<AudioMonitor> {
        Arc::clone(&self.audio_monitor)
    }

    /// Ask the thread to exit after the commands already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(SessionMessage::Shutdown);
    }

    /// Shut down and wait for the thread.
    pub fn join(mut self) {
        self.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Default)]
struct Reported {
    sizes: Option<(IntSize, IntSize)>,
    discs: Option<u32>,
    modes: Option<Vec<DisplayMode>>,
}

struct SessionState {
    session: SessionId,
    registry: CoreRegistry,
    core: Option<Box<dyn GameCore>>,
    events: CoreEvents,
    notify: NotificationSink,
    params: ControlParams,
    broker: SurfaceBroker,
    surface: Option<ProducerSurface>,
    compositor: Compositor,
    source: Frame,
    output: Frame,
    audio_buf: Vec<f32>,
    audio: Option<AudioPump>,
    audio_sink: Option<Box<dyn AudioSink>>,
    audio_monitor: Arc<AudioMonitor>,
    tap: CaptureTap,
    set_up: bool,
    running: bool,
    paused: bool,
    stopped: bool,
    handle_events: bool,
    handle_keyboard_events: bool,
    next_frame_at: Option<Instant>,
    reported: Reported,
}

impl SessionState {
    fn new(
        config: SessionConfig,
        notify: NotificationSink,
        tap: CaptureTap,
        audio_monitor: Arc<AudioMonitor>,
    ) -> Self {
        Self {
            session: config.session,
            registry: config.registry,
            core: None,
            events: CoreEvents::new(Arc::clone(&notify)),
            notify,
            params: ControlParams::new(),
            broker: SurfaceBroker::new(config.session, config.surface_backend),
            surface: None,
            compositor: Compositor::new(),
            source: Frame::new(IntSize::default()),
            output: Frame::new(IntSize::default()),
            audio_buf: Vec::new(),
            audio: None,
            audio_sink: Some(config.audio_sink),
            audio_monitor,
            tap,
            set_up: false,
            running: false,
            paused: false,
            stopped: false,
            handle_events: true,
            handle_keyboard_events: true,
            next_frame_at: None,
            reported: Reported::default(),
        }
    }

    fn run(&mut self, rx: Receiver<SessionMessage>) {
        loop {
            let message = match self.next_frame_at {
                Some(at) => rx.recv_deadline(at),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match message {
                Ok(SessionMessage::Command(command, responder)) => {
                    let name = command.name();
                    let result = self.execute(command);
                    if let Err(e) = &result {
                        tracing::debug!("[{}] '{}' failed: {}", self.session.short(), name, e);
                    }
                    responder.resolve(result);
                    self.report_changes();
                    if self.stopped {
                        break;
                    }
                }
                Ok(SessionMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.step_frame(),
            }
        }

        // Outstanding commands resolve with a connection error when the
        // receiver drops.
        drop(rx);
        self.audio = None;
        self.surface = None;
        tracing::info!("[{}] Session finished", self.session.short());
    }

    fn core_mut(&mut self) -> Result<&mut Box<dyn GameCore>> {
        self.core
            .as_mut()
            .ok_or_else(|| CoreError::NotReady("no core loaded".into()))
    }

    fn execute(&mut self, command: CoreCommand) -> Result<CommandOutput> {
        tracing::debug!("[{}] Executing '{}'", self.session.short(), command.name());
        match command {
            CoreCommand::Load(info) => {
                if self.core.is_some() {
                    return Err(CoreError::PluginAlreadyLoaded(info.core_identifier()?));
                }
                let mut core = self.registry.instantiate(&info.core_identifier()?)?;
                core.load_rom(&info)?;
                if let Some(shader) = info.shader.clone() {
                    self.params.set_shader(shader);
                }
                let sink = self.audio_sink.take().unwrap_or_else(|| Box::new(NullAudioSink));
                self.audio = Some(AudioPump::spawn(
                    self.params.clone(),
                    sink,
                    core.audio_sample_rate(),
                    Arc::clone(&self.audio_monitor),
                )?);
                tracing::info!(
                    "[{}] Loaded {} with core '{}'",
                    self.session.short(),
                    info.rom_path.display(),
                    info.core_identifier()?
                );
                self.core = Some(core);
                Ok(CommandOutput::Unit)
            }
            CoreCommand::Setup => {
                let result = self.core_mut()?.setup()?;
                self.reported.sizes = Some((result.screen_size, result.aspect_size));
                self.source = Frame::new(result.screen_size);
                self.set_up = true;
                self.present();
                Ok(CommandOutput::Setup(result))
            }
            CoreCommand::Start => {
                self.core_mut()?.start()?;
                self.running = true;
                self.next_frame_at = Some(Instant::now());
                Ok(CommandOutput::Unit)
            }
            CoreCommand::Reset => self.core_mut()?.reset().map(|_| CommandOutput::Unit),
            CoreCommand::Stop => {
                let result = self.core_mut()?.stop();
                self.running = false;
                self.stopped = true;
                self.next_frame_at = None;
                result.map(|_| CommandOutput::Unit)
            }
            CoreCommand::SetPauseEmulation(paused) => {
                self.core_mut()?.set_paused(paused);
                self.params.set_paused(paused);
                self.paused = paused;
                self.next_frame_at = (self.running && !paused).then(Instant::now);
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetVolume(volume) => {
                self.params.set_volume(Volume::clamped(volume));
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetAudioOutputDevice(device) => {
                self.params.set_audio_device(device);
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetOutputBounds(bounds) => {
                self.params.set_bounds(bounds);
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetBackingScaleFactor(scale) => {
                self.params.set_backing_scale_factor(scale);
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetShader(shader) => {
                self.params.set_shader(shader);
                self.refresh_paused_output();
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetShaderParameterValue { name, value } => {
                self.params.set_shader_parameter(&name, value);
                self.refresh_paused_output();
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SaveState(path) => {
                self.core_mut()?.save_state(&path)?;
                tracing::info!("[{}] Saved state to {}", self.session.short(), path.display());
                Ok(CommandOutput::Unit)
            }
            CoreCommand::LoadState(path) => {
                self.core_mut()?.load_state(&path)?;
                tracing::info!("[{}] Loaded state from {}", self.session.short(), path.display());
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetCheat(cheat) => self.core_mut()?.set_cheat(&cheat).map(|_| CommandOutput::Unit),
            CoreCommand::SetDisc(disc) => self.core_mut()?.set_disc(disc).map(|_| CommandOutput::Unit),
            CoreCommand::ChangeDisplayMode(name) => self
                .core_mut()?
                .change_display_mode(&name)
                .map(|_| CommandOutput::Unit),
            CoreCommand::InsertFile(path) => {
                self.core_mut()?.insert_file(&path).map(|_| CommandOutput::Unit)
            }
            CoreCommand::HandleMouseEvent(event) => {
                if self.handle_events {
                    let events = self.events.clone();
                    self.core_mut()?.handle_mouse_event(&event, &events);
                }
                Ok(CommandOutput::Unit)
            }
            CoreCommand::HandleKeyEvent(event) => {
                if self.handle_events && self.handle_keyboard_events {
                    let events = self.events.clone();
                    self.core_mut()?.handle_key_event(&event, &events);
                }
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SystemBindingSet(binding) => {
                self.core_mut()?.system_binding_set(&binding);
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SystemBindingUnset(binding) => {
                self.core_mut()?.system_binding_unset(&binding);
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetHandleEvents(enabled) => {
                self.handle_events = enabled;
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetHandleKeyboardEvents(enabled) => {
                self.handle_keyboard_events = enabled;
                Ok(CommandOutput::Unit)
            }
            CoreCommand::SetEffectsMode(mode) => {
                self.params.set_effects_mode(mode);
                Ok(CommandOutput::Unit)
            }
            CoreCommand::CaptureOutputImage | CoreCommand::CaptureSourceImage => {
                self.tap.capture(&command)
            }
        }
    }

    fn step_frame(&mut self) {
        let Some(core) = self.core.as_mut() else {
            self.next_frame_at = None;
            return;
        };
        let interval = core.frame_interval();
        self.source.resize(core.screen_size());
        if let Err(e) = core.run_frame(&mut self.source, &mut self.audio_buf, &self.events) {
            tracing::warn!("[{}] Frame failed: {}", self.session.short(), e);
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.push(&self.audio_buf);
        }
        self.audio_buf.clear();

        self.present();
        self.report_changes();

        let now = Instant::now();
        let next = self.next_frame_at.map(|t| t + interval).unwrap_or(now + interval);
        self.next_frame_at = Some(if next < now { now + interval } else { next });
    }

    fn refresh_paused_output(&mut self) {
        if self.paused
            && self.params.snapshot().effects_mode == crate::core::types::EffectsMode::DisplayAlways
        {
            self.present();
        }
    }

    /// Composite the current source frame and publish it, minting a new
    /// surface when the output size changed.
    fn present(&mut self) {
        if !self.set_up || self.source.size.is_empty() {
            return;
        }
        let snapshot = self.params.snapshot();
        self.compositor.compose(&self.source, &snapshot, &mut self.output);

        if self.surface.as_ref().map(|s| s.size()) != Some(self.output.size) {
            self.surface = None;
            match self.broker.mint(self.output.size) {
                Ok(surface) => {
                    (self.notify)(Notification::PublishRenderContext {
                        context_id: surface.handle().context_id(),
                        size: surface.size(),
                    });
                    self.surface = Some(surface);
                }
                Err(e) => {
                    tracing::error!("[{}] Failed to create render surface: {}", self.session.short(), e);
                }
            }
        }
        if let Some(surface) = self.surface.as_mut() {
            if let Err(e) = surface.publish(&self.output) {
                tracing::warn!("[{}] Failed to publish frame: {}", self.session.short(), e);
            }
        }
        self.tap.update(&self.source, &self.output);
    }

    /// Tell the owner about passive state changes since the last report.
    fn report_changes(&mut self) {
        let Some(core) = self.core.as_ref() else {
            return;
        };

        let discs = core.disc_count();
        if self.reported.discs != Some(discs) {
            self.reported.discs = Some(discs);
            (self.notify)(Notification::SetDiscCount(discs));
        }

        let modes = core.display_modes();
        if self.reported.modes.as_ref() != Some(&modes) {
            self.reported.modes = Some(modes.clone());
            (self.notify)(Notification::SetDisplayModes(modes));
        }

        if !self.set_up {
            return;
        }
        let sizes = (core.screen_size(), core.aspect_size());
        if self.reported.sizes != Some(sizes) {
            self.reported.sizes = Some(sizes);
            tracing::info!(
                "[{}] Screen size changed to {} (aspect {})",
                self.session.short(),
                sizes.0,
                sizes.1
            );
            (self.notify)(Notification::SetScreenSize {
                screen: sizes.0,
                aspect: sizes.1,
            });
            if !self.running || self.paused {
                self.source.resize(sizes.0);
                self.present();
            }
        }
    }
}
