// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Co-located manager: the core runs on a session thread of the host.

use super::funnel::{ControlSink, Funnel};
use super::{BoxFuture, CoreManager, rejected};
use crate::core::channel::{CommandOutput, CoreCommand, Responder};
use crate::core::lifecycle::LifecycleState;
use crate::core::owner::{CoreOwner, NotificationPump, Terminator};
use crate::core::plugin::CoreRegistry;
use crate::core::session::{
    AudioMonitor, AudioSink, NullAudioSink, SessionConfig, SessionExit, SessionHandle,
};
use crate::core::session_id::SessionId;
use crate::core::startup::StartupInfo;
use crate::core::surface::{
    LocalSurfaceTable, PresentationLayer, RenderContextHandle, SurfaceBackend, SurfaceBinder,
};
use crate::core::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct SessionSink {
    session: Arc<SessionHandle>,
}

impl ControlSink for SessionSink {
    fn dispatch(&self, command: CoreCommand, responder: Responder) -> std::result::Result<(), Responder> {
        if command.is_capture() {
            responder.resolve(self.session.capture_tap().capture(&command));
            return Ok(());
        }
        self.session.submit(command, responder)
    }
}

/// Runs the core on a dedicated thread in this process.
///
/// Surfaces are shared by reference through an in-process table; the
/// handles published to the owner are the same type the isolated manager
/// publishes.
pub struct ThreadCoreManager {
    session_id: SessionId,
    registry: CoreRegistry,
    funnel: Funnel,
    surfaces: LocalSurfaceTable,
    binder: Arc<SurfaceBinder>,
    pump: NotificationPump,
    session: Arc<Mutex<Option<Arc<SessionHandle>>>>,
    audio_sink: Mutex<Option<Box<dyn AudioSink>>>,
    audio_monitor: Mutex<Option<Arc<AudioMonitor>>>,
    startup_info: Mutex<Option<StartupInfo>>,
    torn_down: Arc<AtomicBool>,
}

impl ThreadCoreManager {
    pub fn new(registry: CoreRegistry, owner: Weak<dyn CoreOwner>) -> Result<Self> {
        let session_id = SessionId::new();
        let surfaces = LocalSurfaceTable::new();
        let binder = Arc::new(SurfaceBinder::new(
            session_id,
            SurfaceBackend::InProcess(surfaces.clone()),
        ));
        let pump = NotificationPump::spawn(session_id, owner)?;
        let session: Arc<Mutex<Option<Arc<SessionHandle>>>> = Arc::new(Mutex::new(None));

        let observed_session = Arc::clone(&session);
        let funnel = Funnel::new(
            session_id.short(),
            Some(Box::new(move |state: LifecycleState| {
                if state == LifecycleState::Failed {
                    if let Some(session) = observed_session.lock().as_ref() {
                        session.shutdown();
                    }
                }
            })),
        );

        tracing::info!("[{}] Created co-located core manager", session_id.short());
        Ok(Self {
            session_id,
            registry,
            funnel,
            surfaces,
            binder,
            pump,
            session,
            audio_sink: Mutex::new(None),
            audio_monitor: Mutex::new(None),
            startup_info: Mutex::new(None),
            torn_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Route the core's audio to `sink` instead of discarding it. Takes
    /// effect at `load_rom`.
    pub fn with_audio_sink(self, sink: Box<dyn AudioSink>) -> Self {
        *self.audio_sink.lock() = Some(sink);
        self
    }

    /// Counters of the running audio context, once a ROM is loading.
    pub fn audio_monitor(&self) -> Option<Arc<AudioMonitor>> {
        self.audio_monitor.lock().clone()
    }

    fn start_session(&self) -> Result<Arc<dyn ControlSink>> {
        let audio_sink = self
            .audio_sink
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(NullAudioSink));
        let config = SessionConfig {
            session: self.session_id,
            registry: self.registry.clone(),
            surface_backend: SurfaceBackend::InProcess(self.surfaces.clone()),
            audio_sink,
        };

        let on_exit = {
            let label = self.session_id.short();
            let funnel = self.funnel.clone();
            let binder = Arc::clone(&self.binder);
            let terminator: Terminator = self.pump.terminator();
            let torn_down = Arc::clone(&self.torn_down);
            Box::new(move |exit: SessionExit| {
                match exit {
                    SessionExit::Finished => {
                        tracing::debug!("[{}] Session thread finished", label);
                    }
                    SessionExit::Panicked(message) => {
                        tracing::error!("[{}] Core crashed: {}", label, message);
                        binder.invalidate();
                        if funnel.peer_lost() && !torn_down.load(Ordering::Acquire) {
                            terminator.fire();
                        }
                    }
                }
            })
        };

        let handle = Arc::new(SessionHandle::spawn(config, self.pump.sink(), on_exit)?);
        *self.audio_monitor.lock() = Some(handle.audio_monitor());
        *self.session.lock() = Some(Arc::clone(&handle));
        Ok(Arc::new(SessionSink { session: handle }))
    }
}

impl CoreManager for ThreadCoreManager {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn state(&self) -> LifecycleState {
        self.funnel.state()
    }

    fn startup_info(&self) -> Option<StartupInfo> {
        self.startup_info.lock().clone()
    }

    fn submit(&self, command: CoreCommand) -> BoxFuture<'static, Result<CommandOutput>> {
        let info = match &command {
            CoreCommand::Load(info) => Some(info.clone()),
            _ => None,
        };
        let pending = match self.funnel.submit(command) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::debug!("[{}] Rejected locally: {}", self.session_id.short(), e);
                return rejected(e);
            }
        };

        if let Some(info) = info {
            tracing::info!(
                "[{}] Loading {} on a co-located core",
                self.session_id.short(),
                info.rom_path.display()
            );
            *self.startup_info.lock() = Some(info);
            match self.start_session() {
                Ok(sink) => self.funnel.attach(sink),
                Err(e) => self.funnel.abort_load(e),
            }
        }
        pending
    }

    fn bind_render_context(&self, handle: RenderContextHandle) -> Result<PresentationLayer> {
        self.binder.bind(handle)
    }

    fn shutdown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("[{}] Shutting down co-located core", self.session_id.short());
        self.pump.suppress_termination();
        self.funnel.tear_down();
        if let Some(session) = self.session.lock().take() {
            session.shutdown();
        }
        self.binder.invalidate();
    }
}

impl Drop for ThreadCoreManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadCoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCoreManager")
            .field("session", &self.session_id)
            .field("state", &self.funnel.state())
            .finish()
    }
}
