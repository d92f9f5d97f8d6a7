// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Isolated manager: the core runs inside a helper process.
//!
//! ```text
//!   host                                   helper
//!    │ spawn --session-id --core …           │
//!    │──────────────── Connect ─────────────▶│
//!    │◀─────────────── Accept ───────────────│   (bounded by handshake_timeout)
//!    │──────────────── Request{load} ───────▶│
//!    │◀─────────────── Reply / Notify ───────│
//!    │──────────────── Disconnect ──────────▶│   (after stop)
//! ```
//!
//! Requests are correlated by id. A reader task resolves replies and forwards
//! notifications; it and a waiter on the child process invalidate the
//! connection exactly once when the helper goes away.

use super::funnel::{ControlSink, Funnel};
use super::{BoxFuture, CoreManager, rejected};
use crate::core::channel::{
    CommandOutput, CoreCommand, HelperMessage, HostMessage, PROTOCOL_VERSION, Responder,
    read_frame, write_frame,
};
use crate::core::config::ManagerConfig;
use crate::core::lifecycle::LifecycleState;
use crate::core::owner::{CoreOwner, NotificationPump, Terminator};
use crate::core::plugin::{CorePluginInfo, CoreRegistry, NotificationSink};
use crate::core::session_id::SessionId;
use crate::core::startup::StartupInfo;
use crate::core::subprocess::{ProcessHandle, SubprocessConfig};
use crate::core::surface::{PresentationLayer, RenderContextHandle, SurfaceBackend, SurfaceBinder};
use crate::core::{CoreError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;

type LinkSlot = Arc<Mutex<Option<Arc<HelperLink>>>>;

#[derive(Default)]
struct PendingRequests {
    invalidated: bool,
    requests: BTreeMap<u64, Responder>,
}

/// Established connection to a helper.
struct HelperLink {
    label: String,
    outgoing: mpsc::UnboundedSender<HostMessage>,
    pending: Mutex<PendingRequests>,
    next_id: AtomicU64,
    process: ProcessHandle,
    funnel: Funnel,
    binder: Arc<SurfaceBinder>,
    terminator: Terminator,
    torn_down: Arc<AtomicBool>,
}

impl ControlSink for HelperLink {
    fn dispatch(&self, command: CoreCommand, responder: Responder) -> std::result::Result<(), Responder> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        if pending.invalidated {
            return Err(responder);
        }
        tracing::debug!("[{}] -> request {} '{}'", self.label, id, command.name());
        pending.requests.insert(id, responder);
        if self.outgoing.send(HostMessage::Request { id, command }).is_err() {
            return match pending.requests.remove(&id) {
                Some(responder) => Err(responder),
                None => Ok(()),
            };
        }
        Ok(())
    }
}

impl HelperLink {
    fn complete(&self, id: u64, result: Result<CommandOutput>) {
        let responder = self.pending.lock().requests.remove(&id);
        match responder {
            Some(responder) => responder.resolve(result),
            None => tracing::warn!("[{}] Reply for unknown request {}", self.label, id),
        }
    }

    /// Tear down the connection state exactly once.
    fn invalidate(&self, reason: &str) {
        let drained = {
            let mut pending = self.pending.lock();
            if pending.invalidated {
                return;
            }
            pending.invalidated = true;
            std::mem::take(&mut pending.requests)
        };

        tracing::warn!(
            "[{}] Helper connection invalidated ({}), failing {} outstanding request(s)",
            self.label,
            reason,
            drained.len()
        );
        for (_, responder) in drained {
            let name = responder.command();
            responder.resolve(Err(CoreError::connection_lost(name)));
        }

        let crashed = self.funnel.peer_lost();
        self.binder.invalidate();
        if crashed && !self.torn_down.load(Ordering::Acquire) {
            self.terminator.fire();
        }
    }

    /// Ask the helper to exit, killing it if it does not within `timeout`.
    async fn close(self: Arc<Self>, timeout: Duration) {
        tracing::info!("[{}] Disconnecting helper (pid {})", self.label, self.process.pid());
        let _ = self.outgoing.send(HostMessage::Disconnect);
        let exit = self.process.shutdown(timeout).await;
        tracing::debug!("[{}] Helper closed: {:?}", self.label, exit.status);
    }
}

/// What the connect task needs, detached from the manager.
struct Connector {
    session_id: SessionId,
    label: String,
    config: ManagerConfig,
    cores: Arc<[CorePluginInfo]>,
    runtime: tokio::runtime::Handle,
    funnel: Funnel,
    binder: Arc<SurfaceBinder>,
    terminator: Terminator,
    notify: NotificationSink,
    torn_down: Arc<AtomicBool>,
    slot: LinkSlot,
}

impl Connector {
    fn subprocess(&self) -> SubprocessConfig {
        let mut subprocess = SubprocessConfig::new("corelink-helper", self.config.resolved_helper_path())
            .with_arg("--session-id")
            .with_arg(self.session_id.to_string());
        for core in self.cores.iter() {
            let flag = if core.out_of_support {
                "--out-of-support-core"
            } else {
                "--core"
            };
            subprocess = subprocess.with_arg(flag).with_arg(core.identifier.clone());
        }
        subprocess = subprocess
            .with_args(self.config.helper_args.iter().cloned())
            .with_shutdown_timeout(self.config.shutdown_timeout());
        for (key, value) in &self.config.helper_env {
            subprocess = subprocess.with_env(key, value);
        }
        subprocess
    }

    /// Spawn the helper and run the handshake.
    async fn handshake(&self) -> Result<(ProcessHandle, ChildStdin, ChildStdout)> {
        let mut process = self.subprocess().spawn(&self.runtime)?;
        let (mut stdin, mut stdout) = process.take_stdio().ok_or_else(|| {
            CoreError::HelperCouldNotStartConnection("helper stdio unavailable".into())
        })?;

        let timeout = self.config.handshake_timeout();
        let exchange = async {
            write_frame(
                &mut stdin,
                &HostMessage::Connect {
                    session_id: *self.session_id.as_uuid(),
                    protocol_version: PROTOCOL_VERSION,
                },
            )
            .await
            .map_err(|e| CoreError::HelperNotRunning(format!("sending handshake: {}", e)))?;

            let accepted: Result<(Option<u64>, u32)> =
                match read_frame::<_, HelperMessage>(&mut stdout).await? {
                    Some(HelperMessage::Accept { root_proxy, pid }) => Ok((root_proxy, pid)),
                    Some(other) => Err(CoreError::InvalidConnection(format!(
                        "expected handshake accept, got {:?}",
                        other
                    ))),
                    None => Err(CoreError::HelperNotRunning(
                        "helper closed its connection during handshake".into(),
                    )),
                };
            accepted
        };

        let exchanged = tokio::time::timeout(timeout, exchange).await;
        let outcome = match exchanged {
            Ok(Ok((Some(_), pid))) => {
                tracing::info!(
                    "[{}] Handshake complete with helper pid {}",
                    self.label,
                    pid
                );
                return Ok((process, stdin, stdout));
            }
            Ok(Ok((None, _))) => CoreError::NilRootProxy,
            Ok(Err(e)) => e,
            Err(_) => CoreError::ConnectionTimedOut(format!(
                "helper did not accept within {:?}",
                timeout
            )),
        };
        tracing::error!("[{}] Handshake failed: {}", self.label, outcome);
        process.kill();
        Err(outcome)
    }

    async fn run(self) {
        let (process, stdin, stdout) = match self.handshake().await {
            Ok(connected) => connected,
            Err(e) => {
                self.funnel.abort_load(e);
                return;
            }
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let link = Arc::new(HelperLink {
            label: self.label.clone(),
            outgoing,
            pending: Mutex::new(PendingRequests::default()),
            next_id: AtomicU64::new(1),
            process,
            funnel: self.funnel.clone(),
            binder: Arc::clone(&self.binder),
            terminator: self.terminator.clone(),
            torn_down: Arc::clone(&self.torn_down),
        });

        self.runtime.spawn(write_loop(self.label.clone(), stdin, outgoing_rx));
        self.runtime
            .spawn(read_loop(Arc::clone(&link), stdout, Arc::clone(&self.notify)));
        let watcher = link.process.exit_watcher();
        let waiting = Arc::downgrade(&link);
        self.runtime.spawn(async move {
            let exit = watcher.wait().await;
            if let Some(link) = waiting.upgrade() {
                link.invalidate(&format!("helper exited ({:?})", exit.status));
            }
        });

        *self.slot.lock() = Some(Arc::clone(&link));
        self.funnel.attach(link.clone());
        if self.funnel.state().is_terminal() {
            self.runtime
                .spawn(Arc::clone(&link).close(self.config.shutdown_timeout()));
        }
    }
}

async fn write_loop(
    label: String,
    mut stdin: ChildStdin,
    mut outgoing: mpsc::UnboundedReceiver<HostMessage>,
) {
    while let Some(message) = outgoing.recv().await {
        let disconnect = matches!(message, HostMessage::Disconnect);
        if let Err(e) = write_frame(&mut stdin, &message).await {
            tracing::warn!("[{}] Failed to write to helper: {}", label, e);
            break;
        }
        if disconnect {
            break;
        }
    }
    tracing::debug!("[{}] Helper writer finished", label);
}

async fn read_loop(link: Arc<HelperLink>, mut stdout: ChildStdout, notify: NotificationSink) {
    loop {
        match read_frame::<_, HelperMessage>(&mut stdout).await {
            Ok(Some(HelperMessage::Reply { id, result })) => {
                tracing::debug!("[{}] <- reply {}", link.label, id);
                link.complete(id, result.map_err(CoreError::from));
            }
            Ok(Some(HelperMessage::Notify { notification })) => notify(notification),
            Ok(Some(HelperMessage::Accept { .. })) => {
                tracing::warn!("[{}] Ignoring repeated handshake accept", link.label);
            }
            Ok(None) => {
                link.invalidate("helper closed its connection");
                break;
            }
            Err(e) => {
                link.invalidate(&e.to_string());
                link.process.kill();
                break;
            }
        }
    }
}

/// Runs the core in a `corelink-helper` process.
///
/// Needs a tokio runtime: the handshake and the connection tasks run on the
/// handle given at construction.
pub struct ProcessCoreManager {
    session_id: SessionId,
    config: ManagerConfig,
    cores: Arc<[CorePluginInfo]>,
    runtime: tokio::runtime::Handle,
    funnel: Funnel,
    binder: Arc<SurfaceBinder>,
    pump: NotificationPump,
    slot: LinkSlot,
    startup_info: Mutex<Option<StartupInfo>>,
    torn_down: Arc<AtomicBool>,
}

impl ProcessCoreManager {
    /// `registry` decides which cores the helper may resolve; the helper
    /// binary has to provide them.
    pub fn new(
        config: ManagerConfig,
        registry: &CoreRegistry,
        owner: Weak<dyn CoreOwner>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        let session_id = SessionId::new();
        let binder = Arc::new(SurfaceBinder::new(session_id, SurfaceBackend::Ipc));
        let pump = NotificationPump::spawn(session_id, owner)?;
        let slot: LinkSlot = Arc::new(Mutex::new(None));

        // The funnel outlives neither the slot nor the link it holds.
        let observed_slot = Arc::downgrade(&slot);
        let observer_runtime = runtime.clone();
        let shutdown_timeout = config.shutdown_timeout();
        let funnel = Funnel::new(
            session_id.short(),
            Some(Box::new(move |state: LifecycleState| {
                if matches!(state, LifecycleState::Stopped | LifecycleState::Failed) {
                    let link = observed_slot.upgrade().and_then(|slot| slot.lock().clone());
                    if let Some(link) = link {
                        observer_runtime.spawn(link.close(shutdown_timeout));
                    }
                }
            })),
        );

        tracing::info!("[{}] Created isolated core manager", session_id.short());
        Ok(Self {
            session_id,
            config,
            cores: registry.plugins().cloned().collect(),
            runtime,
            funnel,
            binder,
            pump,
            slot,
            startup_info: Mutex::new(None),
            torn_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Process id of the helper, once connected.
    pub fn helper_pid(&self) -> Option<u32> {
        self.slot.lock().as_ref().map(|link| link.process.pid())
    }

    fn connector(&self) -> Connector {
        Connector {
            session_id: self.session_id,
            label: self.session_id.short(),
            config: self.config.clone(),
            cores: Arc::clone(&self.cores),
            runtime: self.runtime.clone(),
            funnel: self.funnel.clone(),
            binder: Arc::clone(&self.binder),
            terminator: self.pump.terminator(),
            notify: self.pump.sink(),
            torn_down: Arc::clone(&self.torn_down),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl CoreManager for ProcessCoreManager {
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
                "[{}] Loading {} in helper {}",
                self.session_id.short(),
                info.rom_path.display(),
                self.config.resolved_helper_path().display()
            );
            *self.startup_info.lock() = Some(info);
            self.runtime.spawn(self.connector().run());
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
        tracing::info!("[{}] Shutting down isolated core", self.session_id.short());
        self.pump.suppress_termination();
        // Stopped triggers the helper disconnect through the state observer.
        self.funnel.tear_down();
        self.binder.invalidate();
        self.slot.lock().take();
    }
}

impl Drop for ProcessCoreManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ProcessCoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCoreManager")
            .field("session", &self.session_id)
            .field("state", &self.funnel.state())
            .field("helper_pid", &self.helper_pid())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::owner::no_owner;
    use std::time::Instant;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_manager_releases_helper_link() {
        let runtime = tokio::runtime::Handle::current();
        let config = ManagerConfig::default().with_shutdown_timeout(Duration::from_millis(100));
        let manager = ProcessCoreManager::new(config, &CoreRegistry::new(), no_owner(), runtime.clone()).unwrap();

        let mut process = SubprocessConfig::new("sleeper", "sleep")
            .with_arg("30")
            .spawn(&runtime)
            .unwrap();
        let _stdio = process.take_stdio();
        let (outgoing, _outgoing_rx) = mpsc::unbounded_channel();
        let link = Arc::new(HelperLink {
            label: "test".into(),
            outgoing,
            pending: Mutex::new(PendingRequests::default()),
            next_id: AtomicU64::new(1),
            process,
            funnel: manager.funnel.clone(),
            binder: Arc::clone(&manager.binder),
            terminator: manager.pump.terminator(),
            torn_down: Arc::clone(&manager.torn_down),
        });
        *manager.slot.lock() = Some(Arc::clone(&link));
        manager.funnel.attach(link.clone());
        let released = Arc::downgrade(&link);
        drop(link);

        drop(manager);
        let deadline = Instant::now() + Duration::from_secs(5);
        while released.upgrade().is_some() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released.upgrade().is_none());
    }
}
