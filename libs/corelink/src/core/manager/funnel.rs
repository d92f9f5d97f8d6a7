// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Single-writer submission funnel shared by both managers.
//!
//! Every submission is validated against the projected lifecycle state (the
//! state after all previously accepted commands succeed) and then either
//! dispatched to the control context or held until its gate opens:
//!
//! ```text
//!   load ───────── held until a sink is attached
//!   setup ──────── held until load completed OK
//!   stop before setup ─ held until load completed OK
//!   everything else during Loading ─ held until setup completed OK (Ready)
//! ```
//!
//! Held commands are replayed strictly in submission order. Dispatch happens
//! under the funnel lock so concurrent submitters cannot interleave; any
//! completion that must be resolved as a result is resolved after the lock is
//! released.

use super::BoxFuture;
use crate::core::channel::{CommandOutput, CoreCommand, Responder};
use crate::core::lifecycle::{LifecycleEvent, LifecycleState};
use crate::core::{CoreError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Control execution context the funnel dispatches into.
pub(crate) trait ControlSink: Send + Sync {
    /// Hand `command` to the control context. Returns the responder if the
    /// context is gone; the caller resolves it.
    fn dispatch(&self, command: CoreCommand, responder: Responder) -> std::result::Result<(), Responder>;
}

/// Called with the new actual state whenever it changes. Runs outside the
/// funnel lock.
pub(crate) type StateObserver = Box<dyn Fn(LifecycleState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Attached,
    Loaded,
    Ready,
}

struct Envelope {
    command: CoreCommand,
    responder: Responder,
    gate: Gate,
}

struct FunnelState {
    actual: LifecycleState,
    projected: LifecycleState,
    setup_submitted: bool,
    stop_accepted: bool,
    load_done: bool,
    held: VecDeque<Envelope>,
    sink: Option<Arc<dyn ControlSink>>,
}

impl FunnelState {
    fn gate_open(&self, gate: Gate) -> bool {
        self.sink.is_some()
            && match gate {
                Gate::Attached => true,
                Gate::Loaded => self.load_done,
                Gate::Ready => self.actual.is_operable() || self.actual == LifecycleState::Stopped,
            }
    }

    /// Dispatch held commands whose gate is open, in order.
    fn flush(&mut self, failed: &mut Vec<Responder>) {
        while let Some(front) = self.held.front() {
            if !self.gate_open(front.gate) {
                break;
            }
            if let Some(envelope) = self.held.pop_front() {
                self.send(envelope.command, envelope.responder, failed);
            }
        }
    }

    fn send(&self, command: CoreCommand, responder: Responder, failed: &mut Vec<Responder>) {
        match &self.sink {
            Some(sink) => {
                if let Err(responder) = sink.dispatch(command, responder) {
                    failed.push(responder);
                }
            }
            None => failed.push(responder),
        }
    }

    fn set_actual(&mut self, state: LifecycleState, changed: &mut Option<LifecycleState>) {
        if self.actual != state {
            self.actual = state;
            *changed = Some(state);
        }
    }

    /// Enter `Failed` and give every held command back.
    fn fail(&mut self, changed: &mut Option<LifecycleState>) -> Vec<Responder> {
        self.set_actual(LifecycleState::Failed, changed);
        self.projected = LifecycleState::Failed;
        self.held.drain(..).map(|e| e.responder).collect()
    }
}

struct FunnelInner {
    label: String,
    state: Mutex<FunnelState>,
    observer: Option<StateObserver>,
}

/// Cheap to clone; all clones share one funnel.
#[derive(Clone)]
pub(crate) struct Funnel {
    inner: Arc<FunnelInner>,
}

impl Funnel {
    pub(crate) fn new(label: String, observer: Option<StateObserver>) -> Self {
        Self {
            inner: Arc::new(FunnelInner {
                label,
                state: Mutex::new(FunnelState {
                    actual: LifecycleState::Created,
                    projected: LifecycleState::Created,
                    setup_submitted: false,
                    stop_accepted: false,
                    load_done: false,
                    held: VecDeque::new(),
                    sink: None,
                }),
                observer,
            }),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.inner.state.lock().actual
    }

    /// Validate and route one command. Errors are local precondition
    /// failures; the peer never sees the command.
    pub(crate) fn submit(&self, command: CoreCommand) -> Result<BoxFuture<'static, Result<CommandOutput>>> {
        let name = command.name();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let future: BoxFuture<'static, Result<CommandOutput>> = Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(CoreError::connection_lost(name)))
        });

        if command.is_capture() {
            let sink = {
                let state = self.inner.state.lock();
                check_not_terminal(&state)?;
                if !state.actual.is_operable() {
                    return Err(not_ready(name));
                }
                state.sink.clone()
            };
            let Some(sink) = sink else {
                return Err(not_ready(name));
            };
            let responder = self.responder(&command, tx);
            if let Err(responder) = sink.dispatch(command, responder) {
                responder.resolve(Err(CoreError::connection_lost(name)));
            }
            return Ok(future);
        }

        let mut failed = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let gate = admit(&mut state, &command)?;
            tracing::debug!(
                "[{}] Accepted '{}' (projected {})",
                self.inner.label,
                name,
                state.projected
            );
            let responder = self.responder(&command, tx);
            if state.held.is_empty() && state.gate_open(gate) {
                state.send(command, responder, &mut failed);
            } else {
                state.held.push_back(Envelope {
                    command,
                    responder,
                    gate,
                });
            }
        }
        resolve_lost(failed);
        Ok(future)
    }

    /// Responder that applies the command's lifecycle effect, then wakes the
    /// caller. Only created for admitted commands.
    fn responder(
        &self,
        command: &CoreCommand,
        tx: tokio::sync::oneshot::Sender<Result<CommandOutput>>,
    ) -> Responder {
        let completion = Completion::for_command(command);
        let weak = Arc::downgrade(&self.inner);
        Responder::new(command.name(), move |result: Result<CommandOutput>| {
            complete(&weak, completion, result.is_ok());
            let _ = tx.send(result);
        })
    }

    /// Connect the control context and replay whatever it unblocks.
    pub(crate) fn attach(&self, sink: Arc<dyn ControlSink>) {
        let mut failed = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.actual.is_terminal() {
                return;
            }
            state.sink = Some(sink);
            state.flush(&mut failed);
        }
        resolve_lost(failed);
    }

    /// The control context could not be established. The held load resolves
    /// with `error`, everything else with `NotRunning`.
    pub(crate) fn abort_load(&self, error: CoreError) {
        let mut changed = None;
        let (load, rest) = {
            let mut state = self.inner.state.lock();
            let load = match state.held.front() {
                Some(e) if matches!(e.command, CoreCommand::Load(_)) => state.held.pop_front(),
                _ => None,
            };
            let rest = if state.actual.is_terminal() {
                state.held.drain(..).map(|e| e.responder).collect()
            } else {
                state.fail(&mut changed)
            };
            (load, rest)
        };
        tracing::warn!("[{}] Load aborted: {}", self.inner.label, error);
        if let Some(load) = load {
            load.responder.resolve(Err(error));
        }
        for responder in rest {
            responder.resolve(Err(CoreError::NotRunning));
        }
        self.notify(changed);
    }

    /// The peer is gone. Moves to `Crashed` unless already terminal and
    /// resolves every held command with a connection error. Returns true if
    /// this call crashed the manager.
    pub(crate) fn peer_lost(&self) -> bool {
        let mut changed = None;
        let held: Vec<Envelope> = {
            let mut state = self.inner.state.lock();
            state.sink = None;
            if !state.actual.is_terminal() {
                state.set_actual(LifecycleState::Crashed, &mut changed);
                state.projected = LifecycleState::Crashed;
            }
            state.held.drain(..).collect()
        };
        for envelope in held {
            let name = envelope.command.name();
            envelope
                .responder
                .resolve(Err(CoreError::connection_lost(name)));
        }
        let crashed = changed.is_some();
        if crashed {
            tracing::error!("[{}] Core connection lost", self.inner.label);
        }
        self.notify(changed);
        crashed
    }

    /// The host tore the manager down: behave as if stopped.
    pub(crate) fn tear_down(&self) {
        let mut changed = None;
        let held: Vec<Responder> = {
            let mut state = self.inner.state.lock();
            state.stop_accepted = true;
            state.sink = None;
            if !state.actual.is_terminal() {
                state.set_actual(LifecycleState::Stopped, &mut changed);
                state.projected = LifecycleState::Stopped;
            }
            state.held.drain(..).map(|e| e.responder).collect()
        };
        for responder in held {
            responder.resolve(Err(CoreError::NotRunning));
        }
        self.notify(changed);
    }

    fn notify(&self, changed: Option<LifecycleState>) {
        notify(&self.inner, changed);
    }
}

fn notify(inner: &FunnelInner, changed: Option<LifecycleState>) {
    if let Some(state) = changed {
        tracing::info!("[{}] State -> {}", inner.label, state);
        if let Some(observer) = &inner.observer {
            observer(state);
        }
    }
}

fn not_ready(command: &str) -> CoreError {
    CoreError::NotReady(format!("core not ready for '{}'", command))
}

fn check_not_terminal(state: &FunnelState) -> Result<()> {
    if state.stop_accepted || state.projected.is_terminal() {
        return Err(CoreError::NotRunning);
    }
    Ok(())
}

/// Validate `command` against the projected state and advance it.
fn admit(state: &mut FunnelState, command: &CoreCommand) -> Result<Gate> {
    check_not_terminal(state)?;
    let name = command.name();
    match command {
        CoreCommand::Load(_) => {
            if state.projected != LifecycleState::Created {
                return Err(CoreError::InvalidTransition(format!(
                    "'{}' in state {}",
                    name, state.projected
                )));
            }
            state.projected = state.projected.transition(LifecycleEvent::LoadRequested)?;
            state.actual = state.projected;
            Ok(Gate::Attached)
        }
        CoreCommand::Setup => match state.projected {
            LifecycleState::Created => Err(not_ready(name)),
            LifecycleState::Loading if !state.setup_submitted => {
                state.setup_submitted = true;
                state.projected = state.projected.transition(LifecycleEvent::SetupCompleted)?;
                Ok(Gate::Loaded)
            }
            other => Err(CoreError::InvalidTransition(format!("'{}' in state {}", name, other))),
        },
        _ => {
            if state.projected == LifecycleState::Created
                || (state.projected == LifecycleState::Loading && !matches!(command, CoreCommand::Stop))
            {
                return Err(not_ready(name));
            }
            let before_setup = !state.setup_submitted;
            if let Some(event) = command.lifecycle_event() {
                state.projected = state.projected.transition(event)?;
            }
            if matches!(command, CoreCommand::Stop) {
                state.stop_accepted = true;
                if before_setup {
                    return Ok(Gate::Loaded);
                }
            }
            Ok(Gate::Ready)
        }
    }
}

/// Lifecycle effect a command has once it completes.
#[derive(Debug, Clone, Copy)]
enum Completion {
    None,
    Load,
    Setup,
    Event(LifecycleEvent),
}

impl Completion {
    fn for_command(command: &CoreCommand) -> Self {
        match command {
            CoreCommand::Load(_) => Self::Load,
            CoreCommand::Setup => Self::Setup,
            other => other.lifecycle_event().map(Self::Event).unwrap_or(Self::None),
        }
    }
}

fn complete(weak: &Weak<FunnelInner>, completion: Completion, ok: bool) {
    if matches!(completion, Completion::None) {
        return;
    }
    let Some(inner) = weak.upgrade() else {
        return;
    };

    let mut changed = None;
    let mut failed = Vec::new();
    let mut refused = Vec::new();
    {
        let mut state = inner.state.lock();
        match (completion, ok) {
            (Completion::Load, true) => {
                state.load_done = true;
                state.flush(&mut failed);
            }
            (Completion::Setup, true) => {
                if let Ok(next) = state.actual.transition(LifecycleEvent::SetupCompleted) {
                    state.set_actual(next, &mut changed);
                    state.flush(&mut failed);
                }
            }
            (Completion::Load | Completion::Setup, false) => {
                if state.actual == LifecycleState::Loading {
                    refused = state.fail(&mut changed);
                }
            }
            (Completion::Event(LifecycleEvent::Stop), _) => {
                if !state.actual.is_terminal() {
                    state.set_actual(LifecycleState::Stopped, &mut changed);
                }
            }
            (Completion::Event(event), true) => {
                if let Ok(next) = state.actual.transition(event) {
                    state.set_actual(next, &mut changed);
                }
            }
            _ => {}
        }
    }
    resolve_lost(failed);
    for responder in refused {
        responder.resolve(Err(CoreError::NotRunning));
    }
    notify(&inner, changed);
}

fn resolve_lost(failed: Vec<Responder>) {
    for responder in failed {
        let name = responder.command();
        responder.resolve(Err(CoreError::connection_lost(name)));
    }
}
