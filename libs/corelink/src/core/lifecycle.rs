// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Core manager lifecycle state machine.

use crate::core::{CoreError, Result};

/// Lifecycle of one hosted core.
///
/// # State Transitions
///
/// ```text
/// ┌─────────┐ load_rom  ┌─────────┐ setup ok ┌───────┐ start ┌─────────┐
/// │ Created │──────────►│ Loading │─────────►│ Ready │──────►│ Running │◄─┐
/// └─────────┘           └────┬────┘          └───┬───┘       └────┬────┘  │
///                            │ load error        │                │ pause │ resume
///                            ▼                   │                ▼       │
///                       ┌────────┐               │           ┌────────┐   │
///                       │ Failed │               │           │ Paused │───┘
///                       └────────┘               │           └────┬───┘
///                                                │ stop           │ stop
///                                                ▼                ▼
///                                           ┌─────────────────────────┐
///                                           │         Stopped         │
///                                           └─────────────────────────┘
///
/// Peer death from any non-terminal state: ──► Crashed
/// ```
///
/// `Stopped`, `Crashed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    /// Manager constructed, nothing loaded
    #[default]
    Created,
    /// ROM load and setup in progress
    Loading,
    /// Setup finished, core not yet started
    Ready,
    Running,
    Paused,
    Stopped,
    /// Peer died or the control context panicked
    Crashed,
    /// Load or setup failed
    Failed,
}

/// Inputs to [`LifecycleState::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    LoadRequested,
    SetupCompleted,
    LoadFailed,
    Start,
    Pause,
    Resume,
    Stop,
    PeerLost,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed | Self::Failed)
    }

    /// States in which control commands are dispatched straight to the core.
    pub fn is_operable(&self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Paused)
    }

    /// Apply an event, returning the next state or the local error the
    /// caller should see.
    pub fn transition(self, event: LifecycleEvent) -> Result<Self> {
        use LifecycleEvent as E;
        use LifecycleState as S;

        if self.is_terminal() {
            return match event {
                E::PeerLost => Ok(self),
                _ => Err(CoreError::NotRunning),
            };
        }

        match (self, event) {
            (_, E::PeerLost) => Ok(S::Crashed),
            (S::Created, E::LoadRequested) => Ok(S::Loading),
            (S::Created, _) => Err(CoreError::NotReady(format!(
                "{:?} requested before load_rom",
                event
            ))),
            (S::Loading, E::SetupCompleted) => Ok(S::Ready),
            (S::Loading, E::LoadFailed) => Ok(S::Failed),
            (S::Ready, E::Start) => Ok(S::Running),
            (S::Running | S::Paused, E::Pause) => Ok(S::Paused),
            (S::Running | S::Paused, E::Resume) => Ok(S::Running),
            (S::Loading | S::Ready | S::Running | S::Paused, E::Stop) => Ok(S::Stopped),
            (state, event) => Err(CoreError::InvalidTransition(format!(
                "{:?} is not valid in state {:?}",
                event, state
            ))),
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [LifecycleState; 8] = [
        LifecycleState::Created,
        LifecycleState::Loading,
        LifecycleState::Ready,
        LifecycleState::Running,
        LifecycleState::Paused,
        LifecycleState::Stopped,
        LifecycleState::Crashed,
        LifecycleState::Failed,
    ];

    #[test]
    fn test_default_is_created() {
        assert_eq!(LifecycleState::default(), LifecycleState::Created);
    }

    #[test]
    fn test_happy_path() {
        let s = LifecycleState::Created
            .transition(LifecycleEvent::LoadRequested)
            .and_then(|s| s.transition(LifecycleEvent::SetupCompleted))
            .and_then(|s| s.transition(LifecycleEvent::Start))
            .and_then(|s| s.transition(LifecycleEvent::Pause))
            .and_then(|s| s.transition(LifecycleEvent::Resume))
            .and_then(|s| s.transition(LifecycleEvent::Stop))
            .unwrap();
        assert_eq!(s, LifecycleState::Stopped);
    }

    #[test]
    fn test_terminal_states_reject_everything_but_peer_loss() {
        for state in ALL.iter().filter(|s| s.is_terminal()) {
            for event in [
                LifecycleEvent::LoadRequested,
                LifecycleEvent::Start,
                LifecycleEvent::Pause,
                LifecycleEvent::Stop,
            ] {
                assert!(matches!(state.transition(event), Err(CoreError::NotRunning)));
            }
            assert_eq!(state.transition(LifecycleEvent::PeerLost).unwrap(), *state);
        }
    }

    #[test]
    fn test_peer_loss_crashes_every_live_state() {
        for state in ALL.iter().filter(|s| !s.is_terminal()) {
            assert_eq!(
                state.transition(LifecycleEvent::PeerLost).unwrap(),
                LifecycleState::Crashed
            );
        }
    }

    #[test]
    fn test_commands_before_load_are_not_ready() {
        let err = LifecycleState::Created
            .transition(LifecycleEvent::Start)
            .unwrap_err();
        assert!(matches!(err, CoreError::NotReady(_)));
    }

    #[test]
    fn test_load_failure_only_from_loading() {
        assert_eq!(
            LifecycleState::Loading
                .transition(LifecycleEvent::LoadFailed)
                .unwrap(),
            LifecycleState::Failed
        );
        assert!(matches!(
            LifecycleState::Running.transition(LifecycleEvent::LoadFailed),
            Err(CoreError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_pause_requires_started_core() {
        assert!(matches!(
            LifecycleState::Ready.transition(LifecycleEvent::Pause),
            Err(CoreError::InvalidTransition(_))
        ));
        assert_eq!(
            LifecycleState::Paused
                .transition(LifecycleEvent::Pause)
                .unwrap(),
            LifecycleState::Paused
        );
    }

    #[test]
    fn test_is_operable() {
        assert!(!LifecycleState::Created.is_operable());
        assert!(!LifecycleState::Loading.is_operable());
        assert!(LifecycleState::Ready.is_operable());
        assert!(LifecycleState::Running.is_operable());
        assert!(LifecycleState::Paused.is_operable());
        assert!(!LifecycleState::Stopped.is_operable());
    }
}
