// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Owner callbacks and the pump that delivers them off the core's threads.

use crate::core::channel::Notification;
use crate::core::session_id::SessionId;
use crate::core::surface::RenderContextHandle;
use crate::core::types::{DisplayMode, IntSize};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Host object that receives a core's requests and status reports.
///
/// Every method defaults to a no-op so owners only implement what they use.
/// Calls arrive on the notification pump thread, never on the caller's.
#[allow(unused_variables)]
pub trait CoreOwner: Send + Sync {
    fn save_state(&self) {}
    fn load_state(&self) {}
    fn quick_save(&self) {}
    fn quick_load(&self) {}
    fn toggle_full_screen(&self) {}
    fn toggle_audio_mute(&self) {}
    fn volume_up(&self) {}
    fn volume_down(&self) {}
    fn stop_emulation(&self) {}
    fn reset_emulation(&self) {}
    fn toggle_emulation_paused(&self) {}
    fn take_screenshot(&self) {}
    fn fast_forward_gameplay(&self, enabled: bool) {}
    fn rewind_gameplay(&self, enabled: bool) {}
    fn step_gameplay_frame_forward(&self) {}
    fn step_gameplay_frame_backward(&self) {}
    fn next_display_mode(&self) {}
    fn last_display_mode(&self) {}
    fn set_screen_size(&self, screen: IntSize, aspect: IntSize) {}
    fn set_disc_count(&self, count: u32) {}
    fn set_display_modes(&self, modes: Vec<DisplayMode>) {}
    fn publish_render_context(&self, handle: RenderContextHandle) {}
    fn game_core_did_terminate(&self) {}
}

/// Owner that ignores everything.
#[derive(Debug, Default)]
pub struct NoOwner;

impl CoreOwner for NoOwner {}

/// Owner reference for managers nobody listens to.
pub fn no_owner() -> Weak<dyn CoreOwner> {
    Weak::<NoOwner>::new()
}

/// Owner callback as a value, for hosts that prefer a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerEvent {
    Notification(Notification),
    RenderContext(RenderContextHandle),
    Terminated,
}

/// [`CoreOwner`] that forwards every callback into a tokio channel.
pub struct ChannelOwner {
    tx: tokio::sync::mpsc::UnboundedSender<OwnerEvent>,
}

impl ChannelOwner {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<OwnerEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, notification: Notification) {
        let _ = self.tx.send(OwnerEvent::Notification(notification));
    }
}

impl CoreOwner for ChannelOwner {
    fn save_state(&self) {
        self.forward(Notification::SaveState);
    }
    fn load_state(&self) {
        self.forward(Notification::LoadState);
    }
    fn quick_save(&self) {
        self.forward(Notification::QuickSave);
    }
    fn quick_load(&self) {
        self.forward(Notification::QuickLoad);
    }
    fn toggle_full_screen(&self) {
        self.forward(Notification::ToggleFullScreen);
    }
    fn toggle_audio_mute(&self) {
        self.forward(Notification::ToggleAudioMute);
    }
    fn volume_up(&self) {
        self.forward(Notification::VolumeUp);
    }
    fn volume_down(&self) {
        self.forward(Notification::VolumeDown);
    }
    fn stop_emulation(&self) {
        self.forward(Notification::StopEmulation);
    }
    fn reset_emulation(&self) {
        self.forward(Notification::ResetEmulation);
    }
    fn toggle_emulation_paused(&self) {
        self.forward(Notification::ToggleEmulationPaused);
    }
    fn take_screenshot(&self) {
        self.forward(Notification::TakeScreenshot);
    }
    fn fast_forward_gameplay(&self, enabled: bool) {
        self.forward(Notification::FastForwardGameplay(enabled));
    }
    fn rewind_gameplay(&self, enabled: bool) {
        self.forward(Notification::RewindGameplay(enabled));
    }
    fn step_gameplay_frame_forward(&self) {
        self.forward(Notification::StepGameplayFrameForward);
    }
    fn step_gameplay_frame_backward(&self) {
        self.forward(Notification::StepGameplayFrameBackward);
    }
    fn next_display_mode(&self) {
        self.forward(Notification::NextDisplayMode);
    }
    fn last_display_mode(&self) {
        self.forward(Notification::LastDisplayMode);
    }
    fn set_screen_size(&self, screen: IntSize, aspect: IntSize) {
        self.forward(Notification::SetScreenSize { screen, aspect });
    }
    fn set_disc_count(&self, count: u32) {
        self.forward(Notification::SetDiscCount(count));
    }
    fn set_display_modes(&self, modes: Vec<DisplayMode>) {
        self.forward(Notification::SetDisplayModes(modes));
    }
    fn publish_render_context(&self, handle: RenderContextHandle) {
        let _ = self.tx.send(OwnerEvent::RenderContext(handle));
    }
    fn game_core_did_terminate(&self) {
        let _ = self.tx.send(OwnerEvent::Terminated);
    }
}

enum PumpMessage {
    Notify(Notification),
    Terminated,
}

/// Delivers notifications to a weakly held owner on a dedicated thread.
///
/// Producers never block on the owner. Termination is delivered at most
/// once, and not at all after [`NotificationPump::suppress_termination`].
pub struct NotificationPump {
    session: SessionId,
    tx: Sender<PumpMessage>,
    terminated: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NotificationPump {
    pub fn spawn(session: SessionId, owner: Weak<dyn CoreOwner>) -> crate::core::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<PumpMessage>();
        let thread = std::thread::Builder::new()
            .name(format!("corelink-notify-{}", session.short()))
            .spawn(move || {
                for message in rx {
                    let Some(owner) = owner.upgrade() else {
                        tracing::debug!("[{}] Owner dropped, discarding notification", session.short());
                        continue;
                    };
                    match message {
                        PumpMessage::Notify(notification) => {
                            deliver(owner.as_ref(), session, notification)
                        }
                        PumpMessage::Terminated => owner.game_core_did_terminate(),
                    }
                }
            })?;
        Ok(Self {
            session,
            tx,
            terminated: Arc::new(AtomicBool::new(false)),
            thread: Some(thread),
        })
    }

    /// Cloneable sink that enqueues notifications for delivery.
    pub fn sink(&self) -> crate::core::plugin::NotificationSink {
        let tx = self.tx.clone();
        Arc::new(move |notification: Notification| {
            let _ = tx.send(PumpMessage::Notify(notification));
        })
    }

    /// Cloneable trigger for `game_core_did_terminate`.
    pub fn terminator(&self) -> Terminator {
        Terminator {
            session: self.session,
            tx: self.tx.clone(),
            fired: Arc::clone(&self.terminated),
        }
    }

    /// Prevent any future termination callback.
    pub fn suppress_termination(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}

impl Drop for NotificationPump {
    fn drop(&mut self) {
        // The thread exits once every sender clone is gone; joining here
        // could wait on sinks still held by the core.
        self.thread.take();
    }
}

/// Fires `game_core_did_terminate` at most once per session.
#[derive(Clone)]
pub struct Terminator {
    session: SessionId,
    tx: Sender<PumpMessage>,
    fired: Arc<AtomicBool>,
}

impl Terminator {
    /// Returns true if this call delivered the termination.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!("[{}] Notifying owner of core termination", self.session.short());
        let _ = self.tx.send(PumpMessage::Terminated);
        true
    }
}

fn deliver(owner: &dyn CoreOwner, session: SessionId, notification: Notification) {
    match notification {
        Notification::SaveState => owner.save_state(),
        Notification::LoadState => owner.load_state(),
        Notification::QuickSave => owner.quick_save(),
        Notification::QuickLoad => owner.quick_load(),
        Notification::ToggleFullScreen => owner.toggle_full_screen(),
        Notification::ToggleAudioMute => owner.toggle_audio_mute(),
        Notification::VolumeUp => owner.volume_up(),
        Notification::VolumeDown => owner.volume_down(),
        Notification::StopEmulation => owner.stop_emulation(),
        Notification::ResetEmulation => owner.reset_emulation(),
        Notification::ToggleEmulationPaused => owner.toggle_emulation_paused(),
        Notification::TakeScreenshot => owner.take_screenshot(),
        Notification::FastForwardGameplay(enabled) => owner.fast_forward_gameplay(enabled),
        Notification::RewindGameplay(enabled) => owner.rewind_gameplay(enabled),
        Notification::StepGameplayFrameForward => owner.step_gameplay_frame_forward(),
        Notification::StepGameplayFrameBackward => owner.step_gameplay_frame_backward(),
        Notification::NextDisplayMode => owner.next_display_mode(),
        Notification::LastDisplayMode => owner.last_display_mode(),
        Notification::SetScreenSize { screen, aspect } => owner.set_screen_size(screen, aspect),
        Notification::SetDiscCount(count) => owner.set_disc_count(count),
        Notification::SetDisplayModes(modes) => owner.set_display_modes(modes),
        Notification::PublishRenderContext { context_id, .. } => {
            owner.publish_render_context(RenderContextHandle::new(session, context_id))
        }
        Notification::GameCoreDidTerminate => owner.game_core_did_terminate(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(rx: &mut tokio::sync::mpsc::UnboundedReceiver<OwnerEvent>) -> OwnerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_render_context_is_scoped_to_session() {
        let session = SessionId::new();
        let (owner, mut rx) = ChannelOwner::new();
        let weak: Weak<dyn CoreOwner> = Arc::downgrade(&(owner.clone() as Arc<dyn CoreOwner>));
        let pump = NotificationPump::spawn(session, weak).unwrap();

        (pump.sink())(Notification::PublishRenderContext {
            context_id: 3,
            size: IntSize::new(8, 8),
        });
        assert_eq!(
            next(&mut rx).await,
            OwnerEvent::RenderContext(RenderContextHandle::new(session, 3))
        );
    }

    #[tokio::test]
    async fn test_termination_delivered_once() {
        let (owner, mut rx) = ChannelOwner::new();
        let weak: Weak<dyn CoreOwner> = Arc::downgrade(&(owner.clone() as Arc<dyn CoreOwner>));
        let pump = NotificationPump::spawn(SessionId::new(), weak).unwrap();

        let terminator = pump.terminator();
        assert!(terminator.fire());
        assert!(!terminator.fire());
        assert!(!pump.terminator().fire());
        (pump.sink())(Notification::QuickSave);

        assert_eq!(next(&mut rx).await, OwnerEvent::Terminated);
        assert_eq!(
            next(&mut rx).await,
            OwnerEvent::Notification(Notification::QuickSave)
        );
    }

    #[tokio::test]
    async fn test_suppressed_termination_never_fires() {
        let (owner, _rx) = ChannelOwner::new();
        let weak: Weak<dyn CoreOwner> = Arc::downgrade(&(owner.clone() as Arc<dyn CoreOwner>));
        let pump = NotificationPump::spawn(SessionId::new(), weak).unwrap();
        pump.suppress_termination();
        assert!(!pump.terminator().fire());
    }

    #[test]
    fn test_dropped_owner_is_silently_skipped() {
        let (owner, mut rx) = ChannelOwner::new();
        let weak: Weak<dyn CoreOwner> = Arc::downgrade(&(owner as Arc<dyn CoreOwner>));
        let pump = NotificationPump::spawn(SessionId::new(), weak).unwrap();
        (pump.sink())(Notification::VolumeUp);
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }
}
