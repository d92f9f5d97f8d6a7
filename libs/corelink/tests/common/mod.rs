// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared fixtures for the manager integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use corelink::core::owner::CoreOwner;
use corelink::{ChannelOwner, IntSize, OwnerEvent, PatternRom, StartupInfo};
use tokio::sync::mpsc::UnboundedReceiver;

pub const WIDE_SCREEN: IntSize = IntSize::new(96, 48);
pub const WIDE_ASPECT: IntSize = IntSize::new(16, 9);

/// Two display modes ("Standard" 64x48 and "Wide" 96x48), three discs.
pub fn demo_rom() -> PatternRom {
    PatternRom::new("demo")
        .with_mode("Wide", WIDE_SCREEN, WIDE_ASPECT)
        .with_discs(3)
}

pub fn write_rom(dir: &Path, rom: &PatternRom) -> PathBuf {
    let path = dir.join(format!("{}.json", rom.title));
    rom.write_to(&path).unwrap();
    path
}

/// Startup info for `rom_path` on the core registered under `core`.
pub fn startup(rom_path: &Path, core: &str) -> StartupInfo {
    StartupInfo::for_rom(rom_path, core, "test-system").unwrap()
}

pub struct TestOwner {
    pub owner: Arc<ChannelOwner>,
    pub events: UnboundedReceiver<OwnerEvent>,
}

impl TestOwner {
    pub fn new() -> Self {
        let (owner, events) = ChannelOwner::new();
        Self { owner, events }
    }

    pub fn weak(&self) -> Weak<dyn CoreOwner> {
        let owner: Arc<dyn CoreOwner> = self.owner.clone();
        Arc::downgrade(&owner)
    }

    /// Wait for the first event matching `pred`, dropping the others.
    pub async fn expect<F>(&mut self, timeout: Duration, mut pred: F) -> Option<OwnerEvent>
    where
        F: FnMut(&OwnerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) if pred(&event) => return Some(event),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Everything received within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<OwnerEvent> {
        let deadline = tokio::time::Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            seen.push(event);
        }
        seen
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn count_terminated(events: &[OwnerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, OwnerEvent::Terminated))
        .count()
}
