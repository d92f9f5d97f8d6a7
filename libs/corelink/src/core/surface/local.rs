// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! In-process surfaces for the co-located strategy.

use super::Frame;
use crate::core::types::IntSize;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Surface shared by reference between the core thread and the host.
#[derive(Debug)]
pub struct LocalSurface {
    size: IntSize,
    latest: RwLock<Option<Arc<Frame>>>,
    generation: AtomicU64,
}

impl LocalSurface {
    pub(crate) fn new(size: IntSize) -> Self {
        Self {
            size,
            latest: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    pub(crate) fn publish(&self, frame: &Frame) {
        *self.latest.write() = Some(Arc::new(frame.clone()));
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.read().clone()
    }

    /// Number of frames published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Context id → surface map shared by a session's broker and the manager's
/// binder.
#[derive(Debug, Clone, Default)]
pub struct LocalSurfaceTable {
    inner: Arc<Mutex<HashMap<u32, Arc<LocalSurface>>>>,
}

impl LocalSurfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, context_id: u32, surface: Arc<LocalSurface>) {
        self.inner.lock().insert(context_id, surface);
    }

    pub(crate) fn remove(&self, context_id: u32) {
        self.inner.lock().remove(&context_id);
    }

    pub fn get(&self, context_id: u32) -> Option<Arc<LocalSurface>> {
        self.inner.lock().get(&context_id).cloned()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
