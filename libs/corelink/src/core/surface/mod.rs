// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Render surface broker.
//!
//! The producing side (the core's session) mints a [`RenderContextHandle`]
//! per surface and announces it with a `PublishRenderContext` notification.
//! The host binds a [`PresentationLayer`] to the handle and reads whatever
//! the producer published last. Handles are scoped to one session: once the
//! session's connection is invalidated every layer stops reading.

pub mod ipc;
mod local;

pub use local::{LocalSurface, LocalSurfaceTable};

use crate::core::session_id::SessionId;
use crate::core::types::{CapturedImage, IntSize};
use crate::core::{CoreError, Result};
use ipc::{IpcSurfaceReader, IpcSurfaceWriter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// RGBA8 frame produced by a core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub size: IntSize,
    pub pixels: Vec<u8>,
}

impl Frame {
    /// Black frame of the given size.
    pub fn new(size: IntSize) -> Self {
        Self {
            size,
            pixels: vec![0; size.rgba_len()],
        }
    }

    /// Resize in place, zeroing the contents when the size changes.
    pub fn resize(&mut self, size: IntSize) {
        if self.size != size {
            self.size = size;
            self.pixels.clear();
            self.pixels.resize(size.rgba_len(), 0);
        }
    }

    pub fn to_image(&self) -> CapturedImage {
        CapturedImage {
            size: self.size,
            pixels: self.pixels.clone(),
        }
    }
}

/// Opaque name of a render surface within one session.
///
/// Two handles are equal only if they were minted by the same session, even
/// when their numeric context ids collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderContextHandle {
    session: SessionId,
    context_id: u32,
}

impl RenderContextHandle {
    pub fn new(session: SessionId, context_id: u32) -> Self {
        Self {
            session,
            context_id,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The fixed-width value that travels on the wire.
    pub fn context_id(&self) -> u32 {
        self.context_id
    }
}

impl std::fmt::Display for RenderContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.session.short(), self.context_id)
    }
}

/// How surfaces are shared between producer and host.
#[derive(Debug, Clone)]
pub enum SurfaceBackend {
    /// Direct `Arc` reference, same process.
    InProcess(LocalSurfaceTable),
    /// One iceoryx2 publish-subscribe service per surface.
    Ipc,
}

/// Producer-side handle factory for one session.
pub struct SurfaceBroker {
    session: SessionId,
    backend: SurfaceBackend,
    next_context_id: u32,
}

impl SurfaceBroker {
    pub fn new(session: SessionId, backend: SurfaceBackend) -> Self {
        Self {
            session,
            backend,
            next_context_id: 1,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Create a surface of `size` and mint its handle.
    pub fn mint(&mut self, size: IntSize) -> Result<ProducerSurface> {
        let context_id = self.next_context_id;
        self.next_context_id = self.next_context_id.wrapping_add(1).max(1);
        let handle = RenderContextHandle::new(self.session, context_id);

        let target = match &self.backend {
            SurfaceBackend::InProcess(table) => {
                let surface = Arc::new(LocalSurface::new(size));
                table.insert(context_id, Arc::clone(&surface));
                ProducerTarget::Local {
                    surface,
                    table: table.clone(),
                }
            }
            SurfaceBackend::Ipc => {
                ProducerTarget::Ipc(IpcSurfaceWriter::create(self.session, context_id, size)?)
            }
        };

        tracing::info!(
            "[{}] Minted render context {} ({})",
            self.session.short(),
            context_id,
            size
        );
        Ok(ProducerSurface {
            handle,
            size,
            target,
        })
    }
}

enum ProducerTarget {
    Local {
        surface: Arc<LocalSurface>,
        table: LocalSurfaceTable,
    },
    Ipc(IpcSurfaceWriter),
}

/// A surface the core's compositor writes into.
pub struct ProducerSurface {
    handle: RenderContextHandle,
    size: IntSize,
    target: ProducerTarget,
}

impl ProducerSurface {
    pub fn handle(&self) -> RenderContextHandle {
        self.handle
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    pub fn publish(&mut self, frame: &Frame) -> Result<()> {
        match &mut self.target {
            ProducerTarget::Local { surface, .. } => {
                surface.publish(frame);
                Ok(())
            }
            ProducerTarget::Ipc(writer) => writer.write(frame),
        }
    }
}

impl Drop for ProducerSurface {
    fn drop(&mut self) {
        if let ProducerTarget::Local { table, .. } = &self.target {
            table.remove(self.handle.context_id);
        }
    }
}

/// Host-side binder for one session's surfaces.
pub struct SurfaceBinder {
    session: SessionId,
    backend: SurfaceBackend,
    valid: Arc<AtomicBool>,
}

impl SurfaceBinder {
    pub fn new(session: SessionId, backend: SurfaceBackend) -> Self {
        Self {
            session,
            backend,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn bind(&self, handle: RenderContextHandle) -> Result<PresentationLayer> {
        if handle.session != self.session {
            return Err(CoreError::InvalidConnection(format!(
                "render context {} belongs to another session",
                handle
            )));
        }
        if !self.is_valid() {
            return Err(CoreError::connection_lost("bind_render_context"));
        }

        let source = match &self.backend {
            SurfaceBackend::InProcess(table) => {
                LayerSource::Local(table.get(handle.context_id).ok_or_else(|| {
                    CoreError::InvalidConnection(format!("render context {} is not live", handle))
                })?)
            }
            SurfaceBackend::Ipc => LayerSource::Ipc(IpcSurfaceReader::open(
                self.session,
                handle.context_id,
                Arc::clone(&self.valid),
            )?),
        };

        tracing::debug!("[{}] Bound presentation layer to {}", self.session.short(), handle);
        Ok(PresentationLayer {
            handle,
            valid: Arc::clone(&self.valid),
            source,
        })
    }

    /// Stop every layer of this session and release its surfaces. Idempotent.
    pub fn invalidate(&self) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        // Ipc subscribers observe `valid` and release their ports.
        if let SurfaceBackend::InProcess(table) = &self.backend {
            table.clear();
        }
        tracing::info!("[{}] Render surfaces invalidated", self.session.short());
    }
}

enum LayerSource {
    Local(Arc<LocalSurface>),
    Ipc(IpcSurfaceReader),
}

/// Host-side view of a published surface.
pub struct PresentationLayer {
    handle: RenderContextHandle,
    valid: Arc<AtomicBool>,
    source: LayerSource,
}

impl PresentationLayer {
    pub fn handle(&self) -> RenderContextHandle {
        self.handle
    }

    /// False once the owning connection has been invalidated.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn size(&self) -> IntSize {
        match &self.source {
            LayerSource::Local(surface) => surface.size(),
            LayerSource::Ipc(reader) => reader.size(),
        }
    }

    /// Frames published to this surface so far.
    pub fn generation(&self) -> u64 {
        match &self.source {
            LayerSource::Local(surface) => surface.generation(),
            LayerSource::Ipc(reader) => reader.generation(),
        }
    }

    /// Most recently published frame, or `None` when nothing was published
    /// or the session is gone.
    pub fn latest_frame(&self) -> Option<Frame> {
        if !self.is_valid() {
            return None;
        }
        match &self.source {
            LayerSource::Local(surface) => surface.latest().map(|f| (*f).clone()),
            LayerSource::Ipc(reader) => reader.read(),
        }
    }
}

impl std::fmt::Debug for PresentationLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationLayer")
            .field("handle", &self.handle)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(size: IntSize, value: u8) -> Frame {
        Frame {
            size,
            pixels: vec![value; size.rgba_len()],
        }
    }

    #[test]
    fn test_handles_from_different_sessions_never_equal() {
        let a = RenderContextHandle::new(SessionId::new(), 1);
        let b = RenderContextHandle::new(SessionId::new(), 1);
        assert_eq!(a.context_id(), b.context_id());
        assert_ne!(a, b);
    }

    #[test]
    fn test_broker_mints_increasing_ids() {
        let session = SessionId::new();
        let mut broker =
            SurfaceBroker::new(session, SurfaceBackend::InProcess(LocalSurfaceTable::new()));
        let first = broker.mint(IntSize::new(2, 2)).unwrap();
        let second = broker.mint(IntSize::new(4, 4)).unwrap();
        assert_eq!(first.handle().context_id(), 1);
        assert_eq!(second.handle().context_id(), 2);
        assert_eq!(second.handle().session(), session);
    }

    #[test]
    fn test_local_publish_is_visible_to_bound_layer() {
        let session = SessionId::new();
        let table = LocalSurfaceTable::new();
        let mut broker = SurfaceBroker::new(session, SurfaceBackend::InProcess(table.clone()));
        let binder = SurfaceBinder::new(session, SurfaceBackend::InProcess(table));

        let size = IntSize::new(2, 1);
        let mut surface = broker.mint(size).unwrap();
        let layer = binder.bind(surface.handle()).unwrap();
        assert!(layer.latest_frame().is_none());

        surface.publish(&frame(size, 42)).unwrap();
        assert_eq!(layer.latest_frame().unwrap(), frame(size, 42));
        assert_eq!(layer.generation(), 1);
    }

    #[test]
    fn test_binding_foreign_handle_fails() {
        let table = LocalSurfaceTable::new();
        let binder = SurfaceBinder::new(SessionId::new(), SurfaceBackend::InProcess(table.clone()));
        let mut other = SurfaceBroker::new(SessionId::new(), SurfaceBackend::InProcess(table));
        let surface = other.mint(IntSize::new(1, 1)).unwrap();

        let err = binder.bind(surface.handle()).unwrap_err();
        assert_eq!(err.code(), Some(CoreError::INVALID_HELPER_CONNECTION));
    }

    #[test]
    fn test_invalidate_stops_reading() {
        let session = SessionId::new();
        let table = LocalSurfaceTable::new();
        let mut broker = SurfaceBroker::new(session, SurfaceBackend::InProcess(table.clone()));
        let binder = SurfaceBinder::new(session, SurfaceBackend::InProcess(table.clone()));

        let size = IntSize::new(1, 1);
        let mut surface = broker.mint(size).unwrap();
        let layer = binder.bind(surface.handle()).unwrap();
        surface.publish(&frame(size, 1)).unwrap();

        binder.invalidate();
        assert!(!layer.is_valid());
        assert!(layer.latest_frame().is_none());
        assert!(table.is_empty());
        assert!(binder.bind(surface.handle()).is_err());
    }

    #[test]
    fn test_dropping_producer_unregisters_surface() {
        let table = LocalSurfaceTable::new();
        let mut broker =
            SurfaceBroker::new(SessionId::new(), SurfaceBackend::InProcess(table.clone()));
        let surface = broker.mint(IntSize::new(1, 1)).unwrap();
        assert_eq!(table.len(), 1);
        drop(surface);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ipc_round_trip_through_binder() {
        let session = SessionId::new();
        let mut broker = SurfaceBroker::new(session, SurfaceBackend::Ipc);
        let binder = SurfaceBinder::new(session, SurfaceBackend::Ipc);

        let size = IntSize::new(3, 2);
        let mut surface = broker.mint(size).unwrap();
        surface.publish(&frame(size, 5)).unwrap();
        // Bound after the first publish: history delivers the last frame.
        let layer = binder.bind(surface.handle()).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while layer.latest_frame().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(layer.latest_frame().unwrap(), frame(size, 5));
        assert_eq!(layer.size(), size);
        assert_eq!(layer.generation(), 1);

        binder.invalidate();
        assert!(layer.latest_frame().is_none());
        assert!(binder.bind(surface.handle()).is_err());
    }
}
