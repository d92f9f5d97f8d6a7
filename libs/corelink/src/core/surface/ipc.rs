// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! iceoryx2-backed surfaces for the isolated strategy.
//!
//! Each render context is one publish-subscribe service named
//! `corelink/{session}/{context_id}` carrying `[u8]` slices. A sample is a
//! 16 byte header followed by the RGBA8 pixels:
//!
//! ```text
//! offset  0  u32 LE  width
//! offset  4  u32 LE  height
//! offset  8  u64 LE  sequence (1 for the first frame)
//! offset 16  ...     pixels, width * height * 4 bytes
//! ```
//!
//! iceoryx2 ports are not `Send`, so every port lives on its own thread and
//! the rest of the crate talks to it through channels and shared slots.

use super::Frame;
use crate::core::session_id::SessionId;
use crate::core::types::IntSize;
use crate::core::{CoreError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use iceoryx2::node::Node;
use iceoryx2::prelude::*;
use iceoryx2::port::update_connections::UpdateConnections;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) const HEADER_LEN: usize = 16;
const HISTORY_SIZE: usize = 1;
const SUBSCRIBER_BUFFER_SIZE: usize = 2;
/// How often an idle publisher refreshes its connections so late
/// subscribers receive the history sample.
const CONNECTION_REFRESH: Duration = Duration::from_millis(20);
const RECEIVE_POLL: Duration = Duration::from_millis(1);

type PixelService = iceoryx2::service::port_factory::publish_subscribe::PortFactory<
    ipc::Service,
    [u8],
    (),
>;

/// Service name of one render context.
pub fn service_name(session: SessionId, context_id: u32) -> String {
    format!("corelink/{}/{}", session.as_uuid().simple(), context_id)
}

fn pixel_service(node: &Node<ipc::Service>, name: &str, create: bool) -> Result<PixelService> {
    let service_name: ServiceName = name.try_into().map_err(|e| {
        CoreError::SurfaceTransport(format!("Invalid service name '{}': {:?}", name, e))
    })?;
    let builder = node
        .service_builder(&service_name)
        .publish_subscribe::<[u8]>()
        .history_size(HISTORY_SIZE)
        .subscriber_max_buffer_size(SUBSCRIBER_BUFFER_SIZE);
    if create {
        builder.open_or_create().map_err(|e| {
            CoreError::SurfaceTransport(format!("Failed to open/create service {}: {:?}", name, e))
        })
    } else {
        builder.open().map_err(|e| {
            CoreError::InvalidConnection(format!("render context {} is not live: {:?}", name, e))
        })
    }
}

fn create_node() -> Result<Node<ipc::Service>> {
    NodeBuilder::new()
        .create::<ipc::Service>()
        .map_err(|e| CoreError::SurfaceTransport(format!("Failed to create iceoryx2 node: {:?}", e)))
}

pub(crate) fn encode_header(size: IntSize, sequence: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&size.width.to_le_bytes());
    header[4..8].copy_from_slice(&size.height.to_le_bytes());
    header[8..16].copy_from_slice(&sequence.to_le_bytes());
    header
}

/// Split a sample into its frame and sequence. `None` for malformed samples.
pub(crate) fn decode_sample(payload: &[u8]) -> Option<(Frame, u64)> {
    let header = payload.get(..HEADER_LEN)?;
    let width = u32::from_le_bytes(header[0..4].try_into().ok()?);
    let height = u32::from_le_bytes(header[4..8].try_into().ok()?);
    let sequence = u64::from_le_bytes(header[8..16].try_into().ok()?);
    let size = IntSize::new(width, height);
    let pixels = payload.get(HEADER_LEN..)?;
    if pixels.len() != size.rgba_len() {
        return None;
    }
    Some((
        Frame {
            size,
            pixels: pixels.to_vec(),
        },
        sequence,
    ))
}

/// Wait for a port thread to report that its port exists.
fn await_ready(ready: Receiver<Result<()>>, thread: JoinHandle<()>) -> Result<JoinHandle<()>> {
    match ready.recv() {
        Ok(Ok(())) => Ok(thread),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(CoreError::SurfaceTransport(
                "surface thread exited during setup".into(),
            ))
        }
    }
}

/// Producer side of an iceoryx2 surface.
pub struct IpcSurfaceWriter {
    size: IntSize,
    sequence: u64,
    frames: Option<Sender<(Frame, u64)>>,
    thread: Option<JoinHandle<()>>,
}

impl IpcSurfaceWriter {
    pub fn create(session: SessionId, context_id: u32, size: IntSize) -> Result<Self> {
        if size.is_empty() {
            return Err(CoreError::Configuration(format!(
                "cannot create {} surface",
                size
            )));
        }
        let name = service_name(session, context_id);
        let (frames_tx, frames_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let max_slice_len = HEADER_LEN + size.rgba_len();

        let thread = std::thread::Builder::new()
            .name(format!("corelink-surface-pub-{}", context_id))
            .spawn(move || publisher_thread(name, max_slice_len, frames_rx, ready_tx))?;
        let thread = await_ready(ready_rx, thread)?;

        tracing::debug!(
            "[{}] Created iceoryx2 surface {} ({})",
            session.short(),
            context_id,
            size
        );
        Ok(Self {
            size,
            sequence: 0,
            frames: Some(frames_tx),
            thread: Some(thread),
        })
    }

    pub fn size(&self) -> IntSize {
        self.size
    }

    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.size != self.size || frame.pixels.len() != self.size.rgba_len() {
            return Err(CoreError::Configuration(format!(
                "frame {} does not fit surface {}",
                frame.size, self.size
            )));
        }
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| CoreError::SurfaceTransport("surface is closed".into()))?;
        self.sequence += 1;
        frames
            .send((frame.clone(), self.sequence))
            .map_err(|_| CoreError::SurfaceTransport("surface publisher thread exited".into()))
    }
}

impl Drop for IpcSurfaceWriter {
    fn drop(&mut self) {
        self.frames.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Surface publisher thread panicked");
            }
        }
    }
}

fn publisher_thread(
    name: String,
    max_slice_len: usize,
    frames: Receiver<(Frame, u64)>,
    ready: Sender<Result<()>>,
) {
    let setup = || -> Result<_> {
        let node = create_node()?;
        let service = pixel_service(&node, &name, true)?;
        let publisher = service
            .publisher_builder()
            .initial_max_slice_len(max_slice_len)
            .create()
            .map_err(|e| {
                CoreError::SurfaceTransport(format!("Failed to create publisher: {:?}", e))
            })?;
        Ok((node, service, publisher))
    };
    let (_node, _service, publisher) = match setup() {
        Ok(ports) => ports,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    loop {
        let (frame, sequence) = match frames.recv_timeout(CONNECTION_REFRESH) {
            // Only the newest queued frame matters.
            Ok(first) => frames.try_iter().last().unwrap_or(first),
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = publisher.update_connections() {
                    tracing::trace!("Surface {} connection refresh failed: {:?}", name, e);
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let header = encode_header(frame.size, sequence);
        let sample = match publisher.loan_slice_uninit(HEADER_LEN + frame.pixels.len()) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!("Surface {} could not loan a sample: {:?}", name, e);
                continue;
            }
        };
        let sample = sample.write_from_fn(|idx| {
            if idx < HEADER_LEN {
                header[idx]
            } else {
                frame.pixels[idx - HEADER_LEN]
            }
        });
        if let Err(e) = sample.send() {
            tracing::warn!("Surface {} could not send frame {}: {:?}", name, sequence, e);
        }
    }
    tracing::trace!("Surface {} publisher closed", name);
}

#[derive(Debug, Default)]
struct LatestFrame {
    frame: Mutex<Option<Frame>>,
    sequence: AtomicU64,
}

/// Host side of an iceoryx2 surface.
///
/// Receives on a background thread until dropped or until `valid` is
/// cleared, keeping only the newest frame.
#[derive(Debug)]
pub struct IpcSurfaceReader {
    latest: Arc<LatestFrame>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl IpcSurfaceReader {
    pub fn open(session: SessionId, context_id: u32, valid: Arc<AtomicBool>) -> Result<Self> {
        let name = service_name(session, context_id);
        let latest = Arc::new(LatestFrame::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let thread = {
            let latest = Arc::clone(&latest);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("corelink-surface-sub-{}", context_id))
                .spawn(move || subscriber_thread(name, latest, stop, valid, ready_tx))?
        };
        let thread = await_ready(ready_rx, thread)?;

        Ok(Self {
            latest,
            stop,
            thread: Some(thread),
        })
    }

    /// Size of the newest received frame, zero before the first one.
    pub fn size(&self) -> IntSize {
        self.latest
            .frame
            .lock()
            .as_ref()
            .map(|f| f.size)
            .unwrap_or_default()
    }

    pub fn generation(&self) -> u64 {
        self.latest.sequence.load(Ordering::Acquire)
    }

    pub fn read(&self) -> Option<Frame> {
        self.latest.frame.lock().clone()
    }
}

impl Drop for IpcSurfaceReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Surface subscriber thread panicked");
            }
        }
    }
}

fn subscriber_thread(
    name: String,
    latest: Arc<LatestFrame>,
    stop: Arc<AtomicBool>,
    valid: Arc<AtomicBool>,
    ready: Sender<Result<()>>,
) {
    let setup = || -> Result<_> {
        let node = create_node()?;
        let service = pixel_service(&node, &name, false)?;
        let subscriber = service
            .subscriber_builder()
            .buffer_size(SUBSCRIBER_BUFFER_SIZE)
            .create()
            .map_err(|e| {
                CoreError::SurfaceTransport(format!("Failed to create subscriber: {:?}", e))
            })?;
        Ok((node, service, subscriber))
    };
    let (_node, _service, subscriber) = match setup() {
        Ok(ports) => ports,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::Acquire) && valid.load(Ordering::Acquire) {
        loop {
            match subscriber.receive() {
                Ok(Some(sample)) => match decode_sample(sample.payload()) {
                    Some((frame, sequence)) => {
                        *latest.frame.lock() = Some(frame);
                        latest.sequence.store(sequence, Ordering::Release);
                    }
                    None => tracing::warn!("Surface {} dropped a malformed sample", name),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Surface {} receive failed: {:?}", name, e);
                    break;
                }
            }
        }
        std::thread::sleep(RECEIVE_POLL);
    }
    tracing::trace!("Surface {} subscriber closed", name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reads_header_and_pixels() {
        let size = IntSize::new(2, 1);
        let mut payload = encode_header(size, 7).to_vec();
        payload.extend_from_slice(&[9u8; 8]);

        let (frame, sequence) = decode_sample(&payload).unwrap();
        assert_eq!(sequence, 7);
        assert_eq!(frame.size, size);
        assert_eq!(frame.pixels, vec![9u8; 8]);
    }

    #[test]
    fn test_decode_rejects_short_pixels() {
        let mut payload = encode_header(IntSize::new(4, 4), 1).to_vec();
        payload.extend_from_slice(&[0u8; 10]);
        assert!(decode_sample(&payload).is_none());
        assert!(decode_sample(&payload[..8]).is_none());
    }

    #[test]
    fn test_service_names_are_scoped_to_session() {
        let a = service_name(SessionId::new(), 1);
        let b = service_name(SessionId::new(), 1);
        assert!(a.starts_with("corelink/"));
        assert!(a.ends_with("/1"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_writer_rejects_wrong_size() {
        let mut writer = IpcSurfaceWriter::create(SessionId::new(), 1, IntSize::new(2, 2)).unwrap();
        let err = writer.write(&Frame::new(IntSize::new(3, 3))).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn test_opening_unknown_service_is_not_live() {
        let valid = Arc::new(AtomicBool::new(true));
        let err = IpcSurfaceReader::open(SessionId::new(), 99, valid).unwrap_err();
        assert_eq!(err.code(), Some(CoreError::INVALID_HELPER_CONNECTION));
    }
}
