// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Audio context: drains the core's samples on its own clock and applies
//! the pending volume once per block.

use super::controls::ControlParams;
use crate::core::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const BLOCK_PERIOD: Duration = Duration::from_millis(5);
const RING_SECONDS: u32 = 1;
const NO_VOLUME: u32 = u32::MAX;

/// Audio output device.
pub trait AudioSink: Send {
    fn select_device(&mut self, _device: u32) {}

    /// Receives interleaved stereo samples with volume applied.
    fn write(&mut self, samples: &[f32]);
}

/// Sink that discards audio. Used by the headless helper.
#[derive(Debug, Default)]
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn write(&mut self, _samples: &[f32]) {}
}

/// Counters published by the audio context.
#[derive(Debug)]
pub struct AudioMonitor {
    applied_volume: AtomicU32,
    blocks: AtomicU64,
    samples: AtomicU64,
}

impl Default for AudioMonitor {
    fn default() -> Self {
        Self {
            applied_volume: AtomicU32::new(NO_VOLUME),
            blocks: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }
}

impl AudioMonitor {
    /// Volume applied at the most recent block boundary.
    pub fn applied_volume(&self) -> Option<f32> {
        match self.applied_volume.load(Ordering::Acquire) {
            NO_VOLUME => None,
            bits => Some(f32::from_bits(bits)),
        }
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    fn record_block(&self, volume: f32, samples: usize) {
        self.applied_volume.store(volume.to_bits(), Ordering::Release);
        self.samples.fetch_add(samples as u64, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Audio thread fed through a lock-free SPSC ring.
pub struct AudioPump {
    producer: rtrb::Producer<f32>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    dropped: u64,
}

impl AudioPump {
    pub fn spawn(
        params: ControlParams,
        mut sink: Box<dyn AudioSink>,
        sample_rate: u32,
        monitor: Arc<AudioMonitor>,
    ) -> Result<Self> {
        let capacity = (sample_rate * 2 * RING_SECONDS) as usize;
        let (producer, mut consumer) = rtrb::RingBuffer::<f32>::new(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let block_len = ((sample_rate as u64 * 2 * BLOCK_PERIOD.as_millis() as u64) / 1000) as usize;

        let thread = std::thread::Builder::new()
            .name("corelink-audio".into())
            .spawn(move || {
                let mut block = Vec::with_capacity(block_len);
                let mut device = None;
                while !thread_stop.load(Ordering::Acquire) {
                    let snapshot = params.snapshot();
                    if snapshot.audio_device != device {
                        if let Some(id) = snapshot.audio_device {
                            tracing::info!("Audio output device -> {}", id);
                            sink.select_device(id);
                        }
                        device = snapshot.audio_device;
                    }

                    let volume = snapshot.volume.get();
                    block.clear();
                    if !snapshot.paused {
                        while block.len() < block_len {
                            match consumer.pop() {
                                Ok(sample) => block.push(sample * volume),
                                Err(_) => break,
                            }
                        }
                    }
                    if !block.is_empty() {
                        sink.write(&block);
                    }
                    monitor.record_block(volume, block.len());
                    std::thread::sleep(BLOCK_PERIOD);
                }
                tracing::debug!("Audio context exiting");
            })?;

        Ok(Self {
            producer,
            stop,
            thread: Some(thread),
            dropped: 0,
        })
    }

    /// Queue samples. Samples that do not fit are dropped.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let mut pushed = 0;
        for sample in samples {
            if self.producer.push(*sample).is_err() {
                break;
            }
            pushed += 1;
        }
        if pushed < samples.len() {
            self.dropped += (samples.len() - pushed) as u64;
            tracing::debug!(
                "Audio ring full, dropped {} samples ({} total)",
                samples.len() - pushed,
                self.dropped
            );
        }
        pushed
    }
}

impl Drop for AudioPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Audio context panicked");
            }
        }
    }
}
