// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! CPU stand-in for the effects pass between the core's raw frame and the
//! published surface.
//!
//! Recognized shader parameters: `brightness` (multiplier, default 1.0) and
//! `scanlines` (darkening of odd rows in `[0, 1]`, default 0.0). Any other
//! parameter is carried but has no effect here.

use super::controls::ControlSnapshot;
use crate::core::surface::Frame;

#[derive(Debug, Default)]
pub struct Compositor;

impl Compositor {
    pub fn new() -> Self {
        Self
    }

    /// Compose `source` into `output` using the parameters in `params`.
    pub fn compose(&mut self, source: &Frame, params: &ControlSnapshot, output: &mut Frame) {
        output.resize(source.size);

        let Some(shader) = params.shader.as_ref() else {
            output.pixels.copy_from_slice(&source.pixels);
            return;
        };
        let brightness = shader.parameters.get("brightness").copied().unwrap_or(1.0).max(0.0);
        let scanlines = shader
            .parameters
            .get("scanlines")
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        let row_len = source.size.width as usize * 4;
        if row_len == 0 {
            return;
        }
        for (y, (src_row, out_row)) in source
            .pixels
            .chunks_exact(row_len)
            .zip(output.pixels.chunks_exact_mut(row_len))
            .enumerate()
        {
            let gain = if y % 2 == 1 {
                brightness * (1.0 - scanlines)
            } else {
                brightness
            };
            for (src, out) in src_row.chunks_exact(4).zip(out_row.chunks_exact_mut(4)) {
                out[0] = scale(src[0], gain);
                out[1] = scale(src[1], gain);
                out[2] = scale(src[2], gain);
                out[3] = src[3];
            }
        }
    }
}

fn scale(channel: u8, gain: f32) -> u8 {
    (channel as f32 * gain).round().clamp(0.0, 255.0) as u8
}
