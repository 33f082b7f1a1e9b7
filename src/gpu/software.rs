// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
CPU fallback backend.

Derivation snapshots the source bytes; drawing blits the snapshot with
nearest sampling into an RGBA8 canvas.  This is the backend the tests run
on, and the one a render service falls back to with no GPU at all.
*/

use super::{Backend, GpuContext, GpuImage, ImagePayload, SamplingOptions};
use crate::geometry::Rect;
use crate::pixels::PixelBuffer;
use std::sync::Arc;

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Default)]
pub struct SoftwareContext;

impl SoftwareContext {
    pub fn new() -> Self {
        SoftwareContext
    }
}

impl GpuContext for SoftwareContext {
    fn backend(&self) -> Backend {
        Backend::Software
    }

    fn derive_image(&self, buffer: &PixelBuffer) -> Option<Arc<GpuImage>> {
        let snapshot = buffer.with_bytes(|bytes| bytes.to_vec().into_boxed_slice());
        match snapshot {
            Some(bytes) => Some(Arc::new(GpuImage::new(
                Backend::Software,
                buffer.width(),
                buffer.height(),
                ImagePayload::Software(bytes),
            ))),
            None => {
                logwise::warn_sync!(
                    "derive_image skipped: source buffer is unmapped ({content_id})",
                    content_id = buffer.content_id()
                );
                None
            }
        }
    }
}

/// A CPU render target: an RGBA8 grid the software backend draws into.
#[derive(Debug)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Canvas {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Blits `src` (in image coordinates) to `dst` (in canvas coordinates)
    /// with nearest sampling.  Draws from images with no CPU-readable
    /// payload log and skip; this path never fails.
    pub fn draw_image(&mut self, image: &GpuImage, src: Rect, dst: Rect, _sampling: SamplingOptions) {
        let Some(snapshot) = image.snapshot() else {
            logwise::warn_sync!("draw_image skipped: no CPU-readable payload for this backend");
            return;
        };
        if src.is_empty() || dst.is_empty() {
            return;
        }
        let image_width = image.width() as usize;
        let image_height = image.height() as usize;
        if image_width == 0 || image_height == 0 {
            return;
        }

        let dst_w = dst.width as usize;
        let dst_h = dst.height as usize;
        let dst_x0 = dst.x.max(0.0) as usize;
        let dst_y0 = dst.y.max(0.0) as usize;

        for dy in 0..dst_h {
            let cy = dst_y0 + dy;
            if cy >= self.height as usize {
                break;
            }
            //nearest: sample at the texel whose center maps into this row
            let sy = src.y + (dy as f32 + 0.5) / dst.height * src.height;
            let sy = (sy as usize).min(image_height - 1);
            for dx in 0..dst_w {
                let cx = dst_x0 + dx;
                if cx >= self.width as usize {
                    break;
                }
                let sx = src.x + (dx as f32 + 0.5) / dst.width * src.width;
                let sx = (sx as usize).min(image_width - 1);

                let src_offset = (sy * image_width + sx) * BYTES_PER_PIXEL;
                let dst_offset = (cy * self.width as usize + cx) * BYTES_PER_PIXEL;
                if src_offset + BYTES_PER_PIXEL > snapshot.len() {
                    continue;
                }
                self.pixels[dst_offset..dst_offset + BYTES_PER_PIXEL]
                    .copy_from_slice(&snapshot[src_offset..src_offset + BYTES_PER_PIXEL]);
            }
        }
    }
}
