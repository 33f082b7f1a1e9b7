// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The GPU capability seam.

The cache core never talks to a graphics API.  It derives [GpuImage]s from
pixel buffers through the [GpuContext] trait, chosen once at process
configuration time; everything it needs to know about a backend fits in the
[Backend] tag.  GPU handles are not safely shareable across contexts or
render threads, which is why the cache memoizes derivations per thread
rather than per id alone.
*/

pub mod software;

use crate::pixels::PixelBuffer;
use std::sync::Arc;

/// Which graphics API produced a handle.  Selected at process configuration
/// time; the cache core treats all of these identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// No GPU available; images cannot be derived.
    None,
    OpenGl,
    Vulkan,
    /// CPU rasterization; keeps snapshots readable for tests.
    Software,
}

impl Backend {
    pub(crate) fn as_wire(self) -> u8 {
        match self {
            Backend::None => 0,
            Backend::OpenGl => 1,
            Backend::Vulkan => 2,
            Backend::Software => 3,
        }
    }
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Backend::None),
            1 => Some(Backend::OpenGl),
            2 => Some(Backend::Vulkan),
            3 => Some(Backend::Software),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ImagePayload {
    /// The handle lives in an external GPU context; nothing readable here.
    Opaque,
    /// Software backend keeps the snapshot bytes (RGBA8, row-major).
    Software(Box<[u8]>),
}

/// An opaque GPU-resident derivation of exactly one pixel buffer snapshot.
///
/// A GpuImage is a cache, never a source of truth: dropping one is a cache
/// miss, and it is always re-derivable from its pixel buffer.
#[derive(Debug)]
pub struct GpuImage {
    backend: Backend,
    width: u32,
    height: u32,
    payload: ImagePayload,
}

impl GpuImage {
    pub(crate) fn new(backend: Backend, width: u32, height: u32, payload: ImagePayload) -> Self {
        GpuImage {
            backend,
            width,
            height,
            payload,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The CPU-readable snapshot, when the backend keeps one.
    pub fn snapshot(&self) -> Option<&[u8]> {
        match &self.payload {
            ImagePayload::Software(bytes) => Some(bytes),
            ImagePayload::Opaque => None,
        }
    }
}

/// Creates GPU images from pixel data.  Thread affinity is implied by the
/// caller's current thread; the cache keys memoized results accordingly.
pub trait GpuContext: Send + Sync {
    fn backend(&self) -> Backend;

    /// Derives a GPU image from a mapped pixel buffer.  Returns None when
    /// the source is unmapped or the backend is out of resources; never
    /// panics.
    fn derive_image(&self, buffer: &PixelBuffer) -> Option<Arc<GpuImage>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

/// Sampling configuration for a draw.  The software canvas treats Linear as
/// Nearest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplingOptions {
    pub filter: Filter,
}
