/*! image_vault is a reference-counted, purgeable image resource cache for
render services.

A render service shares decoded bitmaps across a tree of drawable nodes,
across process boundaries, and across GPU contexts.  The expensive part of
that sharing is not the lookup, it is the lifetime story: a decoded buffer
may be referenced by several drawables, mid-flight across IPC, and derived
into a different GPU texture per render thread, all while a memory-pressure
sweep tries to unmap it.  This crate is that lifetime story, factored out.

# Higher-order resource handles

| Type                      | Role                                                 |
|---------------------------|------------------------------------------------------|
| [`pixels::PixelBuffer`]   | decoded pixel memory; the source of truth            |
| [`gpu::GpuImage`]         | GPU-resident derivation; a cache, never a source     |
| [`cache::ImageCache`]     | keyed tables, one lock each, plus batched release    |
| [`managed::ManagedImage`] | per-drawable handle; purge/reload state machine      |

The purge protocol is the point of the design: [`managed::ManagedImage::purge`]
may unmap the shared memory behind a buffer only when the cache can prove,
under one critical section, that no other holder could observe the bytes.
Failure to prove that is not an error; callers purge speculatively every
frame and the cache says yes or no.

# Backends

The cache core is backend-agnostic.  GPU images are produced through the
[`gpu::GpuContext`] capability trait; the in-tree
[`gpu::software::SoftwareContext`] backend keeps snapshots CPU-side so the
whole lifecycle can run (and be tested) without a GPU.  GL and Vulkan
contexts live with the surrounding render service and plug in through the
same trait.

*/

mod bittricks;
pub mod cache;
pub mod geometry;
pub mod gpu;
pub mod managed;
pub mod pixels;
pub mod unique_id;
pub mod wire;

pub use cache::{ImageCache, PurgeVerdict};
pub use managed::{ManagedImage, PurgeState};
pub use unique_id::UniqueId;
