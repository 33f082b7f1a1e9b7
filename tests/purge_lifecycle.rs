// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! End-to-end purge lifecycle scenarios: speculative purging under memory
//! pressure, transparent reload on the next draw, and the safety gates that
//! keep a shared buffer mapped.

use image_vault::cache::ImageCache;
use image_vault::geometry::Rect;
use image_vault::gpu::SamplingOptions;
use image_vault::gpu::software::{Canvas, SoftwareContext};
use image_vault::managed::{ManagedImage, PurgeState};
use image_vault::pixels::{AllocatorKind, PixelBuffer, PixelFlags};
use std::sync::Arc;

fn gradient_buffer(allocator: AllocatorKind, flags: PixelFlags, content_id: u32) -> Arc<PixelBuffer> {
    //4x4 RGBA with distinct bytes per texel
    let bytes: Vec<u8> = (0..4 * 4 * 4).map(|i| (i * 7 % 251) as u8).collect();
    Arc::new(PixelBuffer::new(4, 4, allocator, flags, content_id, bytes))
}

#[test]
fn shared_memory_buffer_purges_and_reloads() {
    //id 42, shared memory, plain raster: the canonical purge candidate
    let cache = Arc::new(ImageCache::new());
    let buffer = gradient_buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 42);
    let image = ManagedImage::new(cache.clone());
    image.set_pixel_buffer(buffer.clone());

    image.mark_purgeable(true);
    assert_eq!(image.purge_state(), PurgeState::Enabled);

    image.purge();
    assert!(!buffer.is_mapped(), "sole holder's purge must unmap");

    //drawing reloads transparently
    let context = SoftwareContext::new();
    let mut canvas = Canvas::new(4, 4);
    image.draw_into(&context, &mut canvas, SamplingOptions::default());
    assert!(buffer.is_mapped(), "draw must remap before sampling");
    let expected = buffer.with_bytes(|b| b.to_vec()).unwrap();
    assert_eq!(canvas.pixels(), expected.as_slice());
}

#[test]
fn dma_yuv_buffer_never_becomes_purgeable() {
    //id 7, DMA but YUV: the format gate wins regardless of use counts
    let cache = Arc::new(ImageCache::new());
    let flags = PixelFlags {
        is_yuv: true,
        ..Default::default()
    };
    let buffer = gradient_buffer(AllocatorKind::Dma, flags, 7);
    let image = ManagedImage::new(cache);
    image.set_pixel_buffer(buffer.clone());

    image.mark_purgeable(true);
    assert_eq!(image.purge_state(), PurgeState::Disabled);

    image.purge();
    assert!(buffer.is_mapped());
}

#[test]
fn purge_is_a_no_op_while_a_second_holder_is_live() {
    let cache = Arc::new(ImageCache::new());
    let buffer = gradient_buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 43);
    let first = ManagedImage::new(cache.clone());
    first.set_pixel_buffer(buffer.clone());
    let second = ManagedImage::new(cache.clone());
    second.set_pixel_buffer(buffer.clone());

    first.mark_purgeable(true);
    assert!(first.is_purgeable());
    first.purge();
    assert!(
        buffer.is_mapped(),
        "two registered holders: the unmap must not happen"
    );

    //once the second holder is gone, the same speculative purge succeeds
    drop(second);
    first.purge();
    assert!(!buffer.is_mapped());
}

#[test]
fn purge_round_trip_draws_byte_identical_output() {
    let cache = Arc::new(ImageCache::new());
    let buffer = gradient_buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 44);
    let image = ManagedImage::new(cache.clone());
    image.set_pixel_buffer(buffer.clone());
    image.set_dst_rect(Rect::from_size(4.0, 4.0));

    let context = SoftwareContext::new();
    let mut before = Canvas::new(4, 4);
    image.draw_into(&context, &mut before, SamplingOptions::default());

    image.mark_purgeable(true);
    image.purge();
    assert!(!buffer.is_mapped());

    let mut after = Canvas::new(4, 4);
    image.draw_into(&context, &mut after, SamplingOptions::default());
    assert_eq!(
        before.pixels(),
        after.pixels(),
        "a purge/unpurge cycle must be invisible in the output"
    );
}

#[test]
fn repeated_speculative_purging_is_harmless() {
    //callers purge every frame; repeats and no-ops must stay cheap and safe
    let cache = Arc::new(ImageCache::new());
    let buffer = gradient_buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 45);
    let image = ManagedImage::new(cache.clone());
    image.set_pixel_buffer(buffer.clone());
    image.mark_purgeable(true);

    let context = SoftwareContext::new();
    for _ in 0..3 {
        image.purge();
        //the repeat sees an already-erased entry and backs off
        image.purge();
        assert!(!buffer.is_mapped());
        //drawing reloads and re-registers, making the next purge legal again
        let mut canvas = Canvas::new(4, 4);
        image.draw_into(&context, &mut canvas, SamplingOptions::default());
        assert!(buffer.is_mapped());
    }

    let mut canvas = Canvas::new(4, 4);
    image.draw_into(&context, &mut canvas, SamplingOptions::default());
    let expected = buffer.with_bytes(|b| b.to_vec()).unwrap();
    assert_eq!(canvas.pixels(), expected.as_slice());
}

#[test]
fn deferred_release_keeps_cache_entry_until_flush() {
    let cache = Arc::new(ImageCache::new());
    let buffer = gradient_buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 46);
    let id = {
        let image = ManagedImage::new(cache.clone());
        image.set_pixel_buffer(buffer);
        image.set_render_service_owned(true);
        image.id()
    };
    assert!(cache.get_pixel_buffer(id).is_some());
    assert!(cache.resident_bytes() > 0);
    cache.release_unique_id_list();
    assert!(cache.get_pixel_buffer(id).is_none());
    assert_eq!(cache.resident_bytes(), 0);
}
