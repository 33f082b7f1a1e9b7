// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Per-drawable-node image handles.

A [ManagedImage] owns (or references) exactly one logical pixel buffer,
lazily derives a GPU image from it, and walks the purge/reload state
machine:

```text
UNBOUND -> BOUND -> {DRAWN} -> {PURGED} -> BOUND (reload) -> RELEASED
```

The handle's own mutex guards its local fields only; cache-table state is
protected by the cache's per-table locks.  All operations here are
best-effort and soft-failing: a draw with nothing drawable logs and
returns, a purge whose preconditions fail leaves everything mapped.
*/

use crate::cache::{ImageCache, PurgeVerdict};
use crate::geometry::Rect;
use crate::gpu::software::Canvas;
use crate::gpu::{GpuContext, GpuImage, SamplingOptions};
use crate::pixels::PixelBuffer;
use crate::unique_id::{UniqueId, process_allocator};
use crate::wire::{self, WireError, WireReader, WireWriter};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const PURGE_UNINITIALIZED: u8 = 0;
const PURGE_ENABLED: u8 = 1;
const PURGE_DISABLED: u8 = 2;

/// Whether memory-pressure purging was enabled for the bound buffer.
/// One-shot: the first [ManagedImage::mark_purgeable] decides and the
/// decision is never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeState {
    Uninitialized,
    Enabled,
    Disabled,
}

/// Which cache table this handle registered against, so teardown decrements
/// the right one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    None,
    PixelBuffer,
    Editable,
    GpuImage,
}

#[derive(Debug)]
struct Fields {
    id: UniqueId,
    pixel_buffer: Option<Arc<PixelBuffer>>,
    gpu_image: Option<Arc<GpuImage>>,
    src_rect: Rect,
    dst_rect: Rect,
    is_drawn: bool,
    is_properties_dirty: bool,
    registration: Registration,
}

impl Fields {
    fn unbound() -> Self {
        Fields {
            id: UniqueId::INVALID,
            pixel_buffer: None,
            gpu_image: None,
            src_rect: Rect::ZERO,
            dst_rect: Rect::ZERO,
            is_drawn: false,
            is_properties_dirty: false,
            registration: Registration::None,
        }
    }
}

//Holds an extra external ref on the pixel-buffer entry while a draw is in
//flight, so a concurrent purge fails its use-count check instead of
//unmapping mid-draw.
struct UseGuard<'a> {
    cache: &'a ImageCache,
    id: UniqueId,
}

impl<'a> UseGuard<'a> {
    fn acquire(cache: &'a ImageCache, id: UniqueId, purgeable: bool) -> Option<Self> {
        if !purgeable || !id.is_bound() {
            return None;
        }
        cache.increase_pixel_buffer_ref(id);
        Some(UseGuard { cache, id })
    }
}

impl Drop for UseGuard<'_> {
    fn drop(&mut self) {
        self.cache.release_pixel_buffer(self.id);
    }
}

#[derive(Debug)]
pub struct ManagedImage {
    cache: Arc<ImageCache>,
    //guards local fields only, never cache-table state
    fields: Mutex<Fields>,
    purge_state: AtomicU8,
    is_render_service_owned: AtomicBool,
}

impl ManagedImage {
    /// An unbound handle.  Binds later through [Self::set_pixel_buffer] or
    /// [Self::set_gpu_image].
    pub fn new(cache: Arc<ImageCache>) -> Self {
        ManagedImage {
            cache,
            fields: Mutex::new(Fields::unbound()),
            purge_state: AtomicU8::new(PURGE_UNINITIALIZED),
            is_render_service_owned: AtomicBool::new(false),
        }
    }

    /// A handle over content produced already on-GPU; there is no backing
    /// pixel buffer and nothing to purge.
    pub fn from_gpu_image(cache: Arc<ImageCache>, image: Arc<GpuImage>) -> Self {
        let handle = Self::new(cache);
        handle.set_gpu_image(image);
        handle
    }

    pub fn id(&self) -> UniqueId {
        self.fields.lock().unwrap().id
    }

    pub fn is_drawn(&self) -> bool {
        self.fields.lock().unwrap().is_drawn
    }

    pub fn pixel_buffer(&self) -> Option<Arc<PixelBuffer>> {
        self.fields.lock().unwrap().pixel_buffer.clone()
    }

    pub fn set_render_service_owned(&self, owned: bool) {
        self.is_render_service_owned.store(owned, Ordering::Release);
    }

    /// Marks that the producing application mutated the buffer since the
    /// last send; receivers discard their editable cache for this id.
    pub fn set_properties_dirty(&self, dirty: bool) {
        self.fields.lock().unwrap().is_properties_dirty = dirty;
    }

    pub fn purge_state(&self) -> PurgeState {
        match self.purge_state.load(Ordering::Acquire) {
            PURGE_ENABLED => PurgeState::Enabled,
            PURGE_DISABLED => PurgeState::Disabled,
            _ => PurgeState::Uninitialized,
        }
    }

    pub fn is_purgeable(&self) -> bool {
        self.purge_state.load(Ordering::Acquire) == PURGE_ENABLED
    }

    /// Binds a decoded buffer: releases the old registration, registers the
    /// new buffer with the cache, resets the source rect to the full buffer,
    /// derives the id from the buffer's content id, and invalidates any
    /// derived GPU image.
    pub fn set_pixel_buffer(&self, buffer: Arc<PixelBuffer>) {
        let mut fields = self.fields.lock().unwrap();
        self.release_registration(&mut fields, false);
        let id = process_allocator().for_content(buffer.content_id());
        if self.cache.get_pixel_buffer(id).is_none() {
            self.cache.cache_pixel_buffer(id, buffer.clone());
        }
        self.cache.increase_pixel_buffer_ref(id);
        fields.id = id;
        fields.src_rect = Rect::from_size(buffer.width() as f32, buffer.height() as f32);
        fields.pixel_buffer = Some(buffer);
        fields.gpu_image = None;
        fields.is_drawn = false;
        fields.registration = Registration::PixelBuffer;
        //new content, new one-shot purge decision
        self.purge_state
            .store(PURGE_UNINITIALIZED, Ordering::Release);
    }

    /// Binds a direct GPU handle, bypassing the pixel-buffer path entirely.
    pub fn set_gpu_image(&self, image: Arc<GpuImage>) {
        let mut fields = self.fields.lock().unwrap();
        self.release_registration(&mut fields, false);
        fields.id = process_allocator().generate();
        fields.src_rect = Rect::from_size(image.width() as f32, image.height() as f32);
        fields.pixel_buffer = None;
        fields.gpu_image = Some(image);
        fields.is_drawn = false;
        self.purge_state
            .store(PURGE_UNINITIALIZED, Ordering::Release);
    }

    pub fn set_dst_rect(&self, rect: Rect) {
        let mut fields = self.fields.lock().unwrap();
        if fields.dst_rect == rect {
            return;
        }
        fields.dst_rect = rect;
        fields.is_drawn = false;
    }

    /// One-shot purge-eligibility check: transitions Uninitialized to
    /// Enabled when the feature flag is on and the bound buffer supports
    /// purging (shared-memory or DMA, plain immutable raster), Disabled
    /// otherwise.  Never re-evaluates once decided.
    pub fn mark_purgeable(&self, feature_enabled: bool) {
        let eligible = {
            let fields = self.fields.lock().unwrap();
            feature_enabled
                && fields
                    .pixel_buffer
                    .as_ref()
                    .map(|buffer| buffer.supports_purge())
                    .unwrap_or(false)
        };
        let next = if eligible {
            PURGE_ENABLED
        } else {
            PURGE_DISABLED
        };
        let _ = self.purge_state.compare_exchange(
            PURGE_UNINITIALIZED,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Best-effort memory reclamation.  No-op unless purging is enabled and
    /// the buffer is mapped; the cache's use-count check decides whether the
    /// unmap is safe, and a refusal means "someone else is using it", not an
    /// error.
    pub fn purge(&self) {
        if !self.is_purgeable() {
            return;
        }
        let mut fields = self.fields.lock().unwrap();
        let Some(buffer) = fields.pixel_buffer.clone() else {
            return;
        };
        if !buffer.is_mapped() {
            return;
        }
        match self.cache.check_ref_cnt_and_release(fields.id, &buffer) {
            PurgeVerdict::Released => {
                fields.gpu_image = None;
                fields.is_drawn = false;
                //the cache entry is gone; nothing left to decrement at teardown
                fields.registration = Registration::None;
                buffer.unmap();
                logwise::trace_sync!("purged image {id}", id = fields.id.raw());
            }
            PurgeVerdict::InUse(use_count) => {
                logwise::trace_sync!(
                    "purge skipped for {id}: use count {use_count}",
                    id = fields.id.raw(),
                    use_count = (use_count as u64)
                );
            }
        }
    }

    /// Reloads a purged buffer.  No-op while mapped.  Must run before any
    /// draw or content read; the draw path calls it unconditionally.
    pub fn unpurge(&self) {
        let fields = self.fields.lock().unwrap();
        if let Some(buffer) = &fields.pixel_buffer {
            if !buffer.is_mapped() && buffer.remap() {
                logwise::trace_sync!("remapped image {id}", id = fields.id.raw());
            }
        }
    }

    /// Draws into the canvas, deriving a GPU image on demand.
    ///
    /// The derivation is memoized per (id, current thread) in the cache,
    /// since GPU handles do not travel across contexts.  While a purgeable
    /// image is mid-draw, a use-count guard holds an extra registration so a
    /// concurrent purge backs off.  Failure to produce anything drawable
    /// logs and returns; this path never panics.
    pub fn draw_into(
        &self,
        context: &dyn GpuContext,
        canvas: &mut Canvas,
        sampling: SamplingOptions,
    ) {
        self.unpurge();
        let mut fields = self.fields.lock().unwrap();
        //a purged-then-reloaded buffer lost its cache slot; put it back
        if fields.registration == Registration::None
            && fields.id.is_bound()
            && fields.pixel_buffer.is_some()
        {
            if let Some(buffer) = &fields.pixel_buffer {
                if self.cache.get_pixel_buffer(fields.id).is_none() {
                    self.cache.cache_pixel_buffer(fields.id, buffer.clone());
                }
                self.cache.increase_pixel_buffer_ref(fields.id);
                fields.registration = Registration::PixelBuffer;
            }
        }
        let _use_guard = UseGuard::acquire(&self.cache, fields.id, self.is_purgeable());

        let image = if let Some(image) = &fields.gpu_image {
            image.clone()
        } else if let Some(buffer) = fields.pixel_buffer.clone() {
            let thread = std::thread::current().id();
            if let Some(cached) = self.cache.get_gpu_image_by_thread(fields.id, thread) {
                fields.gpu_image = Some(cached.clone());
                cached
            } else {
                match context.derive_image(&buffer) {
                    Some(derived) => {
                        self.cache
                            .cache_gpu_image_by_thread(fields.id, derived.clone(), thread);
                        fields.gpu_image = Some(derived.clone());
                        derived
                    }
                    None => {
                        logwise::warn_sync!(
                            "draw skipped: no GPU image derivable for {id}",
                            id = fields.id.raw()
                        );
                        return;
                    }
                }
            }
        } else {
            logwise::warn_sync!(
                "draw skipped: image {id} has no content",
                id = fields.id.raw()
            );
            return;
        };

        let src = fields.src_rect;
        let dst = if fields.dst_rect.is_empty() {
            Rect::from_size(src.width, src.height)
        } else {
            fields.dst_rect
        };
        canvas.draw_image(&image, src, dst, sampling);
        fields.is_drawn = true;
    }

    /// Writes one resource record.  Remaps a purged buffer first, since the
    /// payload slot needs the bytes.
    pub fn marshal(&self, writer: &mut WireWriter) {
        self.unpurge();
        let fields = self.fields.lock().unwrap();
        let uses_gpu_image = matches!(
            (&fields.pixel_buffer, &fields.gpu_image),
            (None, Some(_))
        );
        writer.write_bool(uses_gpu_image);
        writer.write_bool(fields.is_properties_dirty);
        writer.write_u64(fields.id.raw());
        writer.write_rect(fields.src_rect);
        writer.write_rect(fields.dst_rect);
        match (&fields.pixel_buffer, &fields.gpu_image) {
            (None, Some(image)) => {
                writer.write_payload(&wire::encode_gpu_image(image));
                writer.write_skip_marker();
            }
            (Some(buffer), _) => {
                writer.write_skip_marker();
                writer.write_payload(&wire::encode_pixel_buffer(buffer));
            }
            (None, None) => {
                writer.write_skip_marker();
                writer.write_skip_marker();
            }
        }
    }

    /// Reads one resource record, consulting the receiver-side cache.
    ///
    /// A cache hit on the id skips the payload bytes exactly and shares the
    /// cached resource; an editable hit with the dirty flag set discards the
    /// stale copy and re-deserializes.  The new handle registers itself with
    /// the cache before returning, so its teardown decrement always has a
    /// matching increment.  A malformed record fails this one resource; the
    /// caller abandons the handle and nothing else is affected.
    pub fn unmarshal(
        reader: &mut WireReader<'_>,
        cache: &Arc<ImageCache>,
    ) -> Result<ManagedImage, WireError> {
        let uses_gpu_image = reader.read_bool()?;
        let is_properties_dirty = reader.read_bool()?;
        let id = UniqueId::from_raw(reader.read_u64()?);
        let src_rect = reader.read_rect()?;
        let dst_rect = reader.read_rect()?;

        let mut fields = Fields {
            id,
            src_rect,
            dst_rect,
            is_properties_dirty,
            ..Fields::unbound()
        };

        if uses_gpu_image {
            if let Some(image) = cache.get_gpu_image(id) {
                reader.skip_payload()?;
                fields.gpu_image = Some(image);
                fields.registration = Registration::GpuImage;
            } else {
                let payload = reader.read_payload()?;
                if !payload.is_empty() {
                    let image = Arc::new(wire::decode_gpu_image(payload)?);
                    cache.cache_gpu_image(id, image.clone());
                    fields.gpu_image = Some(image);
                    fields.registration = Registration::GpuImage;
                }
            }
            //unused pixel-buffer slot
            reader.skip_payload()?;
        } else {
            //unused GPU image slot
            reader.skip_payload()?;
            if let Some(cached) = cache.get_editable_pixel_buffer(id) {
                if is_properties_dirty {
                    //sender mutated the content since last send; the cached
                    //copy is stale
                    cache.discard_editable_cache(id);
                    Self::read_pixel_payload(reader, cache, id, &mut fields)?;
                } else {
                    reader.skip_payload()?;
                    fields.pixel_buffer = Some(cached);
                    fields.registration = Registration::Editable;
                }
            } else if let Some(cached) = cache.get_pixel_buffer(id) {
                reader.skip_payload()?;
                fields.pixel_buffer = Some(cached);
                fields.registration = Registration::PixelBuffer;
            } else {
                Self::read_pixel_payload(reader, cache, id, &mut fields)?;
            }
        }

        let handle = ManagedImage {
            cache: cache.clone(),
            fields: Mutex::new(fields),
            purge_state: AtomicU8::new(PURGE_UNINITIALIZED),
            is_render_service_owned: AtomicBool::new(true),
        };
        handle.increase_cache_ref_count();
        Ok(handle)
    }

    fn read_pixel_payload(
        reader: &mut WireReader<'_>,
        cache: &Arc<ImageCache>,
        id: UniqueId,
        fields: &mut Fields,
    ) -> Result<(), WireError> {
        let payload = reader.read_payload()?;
        if payload.is_empty() {
            //unbound record; nothing to materialize
            return Ok(());
        }
        let buffer = Arc::new(wire::decode_pixel_buffer(payload)?);
        if buffer.flags().is_editable {
            if buffer.should_cache_editable() {
                cache.cache_editable_pixel_buffer(id, buffer.clone());
                fields.registration = Registration::Editable;
            }
            //non-qualifying editable content travels by value, uncached
        } else if id.is_bound() {
            cache.cache_pixel_buffer(id, buffer.clone());
            fields.registration = Registration::PixelBuffer;
        }
        fields.pixel_buffer = Some(buffer);
        Ok(())
    }

    //registers this handle against whichever table unmarshal resolved into
    fn increase_cache_ref_count(&self) {
        let fields = self.fields.lock().unwrap();
        if !fields.id.is_bound() {
            return;
        }
        match fields.registration {
            Registration::None => {}
            Registration::PixelBuffer => self.cache.increase_pixel_buffer_ref(fields.id),
            Registration::Editable => self.cache.increase_editable_ref(fields.id),
            Registration::GpuImage => self.cache.increase_gpu_image_ref(fields.id),
        }
    }

    //immediate==false defers a pixel-buffer release into the batched queue
    fn release_registration(&self, fields: &mut Fields, deferred: bool) {
        if fields.id.is_bound() {
            match fields.registration {
                Registration::None => {}
                Registration::PixelBuffer => {
                    if deferred {
                        self.cache.collect_unique_id(fields.id);
                    } else {
                        self.cache.release_pixel_buffer(fields.id);
                    }
                }
                Registration::Editable => {
                    self.cache.decrease_and_release_editable_cache(fields.id);
                }
                Registration::GpuImage => self.cache.release_gpu_image(fields.id),
            }
        }
        fields.registration = Registration::None;
    }
}

impl Drop for ManagedImage {
    fn drop(&mut self) {
        let Ok(mut fields) = self.fields.lock() else {
            //poisoned during an unwind; leave the tables to the sweep
            return;
        };
        //render-service-owned or previously drawn handles defer into the
        //batched queue rather than tearing down on this (possibly hot) path
        let deferred =
            self.is_render_service_owned.load(Ordering::Acquire) || fields.is_drawn;
        self.release_registration(&mut fields, deferred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::software::SoftwareContext;
    use crate::pixels::{AllocatorKind, PixelFlags};

    fn buffer(allocator: AllocatorKind, flags: PixelFlags, content_id: u32) -> Arc<PixelBuffer> {
        let bytes: Vec<u8> = (0..16).map(|i| i as u8).collect();
        Arc::new(PixelBuffer::new(2, 2, allocator, flags, content_id, bytes))
    }

    #[test]
    fn set_pixel_buffer_binds_and_registers() {
        let cache = Arc::new(ImageCache::new());
        let image = ManagedImage::new(cache.clone());
        assert!(!image.id().is_bound());

        let buf = buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 100);
        image.set_pixel_buffer(buf.clone());
        let id = image.id();
        assert!(id.is_bound());
        assert_eq!(id.local_id(), 100);
        assert!(cache.get_pixel_buffer(id).is_some());
    }

    #[test]
    fn dst_rect_change_invalidates_drawn() {
        let cache = Arc::new(ImageCache::new());
        let image = ManagedImage::new(cache);
        let buf = buffer(AllocatorKind::Heap, PixelFlags::default(), 1);
        image.set_pixel_buffer(buf);
        let mut canvas = Canvas::new(2, 2);
        image.draw_into(&SoftwareContext::new(), &mut canvas, SamplingOptions::default());
        assert!(image.is_drawn());
        image.set_dst_rect(Rect::new(0.0, 0.0, 1.0, 1.0));
        assert!(!image.is_drawn());
        //setting the identical rect changes nothing
        image.draw_into(&SoftwareContext::new(), &mut canvas, SamplingOptions::default());
        image.set_dst_rect(Rect::new(0.0, 0.0, 1.0, 1.0));
        assert!(image.is_drawn());
    }

    #[test]
    fn mark_purgeable_is_one_shot() {
        let cache = Arc::new(ImageCache::new());
        let image = ManagedImage::new(cache);
        let buf = buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 1);
        image.set_pixel_buffer(buf);
        image.mark_purgeable(false);
        assert_eq!(image.purge_state(), PurgeState::Disabled);
        //the first decision sticks
        image.mark_purgeable(true);
        assert_eq!(image.purge_state(), PurgeState::Disabled);
    }

    #[test]
    fn unbound_draw_is_a_soft_miss() {
        let cache = Arc::new(ImageCache::new());
        let image = ManagedImage::new(cache);
        let mut canvas = Canvas::new(2, 2);
        //must not panic
        image.draw_into(&SoftwareContext::new(), &mut canvas, SamplingOptions::default());
        assert!(!image.is_drawn());
    }

    #[test]
    fn drop_without_draw_releases_immediately() {
        let cache = Arc::new(ImageCache::new());
        let buf = buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 5);
        let id = {
            let image = ManagedImage::new(cache.clone());
            image.set_pixel_buffer(buf);
            image.id()
        };
        assert!(cache.get_pixel_buffer(id).is_none());
    }

    #[test]
    fn drop_after_draw_defers_to_batched_queue() {
        let cache = Arc::new(ImageCache::new());
        let buf = buffer(AllocatorKind::SharedMemory, PixelFlags::default(), 6);
        let id = {
            let image = ManagedImage::new(cache.clone());
            image.set_pixel_buffer(buf);
            let mut canvas = Canvas::new(2, 2);
            image.draw_into(&SoftwareContext::new(), &mut canvas, SamplingOptions::default());
            image.id()
        };
        //still cached until the frame-boundary flush
        assert!(cache.get_pixel_buffer(id).is_some());
        cache.release_unique_id_list();
        assert!(cache.get_pixel_buffer(id).is_none());
    }
}
