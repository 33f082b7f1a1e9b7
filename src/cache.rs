// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The central keyed store for decoded pixel buffers and their GPU derivations.

Four logically independent tables, each behind its own mutex: GPU images by
id, pixel buffers by id, editable pixel buffers by id, and GPU images by
(id, render thread).  Two batching queues with their own locks keep
"collect for later" off the hot draw path.

Lock discipline, preserved exactly and relied on for deadlock freedom: the
pixel-buffer lock may be held while erasing thread-keyed entries (the one
documented nesting); the thread-keyed lock is never held while taking the
pixel-buffer lock.  Queue locks never nest with table locks.

The cache is an explicitly-constructed object passed by reference to its
collaborators.  Tests inject a fresh instance; a render service constructs
one at startup and never tears it down.
*/

pub(crate) mod entry;

use crate::gpu::GpuImage;
use crate::pixels::PixelBuffer;
use crate::unique_id::UniqueId;
use entry::{RefTable, ResourceEntry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

/// Observable use count at or below which a purge may release the GPU image
/// for an id: one `Arc` clone in the calling handle plus one in the cache's
/// own slot.  This depends on how many transient clones are alive during
/// the call itself, so it is a tunable pinned by test, not a portable law.
pub const GPU_USE_LIMIT: usize = 2;

/// Outcome of [ImageCache::check_ref_cnt_and_release].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeVerdict {
    /// The cache entries for the id are gone and the caller is authorized to
    /// unmap the backing memory.
    Released,
    /// Another holder is live; nothing was mutated.  Carries the observed
    /// GPU image use count.
    InUse(usize),
}

#[derive(Debug)]
pub struct ImageCache {
    gpu_images: RefTable<GpuImage>,
    pixel_buffers: RefTable<PixelBuffer>,
    editable_buffers: RefTable<PixelBuffer>,
    images_by_thread: Mutex<HashMap<(UniqueId, ThreadId), Arc<GpuImage>>>,
    pending_ids: Mutex<Vec<UniqueId>>,
    deferred_editable: Mutex<Vec<UniqueId>>,
    resident_bytes: AtomicUsize,
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCache {
    pub fn new() -> Self {
        ImageCache {
            gpu_images: RefTable::new(),
            pixel_buffers: RefTable::new(),
            editable_buffers: RefTable::new(),
            images_by_thread: Mutex::new(HashMap::new()),
            pending_ids: Mutex::new(Vec::new()),
            deferred_editable: Mutex::new(Vec::new()),
            resident_bytes: AtomicUsize::new(0),
        }
    }

    /// Bytes of decoded pixel memory currently accounted to the pixel-buffer
    /// table.
    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    // GPU images by id

    pub fn cache_gpu_image(&self, id: UniqueId, image: Arc<GpuImage>) {
        self.gpu_images.cache(id, image);
    }

    pub fn get_gpu_image(&self, id: UniqueId) -> Option<Arc<GpuImage>> {
        self.gpu_images.get(id)
    }

    pub fn increase_gpu_image_ref(&self, id: UniqueId) {
        self.gpu_images.increase_ref(id);
    }

    /// Releases one registration; when the entry goes, every thread-keyed
    /// derivation for the id goes with it.
    pub fn release_gpu_image(&self, id: UniqueId) {
        if self.gpu_images.release(id).is_some() {
            self.release_gpu_images_by_thread(id);
        }
    }

    // pixel buffers by id

    pub fn cache_pixel_buffer(&self, id: UniqueId, buffer: Arc<PixelBuffer>) {
        if !id.is_bound() {
            return;
        }
        let byte_len = buffer.byte_len();
        let replaced = {
            let mut entries = self.pixel_buffers.lock();
            entries.insert(
                id,
                ResourceEntry {
                    resource: Some(buffer),
                    external_refs: 0,
                },
            )
        };
        self.resident_bytes.fetch_add(byte_len, Ordering::Relaxed);
        if let Some(old) = replaced.and_then(|entry| entry.resource) {
            self.resident_bytes
                .fetch_sub(old.byte_len(), Ordering::Relaxed);
        }
    }

    pub fn get_pixel_buffer(&self, id: UniqueId) -> Option<Arc<PixelBuffer>> {
        self.pixel_buffers.get(id)
    }

    pub fn increase_pixel_buffer_ref(&self, id: UniqueId) {
        self.pixel_buffers.increase_ref(id);
    }

    pub fn release_pixel_buffer(&self, id: UniqueId) {
        if let Some(buffer) = self.pixel_buffers.release(id) {
            self.resident_bytes
                .fetch_sub(buffer.byte_len(), Ordering::Relaxed);
            //paired derivations go with the source
            self.release_gpu_image(id);
        }
    }

    /// The purge-path primitive: all-or-nothing and externally verifiable.
    ///
    /// Erases the pixel-buffer entry for `id` only when, under the
    /// pixel-table critical section, all of these hold: the stored buffer is
    /// pointer-identical to `buffer`, no other handle has registered against
    /// the entry, and the observable use count of the id's GPU image does
    /// not exceed [GPU_USE_LIMIT].  On success the paired GPU entry and all
    /// thread-keyed derivations are erased too and the caller may unmap.
    /// On failure nothing is mutated; the caller must abort its purge.
    pub fn check_ref_cnt_and_release(
        &self,
        id: UniqueId,
        buffer: &Arc<PixelBuffer>,
    ) -> PurgeVerdict {
        let mut entries = self.pixel_buffers.lock();
        let Some(entry) = entries.get(&id) else {
            return PurgeVerdict::InUse(0);
        };
        let Some(cached) = entry.resource.as_ref() else {
            return PurgeVerdict::InUse(0);
        };
        let gpu_use = {
            let gpu = self.gpu_images.lock();
            gpu.get(&id)
                .and_then(|entry| entry.resource.as_ref().map(Arc::strong_count))
                .unwrap_or(0)
        };
        if gpu_use > GPU_USE_LIMIT || entry.external_refs > 1 || !Arc::ptr_eq(cached, buffer) {
            logwise::trace_sync!(
                "purge check failed for {id}: gpu_use={gpu_use}",
                id = id.raw(),
                gpu_use = (gpu_use as u64)
            );
            return PurgeVerdict::InUse(gpu_use);
        }
        if let Some(removed) = entries.remove(&id).and_then(|entry| entry.resource) {
            self.resident_bytes
                .fetch_sub(removed.byte_len(), Ordering::Relaxed);
        }
        self.gpu_images.discard(id);
        //pixel-buffer lock held across the thread-table erase: the one
        //documented nesting.  The reverse order never happens.
        self.release_gpu_images_by_thread(id);
        PurgeVerdict::Released
    }

    // GPU images by (id, thread)

    /// Best-effort memoization; no ref-counting.  Entries are evicted
    /// wholesale when the parent id is released.
    pub fn cache_gpu_image_by_thread(&self, id: UniqueId, image: Arc<GpuImage>, thread: ThreadId) {
        if !id.is_bound() {
            return;
        }
        self.images_by_thread
            .lock()
            .unwrap()
            .insert((id, thread), image);
    }

    pub fn get_gpu_image_by_thread(&self, id: UniqueId, thread: ThreadId) -> Option<Arc<GpuImage>> {
        self.images_by_thread
            .lock()
            .unwrap()
            .get(&(id, thread))
            .cloned()
    }

    /// Drops every thread-keyed derivation for the id.
    pub fn release_gpu_images_by_thread(&self, id: UniqueId) {
        self.images_by_thread
            .lock()
            .unwrap()
            .retain(|(entry_id, _), _| *entry_id != id);
    }

    // batched release

    /// Queues an id for [Self::release_unique_id_list].  Its lock is
    /// independent of the table locks so collection never contends with a
    /// concurrent draw.
    pub fn collect_unique_id(&self, id: UniqueId) {
        if !id.is_bound() {
            return;
        }
        self.pending_ids.lock().unwrap().push(id);
    }

    /// Swaps the pending list out under its lock, then releases each id with
    /// no list lock held, bounding the critical section to the swap.
    pub fn release_unique_id_list(&self) {
        let pending = std::mem::take(&mut *self.pending_ids.lock().unwrap());
        for id in pending {
            self.release_pixel_buffer(id);
        }
    }

    // editable pixel buffers

    /// Caches an editable buffer when it qualifies (DMA, not ASTC, not YUV);
    /// silently ignores everything else, which round-trips the wire by
    /// value.
    pub fn cache_editable_pixel_buffer(&self, id: UniqueId, buffer: Arc<PixelBuffer>) {
        if !buffer.should_cache_editable() {
            logwise::trace_sync!(
                "editable cache skipped for {id}: buffer does not qualify",
                id = id.raw()
            );
            return;
        }
        self.editable_buffers.cache(id, buffer);
    }

    pub fn get_editable_pixel_buffer(&self, id: UniqueId) -> Option<Arc<PixelBuffer>> {
        self.editable_buffers.get(id)
    }

    pub fn increase_editable_ref(&self, id: UniqueId) {
        self.editable_buffers.increase_ref(id);
    }

    /// Erases regardless of registrations; the sender mutated the content
    /// and the cached copy is stale.
    pub fn discard_editable_cache(&self, id: UniqueId) {
        self.editable_buffers.discard(id);
    }

    /// Decrements and, on reaching zero, discards.  The content is
    /// considered stale; nothing is queued.
    pub fn decrease_and_discard_editable_cache(&self, id: UniqueId) {
        self.editable_buffers.release(id);
    }

    /// Decrements and, on reaching zero, queues the id for batched teardown
    /// via [Self::release_editable_deferred] instead of dropping inline on
    /// the caller's (possibly hot) path.
    pub fn decrease_and_release_editable_cache(&self, id: UniqueId) {
        let reached_zero = {
            let mut entries = self.editable_buffers.lock();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            entry.external_refs = entry.external_refs.saturating_sub(1);
            entry.external_refs == 0 || entry.resource.is_none()
        };
        if reached_zero {
            self.deferred_editable.lock().unwrap().push(id);
        }
    }

    /// Flushes the deferred editable list.  Same swap-then-process shape as
    /// [Self::release_unique_id_list]; the buffers drop after the list lock
    /// is gone.
    pub fn release_editable_deferred(&self) {
        let deferred = std::mem::take(&mut *self.deferred_editable.lock().unwrap());
        let mut dropped = Vec::with_capacity(deferred.len());
        for id in deferred {
            if let Some(buffer) = self.editable_buffers.discard(id) {
                dropped.push(buffer);
            }
        }
        drop(dropped);
    }
}
