// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Decoded pixel storage.

A [PixelBuffer] owns the decoded bytes for one logical image plus the
metadata the cache needs to decide whether those bytes may be purged: the
allocator that produced them, the format flags, and a mapped bit saying
whether the backing memory is currently resident.

Unmap/remap model the shared-memory protocol of the surrounding render
service: unmapping drops this process's view of the bytes while the segment
itself survives, so a later remap restores byte-identical content.  Here the
surviving segment is a shadow slot owned by the buffer.
*/

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Where a buffer's backing memory came from.  Only shared-memory and DMA
/// buffers can be unmapped without losing the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Heap,
    SharedMemory,
    Dma,
    Custom,
}

impl AllocatorKind {
    pub(crate) fn as_wire(self) -> u8 {
        match self {
            AllocatorKind::Heap => 0,
            AllocatorKind::SharedMemory => 1,
            AllocatorKind::Dma => 2,
            AllocatorKind::Custom => 3,
        }
    }
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(AllocatorKind::Heap),
            1 => Some(AllocatorKind::SharedMemory),
            2 => Some(AllocatorKind::Dma),
            3 => Some(AllocatorKind::Custom),
            _ => None,
        }
    }
}

/// Format flags that gate purging and editable caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelFlags {
    pub is_astc: bool,
    pub is_yuv: bool,
    pub is_hdr: bool,
    pub is_editable: bool,
}

impl PixelFlags {
    pub(crate) fn as_wire(self) -> u8 {
        (self.is_astc as u8)
            | (self.is_yuv as u8) << 1
            | (self.is_hdr as u8) << 2
            | (self.is_editable as u8) << 3
    }
    pub(crate) fn from_wire(bits: u8) -> Self {
        PixelFlags {
            is_astc: bits & 1 != 0,
            is_yuv: bits & 2 != 0,
            is_hdr: bits & 4 != 0,
            is_editable: bits & 8 != 0,
        }
    }
}

//resident is this process's view; shadow stands in for the shared segment
//that outlives an unmap of that view.
#[derive(Debug)]
struct Slots {
    resident: Option<Box<[u8]>>,
    shadow: Option<Box<[u8]>>,
}

/// Decoded pixel memory plus the metadata the cache keys its purge decisions
/// on.  Shared between holders as `Arc<PixelBuffer>`; only the mapped bit
/// and the byte slots are interior-mutable.
#[derive(Debug)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    allocator: AllocatorKind,
    flags: PixelFlags,
    content_id: u32,
    byte_len: usize,
    mapped: AtomicBool,
    slots: Mutex<Slots>,
}

impl PixelBuffer {
    pub fn new(
        width: u32,
        height: u32,
        allocator: AllocatorKind,
        flags: PixelFlags,
        content_id: u32,
        bytes: Vec<u8>,
    ) -> Self {
        let byte_len = bytes.len();
        PixelBuffer {
            width,
            height,
            allocator,
            flags,
            content_id,
            byte_len,
            mapped: AtomicBool::new(true),
            slots: Mutex::new(Slots {
                resident: Some(bytes.into_boxed_slice()),
                shadow: None,
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn allocator(&self) -> AllocatorKind {
        self.allocator
    }
    pub fn flags(&self) -> PixelFlags {
        self.flags
    }
    pub fn content_id(&self) -> u32 {
        self.content_id
    }
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// True while the backing memory is resident in this process.
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Drops this process's view of the bytes.  Returns false (no-op) when
    /// already unmapped.
    pub fn unmap(&self) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let Some(bytes) = slots.resident.take() else {
            return false;
        };
        slots.shadow = Some(bytes);
        self.mapped.store(false, Ordering::Release);
        true
    }

    /// Restores the bytes from the surviving segment.  Returns false (no-op)
    /// when already mapped.
    pub fn remap(&self) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let Some(bytes) = slots.shadow.take() else {
            return false;
        };
        slots.resident = Some(bytes);
        self.mapped.store(true, Ordering::Release);
        true
    }

    /// Runs `f` over the resident bytes, or returns None while unmapped.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let slots = self.slots.lock().unwrap();
        slots.resident.as_deref().map(f)
    }

    /// Whether memory-pressure purging may ever be enabled for this buffer:
    /// the allocator must keep the content alive across an unmap, and the
    /// format must be a plain immutable raster.
    pub fn supports_purge(&self) -> bool {
        matches!(
            self.allocator,
            AllocatorKind::SharedMemory | AllocatorKind::Dma
        ) && !self.flags.is_yuv
            && !self.flags.is_astc
            && !self.flags.is_hdr
            && !self.flags.is_editable
    }

    /// Whether this buffer qualifies for the editable-buffer cache: DMA
    /// allocated, not ASTC, not YUV.  Everything else round-trips the wire
    /// by value, uncached.
    pub fn should_cache_editable(&self) -> bool {
        self.allocator == AllocatorKind::Dma && !self.flags.is_astc && !self.flags.is_yuv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(allocator: AllocatorKind, flags: PixelFlags) -> PixelBuffer {
        PixelBuffer::new(2, 2, allocator, flags, 1, vec![1, 2, 3, 4])
    }

    #[test]
    fn unmap_remap_round_trip() {
        let b = buffer(AllocatorKind::SharedMemory, PixelFlags::default());
        assert!(b.is_mapped());
        let before = b.with_bytes(|bytes| bytes.to_vec()).unwrap();
        assert!(b.unmap());
        assert!(!b.is_mapped());
        assert!(b.with_bytes(|bytes| bytes.to_vec()).is_none());
        //second unmap is a no-op
        assert!(!b.unmap());
        assert!(b.remap());
        assert!(b.is_mapped());
        assert_eq!(b.with_bytes(|bytes| bytes.to_vec()).unwrap(), before);
        assert!(!b.remap());
    }

    #[test]
    fn purge_support_gates() {
        assert!(buffer(AllocatorKind::SharedMemory, PixelFlags::default()).supports_purge());
        assert!(buffer(AllocatorKind::Dma, PixelFlags::default()).supports_purge());
        assert!(!buffer(AllocatorKind::Heap, PixelFlags::default()).supports_purge());
        let yuv = PixelFlags {
            is_yuv: true,
            ..Default::default()
        };
        assert!(!buffer(AllocatorKind::Dma, yuv).supports_purge());
        let editable = PixelFlags {
            is_editable: true,
            ..Default::default()
        };
        assert!(!buffer(AllocatorKind::SharedMemory, editable).supports_purge());
    }

    #[test]
    fn editable_cache_gate() {
        let editable = PixelFlags {
            is_editable: true,
            ..Default::default()
        };
        assert!(buffer(AllocatorKind::Dma, editable).should_cache_editable());
        assert!(!buffer(AllocatorKind::Heap, editable).should_cache_editable());
        let astc = PixelFlags {
            is_editable: true,
            is_astc: true,
            ..Default::default()
        };
        assert!(!buffer(AllocatorKind::Dma, astc).should_cache_editable());
    }

    #[test]
    fn flag_bits_round_trip() {
        let flags = PixelFlags {
            is_astc: true,
            is_yuv: false,
            is_hdr: true,
            is_editable: true,
        };
        assert_eq!(PixelFlags::from_wire(flags.as_wire()), flags);
    }
}
