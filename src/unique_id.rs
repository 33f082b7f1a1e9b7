// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Process-scoped resource identity.

A [UniqueId] names one logical image resource across the cache tables and
the wire protocol: the owning process id in the high 32 bits, a local
content id in the low.  Ids are never recycled within a process lifetime.
*/

use crate::bittricks::{u32s_to_u64, u64_to_u32s};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId(u64);

impl UniqueId {
    /// The unbound id.  No live resource ever carries this value.
    pub const INVALID: UniqueId = UniqueId(0);

    pub const fn from_raw(raw: u64) -> Self {
        UniqueId(raw)
    }
    pub const fn raw(self) -> u64 {
        self.0
    }
    pub fn owner_pid(self) -> u32 {
        u64_to_u32s(self.0).0
    }
    pub fn local_id(self) -> u32 {
        u64_to_u32s(self.0).1
    }
    pub fn is_bound(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner_pid(), self.local_id())
    }
}

/// Mints [UniqueId]s for one process.
///
/// Local ids come from a monotonic counter starting at 1, so a bound id is
/// always nonzero and never reused.
#[derive(Debug)]
pub struct IdAllocator {
    pid: u32,
    next_local: AtomicU32,
}

impl IdAllocator {
    pub fn new(pid: u32) -> Self {
        IdAllocator {
            pid,
            next_local: AtomicU32::new(1),
        }
    }

    /// Mints a fresh id from the local counter.
    pub fn generate(&self) -> UniqueId {
        let local = self.next_local.fetch_add(1, Ordering::Relaxed);
        UniqueId(u32s_to_u64(self.pid, local))
    }

    /// Derives the id for an externally-supplied content id, for example a
    /// decoder's buffer id.  A content id of 0 falls back to [Self::generate],
    /// since 0 is not a valid local id.
    pub fn for_content(&self, content_id: u32) -> UniqueId {
        if content_id == 0 {
            return self.generate();
        }
        UniqueId(u32s_to_u64(self.pid, content_id))
    }
}

static PROCESS_ALLOCATOR: OnceLock<IdAllocator> = OnceLock::new();

/// The allocator for the current process, constructed on first use from the
/// real process id.
pub fn process_allocator() -> &'static IdAllocator {
    PROCESS_ALLOCATOR.get_or_init(|| IdAllocator::new(std::process::id()))
}
