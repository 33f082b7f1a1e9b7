// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Reference-counted cache slots.

Each keyed table in the cache is a [RefTable]: a map of id to
[ResourceEntry] behind its own mutex, so the purge path and the draw path
never queue on each other's table.
*/

use crate::unique_id::UniqueId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// One cache slot: a shared resource plus the count of registered holders.
///
/// `external_refs` counts only handles that registered explicitly; the
/// slot's own `Arc` keeps the resource alive regardless.  The two counts are
/// kept separate on purpose: the purge protocol needs a counter the cache
/// controls outright and can observe under its own lock.
#[derive(Debug)]
pub(crate) struct ResourceEntry<T> {
    pub resource: Option<Arc<T>>,
    pub external_refs: u64,
}

/// An id-keyed table of [ResourceEntry]s behind a dedicated mutex.
#[derive(Debug)]
pub(crate) struct RefTable<T> {
    entries: Mutex<HashMap<UniqueId, ResourceEntry<T>>>,
}

impl<T> RefTable<T> {
    pub fn new() -> Self {
        RefTable {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, HashMap<UniqueId, ResourceEntry<T>>> {
        self.entries.lock().unwrap()
    }

    /// Inserts `{resource, 0}`.  Unbound ids are silently ignored; this is
    /// not an error, callers cache speculatively.
    pub fn cache(&self, id: UniqueId, resource: Arc<T>) {
        if !id.is_bound() {
            return;
        }
        self.lock().insert(
            id,
            ResourceEntry {
                resource: Some(resource),
                external_refs: 0,
            },
        );
    }

    pub fn get(&self, id: UniqueId) -> Option<Arc<T>> {
        self.lock().get(&id).and_then(|entry| entry.resource.clone())
    }

    pub fn contains(&self, id: UniqueId) -> bool {
        self.lock().contains_key(&id)
    }

    /// No-op if the id is absent.
    pub fn increase_ref(&self, id: UniqueId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.external_refs += 1;
        }
    }

    /// Decrements the external count; erases the entry when the count
    /// reaches zero or the resource is gone.  Idempotent on absent ids.
    /// Returns the erased resource so the caller can settle accounting
    /// after unlocking.
    pub fn release(&self, id: UniqueId) -> Option<Arc<T>> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return None;
        };
        entry.external_refs = entry.external_refs.saturating_sub(1);
        if entry.external_refs == 0 || entry.resource.is_none() {
            entries.remove(&id).and_then(|entry| entry.resource)
        } else {
            None
        }
    }

    /// Erases unconditionally, ignoring the external count.
    pub fn discard(&self, id: UniqueId) -> Option<Arc<T>> {
        self.lock().remove(&id).and_then(|entry| entry.resource)
    }

    pub fn external_refs(&self, id: UniqueId) -> Option<u64> {
        self.lock().get(&id).map(|entry| entry.external_refs)
    }
}
