//! Method/metadata registry (§4.H): existence of a method handle means its
//! `TYPE_JIT` record has been emitted at least once. Writes are confined to
//! the writer thread under a mutex; reads from any producer thread tolerate
//! brief staleness, since a stale "absent" read costs at worst one
//! redundant (idempotent) JIT record downstream.

use dashmap::DashSet;
use std::sync::Mutex;

pub struct MethodRegistry {
    /// Read path: any thread, lock-free, tolerant of staleness.
    published: DashSet<u64>,
    /// Write path: writer-thread-only, serialized through this mutex even
    /// though the registry's sole writer is already single-threaded.
    write_lock: Mutex<()>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        MethodRegistry {
            published: DashSet::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Lock-free membership check; callers must treat a `false` result as
    /// "probably not yet published" rather than an absolute guarantee.
    pub fn contains(&self, method: u64) -> bool {
        self.published.contains(&method)
    }

    /// Idempotently marks `method` as published. Returns `true` if this
    /// call was the one that actually inserted it (i.e. the writer thread
    /// should emit a JIT record), `false` if it was already present.
    pub fn publish(&self, method: u64) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        self.published.insert(method)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_is_idempotent() {
        let reg = MethodRegistry::new();
        assert!(reg.publish(0xA));
        assert!(!reg.publish(0xA));
        assert!(reg.contains(0xA));
    }

    #[test]
    fn contains_is_false_before_publish() {
        let reg = MethodRegistry::new();
        assert!(!reg.contains(0xB));
    }
}
