//! Lock-free MPSC writer queue (§4.F). Any producer thread enqueues a
//! sealed buffer chain plus its pending-method list at a safe point; the
//! single writer thread dequeues and drains.
//!
//! The queue itself is built on `crossbeam_queue::SegQueue` (see
//! DESIGN.md for why), while the *consumer-side* shape below — batch
//! draining with a cap per iteration, a plain-atomics stats struct,
//! condvar parking when empty — follows this pack's usual queue-consumer
//! idiom.

use crate::buffer::LogBuffer;
use crate::producer::PendingMethod;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use crossbeam_queue::SegQueue;

/// One unit of work handed to the writer thread at a safe point.
pub struct WriterQueueEntry {
    pub methods: Vec<PendingMethod>,
    pub buffer: Box<LogBuffer>,
}

/// Plain-atomics counters: every field a bare atomic, no locking to
/// read them.
#[derive(Default)]
pub struct WriterQueueStats {
    pub entries_enqueued: AtomicU64,
    pub entries_drained: AtomicU64,
}

impl WriterQueueStats {
    pub fn enqueued(&self) -> u64 {
        self.entries_enqueued.load(Ordering::Relaxed)
    }

    pub fn drained(&self) -> u64 {
        self.entries_drained.load(Ordering::Relaxed)
    }
}

/// The queue itself, plus the condvar producers signal so the writer
/// thread can park instead of spinning while empty.
pub struct WriterQueue {
    queue: SegQueue<WriterQueueEntry>,
    not_empty: Condvar,
    parked_guard: Mutex<()>,
    pub stats: WriterQueueStats,
}

impl WriterQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(WriterQueue {
            queue: SegQueue::new(),
            not_empty: Condvar::new(),
            parked_guard: Mutex::new(()),
            stats: WriterQueueStats::default(),
        })
    }

    /// Enqueues a sealed entry and wakes the writer thread if it is parked.
    /// Never blocks: a brief CAS inside `SegQueue::push`, per §5's
    /// "Producer at safe-point flush: brief CAS ... no waiting".
    pub fn push(&self, entry: WriterQueueEntry) {
        self.queue.push(entry);
        self.stats.entries_enqueued.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
    }

    pub fn pop(&self) -> Option<WriterQueueEntry> {
        let entry = self.queue.pop();
        if entry.is_some() {
            self.stats.entries_drained.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Blocks the writer thread until an entry is available or `timeout`
    /// elapses, whichever comes first. A spurious wake with an empty queue
    /// simply returns, matching the "spin briefly then park" description.
    pub fn wait_for_entry(&self, timeout: std::time::Duration) {
        if !self.queue.is_empty() {
            return;
        }
        let guard = self.parked_guard.lock().unwrap();
        let _ = self.not_empty.wait_timeout(guard, timeout).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    #[test]
    fn push_then_pop_preserves_fifo_order() {
        let q = WriterQueue::new();
        let arena = Arena::new(4096);
        for tid in 0..3 {
            let buf = LogBuffer::new(&arena, tid, 0).unwrap();
            q.push(WriterQueueEntry {
                methods: Vec::new(),
                buffer: Box::new(buf),
            });
        }
        assert_eq!(q.stats.enqueued(), 3);
        let mut seen = Vec::new();
        while let Some(entry) = q.pop() {
            seen.push(entry.buffer.thread_id());
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(q.stats.drained(), 3);
    }

    #[test]
    fn pop_on_empty_queue_returns_none() {
        let q = WriterQueue::new();
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }
}
