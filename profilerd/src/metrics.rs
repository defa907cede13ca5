//! Process-wide pipeline counters. Plain atomics throughout, updated from
//! the hot path with no locking — the same idiom `writer_queue::WriterQueueStats`
//! uses internally, pulled up to one crate-wide struct so an embedding host
//! can expose them (e.g. to its own metrics/health endpoint) without this
//! crate needing to know anything about that transport.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for every `DropReason` variant (§7 "DropEvent (silent)"),
/// indexed positionally rather than by a hashmap since the set is small
/// and fixed at compile time.
#[derive(Default)]
pub struct DropCounters {
    pub alloc_failed: AtomicU64,
    pub reentrant: AtomicU64,
    pub runtime_not_init: AtomicU64,
    pub depth_limited: AtomicU64,
}

impl DropCounters {
    pub fn record(&self, reason: crate::error::DropReason) {
        use crate::error::DropReason::*;
        let counter = match reason {
            AllocFailed => &self.alloc_failed,
            Reentrant => &self.reentrant,
            RuntimeNotInit => &self.runtime_not_init,
            DepthLimited => &self.depth_limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.alloc_failed.load(Ordering::Relaxed)
            + self.reentrant.load(Ordering::Relaxed)
            + self.runtime_not_init.load(Ordering::Relaxed)
            + self.depth_limited.load(Ordering::Relaxed)
    }
}

/// Crate-wide pipeline metrics: events encoded, buffers sealed at a safe
/// point, bytes handed to the sink, and the drop-reason breakdown above.
#[derive(Default)]
pub struct Metrics {
    pub events_encoded_total: AtomicU64,
    pub buffers_flushed_total: AtomicU64,
    pub bytes_written_total: AtomicU64,
    pub method_records_emitted_total: AtomicU64,
    pub sample_hits_total: AtomicU64,
    pub samples_dropped_total: AtomicU64,
    pub drops: DropCounters,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_event_encoded(&self) {
        self.events_encoded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_flushed(&self, bytes: u64) {
        self.buffers_flushed_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_written_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_method_emitted(&self) {
        self.method_records_emitted_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_hit(&self) {
        self.sample_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_dropped(&self) {
        self.samples_dropped_total.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DropReason;

    #[test]
    fn drop_counters_bucket_by_reason() {
        let m = Metrics::new();
        m.drops.record(DropReason::AllocFailed);
        m.drops.record(DropReason::Reentrant);
        m.drops.record(DropReason::Reentrant);
        assert_eq!(m.drops.alloc_failed.load(Ordering::Relaxed), 1);
        assert_eq!(m.drops.reentrant.load(Ordering::Relaxed), 2);
        assert_eq!(m.drops.total(), 3);
    }

    #[test]
    fn event_and_buffer_counters_accumulate() {
        let m = Metrics::new();
        m.record_event_encoded();
        m.record_event_encoded();
        m.record_buffer_flushed(128);
        assert_eq!(m.events_encoded_total.load(Ordering::Relaxed), 2);
        assert_eq!(m.buffers_flushed_total.load(Ordering::Relaxed), 1);
        assert_eq!(m.bytes_written_total.load(Ordering::Relaxed), 128);
    }
}
