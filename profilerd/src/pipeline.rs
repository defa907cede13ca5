//! The `Pipeline`: the shared state every producer thread, the writer
//! thread, and the helper thread reference. Owns the arena, the method
//! registry, and the writer queue; holds no per-thread state itself.

use crate::arena::Arena;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::registry::MethodRegistry;
use crate::sample_ring::SampleRing;
use crate::writer_queue::WriterQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Pipeline {
    pub arena: Arena,
    pub registry: MethodRegistry,
    pub writer_queue: Arc<WriterQueue>,
    pub sample_ring: SampleRing,
    pub config: Config,
    pub max_call_depth: i64,
    pub metrics: Metrics,
    in_shutdown: AtomicBool,
}

impl Pipeline {
    pub fn new(config: Config) -> Arc<Self> {
        let arena = Arena::new(config.runtime.arena_page_size);
        let max_call_depth = config.runtime.max_call_depth as i64;
        Arc::new(Pipeline {
            arena,
            registry: MethodRegistry::new(),
            writer_queue: WriterQueue::new(),
            sample_ring: SampleRing::new(),
            config,
            max_call_depth,
            metrics: Metrics::new(),
            in_shutdown: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub fn for_test(config: Config) -> Arc<Self> {
        Self::new(config)
    }

    pub fn is_in_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    /// Begins the cooperative "drain and exit" protocol (§5): producers
    /// observe this before their next safe point and perform one final
    /// flush.
    pub fn begin_shutdown(&self) {
        self.in_shutdown.store(true, Ordering::Release);
    }
}
