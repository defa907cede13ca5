//! Thread-local plumbing tying the arena, `LogBuffer`, method registry, and
//! writer queue together: `ensure_logbuf`, `register_method_local`, and
//! `safe_send` from §4.C/§4.G, expressed as Rust thread-local storage with
//! an explicit thread-exit flush hook instead of the original's
//! hand-rolled TLS macros (§9 "Thread-local globals with lazy init").

use crate::arena::Arena;
use crate::buffer::LogBuffer;
use crate::pipeline::Pipeline;
use crate::writer_queue::WriterQueueEntry;
use std::cell::RefCell;

/// A method reference observed by a producer thread since its last flush,
/// awaiting a `TYPE_METHOD|JIT` record from the writer thread.
#[derive(Clone)]
pub struct PendingMethod {
    pub method: u64,
    pub jit: Option<JitInfo>,
    pub observed_time_ns: u64,
}

#[derive(Clone)]
pub struct JitInfo {
    pub code_start: u64,
    pub code_size: u64,
    pub full_name: String,
}

struct ThreadLocalState {
    thread_id: u64,
    current: LogBuffer,
    pending: Vec<PendingMethod>,
}

thread_local! {
    static STATE: RefCell<Option<ThreadLocalState>> = const { RefCell::new(None) };
}

std::thread_local! {
    static THREAD_ID: u64 = allocate_thread_id();
}

fn allocate_thread_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Logical thread id used throughout the trace. Not an OS thread id (the
/// embedding host may run on platforms where that isn't cheaply available);
/// stable and unique for the process lifetime of this thread.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Runs `f` with the calling thread's current `LogBuffer` and pending
/// method list, lazily constructing them on first use. Returns `None`
/// (drop event) if no buffer exists yet and allocating one fails.
pub fn with_thread_state<R>(
    arena: &Arena,
    f: impl FnOnce(&mut LogBuffer, &mut Vec<PendingMethod>) -> R,
) -> Option<R> {
    STATE.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let thread_id = current_thread_id();
            let buffer = LogBuffer::new(arena, thread_id, 0)?;
            *slot = Some(ThreadLocalState {
                thread_id,
                current: buffer,
                pending: Vec::new(),
            });
        }
        let state = slot.as_mut().unwrap();
        Some(f(&mut state.current, &mut state.pending))
    })
}

/// Appends `(method, jit, now)` to the thread's pending-method list exactly
/// once per safe-point interval: a registry hit or an existing pending
/// entry for the same method both skip the append.
pub fn register_method_local(
    pipeline: &Pipeline,
    pending: &mut Vec<PendingMethod>,
    method: u64,
    jit: Option<JitInfo>,
    now: u64,
) {
    if pipeline.registry.contains(method) {
        return;
    }
    if pending.iter().any(|p| p.method == method) {
        return;
    }
    pending.push(PendingMethod {
        method,
        jit,
        observed_time_ns: now,
    });
}

/// Safe-point flush: removes the calling thread's current buffer, installs
/// a fresh successor carrying the same `call_depth`, and enqueues the old
/// head (plus its pending-method list) to the writer queue. A no-op (not
/// an error) if the thread has never produced an event.
pub fn safe_send(pipeline: &Pipeline) {
    STATE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let Some(state) = slot.as_mut() else {
            return;
        };
        let call_depth = state.current.call_depth();
        let Some(fresh) = LogBuffer::new(&pipeline.arena, state.thread_id, call_depth) else {
            // Allocation failure: keep accumulating into the existing
            // buffer rather than losing it. The flush simply doesn't
            // happen this time.
            return;
        };
        let sealed = std::mem::replace(&mut state.current, fresh);
        let methods = std::mem::take(&mut state.pending);
        pipeline.writer_queue.push(WriterQueueEntry {
            methods,
            buffer: Box::new(sealed),
        });
    });
}

/// Final flush for a thread that is ending (`thread_end` probe). Identical
/// to `safe_send` but documents the call site's intent; the writer queue
/// entry is indistinguishable once enqueued.
pub fn flush_on_thread_end(pipeline: &Pipeline) {
    safe_send(pipeline);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn with_thread_state_lazily_allocates_a_buffer() {
        let pipeline = Pipeline::for_test(Config::default());
        let touched = with_thread_state(&pipeline.arena, |buf, _pending| buf.thread_id());
        assert!(touched.is_some());
    }

    #[test]
    fn register_method_local_dedupes_within_one_pending_list() {
        let pipeline = Pipeline::for_test(Config::default());
        let mut pending = Vec::new();
        register_method_local(&pipeline, &mut pending, 0xA, None, 10);
        register_method_local(&pipeline, &mut pending, 0xA, None, 20);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn register_method_local_skips_methods_already_in_the_registry() {
        let pipeline = Pipeline::for_test(Config::default());
        pipeline.registry.publish(0xB);
        let mut pending = Vec::new();
        register_method_local(&pipeline, &mut pending, 0xB, None, 10);
        assert!(pending.is_empty());
    }

    #[test]
    fn safe_send_enqueues_and_resets_pending_methods() {
        let pipeline = Pipeline::for_test(Config::default());
        with_thread_state(&pipeline.arena, |buf, pending| {
            buf.emit_time(1);
            pending.push(PendingMethod {
                method: 0xC,
                jit: None,
                observed_time_ns: 1,
            });
        });
        assert_eq!(pipeline.writer_queue.stats.enqueued(), 0);
        safe_send(&pipeline);
        assert_eq!(pipeline.writer_queue.stats.enqueued(), 1);
        let entry = pipeline.writer_queue.pop().unwrap();
        assert_eq!(entry.methods.len(), 1);
    }
}
