//! Signal-safe MPSC stat-sample ring (§4.E). Producers (the runtime's
//! sampling callback, which may run in a signal handler or suspend-all
//! context) must never lock or allocate; all the allocation-shaped work
//! (mapping a spare page) happens ahead of time, outside that context,
//! guarded by an ordinary mutex.
//!
//! Modeled per §9 "Signal-safe sample producer": an MPSC ring of
//! fixed-size slots with an `AtomicUsize` cursor and a pre-allocated spare
//! page, using raw-pointer CAS publication in the same style as the
//! teacher's own lock-free ring consumer (`runtime/sequencer.rs`).

use mlpd_common::{SampleFrame, SampleSlot, MAX_SAMPLE_FRAMES};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Slots per page. Chosen so a page is a convenient few hundred KiB; not
/// spec-mandated.
const PAGE_CAPACITY: usize = 512;

struct RingPage {
    slots: Box<[SampleSlot]>,
    /// Next slot index to hand out via CAS bump allocation.
    cursor: AtomicUsize,
    next: AtomicPtr<RingPage>,
}

impl RingPage {
    fn new() -> Box<Self> {
        Box::new(RingPage {
            slots: vec![SampleSlot::zeroed(); PAGE_CAPACITY].into_boxed_slice(),
            cursor: AtomicUsize::new(0),
            next: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    /// Reserves the next slot index on this page, or `None` if full.
    fn try_reserve(&self) -> Option<usize> {
        loop {
            let cur = self.cursor.load(Ordering::Relaxed);
            if cur >= PAGE_CAPACITY {
                return None;
            }
            if self
                .cursor
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(cur);
            }
        }
    }

    /// SAFETY: `idx` must have come from a successful `try_reserve` on this
    /// page, which hands each index to exactly one producer.
    unsafe fn slot_mut(&self, idx: usize) -> &mut SampleSlot {
        let ptr = self.slots.as_ptr().add(idx) as *mut SampleSlot;
        &mut *ptr
    }

    fn filled_count(&self) -> usize {
        self.cursor.load(Ordering::Acquire).min(PAGE_CAPACITY)
    }
}

/// One decoded sample lifted off the ring by the helper thread.
pub struct DrainedSample {
    pub kind: u8,
    pub thread_id: u64,
    pub elapsed_10us: u64,
    pub ip: u64,
    pub frames: Vec<SampleFrame>,
}

pub struct SampleRing {
    head: AtomicPtr<RingPage>,
    /// Pre-allocated outside signal context; a producer that fills the
    /// current head page takes this spare to publish a new head rather
    /// than allocating inline.
    spare: Mutex<Option<Box<RingPage>>>,
    /// Self-pipe write end the producer writes one byte to when the
    /// page list grows, waking the helper thread. Tracked as a plain
    /// counter here rather than a real fd pair — the embedding host wires
    /// an actual self-pipe/eventfd at the OS boundary; this crate only
    /// needs to expose "did the list grow" to drive that wake-up.
    growth_signal: AtomicUsize,
}

impl SampleRing {
    pub fn new() -> Self {
        let head = Box::into_raw(RingPage::new());
        SampleRing {
            head: AtomicPtr::new(head),
            spare: Mutex::new(Some(RingPage::new())),
            growth_signal: AtomicUsize::new(0),
        }
    }

    /// Pre-allocates a spare page outside signal context. The helper
    /// thread calls this after every drain so a spare is always ready
    /// before the next sample arrives.
    pub fn ensure_spare(&self) {
        let mut spare = self.spare.lock().unwrap();
        if spare.is_none() {
            *spare = Some(RingPage::new());
        }
    }

    /// Returns and clears the count of page-list growth events since the
    /// last call, for a caller bridging to a real self-pipe/eventfd.
    pub fn take_growth_signals(&self) -> usize {
        self.growth_signal.swap(0, Ordering::AcqRel)
    }

    /// Records one sample. Async-signal-safe: no locks on the success
    /// path, no heap allocation. Returns `false` (sample dropped) only if
    /// the current page is full and no spare page is available to publish
    /// a new head.
    pub fn record_sample(
        &self,
        kind: u8,
        thread_id: u64,
        elapsed_10us: u64,
        ip: u64,
        frames: &[SampleFrame],
    ) -> bool {
        let frames = &frames[..frames.len().min(MAX_SAMPLE_FRAMES)];
        loop {
            let head_ptr = self.head.load(Ordering::Acquire);
            // SAFETY: head always points at a live, leaked RingPage for
            // the lifetime of the ring.
            let head_ref = unsafe { &*head_ptr };
            if let Some(idx) = head_ref.try_reserve() {
                // SAFETY: idx was just reserved exclusively for us.
                let slot = unsafe { head_ref.slot_mut(idx) };
                fill_slot(slot, kind, thread_id, elapsed_10us, ip, frames);
                return true;
            }
            // Page full: try to publish the spare as the new head. This
            // path intentionally avoids allocation; it only ever takes a
            // pre-existing boxed page out of `spare`.
            let Ok(mut spare_guard) = self.spare.try_lock() else {
                // Someone else is already swapping spares in; the sample
                // is dropped rather than spinning on a lock from a
                // signal-unsafe wait.
                return false;
            };
            let Some(spare_page) = spare_guard.take() else {
                return false;
            };
            let new_head = Box::into_raw(spare_page);
            // SAFETY: new_head was just created from a unique Box.
            unsafe {
                (*new_head).next.store(head_ptr, Ordering::Release);
            }
            match self.head.compare_exchange(
                head_ptr,
                new_head,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.growth_signal.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    // Lost the race; reclaim the page we just built so it
                    // isn't leaked, and retry on whichever head won.
                    unsafe {
                        drop(Box::from_raw(new_head));
                    }
                }
            }
        }
    }

    /// Lifts every page except the current head off the list and decodes
    /// their filled slots in oldest-page-first order, matching the
    /// ordering guarantee in §4.E. Intended for the helper thread only.
    pub fn drain_old_pages(&self) -> Vec<DrainedSample> {
        let head_ptr = self.head.load(Ordering::Acquire);
        // SAFETY: head is always a live page.
        let head_ref = unsafe { &*head_ptr };
        let mut old_ptr = head_ref.next.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let mut pages = Vec::new();
        while !old_ptr.is_null() {
            // SAFETY: each page on this list was published exactly once
            // via `Box::into_raw` and is only reclaimed here.
            let page = unsafe { Box::from_raw(old_ptr) };
            old_ptr = page.next.load(Ordering::Acquire);
            pages.push(page);
        }
        // Oldest page is the one farthest from head; we walked head->tail
        // so reverse to emit oldest first.
        pages.reverse();
        let mut out = Vec::new();
        for page in pages {
            for i in 0..page.filled_count() {
                let slot = &page.slots[i];
                out.push(DrainedSample {
                    kind: slot.kind(),
                    thread_id: slot.thread_id,
                    elapsed_10us: slot.elapsed_10us,
                    ip: slot.ip,
                    frames: slot.frames[..slot.frame_count as usize].to_vec(),
                });
            }
        }
        out
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SampleRing {
    fn drop(&mut self) {
        let mut ptr = self.head.load(Ordering::Acquire);
        while !ptr.is_null() {
            // SAFETY: sole owner at drop time.
            let page = unsafe { Box::from_raw(ptr) };
            ptr = page.next.load(Ordering::Acquire);
        }
    }
}

fn fill_slot(
    slot: &mut SampleSlot,
    kind: u8,
    thread_id: u64,
    elapsed_10us: u64,
    ip: u64,
    frames: &[SampleFrame],
) {
    let unmanaged_ip_count = frames.iter().filter(|f| f.method == 0).count() as u8;
    slot.kind_and_counts = SampleSlot::pack_kind_and_counts(kind, unmanaged_ip_count);
    slot.frame_count = frames.len() as u32;
    slot.thread_id = thread_id;
    slot.elapsed_10us = elapsed_10us;
    slot.ip = ip;
    for (dst, src) in slot.frames.iter_mut().zip(frames.iter()) {
        *dst = *src;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_drain_a_single_sample() {
        let ring = SampleRing::new();
        let frame = SampleFrame {
            method: 0xAA,
            domain: 0,
            base_addr: 0,
            native_offset: 0,
        };
        assert!(ring.record_sample(1, 7, 100, 0xDEAD, &[frame]));
        // The sample landed in the (still current) head page, so it isn't
        // drained yet: draining only lifts pages *other* than head.
        assert!(ring.drain_old_pages().is_empty());
    }

    #[test]
    fn filling_a_page_publishes_a_new_head_and_old_page_becomes_drainable() {
        let ring = SampleRing::new();
        let frame = SampleFrame {
            method: 0x1,
            domain: 0,
            base_addr: 0,
            native_offset: 0,
        };
        for i in 0..PAGE_CAPACITY {
            assert!(ring.record_sample(1, 1, i as u64, 0, &[frame]));
        }
        ring.ensure_spare();
        // This sample overflows the first page and forces a new head.
        assert!(ring.record_sample(1, 1, 999, 0, &[frame]));
        assert_eq!(ring.take_growth_signals(), 1);
        let drained = ring.drain_old_pages();
        assert_eq!(drained.len(), PAGE_CAPACITY);
    }

    #[test]
    fn dropping_without_a_spare_page_available_is_reported() {
        let ring = SampleRing::new();
        // Consume the pre-allocated spare so the next overflow has none.
        *ring.spare.lock().unwrap() = None;
        let frame = SampleFrame {
            method: 0,
            domain: 0,
            base_addr: 0,
            native_offset: 0,
        };
        for i in 0..PAGE_CAPACITY {
            assert!(ring.record_sample(2, 1, i as u64, 0, &[frame]));
        }
        assert!(!ring.record_sample(2, 1, 999, 0, &[frame]));
    }
}
