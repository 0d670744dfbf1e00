//! SCQ segment: two index rings over a value array.
//!
//! The free ring (`fq`) starts holding every slot index, the available ring
//! (`aq`) starts empty. A producer takes an index from `fq`, writes the value
//! into that slot and publishes the index on `aq`. A consumer takes an index
//! from `aq`, reads the slot and hands the index back to `fq`.
//!
//! Each index ring stores `2 * N` entries for `N` indices. An entry packs a
//! cycle number in its high bits, an "unsafe" bit of weight `2N` and the index
//! itself (xor-ed with `2N - 1`) in its low bits, so one 64-bit CAS is enough
//! to publish or consume it. A `threshold` counter short-circuits dequeues on
//! a ring that is known to be empty.

use core::fmt;
use core::hint::spin_loop;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::registry::ThreadHandle;
use crate::remap::CacheRemap;
use crate::ring::state::{is_closed, tail_index, ticket_ge, ticket_le, ticket_lt, RingCursors};
use crate::ring::{check_capacity, Segment, SegmentPop, DEQUEUE_SPIN, TAIL_RESAMPLE};
use crate::sync::AtomicPtr;
use crate::util::CachePadded;

const ENTRY_SIZE: usize = core::mem::size_of::<u64>();

/// Lock-free ring of slot indices in `[0, half)`.
pub(crate) struct IndexRing {
    cursors: RingCursors,
    threshold: CachePadded<AtomicI64>,
    entries: Box<[AtomicU64]>,
    remap: CacheRemap,
    half: u64,
}

impl IndexRing {
    /// Threshold after a successful enqueue: `3 * half - 1`
    #[inline]
    const fn threshold_reset(half: u64) -> i64 {
        (half + 2 * half - 1) as i64
    }

    fn from_entries(raw: Vec<u64>, half: usize, remap: CacheRemap, tail: u64, threshold: i64) -> Self {
        Self {
            cursors: RingCursors::new(0, tail),
            threshold: CachePadded::new(AtomicI64::new(threshold)),
            entries: raw.into_iter().map(AtomicU64::new).collect(),
            remap,
            half: half as u64,
        }
    }

    /// A ring holding no indices
    pub(crate) fn empty(half: usize, remap: bool) -> Self {
        let n = 2 * half;
        Self::from_entries(
            vec![u64::MAX; n],
            half,
            CacheRemap::new(n, ENTRY_SIZE, remap),
            0,
            -1,
        )
    }

    /// A ring holding every index `index_map.map(i)` for `i` in `[0, half)`,
    /// in that order
    pub(crate) fn full(half: usize, remap: bool, index_map: &CacheRemap) -> Self {
        let n = 2 * half;
        let entry_map = CacheRemap::new(n, ENTRY_SIZE, remap);
        let mut raw = vec![u64::MAX; n];
        for i in 0..half as u64 {
            raw[entry_map.map(i)] = n as u64 + index_map.map(i) as u64;
        }
        Self::from_entries(
            raw,
            half,
            entry_map,
            half as u64,
            Self::threshold_reset(half as u64),
        )
    }

    /// Publish `index`. Fails only once the ring is closed.
    pub(crate) fn enqueue(&self, index: u64) -> bool {
        let n = 2 * self.half;
        let index = index ^ (n - 1);

        loop {
            let tail = self.cursors.next_tail();
            if is_closed(tail) {
                return false;
            }

            let tcycle = (tail << 1) | (2 * n - 1);
            let slot = &self.entries[self.remap.map(tail)];
            let mut entry = slot.load(Ordering::Acquire);
            loop {
                let ecycle = entry | (2 * n - 1);
                let usable = entry == ecycle
                    || (entry == ecycle ^ n && ticket_le(self.cursors.head(), tail));
                if !(ticket_lt(ecycle, tcycle) && usable) {
                    break;
                }
                match slot.compare_exchange_weak(
                    entry,
                    tcycle ^ index,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let reset = Self::threshold_reset(self.half);
                        if self.threshold.load(Ordering::SeqCst) != reset {
                            self.threshold.store(reset, Ordering::SeqCst);
                        }
                        return true;
                    }
                    Err(seen) => entry = seen,
                }
            }
        }
    }

    /// Take the oldest index, or `None` if the ring is empty.
    pub(crate) fn dequeue(&self) -> Option<u64> {
        if self.threshold.load(Ordering::SeqCst) < 0 {
            return None;
        }

        let n = 2 * self.half;
        loop {
            let head = self.cursors.next_head();
            let hcycle = (head << 1) | (2 * n - 1);
            let slot = &self.entries[self.remap.map(head)];
            let mut attempt: u64 = 0;
            let mut tail: u64 = 0;

            'slot: loop {
                let mut entry = slot.load(Ordering::Acquire);
                loop {
                    let ecycle = entry | (2 * n - 1);
                    if ecycle == hcycle {
                        slot.fetch_or(n - 1, Ordering::AcqRel);
                        return Some(entry & (n - 1));
                    }

                    let replacement = if (entry | n) != ecycle {
                        // Older cycle still occupied: mark it unsafe.
                        let marked = entry & !n;
                        if entry == marked {
                            break 'slot;
                        }
                        marked
                    } else {
                        if attempt % TAIL_RESAMPLE == 0 {
                            tail = self.cursors.raw_tail();
                        }
                        attempt += 1;
                        if attempt <= DEQUEUE_SPIN
                            && !is_closed(tail)
                            && ticket_ge(tail_index(tail), head.wrapping_add(1))
                        {
                            spin_loop();
                            continue 'slot;
                        }
                        hcycle ^ (!entry & n)
                    };

                    if !ticket_lt(ecycle, hcycle) {
                        break 'slot;
                    }
                    match slot.compare_exchange_weak(
                        entry,
                        replacement,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break 'slot,
                        Err(seen) => entry = seen,
                    }
                }
            }

            let tail = self.cursors.tail();
            let next_head = head.wrapping_add(1);
            if ticket_le(tail, next_head) {
                self.cursors.catch_up(tail, next_head);
                self.threshold.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
            if self.threshold.fetch_sub(1, Ordering::AcqRel) <= 0 {
                return None;
            }
        }
    }

    pub(crate) fn reset_threshold(&self) {
        self.threshold
            .store(Self::threshold_reset(self.half), Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn close(&self) {
        self.cursors.close();
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.cursors.is_closed()
    }

    #[inline]
    pub(crate) fn head(&self) -> u64 {
        self.cursors.head()
    }

    #[inline]
    pub(crate) fn tail(&self) -> u64 {
        self.cursors.tail()
    }

    #[cfg(all(test, not(loom)))]
    fn threshold(&self) -> i64 {
        self.threshold.load(Ordering::SeqCst)
    }
}

/// A segment built from an available ring and a free ring of `N` indices.
///
/// `REMAP` spreads consecutive ring entries and value slots over different
/// cache lines.
pub struct ScqSegment<const N: usize, const REMAP: bool = true> {
    aq: IndexRing,
    fq: IndexRing,
    values: Box<[AtomicU64]>,
    next: CachePadded<AtomicPtr<Self>>,
    start_index: u64,
}

impl<const N: usize, const REMAP: bool> ScqSegment<N, REMAP> {
    const CAPACITY_OK: () = check_capacity(N);
}

impl<const N: usize, const REMAP: bool> Segment for ScqSegment<N, REMAP> {
    const CAPACITY: usize = N;

    fn name() -> &'static str {
        if REMAP {
            "SCQ/remap"
        } else {
            "SCQ"
        }
    }

    fn new(start_index: u64) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;

        let value_map = CacheRemap::new(N, ENTRY_SIZE, REMAP);
        Self {
            aq: IndexRing::empty(N, REMAP),
            fq: IndexRing::full(N, REMAP, &value_map),
            values: (0..N).map(|_| AtomicU64::new(0)).collect(),
            next: CachePadded::new(AtomicPtr::new(core::ptr::null_mut())),
            start_index,
        }
    }

    fn enqueue(&self, value: NonZeroU64, _tid: ThreadHandle) -> bool {
        let Some(slot) = self.fq.dequeue() else {
            self.aq.close();
            return false;
        };
        self.values[slot as usize].store(value.get(), Ordering::Relaxed);
        if self.aq.enqueue(slot) {
            return true;
        }

        // Lost to a concurrent close; hand the slot back.
        let returned = self.fq.enqueue(slot);
        debug_assert!(returned, "free ring is never closed");
        false
    }

    fn dequeue(&self, _tid: ThreadHandle) -> SegmentPop {
        match self.aq.dequeue() {
            Some(slot) => {
                let raw = self.values[slot as usize].swap(0, Ordering::Relaxed);
                let returned = self.fq.enqueue(slot);
                debug_assert!(returned, "free ring is never closed");
                debug_assert_ne!(raw, 0, "published slot holds no value");
                NonZeroU64::new(raw).map_or(SegmentPop::Empty, SegmentPop::Item)
            }
            None if self.aq.is_closed() => SegmentPop::Drained,
            None => SegmentPop::Empty,
        }
    }

    fn is_empty(&self) -> bool {
        ticket_ge(self.aq.head(), self.aq.tail())
    }

    fn head_index(&self) -> u64 {
        self.aq.head() + self.start_index
    }

    fn tail_index(&self) -> u64 {
        self.aq.tail() + self.start_index
    }

    fn is_closed(&self) -> bool {
        self.aq.is_closed()
    }

    fn close(&self) {
        self.aq.close();
    }

    fn start_index(&self) -> u64 {
        self.start_index
    }

    fn next(&self) -> &AtomicPtr<Self> {
        &self.next
    }

    /// The available ring's threshold may have run out while the successor
    /// was being linked; restore it so the retry really scans.
    fn prepare_dequeue_after_next_linked(&self) {
        self.aq.reset_threshold();
    }
}

impl<const N: usize, const REMAP: bool> fmt::Debug for ScqSegment<N, REMAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(Self::name())
            .field("start_index", &self.start_index)
            .field("head_index", &self.head_index())
            .field("tail_index", &self.tail_index())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::registry::ThreadRegistry;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn token(v: u64) -> NonZeroU64 {
        NonZeroU64::new(v).unwrap()
    }

    #[test]
    fn test_index_ring_starts_empty() {
        let ring = IndexRing::empty(8, true);
        assert_eq!(ring.dequeue(), None);
        assert_eq!(ring.threshold(), -1);
    }

    #[test]
    fn test_full_ring_yields_every_index_once() {
        for remap in [false, true] {
            let index_map = CacheRemap::new(64, ENTRY_SIZE, remap);
            let ring = IndexRing::full(64, remap, &index_map);
            let drained: Vec<u64> = std::iter::from_fn(|| ring.dequeue()).collect();
            let expected: Vec<u64> = (0..64).map(|i| index_map.map(i) as u64).collect();
            assert_eq!(drained, expected);
        }
    }

    #[test]
    fn test_index_ring_is_fifo_across_cycles() {
        let ring = IndexRing::empty(4, false);
        for round in 0..10u64 {
            for i in 0..4 {
                assert!(ring.enqueue((i + round) % 4));
            }
            for i in 0..4 {
                assert_eq!(ring.dequeue(), Some((i + round) % 4));
            }
            assert_eq!(ring.dequeue(), None);
        }
    }

    #[test]
    fn test_threshold_reset_on_enqueue() {
        let ring = IndexRing::empty(4, false);
        assert!(ring.enqueue(2));
        assert_eq!(ring.threshold(), IndexRing::threshold_reset(4));
        assert_eq!(ring.dequeue(), Some(2));
        assert_eq!(ring.dequeue(), None);
        assert!(ring.threshold() < IndexRing::threshold_reset(4));
        ring.reset_threshold();
        assert_eq!(ring.threshold(), 11);
    }

    #[test]
    fn test_closed_ring_rejects_enqueue() {
        let ring = IndexRing::empty(4, false);
        assert!(ring.enqueue(1));
        ring.close();
        assert!(ring.is_closed());
        assert!(!ring.enqueue(2));
        assert_eq!(ring.dequeue(), Some(1));
    }

    #[test]
    fn test_segment_fills_then_closes() {
        let registry = ThreadRegistry::new(1);
        let tid = registry.register();
        let segment = ScqSegment::<4>::new(0);

        for v in 1..=4 {
            assert!(segment.enqueue(token(v), tid));
        }
        assert!(!segment.is_closed());
        assert!(!segment.enqueue(token(5), tid));
        assert!(segment.is_closed());

        for v in 1..=4 {
            assert_eq!(segment.dequeue(tid), SegmentPop::Item(token(v)));
        }
        assert_eq!(segment.dequeue(tid), SegmentPop::Drained);
    }

    #[test]
    fn test_segment_reuses_slots() {
        let registry = ThreadRegistry::new(1);
        let tid = registry.register();
        let segment = ScqSegment::<8, false>::new(0);

        for v in 1..=100 {
            assert!(segment.enqueue(token(v), tid));
            assert_eq!(segment.dequeue(tid), SegmentPop::Item(token(v)));
        }
        assert_eq!(segment.dequeue(tid), SegmentPop::Empty);
        assert!(segment.is_empty());
    }

    #[test]
    fn test_dequeue_clears_value_slot() {
        let registry = ThreadRegistry::new(1);
        let tid = registry.register();
        let segment = ScqSegment::<4>::new(0);

        for v in 1..=3 {
            assert!(segment.enqueue(token(v), tid));
        }
        assert_eq!(
            segment.values.iter().filter(|v| v.load(Ordering::Relaxed) != 0).count(),
            3
        );
        for v in 1..=3 {
            assert_eq!(segment.dequeue(tid), SegmentPop::Item(token(v)));
        }
        // Free slots hold no stale tokens.
        assert!(segment.values.iter().all(|v| v.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = ThreadRegistry::new(1);
        let tid = registry.register();
        let segment = ScqSegment::<16>::new(0);
        segment.close();
        segment.close();
        assert!(segment.is_closed());
        assert!(!segment.enqueue(token(1), tid));
        assert_eq!(segment.dequeue(tid), SegmentPop::Drained);
    }

    #[test]
    fn test_indices_are_offset_by_start() {
        let registry = ThreadRegistry::new(1);
        let tid = registry.register();
        let segment = ScqSegment::<16>::new(1000);
        assert_eq!(segment.start_index(), 1000);
        assert_eq!(segment.head_index(), 1000);
        assert_eq!(segment.tail_index(), 1000);

        segment.enqueue(token(7), tid);
        assert_eq!(segment.tail_index(), 1001);
        assert_eq!(segment.next_segment_start_index(), 1001);
        assert!(segment.next().load(Ordering::Acquire).is_null());
    }

    #[test]
    fn test_prepare_restores_exhausted_threshold() {
        let registry = ThreadRegistry::new(1);
        let tid = registry.register();
        let segment = ScqSegment::<4>::new(0);

        assert!(segment.enqueue(token(3), tid));
        assert_eq!(segment.dequeue(tid), SegmentPop::Item(token(3)));
        for _ in 0..32 {
            assert_eq!(segment.dequeue(tid), SegmentPop::Empty);
        }
        assert!(segment.aq.threshold() < 0);

        segment.prepare_dequeue_after_next_linked();
        assert_eq!(segment.aq.threshold(), IndexRing::threshold_reset(4));
        assert_eq!(segment.dequeue(tid), SegmentPop::Empty);
    }

    #[test]
    fn test_names() {
        assert_eq!(ScqSegment::<64>::name(), "SCQ/remap");
        assert_eq!(ScqSegment::<64, false>::name(), "SCQ");
        let debug = format!("{:?}", ScqSegment::<64>::new(0));
        assert!(debug.contains("SCQ/remap"));
        assert!(debug.contains("start_index"));
    }

    #[test]
    fn test_concurrent_segment_no_loss_no_duplication() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 2_000;

        let registry = Arc::new(ThreadRegistry::new(PRODUCERS as usize + CONSUMERS + 1));
        let segment = Arc::new(ScqSegment::<1024>::new(0));
        let barrier = Arc::new(Barrier::new(PRODUCERS as usize + CONSUMERS));
        let done = Arc::new(AtomicBool::new(false));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let (registry, segment, barrier) =
                    (Arc::clone(&registry), Arc::clone(&segment), Arc::clone(&barrier));
                thread::spawn(move || {
                    let tid = registry.register();
                    barrier.wait();
                    let mut accepted = Vec::new();
                    for i in 0..PER_PRODUCER {
                        let v = p * PER_PRODUCER + i + 1;
                        if segment.enqueue(token(v), tid) {
                            accepted.push(v);
                        }
                    }
                    accepted
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let (registry, segment, barrier, done) = (
                    Arc::clone(&registry),
                    Arc::clone(&segment),
                    Arc::clone(&barrier),
                    Arc::clone(&done),
                );
                thread::spawn(move || {
                    let tid = registry.register();
                    barrier.wait();
                    let mut taken = Vec::new();
                    loop {
                        let finished = done.load(Ordering::Acquire);
                        match segment.dequeue(tid) {
                            SegmentPop::Item(v) => taken.push(v.get()),
                            _ if finished => break,
                            _ => thread::yield_now(),
                        }
                    }
                    taken
                })
            })
            .collect();

        let accepted: Vec<u64> = producers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        done.store(true, Ordering::Release);
        let mut taken: Vec<u64> = consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let tid = registry.register();
        loop {
            segment.prepare_dequeue_after_next_linked();
            match segment.dequeue(tid).item() {
                Some(v) => taken.push(v.get()),
                None => break,
            }
        }

        let unique: HashSet<u64> = taken.iter().copied().collect();
        assert_eq!(unique.len(), taken.len(), "a value was dequeued twice");
        assert_eq!(unique, accepted.into_iter().collect::<HashSet<_>>());
    }
}
