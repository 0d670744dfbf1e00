//! PRQ segment: a ring of cells updated by single-word compare-and-swap.
//!
//! Each cell holds two words. `state` packs a "safe" flag (top bit) with the
//! epoch, the cycle of the ticket the cell last served. `value` holds either
//! nothing, a queued token, or a producer's reservation (top bit set plus the
//! producer's thread index).
//!
//! Where a CRQ producer swaps value and tag in one double-word CAS, a PRQ
//! producer does it in three steps: reserve the value word, advance the
//! epoch, then replace its reservation with the token. A consumer that meets
//! a reservation cancels it, so a stalled producer can only fail and retry.
//!
//! Queued tokens must have the top bit clear. Box addresses always do.

use core::fmt;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::registry::ThreadHandle;
use crate::remap::CacheRemap;
use crate::ring::state::{is_closed, RingCursors};
use crate::ring::{check_capacity, Segment, SegmentPop, CLOSE_PATIENCE};
use crate::sync::AtomicPtr;
use crate::util::CachePadded;

/// Top bit of `state`: producers of later cycles may use the cell
const SAFE: u64 = 1 << 63;

/// Top bit of `value`: the word is a producer's reservation, not a token
const RESERVED: u64 = 1 << 63;

#[inline]
const fn epoch(state: u64) -> u64 {
    state & !SAFE
}

#[inline]
const fn is_safe(state: u64) -> bool {
    state & SAFE != 0
}

/// No token in the cell: empty or merely reserved
#[inline]
const fn is_vacant(value: u64) -> bool {
    value == 0 || value & RESERVED != 0
}

#[inline]
const fn reservation(tid: ThreadHandle) -> u64 {
    RESERVED | tid.index() as u64
}

#[derive(Debug)]
struct PrqCell {
    state: AtomicU64,
    value: AtomicU64,
}

impl PrqCell {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(SAFE),
            value: AtomicU64::new(0),
        }
    }
}

/// Ring of `N` cells that needs only 64-bit compare-and-swap.
///
/// `REMAP` scatters consecutive tickets over different cache lines.
pub struct PrqSegment<const N: usize, const REMAP: bool = true> {
    cursors: RingCursors,
    cells: Box<[PrqCell]>,
    remap: CacheRemap,
    next: CachePadded<AtomicPtr<Self>>,
    start_index: u64,
}

impl<const N: usize, const REMAP: bool> PrqSegment<N, REMAP> {
    const CAPACITY_OK: () = check_capacity(N);
    const RING: u64 = N as u64;

    /// Epoch a cell takes on when serving `ticket`; never zero, so a fresh
    /// cell is behind every ticket.
    #[inline]
    const fn cycle(ticket: u64) -> u64 {
        ticket / Self::RING + 1
    }

    #[inline]
    fn cell(&self, ticket: u64) -> &PrqCell {
        &self.cells[self.remap.map(ticket)]
    }

    #[inline]
    fn empty_pop(&self) -> SegmentPop {
        if self.cursors.is_closed() {
            SegmentPop::Drained
        } else {
            SegmentPop::Empty
        }
    }

    fn try_close(&self, ticket: u64, attempts: u32) -> bool {
        let force = attempts > CLOSE_PATIENCE;
        let closed = self.cursors.close_at(ticket, force);
        if force {
            trace!(
                segment = Self::name(),
                ticket,
                "segment closed after repeated full ring"
            );
        }
        closed
    }

    /// Fill the cell for `ticket`, or `false` if it cannot serve this ticket.
    fn try_fill(&self, ticket: u64, value: u64, tid: ThreadHandle) -> bool {
        let cycle = Self::cycle(ticket);
        let cell = self.cell(ticket);
        let state = cell.state.load(Ordering::Acquire);
        let current = cell.value.load(Ordering::Acquire);

        if !(is_vacant(current)
            && epoch(state) < cycle
            && (is_safe(state) || self.cursors.head() <= ticket))
        {
            return false;
        }

        let mine = reservation(tid);
        if cell
            .value
            .compare_exchange(current, mine, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if cell
            .state
            .compare_exchange(state, SAFE | cycle, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let _ = cell
                .value
                .compare_exchange(mine, 0, Ordering::AcqRel, Ordering::Relaxed);
            return false;
        }

        // Fails only if a consumer cancelled the reservation.
        cell.value
            .compare_exchange(mine, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<const N: usize, const REMAP: bool> Segment for PrqSegment<N, REMAP> {
    const CAPACITY: usize = N;

    fn name() -> &'static str {
        if REMAP {
            "PRQ/remap"
        } else {
            "PRQ"
        }
    }

    fn new(start_index: u64) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;

        Self {
            cursors: RingCursors::new(start_index, start_index),
            cells: (0..N).map(|_| PrqCell::new()).collect(),
            remap: CacheRemap::new(N, core::mem::size_of::<PrqCell>(), REMAP),
            next: CachePadded::new(AtomicPtr::new(core::ptr::null_mut())),
            start_index,
        }
    }

    fn enqueue(&self, value: NonZeroU64, tid: ThreadHandle) -> bool {
        debug_assert_eq!(value.get() & RESERVED, 0, "token uses the reservation bit");
        let mut attempts = 0;

        loop {
            let ticket = self.cursors.next_tail();
            if is_closed(ticket) {
                return false;
            }
            if self.try_fill(ticket, value.get(), tid) {
                return true;
            }

            if ticket >= self.cursors.head() + Self::RING {
                attempts += 1;
                if self.try_close(ticket, attempts) {
                    return false;
                }
            }
        }
    }

    fn dequeue(&self, _tid: ThreadHandle) -> SegmentPop {
        loop {
            let head = self.cursors.next_head();
            let cycle = Self::cycle(head);
            let cell = self.cell(head);

            loop {
                let state = cell.state.load(Ordering::Acquire);
                let current = cell.value.load(Ordering::Acquire);
                let epoch = epoch(state);

                if epoch == cycle && !is_vacant(current) {
                    let taken = cell.value.swap(0, Ordering::AcqRel);
                    match NonZeroU64::new(taken) {
                        Some(value) => return SegmentPop::Item(value),
                        None => break,
                    }
                }

                if epoch <= cycle && is_vacant(current) {
                    // Cancel an unfinished fill, then close the cell for
                    // this cycle.
                    if current != 0
                        && cell
                            .value
                            .compare_exchange(current, 0, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        continue;
                    }
                    if cell
                        .state
                        .compare_exchange(
                            state,
                            (state & SAFE) | cycle,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break;
                    }
                    continue;
                }

                if epoch < cycle {
                    // A token from an older cycle is still waiting here.
                    if cell
                        .state
                        .compare_exchange(state, epoch, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                    continue;
                }

                // Overtaken by a later cycle.
                break;
            }

            if self.cursors.tail() <= head + 1 {
                self.cursors.fix_state();
                return self.empty_pop();
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    fn head_index(&self) -> u64 {
        self.cursors.head()
    }

    fn tail_index(&self) -> u64 {
        self.cursors.tail()
    }

    fn is_closed(&self) -> bool {
        self.cursors.is_closed()
    }

    fn close(&self) {
        self.cursors.close();
    }

    fn start_index(&self) -> u64 {
        self.start_index
    }

    fn next(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

impl<const N: usize, const REMAP: bool> fmt::Debug for PrqSegment<N, REMAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(Self::name())
            .field("start_index", &self.start_index)
            .field("head_index", &self.head_index())
            .field("tail_index", &self.tail_index())
            .field("closed", &self.is_closed())
            .finish()
    }
}
