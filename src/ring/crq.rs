//! CRQ segment: a single ring of tagged cells.
//!
//! Every cell is a `(value, tag)` [`AtomicPair`]. The tag holds the ticket a
//! cell is waiting for (its slot index plus a multiple of `N`) and, in its top
//! bit, an "unsafe" flag set by a consumer that gave up on the cell while a
//! value of an older cycle was still in it.
//!
//! A producer holding ticket `t` may fill a cell whose value is empty and
//! whose tag is at most `t`. A consumer holding ticket `h` takes the value if
//! the tag is exactly `h + N`; otherwise it bumps the tag past its own ticket
//! so a late producer can no longer fill the cell for that round.

use core::fmt;
use core::hint::spin_loop;
use core::num::NonZeroU64;
use core::ops::Deref;
use core::sync::atomic::Ordering;
use std::sync::Once;

use tracing::{trace, warn};

use crate::atomic::{AtomicPair, Pair};
use crate::registry::ThreadHandle;
use crate::remap::CacheRemap;
use crate::ring::state::{is_closed, tail_index, RingCursors};
use crate::ring::{
    check_capacity, Segment, SegmentPop, CLOSE_PATIENCE, DEQUEUE_SPIN, TAIL_RESAMPLE,
};
use crate::sync::AtomicPtr;
use crate::util::CachePadded;

const UNSAFE: u64 = 1 << 63;

#[inline]
const fn node_index(tag: u64) -> u64 {
    tag & !UNSAFE
}

#[inline]
const fn node_unsafe(tag: u64) -> u64 {
    tag & UNSAFE
}

/// Storage layout of one CRQ cell
pub trait CrqCell: Deref<Target = AtomicPair> + Send + Sync {
    /// Whether every cell owns a whole cache line
    const PADDED: bool;

    /// A cell holding `pair`
    fn new(pair: Pair) -> Self;
}

/// Cells packed back to back, several per cache line
#[derive(Debug)]
#[repr(transparent)]
pub struct PackedCell(AtomicPair);

impl CrqCell for PackedCell {
    const PADDED: bool = false;

    fn new(pair: Pair) -> Self {
        Self(AtomicPair::new(pair))
    }
}

impl Deref for PackedCell {
    type Target = AtomicPair;

    #[inline]
    fn deref(&self) -> &AtomicPair {
        &self.0
    }
}

/// Cells aligned to a cache line each
#[derive(Debug)]
pub struct PaddedCell(CachePadded<AtomicPair>);

impl CrqCell for PaddedCell {
    const PADDED: bool = true;

    fn new(pair: Pair) -> Self {
        Self(CachePadded::new(AtomicPair::new(pair)))
    }
}

impl Deref for PaddedCell {
    type Target = AtomicPair;

    #[inline]
    fn deref(&self) -> &AtomicPair {
        &self.0
    }
}

fn warn_if_not_lock_free() {
    static CHECK: Once = Once::new();
    CHECK.call_once(|| {
        if !AtomicPair::is_lock_free() {
            warn!("128-bit compare-and-swap is emulated with locks on this CPU; CRQ segments are not lock-free");
        }
    });
}

/// Tagged-cell ring of `N` cells.
///
/// `C` selects packed or cache-line padded cells; `REMAP` scatters
/// consecutive tickets over different cache lines (a no-op for padded
/// cells).
pub struct CrqSegment<const N: usize, C: CrqCell = PackedCell, const REMAP: bool = true> {
    cursors: RingCursors,
    cells: Box<[C]>,
    remap: CacheRemap,
    next: CachePadded<AtomicPtr<Self>>,
    start_index: u64,
}

impl<const N: usize, C: CrqCell, const REMAP: bool> CrqSegment<N, C, REMAP> {
    const CAPACITY_OK: () = check_capacity(N);
    const RING: u64 = N as u64;

    #[inline]
    fn cell(&self, ticket: u64) -> &AtomicPair {
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
}

impl<const N: usize, C: CrqCell, const REMAP: bool> Segment for CrqSegment<N, C, REMAP> {
    const CAPACITY: usize = N;

    fn name() -> &'static str {
        match (C::PADDED, REMAP) {
            (false, false) => "CRQ",
            (true, false) => "CRQ/ca",
            (false, true) => "CRQ/remap",
            (true, true) => "CRQ/ca/remap",
        }
    }

    fn new(start_index: u64) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        warn_if_not_lock_free();

        let remap = CacheRemap::new(N, core::mem::size_of::<C>(), REMAP);
        let mut tags = vec![0u64; N];
        for ticket in start_index..start_index + Self::RING {
            tags[remap.map(ticket)] = ticket;
        }

        Self {
            cursors: RingCursors::new(start_index, start_index),
            cells: tags.into_iter().map(|tag| C::new(Pair::new(0, tag))).collect(),
            remap,
            next: CachePadded::new(AtomicPtr::new(core::ptr::null_mut())),
            start_index,
        }
    }

    fn enqueue(&self, value: NonZeroU64, _tid: ThreadHandle) -> bool {
        let mut attempts = 0;

        loop {
            let ticket = self.cursors.next_tail();
            if is_closed(ticket) {
                return false;
            }

            let cell = self.cell(ticket);
            let Pair { value: current, tag } = cell.load(Ordering::Acquire);
            if current == 0
                && node_index(tag) <= ticket
                && (node_unsafe(tag) == 0 || self.cursors.head() <= ticket)
                && cell
                    .compare_exchange(
                        Pair::new(0, tag),
                        Pair::new(value.get(), ticket + Self::RING),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
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
        if self.cursors.is_empty() {
            return self.empty_pop();
        }

        loop {
            let head = self.cursors.next_head();
            let expected = head + Self::RING;
            let cell = self.cell(head);
            let mut retries: u64 = 0;
            let mut tail: u64 = 0;

            loop {
                let observed = cell.load(Ordering::Acquire);
                let unsafe_bit = node_unsafe(observed.tag);
                let index = node_index(observed.tag);

                if index > expected {
                    break;
                }

                if observed.value != 0 {
                    if index == expected {
                        let taken = cell.take_value(Ordering::AcqRel);
                        match NonZeroU64::new(taken.value) {
                            Some(value) => return SegmentPop::Item(value),
                            None => break,
                        }
                    }
                    if unsafe_bit != 0 {
                        if cell.load(Ordering::Acquire).tag == observed.tag {
                            break;
                        }
                    } else if cell
                        .compare_exchange(
                            observed,
                            Pair::new(observed.value, UNSAFE | index),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break;
                    }
                } else {
                    if retries % TAIL_RESAMPLE == 0 {
                        tail = self.cursors.raw_tail();
                    }
                    if unsafe_bit != 0
                        || tail_index(tail) < head + 1
                        || is_closed(tail)
                        || retries > DEQUEUE_SPIN
                    {
                        // Give up on this round: no producer may fill it now.
                        if cell
                            .compare_exchange(
                                observed,
                                Pair::new(0, unsafe_bit | expected),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            break;
                        }
                    }
                    retries += 1;
                    spin_loop();
                }
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

impl<const N: usize, C: CrqCell, const REMAP: bool> fmt::Debug for CrqSegment<N, C, REMAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(Self::name())
            .field("start_index", &self.start_index)
            .field("head_index", &self.head_index())
            .field("tail_index", &self.tail_index())
            .field("closed", &self.is_closed())
            .finish()
    }
}
