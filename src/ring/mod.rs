//! Fixed-capacity ring segments
//!
//! A segment is one link of the unbounded chain. Three interchangeable
//! implementations share the [`Segment`] contract:
//!
//! - [`ScqSegment`](scq::ScqSegment): a free-index ring and an
//!   available-index ring over a value array
//! - [`CrqSegment`](crq::CrqSegment): one array of `(value, tag)` cells
//!   updated by 128-bit compare-and-swap
//! - [`PrqSegment`](prq::PrqSegment): cells of a cycle word and a value word,
//!   tied together by producer reservations instead of a 128-bit CAS
//!
//! Segments move raw non-zero `u64` tokens. Zero is the empty cell marker
//! and can never be enqueued.

use core::num::NonZeroU64;

use crate::registry::ThreadHandle;
use crate::sync::AtomicPtr;

pub mod crq;
pub mod prq;
pub mod scq;
pub(crate) mod state;

/// A consumer gives up waiting on a slot after this many retries
pub const DEQUEUE_SPIN: u64 = 4 * 1024;

/// Spinning consumers re-read the shared tail every this many retries
pub const TAIL_RESAMPLE: u64 = 256;

/// A producer that keeps finding the ring full closes it after this many tries
pub const CLOSE_PATIENCE: u32 = 10;

/// Outcome of [`Segment::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPop {
    /// A previously enqueued token
    Item(NonZeroU64),
    /// Nothing is available right now
    Empty,
    /// Nothing is available and the segment is closed, so once in-flight
    /// producers finish it stays empty
    Drained,
}

impl SegmentPop {
    /// The token, if any
    #[inline]
    pub fn item(self) -> Option<NonZeroU64> {
        match self {
            SegmentPop::Item(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the segment reported itself permanently drained
    #[inline]
    pub fn is_drained(self) -> bool {
        matches!(self, SegmentPop::Drained)
    }
}

/// One fixed-capacity link of a [`LinkedRingQueue`](crate::LinkedRingQueue).
///
/// Indices reported by `head_index` and `tail_index` are global: they start
/// at the segment's `start_index`, so a chain can subtract indices taken from
/// different segments.
pub trait Segment: Sized + Send + Sync {
    /// Number of slots
    const CAPACITY: usize;

    /// Stable label used in benchmark reports
    fn name() -> &'static str;

    /// An empty, open segment whose first slot has global index `start_index`
    fn new(start_index: u64) -> Self;

    /// Append `value`.
    ///
    /// Returns `false` when the segment is full or closed; the caller must
    /// move on to the next segment. Never blocks.
    fn enqueue(&self, value: NonZeroU64, tid: ThreadHandle) -> bool;

    /// Remove a value
    fn dequeue(&self, tid: ThreadHandle) -> SegmentPop;

    /// Whether the head has caught up with the tail
    fn is_empty(&self) -> bool;

    /// Global index of the next slot to consume
    fn head_index(&self) -> u64;

    /// Global index of the next slot to produce
    fn tail_index(&self) -> u64;

    /// Whether `close` has taken effect
    fn is_closed(&self) -> bool;

    /// Stop accepting values. Idempotent; every later `enqueue` fails.
    fn close(&self);

    /// Global index of the first slot
    fn start_index(&self) -> u64;

    /// Successor link, null until the chain installs one
    fn next(&self) -> &AtomicPtr<Self>;

    /// Where a successor of this segment starts numbering
    #[inline]
    fn next_segment_start_index(&self) -> u64 {
        self.tail_index()
    }

    /// Called by a consumer that found this segment empty and then saw a
    /// successor, right before it tries this segment once more.
    #[inline]
    fn prepare_dequeue_after_next_linked(&self) {}
}

/// Compile-time capacity check shared by the ring implementations.
pub(crate) const fn check_capacity(n: usize) {
    assert!(n.is_power_of_two(), "ring capacity must be a power of two");
    assert!(n >= 2, "ring capacity must be at least 2");
    assert!(n as u64 <= 1 << 32, "ring capacity must be at most 2^32");
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_segment_pop_accessors() {
        let token = NonZeroU64::new(9).unwrap();
        assert_eq!(SegmentPop::Item(token).item(), Some(token));
        assert_eq!(SegmentPop::Empty.item(), None);
        assert!(SegmentPop::Drained.is_drained());
        assert!(!SegmentPop::Empty.is_drained());
    }

    #[test]
    fn test_retry_bounds() {
        assert_eq!(CLOSE_PATIENCE, 10);
        assert_eq!(TAIL_RESAMPLE, 256);
        assert_eq!(DEQUEUE_SPIN, 4096);
        assert!(TAIL_RESAMPLE.is_power_of_two());
    }

    #[test]
    fn test_capacity_bounds() {
        check_capacity(2);
        check_capacity(1024);
        check_capacity(1 << 20);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_capacity_must_be_power_of_two() {
        check_capacity(6);
    }
}
