//! Head and tail cursors shared by every ring.
//!
//! Both cursors are monotonically increasing 64-bit tickets. The top bit of
//! the tail marks the ring as closed: once set, every later `fetch_add` on the
//! tail still carries it, so a producer learns about the closure from the
//! ticket it was handed.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::util::CachePadded;

/// Tail bit marking a closed ring
pub(crate) const CLOSED: u64 = 1 << 63;

/// Whether a raw tail value carries the closed bit
#[inline]
pub(crate) const fn is_closed(tail: u64) -> bool {
    tail & CLOSED != 0
}

/// Ticket part of a raw tail value
#[inline]
pub(crate) const fn tail_index(tail: u64) -> u64 {
    tail & !CLOSED
}

/// `a >= b` on tickets that may have wrapped
#[inline]
pub(crate) const fn ticket_ge(a: u64, b: u64) -> bool {
    a.wrapping_sub(b) as i64 >= 0
}

/// `a < b` on tickets that may have wrapped
#[inline]
pub(crate) const fn ticket_lt(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// `a <= b` on tickets that may have wrapped
#[inline]
pub(crate) const fn ticket_le(a: u64, b: u64) -> bool {
    a.wrapping_sub(b) as i64 <= 0
}

#[derive(Debug)]
pub(crate) struct RingCursors {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

impl RingCursors {
    pub(crate) const fn new(head: u64, tail: u64) -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(head)),
            tail: CachePadded::new(AtomicU64::new(tail)),
        }
    }

    /// Claim the next head ticket
    #[inline]
    pub(crate) fn next_head(&self) -> u64 {
        self.head.fetch_add(1, Ordering::AcqRel)
    }

    /// Claim the next tail ticket; the result may carry [`CLOSED`]
    #[inline]
    pub(crate) fn next_tail(&self) -> u64 {
        self.tail.fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Raw tail including the closed bit
    #[inline]
    pub(crate) fn raw_tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn tail(&self) -> u64 {
        tail_index(self.raw_tail())
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        is_closed(self.raw_tail())
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        ticket_ge(self.head(), self.tail())
    }

    /// Close unconditionally. Idempotent.
    #[inline]
    pub(crate) fn close(&self) {
        self.tail.fetch_or(CLOSED, Ordering::SeqCst);
    }

    /// Try to close the ring right after claiming `ticket`.
    ///
    /// Without `force` this only succeeds if no other producer has claimed a
    /// ticket since, so a ring is not closed while it may still have room.
    /// With `force` the ring is closed regardless.
    pub(crate) fn close_at(&self, ticket: u64, force: bool) -> bool {
        if force {
            self.close();
            return true;
        }
        let expected = ticket.wrapping_add(1);
        self.tail
            .compare_exchange(expected, expected | CLOSED, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Pull the tail up to the head after dequeuers overran it.
    ///
    /// A closed tail is left alone so the closure is never undone.
    pub(crate) fn fix_state(&self) {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }
            if is_closed(tail) || !ticket_lt(tail, head) {
                return;
            }
            if self
                .tail
                .compare_exchange(tail, head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Move the tail forward from `tail` to `head` unless a producer already
    /// moved it at least that far.
    pub(crate) fn catch_up(&self, mut tail: u64, mut head: u64) {
        while let Err(seen) =
            self.tail
                .compare_exchange_weak(tail, head, Ordering::AcqRel, Ordering::Acquire)
        {
            if is_closed(seen) {
                return;
            }
            head = self.head.load(Ordering::Acquire);
            tail = seen;
            if ticket_ge(tail, head) {
                return;
            }
        }
    }
}
