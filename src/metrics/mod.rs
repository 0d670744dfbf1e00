//! Queue observation hooks
//!
//! Queues are generic over a [`Recorder`] that is called at a handful of
//! well-defined points: completed operations, segment links, lost link races
//! and head advances. [`NoopRecorder`] compiles away; [`AtomicMetrics`]
//! keeps relaxed counters and produces [`QueueMetrics`] snapshots.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::registry::ThreadHandle;

/// Extension points a queue reports to.
///
/// Every method has an empty default so implementors pick what they need.
/// Calls happen on the operating thread, inside the operation, so they must
/// be cheap and must not block.
pub trait Recorder: Send + Sync {
    /// An enqueue completed
    #[inline]
    fn on_enqueue(&self, _tid: ThreadHandle) {}

    /// A dequeue completed; `hit` is false when it found the queue empty
    #[inline]
    fn on_dequeue(&self, _tid: ThreadHandle, _hit: bool) {}

    /// This thread linked a new segment starting at `start_index`
    #[inline]
    fn on_segment_linked(&self, _tid: ThreadHandle, _start_index: u64) {}

    /// This thread allocated a segment but another thread linked first
    #[inline]
    fn on_link_race_lost(&self, _tid: ThreadHandle) {}

    /// This thread moved the shared head past a drained segment
    #[inline]
    fn on_head_advanced(&self, _tid: ThreadHandle) {}
}

/// A recorder that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {}

impl<R: Recorder + ?Sized> Recorder for &R {
    fn on_enqueue(&self, tid: ThreadHandle) {
        (**self).on_enqueue(tid)
    }

    fn on_dequeue(&self, tid: ThreadHandle, hit: bool) {
        (**self).on_dequeue(tid, hit)
    }

    fn on_segment_linked(&self, tid: ThreadHandle, start_index: u64) {
        (**self).on_segment_linked(tid, start_index)
    }

    fn on_link_race_lost(&self, tid: ThreadHandle) {
        (**self).on_link_race_lost(tid)
    }

    fn on_head_advanced(&self, tid: ThreadHandle) {
        (**self).on_head_advanced(tid)
    }
}

/// Point-in-time view of an [`AtomicMetrics`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Completed enqueues
    pub enqueues: u64,
    /// Dequeues that returned a value
    pub dequeues: u64,
    /// Dequeues that found nothing
    pub empty_dequeues: u64,
    /// Segments linked after the first
    pub segments_linked: u64,
    /// Candidate segments discarded after losing the link race
    pub link_races_lost: u64,
    /// Times the head moved to the next segment
    pub head_advances: u64,
}

impl QueueMetrics {
    /// Total operations recorded
    pub fn total_operations(&self) -> u64 {
        self.enqueues + self.dequeues + self.empty_dequeues
    }

    /// Percentage of dequeues that found the queue empty
    pub fn empty_rate(&self) -> f64 {
        let attempts = self.dequeues + self.empty_dequeues;
        if attempts == 0 {
            0.0
        } else {
            (self.empty_dequeues as f64 / attempts as f64) * 100.0
        }
    }

    /// Percentage of segment allocations that were thrown away
    pub fn contention_rate(&self) -> f64 {
        let allocated = self.segments_linked + self.link_races_lost;
        if allocated == 0 {
            0.0
        } else {
            (self.link_races_lost as f64 / allocated as f64) * 100.0
        }
    }

    /// Values enqueued but not yet dequeued, as far as the counters know
    pub fn pending(&self) -> u64 {
        self.enqueues.saturating_sub(self.dequeues)
    }
}

/// Relaxed atomic counters behind every [`Recorder`] hook
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    enqueues: AtomicU64,
    dequeues: AtomicU64,
    empty_dequeues: AtomicU64,
    segments_linked: AtomicU64,
    link_races_lost: AtomicU64,
    head_advances: AtomicU64,
}

impl AtomicMetrics {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> QueueMetrics {
        QueueMetrics {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            dequeues: self.dequeues.load(Ordering::Relaxed),
            empty_dequeues: self.empty_dequeues.load(Ordering::Relaxed),
            segments_linked: self.segments_linked.load(Ordering::Relaxed),
            link_races_lost: self.link_races_lost.load(Ordering::Relaxed),
            head_advances: self.head_advances.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.enqueues.store(0, Ordering::Relaxed);
        self.dequeues.store(0, Ordering::Relaxed);
        self.empty_dequeues.store(0, Ordering::Relaxed);
        self.segments_linked.store(0, Ordering::Relaxed);
        self.link_races_lost.store(0, Ordering::Relaxed);
        self.head_advances.store(0, Ordering::Relaxed);
    }
}

impl Recorder for AtomicMetrics {
    #[inline]
    fn on_enqueue(&self, _tid: ThreadHandle) {
        self.enqueues.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_dequeue(&self, _tid: ThreadHandle, hit: bool) {
        if hit {
            self.dequeues.fetch_add(1, Ordering::Relaxed);
        } else {
            self.empty_dequeues.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_segment_linked(&self, _tid: ThreadHandle, _start_index: u64) {
        self.segments_linked.fetch_add(1, Ordering::Relaxed);
    }

    fn on_link_race_lost(&self, _tid: ThreadHandle) {
        self.link_races_lost.fetch_add(1, Ordering::Relaxed);
    }

    fn on_head_advanced(&self, _tid: ThreadHandle) {
        self.head_advances.fetch_add(1, Ordering::Relaxed);
    }
}
