//! The unbounded chain of ring segments.
//!
//! Producers append to the tail segment until it refuses a value, then link
//! a fresh segment behind it. Consumers take from the head segment and move
//! the head forward once that segment is drained and a successor exists.
//! Whoever wins the compare-and-swap on a segment's `next` pointer decides
//! the successor; every other thread follows it.

use core::fmt;
use core::num::NonZeroU64;
use core::ptr;
use core::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::config::QueueConfig;
use crate::metrics::{NoopRecorder, Recorder};
use crate::registry::{ThreadHandle, ThreadRegistry};
use crate::ring::{Segment, SegmentPop};
use crate::sync::AtomicPtr;
use crate::util::CachePadded;
use crate::Result;

/// Unbounded MPMC queue of non-zero `u64` tokens over segments of type `S`.
///
/// Segments the head has moved past stay allocated until the queue is
/// dropped; there is no reclamation while other threads may still hold a
/// reference to them.
pub struct LinkedRingQueue<S: Segment, R: Recorder = NoopRecorder> {
    head: CachePadded<AtomicPtr<S>>,
    tail: CachePadded<AtomicPtr<S>>,
    first: *mut S,
    registry: ThreadRegistry,
    recorder: R,
}

// SAFETY: the queue only hands out shared references to segments, which are
// themselves `Send + Sync`, and frees them only with exclusive access.
unsafe impl<S: Segment, R: Recorder> Send for LinkedRingQueue<S, R> {}
// SAFETY: see above.
unsafe impl<S: Segment, R: Recorder> Sync for LinkedRingQueue<S, R> {}

impl<S: Segment, R: Recorder + Default> LinkedRingQueue<S, R> {
    /// Create a queue for up to `max_threads` registered threads.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is zero or above [`MAX_THREADS`](crate::MAX_THREADS).
    pub fn new(max_threads: usize) -> Self {
        match Self::with_config(QueueConfig::new(max_threads), R::default()) {
            Ok(queue) => queue,
            Err(err) => panic!("{}", err),
        }
    }
}

impl<S: Segment, R: Recorder> LinkedRingQueue<S, R> {
    /// Create a queue reporting to `recorder`
    pub fn with_config(config: QueueConfig, recorder: R) -> Result<Self> {
        config.validate()?;

        let first = Box::into_raw(Box::new(S::new(0)));
        debug!(
            queue = %Self::name(),
            capacity = S::CAPACITY,
            max_threads = config.max_threads,
            "queue created"
        );

        Ok(Self {
            head: CachePadded::new(AtomicPtr::new(first)),
            tail: CachePadded::new(AtomicPtr::new(first)),
            first,
            registry: ThreadRegistry::new(config.max_threads),
            recorder,
        })
    }

    /// Label of this queue family, `L` followed by the segment name
    pub fn name() -> String {
        format!("L{}", S::name())
    }

    /// Register the calling thread
    pub fn try_register(&self) -> Result<ThreadHandle> {
        self.registry.try_register()
    }

    /// Register the calling thread, panicking past the configured limit
    pub fn register(&self) -> ThreadHandle {
        self.registry.register()
    }

    /// The handle registry
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// The injected recorder
    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    #[inline]
    fn segment(&self, ptr: *mut S) -> &S {
        // SAFETY: every pointer stored in `head`, `tail` or a `next` link
        // points to a segment owned by this queue, and segments are only
        // freed in `Drop`.
        unsafe { &*ptr }
    }

    /// Append `value`. Always succeeds.
    pub fn enqueue(&self, value: NonZeroU64, tid: ThreadHandle) {
        self.registry.check(tid);

        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            let segment = self.segment(tail);

            let next = segment.next().load(Ordering::Acquire);
            if !next.is_null() {
                // Someone linked already; help move the shared tail.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                tail = next;
                continue;
            }

            if segment.enqueue(value, tid) {
                self.recorder.on_enqueue(tid);
                return;
            }

            let start_index = segment.next_segment_start_index();
            let candidate = Box::new(S::new(start_index));
            let accepted = candidate.enqueue(value, tid);
            debug_assert!(accepted, "a fresh segment accepts its first value");
            let candidate = Box::into_raw(candidate);

            match segment.next().compare_exchange(
                ptr::null_mut(),
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _ = self.tail.compare_exchange(
                        tail,
                        candidate,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.recorder.on_segment_linked(tid, start_index);
                    self.recorder.on_enqueue(tid);
                    debug!(
                        queue = %Self::name(),
                        start_index,
                        thread = tid.index(),
                        "segment linked"
                    );
                    return;
                }
                Err(winner) => {
                    // SAFETY: the candidate was never published, so this
                    // thread still owns it exclusively.
                    drop(unsafe { Box::from_raw(candidate) });
                    self.recorder.on_link_race_lost(tid);
                    trace!(thread = tid.index(), "lost segment link race");
                    tail = winner;
                }
            }
        }
    }

    /// Remove a value, or `None` if nothing is currently available
    pub fn dequeue(&self, tid: ThreadHandle) -> Option<NonZeroU64> {
        self.registry.check(tid);
        let value = self.pop(tid);
        self.recorder.on_dequeue(tid, value.is_some());
        value
    }

    fn pop(&self, tid: ThreadHandle) -> Option<NonZeroU64> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let segment = self.segment(head);
            if let SegmentPop::Item(value) = segment.dequeue(tid) {
                return Some(value);
            }

            let next = segment.next().load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            debug_assert!(segment.is_closed(), "only closed segments get a successor");

            // A producer may have landed a value between the first attempt
            // and the successor becoming visible.
            segment.prepare_dequeue_after_next_linked();
            let last = segment.dequeue(tid);
            if let SegmentPop::Item(value) = last {
                return Some(value);
            }

            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.recorder.on_head_advanced(tid);
                    trace!(
                        start_index = self.segment(next).start_index(),
                        drained = last.is_drained(),
                        "head advanced"
                    );
                    head = next;
                }
                Err(current) => head = current,
            }
        }
    }

    /// Approximate number of queued values.
    ///
    /// Computed from the global indices of the head and tail segments, so it
    /// is not linearizable and counts slots that producers gave up on.
    pub fn estimate_size(&self, tid: ThreadHandle) -> usize {
        self.registry.check(tid);
        let head = self.segment(self.head.load(Ordering::Acquire)).head_index();
        let tail = self.segment(self.tail.load(Ordering::Acquire)).tail_index();
        tail.saturating_sub(head) as usize
    }

    /// Segments reachable from the head, the head segment included
    pub fn segment_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            count += 1;
            current = self.segment(current).next().load(Ordering::Acquire);
        }
        count
    }

    /// Whether every segment from the head onwards looks empty
    pub fn is_empty(&self) -> bool {
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            let segment = self.segment(current);
            if !segment.is_empty() {
                return false;
            }
            current = segment.next().load(Ordering::Acquire);
        }
        true
    }

    /// Take every remaining value with exclusive access, without reporting
    /// to the recorder.
    pub(crate) fn drain(&mut self, mut f: impl FnMut(NonZeroU64)) {
        while let Some(value) = self.pop(ThreadHandle::OWNER) {
            f(value);
        }
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn head_segment(&self) -> &S {
        self.segment(self.head.load(Ordering::Acquire))
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn tail_segment(&self) -> &S {
        self.segment(self.tail.load(Ordering::Acquire))
    }
}

impl<S: Segment, R: Recorder> Drop for LinkedRingQueue<S, R> {
    fn drop(&mut self) {
        let mut current = self.first;
        let mut freed = 0usize;
        while !current.is_null() {
            // SAFETY: `first` starts a chain of segments created by
            // `Box::into_raw` and owned by this queue; nothing else can
            // reach them once we have `&mut self`.
            let segment = unsafe { Box::from_raw(current) };
            current = segment.next().load(Ordering::Relaxed);
            freed += 1;
        }
        trace!(queue = %Self::name(), segments = freed, "queue dropped");
    }
}

impl<S: Segment + fmt::Debug, R: Recorder> fmt::Debug for LinkedRingQueue<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(&Self::name())
            .field("head", self.segment(self.head.load(Ordering::Acquire)))
            .field("tail", self.segment(self.tail.load(Ordering::Acquire)))
            .field("segments", &self.segment_count())
            .field("max_threads", &self.registry.max_threads())
            .finish()
    }
}
