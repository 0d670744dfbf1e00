//! Queue implementations
//!
//! This module provides the unbounded segmented queues.
//!
//! ## Available Queues
//!
//! - [`LinkedRingQueue`]: the raw chain, moving non-zero `u64` tokens
//! - [`Queue`]: a typed queue that owns its values, built on the raw chain
//! - [`LscQueue`]: [`Queue`] over [`ScqSegment`]s
//! - [`LcrQueue`]: [`Queue`] over [`CrqSegment`]s
//! - [`LprQueue`]: [`Queue`] over [`PrqSegment`]s
//!
//! ## Choosing a Segment
//!
//! | Segment | Atomic width | Slots per segment | Empty check |
//! |---------|--------------|-------------------|-------------|
//! | SCQ | 64-bit CAS | `N` values, `4N` index entries | Threshold counter |
//! | CRQ | 128-bit CAS | `N` cells | Head/tail comparison |
//! | PRQ | 64-bit CAS | `N` cells of two words | Head/tail comparison |
//!
//! SCQ and PRQ run anywhere a 64-bit compare-and-swap does. PRQ cells keep
//! the cycle and the value in separate words and use a producer reservation
//! to tie them together. CRQ needs a native
//! 128-bit compare-and-swap to stay lock-free (see
//! [`AtomicPair::is_lock_free`](crate::atomic::AtomicPair::is_lock_free)).
//!
//! ## Examples
//!
//! ```rust
//! use linkring::{LcrQueue, LscQueue};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let queue: Arc<LcrQueue<String, 256>> = Arc::new(LcrQueue::new(8));
//!
//! let producer = {
//!     let queue = Arc::clone(&queue);
//!     thread::spawn(move || {
//!         let me = queue.register();
//!         for i in 0..1000 {
//!             queue.enqueue(format!("item-{}", i), me);
//!         }
//!     })
//! };
//! producer.join().unwrap();
//!
//! let me = queue.register();
//! let mut received = 0;
//! while queue.dequeue(me).is_some() {
//!     received += 1;
//! }
//! assert_eq!(received, 1000);
//!
//! let small: LscQueue<u8, 4> = LscQueue::new(1);
//! assert_eq!(small.name(), "LSCQ/remap");
//! ```

use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroU64;

use crate::config::QueueConfig;
use crate::metrics::{NoopRecorder, Recorder};
use crate::registry::ThreadHandle;
use crate::ring::crq::{CrqSegment, PackedCell};
use crate::ring::prq::PrqSegment;
use crate::ring::scq::ScqSegment;
use crate::ring::Segment;
use crate::Result;

mod linked;

pub use linked::LinkedRingQueue;

/// Common interface of MPMC queues, for benchmark drivers and comparisons
/// against other implementations.
pub trait ConcurrentQueue<T>: Send + Sync {
    /// Register the calling thread
    fn register(&self) -> ThreadHandle;

    /// Append `value`; `false` if it was refused
    fn enqueue(&self, value: T, tid: ThreadHandle) -> bool;

    /// Remove a value, `None` if nothing is available
    fn dequeue(&self, tid: ThreadHandle) -> Option<T>;

    /// Approximate number of queued values
    fn estimate_size(&self, tid: ThreadHandle) -> usize;

    /// Label for reports
    fn name(&self) -> String;
}

/// Unbounded MPMC queue of `T` over segments of type `S`.
///
/// Each value is boxed; the box address travels through the segments as a
/// token. Values still queued when the queue is dropped are dropped with it.
pub struct Queue<T, S: Segment, R: Recorder = NoopRecorder> {
    raw: LinkedRingQueue<S, R>,
    _marker: PhantomData<Box<T>>,
}

/// Linked SCQ: [`Queue`] over [`ScqSegment`]s of `N` slots
pub type LscQueue<T, const N: usize = 1024> = Queue<T, ScqSegment<N>>;

/// Linked CRQ: [`Queue`] over [`CrqSegment`]s of `N` cells
pub type LcrQueue<T, const N: usize = 1024, C = PackedCell, const REMAP: bool = true> =
    Queue<T, CrqSegment<N, C, REMAP>>;

/// Linked PRQ: [`Queue`] over [`PrqSegment`]s of `N` cells
pub type LprQueue<T, const N: usize = 1024, const REMAP: bool = true> =
    Queue<T, PrqSegment<N, REMAP>>;

// SAFETY: values are moved in and out by value, so sharing the queue only
// ever transfers ownership of `T` between threads.
unsafe impl<T: Send, S: Segment, R: Recorder> Send for Queue<T, S, R> {}
// SAFETY: see above; no `&T` is ever handed out.
unsafe impl<T: Send, S: Segment, R: Recorder> Sync for Queue<T, S, R> {}

#[inline]
fn into_token<T>(value: T) -> NonZeroU64 {
    let addr = Box::into_raw(Box::new(value)).expose_provenance() as u64;
    // SAFETY: box pointers are never null, zero-sized ones included.
    unsafe { NonZeroU64::new_unchecked(addr) }
}

/// # Safety
///
/// `token` must come from `into_token::<T>` and be consumed at most once.
#[inline]
unsafe fn from_token<T>(token: NonZeroU64) -> T {
    let ptr = core::ptr::with_exposed_provenance_mut::<T>(token.get() as usize);
    // SAFETY: upheld by the caller.
    unsafe { *Box::from_raw(ptr) }
}

impl<T, S: Segment, R: Recorder + Default> Queue<T, S, R> {
    /// Create a queue for up to `max_threads` registered threads.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is zero or above [`MAX_THREADS`](crate::MAX_THREADS).
    pub fn new(max_threads: usize) -> Self {
        Self {
            raw: LinkedRingQueue::new(max_threads),
            _marker: PhantomData,
        }
    }
}

impl<T, S: Segment, R: Recorder> Queue<T, S, R> {
    /// Create a queue reporting to `recorder`
    pub fn with_config(config: QueueConfig, recorder: R) -> Result<Self> {
        Ok(Self {
            raw: LinkedRingQueue::with_config(config, recorder)?,
            _marker: PhantomData,
        })
    }

    /// Register the calling thread
    pub fn try_register(&self) -> Result<ThreadHandle> {
        self.raw.try_register()
    }

    /// Register the calling thread, panicking past the configured limit
    pub fn register(&self) -> ThreadHandle {
        self.raw.register()
    }

    /// Append `value`
    pub fn enqueue(&self, value: T, tid: ThreadHandle) {
        self.raw.enqueue(into_token(value), tid);
    }

    /// Remove a value, or `None` if nothing is currently available
    pub fn dequeue(&self, tid: ThreadHandle) -> Option<T> {
        self.raw
            .dequeue(tid)
            // SAFETY: every token in the chain came from `enqueue` and the
            // chain hands each one out exactly once.
            .map(|token| unsafe { from_token(token) })
    }

    /// Approximate number of queued values
    pub fn estimate_size(&self, tid: ThreadHandle) -> usize {
        self.raw.estimate_size(tid)
    }

    /// Whether the queue looks empty right now
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Segments reachable from the head
    pub fn segment_count(&self) -> usize {
        self.raw.segment_count()
    }

    /// The injected recorder
    pub fn recorder(&self) -> &R {
        self.raw.recorder()
    }

    /// Label of this queue, e.g. `LSCQ/remap`
    pub fn name(&self) -> String {
        LinkedRingQueue::<S, R>::name()
    }

    /// The token chain underneath
    pub fn as_raw(&self) -> &LinkedRingQueue<S, R> {
        &self.raw
    }
}

impl<T, S: Segment, R: Recorder> Drop for Queue<T, S, R> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; each remaining token is still owned by
        // the queue.
        self.raw.drain(|token| drop(unsafe { from_token::<T>(token) }));
    }
}

impl<T, S: Segment + fmt::Debug, R: Recorder> fmt::Debug for Queue<T, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("raw", &self.raw).finish()
    }
}

impl<T: Send, S: Segment, R: Recorder> ConcurrentQueue<T> for Queue<T, S, R> {
    fn register(&self) -> ThreadHandle {
        Queue::register(self)
    }

    fn enqueue(&self, value: T, tid: ThreadHandle) -> bool {
        Queue::enqueue(self, value, tid);
        true
    }

    fn dequeue(&self, tid: ThreadHandle) -> Option<T> {
        Queue::dequeue(self, tid)
    }

    fn estimate_size(&self, tid: ThreadHandle) -> usize {
        Queue::estimate_size(self, tid)
    }

    fn name(&self) -> String {
        Queue::name(self)
    }
}


#[cfg(all(test, not(loom)))]
mod proptests;

#[cfg(all(test, loom))]
mod loom_tests;
