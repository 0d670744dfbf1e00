//! # linkring
//!
//! Unbounded multi-producer, multi-consumer lock-free queues built by chaining
//! fixed-capacity ring-buffer segments.
//!
//! ## Features
//!
//! - **LSCQ**: segments are SCQ rings, a pair of index rings (available/free)
//!   over a value array
//! - **LCRQ**: segments are CRQ rings, one array of cells whose value and
//!   cycle tag change together through a 128-bit compare-and-swap
//! - **LPRQ**: segments are PRQ rings, CRQ-style cells driven by 64-bit
//!   compare-and-swap only
//! - **Linked segment chain**: a full or closed segment is replaced by a newly
//!   linked one, exactly once across racing producers
//!
//! ## Quick Start
//!
//! ```rust
//! use linkring::LscQueue;
//!
//! let queue: LscQueue<u32, 64> = LscQueue::new(4);
//! let me = queue.register();
//!
//! queue.enqueue(42, me);
//! assert_eq!(queue.dequeue(me), Some(42));
//! assert_eq!(queue.dequeue(me), None);
//! ```
//!
//! ## Ordering
//!
//! Operations are linearizable. Under contention the queue does not promise
//! FIFO order across the whole structure; it promises that every successfully
//! enqueued value is dequeued exactly once.
//!
//! ## Memory
//!
//! Segments that the head has moved past are not freed while the queue is
//! alive. Every segment is released when the queue itself is dropped.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod atomic;
pub mod config;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod remap;
pub mod ring;
mod sync;

pub use crate::config::{QueueConfig, MAX_THREADS};
pub use crate::metrics::{AtomicMetrics, NoopRecorder, QueueMetrics, Recorder};
pub use crate::queue::{ConcurrentQueue, LcrQueue, LinkedRingQueue, LprQueue, LscQueue, Queue};
pub use crate::registry::{ThreadHandle, ThreadRegistry};
pub use crate::ring::crq::{CrqCell, CrqSegment, PackedCell, PaddedCell};
pub use crate::ring::prq::PrqSegment;
pub use crate::ring::{scq::ScqSegment, Segment, SegmentPop};

/// Common utilities and helper types
pub mod util {
    /// Cache line size assumed for padding and for the cache remap.
    ///
    /// Adjacent-line prefetching on x86_64 and the big cores on aarch64 pull
    /// lines in pairs, so 128 bytes is used there.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub const CACHE_LINE_SIZE: usize = 128;

    /// Cache line size assumed for padding and for the cache remap.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Align a value to cache line boundaries
    #[inline]
    pub const fn align_to_cache_line(size: usize) -> usize {
        (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
    }

    /// Pad and align a value to [`CACHE_LINE_SIZE`]
    #[cfg_attr(
        any(target_arch = "x86_64", target_arch = "aarch64"),
        repr(align(128))
    )]
    #[cfg_attr(
        not(any(target_arch = "x86_64", target_arch = "aarch64")),
        repr(align(64))
    )]
    #[derive(Default)]
    pub struct CachePadded<T> {
        value: T,
    }

    impl<T> CachePadded<T> {
        /// Create a new cache-padded value
        #[inline]
        pub const fn new(value: T) -> Self {
            Self { value }
        }

        /// Get the inner value
        #[inline]
        pub fn into_inner(self) -> T {
            self.value
        }
    }

    impl<T> core::ops::Deref for CachePadded<T> {
        type Target = T;

        #[inline]
        fn deref(&self) -> &T {
            &self.value
        }
    }

    impl<T> core::ops::DerefMut for CachePadded<T> {
        #[inline]
        fn deref_mut(&mut self) -> &mut T {
            &mut self.value
        }
    }

    impl<T: core::fmt::Debug> core::fmt::Debug for CachePadded<T> {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            core::fmt::Debug::fmt(&self.value, f)
        }
    }
}

/// Error types for linkring operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// More thread handles were requested than the queue was configured for
    ThreadLimitExceeded {
        /// Configured upper bound on registered handles
        max_threads: usize,
    },
    /// A construction parameter is out of range
    InvalidConfig(&'static str),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::ThreadLimitExceeded { max_threads } => {
                write!(f, "Thread limit exceeded: at most {} handles", max_threads)
            }
            Error::InvalidConfig(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for linkring operations
pub type Result<T> = core::result::Result<T, Error>;
