//! Thread handles
//!
//! Every queue operation takes the caller's [`ThreadHandle`]. Handles are
//! handed out once per thread by a [`ThreadRegistry`] sized from
//! [`QueueConfig::max_threads`](crate::QueueConfig), so `index()` is always
//! in `[0, max_threads)`.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{Error, Result};

/// Identifier of a registered thread, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadHandle(usize);

impl ThreadHandle {
    /// Handle used for single-owner cleanup, valid for every registry.
    pub(crate) const OWNER: ThreadHandle = ThreadHandle(0);

    /// Position of this handle in `[0, max_threads)`
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Hands out thread handles up to a fixed limit.
#[derive(Debug)]
pub struct ThreadRegistry {
    max_threads: usize,
    registered: AtomicUsize,
}

impl ThreadRegistry {
    /// Registry allowing `max_threads` handles
    pub const fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            registered: AtomicUsize::new(0),
        }
    }

    /// Register the calling thread.
    ///
    /// Registration is a one-time setup step: call it once per thread and
    /// keep the handle for the lifetime of the queue.
    pub fn try_register(&self) -> Result<ThreadHandle> {
        let mut current = self.registered.load(Ordering::Relaxed);
        loop {
            if current >= self.max_threads {
                return Err(Error::ThreadLimitExceeded {
                    max_threads: self.max_threads,
                });
            }
            match self.registered.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(ThreadHandle(current)),
                Err(seen) => current = seen,
            }
        }
    }

    /// Register the calling thread.
    ///
    /// # Panics
    ///
    /// Exceeding the configured limit is fatal.
    pub fn register(&self) -> ThreadHandle {
        match self.try_register() {
            Ok(handle) => handle,
            Err(err) => panic!("{}", err),
        }
    }

    /// Configured limit
    #[inline]
    pub const fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Handles handed out so far
    #[inline]
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }

    /// Debug-build check that `handle` came from a registry of this size
    #[inline]
    pub(crate) fn check(&self, handle: ThreadHandle) {
        debug_assert!(
            handle.index() < self.max_threads,
            "thread handle {} out of range (max_threads = {})",
            handle.index(),
            self.max_threads
        );
    }
}
