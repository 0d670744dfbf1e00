//! Runtime construction parameters.
//!
//! Ring capacity, cell layout and the cache-remap switch are compile-time
//! parameters of the segment type. What is left for runtime is the upper
//! bound on registered thread handles.

use crate::{Error, Result};

/// Hard upper bound on `max_threads`.
pub const MAX_THREADS: usize = 128;

/// Queue construction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Upper bound on thread handles registered with the queue
    pub max_threads: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_threads: MAX_THREADS,
        }
    }
}

impl QueueConfig {
    /// Configuration allowing `max_threads` registered handles
    pub const fn new(max_threads: usize) -> Self {
        Self { max_threads }
    }

    /// Set the handle limit
    pub const fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Check every parameter is in range
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(Error::InvalidConfig("max_threads must be positive"));
        }
        if self.max_threads > MAX_THREADS {
            return Err(Error::InvalidConfig("max_threads exceeds MAX_THREADS"));
        }
        Ok(())
    }
}
