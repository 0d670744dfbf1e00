//! Double-word atomic cell
//!
//! The tagged-cell ring needs its value and its cycle tag to change as one
//! unit. [`AtomicPair`] packs both 64-bit halves into a single 128-bit atomic
//! (`cmpxchg16b` on x86_64, `casp` on aarch64 with LSE) so a reader can never
//! observe a fresh value next to a stale tag.
//!
//! Layout: value in the low 64 bits, tag in the high 64 bits.

use portable_atomic::{AtomicU128, Ordering};

const VALUE_MASK: u128 = u64::MAX as u128;

/// A snapshot of an [`AtomicPair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pair {
    /// Payload word, `0` when the cell is empty
    pub value: u64,
    /// Cycle tag word
    pub tag: u64,
}

impl Pair {
    /// Create a pair from its halves
    #[inline]
    pub const fn new(value: u64, tag: u64) -> Self {
        Self { value, tag }
    }

    #[inline]
    const fn pack(self) -> u128 {
        (self.value as u128) | ((self.tag as u128) << 64)
    }

    #[inline]
    const fn unpack(raw: u128) -> Self {
        Self {
            value: raw as u64,
            tag: (raw >> 64) as u64,
        }
    }
}

/// A `(value, tag)` pair updated by a single double-word compare-and-swap.
#[repr(transparent)]
pub struct AtomicPair {
    inner: AtomicU128,
}

impl AtomicPair {
    /// Create a new atomic pair
    #[inline]
    pub const fn new(pair: Pair) -> Self {
        Self {
            inner: AtomicU128::new(pair.pack()),
        }
    }

    /// Whether the 128-bit operations are lock-free on this CPU.
    ///
    /// When they are not, `portable-atomic` falls back to a global lock
    /// table; the queue stays correct but loses its progress guarantee.
    #[inline]
    pub fn is_lock_free() -> bool {
        AtomicU128::is_lock_free()
    }

    /// Load both halves atomically
    #[inline]
    pub fn load(&self, order: Ordering) -> Pair {
        Pair::unpack(self.inner.load(order))
    }

    /// Store both halves; only valid while the cell is not shared
    #[inline]
    pub fn store(&self, pair: Pair, order: Ordering) {
        self.inner.store(pair.pack(), order);
    }

    /// Replace `current` with `new` if both halves still match.
    ///
    /// On failure returns the pair actually observed.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Pair,
        new: Pair,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Pair, Pair> {
        self.inner
            .compare_exchange(current.pack(), new.pack(), success, failure)
            .map(Pair::unpack)
            .map_err(Pair::unpack)
    }

    /// Clear the value half and leave the tag untouched, returning the pair
    /// as it was just before.
    #[inline]
    pub fn take_value(&self, order: Ordering) -> Pair {
        Pair::unpack(self.inner.fetch_and(!VALUE_MASK, order))
    }
}

impl core::fmt::Debug for AtomicPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let pair = self.load(Ordering::Relaxed);
        f.debug_struct("AtomicPair")
            .field("value", &pair.value)
            .field("tag", &pair.tag)
            .finish()
    }
}
