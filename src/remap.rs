//! Cache remap
//!
//! Logically adjacent ring slots are claimed by adjacent tickets, so under a
//! burst of operations consecutive tickets would hammer the same cache line.
//! [`CacheRemap`] is a fixed permutation of `[0, size)` that sends slot `i` to
//! line `i % lines` at position `i / lines`, spreading neighbours over
//! different cache lines.
//!
//! ```text
//! size = 8, 4 slots per line, 2 lines
//!
//! logical   0 1 2 3 4 5 6 7
//! physical  0 4 1 5 2 6 3 7
//! ```
//!
//! For power-of-two sizes this is the same bit rotation the SCQ rings use for
//! their entry arrays.

use crate::util::CACHE_LINE_SIZE;

/// A bijection from logical slot index to physical array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRemap {
    size: usize,
    cells_per_line: usize,
    lines: usize,
}

impl CacheRemap {
    /// Build the permutation for `size` cells of `cell_size` bytes each.
    ///
    /// Cells that already fill a whole line, rings smaller than a line, and
    /// `enabled == false` all produce the identity.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a power of two.
    pub const fn new(size: usize, cell_size: usize, enabled: bool) -> Self {
        assert!(size.is_power_of_two(), "remap size must be a power of two");

        let mut cells_per_line = if cell_size == 0 || cell_size >= CACHE_LINE_SIZE {
            1
        } else {
            CACHE_LINE_SIZE / cell_size
        };
        if !enabled || cells_per_line > size {
            cells_per_line = 1;
        }
        // Both factors stay powers of two so that lines * cells_per_line == size.
        if !cells_per_line.is_power_of_two() {
            cells_per_line = 1usize << (usize::BITS - 1 - cells_per_line.leading_zeros());
        }

        Self {
            size,
            cells_per_line,
            lines: size / cells_per_line,
        }
    }

    /// The identity permutation over `size` slots.
    pub const fn identity(size: usize) -> Self {
        Self::new(size, CACHE_LINE_SIZE, false)
    }

    /// Physical index of logical slot `index`.
    ///
    /// Indices outside `[0, size)` are reduced modulo `size` first, so ring
    /// tickets can be passed in directly.
    #[inline]
    pub const fn map(&self, index: u64) -> usize {
        let i = (index as usize) & (self.size - 1);
        (i / self.lines) + (i % self.lines) * self.cells_per_line
    }

    /// Number of slots the permutation covers.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether this permutation is the identity.
    #[inline]
    pub const fn is_identity(&self) -> bool {
        self.cells_per_line == 1
    }
}
