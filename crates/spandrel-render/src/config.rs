#![forbid(unsafe_code)]

//! Runtime tuning knobs for the render pipeline.
//!
//! Everything here used to be a compile-time constant somewhere in the
//! pipeline; carrying them in one value type lets an application size the
//! pipeline to its panel and bus at startup.

/// Tunable parameters shared across the rasterizer, diff engines, merger,
/// and presenter.
///
/// Constructed once at startup and passed by reference to the component
/// constructors; each component copies what it needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderConfig {
    /// Hard cap on spans a single diff may produce. Exceeding it aborts
    /// the diff.
    pub max_spans: usize,
    /// Wasted-pixel budget when merging two spans into their bounding
    /// rectangle.
    pub merge_threshold: u32,
    /// How many consecutive unchanged pixels the exact diff tolerates
    /// before closing a run.
    pub gap_run: u16,
    /// Low bits ignored per color channel when the exact diff compares
    /// pixels.
    pub mask_bits: u8,
    /// Perceptual gamma exponent for antialiased coverage.
    pub gamma: f32,
    /// Growth quantum, in cells, for the rasterizer's cell arena.
    pub cell_block: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_spans: 256,
            merge_threshold: 128,
            gap_run: 8,
            mask_bits: 0,
            gamma: 1.6,
            cell_block: 1024,
        }
    }
}

impl RenderConfig {
    /// Set the hard span cap.
    #[inline]
    pub const fn with_max_spans(mut self, max_spans: usize) -> Self {
        self.max_spans = max_spans;
        self
    }

    /// Set the merge wasted-pixel budget.
    #[inline]
    pub const fn with_merge_threshold(mut self, merge_threshold: u32) -> Self {
        self.merge_threshold = merge_threshold;
        self
    }

    /// Set the exact-diff run-extension tolerance.
    #[inline]
    pub const fn with_gap_run(mut self, gap_run: u16) -> Self {
        self.gap_run = gap_run;
        self
    }

    /// Set the per-channel low-bit mask width for the exact diff.
    #[inline]
    pub const fn with_mask_bits(mut self, mask_bits: u8) -> Self {
        self.mask_bits = mask_bits;
        self
    }

    /// Set the coverage gamma exponent.
    #[inline]
    pub const fn with_gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma;
        self
    }

    /// Set the cell arena growth quantum.
    #[inline]
    pub const fn with_cell_block(mut self, cell_block: usize) -> Self {
        self.cell_block = cell_block;
        self
    }
}
