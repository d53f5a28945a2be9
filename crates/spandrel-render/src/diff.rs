#![forbid(unsafe_code)]

//! Diff computation between framebuffer snapshots.
//!
//! A diff engine retains the previously presented frame and, on each call,
//! compares the caller's current frame against it, emitting the changed
//! regions as spans. Four strategies trade precision against scan cost:
//!
//! - [`AllFrame`]: no comparison at all; one whole-screen span. Forces a
//!   full redraw.
//! - [`SingleBoundingBox`]: one span, the true minimal bounding rectangle
//!   of every differing pixel. Cheapest scan that still bounds traffic.
//! - [`CoarseBlockDiff`]: per-row runs of differing 4-pixel blocks. Fast,
//!   block-aligned, many single-row spans destined for the merger.
//! - [`ExactThresholdDiff`]: pixel-precise runs with a per-channel drift
//!   mask and gap bridging. Finest spans, highest scan cost.
//!
//! All scans are row-major for cache efficiency, and the wide-compare
//! paths check four pixels (one 64-bit word) per step with scalar tails.
//!
//! Every strategy enforces the configured span cap: a diff that would
//! exceed it is aborted, logged, and reported as `None`; callers fall back
//! to a full-frame update rather than retrying.

use crate::buffer::Framebuffer;
use crate::config::RenderConfig;
use crate::pixel::Rgb565;
use crate::span::{Span, SpanBuf};
use spandrel_core::geometry::Rect;

/// A frame-differencing strategy with a retained baseline.
///
/// The span slice returned by `diff` is a borrowed view into the engine's
/// preallocated pool; it stays valid only until the next call on the same
/// engine.
pub trait DiffEngine {
    /// Compare `current` against the retained baseline.
    ///
    /// Returns `None` when nothing differs, or when the span cap was hit,
    /// in which case [`DiffEngine::last_diff_overflowed`] reports `true`
    /// until the next diff.
    fn diff(&mut self, current: &Framebuffer) -> Option<&mut SpanBuf>;

    /// Exchange the retained baseline for `new` without copying.
    fn swap(&mut self, new: Framebuffer) -> Framebuffer;

    /// Deep-copy `current` into the retained baseline.
    ///
    /// Used when the just-presented frame carries overlays that must not
    /// become the comparison baseline.
    fn copy_from(&mut self, current: &Framebuffer);

    /// Whether the most recent `diff` aborted on span-pool exhaustion.
    fn last_diff_overflowed(&self) -> bool {
        false
    }
}

/// Degenerate strategy: every diff is the whole screen.
#[derive(Debug)]
pub struct AllFrame {
    spans: SpanBuf,
}

impl AllFrame {
    /// Create the full-redraw strategy. It retains no baseline.
    pub fn new() -> Self {
        Self {
            spans: SpanBuf::new(1),
        }
    }
}

impl Default for AllFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffEngine for AllFrame {
    fn diff(&mut self, current: &Framebuffer) -> Option<&mut SpanBuf> {
        self.spans.clear();
        self.spans.push(Span::full(current.bounds()));
        Some(&mut self.spans)
    }

    fn swap(&mut self, new: Framebuffer) -> Framebuffer {
        new
    }

    fn copy_from(&mut self, _current: &Framebuffer) {}
}

/// One span: the minimal bounding rectangle of all differing pixels.
///
/// # Algorithm
///
/// 1. Forward linear scan finds the first differing pixel → top row, and
///    the left extent of the top row.
/// 2. Reverse linear scan finds the last differing pixel → bottom row, and
///    the right extent of the bottom row (which becomes the span's
///    `last_scan_right`).
/// 3. Column scans within the discovered row band narrow the true left and
///    right edges.
#[derive(Debug)]
pub struct SingleBoundingBox {
    prev: Framebuffer,
    spans: SpanBuf,
}

impl SingleBoundingBox {
    /// Create the engine around an initial baseline frame.
    pub fn new(baseline: Framebuffer, config: &RenderConfig) -> Self {
        Self {
            prev: baseline,
            spans: SpanBuf::new(config.max_spans.max(1)),
        }
    }
}

impl DiffEngine for SingleBoundingBox {
    fn diff(&mut self, current: &Framebuffer) -> Option<&mut SpanBuf> {
        debug_assert_eq!(current.width(), self.prev.width(), "widths must match");
        debug_assert_eq!(current.height(), self.prev.height(), "heights must match");

        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!(
            "diff_bbox",
            width = current.width(),
            height = current.height()
        );
        #[cfg(feature = "tracing")]
        let _guard = _span.enter();

        self.spans.clear();
        let a = current.as_slice();
        let b = self.prev.as_slice();
        let first = first_mismatch(a, b)?;
        let last = last_mismatch(a, b).unwrap_or(first);

        let w = current.width() as usize;
        let top = first / w;
        let bottom = last / w;
        let rows = top..bottom + 1;

        // Narrow left/right by scanning columns inside the row band.
        let left = (0..w)
            .find(|&x| column_differs(a, b, w, x, rows.clone()))
            .unwrap_or(first % w);
        let right = (0..w)
            .rev()
            .find(|&x| column_differs(a, b, w, x, rows.clone()))
            .unwrap_or(last % w);

        let rect = Rect::new(
            left as i16,
            top as i16,
            (right + 1) as i16,
            (bottom + 1) as i16,
        );
        self.spans.push(Span::new(rect, (last % w + 1) as i16));
        Some(&mut self.spans)
    }

    fn swap(&mut self, new: Framebuffer) -> Framebuffer {
        std::mem::replace(&mut self.prev, new)
    }

    fn copy_from(&mut self, current: &Framebuffer) {
        self.prev.copy_from(current);
    }
}

/// Per-row runs of differing 4-pixel-aligned blocks.
///
/// Spans are single-row and block-aligned (the right edge clips to the
/// frame width). Precision is deliberately coarse; the merger is expected
/// to fold the per-row output into larger rectangles.
#[derive(Debug)]
pub struct CoarseBlockDiff {
    prev: Framebuffer,
    spans: SpanBuf,
}

impl CoarseBlockDiff {
    /// Block granularity in pixels.
    pub const BLOCK: usize = 4;

    /// Create the engine around an initial baseline frame.
    pub fn new(baseline: Framebuffer, config: &RenderConfig) -> Self {
        Self {
            prev: baseline,
            spans: SpanBuf::new(config.max_spans.max(1)),
        }
    }
}

impl DiffEngine for CoarseBlockDiff {
    fn diff(&mut self, current: &Framebuffer) -> Option<&mut SpanBuf> {
        debug_assert_eq!(current.width(), self.prev.width(), "widths must match");
        debug_assert_eq!(current.height(), self.prev.height(), "heights must match");

        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!(
            "diff_coarse",
            width = current.width(),
            height = current.height()
        );
        #[cfg(feature = "tracing")]
        let _guard = _span.enter();

        self.spans.clear();
        let w = current.width() as usize;

        for y in 0..current.height() {
            let ra = current.row(y);
            let rb = self.prev.row(y);
            let mut run: Option<(usize, usize)> = None;

            let mut x = 0;
            while x < w {
                let end = (x + Self::BLOCK).min(w);
                if ra[x..end] != rb[x..end] {
                    match &mut run {
                        // Contiguous: runs only stay open across differing
                        // blocks, so the previous block ended at `x`.
                        Some((_, r)) => *r = end,
                        None => run = Some((x, end)),
                    }
                } else if let Some((l, r)) = run.take()
                    && !push_row_span(&mut self.spans, l, r, y)
                {
                    log_pool_exhausted("coarse", self.spans.capacity());
                    return None;
                }
                x = end;
            }
            if let Some((l, r)) = run
                && !push_row_span(&mut self.spans, l, r, y)
            {
                log_pool_exhausted("coarse", self.spans.capacity());
                return None;
            }
        }

        if self.spans.is_empty() {
            None
        } else {
            Some(&mut self.spans)
        }
    }

    fn swap(&mut self, new: Framebuffer) -> Framebuffer {
        std::mem::replace(&mut self.prev, new)
    }

    fn copy_from(&mut self, current: &Framebuffer) {
        self.prev.copy_from(current);
    }

    fn last_diff_overflowed(&self) -> bool {
        self.spans.truncated()
    }
}

/// Pixel-precise runs with drift masking and gap bridging.
///
/// Pixels compare under a mask that clears the configured number of low
/// bits per channel, so sub-threshold color drift counts as unchanged. A
/// differing run stays open across up to `gap_run` consecutive unchanged
/// pixels, which keeps tiny gaps from fragmenting a row into many spans.
/// The scan checks two pixels per step with a scalar fallback when either
/// differs.
#[derive(Debug)]
pub struct ExactThresholdDiff {
    prev: Framebuffer,
    spans: SpanBuf,
    mask: u16,
    gap_run: u16,
}

impl ExactThresholdDiff {
    /// Create the engine around an initial baseline frame.
    pub fn new(baseline: Framebuffer, config: &RenderConfig) -> Self {
        Self {
            prev: baseline,
            spans: SpanBuf::new(config.max_spans.max(1)),
            mask: Rgb565::drift_mask(config.mask_bits),
            gap_run: config.gap_run,
        }
    }

    #[inline]
    fn changed(&self, a: Rgb565, b: Rgb565) -> bool {
        (a.raw() ^ b.raw()) & self.mask != 0
    }
}

impl DiffEngine for ExactThresholdDiff {
    fn diff(&mut self, current: &Framebuffer) -> Option<&mut SpanBuf> {
        debug_assert_eq!(current.width(), self.prev.width(), "widths must match");
        debug_assert_eq!(current.height(), self.prev.height(), "heights must match");

        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!(
            "diff_exact",
            width = current.width(),
            height = current.height()
        );
        #[cfg(feature = "tracing")]
        let _guard = _span.enter();

        self.spans.clear();
        let w = current.width() as usize;

        for y in 0..current.height() {
            let ra = current.row(y);
            let rb = self.prev.row(y);
            let mut run_start: Option<usize> = None;
            let mut last_diff = 0;
            let mut gap: u16 = 0;

            let mut x = 0;
            while x < w {
                // Clean pairs fast-forward two pixels at a time.
                if x + 1 < w {
                    let pair =
                        ((ra[x].raw() ^ rb[x].raw()) | (ra[x + 1].raw() ^ rb[x + 1].raw()))
                            & self.mask;
                    if pair == 0 {
                        if run_start.is_some() {
                            gap = gap.saturating_add(2);
                        }
                        x += 2;
                        continue;
                    }
                }

                if self.changed(ra[x], rb[x]) {
                    if let Some(start) = run_start
                        && gap > self.gap_run
                    {
                        if !push_row_span(&mut self.spans, start, last_diff + 1, y) {
                            log_pool_exhausted("exact", self.spans.capacity());
                            return None;
                        }
                        run_start = Some(x);
                    }
                    if run_start.is_none() {
                        run_start = Some(x);
                    }
                    last_diff = x;
                    gap = 0;
                } else if run_start.is_some() {
                    gap += 1;
                }
                x += 1;
            }

            if let Some(start) = run_start
                && !push_row_span(&mut self.spans, start, last_diff + 1, y)
            {
                log_pool_exhausted("exact", self.spans.capacity());
                return None;
            }
        }

        if self.spans.is_empty() {
            None
        } else {
            Some(&mut self.spans)
        }
    }

    fn swap(&mut self, new: Framebuffer) -> Framebuffer {
        std::mem::replace(&mut self.prev, new)
    }

    fn copy_from(&mut self, current: &Framebuffer) {
        self.prev.copy_from(current);
    }

    fn last_diff_overflowed(&self) -> bool {
        self.spans.truncated()
    }
}

/// Append a single-row span covering `[left, right)` on row `y`.
#[inline]
fn push_row_span(spans: &mut SpanBuf, left: usize, right: usize, y: u16) -> bool {
    let rect = Rect::new(left as i16, y as i16, right as i16, y as i16 + 1);
    spans.push(Span::full(rect))
}

#[inline]
fn log_pool_exhausted(_strategy: &str, _cap: usize) {
    #[cfg(feature = "tracing")]
    tracing::warn!(
        strategy = _strategy,
        cap = _cap,
        "span pool exhausted; diff aborted"
    );
}

/// Index of the first differing pixel, comparing four at a time.
fn first_mismatch(a: &[Rgb565], b: &[Rgb565]) -> Option<usize> {
    let mut i = 0;
    for (ca, cb) in a.chunks_exact(4).zip(b.chunks_exact(4)) {
        if ca != cb {
            for k in 0..4 {
                if ca[k] != cb[k] {
                    return Some(i + k);
                }
            }
        }
        i += 4;
    }
    while i < a.len() {
        if a[i] != b[i] {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Index of the last differing pixel, comparing four at a time from the end.
fn last_mismatch(a: &[Rgb565], b: &[Rgb565]) -> Option<usize> {
    let tail = a.len() - a.len() % 4;
    let mut i = a.len();
    while i > tail {
        i -= 1;
        if a[i] != b[i] {
            return Some(i);
        }
    }
    for (ca, cb) in a[..tail].rchunks_exact(4).zip(b[..tail].rchunks_exact(4)) {
        i -= 4;
        if ca != cb {
            for k in (0..4).rev() {
                if ca[k] != cb[k] {
                    return Some(i + k);
                }
            }
        }
    }
    None
}

/// Check if any pixel of column `x` differs within the given rows.
#[inline]
fn column_differs(
    a: &[Rgb565],
    b: &[Rgb565],
    w: usize,
    x: usize,
    rows: std::ops::Range<usize>,
) -> bool {
    rows.into_iter().any(|y| a[y * w + x] != b[y * w + x])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RenderConfig {
        RenderConfig::default()
    }

    fn white_rect(frame: &mut Framebuffer, rect: Rect) {
        frame.fill_rect(rect, Rgb565::WHITE);
    }

    #[test]
    fn all_frame_always_returns_whole_screen() {
        let mut engine = AllFrame::new();
        let frame = Framebuffer::new(20, 10);
        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.len(), 1);
        let span = spans.as_slice()[0];
        assert_eq!(span.rect, Rect::new(0, 0, 20, 10));
        assert_eq!(span.size, 200);
        assert_eq!(span.last_scan_right, 20);
    }

    #[test]
    fn all_frame_swap_is_identity() {
        let mut engine = AllFrame::new();
        let frame = Framebuffer::new(4, 4);
        let back = engine.swap(frame.clone());
        assert_eq!(back, frame);
    }

    #[test]
    fn bbox_identical_frames_diff_to_none() {
        let mut engine = SingleBoundingBox::new(Framebuffer::new(16, 16), &cfg());
        let frame = Framebuffer::new(16, 16);
        assert!(engine.diff(&frame).is_none());
        assert!(!engine.last_diff_overflowed());
    }

    #[test]
    fn bbox_finds_minimal_rectangle() {
        let mut engine = SingleBoundingBox::new(Framebuffer::new(32, 32), &cfg());
        let mut frame = Framebuffer::new(32, 32);
        frame.set(5, 7, Rgb565::WHITE);
        frame.set(20, 9, Rgb565::WHITE);
        frame.set(11, 15, Rgb565::WHITE);

        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.len(), 1);
        let span = spans.as_slice()[0];
        assert_eq!(span.rect, Rect::new(5, 7, 21, 16));
        // Final row's rightmost difference is at x = 11.
        assert_eq!(span.last_scan_right, 12);
        assert_eq!(span.size, 8 * 16 + 7);
    }

    #[test]
    fn bbox_single_pixel() {
        let mut engine = SingleBoundingBox::new(Framebuffer::new(8, 8), &cfg());
        let mut frame = Framebuffer::new(8, 8);
        frame.set(3, 4, Rgb565::WHITE);
        let spans = engine.diff(&frame).unwrap();
        let span = spans.as_slice()[0];
        assert_eq!(span.rect, Rect::new(3, 4, 4, 5));
        assert_eq!(span.size, 1);
    }

    #[test]
    fn bbox_word_compare_tail_pixels() {
        // Width 7 exercises the scalar tail of the 4-wide compare.
        let mut engine = SingleBoundingBox::new(Framebuffer::new(7, 3), &cfg());
        let mut frame = Framebuffer::new(7, 3);
        frame.set(6, 2, Rgb565::WHITE);
        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.as_slice()[0].rect, Rect::new(6, 2, 7, 3));
    }

    #[test]
    fn bbox_swap_replaces_baseline() {
        let mut engine = SingleBoundingBox::new(Framebuffer::new(8, 8), &cfg());
        let mut next = Framebuffer::new(8, 8);
        next.set(0, 0, Rgb565::WHITE);

        let old = engine.swap(next.clone());
        assert!(old.as_slice().iter().all(|&p| p == Rgb565::BLACK));
        // Baseline now equals `next`, so diffing it is clean.
        assert!(engine.diff(&next).is_none());
    }

    #[test]
    fn bbox_copy_preserves_callers_buffer() {
        let mut engine = SingleBoundingBox::new(Framebuffer::new(8, 8), &cfg());
        let mut frame = Framebuffer::new(8, 8);
        frame.set(2, 2, Rgb565::WHITE);
        engine.copy_from(&frame);
        assert!(engine.diff(&frame).is_none());
        // The caller's frame is untouched.
        assert_eq!(frame.get(2, 2), Some(Rgb565::WHITE));
    }

    #[test]
    fn coarse_identical_frames_diff_to_none() {
        let mut engine = CoarseBlockDiff::new(Framebuffer::new(16, 16), &cfg());
        let frame = Framebuffer::new(16, 16);
        assert!(engine.diff(&frame).is_none());
    }

    #[test]
    fn coarse_spans_are_block_aligned() {
        let mut engine = CoarseBlockDiff::new(Framebuffer::new(16, 4), &cfg());
        let mut frame = Framebuffer::new(16, 4);
        frame.set(5, 1, Rgb565::WHITE);

        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.len(), 1);
        // Pixel 5 lives in block [4, 8).
        assert_eq!(spans.as_slice()[0].rect, Rect::new(4, 1, 8, 2));
    }

    #[test]
    fn coarse_right_edge_clips_to_width() {
        let mut engine = CoarseBlockDiff::new(Framebuffer::new(10, 2), &cfg());
        let mut frame = Framebuffer::new(10, 2);
        frame.set(9, 0, Rgb565::WHITE);

        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.as_slice()[0].rect, Rect::new(8, 0, 10, 1));
    }

    #[test]
    fn coarse_gap_splits_runs() {
        let mut engine = CoarseBlockDiff::new(Framebuffer::new(24, 1), &cfg());
        let mut frame = Framebuffer::new(24, 1);
        frame.set(0, 0, Rgb565::WHITE);
        frame.set(20, 0, Rgb565::WHITE);

        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans.as_slice()[0].rect, Rect::new(0, 0, 4, 1));
        assert_eq!(spans.as_slice()[1].rect, Rect::new(20, 0, 24, 1));
    }

    #[test]
    fn exact_identical_frames_diff_to_none() {
        let mut engine = ExactThresholdDiff::new(Framebuffer::new(16, 16), &cfg());
        let frame = Framebuffer::new(16, 16);
        assert!(engine.diff(&frame).is_none());
    }

    #[test]
    fn exact_pixel_precise_run() {
        let mut engine = ExactThresholdDiff::new(Framebuffer::new(16, 2), &cfg());
        let mut frame = Framebuffer::new(16, 2);
        white_rect(&mut frame, Rect::new(3, 1, 9, 2));

        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans.as_slice()[0].rect, Rect::new(3, 1, 9, 2));
    }

    #[test]
    fn exact_bridges_small_gaps() {
        // Two runs separated by a gap within the default tolerance of 8
        // stay one span.
        let mut engine = ExactThresholdDiff::new(Framebuffer::new(32, 1), &cfg());
        let mut frame = Framebuffer::new(32, 1);
        frame.set(2, 0, Rgb565::WHITE);
        frame.set(10, 0, Rgb565::WHITE);

        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans.as_slice()[0].rect, Rect::new(2, 0, 11, 1));
    }

    #[test]
    fn exact_wide_gaps_split_runs() {
        let mut engine = ExactThresholdDiff::new(Framebuffer::new(32, 1), &cfg());
        let mut frame = Framebuffer::new(32, 1);
        frame.set(2, 0, Rgb565::WHITE);
        frame.set(20, 0, Rgb565::WHITE);

        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans.as_slice()[0].rect, Rect::new(2, 0, 3, 1));
        assert_eq!(spans.as_slice()[1].rect, Rect::new(20, 0, 21, 1));
    }

    #[test]
    fn exact_trailing_gap_is_trimmed() {
        let mut engine =
            ExactThresholdDiff::new(Framebuffer::new(16, 1), &cfg().with_gap_run(4));
        let mut frame = Framebuffer::new(16, 1);
        frame.set(3, 0, Rgb565::WHITE);
        frame.set(5, 0, Rgb565::WHITE);

        let spans = engine.diff(&frame).unwrap();
        assert_eq!(spans.as_slice()[0].rect, Rect::new(3, 0, 6, 1));
    }

    #[test]
    fn exact_drift_mask_hides_low_bits() {
        let cfg = cfg().with_mask_bits(2);
        let mut engine = ExactThresholdDiff::new(Framebuffer::new(8, 1), &cfg);
        let mut frame = Framebuffer::new(8, 1);
        // Differ only in the lowest two bits of each channel.
        frame.set(1, 0, Rgb565::from_raw(0b00011_000011_00011));
        assert!(engine.diff(&frame).is_none());

        // A change above the threshold is still seen.
        frame.set(1, 0, Rgb565::from_raw(0b00100_000000_00000));
        assert!(engine.diff(&frame).is_some());
    }

    #[test]
    fn exact_span_cap_aborts_deterministically() {
        // 16 rows of isolated changes with a cap of 8: the scan must abort,
        // flag the overflow, and return none.
        let cfg = cfg().with_max_spans(8);
        let mut engine = ExactThresholdDiff::new(Framebuffer::new(32, 16), &cfg);
        let mut frame = Framebuffer::new(32, 16);
        for y in 0..16 {
            frame.set(0, y, Rgb565::WHITE);
            frame.set(20, y, Rgb565::WHITE);
        }

        assert!(engine.diff(&frame).is_none());
        assert!(engine.last_diff_overflowed());

        // A clean follow-up diff resets the overflow flag.
        engine.copy_from(&frame);
        assert!(engine.diff(&frame).is_none());
        assert!(!engine.last_diff_overflowed());
    }

    #[test]
    fn coarse_span_cap_aborts() {
        let cfg = cfg().with_max_spans(2);
        let mut engine = CoarseBlockDiff::new(Framebuffer::new(8, 8), &cfg);
        let mut frame = Framebuffer::new(8, 8);
        for y in 0..8 {
            frame.set(0, y, Rgb565::WHITE);
        }
        assert!(engine.diff(&frame).is_none());
        assert!(engine.last_diff_overflowed());
    }

    #[test]
    fn mismatch_scans_agree_with_scalar() {
        let a = Framebuffer::new(13, 3);
        let mut b = Framebuffer::new(13, 3);
        b.set(4, 0, Rgb565::WHITE);
        b.set(12, 2, Rgb565::WHITE);

        let first = first_mismatch(a.as_slice(), b.as_slice()).unwrap();
        let last = last_mismatch(a.as_slice(), b.as_slice()).unwrap();
        assert_eq!(first, 4);
        assert_eq!(last, 2 * 13 + 12);
    }
}
