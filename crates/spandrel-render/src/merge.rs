#![forbid(unsafe_code)]

//! Greedy span merging under a wasted-pixel budget.
//!
//! Diff engines emit many small spans; every span a transmit layer pushes
//! carries fixed protocol overhead (window addressing, command bytes), so
//! fewer-but-larger rectangles are often cheaper even when they resend
//! some unchanged pixels. The merger folds span pairs into their bounding
//! rectangle whenever the pixels added that way stay within the caller's
//! budget.
//!
//! # Algorithm
//!
//! Input spans arrive ordered non-decreasing by top edge (scan order
//! guarantees this). For each surviving span `i`, candidates `j` are walked
//! forward only while `j.top <= i.bottom`: once a candidate starts below
//! `i`'s bottom edge, no later candidate can touch `i` either, so the walk
//! stops. A merge updates `i` in place (growing its bottom edge can
//! unlock candidates further along the same walk) and marks `j` dead by
//! zeroing its size. Dead spans compact out at the end, preserving the top
//! ordering.
//!
//! Worst case is quadratic in span count, bounded in practice by the hard
//! span cap and the vertical early exit.

use crate::span::{Span, SpanBuf, pixel_count};

/// Merge spans in place, tolerating up to `pixel_threshold` retransmitted
/// pixels per merge.
///
/// The input ordering invariant (non-decreasing `top`) is preserved on
/// output.
pub fn merge_spans(spans: &mut SpanBuf, pixel_threshold: u32) {
    #[cfg(feature = "tracing")]
    let _span = tracing::debug_span!("merge_spans", input = spans.len());
    #[cfg(feature = "tracing")]
    let _guard = _span.enter();

    let list = spans.as_mut_slice();
    for i in 0..list.len() {
        if list[i].size == 0 {
            continue;
        }
        let mut j = i + 1;
        while j < list.len() {
            if list[j].size == 0 {
                j += 1;
                continue;
            }
            // Vertical early exit: spans are ordered by top, so nothing
            // beyond this candidate can reach `i` anymore.
            if list[j].top() > list[i].bottom() {
                break;
            }
            let union = union_of(&list[i], &list[j]);
            let wasted = union.size as i64 - list[i].size as i64 - list[j].size as i64;
            if wasted <= pixel_threshold as i64 {
                list[i] = union;
                list[j].size = 0;
            }
            j += 1;
        }
    }
    spans.retain_live();

    #[cfg(feature = "tracing")]
    tracing::trace!(output = spans.len(), "spans merged");
}

/// The bounding span of two spans, with the partial final scanline carried
/// over from whichever input owns the union's bottom row.
fn union_of(a: &Span, b: &Span) -> Span {
    let rect = a.rect.union(&b.rect);
    let last_scan_right = if a.rect.bottom == b.rect.bottom {
        a.last_scan_right.max(b.last_scan_right)
    } else if a.rect.bottom > b.rect.bottom {
        a.last_scan_right
    } else {
        b.last_scan_right
    };
    Span {
        rect,
        last_scan_right,
        size: pixel_count(&rect, last_scan_right),
    }
}
