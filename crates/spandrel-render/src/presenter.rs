#![forbid(unsafe_code)]

//! Presenter: one-frame orchestration of diff → merge → transmit.
//!
//! The application draws into a [`Framebuffer`], then hands it to
//! [`Presenter::present`]. The presenter diffs it against the engine's
//! retained baseline, merges the resulting spans under the configured
//! waste budget, pushes them through the [`DisplayLink`], and only then
//! updates the baseline, swapping buffer ownership or deep-copying per
//! policy. Updating the baseline before a successful transmit would
//! desynchronize the panel from the next diff, so a transmit error leaves
//! the baseline untouched.
//!
//! # Usage
//!
//! ```
//! use spandrel_render::buffer::Framebuffer;
//! use spandrel_render::config::RenderConfig;
//! use spandrel_render::diff::ExactThresholdDiff;
//! use spandrel_render::pixel::Rgb565;
//! use spandrel_render::presenter::{DisplayLink, Presenter, StdClock};
//! use spandrel_render::span::Span;
//!
//! struct NullLink;
//! impl DisplayLink for NullLink {
//!     fn transmit(&mut self, _: &[Span], _: &Framebuffer) -> std::io::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let config = RenderConfig::default();
//! let engine = ExactThresholdDiff::new(Framebuffer::new(64, 64), &config);
//! let mut presenter = Presenter::new(engine, NullLink, StdClock::default(), &config);
//!
//! let mut frame = Framebuffer::new(64, 64);
//! frame.set(3, 3, Rgb565::WHITE);
//! let (next_frame, outcome) = presenter.present(frame).unwrap();
//! # let _ = (next_frame, outcome);
//! ```

use std::io;
use std::time::Instant;

use crate::buffer::Framebuffer;
use crate::config::RenderConfig;
use crate::diff::DiffEngine;
use crate::merge::merge_spans;
use crate::span::Span;

/// The transmit collaborator boundary.
///
/// Given the merged span list and the frame, the implementation reads
/// `frame[y * width + x]` for each span's pixel range and moves the data to
/// the panel. Controller addressing, bus timing, and byte order are
/// entirely its concern.
pub trait DisplayLink {
    /// Push the given spans of `frame` to the display.
    fn transmit(&mut self, spans: &[Span], frame: &Framebuffer) -> io::Result<()>;
}

/// Monotonic microsecond clock, used only for instrumentation.
pub trait FrameClock {
    /// Microseconds since an arbitrary fixed origin.
    fn now_micros(&self) -> u64;
}

/// [`FrameClock`] backed by [`std::time::Instant`].
#[derive(Debug)]
pub struct StdClock {
    origin: Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl FrameClock for StdClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// How the baseline frame is refreshed after a successful transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaselineUpdate {
    /// Exchange buffer ownership with the engine; the old baseline comes
    /// back to the caller as the next draw target.
    #[default]
    Swap,
    /// Deep-copy the presented frame into the baseline; the caller keeps
    /// drawing into the same buffer.
    Copy,
}

/// What a present cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Spans were transmitted and the baseline was updated.
    Presented {
        /// Spans pushed to the link after merging.
        spans: usize,
        /// Total pixels those spans cover.
        pixels: u64,
    },
    /// Nothing differed; nothing was transmitted.
    Clean,
    /// The diff aborted (span cap) and full-frame fallback is disabled.
    Aborted,
}

/// Per-phase instrumentation for the most recent present cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresentStats {
    /// Time spent diffing, in microseconds.
    pub diff_micros: u64,
    /// Time spent merging, in microseconds.
    pub merge_micros: u64,
    /// Time spent in the display link, in microseconds.
    pub transmit_micros: u64,
    /// Spans transmitted.
    pub spans: usize,
    /// Pixels transmitted.
    pub pixels: u64,
}

/// Sequences one frame: diff → merge → transmit → baseline update.
#[derive(Debug)]
pub struct Presenter<E, L, C> {
    engine: E,
    link: L,
    clock: C,
    merge_threshold: u32,
    baseline: BaselineUpdate,
    full_frame_fallback: bool,
    last_stats: PresentStats,
}

impl<E: DiffEngine, L: DisplayLink, C: FrameClock> Presenter<E, L, C> {
    /// Create a presenter; the merge budget comes from the configuration.
    pub fn new(engine: E, link: L, clock: C, config: &RenderConfig) -> Self {
        Self {
            engine,
            link,
            clock,
            merge_threshold: config.merge_threshold,
            baseline: BaselineUpdate::default(),
            full_frame_fallback: true,
            last_stats: PresentStats::default(),
        }
    }

    /// Set the baseline refresh policy.
    pub fn with_baseline(mut self, baseline: BaselineUpdate) -> Self {
        self.baseline = baseline;
        self
    }

    /// Enable or disable the full-frame fallback taken when a diff aborts
    /// on span-pool exhaustion. Enabled by default.
    pub fn with_full_frame_fallback(mut self, enabled: bool) -> Self {
        self.full_frame_fallback = enabled;
        self
    }

    /// Instrumentation for the most recent present cycle.
    #[inline]
    pub fn last_stats(&self) -> &PresentStats {
        &self.last_stats
    }

    /// Access the diff engine (e.g. to seed its baseline with `copy_from`).
    #[inline]
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Present one frame.
    ///
    /// Consumes the drawn frame and returns the buffer the caller should
    /// draw the next frame into: the old baseline under
    /// [`BaselineUpdate::Swap`], the same buffer under
    /// [`BaselineUpdate::Copy`]. The baseline is updated only after the
    /// link accepted the spans; on transmit error the baseline keeps its
    /// previous content and the error propagates.
    pub fn present(
        &mut self,
        frame: Framebuffer,
    ) -> io::Result<(Framebuffer, PresentOutcome)> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "present",
            width = frame.width(),
            height = frame.height()
        );
        #[cfg(feature = "tracing")]
        let _guard = _span.enter();

        let mut stats = PresentStats::default();
        let t0 = self.clock.now_micros();

        // Diff and merge share the engine's span pool; the borrow ends
        // with this match so the baseline update below can take the engine
        // again.
        let transmitted = match self.engine.diff(&frame) {
            Some(spans) => {
                let t1 = self.clock.now_micros();
                stats.diff_micros = t1 - t0;

                merge_spans(spans, self.merge_threshold);
                let t2 = self.clock.now_micros();
                stats.merge_micros = t2 - t1;

                self.link.transmit(spans.as_slice(), &frame)?;
                stats.transmit_micros = self.clock.now_micros() - t2;
                stats.spans = spans.len();
                stats.pixels = spans.total_pixels();
                true
            }
            None => {
                stats.diff_micros = self.clock.now_micros() - t0;
                false
            }
        };

        let outcome = if transmitted {
            PresentOutcome::Presented {
                spans: stats.spans,
                pixels: stats.pixels,
            }
        } else if self.engine.last_diff_overflowed() {
            if !self.full_frame_fallback {
                self.last_stats = stats;
                return Ok((frame, PresentOutcome::Aborted));
            }
            // Mandated recovery: resend the whole screen instead of
            // retrying the diff.
            let span = Span::full(frame.bounds());
            let t = self.clock.now_micros();
            self.link.transmit(std::slice::from_ref(&span), &frame)?;
            stats.transmit_micros = self.clock.now_micros() - t;
            stats.spans = 1;
            stats.pixels = span.size as u64;
            PresentOutcome::Presented {
                spans: 1,
                pixels: span.size as u64,
            }
        } else {
            self.last_stats = stats;
            #[cfg(feature = "tracing")]
            tracing::trace!("nothing to present");
            return Ok((frame, PresentOutcome::Clean));
        };

        // Baseline update strictly after transmit; the next diff needs the
        // panel's actual content as its reference.
        let next = match self.baseline {
            BaselineUpdate::Swap => self.engine.swap(frame),
            BaselineUpdate::Copy => {
                self.engine.copy_from(&frame);
                frame
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(
            spans = stats.spans,
            pixels = stats.pixels,
            "frame presented"
        );
        self.last_stats = stats;
        Ok((next, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{AllFrame, ExactThresholdDiff, SingleBoundingBox};
    use crate::pixel::Rgb565;
    use spandrel_core::geometry::Rect;
    use std::cell::Cell as StdCell;
    use std::rc::Rc;

    /// Records every transmit call; optionally fails.
    struct RecordingLink {
        calls: Rc<StdCell<usize>>,
        spans_seen: Rc<StdCell<usize>>,
        pixels_seen: Rc<StdCell<u64>>,
        fail: bool,
    }

    impl RecordingLink {
        fn new() -> (Self, Rc<StdCell<usize>>, Rc<StdCell<usize>>, Rc<StdCell<u64>>) {
            let calls = Rc::new(StdCell::new(0));
            let spans = Rc::new(StdCell::new(0));
            let pixels = Rc::new(StdCell::new(0));
            (
                Self {
                    calls: Rc::clone(&calls),
                    spans_seen: Rc::clone(&spans),
                    pixels_seen: Rc::clone(&pixels),
                    fail: false,
                },
                calls,
                spans,
                pixels,
            )
        }
    }

    impl DisplayLink for RecordingLink {
        fn transmit(&mut self, spans: &[Span], _frame: &Framebuffer) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::other("bus error"));
            }
            self.calls.set(self.calls.get() + 1);
            self.spans_seen.set(spans.len());
            self.pixels_seen
                .set(spans.iter().map(|s| s.size as u64).sum());
            Ok(())
        }
    }

    /// Deterministic clock advancing a fixed step per query.
    struct TickClock {
        now: StdCell<u64>,
    }

    impl TickClock {
        fn new() -> Self {
            Self {
                now: StdCell::new(0),
            }
        }
    }

    impl FrameClock for TickClock {
        fn now_micros(&self) -> u64 {
            let t = self.now.get();
            self.now.set(t + 100);
            t
        }
    }

    fn config() -> RenderConfig {
        RenderConfig::default()
    }

    #[test]
    fn clean_frame_presents_nothing() {
        let (link, calls, _, _) = RecordingLink::new();
        let engine = SingleBoundingBox::new(Framebuffer::new(8, 8), &config());
        let mut presenter = Presenter::new(engine, link, TickClock::new(), &config());

        let (_, outcome) = presenter.present(Framebuffer::new(8, 8)).unwrap();
        assert_eq!(outcome, PresentOutcome::Clean);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn changed_frame_transmits_then_swaps() {
        let (link, calls, spans, pixels) = RecordingLink::new();
        let engine = SingleBoundingBox::new(Framebuffer::new(8, 8), &config());
        let mut presenter = Presenter::new(engine, link, TickClock::new(), &config());

        let mut frame = Framebuffer::new(8, 8);
        frame.fill_rect(Rect::new(2, 2, 5, 6), Rgb565::WHITE);
        let (next, outcome) = presenter.present(frame).unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(spans.get(), 1);
        assert_eq!(pixels.get(), 12);
        assert_eq!(
            outcome,
            PresentOutcome::Presented {
                spans: 1,
                pixels: 12
            }
        );
        // Swap policy: the returned buffer is the engine's old baseline.
        assert!(next.as_slice().iter().all(|&p| p == Rgb565::BLACK));

        // Second presentation of the same content is clean.
        let mut frame = next;
        frame.fill_rect(Rect::new(2, 2, 5, 6), Rgb565::WHITE);
        let (_, outcome) = presenter.present(frame).unwrap();
        assert_eq!(outcome, PresentOutcome::Clean);
    }

    #[test]
    fn copy_policy_returns_same_buffer() {
        let (link, calls, _, _) = RecordingLink::new();
        let engine = SingleBoundingBox::new(Framebuffer::new(8, 8), &config());
        let mut presenter = Presenter::new(engine, link, TickClock::new(), &config())
            .with_baseline(BaselineUpdate::Copy);

        let mut frame = Framebuffer::new(8, 8);
        frame.set(1, 1, Rgb565::WHITE);
        let (next, _) = presenter.present(frame).unwrap();
        assert_eq!(calls.get(), 1);
        // Copy policy: the caller keeps the buffer it drew.
        assert_eq!(next.get(1, 1), Some(Rgb565::WHITE));

        let (_, outcome) = presenter.present(next).unwrap();
        assert_eq!(outcome, PresentOutcome::Clean);
    }

    #[test]
    fn transmit_error_leaves_baseline_stale() {
        let (mut link, _, _, _) = RecordingLink::new();
        link.fail = true;
        let engine = SingleBoundingBox::new(Framebuffer::new(8, 8), &config());
        let mut presenter = Presenter::new(engine, link, TickClock::new(), &config());

        let mut frame = Framebuffer::new(8, 8);
        frame.set(0, 0, Rgb565::WHITE);
        assert!(presenter.present(frame).is_err());

        // The failed frame never became the baseline: presenting the same
        // content again still finds the difference.
        let mut frame = Framebuffer::new(8, 8);
        frame.set(0, 0, Rgb565::WHITE);
        let engine = presenter.engine_mut();
        assert!(engine.diff(&frame).is_some());
    }

    #[test]
    fn overflow_falls_back_to_full_frame() {
        let (link, calls, spans, pixels) = RecordingLink::new();
        let cfg = config().with_max_spans(2);
        let engine = ExactThresholdDiff::new(Framebuffer::new(16, 8), &cfg);
        let mut presenter = Presenter::new(engine, link, TickClock::new(), &cfg);

        // Isolated changes on many rows blow the 2-span cap.
        let mut frame = Framebuffer::new(16, 8);
        for y in 0..8 {
            frame.set(0, y, Rgb565::WHITE);
        }
        let (_, outcome) = presenter.present(frame).unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(spans.get(), 1);
        assert_eq!(pixels.get(), 16 * 8);
        assert_eq!(
            outcome,
            PresentOutcome::Presented {
                spans: 1,
                pixels: 16 * 8
            }
        );
    }

    #[test]
    fn overflow_without_fallback_aborts() {
        let (link, calls, _, _) = RecordingLink::new();
        let cfg = config().with_max_spans(2);
        let engine = ExactThresholdDiff::new(Framebuffer::new(16, 8), &cfg);
        let mut presenter = Presenter::new(engine, link, TickClock::new(), &cfg)
            .with_full_frame_fallback(false);

        let mut frame = Framebuffer::new(16, 8);
        for y in 0..8 {
            frame.set(0, y, Rgb565::WHITE);
        }
        let (returned, outcome) = presenter.present(frame).unwrap();

        assert_eq!(outcome, PresentOutcome::Aborted);
        assert_eq!(calls.get(), 0);
        // The caller gets its buffer back unchanged.
        assert_eq!(returned.get(0, 3), Some(Rgb565::WHITE));
    }

    #[test]
    fn all_frame_engine_always_presents() {
        let (link, calls, _, pixels) = RecordingLink::new();
        let mut presenter =
            Presenter::new(AllFrame::new(), link, TickClock::new(), &config());

        let (_, outcome) = presenter.present(Framebuffer::new(10, 10)).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(pixels.get(), 100);
        assert!(matches!(outcome, PresentOutcome::Presented { spans: 1, .. }));
    }

    #[test]
    fn stats_cover_each_phase() {
        let (link, _, _, _) = RecordingLink::new();
        let engine = SingleBoundingBox::new(Framebuffer::new(8, 8), &config());
        let mut presenter = Presenter::new(engine, link, TickClock::new(), &config());

        let mut frame = Framebuffer::new(8, 8);
        frame.set(4, 4, Rgb565::WHITE);
        presenter.present(frame).unwrap();

        let stats = presenter.last_stats();
        // The tick clock advances 100µs per query, so each phase reads as
        // a positive duration.
        assert!(stats.diff_micros > 0);
        assert!(stats.merge_micros > 0);
        assert!(stats.transmit_micros > 0);
        assert_eq!(stats.spans, 1);
        assert_eq!(stats.pixels, 1);
    }
}
