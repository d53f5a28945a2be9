#![forbid(unsafe_code)]

//! Spandrel public facade crate.
//!
//! Re-exports the common types from the internal crates so applications
//! can depend on one crate and one prelude.

// --- Core re-exports -------------------------------------------------------

pub use spandrel_core::fixed::{self, FIXED_MASK, FIXED_ONE, FIXED_SHIFT, Fixed};
pub use spandrel_core::geometry::Rect;

// --- Render re-exports -----------------------------------------------------

pub use spandrel_render::buffer::Framebuffer;
pub use spandrel_render::config::RenderConfig;
pub use spandrel_render::diff::{
    AllFrame, CoarseBlockDiff, DiffEngine, ExactThresholdDiff, SingleBoundingBox,
};
pub use spandrel_render::gamma::GammaTable;
pub use spandrel_render::merge::merge_spans;
pub use spandrel_render::pixel::Rgb565;
pub use spandrel_render::presenter::{
    BaselineUpdate, DisplayLink, FrameClock, PresentOutcome, PresentStats, Presenter, StdClock,
};
pub use spandrel_render::raster::{FillRule, Rasterizer};
pub use spandrel_render::span::{Span, SpanBuf};

/// One-import convenience for applications.
pub mod prelude {
    pub use crate::{
        BaselineUpdate, DiffEngine, DisplayLink, FillRule, Framebuffer, PresentOutcome,
        Presenter, Rasterizer, Rect, RenderConfig, Rgb565, Span,
    };
}
