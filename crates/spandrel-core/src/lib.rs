#![forbid(unsafe_code)]

//! Shared primitives for the spandrel pipeline: half-open rectangle
//! geometry, 24.8 fixed-point coordinates, and the logging facade.

pub mod fixed;
pub mod geometry;
pub mod logging;
