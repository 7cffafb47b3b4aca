//! Geometry utilities: axis-aligned boxes, cell metrics and cell clipping.

pub mod bounds;
pub mod clip;
pub mod metrics;

pub use bounds::Bounds;
pub use clip::{BoxClipper, CellClipper, CellFragment, ClippedCell};
