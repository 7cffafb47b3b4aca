//! Data module: unstructured mesh storage, attribute arrays, point lookup
//! and merging.

pub mod attributes;
pub mod locator;
pub mod merge;
pub mod mesh;

pub use attributes::{Attributes, DataArray};
pub use locator::PointLocator;
pub use merge::{MeshMerger, PointMatch, merge_meshes};
pub use mesh::{PointCellLinks, UnstructuredMesh};
