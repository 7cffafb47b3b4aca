//! Cell type metadata for mesh cells.
//!
//! Vertex ordering follows the usual tensor-product convention: for a
//! hexahedron, `0..4` is the bottom face counter-clockwise and `4..8` the top
//! face above it.

use serde::{Deserialize, Serialize};

/// Common cell types for mesh elements.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum CellType {
    /// 0D vertex.
    #[default]
    Vertex,
    /// 1D segment/edge.
    Segment,
    /// 2D simplex (triangle).
    Triangle,
    /// 2D tensor-product cell (quad).
    Quadrilateral,
    /// 3D simplex (tet).
    Tetrahedron,
    /// 3D tensor-product cell (hex).
    Hexahedron,
    /// 3D wedge/prism.
    Prism,
    /// 3D pyramid.
    Pyramid,
    /// 2D polygon with any number of vertices.
    Polygon,
}

impl CellType {
    /// Returns the topological dimension of the cell.
    pub fn dimension(self) -> u8 {
        match self {
            CellType::Vertex => 0,
            CellType::Segment => 1,
            CellType::Triangle | CellType::Quadrilateral | CellType::Polygon => 2,
            CellType::Tetrahedron | CellType::Hexahedron | CellType::Prism | CellType::Pyramid => 3,
        }
    }

    /// Fixed vertex count, `None` for polygons.
    pub fn vertex_count(self) -> Option<usize> {
        match self {
            CellType::Vertex => Some(1),
            CellType::Segment => Some(2),
            CellType::Triangle => Some(3),
            CellType::Quadrilateral | CellType::Tetrahedron => Some(4),
            CellType::Pyramid => Some(5),
            CellType::Prism => Some(6),
            CellType::Hexahedron => Some(8),
            CellType::Polygon => None,
        }
    }

    /// Whether `n` vertices is a valid connectivity length.
    pub fn accepts(self, n: usize) -> bool {
        match self.vertex_count() {
            Some(k) => k == n,
            None => n >= 3,
        }
    }
}
