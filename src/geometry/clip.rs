//! Clipping individual cells against an axis-aligned region box.
//!
//! [`CellClipper`] is the seam: the redistribution clip step only asks for
//! the inside and outside fragments of a cell. [`BoxClipper`] is an exact
//! implementation for axis-aligned hexahedra; it passes other cells through
//! whole when they lie entirely on one side.

use crate::geometry::bounds::Bounds;
use crate::geometry::metrics::cell_bounds;
use crate::mesh_error::MeshError;
use crate::topology::cell_type::CellType;

/// A new cell produced by clipping, with its own vertex coordinates.
///
/// `weights[i]` expresses vertex `i` as a combination of the clipped
/// cell's vertices, as `(index into the input vertices, weight)` pairs.
#[derive(Clone, Debug, PartialEq)]
pub struct CellFragment {
    pub kind: CellType,
    pub vertices: Vec<[f64; 3]>,
    pub weights: Vec<Vec<(usize, f64)>>,
}

/// Fragments of one cell on each side of a region boundary.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClippedCell {
    pub inside: Vec<CellFragment>,
    pub outside: Vec<CellFragment>,
}

/// Splits a cell by a region box.
pub trait CellClipper: Send + Sync {
    fn clip(
        &self,
        kind: CellType,
        vertices: &[[f64; 3]],
        region: &Bounds,
    ) -> Result<ClippedCell, MeshError>;
}

/// Exact clipper for axis-aligned hexahedra.
#[derive(Copy, Clone, Debug)]
pub struct BoxClipper {
    /// Coordinate slack when testing for box corners.
    pub tolerance: f64,
}

impl Default for BoxClipper {
    fn default() -> Self {
        Self { tolerance: 1e-12 }
    }
}

impl BoxClipper {
    /// For an axis-aligned box, the input vertex at each corner, indexed by
    /// corner bits (bit `d` set for the max side of axis `d`).
    fn box_corners(&self, kind: CellType, vertices: &[[f64; 3]], bb: &Bounds) -> Option<[usize; 8]> {
        if kind != CellType::Hexahedron || vertices.len() != 8 {
            return None;
        }
        let near = |a: f64, b: f64| (a - b).abs() <= self.tolerance;
        let mut at = [usize::MAX; 8];
        for (i, v) in vertices.iter().enumerate() {
            let mut corner = 0;
            for d in 0..3 {
                if near(v[d], bb.max[d]) {
                    corner |= 1 << d;
                } else if !near(v[d], bb.min[d]) {
                    return None;
                }
            }
            if at[corner] != usize::MAX {
                return None;
            }
            at[corner] = i;
        }
        Some(at)
    }
}

/// Trilinear weights of `p` inside the box `bb` whose corners are `at`.
fn trilinear(p: &[f64; 3], bb: &Bounds, at: &[usize; 8]) -> Vec<(usize, f64)> {
    let t: [f64; 3] = std::array::from_fn(|d| (p[d] - bb.min[d]) / bb.extent(d));
    (0..8)
        .map(|corner| {
            let w: f64 = (0..3)
                .map(|d| if corner & (1 << d) != 0 { t[d] } else { 1.0 - t[d] })
                .product();
            (at[corner], w)
        })
        .filter(|&(_, w)| w > 0.0)
        .collect()
}

/// The eight corners of `b` in hexahedron order.
pub fn hex_corners(b: &Bounds) -> Vec<[f64; 3]> {
    let (lo, hi) = (b.min, b.max);
    vec![
        [lo[0], lo[1], lo[2]],
        [hi[0], lo[1], lo[2]],
        [hi[0], hi[1], lo[2]],
        [lo[0], hi[1], lo[2]],
        [lo[0], lo[1], hi[2]],
        [hi[0], lo[1], hi[2]],
        [hi[0], hi[1], hi[2]],
        [lo[0], hi[1], hi[2]],
    ]
}

fn box_fragment(b: &Bounds, cell: &Bounds, at: &[usize; 8]) -> CellFragment {
    let vertices = hex_corners(b);
    let weights = vertices.iter().map(|v| trilinear(v, cell, at)).collect();
    CellFragment {
        kind: CellType::Hexahedron,
        vertices,
        weights,
    }
}

impl CellClipper for BoxClipper {
    fn clip(
        &self,
        kind: CellType,
        vertices: &[[f64; 3]],
        region: &Bounds,
    ) -> Result<ClippedCell, MeshError> {
        let bb = cell_bounds(vertices);
        let whole = || CellFragment {
            kind,
            vertices: vertices.to_vec(),
            weights: (0..vertices.len()).map(|i| vec![(i, 1.0)]).collect(),
        };
        if region.intersection(&bb) == Some(bb) {
            return Ok(ClippedCell {
                inside: vec![whole()],
                outside: Vec::new(),
            });
        }
        if !region.overlaps(&bb) {
            return Ok(ClippedCell {
                inside: Vec::new(),
                outside: vec![whole()],
            });
        }
        let Some(at) = self.box_corners(kind, vertices, &bb) else {
            return Err(MeshError::UnsupportedTopology(format!(
                "cannot clip a {kind:?} that is not an axis-aligned box"
            )));
        };

        let Some(inner) = region.intersection(&bb) else {
            return Ok(ClippedCell {
                inside: Vec::new(),
                outside: vec![whole()],
            });
        };
        let mut outside = Vec::new();
        let mut rest = bb;
        for d in 0..3 {
            if rest.min[d] < inner.min[d] {
                let mut slab = rest;
                slab.max[d] = inner.min[d];
                outside.push(box_fragment(&slab, &bb, &at));
                rest.min[d] = inner.min[d];
            }
            if rest.max[d] > inner.max[d] {
                let mut slab = rest;
                slab.min[d] = inner.max[d];
                outside.push(box_fragment(&slab, &bb, &at));
                rest.max[d] = inner.max[d];
            }
        }
        Ok(ClippedCell {
            inside: vec![box_fragment(&rest, &bb, &at)],
            outside,
        })
    }
}
