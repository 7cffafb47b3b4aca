//! Geometry metrics for mesh cells: volume, centroid and bounding box.
//!
//! Reference vertex orderings:
//! - Segment: `[v0, v1]`.
//! - Triangle / Quadrilateral / Polygon: counter-clockwise loop.
//! - Tetrahedron: `[v0, v1, v2, v3]`.
//! - Hexahedron: `[v0..v3]` bottom loop, `[v4..v7]` top loop above it.
//! - Prism: `[v0, v1, v2]` bottom triangle, `[v3, v4, v5]` top.
//! - Pyramid: `[v0..v3]` base loop, apex `v4`.

use crate::geometry::bounds::Bounds;
use crate::mesh_error::MeshError;
use crate::topology::cell_type::CellType;

/// Compute the unsigned cell volume/area/length for the given vertices.
///
/// For 2D cells embedded in 3D, the returned area is the magnitude of the
/// area vector.
pub fn cell_volume(cell_type: CellType, vertices: &[[f64; 3]]) -> Result<f64, MeshError> {
    if !cell_type.accepts(vertices.len()) {
        return Err(MeshError::UnsupportedTopology(format!(
            "{cell_type:?} with {} vertices",
            vertices.len()
        )));
    }
    let v = vertices;
    Ok(match cell_type {
        CellType::Vertex => 0.0,
        CellType::Segment => norm(sub(v[1], v[0])),
        CellType::Triangle | CellType::Quadrilateral | CellType::Polygon => {
            let mut area = [0.0; 3];
            for i in 1..v.len() - 1 {
                let c = cross(sub(v[i], v[0]), sub(v[i + 1], v[0]));
                area = [area[0] + c[0], area[1] + c[1], area[2] + c[2]];
            }
            0.5 * norm(area)
        }
        CellType::Tetrahedron => signed_volume(v[0], v[1], v[2], v[3]).abs(),
        CellType::Hexahedron => hex_volume(v).abs(),
        CellType::Prism => prism_volume(v).abs(),
        CellType::Pyramid => pyramid_volume(v).abs(),
    })
}

/// Arithmetic mean of the vertices.
pub fn centroid(vertices: &[[f64; 3]]) -> [f64; 3] {
    if vertices.is_empty() {
        return [0.0; 3];
    }
    let n = vertices.len() as f64;
    let mut c = [0.0; 3];
    for v in vertices {
        for d in 0..3 {
            c[d] += v[d];
        }
    }
    c.map(|x| x / n)
}

/// Tight bounding box of the vertices.
pub fn cell_bounds(vertices: &[[f64; 3]]) -> Bounds {
    Bounds::from_points(vertices)
}

fn signed_volume(a: [f64; 3], b: [f64; 3], c: [f64; 3], d: [f64; 3]) -> f64 {
    dot(sub(b, a), cross(sub(c, a), sub(d, a))) / 6.0
}

fn prism_volume(v: &[[f64; 3]]) -> f64 {
    signed_volume(v[0], v[1], v[2], v[5]).abs()
        + signed_volume(v[0], v[1], v[5], v[4]).abs()
        + signed_volume(v[0], v[4], v[5], v[3]).abs()
}

fn pyramid_volume(v: &[[f64; 3]]) -> f64 {
    signed_volume(v[0], v[1], v[2], v[4]).abs() + signed_volume(v[0], v[2], v[3], v[4]).abs()
}

fn hex_volume(v: &[[f64; 3]]) -> f64 {
    signed_volume(v[0], v[1], v[3], v[4])
        + signed_volume(v[1], v[2], v[3], v[6])
        + signed_volume(v[1], v[3], v[4], v[6])
        + signed_volume(v[1], v[4], v[5], v[6])
        + signed_volume(v[3], v[4], v[6], v[7])
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(lo: [f64; 3], hi: [f64; 3]) -> Vec<[f64; 3]> {
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

    #[test]
    fn box_volume() {
        let v = hex([0.0, 0.0, 0.0], [2.0, 3.0, 0.5]);
        let vol = cell_volume(CellType::Hexahedron, &v).unwrap();
        assert!((vol - 3.0).abs() < 1e-12);
        assert_eq!(centroid(&v), [1.0, 1.5, 0.25]);
    }

    #[test]
    fn tet_and_triangle() {
        let t = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert!((cell_volume(CellType::Tetrahedron, &t).unwrap() - 1.0 / 6.0).abs() < 1e-12);
        assert!((cell_volume(CellType::Triangle, &t[..3]).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let err = cell_volume(CellType::Hexahedron, &[[0.0; 3]; 4]).unwrap_err();
        assert!(matches!(err, MeshError::UnsupportedTopology(_)));
    }
}
