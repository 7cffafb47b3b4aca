//! Clipping a worker's cells to its region box.

use crate::data::attributes::{DataArray, GHOST_LEVEL, INSIDE_REGION};
use crate::data::locator::PointLocator;
use crate::data::mesh::UnstructuredMesh;
use crate::geometry::bounds::Bounds;
use crate::geometry::clip::CellClipper;
use crate::mesh_error::MeshError;
use crate::partitioning::{PartitionTree, RegionOwnership};

/// The single box covering `worker`'s regions, `None` if it owns none.
///
/// Regions that do not merge into one box cannot be clipped to and give
/// [`MeshError::UnsupportedTopology`].
pub fn worker_box(
    tree: &PartitionTree,
    ownership: &RegionOwnership,
    worker: usize,
) -> Result<Option<Bounds>, MeshError> {
    let boxes = tree.minimal_convex_sub_regions(ownership.regions_owned_by(worker));
    match boxes[..] {
        [] => Ok(None),
        [b] => Ok(Some(b)),
        _ => Err(MeshError::UnsupportedTopology(format!(
            "worker {worker} owns {} disjoint boxes",
            boxes.len()
        ))),
    }
}

/// Split every cell of `mesh` by `region`.
///
/// With `ghost_level` 0 only the inside fragments remain. Otherwise all
/// fragments are kept, inside ones marked in `inside_region` at level 0,
/// and outside ones leveled by point adjacency; fragments farther than
/// `ghost_level` are dropped. Fragment vertices closer than `tolerance`
/// become one point. Point data of new vertices is interpolated from the
/// cell's vertices.
pub fn clip_to_region(
    mesh: &UnstructuredMesh,
    region: &Bounds,
    clipper: &dyn CellClipper,
    ghost_level: u8,
    tolerance: f64,
) -> Result<UnstructuredMesh, MeshError> {
    let mut out = UnstructuredMesh::new();
    let mut locator = PointLocator::new(tolerance);
    let mut point_src: Vec<Vec<(usize, f64)>> = Vec::new();
    let mut cell_src = Vec::new();
    let mut inside = Vec::new();

    for c in 0..mesh.num_cells() {
        let clipped = clipper.clip(mesh.cell_type(c), &mesh.cell_vertices(c), region)?;
        let outside = if ghost_level > 0 {
            clipped.outside
        } else {
            Vec::new()
        };
        let fragments = clipped
            .inside
            .into_iter()
            .map(|f| (f, true))
            .chain(outside.into_iter().map(|f| (f, false)));
        for (frag, is_inside) in fragments {
            let corners = mesh.cell_points(c);
            let mut ids = Vec::with_capacity(frag.vertices.len());
            for (v, weights) in frag.vertices.into_iter().zip(frag.weights) {
                let (id, fresh) = locator.insert_unique(v);
                if fresh {
                    out.add_point(v);
                    point_src.push(weights.into_iter().map(|(i, w)| (corners[i], w)).collect());
                }
                ids.push(id);
            }
            out.add_cell(frag.kind, &ids)?;
            cell_src.push(c);
            inside.push(is_inside);
        }
    }

    for (name, arr) in mesh.point_data() {
        if name == GHOST_LEVEL {
            continue;
        }
        let mut copy = arr.empty_like();
        for weights in &point_src {
            copy.push_interpolated(arr, weights)?;
        }
        out.set_point_array(name, copy)?;
    }
    for (name, arr) in mesh.cell_data() {
        if name == GHOST_LEVEL || name == INSIDE_REGION {
            continue;
        }
        out.set_cell_array(name, arr.select(&cell_src)?)?;
    }
    if ghost_level == 0 {
        log::debug!("clipped {} cells to {} inside fragments", mesh.num_cells(), out.num_cells());
        return Ok(out);
    }

    let (point_level, cell_level) = adjacency_levels(&out, &inside, ghost_level);
    let kept: Vec<usize> = (0..out.num_cells()).filter(|&c| cell_level[c].is_some()).collect();
    let unreached = ghost_level.saturating_add(1);
    out.set_point_array(
        GHOST_LEVEL,
        DataArray::scalar_u8(point_level.iter().map(|l| l.unwrap_or(unreached)).collect()),
    )?;
    out.set_cell_array(
        GHOST_LEVEL,
        DataArray::scalar_u8(cell_level.iter().map(|l| l.unwrap_or(unreached)).collect()),
    )?;
    out.set_cell_array(
        INSIDE_REGION,
        DataArray::scalar_u8(inside.iter().map(|&i| u8::from(i)).collect()),
    )?;
    log::debug!(
        "clipped {} cells to {} fragments within {ghost_level} levels",
        mesh.num_cells(),
        kept.len()
    );
    out.extract_cells(&kept)
}

/// Levels by point adjacency: `inside` cells and their points are 0, a
/// cell first touching a level `g - 1` point is `g`.
fn adjacency_levels(
    mesh: &UnstructuredMesh,
    inside: &[bool],
    max_level: u8,
) -> (Vec<Option<u8>>, Vec<Option<u8>>) {
    let mut point_level = vec![None; mesh.num_points()];
    let mut cell_level = vec![None; mesh.num_cells()];
    for c in (0..mesh.num_cells()).filter(|&c| inside[c]) {
        cell_level[c] = Some(0);
        for &p in mesh.cell_points(c) {
            point_level[p] = Some(0);
        }
    }
    for g in 1..=max_level {
        let reached: Vec<usize> = (0..mesh.num_cells())
            .filter(|&c| {
                cell_level[c].is_none()
                    && mesh.cell_points(c).iter().any(|&p| point_level[p] == Some(g - 1))
            })
            .collect();
        for c in reached {
            cell_level[c] = Some(g);
            for &p in mesh.cell_points(c) {
                point_level[p].get_or_insert(g);
            }
        }
    }
    (point_level, cell_level)
}
