//! Merge several meshes into one, dropping duplicate points and cells.
//!
//! Points are matched by a global id array when one is named, otherwise by
//! coincidence within a tolerance. Cells are matched by a global cell id
//! array when one is named; without it every cell is kept. The first
//! occurrence of a point or cell wins, attributes included.

use hashbrown::{HashMap, HashSet};

use crate::data::locator::PointLocator;
use crate::data::mesh::UnstructuredMesh;
use crate::mesh_error::MeshError;

/// How merged points are recognised as the same point.
#[derive(Clone, Debug, PartialEq)]
pub enum PointMatch {
    /// Same value in the named `i64` point array.
    GlobalId(String),
    /// Euclidean distance within the tolerance (0 = bit-identical).
    Tolerance(f64),
}

/// Incremental merger; feed meshes with [`merge`](Self::merge) and take the
/// result with [`finish`](Self::finish).
pub struct MeshMerger {
    out: UnstructuredMesh,
    points: PointMatch,
    cell_ids: Option<String>,
    by_gid: HashMap<i64, usize>,
    locator: PointLocator,
    seen_cells: HashSet<i64>,
}

impl MeshMerger {
    pub fn new(points: PointMatch, cell_ids: Option<String>) -> Self {
        let tol = match &points {
            PointMatch::Tolerance(t) => *t,
            PointMatch::GlobalId(_) => 0.0,
        };
        Self {
            out: UnstructuredMesh::new(),
            points,
            cell_ids,
            by_gid: HashMap::new(),
            locator: PointLocator::new(tol),
            seen_cells: HashSet::new(),
        }
    }

    /// Start from `base`, which is taken as already free of duplicates.
    pub fn with_base(
        base: UnstructuredMesh,
        points: PointMatch,
        cell_ids: Option<String>,
    ) -> Result<Self, MeshError> {
        let mut m = Self::new(points, cell_ids);
        match &m.points {
            PointMatch::GlobalId(name) => {
                if let Some(ids) = base.point_ids(name)? {
                    for (i, &g) in ids.iter().enumerate() {
                        m.by_gid.entry(g).or_insert(i);
                    }
                }
            }
            PointMatch::Tolerance(_) => {
                for &p in base.points() {
                    m.locator.insert(p);
                }
            }
        }
        if let Some(name) = &m.cell_ids {
            if let Some(ids) = base.cell_ids(name)? {
                m.seen_cells.extend(ids.iter().copied());
            }
        }
        m.out = base;
        Ok(m)
    }

    /// Add every point and cell of `mesh` that is not already present.
    pub fn merge(&mut self, mesh: &UnstructuredMesh) -> Result<(), MeshError> {
        let gids = match &self.points {
            PointMatch::GlobalId(name) => Some(
                mesh.point_ids(name)?
                    .ok_or_else(|| MeshError::MissingAttribute(name.clone()))?,
            ),
            PointMatch::Tolerance(_) => None,
        };
        let cell_gids = match &self.cell_ids {
            Some(name) => mesh.cell_ids(name)?,
            None => None,
        };

        // cells first decide which points are needed
        let mut keep_cells = Vec::with_capacity(mesh.num_cells());
        for c in 0..mesh.num_cells() {
            if let Some(ids) = cell_gids {
                if !self.seen_cells.insert(ids[c]) {
                    continue;
                }
            }
            keep_cells.push(c);
        }

        let mut point_map = vec![usize::MAX; mesh.num_points()];
        for p in 0..mesh.num_points() {
            let existing = match gids {
                Some(ids) => self.by_gid.get(&ids[p]).copied(),
                None => self.locator.find(&mesh.point(p)),
            };
            point_map[p] = match existing {
                Some(i) => i,
                None => {
                    let i = self.out.push_point_from(mesh, p)?;
                    match gids {
                        Some(ids) => {
                            self.by_gid.insert(ids[p], i);
                        }
                        None => {
                            self.locator.insert(mesh.point(p));
                        }
                    }
                    i
                }
            };
        }

        for c in keep_cells {
            self.out.push_cell_from(mesh, c, &point_map)?;
        }
        Ok(())
    }

    /// The mesh merged so far.
    pub fn mesh(&self) -> &UnstructuredMesh {
        &self.out
    }

    pub fn finish(self) -> UnstructuredMesh {
        self.out
    }
}

/// Merge `meshes` in order with a fresh [`MeshMerger`].
pub fn merge_meshes<'a>(
    meshes: impl IntoIterator<Item = &'a UnstructuredMesh>,
    points: PointMatch,
    cell_ids: Option<String>,
) -> Result<UnstructuredMesh, MeshError> {
    let mut merger = MeshMerger::new(points, cell_ids);
    for m in meshes {
        merger.merge(m)?;
    }
    Ok(merger.finish())
}
