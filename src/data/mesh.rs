//! Unstructured mesh: points, CSR cell connectivity and attribute arrays.
//!
//! Every mutation through the public API bumps a revision counter, which the
//! partition tree cache uses as the mesh "timestamp".

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::algs::wire::{WireHdr, cast_slice, decode_one};
use crate::data::attributes::{Attributes, DataArray, GHOST_LEVEL, append_tuple};
use crate::geometry::bounds::Bounds;
use crate::geometry::metrics;
use crate::mesh_error::MeshError;
use crate::topology::cell_type::CellType;

/// Wire header kind for serialized meshes.
pub const WIRE_KIND_MESH: u16 = 0x4D;

static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);

fn next_revision() -> u64 {
    NEXT_REVISION.fetch_add(1, Ordering::Relaxed)
}

/// A mixed-cell unstructured mesh.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnstructuredMesh {
    points: Vec<[f64; 3]>,
    cell_types: Vec<CellType>,
    offsets: Vec<usize>,
    connectivity: Vec<usize>,
    point_data: Attributes,
    cell_data: Attributes,
    #[serde(skip, default = "next_revision")]
    revision: u64,
}

impl Default for UnstructuredMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for UnstructuredMesh {
    fn eq(&self, other: &Self) -> bool {
        self.points == other.points
            && self.cell_types == other.cell_types
            && self.offsets == other.offsets
            && self.connectivity == other.connectivity
            && self.point_data == other.point_data
            && self.cell_data == other.cell_data
    }
}

impl UnstructuredMesh {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            cell_types: Vec::new(),
            offsets: vec![0],
            connectivity: Vec::new(),
            point_data: Attributes::new(),
            cell_data: Attributes::new(),
            revision: next_revision(),
        }
    }

    fn touch(&mut self) {
        self.revision = next_revision();
    }

    /// Changes whenever the mesh is mutated.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_cells(&self) -> usize {
        self.cell_types.len()
    }

    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    pub fn point(&self, i: usize) -> [f64; 3] {
        self.points[i]
    }

    pub fn add_point(&mut self, p: [f64; 3]) -> usize {
        self.touch();
        self.points.push(p);
        self.points.len() - 1
    }

    /// Append a cell over existing points.
    pub fn add_cell(&mut self, kind: CellType, pts: &[usize]) -> Result<usize, MeshError> {
        if !kind.accepts(pts.len()) {
            return Err(MeshError::UnsupportedTopology(format!(
                "{kind:?} with {} vertices",
                pts.len()
            )));
        }
        if let Some(&bad) = pts.iter().find(|&&p| p >= self.points.len()) {
            return Err(MeshError::Configuration(format!(
                "cell references point {bad} of {}",
                self.points.len()
            )));
        }
        self.touch();
        self.cell_types.push(kind);
        self.connectivity.extend_from_slice(pts);
        self.offsets.push(self.connectivity.len());
        Ok(self.cell_types.len() - 1)
    }

    pub fn cell_type(&self, c: usize) -> CellType {
        self.cell_types[c]
    }

    pub fn cell_points(&self, c: usize) -> &[usize] {
        &self.connectivity[self.offsets[c]..self.offsets[c + 1]]
    }

    pub fn cell_vertices(&self, c: usize) -> Vec<[f64; 3]> {
        self.cell_points(c).iter().map(|&p| self.points[p]).collect()
    }

    pub fn cell_centroid(&self, c: usize) -> [f64; 3] {
        metrics::centroid(&self.cell_vertices(c))
    }

    pub fn cell_bounds(&self, c: usize) -> Bounds {
        metrics::cell_bounds(&self.cell_vertices(c))
    }

    pub fn cell_volume(&self, c: usize) -> Result<f64, MeshError> {
        metrics::cell_volume(self.cell_type(c), &self.cell_vertices(c))
    }

    /// Centroid of every cell.
    #[cfg(feature = "rayon")]
    pub fn centroids(&self) -> Vec<[f64; 3]> {
        use rayon::prelude::*;
        (0..self.num_cells())
            .into_par_iter()
            .map(|c| self.cell_centroid(c))
            .collect()
    }

    /// Centroid of every cell.
    #[cfg(not(feature = "rayon"))]
    pub fn centroids(&self) -> Vec<[f64; 3]> {
        (0..self.num_cells()).map(|c| self.cell_centroid(c)).collect()
    }

    /// Bounds of all points (empty box for an empty mesh).
    pub fn bounds(&self) -> Bounds {
        Bounds::from_points(&self.points)
    }

    /// Whether each point is referenced by at least one cell.
    pub fn used_points(&self) -> Vec<bool> {
        let mut used = vec![false; self.points.len()];
        for &p in &self.connectivity {
            used[p] = true;
        }
        used
    }

    /// Point → cells adjacency.
    pub fn point_cells(&self) -> PointCellLinks {
        PointCellLinks::build(self)
    }

    // ----- attributes -----

    pub fn point_data(&self) -> &Attributes {
        &self.point_data
    }

    pub fn cell_data(&self) -> &Attributes {
        &self.cell_data
    }

    pub fn point_array(&self, name: &str) -> Option<&DataArray> {
        self.point_data.get(name)
    }

    pub fn cell_array(&self, name: &str) -> Option<&DataArray> {
        self.cell_data.get(name)
    }

    /// Attach a point array; it must have one tuple per point.
    pub fn set_point_array(&mut self, name: &str, arr: DataArray) -> Result<(), MeshError> {
        if arr.len() != self.num_points() {
            return Err(MeshError::Configuration(format!(
                "point array `{name}` has {} tuples for {} points",
                arr.len(),
                self.num_points()
            )));
        }
        self.touch();
        self.point_data.insert(name.to_owned(), arr);
        Ok(())
    }

    /// Attach a cell array; it must have one tuple per cell.
    pub fn set_cell_array(&mut self, name: &str, arr: DataArray) -> Result<(), MeshError> {
        if arr.len() != self.num_cells() {
            return Err(MeshError::Configuration(format!(
                "cell array `{name}` has {} tuples for {} cells",
                arr.len(),
                self.num_cells()
            )));
        }
        self.touch();
        self.cell_data.insert(name.to_owned(), arr);
        Ok(())
    }

    pub fn remove_point_array(&mut self, name: &str) -> Option<DataArray> {
        self.touch();
        self.point_data.remove(name)
    }

    pub fn remove_cell_array(&mut self, name: &str) -> Option<DataArray> {
        self.touch();
        self.cell_data.remove(name)
    }

    /// Single-component integer point ids, if `name` is present.
    pub fn point_ids(&self, name: &str) -> Result<Option<&[i64]>, MeshError> {
        id_slice(self.point_data.get(name), name)
    }

    /// Single-component integer cell ids, if `name` is present.
    pub fn cell_ids(&self, name: &str) -> Result<Option<&[i64]>, MeshError> {
        id_slice(self.cell_data.get(name), name)
    }

    pub fn point_ghost_levels(&self) -> Option<&[u8]> {
        self.point_data.get(GHOST_LEVEL).and_then(DataArray::as_u8)
    }

    pub fn cell_ghost_levels(&self) -> Option<&[u8]> {
        self.cell_data.get(GHOST_LEVEL).and_then(DataArray::as_u8)
    }

    /// Set every point and cell ghost level to `level`.
    pub fn set_uniform_ghost_level(&mut self, level: u8) -> Result<(), MeshError> {
        self.set_point_array(GHOST_LEVEL, DataArray::scalar_u8(vec![level; self.num_points()]))?;
        self.set_cell_array(GHOST_LEVEL, DataArray::scalar_u8(vec![level; self.num_cells()]))
    }

    // ----- subsets -----

    /// New mesh with the cells `ids` (in that order), their points compacted
    /// in first-use order, and all attributes carried along.
    pub fn extract_cells(&self, ids: &[usize]) -> Result<UnstructuredMesh, MeshError> {
        let mut out = UnstructuredMesh::new();
        let mut remap = vec![usize::MAX; self.points.len()];
        let mut kept_points = Vec::new();
        let mut local = Vec::new();
        for &c in ids {
            if c >= self.num_cells() {
                return Err(MeshError::Configuration(format!(
                    "cell {c} out of range ({} cells)",
                    self.num_cells()
                )));
            }
            local.clear();
            for &p in self.cell_points(c) {
                if remap[p] == usize::MAX {
                    remap[p] = out.points.len();
                    out.points.push(self.points[p]);
                    kept_points.push(p);
                }
                local.push(remap[p]);
            }
            out.cell_types.push(self.cell_types[c]);
            out.connectivity.extend_from_slice(&local);
            out.offsets.push(out.connectivity.len());
        }
        for (name, arr) in &self.point_data {
            out.point_data.insert(name.clone(), arr.select(&kept_points)?);
        }
        for (name, arr) in &self.cell_data {
            out.cell_data.insert(name.clone(), arr.select(ids)?);
        }
        Ok(out)
    }

    /// Append cell `c` of `src`, mapping its points through `point_map`
    /// (indices into this mesh). Cell attributes follow.
    pub(crate) fn push_cell_from(
        &mut self,
        src: &UnstructuredMesh,
        c: usize,
        point_map: &[usize],
    ) -> Result<usize, MeshError> {
        let n = self.num_cells();
        append_tuple(&mut self.cell_data, n, &src.cell_data, c)?;
        self.cell_types.push(src.cell_types[c]);
        self.connectivity
            .extend(src.cell_points(c).iter().map(|&p| point_map[p]));
        self.offsets.push(self.connectivity.len());
        self.touch();
        Ok(n)
    }

    /// Append point `p` of `src` with its attributes.
    pub(crate) fn push_point_from(
        &mut self,
        src: &UnstructuredMesh,
        p: usize,
    ) -> Result<usize, MeshError> {
        let n = self.num_points();
        append_tuple(&mut self.point_data, n, &src.point_data, p)?;
        self.points.push(src.points[p]);
        self.touch();
        Ok(n)
    }

    pub(crate) fn point_data_mut(&mut self) -> &mut Attributes {
        self.touch();
        &mut self.point_data
    }

    pub(crate) fn cell_data_mut(&mut self) -> &mut Attributes {
        self.touch();
        &mut self.cell_data
    }

    /// Check connectivity and attribute lengths.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.offsets.len() != self.cell_types.len() + 1 {
            return Err(MeshError::Configuration("cell offsets out of sync".into()));
        }
        if let Some(&bad) = self.connectivity.iter().find(|&&p| p >= self.points.len()) {
            return Err(MeshError::Configuration(format!("dangling point index {bad}")));
        }
        for (name, arr) in &self.point_data {
            if arr.len() != self.num_points() {
                return Err(MeshError::MissingAttribute(name.clone()));
            }
        }
        for (name, arr) in &self.cell_data {
            if arr.len() != self.num_cells() {
                return Err(MeshError::MissingAttribute(name.clone()));
            }
        }
        Ok(())
    }

    // ----- wire -----

    /// Serialize with a versioned header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        let mut out = cast_slice(&[WireHdr::new(WIRE_KIND_MESH)]).to_vec();
        bincode::serialize_into(&mut out, self)?;
        Ok(out)
    }

    /// Inverse of [`to_bytes`](Self::to_bytes); `peer` names the sender in errors.
    pub fn from_bytes(bytes: &[u8], peer: usize) -> Result<Self, MeshError> {
        let hdr_len = std::mem::size_of::<WireHdr>();
        if bytes.len() < hdr_len {
            return Err(MeshError::BufferSizeMismatch {
                neighbor: peer,
                expected: hdr_len,
                got: bytes.len(),
            });
        }
        let hdr: WireHdr = decode_one(&bytes[..hdr_len], peer)?;
        if hdr.kind() != WIRE_KIND_MESH || hdr.version() != crate::algs::wire::WIRE_VERSION {
            return Err(MeshError::Serialization(format!(
                "rank {peer} sent kind {} version {}, expected mesh v{}",
                hdr.kind(),
                hdr.version(),
                crate::algs::wire::WIRE_VERSION
            )));
        }
        let mesh: UnstructuredMesh = bincode::deserialize(&bytes[hdr_len..])?;
        mesh.validate()?;
        Ok(mesh)
    }
}

fn id_slice<'a>(arr: Option<&'a DataArray>, name: &str) -> Result<Option<&'a [i64]>, MeshError> {
    match arr {
        None => Ok(None),
        Some(DataArray::I64 {
            components: 1,
            values,
        }) => Ok(Some(values.as_slice())),
        Some(other) => Err(MeshError::SchemaMismatch {
            field: name.to_owned(),
            reason: format!(
                "ids must be a 1-component integer array, found {} x{}",
                other.type_name(),
                other.components()
            ),
        }),
    }
}

/// Point → cell adjacency in CSR form.
#[derive(Clone, Debug)]
pub struct PointCellLinks {
    offsets: Vec<usize>,
    cells: Vec<usize>,
}

impl PointCellLinks {
    pub fn build(mesh: &UnstructuredMesh) -> Self {
        let mut counts = vec![0usize; mesh.num_points() + 1];
        for &p in &mesh.connectivity {
            counts[p + 1] += 1;
        }
        for i in 1..counts.len() {
            counts[i] += counts[i - 1];
        }
        let mut fill = counts.clone();
        let mut cells = vec![0; mesh.connectivity.len()];
        for c in 0..mesh.num_cells() {
            for &p in mesh.cell_points(c) {
                cells[fill[p]] = c;
                fill[p] += 1;
            }
        }
        Self {
            offsets: counts,
            cells,
        }
    }

    /// Cells using point `p`, ascending. A cell listing `p` twice appears twice.
    pub fn cells_of(&self, p: usize) -> &[usize] {
        &self.cells[self.offsets[p]..self.offsets[p + 1]]
    }
}
