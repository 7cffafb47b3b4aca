//! Global value ranges of the attribute arrays, per component.
//!
//! Every worker summarizes its own arrays; the summaries are all-gathered
//! and folded in rank order, so all workers hold the same table. Arrays
//! missing on some workers only take values from the others.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::algs::communicator::{CommTag, Communicator};
use crate::data::attributes::{Attributes, DataArray};
use crate::data::mesh::UnstructuredMesh;
use crate::mesh_error::MeshError;

/// `[min, max]` of each component; inverted while no value has been seen.
type ComponentRanges = Vec<[f64; 2]>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayRanges {
    point: BTreeMap<String, ComponentRanges>,
    cell: BTreeMap<String, ComponentRanges>,
}

fn component_ranges(arr: &DataArray) -> ComponentRanges {
    let c = arr.components().max(1);
    let mut out = vec![[f64::INFINITY, f64::NEG_INFINITY]; c];
    let mut fold = |i: usize, v: f64| {
        let r = &mut out[i % c];
        r[0] = r[0].min(v);
        r[1] = r[1].max(v);
    };
    match arr {
        DataArray::F64 { values, .. } => values.iter().enumerate().for_each(|(i, &v)| fold(i, v)),
        DataArray::I64 { values, .. } => values.iter().enumerate().for_each(|(i, &v)| fold(i, v as f64)),
        DataArray::U8 { values, .. } => values.iter().enumerate().for_each(|(i, &v)| fold(i, f64::from(v))),
    }
    out
}

fn summarize(attrs: &Attributes) -> BTreeMap<String, ComponentRanges> {
    attrs
        .iter()
        .map(|(name, arr)| (name.clone(), component_ranges(arr)))
        .collect()
}

fn fold_into(
    into: &mut BTreeMap<String, ComponentRanges>,
    from: &BTreeMap<String, ComponentRanges>,
    worker: usize,
) -> Result<(), MeshError> {
    for (name, theirs) in from {
        let Some(mine) = into.get_mut(name) else {
            into.insert(name.clone(), theirs.clone());
            continue;
        };
        if mine.len() != theirs.len() {
            return Err(MeshError::SchemaMismatch {
                field: name.clone(),
                reason: format!(
                    "{} components here, {} on worker {worker}",
                    mine.len(),
                    theirs.len()
                ),
            });
        }
        for (m, t) in mine.iter_mut().zip(theirs) {
            m[0] = m[0].min(t[0]);
            m[1] = m[1].max(t[1]);
        }
    }
    Ok(())
}

fn lookup(table: &BTreeMap<String, ComponentRanges>, name: &str, component: usize) -> Option<(f64, f64)> {
    table
        .get(name)
        .and_then(|r| r.get(component))
        .filter(|r| r[0] <= r[1])
        .map(|r| (r[0], r[1]))
}

impl ArrayRanges {
    /// Ranges of this worker's arrays only.
    pub fn local(mesh: &UnstructuredMesh) -> Self {
        Self {
            point: summarize(mesh.point_data()),
            cell: summarize(mesh.cell_data()),
        }
    }

    /// Fold every worker's local table into the global one. Collective.
    pub fn gather<C: Communicator>(comm: &C, local: &ArrayRanges) -> Result<Self, MeshError> {
        let all = comm
            .world_group(CommTag::RANGES)
            .all_gather(&bincode::serialize(local)?)?;
        let mut out = ArrayRanges::default();
        for (w, bytes) in all.iter().enumerate() {
            let theirs: ArrayRanges = bincode::deserialize(bytes)?;
            fold_into(&mut out.point, &theirs.point, w)?;
            fold_into(&mut out.cell, &theirs.cell, w)?;
        }
        log::trace!(
            "array ranges over {} workers: {} point, {} cell arrays",
            all.len(),
            out.point.len(),
            out.cell.len()
        );
        Ok(out)
    }

    /// `(min, max)` of `component` of point array `name`; `None` if no
    /// worker holds a value of it.
    pub fn point_range(&self, name: &str, component: usize) -> Option<(f64, f64)> {
        lookup(&self.point, name, component)
    }

    pub fn cell_range(&self, name: &str, component: usize) -> Option<(f64, f64)> {
        lookup(&self.cell, name, component)
    }

    pub fn point_arrays(&self) -> impl Iterator<Item = &str> + '_ {
        self.point.keys().map(String::as_str)
    }

    pub fn cell_arrays(&self) -> impl Iterator<Item = &str> + '_ {
        self.cell.keys().map(String::as_str)
    }
}
