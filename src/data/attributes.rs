//! Named per-point / per-cell attribute arrays.
//!
//! Arrays are stored tuple-major: tuple `i` of an array with `c` components
//! occupies `values[i * c..(i + 1) * c]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mesh_error::MeshError;

/// Ghost level of a point or cell (`u8`, 0 = owned).
pub const GHOST_LEVEL: &str = "ghost_level";
/// Default global point id field (`i64`).
pub const GLOBAL_POINT_ID: &str = "global_point_id";
/// Default global cell id field (`i64`).
pub const GLOBAL_CELL_ID: &str = "global_cell_id";
/// Clip marker: 1 for fragments inside the worker's region (`u8`).
pub const INSIDE_REGION: &str = "inside_region";

/// Attribute arrays keyed by name; ordered so serialization is deterministic.
pub type Attributes = BTreeMap<String, DataArray>;

/// A typed attribute array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DataArray {
    F64 { components: usize, values: Vec<f64> },
    I64 { components: usize, values: Vec<i64> },
    U8 { components: usize, values: Vec<u8> },
}

impl DataArray {
    pub fn scalar_f64(values: Vec<f64>) -> Self {
        DataArray::F64 {
            components: 1,
            values,
        }
    }
    pub fn scalar_i64(values: Vec<i64>) -> Self {
        DataArray::I64 {
            components: 1,
            values,
        }
    }
    pub fn scalar_u8(values: Vec<u8>) -> Self {
        DataArray::U8 {
            components: 1,
            values,
        }
    }
    pub fn vector_f64(components: usize, values: Vec<f64>) -> Self {
        DataArray::F64 { components, values }
    }

    pub fn components(&self) -> usize {
        match self {
            DataArray::F64 { components, .. }
            | DataArray::I64 { components, .. }
            | DataArray::U8 { components, .. } => *components,
        }
    }

    /// Number of tuples.
    pub fn len(&self) -> usize {
        let c = self.components().max(1);
        match self {
            DataArray::F64 { values, .. } => values.len() / c,
            DataArray::I64 { values, .. } => values.len() / c,
            DataArray::U8 { values, .. } => values.len() / c,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DataArray::F64 { .. } => "f64",
            DataArray::I64 { .. } => "i64",
            DataArray::U8 { .. } => "u8",
        }
    }

    /// Same type and component count as `other`.
    pub fn same_layout(&self, other: &DataArray) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.components() == other.components()
    }

    /// An empty array with this array's layout.
    pub fn empty_like(&self) -> DataArray {
        let components = self.components();
        match self {
            DataArray::F64 { .. } => DataArray::F64 {
                components,
                values: Vec::new(),
            },
            DataArray::I64 { .. } => DataArray::I64 {
                components,
                values: Vec::new(),
            },
            DataArray::U8 { .. } => DataArray::U8 {
                components,
                values: Vec::new(),
            },
        }
    }

    /// Append a zero tuple.
    pub fn push_default(&mut self) {
        match self {
            DataArray::F64 { components, values } => values.extend(std::iter::repeat_n(0.0, *components)),
            DataArray::I64 { components, values } => values.extend(std::iter::repeat_n(0, *components)),
            DataArray::U8 { components, values } => values.extend(std::iter::repeat_n(0, *components)),
        }
    }

    /// Append tuple `i` of `src`, which must have the same layout.
    pub fn push_tuple_from(&mut self, src: &DataArray, i: usize) -> Result<(), MeshError> {
        let c = self.components();
        let range = i * c..(i + 1) * c;
        match (self, src) {
            (DataArray::F64 { values, .. }, DataArray::F64 { values: s, components })
                if *components == c && range.end <= s.len() =>
            {
                values.extend_from_slice(&s[range]);
            }
            (DataArray::I64 { values, .. }, DataArray::I64 { values: s, components })
                if *components == c && range.end <= s.len() =>
            {
                values.extend_from_slice(&s[range]);
            }
            (DataArray::U8 { values, .. }, DataArray::U8 { values: s, components })
                if *components == c && range.end <= s.len() =>
            {
                values.extend_from_slice(&s[range]);
            }
            (dst, _) => {
                return Err(MeshError::SchemaMismatch {
                    field: String::new(),
                    reason: format!(
                        "cannot append tuple {i} of {} x{} to {} x{c}",
                        src.type_name(),
                        src.components(),
                        dst.type_name()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Append the weighted combination of tuples `(i, w)` of `src`.
    ///
    /// Float arrays are interpolated. Integer arrays take the tuple with
    /// the largest weight, the first one on ties, so ids and flags stay
    /// valid values.
    pub fn push_interpolated(&mut self, src: &DataArray, weights: &[(usize, f64)]) -> Result<(), MeshError> {
        let c = self.components();
        let blended = match src {
            DataArray::F64 { values: s, components }
                if *components == c
                    && matches!(self, DataArray::F64 { .. })
                    && weights.iter().all(|&(i, _)| (i + 1) * c <= s.len()) =>
            {
                let mut tuple = vec![0.0; c];
                for &(i, w) in weights {
                    for (acc, v) in tuple.iter_mut().zip(&s[i * c..(i + 1) * c]) {
                        *acc += w * v;
                    }
                }
                Some(tuple)
            }
            _ => None,
        };
        match (blended, self) {
            (Some(tuple), DataArray::F64 { values, .. }) => {
                values.extend(tuple);
                Ok(())
            }
            (_, this) => {
                let heaviest = weights
                    .iter()
                    .fold(None, |best: Option<(usize, f64)>, &(i, w)| match best {
                        Some((_, bw)) if bw >= w => best,
                        _ => Some((i, w)),
                    });
                match heaviest {
                    Some((i, _)) => this.push_tuple_from(src, i),
                    None => {
                        this.push_default();
                        Ok(())
                    }
                }
            }
        }
    }

    /// New array holding the tuples at `ids`, in that order.
    pub fn select(&self, ids: &[usize]) -> Result<DataArray, MeshError> {
        let mut out = self.empty_like();
        for &i in ids {
            out.push_tuple_from(self, i)?;
        }
        Ok(out)
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            DataArray::F64 { values, .. } => Some(values),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            DataArray::I64 { values, .. } => Some(values),
            _ => None,
        }
    }
    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            DataArray::U8 { values, .. } => Some(values),
            _ => None,
        }
    }
    pub fn as_u8_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            DataArray::U8 { values, .. } => Some(values),
            _ => None,
        }
    }
}

/// Append tuple `i` of every array in `src` to the matching array in `dst`.
///
/// Arrays only in `dst` get a zero tuple; arrays only in `src` are created
/// and back-filled with `dst_len` zero tuples first.
pub fn append_tuple(
    dst: &mut Attributes,
    dst_len: usize,
    src: &Attributes,
    i: usize,
) -> Result<(), MeshError> {
    for (name, arr) in src {
        if !dst.contains_key(name) {
            let mut fresh = arr.empty_like();
            for _ in 0..dst_len {
                fresh.push_default();
            }
            dst.insert(name.clone(), fresh);
        }
    }
    for (name, out) in dst.iter_mut() {
        match src.get(name) {
            Some(arr) if out.same_layout(arr) => {
                out.push_tuple_from(arr, i)
                    .map_err(|e| rename_field(e, name))?;
            }
            Some(arr) => {
                return Err(MeshError::SchemaMismatch {
                    field: name.clone(),
                    reason: format!(
                        "{} x{} merged with {} x{}",
                        out.type_name(),
                        out.components(),
                        arr.type_name(),
                        arr.components()
                    ),
                });
            }
            None => out.push_default(),
        }
    }
    Ok(())
}

fn rename_field(e: MeshError, name: &str) -> MeshError {
    match e {
        MeshError::SchemaMismatch { reason, .. } => MeshError::SchemaMismatch {
            field: name.to_owned(),
            reason,
        },
        other => other,
    }
}
