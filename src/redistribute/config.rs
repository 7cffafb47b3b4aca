//! Options of one redistribution pass.

use serde::{Deserialize, Serialize};

use crate::algs::exchange::TransferStrategy;
use crate::mesh_error::MeshError;
use crate::partitioning::{AssignmentPolicy, PartitionConfig};

/// What happens to cells whose bounds cross region boundaries.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryPolicy {
    /// Every cell goes to the single region holding its centroid.
    #[default]
    AssignToOneRegion,
    /// Every region a cell's bounds intersect gets a copy.
    AssignToAllIntersectingRegions,
    /// As above, then cells are clipped to the worker's region box.
    SplitBoundaryCells,
}

impl BoundaryPolicy {
    /// Whether boundary cells are duplicated across workers.
    pub fn duplicates_cells(self) -> bool {
        !matches!(self, BoundaryPolicy::AssignToOneRegion)
    }
}

/// Configuration of [`Redistributor`](crate::redistribute::Redistributor).
///
/// Unset `regions_or_more` and a default `min_cells_per_region` in
/// `partition` are replaced per pass with the worker count and 2.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedistributeConfig {
    pub partition: PartitionConfig,
    pub assignment: AssignmentPolicy,
    pub boundary_policy: BoundaryPolicy,
    /// Halo layers to add; 0 for none.
    pub ghost_level: u8,
    /// Keep the tree between passes and reuse it while the geometry is unchanged.
    pub retain_partition_tree: bool,
    /// Caller-supplied global point ids; used for merging instead of geometry.
    pub global_point_id_field: Option<String>,
    /// Caller-supplied global cell ids.
    pub global_cell_id_field: Option<String>,
    pub transfer_strategy: TransferStrategy,
}

impl Default for RedistributeConfig {
    fn default() -> Self {
        Self {
            partition: PartitionConfig::default(),
            assignment: AssignmentPolicy::default(),
            boundary_policy: BoundaryPolicy::default(),
            ghost_level: 0,
            retain_partition_tree: true,
            global_point_id_field: None,
            global_cell_id_field: None,
            transfer_strategy: TransferStrategy::default(),
        }
    }
}

impl RedistributeConfig {
    /// Local checks only; runs before any collective call.
    pub fn validate(&self) -> Result<(), MeshError> {
        self.partition.validate()?;
        for (what, name) in [
            ("point", &self.global_point_id_field),
            ("cell", &self.global_cell_id_field),
        ] {
            if name.as_deref().is_some_and(str::is_empty) {
                return Err(MeshError::Configuration(format!(
                    "global {what} id field name is empty"
                )));
            }
        }
        if let AssignmentPolicy::UserDefined(map) = &self.assignment {
            if map.is_empty() {
                return Err(MeshError::Configuration("user region assignment is empty".into()));
            }
        }
        Ok(())
    }

    /// Tree parameters for a pass over `nprocs` workers.
    pub fn partition_for(&self, nprocs: usize) -> PartitionConfig {
        let defaults = PartitionConfig::default();
        let mut cfg = self.partition.clone();
        if cfg.regions_or_more == 0 && cfg.regions_or_less == 0 {
            cfg.regions_or_more = nprocs;
        }
        if cfg.min_cells_per_region == defaults.min_cells_per_region {
            cfg.min_cells_per_region = 2;
        }
        cfg
    }

    /// Whether global ids must be made up for this pass.
    pub fn needs_global_ids(&self) -> bool {
        self.ghost_level > 0 || self.boundary_policy.duplicates_cells()
    }
}
