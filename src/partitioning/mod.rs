//! Spatial partitioning: the distributed k-d tree, its selector and the
//! mapping of leaf regions to workers.

pub mod assignment;
pub mod build;
pub mod ranges;
pub mod region;
pub mod select;

pub use assignment::{AssignmentPolicy, RegionCellCounts, RegionOwnership, assign};
pub use build::{GeometryFingerprint, PartitionTreeBuilder};
pub use ranges::ArrayRanges;
pub use region::{ALL_AXES, FragmentNode, PartitionTree, Region, Split, X_AXIS, Y_AXIS, Z_AXIS};
pub use select::{Pivot, SelectionBuffers};

use serde::{Deserialize, Serialize};

use crate::mesh_error::MeshError;

/// Parameters of the partition tree build.
///
/// `regions_or_less` and `regions_or_more` are off when 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// A region with fewer than twice this many centroids is not divided.
    pub min_cells_per_region: usize,
    /// Hard cap on tree depth.
    pub max_level: usize,
    /// Stop dividing before the leaf count would exceed this.
    pub regions_or_less: usize,
    /// Stop dividing once the level holds at least this many regions.
    pub regions_or_more: usize,
    /// Axes a split may use, as an [`X_AXIS`] | [`Y_AXIS`] | [`Z_AXIS`] mask.
    pub valid_split_dimensions: u8,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            min_cells_per_region: 100,
            max_level: 20,
            regions_or_less: 0,
            regions_or_more: 0,
            valid_split_dimensions: ALL_AXES,
        }
    }
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.valid_split_dimensions & ALL_AXES == 0 {
            return Err(MeshError::Configuration(
                "at least one split dimension must be enabled".into(),
            ));
        }
        if self.valid_split_dimensions & !ALL_AXES != 0 {
            return Err(MeshError::Configuration(format!(
                "split dimension mask {:#05b} has bits beyond z",
                self.valid_split_dimensions
            )));
        }
        if self.max_level > 40 {
            return Err(MeshError::Configuration(format!(
                "max_level {} is deeper than a region count can address",
                self.max_level
            )));
        }
        Ok(())
    }

    /// Whether a region at `level` holding `n` centroids stays a leaf.
    pub fn is_leaf(&self, level: usize, n: usize) -> bool {
        let at_level = 1usize << level.min(63);
        level >= self.max_level
            || n < 2 * self.min_cells_per_region
            || n < 2
            || (self.regions_or_less != 0 && 2 * at_level > self.regions_or_less)
            || (self.regions_or_more != 0 && at_level >= self.regions_or_more)
    }

    /// Enabled axes in x, y, z order.
    pub fn axes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..3).filter(|d| self.valid_split_dimensions & (1 << d) != 0)
    }
}
