//! Mapping of leaf regions to owning workers.

use serde::{Deserialize, Serialize};

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::WireCount;
use crate::mesh_error::MeshError;
use crate::partitioning::region::PartitionTree;

/// How regions are handed to workers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentPolicy {
    /// Spatially contiguous blocks of whole subtrees.
    #[default]
    Contiguous,
    /// Region `i` goes to worker `i % P`.
    RoundRobin,
    /// `map[i]` owns region `i`.
    UserDefined(Vec<usize>),
}

/// Region → worker map and its inverse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOwnership {
    owner: Vec<usize>,
    owned: Vec<Vec<usize>>,
}

impl RegionOwnership {
    /// Build from a complete region → worker map.
    pub fn from_owners(owner: Vec<usize>, nprocs: usize) -> Result<Self, MeshError> {
        let mut owned = vec![Vec::new(); nprocs];
        for (region, &w) in owner.iter().enumerate() {
            let Some(list) = owned.get_mut(w) else {
                return Err(MeshError::Configuration(format!(
                    "region {region} assigned to worker {w}, but there are {nprocs} workers"
                )));
            };
            list.push(region);
        }
        Ok(Self { owner, owned })
    }

    pub fn owner_of(&self, region: usize) -> Option<usize> {
        self.owner.get(region).copied()
    }

    /// Regions of `worker`, ascending.
    pub fn regions_owned_by(&self, worker: usize) -> &[usize] {
        self.owned.get(worker).map_or(&[], Vec::as_slice)
    }

    pub fn region_count(&self) -> usize {
        self.owner.len()
    }

    pub fn worker_count(&self) -> usize {
        self.owned.len()
    }

    pub fn owners(&self) -> &[usize] {
        &self.owner
    }

    /// Owner of the region holding `p`; points outside the tree volume go
    /// to the region they would descend into.
    pub fn point_owner(&self, tree: &PartitionTree, p: &[f64; 3]) -> Option<usize> {
        let region = tree.region_containing(p).unwrap_or_else(|| tree.locate(p));
        self.owner_of(region)
    }
}

/// Assign the regions of `tree` to `nprocs` workers.
pub fn assign(
    tree: &PartitionTree,
    policy: &AssignmentPolicy,
    nprocs: usize,
) -> Result<RegionOwnership, MeshError> {
    if nprocs == 0 {
        return Err(MeshError::Configuration("no workers to assign regions to".into()));
    }
    let regions = tree.region_count();
    let owner = match policy {
        AssignmentPolicy::RoundRobin => round_robin(regions, nprocs),
        AssignmentPolicy::Contiguous => contiguous(tree, nprocs),
        AssignmentPolicy::UserDefined(map) => {
            if map.len() != regions {
                return Err(MeshError::Configuration(format!(
                    "user assignment lists {} regions, the tree has {regions}",
                    map.len()
                )));
            }
            map.clone()
        }
    };
    RegionOwnership::from_owners(owner, nprocs)
}

fn round_robin(regions: usize, nprocs: usize) -> Vec<usize> {
    (0..regions).map(|i| i % nprocs).collect()
}

/// Whole subtrees per worker, taken from level `floor(log2 P)`.
///
/// With `P` not a power of two some level nodes are split between two
/// workers through their children, just enough of them that every worker
/// gets something.
fn contiguous(tree: &PartitionTree, nprocs: usize) -> Vec<usize> {
    let regions = tree.region_count();
    if regions <= nprocs {
        return round_robin(regions, nprocs);
    }
    let floor_log = nprocs.ilog2() as usize;
    let Some(level_nodes) = tree.nodes_at_level(floor_log) else {
        log::debug!("tree too shallow for contiguous assignment; using round robin");
        return round_robin(regions, nprocs);
    };

    let mut owner = vec![0; regions];
    let mut give = |node: usize, worker: usize| {
        let n = tree.node(node);
        for id in n.min_id..=n.max_id {
            owner[id] = worker;
        }
    };

    if nprocs.is_power_of_two() {
        for (worker, &node) in level_nodes.iter().enumerate() {
            give(node, worker);
        }
        return owner;
    }

    let mut nodes_left = nprocs.next_power_of_two();
    let mut procs_left = nprocs;
    let mut worker = 0;
    for &node in &level_nodes {
        let n = tree.node(node);
        if nodes_left > procs_left {
            give(node, worker);
            worker += 1;
            procs_left -= 1;
        } else {
            match (n.left, n.right) {
                (Some(l), Some(r)) => {
                    give(l, worker);
                    give(r, worker + 1);
                }
                _ => {
                    log::debug!("level {floor_log} node has no children; using round robin");
                    return round_robin(regions, nprocs);
                }
            }
            worker += 2;
            procs_left -= 2;
        }
        nodes_left -= 2;
    }
    owner
}

/// How many cells of each region every worker holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionCellCounts {
    /// `counts[worker][region]`.
    counts: Vec<Vec<usize>>,
}

impl RegionCellCounts {
    /// All-gather every worker's per-region counts.
    pub fn gather<C: Communicator>(comm: &C, local: &[usize]) -> Result<Self, MeshError> {
        let recs: Vec<WireCount> = local.iter().map(|&n| WireCount::new(n)).collect();
        let all = comm.world_group(CommTag::COUNTS).all_gather_records(&recs)?;
        let counts: Vec<Vec<usize>> = all
            .into_iter()
            .map(|v| v.iter().map(WireCount::get).collect())
            .collect();
        for (w, c) in counts.iter().enumerate() {
            if c.len() != local.len() {
                return Err(MeshError::BufferSizeMismatch {
                    neighbor: w,
                    expected: local.len() * size_of::<WireCount>(),
                    got: c.len() * size_of::<WireCount>(),
                });
            }
        }
        Ok(Self { counts })
    }

    /// Per-region counts of local cells by centroid.
    pub fn local_counts(tree: &PartitionTree, centroids: &[[f64; 3]]) -> Vec<usize> {
        let mut counts = vec![0; tree.region_count()];
        for c in centroids {
            counts[tree.locate(c)] += 1;
        }
        counts
    }

    pub fn cell_count(&self, worker: usize, region: usize) -> usize {
        self.counts
            .get(worker)
            .and_then(|c| c.get(region))
            .copied()
            .unwrap_or(0)
    }

    pub fn has_data(&self, worker: usize, region: usize) -> bool {
        self.cell_count(worker, region) > 0
    }

    /// Workers holding cells of `region`, ascending.
    pub fn workers_with_data(&self, region: usize) -> Vec<usize> {
        (0..self.counts.len())
            .filter(|&w| self.has_data(w, region))
            .collect()
    }

    pub fn total_cells(&self, region: usize) -> usize {
        (0..self.counts.len()).map(|w| self.cell_count(w, region)).sum()
    }
}
