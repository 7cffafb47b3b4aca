//! One redistribution pass: rebalance, partition, exchange, ghost, clip.
//!
//! [`Redistributor::run`] is collective. Every worker calls it with its
//! share of the mesh and gets back the cells of the regions it owns, plus
//! ghost layers when asked for. A failure on any worker is an `Err` on
//! every worker; steps that can only degrade the result are reported in
//! [`RedistributeOutput::warnings`].

pub mod clip;
pub mod config;
pub mod exchange;
pub mod ghost;
pub mod global_ids;
pub mod rebalance;

pub use clip::{clip_to_region, worker_box};
pub use config::{BoundaryPolicy, RedistributeConfig};
pub use exchange::{MergeRule, PendingTransfer, RegionCellLists, exchange, plan_transfers};
pub use ghost::{GhostOptions, PointRequest, add_ghost_cells};
pub use global_ids::{
    PointIdState, assign_global_cell_ids, assign_global_point_ids, resolve_point_ids,
};
pub use rebalance::{MIN_SHARE_FRACTION, RebalancePlan, plan_rebalance, rebalance};

use std::sync::Arc;

use crate::algs::communicator::{CommTag, Communicator};
use crate::data::attributes::{GHOST_LEVEL, GLOBAL_CELL_ID, GLOBAL_POINT_ID, INSIDE_REGION};
use crate::data::merge::{PointMatch, merge_meshes};
use crate::data::mesh::UnstructuredMesh;
use crate::geometry::clip::{BoxClipper, CellClipper};
use crate::mesh_error::MeshError;
use crate::partitioning::{
    ArrayRanges, GeometryFingerprint, PartitionTree, PartitionTreeBuilder, RegionCellCounts,
    RegionOwnership, assign,
};

/// Result of one pass on one worker.
#[derive(Clone, Debug)]
pub struct RedistributeOutput {
    pub mesh: UnstructuredMesh,
    /// `None` when a single worker ran without retaining a tree.
    pub tree: Option<Arc<PartitionTree>>,
    pub ownership: Option<RegionOwnership>,
    /// Value ranges of the input's attribute arrays over all workers.
    pub array_ranges: ArrayRanges,
    /// Non-fatal problems, such as degenerate geometry or a skipped clip.
    pub warnings: Vec<MeshError>,
}

/// Runs redistribution passes and keeps the partition tree between them.
pub struct Redistributor {
    config: RedistributeConfig,
    builder: PartitionTreeBuilder,
    clipper: Box<dyn CellClipper>,
}

impl std::fmt::Debug for Redistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redistributor")
            .field("config", &self.config)
            .field("cached_tree", &self.builder.cached().is_some())
            .finish()
    }
}

impl Default for Redistributor {
    fn default() -> Self {
        Self::new(RedistributeConfig::default())
    }
}

impl Redistributor {
    pub fn new(config: RedistributeConfig) -> Self {
        Self {
            builder: PartitionTreeBuilder::new(config.partition.clone()),
            config,
            clipper: Box::new(BoxClipper::default()),
        }
    }

    /// Clip boundary cells with `clipper` instead of [`BoxClipper`].
    pub fn with_clipper(mut self, clipper: impl CellClipper + 'static) -> Self {
        self.clipper = Box::new(clipper);
        self
    }

    pub fn config(&self) -> &RedistributeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RedistributeConfig) {
        self.config = config;
    }

    /// The tree kept from the last pass, if any.
    pub fn partition_tree(&self) -> Option<&Arc<PartitionTree>> {
        self.builder.cached()
    }

    /// Cells of `mesh` per (worker, region) of the kept tree. Collective.
    pub fn region_cell_counts<C: Communicator>(
        &self,
        comm: &C,
        mesh: &UnstructuredMesh,
    ) -> Result<RegionCellCounts, MeshError> {
        let tree = self.builder.cached().ok_or_else(|| {
            MeshError::Configuration("no partition tree has been built yet".into())
        })?;
        let local = RegionCellCounts::local_counts(tree, &mesh.centroids());
        RegionCellCounts::gather(comm, &local)
    }

    /// Redistribute `input` across the workers of `comm`. Collective.
    pub fn run<C: Communicator>(
        &mut self,
        comm: &C,
        input: &UnstructuredMesh,
    ) -> Result<RedistributeOutput, MeshError> {
        self.config.validate()?;
        let nprocs = comm.size();
        if nprocs == 1 {
            return self.single_worker(comm, input);
        }
        let me = comm.rank();
        let world = comm.world_group(CommTag::VOTE);
        let cfg = self.config.clone();
        let duplicate = cfg.boundary_policy.duplicates_cells();
        let point_field = cfg.global_point_id_field.clone();
        let cell_field = cfg
            .global_cell_id_field
            .clone()
            .unwrap_or_else(|| GLOBAL_CELL_ID.to_owned());
        let mut warnings = Vec::new();

        world.vote_result(check_id_fields(input, &cfg), "checking id fields")?;

        let mut mesh = input.clone();
        strip_generated(&mut mesh);
        let local_ranges = ArrayRanges::local(&mesh);

        let rebalance_rule = MergeRule {
            points: point_match(point_field.as_deref(), 0.0),
            cell_ids: None,
        };
        let rebalanced =
            match rebalance::rebalance(comm, &mesh, &rebalance_rule, cfg.transfer_strategy)? {
                Some(m) => {
                    mesh = m;
                    true
                }
                None => false,
            };

        if cfg.needs_global_ids() && cfg.global_cell_id_field.is_none() {
            global_ids::assign_global_cell_ids(comm, &mut mesh, GLOBAL_CELL_ID)?;
        }

        // the tree only depends on geometry, which the id arrays leave alone
        let geometry = if rebalanced { &mesh } else { input };
        self.builder.set_config(cfg.partition_for(nprocs));
        if !cfg.retain_partition_tree {
            self.builder.clear_cache();
        }
        let fp = GeometryFingerprint::of(geometry, self.builder.config(), nprocs);
        if world.all_vote(!self.builder.is_current(&fp))? {
            self.builder.clear_cache();
        }
        let tree = self.builder.build_cached(comm, geometry)?;
        if let Some(w) = self.builder.warning() {
            log::warn!("rank {me}: {w}");
            warnings.push(w.clone());
        }
        let ownership = assign(&tree, &cfg.assignment, nprocs)?;
        let array_ranges = ArrayRanges::gather(comm, &local_ranges)?;

        let transfers = plan_transfers(me, &mesh, &mesh.centroids(), &tree, &ownership, duplicate);
        let rule = MergeRule {
            points: point_match(point_field.as_deref(), tree.fudge()),
            cell_ids: duplicate.then(|| cell_field.clone()),
        };
        let mut mesh = exchange::exchange(
            comm,
            &mesh,
            transfers,
            &rule,
            cfg.transfer_strategy,
            CommTag::EXCHANGE,
        )?;

        if cfg.ghost_level > 0 {
            let point_ids = match &point_field {
                Some(name) => name.clone(),
                None => {
                    global_ids::assign_global_point_ids(
                        comm,
                        &mut mesh,
                        &tree,
                        &ownership,
                        GLOBAL_POINT_ID,
                        duplicate,
                        cfg.transfer_strategy,
                    )?;
                    GLOBAL_POINT_ID.to_owned()
                }
            };
            let opts = GhostOptions {
                levels: cfg.ghost_level,
                point_ids: &point_ids,
                cell_ids: &cell_field,
                duplicate_cells: duplicate,
                strategy: cfg.transfer_strategy,
            };
            mesh = ghost::add_ghost_cells(comm, mesh, &tree, &ownership, &opts)?;
        }

        if cfg.boundary_policy == BoundaryPolicy::SplitBoundaryCells {
            let clipped = self.clip(me, &mesh, &tree, &ownership, &mut warnings);
            if let Some(m) = world.vote_result(clipped, "clipping")? {
                mesh = m;
            }
            if point_field.is_none() {
                mesh.remove_point_array(GLOBAL_POINT_ID);
            }
        }

        if !cfg.retain_partition_tree {
            self.builder.clear_cache();
        }
        log::debug!(
            "rank {me}: holds {} cells in {} regions",
            mesh.num_cells(),
            ownership.regions_owned_by(me).len()
        );
        Ok(RedistributeOutput {
            mesh,
            tree: Some(tree),
            ownership: Some(ownership),
            array_ranges,
            warnings,
        })
    }

    /// Clip to this worker's box; `None` keeps the mesh as it is.
    fn clip(
        &self,
        me: usize,
        mesh: &UnstructuredMesh,
        tree: &PartitionTree,
        ownership: &RegionOwnership,
        warnings: &mut Vec<MeshError>,
    ) -> Result<Option<UnstructuredMesh>, MeshError> {
        let region = match worker_box(tree, ownership, me) {
            Ok(Some(b)) => b,
            Ok(None) => return Ok(None),
            Err(e) if e.is_warning() => {
                log::warn!("rank {me}: clip skipped: {e}");
                warnings.push(e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match clip_to_region(
            mesh,
            &region,
            self.clipper.as_ref(),
            self.config.ghost_level,
            tree.fudge(),
        ) {
            Ok(m) => Ok(Some(m)),
            Err(e) if e.is_warning() => {
                log::warn!("rank {me}: clip skipped: {e}");
                warnings.push(e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// One worker: merge duplicate points, nothing moves.
    ///
    /// A retained tree is still built so it can be queried; its fudge is
    /// then the merge tolerance, otherwise points must coincide exactly.
    fn single_worker<C: Communicator>(
        &mut self,
        comm: &C,
        input: &UnstructuredMesh,
    ) -> Result<RedistributeOutput, MeshError> {
        check_id_fields(input, &self.config)?;
        let mut mesh = input.clone();
        strip_generated(&mut mesh);
        let array_ranges = ArrayRanges::local(&mesh);
        let mut warnings = Vec::new();

        let (tree, ownership) = if self.config.retain_partition_tree && mesh.num_cells() > 0 {
            self.builder.set_config(self.config.partition_for(1));
            let tree = self.builder.build_cached(comm, input)?;
            if let Some(w) = self.builder.warning() {
                log::warn!("single worker: {w}");
                warnings.push(w.clone());
            }
            let ownership = assign(&tree, &self.config.assignment, 1)?;
            (Some(tree), Some(ownership))
        } else {
            self.builder.clear_cache();
            (None, None)
        };

        let tolerance = tree.as_ref().map_or(0.0, |t| t.fudge());
        let points = point_match(self.config.global_point_id_field.as_deref(), tolerance);
        let mut mesh = merge_meshes([&mesh], points, None)?;
        if self.config.ghost_level > 0 {
            mesh.set_uniform_ghost_level(0)?;
        }
        log::debug!("single worker: {} cells kept in place", mesh.num_cells());
        Ok(RedistributeOutput {
            mesh,
            tree,
            ownership,
            array_ranges,
            warnings,
        })
    }
}

fn point_match(field: Option<&str>, tolerance: f64) -> PointMatch {
    match field {
        Some(name) => PointMatch::GlobalId(name.to_owned()),
        None => PointMatch::Tolerance(tolerance),
    }
}

/// Drop arrays a previous pass generated.
fn strip_generated(mesh: &mut UnstructuredMesh) {
    if mesh.point_array(GHOST_LEVEL).is_some() {
        mesh.remove_point_array(GHOST_LEVEL);
    }
    if mesh.cell_array(GHOST_LEVEL).is_some() {
        mesh.remove_cell_array(GHOST_LEVEL);
    }
    if mesh.cell_array(INSIDE_REGION).is_some() {
        mesh.remove_cell_array(INSIDE_REGION);
    }
}

/// Caller-named id fields must be present and integral.
fn check_id_fields(mesh: &UnstructuredMesh, cfg: &RedistributeConfig) -> Result<(), MeshError> {
    if let Some(name) = &cfg.global_point_id_field {
        if mesh.point_ids(name)?.is_none() && mesh.num_points() > 0 {
            return Err(MeshError::MissingAttribute(name.clone()));
        }
    }
    if let Some(name) = &cfg.global_cell_id_field {
        if mesh.cell_ids(name)?.is_none() && mesh.num_cells() > 0 {
            return Err(MeshError::MissingAttribute(name.clone()));
        }
    }
    Ok(())
}
