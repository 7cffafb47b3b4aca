//! Distributed build of the partition tree.
//!
//! Every worker contributes its cell centroids; nobody gathers them. Each
//! tree node is divided by the workers holding its index range, using
//! [`SelectionBuffers::select`] along the node's widest enabled axis. Nodes
//! are visited breadth first in the same order on every worker, and each
//! level talks on its own tag, so sibling groups sharing a boundary worker
//! never mix messages.
//!
//! Each worker records the nodes it took part in. Worker 0 merges those
//! fragments into one tree, repairs the boundaries and broadcasts it.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::sub_group::SubGroup;
use crate::data::mesh::UnstructuredMesh;
use crate::geometry::bounds::Bounds;
use crate::mesh_error::MeshError;
use crate::partitioning::PartitionConfig;
use crate::partitioning::region::{FragmentNode, PartitionTree, Split};
use crate::partitioning::select::SelectionBuffers;

/// Widening of flat axes and of lower faces, as a fraction of the largest extent.
const VOLUME_MARGIN: f64 = 1e-2;
/// Lower-face fudge as a fraction of the margin.
const FUDGE_FRACTION: f64 = 1e-3;
/// Margin used when the whole volume is a single point.
const DEGENERATE_MARGIN: f64 = 0.01;

/// What the cached tree was built from. Any change forces a rebuild.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryFingerprint {
    pub num_points: usize,
    pub num_cells: usize,
    pub bounds: Bounds,
    pub revision: u64,
    pub config: PartitionConfig,
    pub nprocs: usize,
}

impl GeometryFingerprint {
    pub fn of(mesh: &UnstructuredMesh, config: &PartitionConfig, nprocs: usize) -> Self {
        Self {
            num_points: mesh.num_points(),
            num_cells: mesh.num_cells(),
            bounds: mesh.bounds(),
            revision: mesh.revision(),
            config: config.clone(),
            nprocs,
        }
    }
}

/// A node waiting to be divided.
#[derive(Clone, Debug)]
struct PendingNode {
    key: u64,
    level: usize,
    l: usize,
    r: usize,
    bounds: Bounds,
    data_bounds: Bounds,
}

impl PendingNode {
    fn leaf(&self) -> FragmentNode {
        FragmentNode {
            key: self.key,
            level: self.level,
            bounds: self.bounds,
            data_bounds: self.data_bounds,
            point_count: self.r + 1 - self.l,
            split: None,
        }
    }
}

/// Builds partition trees and keeps the last one for reuse.
#[derive(Debug, Default)]
pub struct PartitionTreeBuilder {
    config: PartitionConfig,
    cache: Option<(GeometryFingerprint, Arc<PartitionTree>)>,
    warning: Option<MeshError>,
}

impl PartitionTreeBuilder {
    pub fn new(config: PartitionConfig) -> Self {
        Self {
            config,
            cache: None,
            warning: None,
        }
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Replace the parameters; drops the cached tree if they differ.
    pub fn set_config(&mut self, config: PartitionConfig) {
        if config != self.config {
            self.cache = None;
            self.config = config;
        }
    }

    pub fn cached(&self) -> Option<&Arc<PartitionTree>> {
        self.cache.as_ref().map(|(_, t)| t)
    }

    pub fn clear_cache(&mut self) {
        self.cache = None;
    }

    /// Whether the cached tree was built from exactly this geometry.
    pub fn is_current(&self, fp: &GeometryFingerprint) -> bool {
        matches!(&self.cache, Some((f, _)) if f == fp)
    }

    /// Degenerate-geometry warning from the last build, if any.
    pub fn warning(&self) -> Option<&MeshError> {
        self.warning.as_ref()
    }

    /// The cached tree if `mesh` is unchanged since it was built, without
    /// any communication; otherwise a collective rebuild.
    ///
    /// Workers must agree on whether to rebuild; see
    /// [`Redistributor`](crate::redistribute::Redistributor) for the vote.
    pub fn build_cached<C: Communicator>(
        &mut self,
        comm: &C,
        mesh: &UnstructuredMesh,
    ) -> Result<Arc<PartitionTree>, MeshError> {
        let fp = GeometryFingerprint::of(mesh, &self.config, comm.size());
        if let Some((f, tree)) = &self.cache {
            if *f == fp {
                log::debug!("rank {}: reusing partition tree", comm.rank());
                return Ok(Arc::clone(tree));
            }
        }
        let tree = self.build(comm, &mesh.centroids(), mesh.bounds())?;
        let fp = GeometryFingerprint::of(mesh, &self.config, comm.size());
        self.cache = Some((fp, Arc::clone(&tree)));
        Ok(tree)
    }

    /// Build a tree over every worker's `centroids`. `local_bounds` covers
    /// this worker's share of the volume (usually its mesh points).
    pub fn build<C: Communicator>(
        &mut self,
        comm: &C,
        centroids: &[[f64; 3]],
        local_bounds: Bounds,
    ) -> Result<Arc<PartitionTree>, MeshError> {
        self.config.validate()?;
        self.warning = None;
        let nprocs = comm.size();

        self.sync_parameters(&comm.world_group(CommTag::PARAMS))?;
        let (volume, fudge, degenerate) =
            volume_bounds(&comm.world_group(CommTag::BOUNDS), local_bounds.union(&Bounds::from_points(centroids)))?;

        let mut sel = SelectionBuffers::new(&comm.world_group(CommTag::COUNTS), centroids)?;
        let total = sel.total();
        if total < nprocs {
            log::error!("{total} cells cannot be shared by {nprocs} workers");
            return Err(MeshError::InsufficientData {
                total,
                workers: nprocs,
            });
        }
        let root_data = reduce_bounds(
            &comm.world_group(CommTag::BOUNDS),
            &[Bounds::from_points(centroids)],
        )?[0];

        let root = PendingNode {
            key: 1,
            level: 0,
            l: 0,
            r: total - 1,
            bounds: volume,
            data_bounds: root_data,
        };
        let fragment = if degenerate {
            self.warning = Some(MeshError::DegenerateGeometry(format!(
                "all {total} centroids coincide; the tree has a single region"
            )));
            if comm.rank() == 0 { vec![root.leaf()] } else { Vec::new() }
        } else {
            self.grow(comm, &mut sel, root)?
        };
        drop(sel);

        let mut tree = self.assemble(comm, volume, &fragment)?;
        tree.set_fudge(fudge);
        log::debug!(
            "rank {}: partition tree with {} regions, depth {}",
            comm.rank(),
            tree.region_count(),
            tree.depth()
        );
        Ok(Arc::new(tree))
    }

    /// Adopt worker 0's parameters where they differ from ours.
    fn sync_parameters<C: Communicator>(&mut self, world: &SubGroup<'_, C>) -> Result<(), MeshError> {
        let mine = bincode::serialize(&self.config)?;
        let root = world.broadcast(0, &mine)?;
        if root != mine {
            let theirs: PartitionConfig = bincode::deserialize(&root)?;
            log::warn!(
                "rank {}: partition parameters differ from rank 0 ({:?} vs {:?}); using rank 0's",
                world.rank(),
                self.config,
                theirs
            );
            self.config = theirs;
        }
        Ok(())
    }

    /// Divide nodes breadth first; returns the nodes this worker visited.
    fn grow<C: Communicator>(
        &self,
        comm: &C,
        sel: &mut SelectionBuffers,
        root: PendingNode,
    ) -> Result<Vec<FragmentNode>, MeshError> {
        let me = comm.rank();
        let mut queue = VecDeque::from([root]);
        let mut fragment = Vec::new();

        while let Some(node) = queue.pop_front() {
            let (p1, p2) = (sel.who_has(node.l), sel.who_has(node.r));
            if me < p1 || me > p2 {
                continue;
            }
            let g = comm.sub_group(p1, p2, CommTag::SELECT.offset(node.level as u16));
            let divided = if self.config.is_leaf(node.level, node.r + 1 - node.l) {
                None
            } else {
                self.divide(&g, sel, &node)?
            };
            let Some((split, mid, left_data, right_data)) = divided else {
                fragment.push(node.leaf());
                continue;
            };

            let mut left_bounds = node.bounds;
            let mut right_bounds = node.bounds;
            left_bounds.max[split.dim] = split.coord;
            right_bounds.min[split.dim] = split.coord;
            fragment.push(FragmentNode {
                split: Some(split),
                ..node.leaf()
            });
            queue.push_back(PendingNode {
                key: 2 * node.key,
                level: node.level + 1,
                l: node.l,
                r: mid - 1,
                bounds: left_bounds,
                data_bounds: left_data,
            });
            queue.push_back(PendingNode {
                key: 2 * node.key + 1,
                level: node.level + 1,
                l: mid,
                r: node.r,
                bounds: right_bounds,
                data_bounds: right_data,
            });
        }
        Ok(fragment)
    }

    /// Split one node; `None` when its data cannot be separated.
    fn divide<C: Communicator>(
        &self,
        g: &SubGroup<'_, C>,
        sel: &mut SelectionBuffers,
        node: &PendingNode,
    ) -> Result<Option<(Split, usize, Bounds, Bounds)>, MeshError> {
        let Some(dim) = self.split_axis(&node.data_bounds) else {
            log::warn!(
                "region {} at level {} has no extent along any enabled axis",
                node.key,
                node.level
            );
            return Ok(None);
        };
        let Some(mid) = sel.select(g, dim, node.l, node.r)? else {
            log::warn!(
                "region {} at level {} cannot be split along axis {dim}",
                node.key,
                node.level
            );
            return Ok(None);
        };
        let local = [
            sel.local_bounds(node.l, mid - 1),
            sel.local_bounds(mid, node.r),
        ];
        let halves = reduce_bounds(g, &local)?;
        let (left, right) = (halves[0], halves[1]);
        let coord = 0.5 * (left.max[dim] + right.min[dim]);
        Ok(Some((Split { dim, coord }, mid, left, right)))
    }

    /// Largest data extent among enabled axes; x, then y, then z on ties.
    fn split_axis(&self, data: &Bounds) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for d in self.config.axes() {
            let ext = data.extent(d);
            if best.is_none_or(|(_, e)| ext > e) {
                best = Some((d, ext));
            }
        }
        best.filter(|&(_, e)| e > 0.0).map(|(d, _)| d)
    }

    /// Gather every fragment at worker 0, merge, and broadcast the tree.
    fn assemble<C: Communicator>(
        &self,
        comm: &C,
        volume: Bounds,
        fragment: &[FragmentNode],
    ) -> Result<PartitionTree, MeshError> {
        let world = comm.world_group(CommTag::TREE);
        let gathered = world.gather(0, &bincode::serialize(fragment)?)?;
        let merged = match gathered {
            Some(parts) => merge_fragments(volume, &parts),
            None => Ok(Vec::new()),
        };
        let bytes = world.vote_result(merged, "partition tree assembly")?;
        let bytes = world.with_tag(CommTag::TREE.offset(1)).broadcast(0, &bytes)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

fn merge_fragments(volume: Bounds, parts: &[Vec<u8>]) -> Result<Vec<u8>, MeshError> {
    let mut nodes = Vec::new();
    for p in parts {
        let mut frag: Vec<FragmentNode> = bincode::deserialize(p)?;
        nodes.append(&mut frag);
    }
    let tree = PartitionTree::from_fragments(volume, &nodes);
    tree.validate()?;
    Ok(bincode::serialize(&tree)?)
}

/// Element-wise union of `local` boxes over the group. Members with no
/// data pass inverted boxes.
fn reduce_bounds<C: Communicator>(
    g: &SubGroup<'_, C>,
    local: &[Bounds],
) -> Result<Vec<Bounds>, MeshError> {
    let mins: Vec<f64> = local.iter().flat_map(|b| b.min).collect();
    let maxs: Vec<f64> = local.iter().flat_map(|b| b.max).collect();
    let mins = g.all_reduce_min(&mins)?;
    let maxs = g.all_reduce_max(&maxs)?;
    Ok(mins
        .chunks_exact(3)
        .zip(maxs.chunks_exact(3))
        .map(|(lo, hi)| Bounds::new([lo[0], lo[1], lo[2]], [hi[0], hi[1], hi[2]]))
        .collect())
}

/// Global volume with flat axes widened and lower faces fudged.
/// Returns the volume, the fudge and whether the volume is a single point.
fn volume_bounds<C: Communicator>(
    world: &SubGroup<'_, C>,
    local: Bounds,
) -> Result<(Bounds, f64, bool), MeshError> {
    let mut b = reduce_bounds(world, &[local])?[0];
    if b.is_empty() {
        b = Bounds::new([0.0; 3], [0.0; 3]);
    }
    let mut a = b.max_extent() * VOLUME_MARGIN;
    let degenerate = a == 0.0;
    if degenerate {
        log::warn!("all points coincide; widening the volume by {DEGENERATE_MARGIN}");
        a = DEGENERATE_MARGIN;
    }
    let fudge = a * FUDGE_FRACTION;
    for d in 0..3 {
        if b.extent(d) == 0.0 {
            b.min[d] -= a;
            b.max[d] += a;
        } else {
            b.min[d] -= fudge;
        }
    }
    Ok((b, fudge, degenerate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};
    use crate::partitioning::{X_AXIS, Z_AXIS};
    use std::thread;

    fn on_ranks<F, R>(n: usize, f: F) -> Vec<R>
    where
        F: Fn(RayonComm) -> R + Send + Sync + Clone + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = RayonComm::world(n)
            .into_iter()
            .map(|c| {
                let f = f.clone();
                thread::spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn line(n: usize, offset: usize) -> Vec<[f64; 3]> {
        (0..n)
            .map(|i| [(offset + i) as f64, ((offset + i) % 7) as f64 * 0.1, 0.0])
            .collect()
    }

    #[test]
    fn serial_build_halves_the_data() {
        let cfg = PartitionConfig {
            min_cells_per_region: 1,
            regions_or_more: 4,
            ..Default::default()
        };
        let mut b = PartitionTreeBuilder::new(cfg);
        let pts = line(64, 0);
        let tree = b.build(&NoComm, &pts, Bounds::from_points(&pts)).unwrap();
        assert_eq!(tree.region_count(), 4);
        for id in 0..4 {
            assert_eq!(tree.region(id).unwrap().point_count, 16);
        }
        tree.validate().unwrap();
        for p in &pts {
            assert!(tree.region_containing(p).is_some());
        }
    }

    #[test]
    fn split_axis_prefers_widest_enabled() {
        let b = PartitionTreeBuilder::new(PartitionConfig::default());
        let data = Bounds::new([0.0; 3], [1.0, 3.0, 3.0]);
        assert_eq!(b.split_axis(&data), Some(1));
        let only_xz = PartitionTreeBuilder::new(PartitionConfig {
            valid_split_dimensions: X_AXIS | Z_AXIS,
            ..Default::default()
        });
        assert_eq!(only_xz.split_axis(&data), Some(2));
        assert_eq!(b.split_axis(&Bounds::new([1.0; 3], [1.0; 3])), None);
    }

    #[test]
    fn coincident_points_give_one_region() {
        let mut b = PartitionTreeBuilder::new(PartitionConfig {
            min_cells_per_region: 1,
            ..Default::default()
        });
        let pts = vec![[2.0, 2.0, 2.0]; 10];
        let tree = b.build(&NoComm, &pts, Bounds::from_points(&pts)).unwrap();
        assert_eq!(tree.region_count(), 1);
        assert!(matches!(b.warning(), Some(MeshError::DegenerateGeometry(_))));
        assert!(tree.region_containing(&[2.0, 2.0, 2.0]).is_some());
    }

    #[test]
    fn too_few_cells_fail_everywhere() {
        let out = on_ranks(3, |c| {
            let pts = if c.rank() == 0 { line(2, 0) } else { Vec::new() };
            let mut b = PartitionTreeBuilder::new(PartitionConfig::default());
            b.build(&c, &pts, Bounds::from_points(&pts)).map(|_| ())
        });
        for r in out {
            assert_eq!(
                r,
                Err(MeshError::InsufficientData {
                    total: 2,
                    workers: 3
                })
            );
        }
    }

    #[test]
    fn distributed_build_is_identical_everywhere() {
        let shares = [90usize, 0, 130, 40];
        let out = on_ranks(4, move |c| {
            let offset: usize = shares[..c.rank()].iter().sum();
            let pts = line(shares[c.rank()], offset);
            let mut b = PartitionTreeBuilder::new(PartitionConfig {
                min_cells_per_region: 2,
                regions_or_more: 4,
                ..Default::default()
            });
            let tree = b.build(&c, &pts, Bounds::from_points(&pts)).unwrap();
            let mut counts = vec![0usize; tree.region_count()];
            for p in &pts {
                counts[tree.region_containing(p).unwrap()] += 1;
            }
            (tree, counts)
        });
        let tree = &out[0].0;
        assert!(out.iter().all(|(t, _)| t == tree));
        assert_eq!(tree.region_count(), 4);
        let mut per_region = vec![0usize; 4];
        for (_, counts) in &out {
            for (acc, c) in per_region.iter_mut().zip(counts) {
                *acc += c;
            }
        }
        assert_eq!(per_region.iter().sum::<usize>(), 260);
        assert!(per_region.iter().all(|&n| n == 65));
    }

    #[test]
    fn mismatched_parameters_follow_rank_zero() {
        let out = on_ranks(2, |c| {
            let cfg = PartitionConfig {
                min_cells_per_region: 1,
                regions_or_more: if c.rank() == 0 { 2 } else { 8 },
                ..Default::default()
            };
            let pts = line(20, 20 * c.rank());
            let mut b = PartitionTreeBuilder::new(cfg);
            let tree = b.build(&c, &pts, Bounds::from_points(&pts)).unwrap();
            (tree.region_count(), b.config().regions_or_more)
        });
        assert_eq!(out, vec![(2, 2), (2, 2)]);
    }
}
