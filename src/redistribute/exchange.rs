//! Shipping cell subsets between workers and merging what arrives.
//!
//! A sender turns each [`PendingTransfer`] into a serialized sub-mesh; the
//! two-stage payload exchange moves the bytes; the receiver merges its own
//! share and every incoming sub-mesh in source-rank order, so the first
//! copy of a duplicated point or cell is the lowest rank's.

use std::collections::BTreeSet;

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags};
use crate::algs::exchange::{TransferStrategy, exchange_payloads};
use crate::data::mesh::UnstructuredMesh;
use crate::data::merge::{MeshMerger, PointMatch};
use crate::mesh_error::MeshError;
use crate::partitioning::{PartitionTree, RegionOwnership};

/// Cells of the local mesh bound for one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransfer {
    pub source: usize,
    pub destination: usize,
    pub cells: Vec<usize>,
}

/// How received sub-meshes are merged.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeRule {
    pub points: PointMatch,
    /// Drop cells whose id in this array was already merged.
    pub cell_ids: Option<String>,
}

/// Local cells per region.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionCellLists {
    /// `inside[r]`: cells whose centroid falls in region `r`.
    pub inside: Vec<Vec<usize>>,
    /// `boundary[r]`: cells overlapping region `r` with their centroid elsewhere.
    pub boundary: Vec<Vec<usize>>,
}

impl RegionCellLists {
    /// Sort the cells of `mesh` into regions; boundary lists stay empty
    /// unless `with_boundary`.
    pub fn build(
        tree: &PartitionTree,
        mesh: &UnstructuredMesh,
        centroids: &[[f64; 3]],
        with_boundary: bool,
    ) -> Self {
        let n = tree.region_count();
        let mut lists = Self {
            inside: vec![Vec::new(); n],
            boundary: vec![Vec::new(); n],
        };
        for (c, centroid) in centroids.iter().enumerate() {
            let home = tree.locate(centroid);
            lists.inside[home].push(c);
            if with_boundary {
                for region in tree.regions_intersecting(&mesh.cell_bounds(c)) {
                    if region != home {
                        lists.boundary[region].push(c);
                    }
                }
            }
        }
        lists
    }

    /// Per-region counts of the inside lists.
    pub fn counts(&self) -> Vec<usize> {
        self.inside.iter().map(Vec::len).collect()
    }
}

/// One transfer per worker (empty ones included), built from where each
/// cell's centroid falls and, with `duplicate`, every region its bounds
/// overlap.
pub fn plan_transfers(
    me: usize,
    mesh: &UnstructuredMesh,
    centroids: &[[f64; 3]],
    tree: &PartitionTree,
    ownership: &RegionOwnership,
    duplicate: bool,
) -> Vec<PendingTransfer> {
    let lists = RegionCellLists::build(tree, mesh, centroids, duplicate);
    let mut per_worker = vec![BTreeSet::new(); ownership.worker_count()];
    for region in 0..tree.region_count() {
        let Some(w) = ownership.owner_of(region) else {
            continue;
        };
        per_worker[w].extend(lists.inside[region].iter().copied());
        per_worker[w].extend(lists.boundary[region].iter().copied());
    }
    per_worker
        .into_iter()
        .enumerate()
        .map(|(destination, cells)| PendingTransfer {
            source: me,
            destination,
            cells: cells.into_iter().collect(),
        })
        .collect()
}

/// Ship every transfer and merge the local share with everything received.
///
/// Every worker must call this. A failure anywhere fails the call on every
/// worker.
pub fn exchange<C: Communicator>(
    comm: &C,
    mesh: &UnstructuredMesh,
    transfers: Vec<PendingTransfer>,
    rule: &MergeRule,
    strategy: TransferStrategy,
    base: CommTag,
) -> Result<UnstructuredMesh, MeshError> {
    let world = comm.world_group(base.offset(2));
    let prepared = world.vote_result(pack(comm, mesh, transfers), "packing sub-meshes")?;
    let (outgoing, own) = prepared;

    let incoming = exchange_payloads(comm, outgoing, ExchangeTags::from_base(base), strategy);
    let incoming = world.vote_result(incoming, "sub-mesh exchange")?;

    let merged = merge_in_rank_order(comm.rank(), own, &incoming, rule);
    world.vote_result(merged, "merging sub-meshes")
}

/// Serialized sub-mesh per destination, plus the part that stays here.
fn pack<C: Communicator>(
    comm: &C,
    mesh: &UnstructuredMesh,
    transfers: Vec<PendingTransfer>,
) -> Result<(Vec<Vec<u8>>, Option<UnstructuredMesh>), MeshError> {
    let me = comm.rank();
    let mut outgoing = vec![Vec::new(); comm.size()];
    let mut own = None;
    for t in transfers {
        if t.source != me || t.destination >= comm.size() {
            return Err(MeshError::Configuration(format!(
                "transfer {} -> {} does not start at rank {me} of {}",
                t.source,
                t.destination,
                comm.size()
            )));
        }
        if t.cells.is_empty() {
            continue;
        }
        let sub = mesh.extract_cells(&t.cells)?;
        if t.destination == me {
            own = Some(sub);
        } else {
            log::debug!(
                "rank {me}: sending {} cells to rank {}",
                t.cells.len(),
                t.destination
            );
            outgoing[t.destination] = sub.to_bytes()?;
        }
    }
    Ok((outgoing, own))
}

fn merge_in_rank_order(
    me: usize,
    own: Option<UnstructuredMesh>,
    incoming: &[Vec<u8>],
    rule: &MergeRule,
) -> Result<UnstructuredMesh, MeshError> {
    let mut merger = MeshMerger::new(rule.points.clone(), rule.cell_ids.clone());
    let mut own = own;
    for (src, bytes) in incoming.iter().enumerate() {
        if src == me {
            if let Some(m) = own.take() {
                merger.merge(&m)?;
            }
        } else if !bytes.is_empty() {
            merger.merge(&UnstructuredMesh::from_bytes(bytes, src)?)?;
        }
    }
    if let Some(m) = own {
        merger.merge(&m)?;
    }
    Ok(merger.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::RayonComm;
    use crate::data::attributes::{DataArray, GLOBAL_CELL_ID};
    use crate::geometry::bounds::Bounds;
    use crate::partitioning::{AssignmentPolicy, FragmentNode, Split, assign};
    use crate::topology::cell_type::CellType;
    use std::thread;

    /// Unit segments along x starting at `x0`, with cell ids.
    fn segments(x0: usize, n: usize) -> UnstructuredMesh {
        let mut m = UnstructuredMesh::new();
        for i in 0..=n {
            m.add_point([(x0 + i) as f64, 0.0, 0.0]);
        }
        for i in 0..n {
            m.add_cell(CellType::Segment, &[i, i + 1]).unwrap();
        }
        let ids = (0..n).map(|i| (x0 + i) as i64).collect();
        m.set_cell_array(GLOBAL_CELL_ID, DataArray::scalar_i64(ids)).unwrap();
        m
    }

    /// Two regions split at x = 4 over [0, 8].
    fn halves() -> PartitionTree {
        let root = Bounds::new([-1e-3, -1.0, -1.0], [8.0, 1.0, 1.0]);
        let frag = |key, level, split| FragmentNode {
            key,
            level,
            bounds: root,
            data_bounds: root,
            point_count: 0,
            split,
        };
        PartitionTree::from_fragments(
            root,
            &[
                frag(1, 0, Some(Split { dim: 0, coord: 4.0 })),
                frag(2, 1, None),
                frag(3, 1, None),
            ],
        )
    }

    #[test]
    fn plan_follows_centroids_and_bounds() {
        let mesh = segments(3, 2); // [3,4] and [4,5]
        let tree = halves();
        let own = assign(&tree, &AssignmentPolicy::RoundRobin, 2).unwrap();
        let one = plan_transfers(0, &mesh, &mesh.centroids(), &tree, &own, false);
        assert_eq!(one[0].cells, vec![0]);
        assert_eq!(one[1].cells, vec![1]);

        let mut m = UnstructuredMesh::new();
        m.add_point([3.5, 0.0, 0.0]);
        m.add_point([4.5, 0.0, 0.0]);
        m.add_cell(CellType::Segment, &[0, 1]).unwrap();
        let dup = plan_transfers(0, &m, &m.centroids(), &tree, &own, true);
        assert_eq!(dup[0].cells, vec![0]);
        assert_eq!(dup[1].cells, vec![0]);
    }

    #[test]
    fn boundary_lists_skip_the_home_region() {
        let mut m = UnstructuredMesh::new();
        m.add_point([3.0, 0.0, 0.0]);
        m.add_point([4.5, 0.0, 0.0]);
        m.add_cell(CellType::Segment, &[0, 1]).unwrap();
        let tree = halves();
        let lists = RegionCellLists::build(&tree, &m, &m.centroids(), true);
        assert_eq!(lists.inside, vec![vec![0], vec![]]);
        assert_eq!(lists.boundary, vec![vec![], vec![0]]);
        assert_eq!(lists.counts(), vec![1, 0]);
        let plain = RegionCellLists::build(&tree, &m, &m.centroids(), false);
        assert!(plain.boundary.iter().all(Vec::is_empty));
    }

    #[test]
    fn two_workers_swap_halves() {
        let run = |strategy: TransferStrategy| {
            let handles: Vec<_> = RayonComm::world(2)
                .into_iter()
                .map(|c| {
                    thread::spawn(move || {
                        // rank 0 holds [0,2] and [6,8], rank 1 holds [2,6]
                        let mesh = if c.rank() == 0 {
                            let mut merger = MeshMerger::new(PointMatch::Tolerance(0.0), None);
                            merger.merge(&segments(0, 2)).unwrap();
                            merger.merge(&segments(6, 2)).unwrap();
                            merger.finish()
                        } else {
                            segments(2, 4)
                        };
                        let tree = halves();
                        let own = assign(&tree, &AssignmentPolicy::RoundRobin, 2).unwrap();
                        let plan =
                            plan_transfers(c.rank(), &mesh, &mesh.centroids(), &tree, &own, false);
                        let rule = MergeRule {
                            points: PointMatch::Tolerance(1e-9),
                            cell_ids: Some(GLOBAL_CELL_ID.into()),
                        };
                        exchange(&c, &mesh, plan, &rule, strategy, CommTag::EXCHANGE).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        };
        for strategy in [TransferStrategy::Lean, TransferStrategy::Fast] {
            let out = run(strategy);
            let ids0 = out[0].cell_ids(GLOBAL_CELL_ID).unwrap().unwrap().to_vec();
            let ids1 = out[1].cell_ids(GLOBAL_CELL_ID).unwrap().unwrap().to_vec();
            assert_eq!(ids0, vec![0, 1, 2, 3]);
            assert_eq!(ids1, vec![6, 7, 4, 5]);
            assert_eq!(out[0].num_points(), 5);
            assert_eq!(out[1].num_points(), 5);
        }
    }

    #[test]
    fn foreign_transfer_is_rejected_everywhere() {
        let handles: Vec<_> = RayonComm::world(2)
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let mesh = segments(0, 2);
                    let source = if c.rank() == 1 { 0 } else { c.rank() };
                    let plan = vec![PendingTransfer {
                        source,
                        destination: 0,
                        cells: vec![0],
                    }];
                    let rule = MergeRule {
                        points: PointMatch::Tolerance(0.0),
                        cell_ids: None,
                    };
                    exchange(&c, &mesh, plan, &rule, TransferStrategy::Lean, CommTag::EXCHANGE)
                })
            })
            .collect();
        let out: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(matches!(out[0], Err(MeshError::RemoteFailure { .. })));
        assert!(matches!(out[1], Err(MeshError::Configuration(_))));
    }
}
