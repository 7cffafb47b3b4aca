//! Process-wide ids for points and cells.
//!
//! Cell ids are a prefix sum over local cell counts. Point ids are handed
//! out by region owners: each worker numbers the points inside its own
//! regions, then asks the owners about the rest. A point its owner does not
//! hold gets a placeholder slot from that owner, numbered after every owned
//! point once all slots are known.

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags};
use crate::algs::exchange::{TransferStrategy, exchange_payloads};
use crate::algs::sub_group::exclusive_prefix;
use crate::algs::wire::{
    REPLY_ASSIGNED, REPLY_MISSING, REPLY_PLACEHOLDER, WireCoord, WireIdReply, cast_slice,
    decode_records,
};
use crate::data::attributes::DataArray;
use crate::data::locator::PointLocator;
use crate::data::mesh::UnstructuredMesh;
use crate::mesh_error::MeshError;
use crate::partitioning::{PartitionTree, RegionOwnership};

/// Where a local point's global id stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PointIdState {
    /// Final id, from this worker or from the point's owner.
    Owned(u64),
    /// Asked the owner, no answer yet.
    RemotePending,
    /// The owner does not hold the point and reserved slot `seq` for it.
    LocalPlaceholder { owner: usize, seq: u64 },
}

/// Number every cell as `offset + i`, the offset being the cells on lower ranks.
pub fn assign_global_cell_ids<C: Communicator>(
    comm: &C,
    mesh: &mut UnstructuredMesh,
    name: &str,
) -> Result<(), MeshError> {
    let counts = comm
        .world_group(CommTag::GLOBAL_IDS.offset(8))
        .all_gather_counts(mesh.num_cells())?;
    let offset = exclusive_prefix(&counts)[comm.rank()];
    let ids = (0..mesh.num_cells()).map(|i| (offset + i) as i64).collect();
    mesh.set_cell_array(name, DataArray::scalar_i64(ids))
}

/// Replace every state with a final id.
///
/// `placeholder_base[w]` is where worker `w`'s placeholder slots start.
pub fn resolve_point_ids(
    states: &[PointIdState],
    placeholder_base: &[u64],
) -> Result<Vec<i64>, MeshError> {
    states
        .iter()
        .enumerate()
        .map(|(p, s)| match *s {
            PointIdState::Owned(id) => Ok(id as i64),
            PointIdState::LocalPlaceholder { owner, seq } => placeholder_base
                .get(owner)
                .map(|base| (base + seq) as i64)
                .ok_or_else(|| {
                    MeshError::Configuration(format!(
                        "point {p} has a placeholder from unknown worker {owner}"
                    ))
                }),
            PointIdState::RemotePending => Err(MeshError::Configuration(format!(
                "point {p} never received an id"
            ))),
        })
        .collect()
}

/// Give every point of `mesh` a global id in the `name` array.
///
/// `require_owner` turns a point its owner does not hold into
/// [`MeshError::MissingPoint`]. Fails on every worker if it fails anywhere.
pub fn assign_global_point_ids<C: Communicator>(
    comm: &C,
    mesh: &mut UnstructuredMesh,
    tree: &PartitionTree,
    ownership: &RegionOwnership,
    name: &str,
    require_owner: bool,
    strategy: TransferStrategy,
) -> Result<(), MeshError> {
    let world = comm.world_group(CommTag::GLOBAL_IDS.offset(4));
    let ids = point_ids(comm, mesh, tree, ownership, require_owner, strategy);
    let ids = world.vote_result(ids, "global point ids")?;
    mesh.set_point_array(name, DataArray::scalar_i64(ids))
}

fn point_ids<C: Communicator>(
    comm: &C,
    mesh: &UnstructuredMesh,
    tree: &PartitionTree,
    ownership: &RegionOwnership,
    require_owner: bool,
    strategy: TransferStrategy,
) -> Result<Vec<i64>, MeshError> {
    let me = comm.rank();
    let nprocs = comm.size();
    let world = comm.world_group(CommTag::GLOBAL_IDS.offset(6));

    // Owned points first, to learn this worker's offset.
    let owners: Vec<usize> = mesh
        .points()
        .iter()
        .map(|p| ownership.point_owner(tree, p).unwrap_or(me))
        .collect();
    let owned_here = owners.iter().filter(|&&w| w == me).count();
    let owned_counts = world.all_gather_counts(owned_here)?;
    let offset = exclusive_prefix(&owned_counts)[me] as u64;
    let total_owned: usize = owned_counts.iter().sum();

    let mut states = Vec::with_capacity(mesh.num_points());
    let mut locator = PointLocator::new(tree.fudge());
    let mut owned_ids = Vec::with_capacity(owned_here);
    let mut asked: Vec<Vec<usize>> = vec![Vec::new(); nprocs];
    for (p, &w) in owners.iter().enumerate() {
        if w == me {
            let id = offset + owned_ids.len() as u64;
            locator.insert(mesh.point(p));
            owned_ids.push(id);
            states.push(PointIdState::Owned(id));
        } else {
            asked[w].push(p);
            states.push(PointIdState::RemotePending);
        }
    }

    // Ask each owner about our foreign points.
    let requests: Vec<Vec<u8>> = asked
        .iter()
        .map(|pts| {
            let recs: Vec<WireCoord> = pts.iter().map(|&p| WireCoord::new(mesh.point(p))).collect();
            cast_slice(&recs).to_vec()
        })
        .collect();
    // A local failure is held until the last collective so peers never
    // wait on a worker that already left.
    let mut failed = None;
    let incoming = exchange_payloads(
        comm,
        requests,
        ExchangeTags::from_base(CommTag::GLOBAL_IDS),
        strategy,
    )
    .unwrap_or_else(|e| {
        failed.get_or_insert(e);
        vec![Vec::new(); nprocs]
    });

    // Answer: an owned id, or a placeholder slot shared by equal coordinates.
    let mut placeholders = PointLocator::new(tree.fudge());
    let mut replies = Vec::with_capacity(nprocs);
    for (src, bytes) in incoming.iter().enumerate() {
        let coords = decode_records::<WireCoord>(bytes, src).unwrap_or_else(|e| {
            failed.get_or_insert(e);
            Vec::new()
        });
        let recs: Vec<WireIdReply> = coords
            .iter()
            .map(|w| {
                let p = w.get();
                match locator.find(&p) {
                    Some(i) => WireIdReply::new(REPLY_ASSIGNED, owned_ids[i]),
                    None if require_owner => WireIdReply::new(REPLY_MISSING, 0),
                    None => {
                        let (seq, _) = placeholders.insert_unique(p);
                        WireIdReply::new(REPLY_PLACEHOLDER, seq as u64)
                    }
                }
            })
            .collect();
        replies.push(cast_slice(&recs).to_vec());
    }
    let answers = exchange_payloads(
        comm,
        replies,
        ExchangeTags::from_base(CommTag::GLOBAL_IDS.offset(2)),
        strategy,
    )
    .unwrap_or_else(|e| {
        failed.get_or_insert(e);
        vec![Vec::new(); nprocs]
    });

    for (owner, bytes) in answers.iter().enumerate() {
        let recs = match decode_records::<WireIdReply>(bytes, owner) {
            Ok(recs) if recs.len() == asked[owner].len() => recs,
            Ok(_) => {
                failed.get_or_insert(MeshError::BufferSizeMismatch {
                    neighbor: owner,
                    expected: asked[owner].len() * size_of::<WireIdReply>(),
                    got: bytes.len(),
                });
                continue;
            }
            Err(e) => {
                failed.get_or_insert(e);
                continue;
            }
        };
        for (&p, r) in asked[owner].iter().zip(&recs) {
            states[p] = match r.kind() {
                REPLY_ASSIGNED => PointIdState::Owned(r.value()),
                REPLY_PLACEHOLDER => PointIdState::LocalPlaceholder {
                    owner,
                    seq: r.value(),
                },
                _ => {
                    failed.get_or_insert(MeshError::MissingPoint {
                        point: mesh.point(p),
                        owner,
                    });
                    PointIdState::RemotePending
                }
            };
        }
    }

    let slots = world.all_gather_counts(placeholders.len())?;
    if let Some(e) = failed {
        return Err(e);
    }
    let base: Vec<u64> = exclusive_prefix(&slots)
        .into_iter()
        .map(|s| (total_owned + s) as u64)
        .collect();
    log::debug!(
        "rank {me}: {owned_here} owned points, {} placeholder slots issued",
        placeholders.len()
    );
    resolve_point_ids(&states, &base)
}
