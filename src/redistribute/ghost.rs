//! Ghost halo growth, one level at a time.
//!
//! Level `g` starts from a frontier: at level 1 the owned points lying in
//! other workers' regions, later the points first reached at level `g - 1`.
//! Frontier points go to the owner of their region together with the ids of
//! the cells this worker already holds on them. Whoever is asked answers
//! with its level-0 cells on those points, minus the held ones, and the
//! answers join the halo at level `g`.
//!
//! Without duplicated boundary cells a point on a region boundary can be
//! used by cells of several workers, none of them the owner. At level 1 the
//! owner therefore remembers who reported each of its points and tells
//! every reporter about the others, so they can ask each other directly.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::algs::communicator::{CommTag, Communicator, ExchangeTags};
use crate::algs::exchange::{TransferStrategy, exchange_payloads};
use crate::algs::sub_group::SubGroup;
use crate::data::attributes::{DataArray, GHOST_LEVEL};
use crate::data::merge::{MeshMerger, PointMatch};
use crate::data::mesh::{PointCellLinks, UnstructuredMesh};
use crate::mesh_error::MeshError;
use crate::partitioning::{PartitionTree, RegionOwnership};

const FRONTIER: CommTag = CommTag::GHOST;
const REPORTERS: CommTag = CommTag::GHOST.offset(2);
const RECIPROCAL: CommTag = CommTag::GHOST.offset(4);
const REQUESTS: CommTag = CommTag::GHOST.offset(6);
const CELLS: CommTag = CommTag::GHOST.offset(8);
const VOTE: CommTag = CommTag::GHOST.offset(10);

/// A point somebody needs cells around, and the cells it already holds there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointRequest {
    pub gid: i64,
    pub held: Vec<i64>,
}

/// `worker` also has cells on point `gid`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Reporter {
    gid: i64,
    worker: usize,
}

/// Parameters of one halo growth.
#[derive(Clone, Debug)]
pub struct GhostOptions<'a> {
    pub levels: u8,
    /// Global point id array of the input mesh.
    pub point_ids: &'a str,
    /// Global cell id array of the input mesh.
    pub cell_ids: &'a str,
    /// Whether boundary cells were copied to every intersecting region.
    pub duplicate_cells: bool,
    pub strategy: TransferStrategy,
}

/// Ids of a mesh's points and cells, indexed for lookups.
struct HeldCells {
    index: HashMap<i64, usize>,
    links: PointCellLinks,
    cell_gids: Vec<i64>,
}

impl HeldCells {
    fn of(mesh: &UnstructuredMesh, opts: &GhostOptions<'_>) -> Result<Self, MeshError> {
        let pids = mesh
            .point_ids(opts.point_ids)?
            .ok_or_else(|| MeshError::MissingAttribute(opts.point_ids.to_owned()))?;
        let cids = mesh
            .cell_ids(opts.cell_ids)?
            .ok_or_else(|| MeshError::MissingAttribute(opts.cell_ids.to_owned()))?;
        let mut index = HashMap::with_capacity(pids.len());
        for (p, &g) in pids.iter().enumerate() {
            index.entry(g).or_insert(p);
        }
        Ok(Self {
            index,
            links: mesh.point_cells(),
            cell_gids: cids.to_vec(),
        })
    }

    fn find(&self, gid: i64) -> Option<usize> {
        self.index.get(&gid).copied()
    }

    fn uses(&self, p: usize) -> bool {
        !self.links.cells_of(p).is_empty()
    }

    fn request(&self, gid: i64, p: usize) -> PointRequest {
        let held = self
            .links
            .cells_of(p)
            .iter()
            .map(|&c| self.cell_gids[c])
            .sorted_unstable()
            .dedup()
            .collect();
        PointRequest { gid, held }
    }

    /// Cells on the requested points the requester does not hold, ascending.
    fn serve(&self, requests: &[PointRequest]) -> Vec<usize> {
        let mut out = BTreeSet::new();
        for r in requests {
            let Some(p) = self.find(r.gid) else {
                continue;
            };
            for &c in self.links.cells_of(p) {
                if !r.held.contains(&self.cell_gids[c]) {
                    out.insert(c);
                }
            }
        }
        out.into_iter().collect()
    }
}

/// Owned mesh plus the halo merged so far, with per-entity levels.
struct Halo {
    merger: MeshMerger,
    point_level: Vec<u8>,
    cell_level: Vec<u8>,
}

impl Halo {
    fn new(owned: UnstructuredMesh, opts: &GhostOptions<'_>) -> Result<Self, MeshError> {
        let point_level = vec![0; owned.num_points()];
        let cell_level = vec![0; owned.num_cells()];
        let merger = MeshMerger::with_base(
            owned,
            PointMatch::GlobalId(opts.point_ids.to_owned()),
            Some(opts.cell_ids.to_owned()),
        )?;
        Ok(Self {
            merger,
            point_level,
            cell_level,
        })
    }

    fn mesh(&self) -> &UnstructuredMesh {
        self.merger.mesh()
    }

    /// Merge `pieces` in order; everything new gets `level`.
    fn absorb(&mut self, pieces: &[UnstructuredMesh], level: u8) -> Result<(), MeshError> {
        for piece in pieces {
            self.merger.merge(piece)?;
        }
        let mesh = self.merger.mesh();
        self.point_level.resize(mesh.num_points(), level);
        self.cell_level.resize(mesh.num_cells(), level);
        Ok(())
    }

    fn finish(self) -> Result<UnstructuredMesh, MeshError> {
        let mut mesh = self.merger.finish();
        mesh.set_point_array(GHOST_LEVEL, DataArray::scalar_u8(self.point_level))?;
        mesh.set_cell_array(GHOST_LEVEL, DataArray::scalar_u8(self.cell_level))?;
        Ok(mesh)
    }
}

/// Everything a level needs besides the halo itself.
struct Pass<'a, C: Communicator> {
    comm: &'a C,
    world: SubGroup<'a, C>,
    tree: &'a PartitionTree,
    ownership: &'a RegionOwnership,
    opts: &'a GhostOptions<'a>,
}

/// Grow `opts.levels` halo layers around `mesh`, the cells this worker owns.
///
/// `mesh` must carry both global id arrays. The result holds the owned data
/// first, then the halo, with `ghost_level` arrays on points and cells.
/// Every worker must call this; a failure anywhere fails it everywhere.
pub fn add_ghost_cells<C: Communicator>(
    comm: &C,
    mesh: UnstructuredMesh,
    tree: &PartitionTree,
    ownership: &RegionOwnership,
    opts: &GhostOptions<'_>,
) -> Result<UnstructuredMesh, MeshError> {
    let mut mesh = mesh;
    mesh.remove_point_array(GHOST_LEVEL);
    mesh.remove_cell_array(GHOST_LEVEL);

    let pass = Pass {
        comm,
        world: comm.world_group(VOTE),
        tree,
        ownership,
        opts,
    };
    let setup = HeldCells::of(&mesh, opts).and_then(|owned| Ok((owned, Halo::new(mesh, opts)?)));
    let (owned, mut halo) = pass.world.vote_result(setup, "ghost setup")?;

    let mut reporters: HashMap<i64, Vec<usize>> = HashMap::new();
    for level in 1..=opts.levels {
        let held = pass
            .world
            .vote_result(HeldCells::of(halo.mesh(), opts), "indexing halo")?;
        let asked = if opts.duplicate_cells {
            pass.duplicate_requests(&halo, &held, level)?
        } else {
            pass.unique_requests(&halo, &held, level, &mut reporters)?
        };
        let pieces = pass.ship_cells(&halo, &owned, &asked)?;
        let before = halo.cell_level.len();
        pass.world
            .vote_result(halo.absorb(&pieces, level), "merging ghost cells")?;
        log::debug!(
            "rank {}: ghost level {level} added {} cells",
            comm.rank(),
            halo.cell_level.len() - before
        );
    }
    halo.finish()
}

impl<C: Communicator> Pass<'_, C> {
    fn me(&self) -> usize {
        self.comm.rank()
    }

    fn owner_of_point(&self, p: &[f64; 3]) -> usize {
        self.ownership
            .point_owner(self.tree, p)
            .unwrap_or_else(|| self.me())
    }

    /// Frontier requests keyed by the owner of each point's region.
    fn frontier(&self, halo: &Halo, held: &HeldCells, level: u8) -> Vec<Vec<PointRequest>> {
        let mesh = halo.mesh();
        let mut out = vec![Vec::new(); self.comm.size()];
        let Ok(Some(pids)) = mesh.point_ids(self.opts.point_ids) else {
            return out;
        };
        for (p, &gid) in pids.iter().enumerate() {
            let reached = if level == 1 {
                held.uses(p)
            } else {
                halo.point_level[p] == level - 1
            };
            if !reached {
                continue;
            }
            let owner = self.owner_of_point(&mesh.point(p));
            if level == 1 && owner == self.me() {
                continue;
            }
            out[owner].push(held.request(gid, p));
        }
        out
    }

    /// Whether `p` lies strictly inside one of this worker's regions.
    fn strictly_mine(&self, p: &[f64; 3]) -> bool {
        self.ownership
            .regions_owned_by(self.me())
            .iter()
            .filter_map(|&r| self.tree.region_bounds(r).ok())
            .any(|b| b.strictly_contains(p))
    }

    /// Requests this worker must serve, per requester, with unique cells.
    fn unique_requests(
        &self,
        halo: &Halo,
        held: &HeldCells,
        level: u8,
        reporters: &mut HashMap<i64, Vec<usize>>,
    ) -> Result<Vec<Vec<PointRequest>>, MeshError> {
        let me = self.me();
        let mut requests = self.frontier(halo, held, level);
        let mine = std::mem::take(&mut requests[me]);
        let inside = self.swap(&requests, FRONTIER, "ghost frontier")?;

        if level == 1 {
            for (src, list) in inside.iter().enumerate() {
                for r in list {
                    let seen = reporters.entry(r.gid).or_default();
                    if !seen.contains(&src) {
                        seen.push(src);
                    }
                }
            }
        }

        let mut others = vec![Vec::new(); self.comm.size()];
        for (src, list) in inside.iter().enumerate() {
            for r in list {
                for &worker in reporters.get(&r.gid).into_iter().flatten() {
                    if worker != src && worker != me {
                        others[src].push(Reporter { gid: r.gid, worker });
                    }
                }
            }
        }
        let others = self.swap(&others, REPORTERS, "ghost reporters")?;

        for rep in others.iter().flatten() {
            if let (Some(p), Some(list)) = (held.find(rep.gid), requests.get_mut(rep.worker)) {
                list.push(held.request(rep.gid, p));
            }
        }
        if level == 1 {
            // reported points of this region that local cells use too
            for (src, list) in inside.iter().enumerate() {
                for r in list {
                    if let Some(p) = held.find(r.gid).filter(|&p| held.uses(p)) {
                        requests[src].push(held.request(r.gid, p));
                    }
                }
            }
        } else {
            for r in &mine {
                for &worker in reporters.get(&r.gid).into_iter().flatten() {
                    if worker != me {
                        requests[worker].push(r.clone());
                    }
                }
            }
        }
        requests[me].clear();
        self.swap(&requests, REQUESTS, "ghost requests")
    }

    /// Requests this worker must serve, per requester, with duplicated cells.
    fn duplicate_requests(
        &self,
        halo: &Halo,
        held: &HeldCells,
        level: u8,
    ) -> Result<Vec<Vec<PointRequest>>, MeshError> {
        let mut requests = self.frontier(halo, held, level);
        requests[self.me()].clear();
        let mut inside = self.swap(&requests, FRONTIER, "ghost frontier")?;
        if level == 1 {
            // a requester on a shared boundary may hold cells this worker lacks
            let mesh = halo.mesh();
            let mut back = vec![Vec::new(); self.comm.size()];
            for (src, list) in inside.iter().enumerate() {
                for r in list {
                    if let Some(p) = held.find(r.gid) {
                        if !self.strictly_mine(&mesh.point(p)) {
                            back[src].push(held.request(r.gid, p));
                        }
                    }
                }
            }
            let extra = self.swap(&back, RECIPROCAL, "ghost reciprocal requests")?;
            for (src, list) in extra.into_iter().enumerate() {
                inside[src].extend(list);
            }
        }
        Ok(inside)
    }

    /// Serve `asked` from the owned cells and return what arrives, in rank order.
    fn ship_cells(
        &self,
        halo: &Halo,
        owned: &HeldCells,
        asked: &[Vec<PointRequest>],
    ) -> Result<Vec<UnstructuredMesh>, MeshError> {
        let me = self.me();
        let packed: Result<Vec<Vec<u8>>, MeshError> = asked
            .iter()
            .enumerate()
            .map(|(dst, reqs)| {
                let cells = if dst == me { Vec::new() } else { owned.serve(reqs) };
                if cells.is_empty() {
                    return Ok(Vec::new());
                }
                // owned cells come first in the halo mesh
                halo.mesh().extract_cells(&cells)?.to_bytes()
            })
            .collect();
        let packed = self.world.vote_result(packed, "packing ghost cells")?;
        let incoming = exchange_payloads(
            self.comm,
            packed,
            ExchangeTags::from_base(CELLS),
            self.opts.strategy,
        );
        let incoming = self.world.vote_result(incoming, "ghost cell exchange")?;
        let decoded = incoming
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(src, b)| UnstructuredMesh::from_bytes(b, src))
            .collect();
        self.world.vote_result(decoded, "decoding ghost cells")
    }

    /// All-to-all exchange of record lists.
    fn swap<T: Serialize + DeserializeOwned>(
        &self,
        lists: &[Vec<T>],
        base: CommTag,
        stage: &'static str,
    ) -> Result<Vec<Vec<T>>, MeshError> {
        let encoded: Result<Vec<Vec<u8>>, MeshError> = lists
            .iter()
            .map(|l| {
                if l.is_empty() {
                    Ok(Vec::new())
                } else {
                    bincode::serialize(l).map_err(MeshError::from)
                }
            })
            .collect();
        let encoded = self.world.vote_result(encoded, stage)?;
        let incoming = exchange_payloads(
            self.comm,
            encoded,
            ExchangeTags::from_base(base),
            self.opts.strategy,
        );
        let incoming = self.world.vote_result(incoming, stage)?;
        let decoded = incoming
            .iter()
            .map(|b| {
                if b.is_empty() {
                    Ok(Vec::new())
                } else {
                    bincode::deserialize(b).map_err(MeshError::from)
                }
            })
            .collect();
        self.world.vote_result(decoded, stage)
    }
}
