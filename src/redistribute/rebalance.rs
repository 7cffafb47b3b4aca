//! Give cells to workers that start out empty.
//!
//! The tree build samples every worker's data, so a worker with no cells
//! would sit idle through the selection rounds. When some worker is empty,
//! the ones holding data hand over contiguous blocks of their cells first.

use std::ops::Range;

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::exchange::TransferStrategy;
use crate::data::mesh::UnstructuredMesh;
use crate::mesh_error::MeshError;
use crate::redistribute::exchange::{MergeRule, PendingTransfer, exchange};

/// Fraction of the fair share a receiving worker is filled up to at least.
pub const MIN_SHARE_FRACTION: f64 = 0.8;

/// Who sends which local cells to whom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebalancePlan {
    /// `sends[src][dst]` are cell indices of `src`; `sends[w][w]` stays.
    sends: Vec<Vec<Range<usize>>>,
}

impl RebalancePlan {
    pub fn cells(&self, src: usize, dst: usize) -> Range<usize> {
        self.sends
            .get(src)
            .and_then(|row| row.get(dst))
            .cloned()
            .unwrap_or(0..0)
    }

    /// Cells `worker` holds once the plan has run.
    pub fn count_after(&self, worker: usize) -> usize {
        self.sends.iter().map(|row| row[worker].len()).sum()
    }

    /// Transfers for `src`, one per destination.
    pub fn transfers(&self, src: usize) -> Vec<PendingTransfer> {
        (0..self.sends.len())
            .map(|dst| PendingTransfer {
                source: src,
                destination: dst,
                cells: self.cells(src, dst).collect(),
            })
            .collect()
    }
}

/// Plan the rebalance for per-worker cell `counts`.
///
/// `None` when every worker already has cells. A single worker with data
/// deals out equal contiguous blocks, the last worker taking the remainder.
/// Otherwise workers are ranked by count, largest first, and the largest
/// fill the empty ones up to the fair share while staying above
/// [`MIN_SHARE_FRACTION`] of it themselves.
pub fn plan_rebalance(counts: &[usize]) -> Result<Option<RebalancePlan>, MeshError> {
    let nprocs = counts.len();
    let total: usize = counts.iter().sum();
    if total < nprocs {
        return Err(MeshError::InsufficientData {
            total,
            workers: nprocs,
        });
    }
    if counts.iter().all(|&n| n > 0) {
        return Ok(None);
    }

    let per = total / nprocs;
    let mut sends = vec![vec![0..0; nprocs]; nprocs];
    let holders: Vec<usize> = (0..nprocs).filter(|&w| counts[w] > 0).collect();

    if let [src] = holders[..] {
        for (dst, range) in sends[src].iter_mut().enumerate() {
            let start = dst * per;
            let end = if dst + 1 == nprocs { total } else { start + per };
            *range = start..end;
        }
        return Ok(Some(RebalancePlan { sends }));
    }

    let min_cells = ((MIN_SHARE_FRACTION * per as f64) as usize).max(1);
    let mut order: Vec<usize> = (0..nprocs).collect();
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]).then(a.cmp(&b)));
    let mut has = counts.to_vec();
    let mut given = vec![0usize; nprocs];

    let (mut producer, mut consumer) = (0, nprocs - 1);
    while producer < consumer {
        let c = order[consumer];
        if counts[c] > 0 {
            break;
        }
        if has[c] >= min_cells {
            consumer -= 1;
            continue;
        }
        let p = order[producer];
        let spare = has[p].saturating_sub(min_cells);
        if spare == 0 {
            producer += 1;
            continue;
        }
        let n = spare.min(per - has[c]);
        sends[p][c] = given[p]..given[p] + n;
        given[p] += n;
        has[p] -= n;
        has[c] += n;
    }
    for &w in &holders {
        sends[w][w] = given[w]..counts[w];
    }
    Ok(Some(RebalancePlan { sends }))
}

/// Move cells to empty workers, or `None` when nobody is empty.
///
/// Every worker must call this. `InsufficientData` is returned on every
/// worker when there are fewer cells than workers.
pub fn rebalance<C: Communicator>(
    comm: &C,
    mesh: &UnstructuredMesh,
    rule: &MergeRule,
    strategy: TransferStrategy,
) -> Result<Option<UnstructuredMesh>, MeshError> {
    let counts = comm
        .world_group(CommTag::REBALANCE)
        .all_gather_counts(mesh.num_cells())?;
    let Some(plan) = plan_rebalance(&counts)? else {
        return Ok(None);
    };
    let me = comm.rank();
    log::debug!(
        "rank {me}: rebalancing {} cells to {}",
        mesh.num_cells(),
        plan.count_after(me)
    );
    exchange(
        comm,
        mesh,
        plan.transfers(me),
        rule,
        strategy,
        CommTag::REBALANCE.offset(4),
    )
    .map(Some)
}
