#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use mesh_redistribute::algs::communicator::{Communicator, RayonComm};
use mesh_redistribute::data::attributes::DataArray;
use mesh_redistribute::data::mesh::UnstructuredMesh;
use mesh_redistribute::topology::cell_type::CellType;

/// Run `f` on every rank of a private `n`-rank world; results in rank order.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(RayonComm) -> T + Sync,
{
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = RayonComm::world(n)
            .into_iter()
            .map(|c| s.spawn(move || f(c)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Counts the messages a rank posts and waits for.
#[derive(Debug)]
pub struct CountingComm<C> {
    inner: C,
    sends: AtomicUsize,
    recvs: AtomicUsize,
}

impl<C: Communicator> CountingComm<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            sends: AtomicUsize::new(0),
            recvs: AtomicUsize::new(0),
        }
    }

    /// Sends and receives posted so far.
    pub fn messages(&self) -> usize {
        self.sends.load(Ordering::SeqCst) + self.recvs.load(Ordering::SeqCst)
    }
}

impl<C: Communicator> Communicator for CountingComm<C> {
    type SendHandle = C::SendHandle;
    type RecvHandle = C::RecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.inner.isend(peer, tag, buf)
    }

    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle {
        self.recvs.fetch_add(1, Ordering::SeqCst);
        self.inner.irecv(peer, tag)
    }

    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

/// Index of unit cell `(i, j, k)` in an `n`-cube grid, x fastest.
pub fn cell_index(n: usize, i: usize, j: usize, k: usize) -> usize {
    (k * n + j) * n + i
}

/// The cells of an `n`-cube grid of unit hexahedra that `keep` selects,
/// with only the points they use. Cells carry their grid index in `cell_id`.
pub fn hex_grid(n: usize, keep: impl Fn(usize) -> bool) -> UnstructuredMesh {
    let mut m = UnstructuredMesh::new();
    let mut local: HashMap<(usize, usize, usize), usize> = HashMap::new();
    let mut ids = Vec::new();
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                let c = cell_index(n, i, j, k);
                if !keep(c) {
                    continue;
                }
                let corners = [
                    (i, j, k),
                    (i + 1, j, k),
                    (i + 1, j + 1, k),
                    (i, j + 1, k),
                    (i, j, k + 1),
                    (i + 1, j, k + 1),
                    (i + 1, j + 1, k + 1),
                    (i, j + 1, k + 1),
                ];
                let pts: Vec<usize> = corners
                    .iter()
                    .map(|&(x, y, z)| {
                        *local
                            .entry((x, y, z))
                            .or_insert_with(|| m.add_point([x as f64, y as f64, z as f64]))
                    })
                    .collect();
                m.add_cell(CellType::Hexahedron, &pts).unwrap();
                ids.push(c as i64);
            }
        }
    }
    m.set_cell_array("cell_id", DataArray::scalar_i64(ids)).unwrap();
    m
}

/// Unit-section hexahedra spanning `[lo, hi]` along x, one per pair.
pub fn bricks(spans: &[(f64, f64)]) -> UnstructuredMesh {
    let mut m = UnstructuredMesh::new();
    for &(lo, hi) in spans {
        let base = m.num_points();
        for z in [0.0, 1.0] {
            m.add_point([lo, 0.0, z]);
            m.add_point([hi, 0.0, z]);
            m.add_point([hi, 1.0, z]);
            m.add_point([lo, 1.0, z]);
        }
        let pts: Vec<usize> = (base..base + 8).collect();
        m.add_cell(CellType::Hexahedron, &pts).unwrap();
    }
    m
}

/// Sum of cell volumes.
pub fn volume(m: &UnstructuredMesh) -> f64 {
    (0..m.num_cells()).map(|c| m.cell_volume(c).unwrap()).sum()
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Copy + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort_unstable();
    let mut b = want.to_vec();
    b.sort_unstable();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}
