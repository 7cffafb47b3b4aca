//! Distributed Floyd–Rivest selection over a sharded array of centroids.
//!
//! The array is conceptual: worker `p` holds global indices
//! `start[p]..start[p + 1]`, and those ranges never change. Partition rounds
//! move values between workers so that the lows of a range end up in its
//! low index sub-range, whoever holds it. Values live in two owned buffers;
//! a round reads from the active one, writes the next one, then flips.

use std::ops::Range;

use crate::algs::communicator::{Communicator, Wait};
use crate::algs::sub_group::{SubGroup, exclusive_prefix};
use crate::algs::wire::{WireCoord, WireSplit, cast_slice, decode_one, decode_records};
use crate::geometry::bounds::Bounds;
use crate::mesh_error::MeshError;

/// Above this range length a sample window is selected first.
const SAMPLE_THRESHOLD: usize = 600;

/// How a partition round chooses its pivot.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Pivot {
    /// The value currently at this global index; it lands on the returned index.
    AtIndex(usize),
    /// Values `< t` go low.
    Below(f64),
    /// Values `<= t` go low.
    AtMost(f64),
}

impl Pivot {
    fn goes_low(self, v: f64, t: f64) -> bool {
        match self {
            Pivot::AtMost(_) => v <= t,
            _ => v < t,
        }
    }
}

/// One contiguous piece of a transfer: `len` values from global index
/// `from` on worker `src` to global index `to` on worker `dst`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Segment {
    src: usize,
    dst: usize,
    from: usize,
    to: usize,
    len: usize,
}

/// The data movement of one partition round, identical on every member.
///
/// Lows from all members, in rank order, fill the range first; highs follow.
#[derive(Clone, Debug)]
struct TransferPlan {
    segments: Vec<Segment>,
    first_high: usize,
    /// Where each member's first high value lands, indexed by `rank - lo`.
    high_dest: Vec<usize>,
}

impl TransferPlan {
    fn new(l: usize, rank_lo: usize, parts: &[WireSplit]) -> Self {
        let lows: Vec<usize> = parts.iter().map(|p| p.split() - p.lo()).collect();
        let highs: Vec<usize> = parts.iter().map(|p| p.hi() - p.split()).collect();
        let low_at = exclusive_prefix(&lows);
        let high_at = exclusive_prefix(&highs);
        let total_low: usize = lows.iter().sum();
        let first_high = l + total_low;

        let mut segments = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let blocks = [
                (part.lo(), l + low_at[i], lows[i]),
                (part.split(), first_high + high_at[i], highs[i]),
            ];
            for (from, to, len) in blocks {
                if len == 0 {
                    continue;
                }
                for (j, window) in parts.iter().enumerate() {
                    let a = to.max(window.lo());
                    let b = (to + len).min(window.hi());
                    if a < b {
                        segments.push(Segment {
                            src: rank_lo + i,
                            dst: rank_lo + j,
                            from: from + (a - to),
                            to: a,
                            len: b - a,
                        });
                    }
                }
            }
        }
        let high_dest = high_at.iter().map(|h| first_high + h).collect();
        Self {
            segments,
            first_high,
            high_dest,
        }
    }

    fn between(&self, src: usize, dst: usize) -> impl Iterator<Item = &Segment> + '_ {
        self.segments
            .iter()
            .filter(move |s| s.src == src && s.dst == dst)
    }
}

/// This worker's slice of the conceptual array, double buffered.
#[derive(Clone, Debug)]
pub struct SelectionBuffers {
    bufs: [Vec<[f64; 3]>; 2],
    active: usize,
    start: Vec<usize>,
    me: usize,
}

impl SelectionBuffers {
    /// Lay out every worker's `points` end to end, in rank order.
    /// `world` must span every rank of its communicator.
    pub fn new<C: Communicator>(
        world: &SubGroup<'_, C>,
        points: &[[f64; 3]],
    ) -> Result<Self, MeshError> {
        if world.lo() != 0 || world.len() != world.comm().size() {
            return Err(MeshError::Configuration(
                "selection buffers need the whole communicator".into(),
            ));
        }
        let counts = world.all_gather_counts(points.len())?;
        let mut start = exclusive_prefix(&counts);
        start.push(counts.iter().sum());
        let bufs = Self::allocate(points);
        let bufs = world.vote_result(bufs, "selection buffer allocation")?;
        Ok(Self {
            bufs,
            active: 0,
            start,
            me: world.rank(),
        })
    }

    fn allocate(points: &[[f64; 3]]) -> Result<[Vec<[f64; 3]>; 2], MeshError> {
        let mut a = Vec::new();
        let mut b = Vec::new();
        for v in [&mut a, &mut b] {
            v.try_reserve_exact(points.len()).map_err(|e| {
                MeshError::AllocationFailure(format!(
                    "{} centroids for selection: {e}",
                    points.len()
                ))
            })?;
        }
        a.extend_from_slice(points);
        b.extend_from_slice(points);
        Ok([a, b])
    }

    /// Total length of the conceptual array.
    pub fn total(&self) -> usize {
        self.start.last().copied().unwrap_or(0)
    }

    /// Global indices held here.
    pub fn local_range(&self) -> Range<usize> {
        self.start[self.me]..self.start[self.me + 1]
    }

    /// Worker holding global index `pos`. Empty workers are never returned.
    pub fn who_has(&self, pos: usize) -> usize {
        let nprocs = self.start.len() - 1;
        self.start[..nprocs].partition_point(|&s| s <= pos).saturating_sub(1)
    }

    /// The values held here, in global index order.
    pub fn values(&self) -> &[[f64; 3]] {
        &self.bufs[self.active]
    }

    /// This worker's part of `l..=r`, as global indices.
    fn window(&self, l: usize, r: usize) -> Range<usize> {
        let own = self.local_range();
        let a = own.start.max(l).min(own.end);
        let b = own.end.min(r + 1);
        a..b.max(a)
    }

    fn at(&self, pos: usize) -> [f64; 3] {
        self.bufs[self.active][pos - self.start[self.me]]
    }

    fn set(&mut self, pos: usize, v: [f64; 3]) {
        let off = self.start[self.me];
        self.bufs[self.active][pos - off] = v;
    }

    /// Tight box of the held values in `l..=r` (inverted if none).
    pub fn local_bounds(&self, l: usize, r: usize) -> Bounds {
        let w = self.window(l, r);
        let off = self.start[self.me];
        Bounds::from_points(&self.bufs[self.active][w.start - off..w.end - off])
    }

    /// Broadcast the value at `pos` from its holder.
    pub fn value_at<C: Communicator>(
        &self,
        g: &SubGroup<'_, C>,
        pos: usize,
    ) -> Result<[f64; 3], MeshError> {
        let owner = self.who_has(pos);
        let mine = if g.rank() == owner { self.at(pos) } else { [0.0; 3] };
        let bytes = g.broadcast(owner, cast_slice(&[WireCoord::new(mine)]))?;
        Ok(decode_one::<WireCoord>(&bytes, owner)?.get())
    }

    /// Rearrange `l..=r` about `pivot` along `dim`.
    ///
    /// Returns the first index of the high part; for [`Pivot::AtIndex`] the
    /// pivot value sits there. Every member of `g` must call this with the
    /// same arguments; workers holding none of the range only learn the
    /// result.
    pub fn partition_range<C: Communicator>(
        &mut self,
        g: &SubGroup<'_, C>,
        dim: usize,
        l: usize,
        r: usize,
        pivot: Pivot,
    ) -> Result<usize, MeshError> {
        let p1 = self.who_has(l);
        let p2 = self.who_has(r);
        let me = g.rank();
        let local = if me < p1 || me > p2 {
            0
        } else if p1 == p2 {
            self.partition_local(dim, l, r, pivot)
        } else {
            self.partition_spread(&g.restrict(p1, p2), dim, l, r, pivot)?
        };
        if g.len() == 1 {
            return Ok(local);
        }
        g.broadcast_count(p1, local)
    }

    /// Local rearrangement of `window` about `t`. With `pivot_at`, that
    /// element is moved to the returned split index.
    fn lomuto(
        &mut self,
        dim: usize,
        window: Range<usize>,
        t: f64,
        pivot: Pivot,
        pivot_at: Option<usize>,
    ) -> usize {
        let off = self.start[self.me];
        let buf = &mut self.bufs[self.active][window.start - off..window.end - off];
        match pivot_at {
            Some(k) => {
                buf.swap(0, k - window.start);
                let mut store = 0;
                for i in 1..buf.len() {
                    if pivot.goes_low(buf[i][dim], t) {
                        store += 1;
                        buf.swap(store, i);
                    }
                }
                buf.swap(0, store);
                window.start + store
            }
            None => {
                let mut store = 0;
                for i in 0..buf.len() {
                    if pivot.goes_low(buf[i][dim], t) {
                        buf.swap(store, i);
                        store += 1;
                    }
                }
                window.start + store
            }
        }
    }

    fn partition_local(&mut self, dim: usize, l: usize, r: usize, pivot: Pivot) -> usize {
        match pivot {
            Pivot::AtIndex(k) => {
                let t = self.at(k)[dim];
                self.lomuto(dim, l..r + 1, t, pivot, Some(k))
            }
            Pivot::Below(t) | Pivot::AtMost(t) => self.lomuto(dim, l..r + 1, t, pivot, None),
        }
    }

    fn partition_spread<C: Communicator>(
        &mut self,
        sg: &SubGroup<'_, C>,
        dim: usize,
        l: usize,
        r: usize,
        pivot: Pivot,
    ) -> Result<usize, MeshError> {
        let me = sg.rank();
        let (t, pivot_owner) = match pivot {
            Pivot::AtIndex(k) => {
                let owner = self.who_has(k);
                let mine = if me == owner { self.at(k)[dim] } else { 0.0 };
                (sg.broadcast_f64(owner, mine)?, Some((owner, k)))
            }
            Pivot::Below(t) | Pivot::AtMost(t) => (t, None),
        };

        let window = self.window(l, r);
        let split = match pivot_owner {
            Some((owner, k)) if owner == me => self.lomuto(dim, window.clone(), t, pivot, Some(k)),
            _ => self.lomuto(dim, window.clone(), t, pivot, None),
        };
        let parts: Vec<WireSplit> = sg
            .all_gather_records(&[WireSplit::new(window.start, window.end, split)])?
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.first().copied().ok_or(MeshError::BufferSizeMismatch {
                    neighbor: sg.lo() + i,
                    expected: std::mem::size_of::<WireSplit>(),
                    got: 0,
                })
            })
            .collect::<Result<_, _>>()?;

        let plan = TransferPlan::new(l, sg.lo(), &parts);
        self.apply(sg, &plan)?;

        if let Some((owner, _)) = pivot_owner {
            let dest = plan.high_dest[owner - sg.lo()];
            self.swap_global(sg, plan.first_high, dest)?;
        }
        Ok(plan.first_high)
    }

    /// Carry out `plan`: ship outgoing segments, copy local ones, receive
    /// incoming ones in rank order, then flip buffers.
    fn apply<C: Communicator>(
        &mut self,
        sg: &SubGroup<'_, C>,
        plan: &TransferPlan,
    ) -> Result<(), MeshError> {
        let me = sg.rank();
        let comm = sg.comm();
        let tag = sg.tag().as_u16();
        let (cur, nxt) = (self.active, 1 - self.active);
        let off = self.start[self.me];

        let [a, b] = &mut self.bufs;
        let (src, dst) = if cur == 0 { (&*a, b) } else { (&*b, a) };
        dst.clone_from(src);

        let mut pending = Vec::new();
        for peer in sg.members().filter(|&p| p != me) {
            let mut out = Vec::new();
            for seg in plan.between(me, peer) {
                out.extend(
                    src[seg.from - off..seg.from - off + seg.len]
                        .iter()
                        .map(|&p| WireCoord::new(p)),
                );
            }
            if !out.is_empty() {
                pending.push(comm.isend(peer, tag, cast_slice(&out)));
            }
        }
        for seg in plan.between(me, me) {
            dst[seg.to - off..seg.to - off + seg.len]
                .copy_from_slice(&src[seg.from - off..seg.from - off + seg.len]);
        }

        let mut maybe_err = None;
        for peer in sg.members().filter(|&p| p != me) {
            let segs: Vec<&Segment> = plan.between(peer, me).collect();
            if segs.is_empty() {
                continue;
            }
            let expected: usize = segs.iter().map(|s| s.len).sum();
            let got = comm
                .recv(peer, sg.tag())
                .and_then(|bytes| decode_records::<WireCoord>(&bytes, peer));
            match got {
                Ok(vals) if vals.len() == expected => {
                    let mut it = vals.iter();
                    for seg in segs {
                        for (slot, w) in dst[seg.to - off..seg.to - off + seg.len]
                            .iter_mut()
                            .zip(it.by_ref())
                        {
                            *slot = w.get();
                        }
                    }
                }
                Ok(vals) => {
                    maybe_err.get_or_insert(MeshError::BufferSizeMismatch {
                        neighbor: peer,
                        expected: expected * std::mem::size_of::<WireCoord>(),
                        got: vals.len() * std::mem::size_of::<WireCoord>(),
                    });
                }
                Err(e) => {
                    maybe_err.get_or_insert(e);
                }
            }
        }
        for h in pending {
            let _ = h.wait();
        }
        if let Some(e) = maybe_err {
            return Err(e);
        }
        self.active = nxt;
        Ok(())
    }

    /// Exchange the values at global indices `a` and `b`.
    fn swap_global<C: Communicator>(
        &mut self,
        sg: &SubGroup<'_, C>,
        a: usize,
        b: usize,
    ) -> Result<(), MeshError> {
        if a == b {
            return Ok(());
        }
        let (oa, ob) = (self.who_has(a), self.who_has(b));
        let me = sg.rank();
        if oa == ob {
            if me == oa {
                let (va, vb) = (self.at(a), self.at(b));
                self.set(a, vb);
                self.set(b, va);
            }
            return Ok(());
        }
        let (mine, peer) = if me == oa {
            (a, ob)
        } else if me == ob {
            (b, oa)
        } else {
            return Ok(());
        };
        let h = sg
            .comm()
            .isend(peer, sg.tag().as_u16(), cast_slice(&[WireCoord::new(self.at(mine))]));
        let got = sg.comm().recv(peer, sg.tag());
        let _ = h.wait();
        let theirs = decode_one::<WireCoord>(&got?, peer)?.get();
        self.set(mine, theirs);
        Ok(())
    }

    /// Put the element of rank `k` (within `l..=r`) at index `k`, lower
    /// values below it and higher values above it.
    pub fn floyd_rivest<C: Communicator>(
        &mut self,
        g: &SubGroup<'_, C>,
        dim: usize,
        mut l: usize,
        mut r: usize,
        k: usize,
    ) -> Result<(), MeshError> {
        while r > l {
            if r - l > SAMPLE_THRESHOLD {
                let n = (r - l + 1) as f64;
                let i = (k - l + 1) as f64;
                let z = n.ln();
                let s = 0.5 * (2.0 * z / 3.0).exp();
                let sign = if i < n / 2.0 { -1.0 } else { 1.0 };
                let sd = 0.5 * (z * s * (n - s) / n).sqrt() * sign;
                let k_f = k as f64;
                let new_l = (k_f - i * s / n + sd).floor().max(l as f64) as usize;
                let new_r = (k_f + (n - i) * s / n + sd).floor().min(r as f64) as usize;
                if new_l <= k && k <= new_r && (new_l, new_r) != (l, r) {
                    self.floyd_rivest(g, dim, new_l, new_r, k)?;
                }
            }

            let t = self.value_at(g, k)?[dim];
            let j = self.partition_range(g, dim, l, r, Pivot::AtIndex(k))?;
            if j == k {
                break;
            }
            if j > k {
                r = j - 1;
                continue;
            }
            // Ties with the pivot sit right after it; skip them in one round.
            let m = self.partition_range(g, dim, j + 1, r, Pivot::AtMost(t))?;
            if k < m {
                break;
            }
            l = m;
        }
        Ok(())
    }

    /// Split `l..=r` near its middle along `dim`.
    ///
    /// Returns the first index of the high half: everything before it is
    /// strictly below everything from it on. `None` when all values up to
    /// the middle are equal, so no such index exists in the low half.
    pub fn select<C: Communicator>(
        &mut self,
        g: &SubGroup<'_, C>,
        dim: usize,
        l: usize,
        r: usize,
    ) -> Result<Option<usize>, MeshError> {
        if r <= l {
            return Ok(None);
        }
        let k = (l + r) / 2 + 1;
        self.floyd_rivest(g, dim, l, r, k)?;
        let kval = self.value_at(g, k)?[dim];
        let mid = self.partition_range(g, dim, l, k - 1, Pivot::Below(kval))?;
        Ok((mid > l).then_some(mid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{CommTag, NoComm, RayonComm};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
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

    fn shard(rank: usize, sizes: &[usize], seed: u64) -> Vec<[f64; 3]> {
        let mut rng = SmallRng::seed_from_u64(seed + rank as u64);
        (0..sizes[rank])
            .map(|_| [rng.gen_range(0..50) as f64, rng.r#gen::<f64>(), 0.0])
            .collect()
    }

    #[test]
    fn who_has_skips_empty_workers() {
        let b = SelectionBuffers {
            bufs: [Vec::new(), Vec::new()],
            active: 0,
            start: vec![0, 3, 3, 3, 7],
            me: 0,
        };
        assert_eq!(b.who_has(0), 0);
        assert_eq!(b.who_has(2), 0);
        assert_eq!(b.who_has(3), 3);
        assert_eq!(b.who_has(6), 3);
    }

    #[test]
    fn windows_outside_the_slice_are_empty() {
        let pts = vec![[1.0, 0.0, 0.0]; 5];
        let b = SelectionBuffers {
            bufs: [pts.clone(), pts],
            active: 0,
            start: vec![0, 5, 20],
            me: 0,
        };
        // the whole range lies right of this worker's slice
        assert!(b.window(10, 19).is_empty());
        assert!(b.local_bounds(10, 19).is_empty());
        assert_eq!(b.window(3, 12), 3..5);

        let right = SelectionBuffers { me: 1, ..b };
        assert!(right.window(0, 4).is_empty());
        assert!(right.local_bounds(0, 4).is_empty());
    }

    #[test]
    fn plan_fills_lows_then_highs() {
        // worker 0 holds [0,4) with 1 low, worker 1 holds [4,6) with 2 lows
        let parts = [WireSplit::new(0, 4, 1), WireSplit::new(4, 6, 6)];
        let plan = TransferPlan::new(0, 0, &parts);
        assert_eq!(plan.first_high, 3);
        assert_eq!(plan.high_dest, vec![3, 6]);
        let moved: usize = plan.segments.iter().map(|s| s.len).sum();
        assert_eq!(moved, 6);
        assert!(plan.between(1, 0).all(|s| s.to < 4));
    }

    #[test]
    fn single_worker_select_splits_strictly() {
        let comm = NoComm;
        let g = comm.world_group(CommTag::SELECT);
        let pts: Vec<[f64; 3]> = [5.0, 1.0, 3.0, 3.0, 9.0, 0.0]
            .iter()
            .map(|&x| [x, 0.0, 0.0])
            .collect();
        let mut b = SelectionBuffers::new(&g, &pts).unwrap();
        let mid = b.select(&g, 0, 0, 5).unwrap().unwrap();
        let v = b.values();
        let lo_max = v[..mid].iter().map(|p| p[0]).fold(f64::MIN, f64::max);
        let hi_min = v[mid..].iter().map(|p| p[0]).fold(f64::MAX, f64::min);
        assert!(lo_max < hi_min);
        assert_eq!(mid, 2);
    }

    #[test]
    fn all_equal_values_cannot_split() {
        let comm = NoComm;
        let g = comm.world_group(CommTag::SELECT);
        let pts = vec![[1.0, 0.0, 0.0]; 8];
        let mut b = SelectionBuffers::new(&g, &pts).unwrap();
        assert_eq!(b.select(&g, 0, 0, 7).unwrap(), None);
    }

    #[test]
    fn distributed_selection_matches_sorting() {
        let sizes = [300usize, 0, 700, 450];
        let out = on_ranks(sizes.len(), move |c| {
            let g = c.world_group(CommTag::SELECT);
            let pts = shard(c.rank(), &sizes, 17);
            let mut b = SelectionBuffers::new(&g, &pts).unwrap();
            let total = b.total();
            let k = 700;
            b.floyd_rivest(&g, 0, 0, total - 1, k).unwrap();
            let kval = b.value_at(&g, k).unwrap()[0];
            (b.local_range(), b.values().to_vec(), pts, kval)
        });

        let mut all_in: Vec<f64> = out.iter().flat_map(|o| o.2.iter().map(|p| p[0])).collect();
        all_in.sort_by(f64::total_cmp);
        let kval = out[0].3;
        assert_eq!(kval, all_in[700]);
        for (range, vals, _, _) in &out {
            assert_eq!(range.len(), vals.len());
            for (i, v) in range.clone().zip(vals) {
                if i < 700 {
                    assert!(v[0] <= kval);
                } else if i > 700 {
                    assert!(v[0] >= kval);
                }
            }
        }
        let mut all_out: Vec<f64> = out.iter().flat_map(|o| o.1.iter().map(|p| p[0])).collect();
        all_out.sort_by(f64::total_cmp);
        assert_eq!(all_in, all_out);
    }

    #[test]
    fn distributed_select_rolls_back_ties() {
        let sizes = [40usize, 25, 35];
        let out = on_ranks(3, move |c| {
            let g = c.world_group(CommTag::SELECT);
            let pts = shard(c.rank(), &sizes, 3);
            let mut b = SelectionBuffers::new(&g, &pts).unwrap();
            let total = b.total();
            let mid = b.select(&g, 0, 0, total - 1).unwrap();
            (mid, b.local_range(), b.values().to_vec())
        });
        let mid = out[0].0.unwrap();
        assert!(out.iter().all(|o| o.0 == Some(mid)));
        let mut lo_max = f64::MIN;
        let mut hi_min = f64::MAX;
        for (_, range, vals) in &out {
            for (i, v) in range.clone().zip(vals) {
                if i < mid {
                    lo_max = lo_max.max(v[0]);
                } else {
                    hi_min = hi_min.min(v[0]);
                }
            }
        }
        assert!(lo_max < hi_min);
    }
}
