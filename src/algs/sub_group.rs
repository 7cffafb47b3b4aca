//! Restricted views of a communicator over a contiguous rank range.
//!
//! A [`SubGroup`] is the `(lo, hi, tag)` triple the recursive selection and
//! the redistribution steps pass around instead of building new
//! communicators. All collectives here are built from point-to-point calls:
//! they must be entered by every member of the group, in the same order, and
//! by no one else.

use std::ops::RangeInclusive;

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, WireF64, cast_slice, decode_one, decode_records};
use crate::mesh_error::MeshError;

/// Ranks `lo..=hi` of `comm`, exchanging on `tag`.
pub struct SubGroup<'a, C: Communicator> {
    comm: &'a C,
    lo: usize,
    hi: usize,
    tag: CommTag,
}

impl<C: Communicator> Clone for SubGroup<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Communicator> Copy for SubGroup<'_, C> {}

impl<'a, C: Communicator> SubGroup<'a, C> {
    pub fn new(comm: &'a C, lo: usize, hi: usize, tag: CommTag) -> Self {
        Self { comm, lo, hi, tag }
    }

    pub fn comm(&self) -> &'a C {
        self.comm
    }
    pub fn lo(&self) -> usize {
        self.lo
    }
    pub fn hi(&self) -> usize {
        self.hi
    }
    pub fn tag(&self) -> CommTag {
        self.tag
    }
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }
    pub fn members(&self) -> RangeInclusive<usize> {
        self.lo..=self.hi
    }
    pub fn len(&self) -> usize {
        self.hi + 1 - self.lo
    }
    pub fn is_empty(&self) -> bool {
        false
    }
    pub fn contains(&self, rank: usize) -> bool {
        (self.lo..=self.hi).contains(&rank)
    }

    /// The same ranks on another tag.
    pub fn with_tag(&self, tag: CommTag) -> Self {
        Self { tag, ..*self }
    }

    /// A narrower view on the same tag.
    pub fn restrict(&self, lo: usize, hi: usize) -> Self {
        Self { lo, hi, ..*self }
    }

    fn check_member(&self) -> Result<(), MeshError> {
        if self.contains(self.rank()) {
            Ok(())
        } else {
            Err(MeshError::Configuration(format!(
                "rank {} entered a collective of ranks {}..={}",
                self.rank(),
                self.lo,
                self.hi
            )))
        }
    }

    /// Send `data` from `root` to every member; every member returns it.
    pub fn broadcast(&self, root: usize, data: &[u8]) -> Result<Vec<u8>, MeshError> {
        self.check_member()?;
        let me = self.rank();
        if me == root {
            let pending: Vec<_> = self
                .members()
                .filter(|&r| r != me)
                .map(|r| self.comm.isend(r, self.tag.as_u16(), data))
                .collect();
            for h in pending {
                let _ = h.wait();
            }
            Ok(data.to_vec())
        } else {
            self.comm.recv(root, self.tag)
        }
    }

    /// Broadcast one `f64`.
    pub fn broadcast_f64(&self, root: usize, v: f64) -> Result<f64, MeshError> {
        let bytes = self.broadcast(root, cast_slice(&[WireF64::new(v)]))?;
        Ok(decode_one::<WireF64>(&bytes, root)?.get())
    }

    /// Broadcast one count.
    pub fn broadcast_count(&self, root: usize, n: usize) -> Result<usize, MeshError> {
        let bytes = self.broadcast(root, cast_slice(&[WireCount::new(n)]))?;
        Ok(decode_one::<WireCount>(&bytes, root)?.get())
    }

    /// Every member's `data`, indexed by `rank - lo`.
    ///
    /// Posts every send first, then receives in rank order, then drains the
    /// send handles, so no member blocks on a peer that is itself sending.
    pub fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, MeshError> {
        self.check_member()?;
        let me = self.rank();
        let pending: Vec<_> = self
            .members()
            .filter(|&r| r != me)
            .map(|r| self.comm.isend(r, self.tag.as_u16(), data))
            .collect();

        let mut out = Vec::with_capacity(self.len());
        let mut maybe_err = None;
        for r in self.members() {
            if r == me {
                out.push(data.to_vec());
                continue;
            }
            match self.comm.recv(r, self.tag) {
                Ok(buf) => out.push(buf),
                Err(e) => {
                    out.push(Vec::new());
                    maybe_err.get_or_insert(e);
                }
            }
        }
        for h in pending {
            let _ = h.wait();
        }
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Typed [`all_gather`](Self::all_gather).
    pub fn all_gather_records<T: Pod>(&self, recs: &[T]) -> Result<Vec<Vec<T>>, MeshError> {
        let raw = self.all_gather(cast_slice(recs))?;
        raw.iter()
            .enumerate()
            .map(|(i, b)| decode_records::<T>(b, self.lo + i))
            .collect()
    }

    /// Every member's single count, indexed by `rank - lo`.
    pub fn all_gather_counts(&self, n: usize) -> Result<Vec<usize>, MeshError> {
        Ok(self
            .all_gather_records(&[WireCount::new(n)])?
            .into_iter()
            .map(|v| v.first().map_or(0, WireCount::get))
            .collect())
    }

    /// Collect every member's `data` at `root` (`None` elsewhere).
    pub fn gather(&self, root: usize, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>, MeshError> {
        self.check_member()?;
        let me = self.rank();
        if me != root {
            self.comm.send(root, self.tag, data);
            return Ok(None);
        }
        let mut out = Vec::with_capacity(self.len());
        for r in self.members() {
            if r == me {
                out.push(data.to_vec());
            } else {
                out.push(self.comm.recv(r, self.tag)?);
            }
        }
        Ok(Some(out))
    }

    fn all_reduce_f64(
        &self,
        vals: &[f64],
        fold: impl Fn(f64, f64) -> f64,
    ) -> Result<Vec<f64>, MeshError> {
        let recs: Vec<WireF64> = vals.iter().copied().map(WireF64::new).collect();
        let all = self.all_gather_records(&recs)?;
        let mut out = vals.to_vec();
        for (i, theirs) in all.iter().enumerate() {
            if self.lo + i == self.rank() {
                continue;
            }
            if theirs.len() != vals.len() {
                return Err(MeshError::BufferSizeMismatch {
                    neighbor: self.lo + i,
                    expected: vals.len() * std::mem::size_of::<WireF64>(),
                    got: theirs.len() * std::mem::size_of::<WireF64>(),
                });
            }
            for (o, w) in out.iter_mut().zip(theirs) {
                *o = fold(*o, w.get());
            }
        }
        Ok(out)
    }

    /// Element-wise minimum over members.
    pub fn all_reduce_min(&self, vals: &[f64]) -> Result<Vec<f64>, MeshError> {
        self.all_reduce_f64(vals, f64::min)
    }

    /// Element-wise maximum over members.
    pub fn all_reduce_max(&self, vals: &[f64]) -> Result<Vec<f64>, MeshError> {
        self.all_reduce_f64(vals, f64::max)
    }

    /// Sum of one count over members.
    pub fn all_reduce_sum(&self, n: usize) -> Result<usize, MeshError> {
        Ok(self.all_gather_counts(n)?.into_iter().sum())
    }

    /// Maximum of one count over members.
    pub fn all_reduce_max_count(&self, n: usize) -> Result<usize, MeshError> {
        Ok(self.all_gather_counts(n)?.into_iter().max().unwrap_or(n))
    }

    /// True on every member if any member passes `failed = true`.
    pub fn all_vote(&self, failed: bool) -> Result<bool, MeshError> {
        Ok(self.all_gather_counts(usize::from(failed))?.into_iter().any(|v| v != 0))
    }

    /// Abort together: `Err` on every member if any member's `local` is `Err`.
    /// The failing member gets its own error back, the others a
    /// [`MeshError::RemoteFailure`] naming `stage`.
    pub fn vote_result<T>(
        &self,
        local: Result<T, MeshError>,
        stage: &'static str,
    ) -> Result<T, MeshError> {
        let any_failed = self.all_vote(local.is_err())?;
        match local {
            Err(e) => {
                log::error!("{stage} failed on rank {}: {e}", self.rank());
                Err(e)
            }
            Ok(v) if !any_failed => Ok(v),
            Ok(_) => {
                log::warn!("{stage} failed on a remote rank; rank {} aborts", self.rank());
                Err(MeshError::RemoteFailure { stage })
            }
        }
    }

    /// Block until every member arrives.
    pub fn barrier(&self) -> Result<(), MeshError> {
        self.all_gather(&[]).map(|_| ())
    }
}

/// Exclusive prefix sums of `counts` (`out[i] = counts[..i].sum()`).
pub fn exclusive_prefix(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0usize, |acc, &c| {
            let start = *acc;
            *acc += c;
            Some(start)
        })
        .collect()
}
