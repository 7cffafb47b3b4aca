//! All-to-all exchange of variable-length payloads.
//!
//! Stage 1 exchanges payload lengths with every peer, stage 2 ships only the
//! non-empty payloads. Peers are visited on a fixed round-robin schedule:
//! in round `i` rank `me` sends to `(me + i) % P` and receives from
//! `(me + P - i) % P`, so every pair meets exactly once. Whether the rounds
//! run one at a time or all at once is a [`TransferStrategy`]; the result is
//! the same. Every send handle is drained before returning, even on error.

use serde::{Deserialize, Serialize};

use crate::algs::communicator::{Communicator, ExchangeTags, Wait};
use crate::algs::wire::{WireCount, cast_slice, decode_one};
use crate::mesh_error::MeshError;

/// How the pairwise rounds of an exchange are scheduled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStrategy {
    /// One partner pair in flight at a time; a round's receives complete
    /// before the next round's sends are posted.
    #[default]
    Lean,
    /// Every send and receive posted up front, then waited.
    Fast,
}

/// Round-robin partner schedule for one rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairwiseSchedule {
    /// `targets[i - 1]` is the rank sent to in round `i`.
    pub targets: Vec<usize>,
    /// `sources[i - 1]` is the rank received from in round `i`.
    pub sources: Vec<usize>,
}

impl PairwiseSchedule {
    pub fn new(me: usize, nprocs: usize) -> Self {
        let targets = (1..nprocs).map(|i| (me + i) % nprocs).collect();
        let sources = (1..nprocs).map(|i| (me + nprocs - i) % nprocs).collect();
        Self { targets, sources }
    }

    pub fn rounds(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.targets.iter().copied().zip(self.sources.iter().copied())
    }
}

/// Ship `outgoing[r]` to every rank `r` and return what each rank sent here.
///
/// `outgoing` must have one entry per rank; the entry for this rank is moved
/// straight to the result.
pub fn exchange_payloads<C>(
    comm: &C,
    mut outgoing: Vec<Vec<u8>>,
    tags: ExchangeTags,
    strategy: TransferStrategy,
) -> Result<Vec<Vec<u8>>, MeshError>
where
    C: Communicator,
{
    let nprocs = comm.size();
    let me = comm.rank();
    if outgoing.len() != nprocs {
        return Err(MeshError::Configuration(format!(
            "exchange needs {nprocs} outgoing buffers, got {}",
            outgoing.len()
        )));
    }
    let mut incoming = vec![Vec::new(); nprocs];
    incoming[me] = std::mem::take(&mut outgoing[me]);
    if nprocs == 1 {
        return Ok(incoming);
    }

    let schedule = PairwiseSchedule::new(me, nprocs);
    let result = match strategy {
        TransferStrategy::Lean => lean_rounds(comm, &outgoing, &mut incoming, &schedule, tags),
        TransferStrategy::Fast => fast_rounds(comm, &outgoing, &mut incoming, &schedule, tags),
    };
    result.map(|()| incoming)
}

fn recv_len<C: Communicator>(h: C::RecvHandle, peer: usize) -> Result<usize, MeshError> {
    match h.wait() {
        Some(data) => Ok(decode_one::<WireCount>(&data, peer)?.get()),
        None => Err(MeshError::CommError {
            neighbor: peer,
            source: format!("failed to receive size from rank {peer}").into(),
        }),
    }
}

fn recv_payload<C: Communicator>(
    h: C::RecvHandle,
    peer: usize,
    expected: usize,
) -> Result<Vec<u8>, MeshError> {
    match h.wait() {
        Some(data) if data.len() == expected => Ok(data),
        Some(data) => Err(MeshError::BufferSizeMismatch {
            neighbor: peer,
            expected,
            got: data.len(),
        }),
        None => Err(MeshError::CommError {
            neighbor: peer,
            source: format!("failed to receive {expected} bytes from rank {peer}").into(),
        }),
    }
}

fn lean_rounds<C: Communicator>(
    comm: &C,
    outgoing: &[Vec<u8>],
    incoming: &mut [Vec<u8>],
    schedule: &PairwiseSchedule,
    tags: ExchangeTags,
) -> Result<(), MeshError> {
    let mut maybe_err = None;
    for (target, source) in schedule.rounds() {
        let out = &outgoing[target];
        let size_send = comm.isend(
            target,
            tags.sizes.as_u16(),
            cast_slice(&[WireCount::new(out.len())]),
        );
        let expected = recv_len::<C>(comm.irecv(source, tags.sizes.as_u16()), source);

        let data_send = (!out.is_empty()).then(|| comm.isend(target, tags.data.as_u16(), out));
        match expected {
            Ok(0) => {}
            Ok(n) => {
                match recv_payload::<C>(comm.irecv(source, tags.data.as_u16()), source, n) {
                    Ok(buf) => incoming[source] = buf,
                    Err(e) => {
                        maybe_err.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
        let _ = size_send.wait();
        if let Some(h) = data_send {
            let _ = h.wait();
        }
    }
    maybe_err.map_or(Ok(()), Err)
}

fn fast_rounds<C: Communicator>(
    comm: &C,
    outgoing: &[Vec<u8>],
    incoming: &mut [Vec<u8>],
    schedule: &PairwiseSchedule,
    tags: ExchangeTags,
) -> Result<(), MeshError> {
    // 1) every size out, then every size in
    let size_recvs: Vec<_> = schedule
        .sources
        .iter()
        .map(|&src| (src, comm.irecv(src, tags.sizes.as_u16())))
        .collect();
    let mut pending_sends: Vec<C::SendHandle> = schedule
        .targets
        .iter()
        .map(|&dst| {
            comm.isend(
                dst,
                tags.sizes.as_u16(),
                cast_slice(&[WireCount::new(outgoing[dst].len())]),
            )
        })
        .collect();

    let mut maybe_err = None;
    let mut expected = Vec::with_capacity(size_recvs.len());
    for (src, h) in size_recvs {
        match recv_len::<C>(h, src) {
            Ok(n) => expected.push((src, n)),
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }

    // 2) every payload out, then every payload in
    let data_recvs: Vec<_> = expected
        .into_iter()
        .filter(|&(_, n)| n > 0)
        .map(|(src, n)| (src, n, comm.irecv(src, tags.data.as_u16())))
        .collect();
    for &dst in &schedule.targets {
        if !outgoing[dst].is_empty() {
            pending_sends.push(comm.isend(dst, tags.data.as_u16(), &outgoing[dst]));
        }
    }
    for (src, n, h) in data_recvs {
        match recv_payload::<C>(h, src, n) {
            Ok(buf) => incoming[src] = buf,
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }

    // 3) always drain all send handles before returning
    for h in pending_sends {
        let _ = h.wait();
    }
    maybe_err.map_or(Ok(()), Err)
}
