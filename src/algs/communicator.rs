//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees). Messages
//! between one `(src, dst, tag)` triple are delivered in posting order, which
//! is all the redistribution protocols rely on. All handles are **waitable**;
//! callers `.wait()` before they trust a received buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::algs::sub_group::SubGroup;
use crate::mesh_error::MeshError;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a send of `buf` to `peer`; the buffer is copied before returning.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive for the next message from `peer` on `tag`, of any length.
    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle;

    /// This worker's rank in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of workers.
    fn size(&self) -> usize;

    /// Blocking send.
    fn send(&self, peer: usize, tag: CommTag, buf: &[u8]) {
        let _ = self.isend(peer, tag.as_u16(), buf).wait();
    }

    /// Blocking receive; a lost message surfaces as [`MeshError::CommError`].
    fn recv(&self, peer: usize, tag: CommTag) -> Result<Vec<u8>, MeshError> {
        self.irecv(peer, tag.as_u16())
            .wait()
            .ok_or_else(|| MeshError::CommError {
                neighbor: peer,
                source: format!("no message from rank {peer} on tag {}", tag.as_u16()).into(),
            })
    }

    /// Restricted view over ranks `lo..=hi`, exchanging on `tag`.
    fn sub_group(&self, lo: usize, hi: usize, tag: CommTag) -> SubGroup<'_, Self>
    where
        Self: Sized,
    {
        SubGroup::new(self, lo, hi, tag)
    }

    /// View over every rank.
    fn world_group(&self, tag: CommTag) -> SubGroup<'_, Self>
    where
        Self: Sized,
    {
        SubGroup::new(self, 0, self.size().saturating_sub(1), tag)
    }

    /// Block until every rank reaches the barrier.
    fn barrier(&self)
    where
        Self: Sized,
    {
        let _ = self.world_group(CommTag::BARRIER).barrier();
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Typed message tag. Each protocol phase owns a distinct base tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(u16);

impl CommTag {
    pub const BARRIER: CommTag = CommTag(0x0100);
    pub const PARAMS: CommTag = CommTag(0x0200);
    pub const BOUNDS: CommTag = CommTag(0x0300);
    pub const SELECT: CommTag = CommTag(0x1000);
    pub const TREE: CommTag = CommTag(0x2000);
    pub const COUNTS: CommTag = CommTag(0x2100);
    pub const RANGES: CommTag = CommTag(0x2200);
    pub const REBALANCE: CommTag = CommTag(0x3000);
    pub const EXCHANGE: CommTag = CommTag(0x3100);
    pub const GLOBAL_IDS: CommTag = CommTag(0x4000);
    pub const GHOST: CommTag = CommTag(0x5000);
    pub const VOTE: CommTag = CommTag(0x6000);

    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Tag `n` steps above this one.
    pub const fn offset(self, n: u16) -> Self {
        CommTag(self.0.wrapping_add(n))
    }
}

/// Tags for a two-stage (sizes, then payload) exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExchangeTags {
    pub sizes: CommTag,
    pub data: CommTag,
}

impl ExchangeTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

/// Compile-time no-op comm for pure serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16) {}
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// How long an in-process receive may stall before it is reported lost.
const RECV_STALL_LIMIT: Duration = Duration::from_secs(120);

/// FIFO queues shared by every rank of one in-process world.
#[derive(Default)]
pub struct Mailbox {
    queues: Mutex<HashMap<Key, VecDeque<Bytes>>>,
    arrived: Condvar,
}

impl Mailbox {
    fn post(&self, key: Key, data: Bytes) {
        self.queues.lock().entry(key).or_default().push_back(data);
        self.arrived.notify_all();
    }

    fn take(&self, key: Key) -> Option<Bytes> {
        let deadline = Instant::now() + RECV_STALL_LIMIT;
        let mut queues = self.queues.lock();
        loop {
            if let Some(msg) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
                return Some(msg);
            }
            if self.arrived.wait_until(&mut queues, deadline).timed_out() {
                return queues.get_mut(&key).and_then(VecDeque::pop_front);
            }
        }
    }

    /// Messages posted but not yet received.
    pub fn pending(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }
}

static MAILBOX: Lazy<Arc<Mailbox>> = Lazy::new(|| Arc::new(Mailbox::default()));

/// Deferred receive; the mailbox is polled on `wait`.
pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        self.mailbox.take(self.key).map(|b| b.to_vec())
    }
}

/// One rank of a world whose ranks are threads of this process.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl RayonComm {
    /// Rank `rank` of the process-global world of `size` ranks.
    pub fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            mailbox: MAILBOX.clone(),
        }
    }

    /// A private world of `size` ranks; element `r` is rank `r`.
    pub fn world(size: usize) -> Vec<RayonComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                mailbox: mailbox.clone(),
            })
            .collect()
    }

    /// Shared mailbox of this rank's world.
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.mailbox
            .post((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle {
        LocalHandle {
            mailbox: self.mailbox.clone(),
            key: (peer, self.rank, tag),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI world communicator. The caller initialises MPI and keeps the
    /// `Universe` alive for as long as this value is used.
    #[derive(Clone, Debug)]
    pub struct MpiComm {
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Self {
            let world = SimpleCommunicator::world();
            Self {
                rank: world.rank() as usize,
                size: world.size() as usize,
            }
        }
    }

    impl Default for MpiComm {
        fn default() -> Self {
            Self::new()
        }
    }

    pub struct MpiSendHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            // SAFETY: `buf` was leaked from a Box in `isend` and the request
            // borrowing it has completed above.
            unsafe { drop(Box::from_raw(self.buf)) };
            None
        }
    }

    pub struct MpiRecvHandle {
        peer: i32,
        tag: i32,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let world = SimpleCommunicator::world();
            let (data, _status) = world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let world = SimpleCommunicator::world();
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr: *mut [u8] = leaked;
            let req = world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, &*leaked, i32::from(tag));
            MpiSendHandle {
                req: Some(req),
                buf: ptr,
            }
        }

        fn irecv(&self, peer: usize, tag: u16) -> MpiRecvHandle {
            MpiRecvHandle {
                peer: peer as i32,
                tag: i32::from(tag),
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self)
        where
            Self: Sized,
        {
            SimpleCommunicator::world().barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rayon_roundtrip_two_ranks() {
        let comm0 = RayonComm::new(0, 2);
        let comm1 = RayonComm::new(1, 2);

        let recv_handle = comm1.irecv(0, 7);
        comm0.isend(1, 7, &[1, 2, 3, 4]).wait();

        let data = recv_handle
            .wait()
            .expect("Expected to receive data from rank 0");
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn messages_on_one_tag_arrive_in_order() {
        let world = RayonComm::world(2);
        for i in 0..5u8 {
            world[0].isend(1, 3, &[i]);
        }
        for i in 0..5u8 {
            assert_eq!(world[1].irecv(0, 3).wait(), Some(vec![i]));
        }
        assert_eq!(world[0].mailbox().pending(), 0);
    }

    #[test]
    fn worlds_do_not_share_mailboxes() {
        let a = RayonComm::world(2);
        let b = RayonComm::world(2);
        a[0].isend(1, 9, &[1]);
        b[0].isend(1, 9, &[2]);
        assert_eq!(b[1].irecv(0, 9).wait(), Some(vec![2]));
        assert_eq!(a[1].irecv(0, 9).wait(), Some(vec![1]));
    }

    #[test]
    fn no_comm_is_a_single_rank() {
        let c = NoComm;
        assert_eq!((c.rank(), c.size()), (0, 1));
        assert!(c.irecv(0, 1).wait().is_none());
    }
}
