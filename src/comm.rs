//! Communication abstraction for intra-process (mailbox) and inter-process
//! (MPI) message passing.
//!
//! Wire format conventions:
//! - All control integers are LE fixed width (u32 counts, u64 gids).
//! - Field payloads travel as raw `f64` buffers through persistent channels.
//! - Receivers know exact lengths ahead of time; sizes are exchanged first
//!   wherever lengths are not implied by the plan.
//!
//! Two backends are provided: [`RayonComm`], a mailbox-backed communicator
//! that lets tests run P "ranks" as threads of one process, and [`MpiComm`]
//! (behind the `mpi-support` feature) for real distributed runs. [`NoComm`]
//! is a serial stub whose exchange channels only ever talk to rank 0 itself.

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::RemapError;

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Tag bundle for the remapper phases, assigned deterministic offsets from a
/// base. The gather slot consumes `base` and `base+1` (counts, then payload).
///
/// Concurrent remappers over the same communicator must use disjoint bases.
#[derive(Copy, Clone, Debug)]
pub struct RemapCommTags {
    /// All-gather collectives (owner lookups, peer discovery).
    pub gather: CommTag,
    /// Per-peer size exchange of the dual map.
    pub sizes: CommTag,
    /// Per-peer gid-list exchange of the dual map.
    pub gids: CommTag,
    /// Persistent field-payload channels.
    pub payload: CommTag,
}

impl RemapCommTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            gather: base,
            sizes: base.offset(2),
            gids: base.offset(3),
            payload: base.offset(4),
        }
    }
}

impl Default for RemapCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(40))
    }
}

/// Persistent outgoing channel to one peer, carrying a fixed-length `f64`
/// payload. Created once, started/waited once per remap call.
pub trait SendChannel: Send {
    fn peer(&self) -> usize;
    /// Stage `data` (whose length must match the channel) and post the send.
    fn start(&mut self, data: &[f64]) -> Result<(), RemapError>;
    /// Wait for the posted send to complete.
    fn wait(&mut self) -> Result<(), RemapError>;
}

/// Persistent incoming channel from one peer; dual of [`SendChannel`].
pub trait RecvChannel: Send {
    fn peer(&self) -> usize;
    /// Post the receive.
    fn start(&mut self) -> Result<(), RemapError>;
    /// Wait for the posted receive and copy the payload into `out`.
    fn wait(&mut self, out: &mut [f64]) -> Result<(), RemapError>;
}

/// Non-blocking communication interface (minimal by design), plus the
/// collectives and persistent channels the remapper needs.
///
/// The collectives have default pairwise implementations in terms of
/// `isend`/`irecv`; backends with native collectives override them.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;
    /// Persistent outgoing channel.
    type SendChannel: SendChannel;
    /// Persistent incoming channel.
    type RecvChannel: RecvChannel;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Returns true if this communicator is NoComm (for test logic).
    fn is_no_comm(&self) -> bool {
        false
    }

    /// Synchronization barrier (default: no-op for non-MPI comms).
    fn barrier(&self) {}

    /// Create a persistent send channel to `peer` for `len` reals.
    fn send_init(
        &self,
        peer: usize,
        tag: CommTag,
        len: usize,
    ) -> Result<Self::SendChannel, RemapError>;

    /// Create a persistent recv channel from `peer` for `len` reals.
    fn recv_init(
        &self,
        peer: usize,
        tag: CommTag,
        len: usize,
    ) -> Result<Self::RecvChannel, RemapError>;

    /// Gather one `u32` from every rank; result is indexed by rank.
    fn all_gather_u32(&self, mine: u32, tag: CommTag) -> Result<Vec<u32>, RemapError> {
        let size = self.size();
        let me = self.rank();
        let mut out = vec![0u32; size];
        out[me] = mine;

        let mut recvs = Vec::with_capacity(size.saturating_sub(1));
        for peer in 0..size {
            if peer == me {
                continue;
            }
            let mut template = [0u8; 4];
            recvs.push((peer, self.irecv(peer, tag.as_u16(), &mut template)));
        }
        let bytes = mine.to_le_bytes();
        let mut sends = Vec::with_capacity(size.saturating_sub(1));
        for peer in 0..size {
            if peer == me {
                continue;
            }
            sends.push(self.isend(peer, tag.as_u16(), &bytes));
        }
        for (peer, h) in recvs {
            let data = h.wait().ok_or_else(|| RemapError::CommError {
                neighbor: peer,
                msg: "count gather returned no data".into(),
            })?;
            if data.len() != 4 {
                return Err(RemapError::CommError {
                    neighbor: peer,
                    msg: format!("count gather: expected 4 bytes, got {}", data.len()),
                });
            }
            out[peer] = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        }
        for s in sends {
            let _ = s.wait();
        }
        Ok(out)
    }

    /// Gather a variable-length `u64` list from every rank; result is indexed
    /// by rank. Uses `tag` for the count phase and `tag+1` for the payload.
    fn all_gather_v_u64(&self, mine: &[u64], tag: CommTag) -> Result<Vec<Vec<u64>>, RemapError> {
        let size = self.size();
        let me = self.rank();
        let counts = self.all_gather_u32(mine.len() as u32, tag)?;
        let data_tag = tag.offset(1).as_u16();

        let mut recvs = Vec::with_capacity(size.saturating_sub(1));
        for peer in 0..size {
            if peer == me {
                continue;
            }
            let mut template = vec![0u8; counts[peer] as usize * 8];
            recvs.push((peer, self.irecv(peer, data_tag, &mut template)));
        }
        let mut bytes = Vec::with_capacity(mine.len() * 8);
        for g in mine {
            bytes.extend_from_slice(&g.to_le_bytes());
        }
        let mut sends = Vec::with_capacity(size.saturating_sub(1));
        for peer in 0..size {
            if peer == me {
                continue;
            }
            sends.push(self.isend(peer, data_tag, &bytes));
        }

        let mut out = vec![Vec::new(); size];
        out[me] = mine.to_vec();
        for (peer, h) in recvs {
            let data = h.wait().ok_or_else(|| RemapError::CommError {
                neighbor: peer,
                msg: "list gather returned no data".into(),
            })?;
            let expected = counts[peer] as usize * 8;
            if data.len() != expected {
                return Err(RemapError::CommError {
                    neighbor: peer,
                    msg: format!("list gather: expected {expected} bytes, got {}", data.len()),
                });
            }
            out[peer] = data
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                .collect();
        }
        for s in sends {
            let _ = s.wait();
        }
        Ok(out)
    }
}

/// Compile-time no-op comm for pure serial unit tests.
///
/// `isend`/`irecv` are inert, but exchange channels to rank 0 (self) are
/// functional via the process-local mailbox, so single-rank remaps work
/// without a parallel backend.
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
    type SendChannel = LocalSendChannel;
    type RecvChannel = LocalRecvChannel;

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn is_no_comm(&self) -> bool {
        true
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send_init(
        &self,
        peer: usize,
        tag: CommTag,
        len: usize,
    ) -> Result<LocalSendChannel, RemapError> {
        if peer != 0 {
            return Err(RemapError::CommError {
                neighbor: peer,
                msg: "NoComm can only exchange with rank 0".into(),
            });
        }
        Ok(LocalSendChannel::new((0, 0, tag.as_u16()), len))
    }

    fn recv_init(
        &self,
        peer: usize,
        tag: CommTag,
        len: usize,
    ) -> Result<LocalRecvChannel, RemapError> {
        if peer != 0 {
            return Err(RemapError::CommError {
                neighbor: peer,
                msg: "NoComm can only exchange with rank 0".into(),
            });
        }
        Ok(LocalRecvChannel::new((0, 0, tag.as_u16()), 0, len))
    }
}

// --- Mailbox: process-local message queues keyed by (src, dst, tag) ---

type Key = (usize, usize, u16);

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

struct Mailbox {
    map: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
}

static MAILBOX: Lazy<Mailbox> = Lazy::new(|| Mailbox {
    map: Mutex::new(HashMap::new()),
});

fn mailbox_entry(key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
    let mut g = MAILBOX.map.lock().expect("MAILBOX poisoned");
    g.entry(key)
        .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
        .clone()
}

pub struct LocalSendHandle;

impl Wait for LocalSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct LocalRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    want_len: usize,
}

impl Wait for LocalRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("Slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("Condvar poisoned");
        }
        let mut msg = slot.q.pop_front().expect("q non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

/// Persistent mailbox-backed send channel.
pub struct LocalSendChannel {
    key: Key,
    len: usize,
}

impl LocalSendChannel {
    fn new(key: Key, len: usize) -> Self {
        Self { key, len }
    }
}

impl SendChannel for LocalSendChannel {
    fn peer(&self) -> usize {
        self.key.1
    }

    fn start(&mut self, data: &[f64]) -> Result<(), RemapError> {
        if data.len() != self.len {
            return Err(RemapError::SizeMismatch {
                context: "persistent send payload",
                expected: self.len,
                got: data.len(),
            });
        }
        let entry = mailbox_entry(self.key);
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("Slot poisoned");
            slot.q.push_back(bytemuck::cast_slice(data).to_vec());
        }
        cv.notify_all();
        Ok(())
    }

    fn wait(&mut self) -> Result<(), RemapError> {
        Ok(())
    }
}

/// Persistent mailbox-backed recv channel.
pub struct LocalRecvChannel {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    peer: usize,
    len: usize,
}

impl LocalRecvChannel {
    fn new(key: Key, peer: usize, len: usize) -> Self {
        Self {
            cell: mailbox_entry(key),
            peer,
            len,
        }
    }
}

impl RecvChannel for LocalRecvChannel {
    fn peer(&self) -> usize {
        self.peer
    }

    fn start(&mut self) -> Result<(), RemapError> {
        // The mailbox buffers eagerly; nothing to post.
        Ok(())
    }

    fn wait(&mut self, out: &mut [f64]) -> Result<(), RemapError> {
        if out.len() != self.len {
            return Err(RemapError::SizeMismatch {
                context: "persistent recv payload",
                expected: self.len,
                got: out.len(),
            });
        }
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("Slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("Condvar poisoned");
        }
        let msg = slot.q.pop_front().expect("q non-empty");
        if msg.len() != self.len * std::mem::size_of::<f64>() {
            return Err(RemapError::CommError {
                neighbor: self.peer,
                msg: format!(
                    "persistent recv: expected {} bytes, got {}",
                    self.len * std::mem::size_of::<f64>(),
                    msg.len()
                ),
            });
        }
        bytemuck::cast_slice_mut(out).copy_from_slice(&msg);
        Ok(())
    }
}

/// Intra-process communicator: each "rank" is a thread, messages flow through
/// the process-local mailbox. The workhorse for multi-rank tests.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
}

impl RayonComm {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }
}

impl Communicator for RayonComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;
    type SendChannel = LocalSendChannel;
    type RecvChannel = LocalRecvChannel;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        let entry = mailbox_entry(key);
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("Slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        LocalSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        let key = (peer, self.rank, tag);
        LocalRecvHandle {
            cell: mailbox_entry(key),
            want_len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_init(
        &self,
        peer: usize,
        tag: CommTag,
        len: usize,
    ) -> Result<LocalSendChannel, RemapError> {
        Ok(LocalSendChannel::new((self.rank, peer, tag.as_u16()), len))
    }

    fn recv_init(
        &self,
        peer: usize,
        tag: CommTag,
        len: usize,
    ) -> Result<LocalRecvChannel, RemapError> {
        Ok(LocalRecvChannel::new(
            (peer, self.rank, tag.as_u16()),
            peer,
            len,
        ))
    }
}

// --- MPI backend ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use core::ptr::NonNull;
    use mpi::collective::CommunicatorCollectives;
    use mpi::datatype::PartitionMut;
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::raw::AsRaw;
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    pub struct MpiComm {
        _universe: Universe,
        pub world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        fn default() -> Self {
            let uni = mpi::initialize().expect("MPI initialization failed");
            let world = uni.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: uni,
                world,
                rank,
                size,
            }
        }
    }

    fn check(op: &'static str, ierr: i32) -> Result<(), RemapError> {
        if ierr == mpi::ffi::MPI_SUCCESS as i32 {
            Ok(())
        } else {
            Err(RemapError::MpiFailure { op, code: ierr })
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;
        type SendChannel = MpiSendChannel;
        type RecvChannel = MpiRecvChannel;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            use mpi::request::StaticScope;
            let boxed = buf.to_vec().into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &[u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, tag as i32);
            MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, template: &mut [u8]) -> Self::RecvHandle {
            use mpi::request::StaticScope;
            let len = template.len();
            let boxed = vec![0u8; len].into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice_mut: &mut [u8] = unsafe { &mut *raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, slice_mut, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
                len,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn send_init(
            &self,
            peer: usize,
            tag: CommTag,
            len: usize,
        ) -> Result<MpiSendChannel, RemapError> {
            let buf = vec![0f64; len].into_boxed_slice();
            let mut req: mpi::ffi::MPI_Request = unsafe { mpi::ffi::RSMPI_REQUEST_NULL };
            let ierr = unsafe {
                mpi::ffi::MPI_Send_init(
                    buf.as_ptr() as *const _,
                    len as i32,
                    mpi::ffi::RSMPI_DOUBLE,
                    peer as i32,
                    tag.as_u16() as i32,
                    self.world.as_raw(),
                    &mut req,
                )
            };
            check("MPI_Send_init", ierr)?;
            Ok(MpiSendChannel { req, buf, peer })
        }

        fn recv_init(
            &self,
            peer: usize,
            tag: CommTag,
            len: usize,
        ) -> Result<MpiRecvChannel, RemapError> {
            let mut buf = vec![0f64; len].into_boxed_slice();
            let mut req: mpi::ffi::MPI_Request = unsafe { mpi::ffi::RSMPI_REQUEST_NULL };
            let ierr = unsafe {
                mpi::ffi::MPI_Recv_init(
                    buf.as_mut_ptr() as *mut _,
                    len as i32,
                    mpi::ffi::RSMPI_DOUBLE,
                    peer as i32,
                    tag.as_u16() as i32,
                    self.world.as_raw(),
                    &mut req,
                )
            };
            check("MPI_Recv_init", ierr)?;
            Ok(MpiRecvChannel { req, buf, peer })
        }

        fn all_gather_u32(&self, mine: u32, _tag: CommTag) -> Result<Vec<u32>, RemapError> {
            let mut out = vec![0u32; self.size];
            self.world.all_gather_into(&mine, &mut out[..]);
            Ok(out)
        }

        fn all_gather_v_u64(
            &self,
            mine: &[u64],
            tag: CommTag,
        ) -> Result<Vec<Vec<u64>>, RemapError> {
            let counts_u32 = self.all_gather_u32(mine.len() as u32, tag)?;
            let counts: Vec<mpi::Count> = counts_u32.iter().map(|&c| c as mpi::Count).collect();
            let displs: Vec<mpi::Count> = counts
                .iter()
                .scan(0, |acc, &c| {
                    let d = *acc;
                    *acc += c;
                    Some(d)
                })
                .collect();
            let total: usize = counts_u32.iter().map(|&c| c as usize).sum();
            let mut flat = vec![0u64; total];
            {
                let mut partition = PartitionMut::new(&mut flat[..], &counts[..], &displs[..]);
                self.world.all_gather_varcount_into(mine, &mut partition);
            }
            let mut out = Vec::with_capacity(self.size);
            let mut pos = 0usize;
            for &c in &counts_u32 {
                let c = c as usize;
                out.push(flat[pos..pos + c].to_vec());
                pos += c;
            }
            Ok(out)
        }
    }

    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.test();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }

    pub struct MpiRecvHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
        len: usize,
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            let ptr = self.buf.take().expect("buffer missing");
            let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
            let mut v = Vec::from(boxed);
            v.truncate(self.len);
            Some(v)
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.test();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }

    /// Persistent `MPI_Send_init` channel with a pinned mirror buffer.
    ///
    /// The request is created once and freed only on drop; `start` stages the
    /// payload into the mirror buffer before `MPI_Start`, so callers are free
    /// to reuse their own buffers between calls.
    pub struct MpiSendChannel {
        req: mpi::ffi::MPI_Request,
        buf: Box<[f64]>,
        peer: usize,
    }

    unsafe impl Send for MpiSendChannel {}

    impl SendChannel for MpiSendChannel {
        fn peer(&self) -> usize {
            self.peer
        }

        fn start(&mut self, data: &[f64]) -> Result<(), RemapError> {
            if data.len() != self.buf.len() {
                return Err(RemapError::SizeMismatch {
                    context: "persistent send payload",
                    expected: self.buf.len(),
                    got: data.len(),
                });
            }
            self.buf.copy_from_slice(data);
            let ierr = unsafe { mpi::ffi::MPI_Start(&mut self.req) };
            check("MPI_Start", ierr)
        }

        fn wait(&mut self) -> Result<(), RemapError> {
            let ierr =
                unsafe { mpi::ffi::MPI_Wait(&mut self.req, mpi::ffi::RSMPI_STATUS_IGNORE) };
            check("MPI_Wait", ierr)
        }
    }

    impl Drop for MpiSendChannel {
        fn drop(&mut self) {
            unsafe {
                if self.req != mpi::ffi::RSMPI_REQUEST_NULL {
                    let _ = mpi::ffi::MPI_Request_free(&mut self.req);
                }
            }
        }
    }

    /// Persistent `MPI_Recv_init` channel; dual of [`MpiSendChannel`].
    pub struct MpiRecvChannel {
        req: mpi::ffi::MPI_Request,
        buf: Box<[f64]>,
        peer: usize,
    }

    unsafe impl Send for MpiRecvChannel {}

    impl RecvChannel for MpiRecvChannel {
        fn peer(&self) -> usize {
            self.peer
        }

        fn start(&mut self) -> Result<(), RemapError> {
            let ierr = unsafe { mpi::ffi::MPI_Start(&mut self.req) };
            check("MPI_Start", ierr)
        }

        fn wait(&mut self, out: &mut [f64]) -> Result<(), RemapError> {
            if out.len() != self.buf.len() {
                return Err(RemapError::SizeMismatch {
                    context: "persistent recv payload",
                    expected: self.buf.len(),
                    got: out.len(),
                });
            }
            let ierr =
                unsafe { mpi::ffi::MPI_Wait(&mut self.req, mpi::ffi::RSMPI_STATUS_IGNORE) };
            check("MPI_Wait", ierr)?;
            out.copy_from_slice(&self.buf);
            Ok(())
        }
    }

    impl Drop for MpiRecvChannel {
        fn drop(&mut self) {
            unsafe {
                if self.req != mpi::ffi::RSMPI_REQUEST_NULL {
                    let _ = mpi::ffi::MPI_Request_free(&mut self.req);
                }
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod layout_tests {
    use super::*;
    use static_assertions::assert_eq_size;

    // Tags travel inside message keys and on the wire as raw u16.
    assert_eq_size!(CommTag, u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_offset_wraps() {
        let t = CommTag::new(u16::MAX);
        assert_eq!(t.offset(1).as_u16(), 0);
        let tags = RemapCommTags::from_base(CommTag::new(100));
        assert_eq!(tags.gather.as_u16(), 100);
        assert_eq!(tags.sizes.as_u16(), 102);
        assert_eq!(tags.gids.as_u16(), 103);
        assert_eq!(tags.payload.as_u16(), 104);
    }

    #[test]
    fn no_comm_gathers_own_data() {
        let comm = NoComm;
        assert!(comm.is_no_comm());
        assert_eq!(comm.all_gather_u32(7, CommTag::new(800)).unwrap(), vec![7]);
        assert_eq!(
            comm.all_gather_v_u64(&[1, 2, 3], CommTag::new(801)).unwrap(),
            vec![vec![1, 2, 3]]
        );
    }

    #[test]
    fn no_comm_self_channels_roundtrip() {
        let comm = NoComm;
        let mut tx = comm.send_init(0, CommTag::new(810), 3).unwrap();
        let mut rx = comm.recv_init(0, CommTag::new(810), 3).unwrap();
        rx.start().unwrap();
        tx.start(&[1.0, 2.0, 3.0]).unwrap();
        let mut out = [0.0; 3];
        rx.wait(&mut out).unwrap();
        tx.wait().unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn rayon_comm_channels_cross_ranks() {
        let t0 = std::thread::spawn(|| {
            let comm = RayonComm::new(0, 2);
            let mut tx = comm.send_init(1, CommTag::new(820), 2).unwrap();
            let mut rx = comm.recv_init(1, CommTag::new(820), 2).unwrap();
            rx.start().unwrap();
            tx.start(&[0.5, 1.5]).unwrap();
            let mut out = [0.0; 2];
            rx.wait(&mut out).unwrap();
            tx.wait().unwrap();
            out
        });
        let t1 = std::thread::spawn(|| {
            let comm = RayonComm::new(1, 2);
            let mut tx = comm.send_init(0, CommTag::new(820), 2).unwrap();
            let mut rx = comm.recv_init(0, CommTag::new(820), 2).unwrap();
            rx.start().unwrap();
            tx.start(&[2.5, 3.5]).unwrap();
            let mut out = [0.0; 2];
            rx.wait(&mut out).unwrap();
            tx.wait().unwrap();
            out
        });
        assert_eq!(t0.join().unwrap(), [2.5, 3.5]);
        assert_eq!(t1.join().unwrap(), [0.5, 1.5]);
    }

    #[test]
    fn rayon_comm_all_gather_three_ranks() {
        let handles: Vec<_> = (0..3)
            .map(|r| {
                std::thread::spawn(move || {
                    let comm = RayonComm::new(r, 3);
                    let counts = comm
                        .all_gather_u32(10 + r as u32, CommTag::new(830))
                        .unwrap();
                    let lists = comm
                        .all_gather_v_u64(&vec![r as u64; r + 1], CommTag::new(832))
                        .unwrap();
                    (counts, lists)
                })
            })
            .collect();
        for h in handles {
            let (counts, lists) = h.join().unwrap();
            assert_eq!(counts, vec![10, 11, 12]);
            assert_eq!(lists, vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
        }
    }
}
