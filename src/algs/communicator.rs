//! Thin façade over in-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking: the star forest calls
//! `.wait()` inside its `*_end` routines before it trusts that a buffer is ready.
//!
//! Messages travelling on the same `(source, destination, tag)` channel never
//! overtake each other: the k-th receive posted on a channel matches the k-th
//! send, no matter in which order the receive handles are later waited on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

/// Non-blocking communication interface.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive for at most `len` bytes from `peer`.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn barrier(&self) {}

    fn is_no_comm(&self) -> bool {
        false
    }

    /// One-sided access, if the transport offers it.
    fn one_sided(&self) -> Option<&dyn OneSided> {
        None
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub const fn offset(self, by: u16) -> Self {
        Self(self.0.wrapping_add(by))
    }
}

/// The block of tags owned by one star forest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SfCommTags {
    pub setup: CommTag,
    pub bcast: CommTag,
    pub reduce: CommTag,
    pub fetch: CommTag,
    /// First of [`SfCommTags::FETCH_SLOTS`] reply channels.
    pub fetch_reply: CommTag,
    pub handshake: CommTag,
}

impl SfCommTags {
    /// Number of consecutive tags reserved per star forest.
    pub const SPAN: u16 = 16;
    /// Fetch-and-ops that may be in flight at once on one star forest.
    pub const FETCH_SLOTS: u16 = 8;

    pub const fn from_base(base: CommTag) -> Self {
        Self {
            setup: base,
            bcast: base.offset(1),
            reduce: base.offset(2),
            fetch: base.offset(3),
            handshake: base.offset(4),
            fetch_reply: base.offset(8),
        }
    }

    /// Reply channel of the fetch-and-op started `seq`-th on this star forest.
    pub const fn fetch_reply_slot(&self, seq: u64) -> CommTag {
        self.fetch_reply
            .offset((seq % Self::FETCH_SLOTS as u64) as u16)
    }
}

/// Identifies one exposure epoch of a one-sided window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub tag: u16,
    pub epoch: u64,
}

/// One-sided put-with-signal transport.
pub trait OneSided: Send + Sync {
    /// Write `data` at byte `offset` of `target`'s window `key` and raise one signal.
    fn put_signal(&self, target: usize, key: WindowKey, offset: usize, data: &[u8]);
    /// Block until `signals` puts have landed in this rank's window `key`,
    /// then release the window and return its first `len` bytes.
    fn wait_window(&self, key: WindowKey, signals: usize, len: usize) -> Vec<u8>;
}

/// Compile-time no-op comm for single-process runs.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- ThreadComm: in-process process group, one thread per rank ---
type Channel = (usize, usize, u16); // (src, dst, tag)
type MsgKey = (usize, usize, u16, u64); // channel + sequence number

#[derive(Default)]
struct WindowSlot {
    state: Mutex<(Vec<u8>, usize)>, // (bytes, signals)
    cond: Condvar,
}

struct Shared {
    size: usize,
    mailbox: DashMap<MsgKey, Bytes>,
    send_seq: DashMap<Channel, u64>,
    recv_seq: DashMap<Channel, u64>,
    bell: Mutex<()>,
    ring: Condvar,
    windows: DashMap<(usize, WindowKey), Arc<WindowSlot>>,
    barrier: std::sync::Barrier,
}

impl Shared {
    fn next_seq(map: &DashMap<Channel, u64>, ch: Channel) -> u64 {
        let mut e = map.entry(ch).or_insert(0);
        let seq = *e;
        *e += 1;
        seq
    }

    fn window(&self, rank: usize, key: WindowKey) -> Arc<WindowSlot> {
        Arc::clone(self.windows.entry((rank, key)).or_default().value())
    }
}

/// An explicit group of `size` ranks living in one process.
///
/// Replaces a process-wide mailbox: every world owns its own queues, so
/// independent worlds (for example concurrently running tests) never see
/// each other's traffic.
#[derive(Clone)]
pub struct ThreadWorld {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ThreadWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadWorld")
            .field("size", &self.shared.size)
            .finish()
    }
}

impl ThreadWorld {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a process group needs at least one rank");
        Self {
            shared: Arc::new(Shared {
                size,
                mailbox: DashMap::new(),
                send_seq: DashMap::new(),
                recv_seq: DashMap::new(),
                bell: Mutex::new(()),
                ring: Condvar::new(),
                windows: DashMap::new(),
                barrier: std::sync::Barrier::new(size),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Communicator for `rank`.
    pub fn comm(&self, rank: usize) -> ThreadComm {
        assert!(rank < self.shared.size, "rank {rank} outside world");
        ThreadComm {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run `f` on `size` threads, one per rank, and collect the results by rank.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm) -> R + Sync,
        R: Send,
    {
        let world = Self::new(size);
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let comm = world.comm(rank);
                    let f = &f;
                    s.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

pub struct ThreadRecv {
    key: MsgKey,
    len: usize,
    shared: Arc<Shared>,
}

impl Wait for ThreadRecv {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            if let Some((_, bytes)) = self.shared.mailbox.remove(&self.key) {
                let n = bytes.len().min(self.len);
                return Some(bytes[..n].to_vec());
            }
            let mut guard = self.shared.bell.lock();
            if self.shared.mailbox.contains_key(&self.key) {
                continue;
            }
            self.shared
                .ring
                .wait_for(&mut guard, Duration::from_millis(20));
        }
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = ThreadRecv;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let ch = (self.rank, peer, tag);
        let seq = Shared::next_seq(&self.shared.send_seq, ch);
        self.shared
            .mailbox
            .insert((ch.0, ch.1, ch.2, seq), Bytes::copy_from_slice(buf));
        let _bell = self.shared.bell.lock();
        self.shared.ring.notify_all();
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle {
        let ch = (peer, self.rank, tag);
        let seq = Shared::next_seq(&self.shared.recv_seq, ch);
        ThreadRecv {
            key: (ch.0, ch.1, ch.2, seq),
            len,
            shared: Arc::clone(&self.shared),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn one_sided(&self) -> Option<&dyn OneSided> {
        Some(self)
    }
}

impl OneSided for ThreadComm {
    fn put_signal(&self, target: usize, key: WindowKey, offset: usize, data: &[u8]) {
        let slot = self.shared.window(target, key);
        let mut state = slot.state.lock();
        let end = offset + data.len();
        if state.0.len() < end {
            state.0.resize(end, 0);
        }
        state.0[offset..end].copy_from_slice(data);
        state.1 += 1;
        slot.cond.notify_all();
    }

    fn wait_window(&self, key: WindowKey, signals: usize, len: usize) -> Vec<u8> {
        let slot = self.shared.window(self.rank, key);
        let mut bytes = {
            let mut state = slot.state.lock();
            while state.1 < signals {
                slot.cond.wait(&mut state);
            }
            std::mem::take(&mut state.0)
        };
        self.shared.windows.remove(&(self.rank, key));
        bytes.resize(len, 0);
        bytes
    }
}

impl ThreadWorld {
    /// Undelivered messages per `(src, dst, tag)` channel; handy when debugging hangs.
    pub fn pending_messages(&self) -> HashMap<(usize, usize, u16), usize> {
        let mut out = HashMap::new();
        for e in self.shared.mailbox.iter() {
            let (s, d, t, _) = *e.key();
            *out.entry((s, d, t)).or_insert(0) += 1;
        }
        out
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::Wait;
    use mpi::Threading;
    use mpi::datatype::Equivalence;
    use mpi::environment::Universe;
    use mpi::request::StaticScope;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::{Communicator as _, Destination, Source};

    pub struct MpiComm {
        pub world: SimpleCommunicator,
        pub rank: usize,
        pub size: usize,
        _universe: Universe,
    }

    // SAFETY: MPI is initialized with `Threading::Multiple`, so the
    // communicator handle may be used from any thread.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        /// Initialize MPI. Returns `None` if MPI was already initialized.
        pub fn new() -> Option<Self> {
            let (universe, threading) = mpi::initialize_with_threading(Threading::Multiple)?;
            if threading != Threading::Multiple {
                log::warn!("MPI provides {threading:?}; concurrent use across threads is unsafe");
            }
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    pub struct MpiHandle {
        finish: Option<Box<dyn FnOnce() -> Option<Vec<u8>>>>,
    }

    impl Wait for MpiHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            self.finish.take().and_then(|f| f())
        }
    }

    impl Drop for MpiHandle {
        fn drop(&mut self) {
            if let Some(f) = self.finish.take() {
                let _ = f();
            }
        }
    }

    impl super::Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            let ptr: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the allocation is reclaimed only after the request completes.
            let data: &'static [u8] = unsafe { &*ptr };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiHandle {
                finish: Some(Box::new(move || {
                    req.wait();
                    drop(unsafe { Box::from_raw(ptr) });
                    None
                })),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, len: usize) -> MpiHandle {
            let ptr: *mut [u8] = Box::into_raw(vec![0u8; len].into_boxed_slice());
            // SAFETY: as in `isend`; the buffer outlives the request.
            let data: &'static mut [u8] = unsafe { &mut *ptr };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, data, tag as i32);
            MpiHandle {
                finish: Some(Box::new(move || {
                    let status = req.wait();
                    let got = unsafe { Box::from_raw(ptr) };
                    let n = status.count(u8::equivalent_datatype()) as usize;
                    Some(got[..n.min(len)].to_vec())
                })),
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
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
