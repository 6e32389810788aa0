//! Split-phase communication primitives.
//!
//! Every `*_begin` validates its arguments, packs and posts everything it
//! can, and returns a request that mutably borrows the destination buffers.
//! The matching `*_end` (or `.end()` on the request) blocks until the
//! transfers complete and unpacks into those buffers. Requests on distinct
//! buffers may be interleaved freely.
//!
//! | primitive      | direction    | op applied |
//! |----------------|--------------|------------|
//! | bcast          | root → leaf  | at leaves  |
//! | reduce         | leaf → root  | at roots   |
//! | fetch_and_op   | leaf → root → leaf | at roots, prior values back to leaves |

use crate::algs::communicator::{Communicator, OneSided, WindowKey};
use crate::algs::pack::{fetch_and_op, pack, unpack};
use crate::algs::wire::cast_slice;
use crate::memory::{MemType, MemoryRegistry};
use crate::ops::reduce::{ReduceOp, Scalar, Unit};
use crate::sf::exchange::Link;
use crate::sf::window::WindowRecv;
use crate::sf::{FetchSlot, SfSetup, StarForest};
use crate::sf_error::SfError;
use crate::topology::pack_plan::PackPlan;
use crate::topology::rank_plan::{RankPlan, Scope};

fn check_len<T>(what: &'static str, buf: &[T], vertices: usize, bs: usize) -> Result<(), SfError> {
    let needed = vertices * bs;
    if buf.len() < needed {
        return Err(SfError::BufferTooShort {
            what,
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

fn check_mtype(memory: &MemoryRegistry, mtype: MemType) -> Result<(), SfError> {
    if memory.supports(mtype) {
        Ok(())
    } else {
        Err(SfError::UnsupportedMemType(mtype))
    }
}

fn one_sided<C: Communicator>(comm: &C) -> Result<&dyn OneSided, SfError> {
    comm.one_sided().ok_or_else(|| SfError::CommError {
        neighbor: comm.rank(),
        reason: "transport lost one-sided support".into(),
    })
}

fn collect_window<T: Scalar, C: Communicator>(
    comm: &C,
    link: &mut Link<'_, C>,
    w: WindowRecv,
    mtype: MemType,
) -> Result<Vec<T>, SfError> {
    if w.signals == 0 {
        return Ok(Vec::new());
    }
    let bytes = one_sided(comm)?.wait_window(w.key, w.signals, w.len);
    link.land(mtype, bytes, comm.rank())
}

/// Fuse a landed window, laid out as the packed remote segment of `plan`.
fn unpack_window<T: Scalar>(
    dst: &mut [T],
    plan: &RankPlan,
    pack_plan: &PackPlan,
    bs: usize,
    data: &[T],
    op: ReduceOp,
    threshold: usize,
) {
    let segment = pack_plan.segment(Scope::Remote);
    if segment.layout.contiguous {
        // every remote partition together fills one run of the buffer
        let idx = &plan.local()[plan.segment(Scope::Remote)];
        unpack(dst, idx, &segment.layout, bs, data, op, threshold);
        return;
    }
    for p in plan.remote_partitions() {
        let off = plan.segment_offset(p.k) * bs;
        let chunk = &data[off..off + p.len() * bs];
        unpack(dst, p.local, pack_plan.partition(p.k), bs, chunk, op, threshold);
    }
}

/// Broadcast in flight; borrows the leaf buffer until [`BcastRequest::end`].
#[must_use = "a broadcast completes only when ended"]
pub struct BcastRequest<'s, T: Scalar, C: Communicator> {
    comm: &'s C,
    setup: &'s SfSetup,
    leafdata: &'s mut [T],
    leaf_mtype: MemType,
    unit: Unit<T>,
    op: ReduceOp,
    threshold: usize,
    window: Option<WindowRecv>,
    link: Link<'s, C>,
}

/// Reduction in flight; borrows the root buffer until [`ReduceRequest::end`].
#[must_use = "a reduction completes only when ended"]
pub struct ReduceRequest<'s, T: Scalar, C: Communicator> {
    comm: &'s C,
    setup: &'s SfSetup,
    rootdata: &'s mut [T],
    root_mtype: MemType,
    unit: Unit<T>,
    op: ReduceOp,
    threshold: usize,
    window: Option<WindowRecv>,
    self_data: Vec<T>,
    link: Link<'s, C>,
}

/// Fetch-and-op in flight; borrows the root buffer and the fetched-value buffer.
#[must_use = "a fetch-and-op completes only when ended"]
pub struct FetchAndOpRequest<'s, T: Scalar, C: Communicator> {
    comm: &'s C,
    setup: &'s SfSetup,
    rootdata: &'s mut [T],
    leafupdate: &'s mut [T],
    unit: Unit<T>,
    op: ReduceOp,
    self_updates: Vec<T>,
    link: Link<'s, C>,
    // released after the link has drained
    slot: FetchSlot<'s>,
}

impl<'a, C: Communicator> StarForest<'a, C> {
    /// Start sending root values to the leaves that reference them.
    ///
    /// `op` fuses arriving values into `leafdata`; use [`ReduceOp::Replace`]
    /// to overwrite. The self partition is copied before this returns.
    pub fn bcast_begin<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        rootdata: &[T],
        leafdata: &'s mut [T],
        op: ReduceOp,
    ) -> Result<BcastRequest<'s, T, C>, SfError> {
        self.start_bcast(unit, MemType::Host, rootdata, MemType::Host, leafdata, op, false)
    }

    pub fn bcast_begin_with_memtype<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        root_mtype: MemType,
        rootdata: &[T],
        leaf_mtype: MemType,
        leafdata: &'s mut [T],
        op: ReduceOp,
    ) -> Result<BcastRequest<'s, T, C>, SfError> {
        self.start_bcast(unit, root_mtype, rootdata, leaf_mtype, leafdata, op, false)
    }

    pub fn bcast_end<T: Scalar>(&self, req: BcastRequest<'_, T, C>) -> Result<(), SfError> {
        req.end()
    }

    /// Begin and end a broadcast.
    pub fn bcast<T: Scalar>(
        &self,
        unit: Unit<T>,
        rootdata: &[T],
        leafdata: &mut [T],
        op: ReduceOp,
    ) -> Result<(), SfError> {
        self.bcast_begin(unit, rootdata, leafdata, op)?.end()
    }

    /// Broadcast whose only receiver is rank 0; other ranks' leaves are untouched.
    pub(crate) fn bcast_to_zero_begin<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        rootdata: &[T],
        leafdata: &'s mut [T],
        op: ReduceOp,
    ) -> Result<BcastRequest<'s, T, C>, SfError> {
        self.start_bcast(unit, MemType::Host, rootdata, MemType::Host, leafdata, op, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn start_bcast<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        root_mtype: MemType,
        rootdata: &[T],
        leaf_mtype: MemType,
        leafdata: &'s mut [T],
        op: ReduceOp,
        to_zero: bool,
    ) -> Result<BcastRequest<'s, T, C>, SfError> {
        op.check::<T>()?;
        let graph = self.graph_ref()?;
        let bs = unit.bs();
        check_len("root", rootdata, graph.nroots(), bs)?;
        check_len("leaf", leafdata, graph.leaf_buffer_len(), bs)?;
        let memory = self.ctx.memory();
        check_mtype(memory, root_mtype)?;
        check_mtype(memory, leaf_mtype)?;

        let setup = self.set_up()?;
        let disp = if to_zero { None } else { self.window_disp(setup)? };
        let (leaf, root) = (setup.leaf_plan(), setup.root_plan());
        let me = self.comm.rank();
        let receives = |rank: usize| !to_zero || rank == 0;
        let tag = self.tags.bcast;
        let what = if to_zero { "bcast-to-zero" } else { "bcast" };
        let mut link = Link::new(
            what,
            self.comm,
            memory,
            self.config.use_gpu_aware,
            self.config.monitor,
        );

        let window = match disp {
            Some(_) => Some(WindowRecv {
                key: WindowKey {
                    tag: tag.as_u16(),
                    epoch: self.next_epoch(),
                },
                signals: leaf.remote_ranks().len(),
                len: setup.leaf_pack().buflen(Scope::Remote) * unit.bytes(),
            }),
            None => {
                if receives(me) {
                    for p in leaf.remote_partitions() {
                        link.post_recv(p.k, p.rank, tag, p.len() * unit.bytes());
                    }
                }
                None
            }
        };

        for p in root.remote_partitions().filter(|p| receives(p.rank)) {
            let packed = pack(rootdata, p.local, setup.root_pack().partition(p.k), bs);
            let bytes = cast_slice(&*packed);
            match (&window, disp) {
                (Some(w), Some(d)) => {
                    let wire = link.outbound(root_mtype, bytes)?;
                    one_sided(self.comm)?.put_signal(p.rank, w.key, d.leaf_disp[p.k] * unit.bytes(), &wire);
                    link.note_put(wire.len());
                }
                _ => link.send(p.rank, tag, root_mtype, bytes)?,
            }
        }

        if receives(me) {
            if let (Some(rp), Some(lp)) = (root.self_partition(), leaf.self_partition()) {
                let packed = pack(rootdata, rp.local, setup.root_pack().partition(rp.k), bs);
                unpack(
                    leafdata,
                    lp.local,
                    setup.leaf_pack().partition(lp.k),
                    bs,
                    &packed,
                    op,
                    self.config.parallel_unpack_threshold,
                );
            }
        }

        link.begun();
        Ok(BcastRequest {
            comm: self.comm,
            setup,
            leafdata,
            leaf_mtype,
            unit,
            op,
            threshold: self.config.parallel_unpack_threshold,
            window,
            link,
        })
    }

    /// Start combining leaf values into the roots they reference.
    ///
    /// `op` is applied at [`ReduceRequest::end`]. Results are deterministic
    /// for associative, commutative operators; for `Replace` the value that
    /// survives is the last one in (self, then ascending rank, then leaf)
    /// order.
    pub fn reduce_begin<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        leafdata: &[T],
        rootdata: &'s mut [T],
        op: ReduceOp,
    ) -> Result<ReduceRequest<'s, T, C>, SfError> {
        self.reduce_begin_with_memtype(unit, MemType::Host, leafdata, MemType::Host, rootdata, op)
    }

    pub fn reduce_begin_with_memtype<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        leaf_mtype: MemType,
        leafdata: &[T],
        root_mtype: MemType,
        rootdata: &'s mut [T],
        op: ReduceOp,
    ) -> Result<ReduceRequest<'s, T, C>, SfError> {
        op.check::<T>()?;
        let graph = self.graph_ref()?;
        let bs = unit.bs();
        check_len("leaf", leafdata, graph.leaf_buffer_len(), bs)?;
        check_len("root", rootdata, graph.nroots(), bs)?;
        let memory = self.ctx.memory();
        check_mtype(memory, leaf_mtype)?;
        check_mtype(memory, root_mtype)?;

        let setup = self.set_up()?;
        let disp = self.window_disp(setup)?;
        let (leaf, root) = (setup.leaf_plan(), setup.root_plan());
        let tag = self.tags.reduce;
        let mut link = Link::new(
            "reduce",
            self.comm,
            memory,
            self.config.use_gpu_aware,
            self.config.monitor,
        );

        let window = match disp {
            Some(_) => Some(WindowRecv {
                key: WindowKey {
                    tag: tag.as_u16(),
                    epoch: self.next_epoch(),
                },
                signals: root.remote_ranks().len(),
                len: setup.root_pack().buflen(Scope::Remote) * unit.bytes(),
            }),
            None => {
                for p in root.remote_partitions() {
                    link.post_recv(p.k, p.rank, tag, p.len() * unit.bytes());
                }
                None
            }
        };

        for p in leaf.remote_partitions() {
            let packed = pack(leafdata, p.local, setup.leaf_pack().partition(p.k), bs);
            let bytes = cast_slice(&*packed);
            match (&window, disp) {
                (Some(w), Some(d)) => {
                    let wire = link.outbound(leaf_mtype, bytes)?;
                    one_sided(self.comm)?.put_signal(p.rank, w.key, d.root_disp[p.k] * unit.bytes(), &wire);
                    link.note_put(wire.len());
                }
                _ => link.send(p.rank, tag, leaf_mtype, bytes)?,
            }
        }

        let self_data = leaf
            .self_partition()
            .map(|lp| pack(leafdata, lp.local, setup.leaf_pack().partition(lp.k), bs).into_owned())
            .unwrap_or_default();

        link.begun();
        Ok(ReduceRequest {
            comm: self.comm,
            setup,
            rootdata,
            root_mtype,
            unit,
            op,
            threshold: self.config.parallel_unpack_threshold,
            window,
            self_data,
            link,
        })
    }

    pub fn reduce_end<T: Scalar>(&self, req: ReduceRequest<'_, T, C>) -> Result<(), SfError> {
        req.end()
    }

    /// Begin and end a reduction.
    pub fn reduce<T: Scalar>(
        &self,
        unit: Unit<T>,
        leafdata: &[T],
        rootdata: &mut [T],
        op: ReduceOp,
    ) -> Result<(), SfError> {
        self.reduce_begin(unit, leafdata, rootdata, op)?.end()
    }

    /// Start an atomic read-modify-write of the roots.
    ///
    /// Each leaf contributes `leafdata[slot]`; at end `leafupdate[slot]`
    /// holds the root value that contribution observed and `rootdata` holds
    /// the combined result. Always travels point-to-point.
    ///
    /// Replies travel on a channel private to this request, so fetch-and-ops
    /// on different buffers may be ended in any order. At most
    /// [`SfCommTags::FETCH_SLOTS`](crate::algs::communicator::SfCommTags::FETCH_SLOTS)
    /// may be in flight at once.
    pub fn fetch_and_op_begin<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        rootdata: &'s mut [T],
        leafdata: &[T],
        leafupdate: &'s mut [T],
        op: ReduceOp,
    ) -> Result<FetchAndOpRequest<'s, T, C>, SfError> {
        op.check::<T>()?;
        let graph = self.graph_ref()?;
        let bs = unit.bs();
        check_len("root", rootdata, graph.nroots(), bs)?;
        check_len("leaf", leafdata, graph.leaf_buffer_len(), bs)?;
        check_len("leaf update", leafupdate, graph.leaf_buffer_len(), bs)?;

        let setup = self.set_up()?;
        let slot = self.claim_fetch_slot()?;
        let (leaf, root) = (setup.leaf_plan(), setup.root_plan());
        let (fetch, reply) = (self.tags.fetch, slot.reply());
        let mut link = Link::new(
            "fetch-and-op",
            self.comm,
            self.ctx.memory(),
            self.config.use_gpu_aware,
            self.config.monitor,
        );

        for p in root.remote_partitions() {
            link.post_recv(p.k, p.rank, fetch, p.len() * unit.bytes());
        }
        for p in leaf.remote_partitions() {
            link.post_recv(p.k, p.rank, reply, p.len() * unit.bytes());
            let packed = pack(leafdata, p.local, setup.leaf_pack().partition(p.k), bs);
            link.send(p.rank, fetch, MemType::Host, cast_slice(&*packed))?;
        }
        let self_updates = leaf
            .self_partition()
            .map(|lp| pack(leafdata, lp.local, setup.leaf_pack().partition(lp.k), bs).into_owned())
            .unwrap_or_default();

        link.begun();
        Ok(FetchAndOpRequest {
            comm: self.comm,
            setup,
            rootdata,
            leafupdate,
            unit,
            op,
            self_updates,
            link,
            slot,
        })
    }

    pub fn fetch_and_op_end<T: Scalar>(&self, req: FetchAndOpRequest<'_, T, C>) -> Result<(), SfError> {
        req.end()
    }

    /// Begin and end a fetch-and-op.
    pub fn fetch_and_op<T: Scalar>(
        &self,
        unit: Unit<T>,
        rootdata: &mut [T],
        leafdata: &[T],
        leafupdate: &mut [T],
        op: ReduceOp,
    ) -> Result<(), SfError> {
        self.fetch_and_op_begin(unit, rootdata, leafdata, leafupdate, op)?
            .end()
    }
}

impl<'s, T: Scalar, C: Communicator> BcastRequest<'s, T, C> {
    /// Wait for every incoming root value and fuse it into the leaves.
    pub fn end(self) -> Result<(), SfError> {
        let BcastRequest {
            comm,
            setup,
            leafdata,
            leaf_mtype,
            unit,
            op,
            threshold,
            window,
            mut link,
        } = self;
        let (leaf, pack_plan) = (setup.leaf_plan(), setup.leaf_pack());
        let bs = unit.bs();
        let mut first: Option<SfError> = None;

        if let Some(w) = window {
            match collect_window::<T, C>(comm, &mut link, w, leaf_mtype) {
                Ok(data) if !data.is_empty() => {
                    unpack_window(leafdata, leaf, pack_plan, bs, &data, op, threshold);
                }
                Ok(_) => {}
                Err(e) => first = Some(e),
            }
        }

        for inc in link.take_incoming() {
            let k = inc.k;
            match link.receive::<T>(inc, leaf_mtype) {
                Ok(data) => {
                    let p = leaf.partition(k);
                    unpack(leafdata, p.local, pack_plan.partition(k), bs, &data, op, threshold);
                }
                Err(e) => {
                    first.get_or_insert(e);
                }
            }
        }

        let closed = link.close();
        match first {
            Some(e) => Err(e),
            None => closed,
        }
    }
}

impl<'s, T: Scalar, C: Communicator> ReduceRequest<'s, T, C> {
    /// Wait for every leaf contribution and fuse it into the roots.
    pub fn end(self) -> Result<(), SfError> {
        let ReduceRequest {
            comm,
            setup,
            rootdata,
            root_mtype,
            unit,
            op,
            threshold,
            window,
            self_data,
            mut link,
        } = self;
        let (root, pack_plan) = (setup.root_plan(), setup.root_pack());
        let bs = unit.bs();
        let mut first: Option<SfError> = None;

        if let Some(rp) = root.self_partition() {
            unpack(rootdata, rp.local, pack_plan.partition(rp.k), bs, &self_data, op, threshold);
        }

        if let Some(w) = window {
            match collect_window::<T, C>(comm, &mut link, w, root_mtype) {
                Ok(data) if !data.is_empty() => {
                    unpack_window(rootdata, root, pack_plan, bs, &data, op, threshold);
                }
                Ok(_) => {}
                Err(e) => first = Some(e),
            }
        }

        for inc in link.take_incoming() {
            let k = inc.k;
            match link.receive::<T>(inc, root_mtype) {
                Ok(data) => {
                    let p = root.partition(k);
                    unpack(rootdata, p.local, pack_plan.partition(k), bs, &data, op, threshold);
                }
                Err(e) => {
                    first.get_or_insert(e);
                }
            }
        }

        let closed = link.close();
        match first {
            Some(e) => Err(e),
            None => closed,
        }
    }
}

impl<'s, T: Scalar, C: Communicator> FetchAndOpRequest<'s, T, C> {
    fn apply_self(&mut self) {
        let (root, leaf) = (self.setup.root_plan(), self.setup.leaf_plan());
        if let (Some(rp), Some(lp)) = (root.self_partition(), leaf.self_partition()) {
            let bs = self.unit.bs();
            let fetched = fetch_and_op(self.rootdata, rp.local, bs, &self.self_updates, self.op);
            let layout = self.setup.leaf_pack().partition(lp.k);
            unpack(self.leafupdate, lp.local, layout, bs, &fetched, ReduceOp::Replace, usize::MAX);
        }
    }

    /// Apply every request at the roots, in ascending source rank, then
    /// collect the values this rank's leaves observed.
    pub fn end(mut self) -> Result<(), SfError> {
        let me = self.comm.rank();
        let bs = self.unit.bs();
        let reply_tag = self.slot.reply();
        let (replies, requests): (Vec<_>, Vec<_>) = self
            .link
            .take_incoming()
            .into_iter()
            .partition(|inc| inc.tag == reply_tag);
        let mut first: Option<SfError> = None;
        let mut self_done = false;

        for inc in requests {
            if !self_done && me < inc.rank {
                self.apply_self();
                self_done = true;
            }
            let (k, rank) = (inc.k, inc.rank);
            match self.link.receive::<T>(inc, MemType::Host) {
                Ok(updates) => {
                    let p = self.setup.root_plan().partition(k);
                    let fetched = fetch_and_op(self.rootdata, p.local, bs, &updates, self.op);
                    if let Err(e) = self.link.send(rank, reply_tag, MemType::Host, cast_slice(&fetched)) {
                        first.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first.get_or_insert(e);
                }
            }
        }
        if !self_done {
            self.apply_self();
        }

        for inc in replies {
            let k = inc.k;
            match self.link.receive::<T>(inc, MemType::Host) {
                Ok(fetched) => {
                    let p = self.setup.leaf_plan().partition(k);
                    let layout = self.setup.leaf_pack().partition(k);
                    unpack(self.leafupdate, p.local, layout, bs, &fetched, ReduceOp::Replace, usize::MAX);
                }
                Err(e) => {
                    first.get_or_insert(e);
                }
            }
        }

        let closed = self.link.close();
        match first {
            Some(e) => Err(e),
            None => closed,
        }
    }
}
