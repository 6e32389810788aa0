//! The star forest object.
//!
//! A [`StarForest`] is created from an [`SfContext`] and a [`Communicator`],
//! given a graph once with [`StarForest::set_graph`], and then drives
//! split-phase broadcast, reduce and fetch-and-op over it. Everything
//! derived from the graph (rank plans, pack plans, one-sided displacements,
//! degrees and derived star forests) is computed on first use, cached, and
//! dropped again by [`StarForest::reset`].
//!
//! Creation and set-up are collective: every rank of the communicator must
//! create its star forests in the same order and reach the first operation
//! on each of them.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use static_assertions::const_assert;

use crate::algs::communicator::{CommTag, Communicator, SfCommTags};
use crate::algs::two_sided::{allgather_count, exchange_counts, exchange_edges};
use crate::algs::wire::WireEdge;
use crate::config::{SfBackend, SfConfig};
use crate::context::SfContext;
use crate::debug_invariants::DebugInvariants;
use crate::sf_error::SfError;
use crate::topology::graph::{Graph, GraphView};
use crate::topology::node::SfNode;
use crate::topology::pack_plan::PackPlan;
use crate::topology::rank_plan::RankPlan;

pub mod derived;
mod exchange;
pub mod ops;
pub mod pattern;
mod window;

pub use derived::DuplicateOption;
pub use ops::{BcastRequest, FetchAndOpRequest, ReduceRequest};
pub use pattern::Pattern;
pub use window::WindowDisp;

/// Whether set-up talks to other ranks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SfScope {
    Global,
    /// Every edge stays on this process; set-up and operations never communicate.
    LocalOnly,
}

/// Communication plans of a set-up star forest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SfSetup {
    leaf: RankPlan,
    root: RankPlan,
    leaf_pack: PackPlan,
    root_pack: PackPlan,
}

impl SfSetup {
    /// Leaf side, grouped by the ranks owning the referenced roots.
    pub fn leaf_plan(&self) -> &RankPlan {
        &self.leaf
    }

    /// Root side, grouped by the ranks whose leaves reference my roots.
    pub fn root_plan(&self) -> &RankPlan {
        &self.root
    }

    pub fn leaf_pack(&self) -> &PackPlan {
        &self.leaf_pack
    }

    pub fn root_pack(&self) -> &PackPlan {
        &self.root_pack
    }
}

// one busy bit per reply channel
const_assert!(SfCommTags::FETCH_SLOTS as u32 <= u8::BITS);

/// A claimed fetch-and-op reply channel, released on drop.
pub(crate) struct FetchSlot<'s> {
    busy: &'s AtomicU8,
    bit: u8,
    reply: CommTag,
}

impl FetchSlot<'_> {
    pub(crate) fn reply(&self) -> CommTag {
        self.reply
    }
}

impl Drop for FetchSlot<'_> {
    fn drop(&mut self) {
        self.busy.fetch_and(!self.bit, Ordering::AcqRel);
    }
}

pub struct StarForest<'a, C: Communicator> {
    ctx: &'a SfContext,
    comm: &'a C,
    config: SfConfig,
    tags: SfCommTags,
    scope: SfScope,
    graph: Option<Graph>,
    setup: OnceCell<SfSetup>,
    window: OnceCell<WindowDisp>,
    degree: OnceCell<Vec<usize>>,
    multi: OnceCell<Box<StarForest<'a, C>>>,
    local: OnceCell<Box<StarForest<'a, C>>>,
    /// Exposure epochs handed out to one-sided operations.
    epoch: AtomicU64,
    /// Fetch-and-ops started so far; picks each one's reply channel.
    fetch_seq: AtomicU64,
    /// One bit per reply channel held by an unfinished fetch-and-op.
    fetch_busy: AtomicU8,
    fallback_warned: AtomicBool,
}

impl<'a, C: Communicator> std::fmt::Debug for StarForest<'a, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StarForest")
            .field("rank", &self.comm.rank())
            .field("tags", &self.tags)
            .field("scope", &self.scope)
            .field("graph", &self.graph)
            .field("set_up", &self.setup.get().is_some())
            .finish()
    }
}

impl<'a, C: Communicator> StarForest<'a, C> {
    /// New star forest using the context's configuration.
    pub fn new(ctx: &'a SfContext, comm: &'a C) -> Result<Self, SfError> {
        Self::with_config(ctx, comm, ctx.config().clone())
    }

    pub fn with_config(ctx: &'a SfContext, comm: &'a C, config: SfConfig) -> Result<Self, SfError> {
        let tags = ctx.next_tags()?;
        Ok(Self::assemble(ctx, comm, config, tags, SfScope::Global))
    }

    pub(crate) fn assemble(
        ctx: &'a SfContext,
        comm: &'a C,
        config: SfConfig,
        tags: SfCommTags,
        scope: SfScope,
    ) -> Self {
        Self {
            ctx,
            comm,
            config,
            tags,
            scope,
            graph: None,
            setup: OnceCell::new(),
            window: OnceCell::new(),
            degree: OnceCell::new(),
            multi: OnceCell::new(),
            local: OnceCell::new(),
            epoch: AtomicU64::new(0),
            fetch_seq: AtomicU64::new(0),
            fetch_busy: AtomicU8::new(0),
            fallback_warned: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SfConfig {
        &self.config
    }

    pub fn context(&self) -> &'a SfContext {
        self.ctx
    }

    pub fn comm(&self) -> &'a C {
        self.comm
    }

    pub fn tags(&self) -> SfCommTags {
        self.tags
    }

    /// True for star forests built by [`StarForest::local_sf`].
    pub fn is_local_only(&self) -> bool {
        self.scope == SfScope::LocalOnly
    }

    /// Set the graph.
    ///
    /// `ilocal[i]` is the leaf-buffer slot of leaf `i` (`None` for slot `i`)
    /// and `iremote[i]` the root it references. Borrowed arrays are copied,
    /// owned ones are taken over as they are. Purely local; fails with
    /// [`SfError::GraphAlreadySet`] unless [`StarForest::reset`] ran first.
    /// A star forest that is local to its process only accepts leaves on
    /// its own rank.
    pub fn set_graph<'g>(
        &mut self,
        nroots: usize,
        nleaves: usize,
        ilocal: Option<Cow<'g, [usize]>>,
        iremote: impl Into<Cow<'g, [SfNode]>>,
    ) -> Result<(), SfError> {
        if self.graph.is_some() {
            return Err(SfError::GraphAlreadySet);
        }
        let iremote: Cow<'g, [SfNode]> = iremote.into();
        if self.scope == SfScope::LocalOnly {
            let me = self.comm.rank();
            if let Some((leaf, node)) = iremote.iter().enumerate().find(|(_, n)| n.rank != me) {
                return Err(SfError::RemoteLeafInLocalSf { leaf, rank: node.rank });
            }
        }
        let graph = Graph::new(
            nroots,
            nleaves,
            ilocal,
            iremote,
            self.comm.size(),
            self.config.allow_multi_leaves,
        )?;
        self.install(graph);
        Ok(())
    }

    /// Install an already validated graph.
    pub(crate) fn install(&mut self, graph: Graph) {
        log::debug!(
            "rank {}: star forest graph set, {} roots, {} leaves, leaf range {:?}",
            self.comm.rank(),
            graph.nroots(),
            graph.nleaves(),
            graph.leaf_range()
        );
        self.graph = Some(graph);
    }

    pub fn is_graph_set(&self) -> bool {
        self.graph.is_some()
    }

    pub(crate) fn graph_ref(&self) -> Result<&Graph, SfError> {
        self.graph.as_ref().ok_or(SfError::GraphNotSet)
    }

    /// Borrowed view of the graph, valid until the next mutating call.
    pub fn graph(&self) -> Result<GraphView<'_>, SfError> {
        self.graph_ref().map(Graph::view)
    }

    pub fn nroots(&self) -> Result<usize, SfError> {
        self.graph_ref().map(Graph::nroots)
    }

    pub fn nleaves(&self) -> Result<usize, SfError> {
        self.graph_ref().map(Graph::nleaves)
    }

    /// `(minleaf, maxleaf)`, or `None` when this rank has no leaves.
    pub fn leaf_range(&self) -> Result<Option<(usize, usize)>, SfError> {
        self.graph_ref().map(Graph::leaf_range)
    }

    /// Minimal length, in vertices, of a leaf buffer.
    pub fn leaf_buffer_len(&self) -> Result<usize, SfError> {
        self.graph_ref().map(Graph::leaf_buffer_len)
    }

    /// Drop the graph and everything derived from it. Idempotent.
    pub fn reset(&mut self) {
        if self.graph.take().is_some() {
            log::debug!("rank {}: star forest reset", self.comm.rank());
        }
        self.setup.take();
        self.window.take();
        self.degree.take();
        self.multi.take();
        self.local.take();
    }

    /// Resolve the communication plans. Collective on first call, free afterwards.
    ///
    /// A root index rejected on any rank fails set-up on every rank: the
    /// owner reports [`SfError::RootIndexOutOfRange`], everyone else
    /// [`SfError::RemoteSetupFailed`].
    pub fn set_up(&self) -> Result<&SfSetup, SfError> {
        self.setup.get_or_try_init(|| self.build_setup())
    }

    /// Leaf-side plan: ranks owning roots referenced by my leaves.
    pub fn root_ranks(&self) -> Result<&RankPlan, SfError> {
        self.set_up().map(SfSetup::leaf_plan)
    }

    /// Root-side plan: ranks whose leaves reference my roots.
    pub fn leaf_ranks(&self) -> Result<&RankPlan, SfError> {
        self.set_up().map(SfSetup::root_plan)
    }

    fn build_setup(&self) -> Result<SfSetup, SfError> {
        let graph = self.graph_ref()?;
        let (me, size) = (self.comm.rank(), self.comm.size());
        let nroots = graph.nroots();
        let leaf = RankPlan::from_leaves(graph, me);

        // a bad root index is remembered, not returned, so every rank still
        // reaches the verdict round below
        let mut rejected: Option<SfError> = None;
        let mut check_root = |rank: usize, index: usize| {
            if index >= nroots && rejected.is_none() {
                rejected = Some(SfError::RootIndexOutOfRange {
                    rank,
                    index,
                    nroots,
                });
            }
        };

        let mut groups: BTreeMap<usize, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
        if let Some(p) = leaf.self_partition() {
            for &index in p.remote {
                check_root(me, index);
            }
            groups.insert(me, (p.remote.to_vec(), p.local.to_vec()));
        }

        if self.scope == SfScope::Global {
            let mut outgoing = vec![0usize; size];
            let mut edges = BTreeMap::new();
            for p in leaf.remote_partitions() {
                outgoing[p.rank] = p.len();
                let wire: Vec<WireEdge> = p
                    .remote
                    .iter()
                    .zip(p.local)
                    .map(|(&root, &slot)| WireEdge::new(root, slot))
                    .collect();
                edges.insert(p.rank, wire);
            }
            let expected = exchange_counts(self.comm, self.tags.setup, &outgoing)?;
            let incoming = exchange_edges(self.comm, self.tags.setup, &edges, &expected)?;
            for (rank, wire) in incoming {
                let mut roots = Vec::with_capacity(wire.len());
                let mut slots = Vec::with_capacity(wire.len());
                for e in wire {
                    check_root(rank, e.root());
                    roots.push(e.root());
                    slots.push(e.leaf());
                }
                groups.insert(rank, (roots, slots));
            }

            let verdicts = allgather_count(self.comm, self.tags.setup, usize::from(rejected.is_some()))?;
            if let Some(err) = rejected {
                log::error!("rank {me}: star forest set-up failed: {err}");
                return Err(err);
            }
            if let Some(rank) = verdicts.iter().position(|&v| v != 0) {
                return Err(SfError::RemoteSetupFailed { rank });
            }
        } else if let Some(err) = rejected {
            return Err(err);
        }

        let root = RankPlan::from_groups(me, groups);
        log::debug!(
            "rank {me}: star forest set up, root ranks {:?}, leaf ranks {:?}",
            leaf.ranks(),
            root.ranks()
        );
        let setup = SfSetup {
            leaf_pack: PackPlan::new(&leaf),
            root_pack: PackPlan::new(&root),
            leaf,
            root,
        };
        setup.leaf.debug_assert_invariants();
        setup.root.debug_assert_invariants();
        Ok(setup)
    }

    /// One-sided displacements when the window backend is active.
    ///
    /// Falls back to point-to-point, with a warning, on transports without
    /// one-sided support.
    pub(crate) fn window_disp(&self, setup: &SfSetup) -> Result<Option<&WindowDisp>, SfError> {
        if self.config.backend != SfBackend::Window {
            return Ok(None);
        }
        if self.comm.one_sided().is_none() {
            if !self.fallback_warned.swap(true, Ordering::Relaxed) {
                log::warn!("window backend requested but the transport has no one-sided support; using basic");
            }
            return Ok(None);
        }
        self.window
            .get_or_try_init(|| window::handshake(self.comm, self.tags.handshake, setup))
            .map(Some)
    }

    pub(crate) fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Reply channel for the next fetch-and-op.
    ///
    /// Every rank starts its fetch-and-ops in the same order, so the
    /// sequence number, and with it the channel, agrees across the group.
    pub(crate) fn claim_fetch_slot(&self) -> Result<FetchSlot<'_>, SfError> {
        let seq = self.fetch_seq.load(Ordering::Relaxed);
        let bit = 1u8 << (seq % u64::from(SfCommTags::FETCH_SLOTS));
        if self.fetch_busy.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return Err(SfError::FetchSlotsExhausted {
                limit: SfCommTags::FETCH_SLOTS,
            });
        }
        self.fetch_seq.store(seq + 1, Ordering::Relaxed);
        Ok(FetchSlot {
            busy: &self.fetch_busy,
            bit,
            reply: self.tags.fetch_reply_slot(seq),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn graph_is_one_shot() {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &NoComm).unwrap();
        assert_eq!(sf.graph().unwrap_err(), SfError::GraphNotSet);
        let remote = [SfNode::new(0, 1), SfNode::new(0, 0)];
        sf.set_graph(2, 2, None, &remote[..]).unwrap();
        assert_eq!(
            sf.set_graph(2, 2, None, &remote[..]).unwrap_err(),
            SfError::GraphAlreadySet
        );
        sf.reset();
        sf.reset();
        sf.set_graph(2, 2, None, remote.to_vec()).unwrap();
        assert_eq!(sf.graph().unwrap().iremote, &remote[..]);
    }

    #[test]
    fn single_rank_resolves_to_self() {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &NoComm).unwrap();
        let remote = [SfNode::new(0, 1), SfNode::new(0, 0)];
        sf.set_graph(2, 2, None, &remote[..]).unwrap();
        let leaf = sf.root_ranks().unwrap();
        assert_eq!(leaf.ranks(), &[0]);
        assert_eq!(leaf.ndranks(), 1);
        assert!(leaf.remote_ranks().is_empty());
        let root = sf.leaf_ranks().unwrap();
        assert_eq!(root.local(), &[1, 0]);
        assert_eq!(root.remote(), &[0, 1]);
    }

    #[test]
    fn out_of_range_root_fails_set_up() {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &NoComm).unwrap();
        sf.set_graph(1, 1, None, vec![SfNode::new(0, 3)]).unwrap();
        assert_eq!(
            sf.set_up().unwrap_err(),
            SfError::RootIndexOutOfRange {
                rank: 0,
                index: 3,
                nroots: 1
            }
        );
    }

    #[test]
    fn finalized_context_blocks_creation() {
        let ctx = SfContext::default();
        ctx.finalize();
        assert_eq!(
            StarForest::new(&ctx, &NoComm).unwrap_err(),
            SfError::ContextFinalized
        );
    }
}
