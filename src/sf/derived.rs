//! Star forests derived from a parent: degree, multi, embedded, local, duplicate.
//!
//! The multi star forest gives every root `degree[r]` private slots, one
//! per referencing leaf anywhere in the group, so gather and scatter become
//! a plain reduce and broadcast over it. Degree, multi and local star
//! forests are memoized on the parent and dropped by its `reset`.
//!
//! Children keep their parent's scope. Everything derived from a local star
//! forest is local too, so building it is never collective.

use crate::algs::communicator::Communicator;
use crate::debug_invariants::DebugInvariants;
use crate::ops::reduce::{ReduceOp, Scalar, Unit};
use crate::sf::ops::{BcastRequest, ReduceRequest};
use crate::sf::{SfScope, StarForest};
use crate::sf_error::SfError;
use crate::topology::FastSet;
use crate::topology::graph::Graph;
use crate::topology::node::SfNode;

/// What [`StarForest::duplicate`] carries over.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DuplicateOption {
    /// Configuration only; the copy has no graph.
    ConfigOnly,
    /// Configuration and graph; the copy is set up again on first use.
    Graph,
    /// Configuration, graph and the resolved rank plans.
    Ranks,
}

impl<'a, C: Communicator> StarForest<'a, C> {
    /// Number of leaves, group-wide, referencing each local root.
    ///
    /// Collective on first call; one reduction.
    pub fn compute_degree(&self) -> Result<&[usize], SfError> {
        self.degree
            .get_or_try_init(|| {
                let graph = self.graph_ref()?;
                let ones = vec![1u64; graph.leaf_buffer_len()];
                let mut degree = vec![0u64; graph.nroots()];
                self.reduce(Unit::scalar(), &ones, &mut degree, ReduceOp::Sum)?;
                log::trace!("rank {}: root degrees {degree:?}", self.comm.rank());
                Ok(degree.into_iter().map(|d| d as usize).collect())
            })
            .map(Vec::as_slice)
    }

    /// Star forest whose roots are the per-contribution slots of this one.
    ///
    /// Root `r` owns multi-roots `offset[r]..offset[r] + degree[r]`, where
    /// `offset` is the prefix sum of [`StarForest::compute_degree`]. Slots
    /// are handed out by a fetch-and-op, or sorted by (rank, leaf index) when
    /// `rank_order` is configured. Collective on first call.
    pub fn multi_sf(&self) -> Result<&StarForest<'a, C>, SfError> {
        self.multi
            .get_or_try_init(|| self.build_multi().map(Box::new))
            .map(|b| &**b)
    }

    /// Prefix offsets of each root's slots in the multi star forest.
    pub fn multi_root_offsets(&self) -> Result<Vec<usize>, SfError> {
        let degree = self.compute_degree()?;
        let mut offsets = Vec::with_capacity(degree.len() + 1);
        let mut acc = 0;
        offsets.push(0);
        for &d in degree {
            acc += d;
            offsets.push(acc);
        }
        Ok(offsets)
    }

    fn build_multi(&self) -> Result<StarForest<'a, C>, SfError> {
        let graph = self.graph_ref()?;
        if graph.ilocal().is_some() {
            if let Some(slot) = first_shared_slot(graph) {
                return Err(SfError::DuplicateLeafSlot(slot));
            }
        }
        let offsets = self.multi_root_offsets()?;
        let nmulti = offsets.last().copied().unwrap_or(0);

        let mut counters: Vec<u64> = offsets[..graph.nroots()].iter().map(|&o| o as u64).collect();
        let ones = vec![1u64; graph.leaf_buffer_len()];
        let mut slots = vec![0u64; graph.leaf_buffer_len()];
        self.fetch_and_op(Unit::scalar(), &mut counters, &ones, &mut slots, ReduceOp::Sum)?;

        let unsorted = self.child_with_remote(nmulti, graph, &slots)?;
        if !self.config.rank_order {
            log::debug!("rank {}: multi star forest with {nmulti} roots", self.comm.rank());
            return Ok(unsorted);
        }

        // who sits in each slot, as (rank, leaf index) pairs
        let me = self.comm.rank() as u64;
        let mut who = vec![0u64; graph.leaf_buffer_len() * 2];
        for (i, (slot, _)) in graph.leaves().enumerate() {
            who[2 * slot] = me;
            who[2 * slot + 1] = i as u64;
        }
        let pair = Unit::<u64>::block(2)?;
        let mut owners = vec![0u64; nmulti * 2];
        unsorted.reduce(pair, &who, &mut owners, ReduceOp::Replace)?;

        let mut renumber = vec![0u64; nmulti];
        for w in offsets.windows(2) {
            let (base, end) = (w[0], w[1]);
            let mut order: Vec<usize> = (base..end).collect();
            order.sort_by_key(|&s| (owners[2 * s], owners[2 * s + 1]));
            for (pos, &s) in order.iter().enumerate() {
                renumber[s] = (base + pos) as u64;
            }
        }
        let mut sorted_slots = vec![0u64; graph.leaf_buffer_len()];
        unsorted.bcast(Unit::scalar(), &renumber, &mut sorted_slots, ReduceOp::Replace)?;

        log::debug!(
            "rank {}: rank-ordered multi star forest with {nmulti} roots",
            self.comm.rank()
        );
        self.child_with_remote(nmulti, graph, &sorted_slots)
    }

    /// New star forest on the same leaves, pointing leaf `i` at `(rank, slot_of[slot])`.
    fn child_with_remote(&self, nroots: usize, graph: &Graph, slot_of: &[u64]) -> Result<StarForest<'a, C>, SfError> {
        let remote: Vec<SfNode> = graph
            .leaves()
            .map(|(slot, node)| SfNode::new(node.rank, slot_of[slot] as usize))
            .collect();
        let ilocal = graph.ilocal().map(|s| s.to_vec());
        let child_graph = Graph::new(
            nroots,
            remote.len(),
            ilocal.map(Into::into),
            remote.into(),
            self.comm.size(),
            self.config.allow_multi_leaves,
        )?;
        let mut child = self.empty_child()?;
        child.install(child_graph);
        Ok(child)
    }

    /// Graphless star forest with this one's configuration and scope.
    ///
    /// A local-only child reuses this star forest's tags: it never
    /// communicates, and taking a fresh block would make the context's tag
    /// allocator disagree across ranks.
    fn empty_child(&self) -> Result<StarForest<'a, C>, SfError> {
        match self.scope {
            SfScope::Global => StarForest::with_config(self.ctx, self.comm, self.config.clone()),
            SfScope::LocalOnly => {
                self.ctx.ensure_live()?;
                Ok(StarForest::assemble(
                    self.ctx,
                    self.comm,
                    self.config.clone(),
                    self.tags,
                    SfScope::LocalOnly,
                ))
            }
        }
    }

    /// Start gathering every leaf value into its root's multi-root slot.
    ///
    /// `multirootdata` has one unit per multi-root, see
    /// [`StarForest::multi_root_offsets`].
    pub fn gather_begin<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        leafdata: &[T],
        multirootdata: &'s mut [T],
    ) -> Result<ReduceRequest<'s, T, C>, SfError> {
        self.multi_sf()?
            .reduce_begin(unit, leafdata, multirootdata, ReduceOp::Replace)
    }

    pub fn gather_end<T: Scalar>(&self, req: ReduceRequest<'_, T, C>) -> Result<(), SfError> {
        req.end()
    }

    /// Start sending each multi-root slot back to the leaf that filled it.
    pub fn scatter_begin<'s, T: Scalar>(
        &'s self,
        unit: Unit<T>,
        multirootdata: &[T],
        leafdata: &'s mut [T],
    ) -> Result<BcastRequest<'s, T, C>, SfError> {
        self.multi_sf()?
            .bcast_begin(unit, multirootdata, leafdata, ReduceOp::Replace)
    }

    pub fn scatter_end<T: Scalar>(&self, req: BcastRequest<'_, T, C>) -> Result<(), SfError> {
        req.end()
    }

    /// Keep the selected roots and the leaves that reference them.
    ///
    /// Root numbering is unchanged. Collective: one broadcast of a
    /// selection mask, and a new star forest on every rank.
    pub fn create_embedded_root_sf(&self, selected: &[usize]) -> Result<StarForest<'a, C>, SfError> {
        let graph = self.graph_ref()?;
        let nroots = graph.nroots();
        let mut mask = vec![0u32; nroots];
        for &r in selected {
            if r >= nroots {
                return Err(SfError::SubsetIndexOutOfRange { index: r, len: nroots });
            }
            mask[r] = 1;
        }
        let mut leaf_mask = vec![0u32; graph.leaf_buffer_len()];
        self.bcast(Unit::scalar(), &mask, &mut leaf_mask, ReduceOp::Replace)?;
        let kept = graph.retain_leaves(|i, _| leaf_mask[graph.leaf_slot(i)] != 0);
        log::debug!(
            "rank {}: embedded root star forest keeps {} of {} leaves",
            self.comm.rank(),
            kept.nleaves(),
            graph.nleaves()
        );
        self.child_from_graph(kept)
    }

    /// Keep the selected leaves (positions `0..nleaves`), slots unchanged.
    ///
    /// Needs no communication but creates a star forest, so every rank
    /// calls it together.
    pub fn create_embedded_leaf_sf(&self, selected: &[usize]) -> Result<StarForest<'a, C>, SfError> {
        let graph = self.graph_ref()?;
        let nleaves = graph.nleaves();
        let mut keep = vec![false; nleaves];
        for &i in selected {
            if i >= nleaves {
                return Err(SfError::SubsetIndexOutOfRange { index: i, len: nleaves });
            }
            keep[i] = true;
        }
        let kept = graph.retain_leaves(|i, _| keep[i]);
        self.child_from_graph(kept)
    }

    fn child_from_graph(&self, graph: Graph) -> Result<StarForest<'a, C>, SfError> {
        graph.debug_assert_invariants();
        let mut child = self.empty_child()?;
        child.install(graph);
        Ok(child)
    }

    /// The leaves whose roots live on this rank.
    ///
    /// The result never communicates: its only partition is the self
    /// partition, and building it is not collective.
    pub fn local_sf(&self) -> Result<&StarForest<'a, C>, SfError> {
        self.local
            .get_or_try_init(|| {
                self.ctx.ensure_live()?;
                let graph = self.graph_ref()?;
                let me = self.comm.rank();
                let kept = graph.retain_leaves(|_, node| node.rank == me);
                log::debug!(
                    "rank {me}: local star forest keeps {} of {} leaves",
                    kept.nleaves(),
                    graph.nleaves()
                );
                let mut local =
                    StarForest::assemble(self.ctx, self.comm, self.config.clone(), self.tags, SfScope::LocalOnly);
                local.install(kept);
                Ok(Box::new(local))
            })
            .map(|b| &**b)
    }

    /// New star forest sharing this one's configuration and, optionally, graph.
    pub fn duplicate(&self, opt: DuplicateOption) -> Result<StarForest<'a, C>, SfError> {
        let mut dup = self.empty_child()?;
        if opt == DuplicateOption::ConfigOnly {
            return Ok(dup);
        }
        let graph = self.graph_ref()?.clone();
        dup.install(graph);
        if opt == DuplicateOption::Ranks {
            if let Some(setup) = self.setup.get() {
                let _ = dup.setup.set(setup.clone());
            }
        }
        Ok(dup)
    }
}

/// First buffer slot used by two leaves, if any.
fn first_shared_slot(graph: &Graph) -> Option<usize> {
    let mut seen = FastSet::default();
    graph
        .leaves()
        .map(|(slot, _)| slot)
        .find(|&slot| !seen.insert(slot))
}
