//! Per-rank communication plans.
//!
//! A [`RankPlan`] groups one side of the star forest by peer rank. The leaf
//! side ("root ranks") is derived locally from the graph: for every rank that
//! owns roots my leaves reference, the leaf slots (`local`) and the root
//! indices on that rank (`remote`). The root side ("leaf ranks") mirrors it:
//! for every rank whose leaves reference my roots, my root indices (`local`)
//! and the leaf slots on that rank (`remote`). Both sides list entries of a
//! partition in the leaf owner's order, so packed buffers line up without
//! any extra index exchange.
//!
//! The distinguished partition (this process itself) always comes first and
//! is counted by [`RankPlan::ndranks`]; the remaining ranks are ascending.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::debug_invariants::DebugInvariants;
use crate::sf_error::SfError;
use crate::topology::graph::Graph;

/// Self vs. remote part of a plan.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Local = 0,
    Remote = 1,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RankPlan {
    ranks: Vec<usize>,
    ndranks: usize,
    offsets: Vec<usize>,
    local: Vec<usize>,
    remote: Vec<usize>,
}

/// One peer's run of a plan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition<'a> {
    /// Position of this partition in the plan.
    pub k: usize,
    pub rank: usize,
    pub local: &'a [usize],
    pub remote: &'a [usize],
}

impl<'a> Partition<'a> {
    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

impl RankPlan {
    /// Group `graph`'s leaves by the rank owning their root.
    pub fn from_leaves(graph: &Graph, my_rank: usize) -> Self {
        let mut groups: BTreeMap<usize, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
        for (slot, node) in graph.leaves() {
            let entry = groups.entry(node.rank).or_default();
            entry.0.push(slot);
            entry.1.push(node.index);
        }
        Self::from_groups(my_rank, groups)
    }

    /// Assemble a plan from `(local, remote)` runs keyed by rank.
    pub fn from_groups(my_rank: usize, mut groups: BTreeMap<usize, (Vec<usize>, Vec<usize>)>) -> Self {
        let mut plan = RankPlan {
            offsets: vec![0],
            ..Default::default()
        };
        let mine = groups.remove(&my_rank);
        let ordered = mine
            .map(|g| (my_rank, g))
            .into_iter()
            .chain(groups.into_iter().filter(|(_, (l, _))| !l.is_empty()));
        for (rank, (local, remote)) in ordered {
            if rank == my_rank {
                plan.ndranks = 1;
            }
            plan.ranks.push(rank);
            plan.local.extend(local);
            plan.remote.extend(remote);
            plan.offsets.push(plan.local.len());
        }
        crate::debug_invariants!(plan.validate_invariants(), "RankPlan::from_groups");
        plan
    }

    /// All peer ranks, distinguished first.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Number of distinguished (self) partitions at the front of `ranks`.
    pub fn ndranks(&self) -> usize {
        self.ndranks
    }

    /// Peers reached through the transport.
    pub fn remote_ranks(&self) -> &[usize] {
        &self.ranks[self.ndranks..]
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn local(&self) -> &[usize] {
        &self.local
    }

    pub fn remote(&self) -> &[usize] {
        &self.remote
    }

    pub fn nranks(&self) -> usize {
        self.ranks.len()
    }

    pub fn partition(&self, k: usize) -> Partition<'_> {
        let r = self.offsets[k]..self.offsets[k + 1];
        Partition {
            k,
            rank: self.ranks[k],
            local: &self.local[r.clone()],
            remote: &self.remote[r],
        }
    }

    pub fn partitions(&self) -> impl Iterator<Item = Partition<'_>> + '_ {
        (0..self.ranks.len()).map(move |k| self.partition(k))
    }

    pub fn self_partition(&self) -> Option<Partition<'_>> {
        (self.ndranks > 0).then(|| self.partition(0))
    }

    pub fn remote_partitions(&self) -> impl Iterator<Item = Partition<'_>> + '_ {
        (self.ndranks..self.ranks.len()).map(move |k| self.partition(k))
    }

    /// Partition index of `rank`, if it is a peer.
    pub fn position_of(&self, rank: usize) -> Option<usize> {
        if self.ndranks > 0 && self.ranks[0] == rank {
            return Some(0);
        }
        self.remote_ranks()
            .binary_search(&rank)
            .ok()
            .map(|i| i + self.ndranks)
    }

    /// Entry range covered by the self or remote partitions.
    pub fn segment(&self, scope: Scope) -> Range<usize> {
        let split = self.offsets[self.ndranks];
        match scope {
            Scope::Local => 0..split,
            Scope::Remote => split..self.local.len(),
        }
    }

    /// Offset of partition `k` inside its segment, in vertices.
    pub fn segment_offset(&self, k: usize) -> usize {
        let base = if k < self.ndranks {
            0
        } else {
            self.offsets[self.ndranks]
        };
        self.offsets[k] - base
    }
}

impl DebugInvariants for RankPlan {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "RankPlan");
    }

    fn validate_invariants(&self) -> Result<(), SfError> {
        let bad = |what: &str| Err(SfError::Config(format!("rank plan: {what}")));
        if self.offsets.len() != self.ranks.len() + 1 || self.offsets[0] != 0 {
            return bad("offsets do not partition the ranks");
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return bad("offsets are not monotone");
        }
        if self.local.len() != self.remote.len() || *self.offsets.last().unwrap_or(&0) != self.local.len() {
            return bad("local and remote index arrays disagree");
        }
        if self.remote_ranks().windows(2).any(|w| w[0] >= w[1]) {
            return bad("remote ranks are not strictly ascending");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::node::SfNode;
    use std::borrow::Cow;

    fn graph(pairs: &[(usize, usize)], size: usize) -> Graph {
        let remote: Vec<SfNode> = pairs.iter().copied().map(SfNode::from).collect();
        Graph::new(4, remote.len(), None, Cow::Owned(remote), size, false).unwrap()
    }

    #[test]
    fn self_partition_comes_first() {
        let g = graph(&[(3, 0), (1, 2), (2, 5), (1, 0), (3, 1)], 4);
        let plan = RankPlan::from_leaves(&g, 2);
        assert_eq!(plan.ranks(), &[2, 1, 3]);
        assert_eq!(plan.ndranks(), 1);
        assert_eq!(plan.remote_ranks(), &[1, 3]);
        assert_eq!(plan.offsets(), &[0, 1, 3, 5]);
        // stable with respect to leaf order
        assert_eq!(plan.local(), &[2, 1, 3, 0, 4]);
        assert_eq!(plan.remote(), &[5, 2, 0, 0, 1]);
        assert_eq!(plan.position_of(3), Some(2));
        assert_eq!(plan.position_of(0), None);
        assert_eq!(plan.segment(Scope::Remote), 1..5);
        assert_eq!(plan.segment_offset(2), 2);
    }

    #[test]
    fn no_self_references() {
        let g = graph(&[(1, 0), (1, 1)], 2);
        let plan = RankPlan::from_leaves(&g, 0);
        assert_eq!(plan.ndranks(), 0);
        assert!(plan.self_partition().is_none());
        assert_eq!(plan.segment(Scope::Local), 0..0);
        assert_eq!(plan.remote_partitions().count(), 1);
    }

    #[test]
    fn identical_inputs_give_identical_plans() {
        let pairs = [(1, 0), (0, 1), (1, 1), (0, 0)];
        let a = RankPlan::from_leaves(&graph(&pairs, 2), 1);
        let b = RankPlan::from_leaves(&graph(&pairs, 2), 1);
        assert_eq!(a, b);
        a.validate_invariants().unwrap();
    }
}
