//! The star forest graph: local roots, local leaves and leaf → root edges.
//!
//! A [`Graph`] is pure bookkeeping. Building one never communicates; the
//! per-rank plans derived from it live in [`crate::topology::rank_plan`].

use std::borrow::Cow;
use std::ops::Range;

use itertools::Itertools;

use crate::debug_invariants::DebugInvariants;
use crate::sf_error::SfError;
use crate::topology::node::SfNode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Graph {
    nroots: usize,
    /// Leaf slots in client leaf buffers; `None` means leaf `i` lives at slot `i`.
    ilocal: Option<Vec<usize>>,
    iremote: Vec<SfNode>,
    /// Slots `minleaf..=maxleaf`, stored half-open; empty when there are no leaves.
    leaf_span: Range<usize>,
}

/// Borrowed view returned by `StarForest::graph`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphView<'a> {
    pub nroots: usize,
    pub nleaves: usize,
    pub ilocal: Option<&'a [usize]>,
    pub iremote: &'a [SfNode],
}

impl Graph {
    /// Build a graph from caller arrays.
    ///
    /// Borrowed inputs are copied; owned inputs are moved in without copying.
    /// `comm_size` bounds the ranks edges may reference.
    pub fn new(
        nroots: usize,
        nleaves: usize,
        ilocal: Option<Cow<'_, [usize]>>,
        iremote: Cow<'_, [SfNode]>,
        comm_size: usize,
        allow_multi_leaves: bool,
    ) -> Result<Self, SfError> {
        if iremote.len() != nleaves {
            return Err(SfError::LeafCountMismatch {
                expected: nleaves,
                got: iremote.len(),
            });
        }
        if let Some(slots) = &ilocal {
            if slots.len() != nleaves {
                return Err(SfError::LeafCountMismatch {
                    expected: nleaves,
                    got: slots.len(),
                });
            }
        }
        if let Some((leaf, node)) = iremote.iter().find_position(|n| n.rank >= comm_size) {
            return Err(SfError::RankOutOfRange {
                leaf,
                rank: node.rank,
                size: comm_size,
            });
        }

        // identity slot arrays carry no information
        let ilocal = ilocal
            .filter(|slots| !slots.iter().enumerate().all(|(i, &s)| i == s))
            .map(Cow::into_owned);

        if let (Some(slots), false) = (&ilocal, allow_multi_leaves) {
            if let Some((a, _)) = slots.iter().sorted_unstable().tuple_windows().find(|(a, b)| a == b) {
                return Err(SfError::DuplicateLeafSlot(*a));
            }
        }

        let leaf_span = match &ilocal {
            None => 0..nleaves,
            Some(slots) => match slots.iter().minmax().into_option() {
                Some((&lo, &hi)) => lo..hi + 1,
                None => 0..0,
            },
        };

        let graph = Self {
            nroots,
            ilocal,
            iremote: iremote.into_owned(),
            leaf_span,
        };
        crate::debug_invariants!(graph.validate_invariants(), "Graph::new");
        Ok(graph)
    }

    pub fn nroots(&self) -> usize {
        self.nroots
    }

    pub fn nleaves(&self) -> usize {
        self.iremote.len()
    }

    pub fn ilocal(&self) -> Option<&[usize]> {
        self.ilocal.as_deref()
    }

    pub fn iremote(&self) -> &[SfNode] {
        &self.iremote
    }

    pub fn view(&self) -> GraphView<'_> {
        GraphView {
            nroots: self.nroots,
            nleaves: self.nleaves(),
            ilocal: self.ilocal(),
            iremote: &self.iremote,
        }
    }

    /// Buffer slot of leaf `i`.
    #[inline]
    pub fn leaf_slot(&self, i: usize) -> usize {
        match &self.ilocal {
            Some(slots) => slots[i],
            None => i,
        }
    }

    /// `(slot, root)` for every leaf in leaf order.
    pub fn leaves(&self) -> impl Iterator<Item = (usize, SfNode)> + '_ {
        self.iremote
            .iter()
            .enumerate()
            .map(move |(i, &node)| (self.leaf_slot(i), node))
    }

    /// `(minleaf, maxleaf)`, or `None` without leaves.
    pub fn leaf_range(&self) -> Option<(usize, usize)> {
        if self.leaf_span.is_empty() {
            None
        } else {
            Some((self.leaf_span.start, self.leaf_span.end - 1))
        }
    }

    /// Minimal number of vertices a leaf buffer must hold.
    pub fn leaf_buffer_len(&self) -> usize {
        self.leaf_span.end
    }

    /// Keep the leaves for which `keep(i, node)` holds, preserving their slots.
    pub fn retain_leaves(&self, mut keep: impl FnMut(usize, SfNode) -> bool) -> Graph {
        let mut slots = Vec::new();
        let mut remote = Vec::new();
        for (i, &node) in self.iremote.iter().enumerate() {
            if keep(i, node) {
                slots.push(self.leaf_slot(i));
                remote.push(node);
            }
        }
        let leaf_span = match slots.iter().minmax().into_option() {
            Some((&lo, &hi)) => lo..hi + 1,
            None => 0..0,
        };
        let ilocal = (!slots.iter().enumerate().all(|(i, &s)| i == s)).then_some(slots);
        Graph {
            nroots: self.nroots,
            ilocal,
            iremote: remote,
            leaf_span,
        }
    }
}

impl DebugInvariants for Graph {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Graph");
    }

    fn validate_invariants(&self) -> Result<(), SfError> {
        if let Some(slots) = &self.ilocal {
            if slots.len() != self.iremote.len() {
                return Err(SfError::LeafCountMismatch {
                    expected: self.iremote.len(),
                    got: slots.len(),
                });
            }
        }
        let outside = self
            .leaves()
            .map(|(slot, _)| slot)
            .find(|s| !self.leaf_span.contains(s));
        if let Some(slot) = outside {
            return Err(SfError::BufferTooShort {
                what: "leaf span",
                needed: slot + 1,
                got: self.leaf_span.end,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(pairs: &[(usize, usize)]) -> Vec<SfNode> {
        pairs.iter().copied().map(SfNode::from).collect()
    }

    #[test]
    fn identity_slots_are_dropped() {
        let g = Graph::new(
            2,
            2,
            Some(Cow::Owned(vec![0, 1])),
            Cow::Owned(nodes(&[(0, 0), (0, 1)])),
            1,
            false,
        )
        .unwrap();
        assert!(g.ilocal().is_none());
        assert_eq!(g.leaf_range(), Some((0, 1)));
    }

    #[test]
    fn sparse_leaves_span_their_slots() {
        let remote = nodes(&[(0, 0), (0, 1)]);
        let g = Graph::new(2, 2, Some(Cow::Borrowed(&[7, 3][..])), Cow::Borrowed(&remote), 1, false)
            .unwrap();
        assert_eq!(g.leaf_range(), Some((3, 7)));
        assert_eq!(g.leaf_buffer_len(), 8);
        assert_eq!(g.leaves().collect::<Vec<_>>(), vec![(7, remote[0]), (3, remote[1])]);
    }

    #[test]
    fn rejects_bad_input() {
        let remote = nodes(&[(0, 0), (2, 0)]);
        assert_eq!(
            Graph::new(1, 2, None, Cow::Borrowed(&remote), 2, false).unwrap_err(),
            SfError::RankOutOfRange {
                leaf: 1,
                rank: 2,
                size: 2
            }
        );
        assert!(matches!(
            Graph::new(1, 3, None, Cow::Borrowed(&remote), 4, false),
            Err(SfError::LeafCountMismatch { .. })
        ));
        let remote = nodes(&[(0, 0), (0, 0)]);
        let slots = [4usize, 4];
        assert_eq!(
            Graph::new(1, 2, Some(Cow::Borrowed(&slots[..])), Cow::Borrowed(&remote), 1, false)
                .unwrap_err(),
            SfError::DuplicateLeafSlot(4)
        );
        assert!(
            Graph::new(1, 2, Some(Cow::Borrowed(&slots[..])), Cow::Borrowed(&remote), 1, true).is_ok()
        );
    }

    #[test]
    fn empty_graph_has_no_leaf_range() {
        let g = Graph::new(3, 0, None, Cow::Owned(Vec::new()), 1, false).unwrap();
        assert_eq!(g.leaf_range(), None);
        assert_eq!(g.leaf_buffer_len(), 0);
    }

    #[test]
    fn retain_keeps_slots() {
        let g = Graph::new(2, 3, None, Cow::Owned(nodes(&[(0, 0), (1, 0), (0, 1)])), 2, false)
            .unwrap();
        let kept = g.retain_leaves(|_, n| n.rank == 0);
        assert_eq!(kept.ilocal(), Some(&[0, 2][..]));
        assert_eq!(kept.iremote(), &nodes(&[(0, 0), (0, 1)])[..]);
    }
}
