//! Graphs of common collective patterns over a distributed array.

use serde::{Deserialize, Serialize};

use crate::algs::communicator::Communicator;
use crate::algs::two_sided::allgather_count;
use crate::ops::reduce::{ReduceOp, Scalar, Unit};
use crate::sf::StarForest;
use crate::sf_error::SfError;
use crate::topology::graph::Graph;
use crate::topology::node::SfNode;

/// Shape of the graph built by [`StarForest::set_graph_with_pattern`].
///
/// The roots are this rank's `n` entries of a distributed array of global
/// length `N` laid out by rank.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pattern {
    /// Every rank has `N` leaves, one per global entry.
    Allgather,
    /// Rank 0 has `N` leaves, everyone else none.
    Gather,
    /// Each rank has one root and one leaf per rank; leaf `i` on rank `r`
    /// references root `r` on rank `i`. `n` is ignored.
    Alltoall,
}

impl<'a, C: Communicator> StarForest<'a, C> {
    /// Set the graph to `pattern` over a layout with `n` local entries.
    ///
    /// Collective: all ranks learn every rank's `n`.
    pub fn set_graph_with_pattern(&mut self, n: usize, pattern: Pattern) -> Result<(), SfError> {
        if self.graph.is_some() {
            return Err(SfError::GraphAlreadySet);
        }
        let (me, size) = (self.comm.rank(), self.comm.size());
        let (nroots, remote) = match pattern {
            Pattern::Alltoall => (size, (0..size).map(|r| SfNode::new(r, me)).collect::<Vec<_>>()),
            Pattern::Allgather | Pattern::Gather => {
                let counts = allgather_count(self.comm, self.tags.setup, n)?;
                let all = || {
                    counts
                        .iter()
                        .enumerate()
                        .flat_map(|(r, &c)| (0..c).map(move |i| SfNode::new(r, i)))
                        .collect::<Vec<_>>()
                };
                let remote = match pattern {
                    Pattern::Gather if me != 0 => Vec::new(),
                    _ => all(),
                };
                (n, remote)
            }
        };
        log::debug!("rank {me}: {pattern:?} pattern with {} leaves", remote.len());
        let graph = Graph::new(
            nroots,
            remote.len(),
            None,
            remote.into(),
            size,
            self.config.allow_multi_leaves,
        )?;
        self.install(graph);
        Ok(())
    }

    /// Copy every rank's roots into rank 0's leaves only.
    ///
    /// Over a [`Pattern::Allgather`] graph this collects the whole array on
    /// rank 0 and leaves the other ranks' leaf buffers untouched, without a
    /// second star forest for [`Pattern::Gather`]. Collective.
    pub fn gather_to_zero<T: Scalar>(
        &self,
        unit: Unit<T>,
        rootdata: &[T],
        leafdata: &mut [T],
    ) -> Result<(), SfError> {
        self.bcast_to_zero_begin(unit, rootdata, leafdata, ReduceOp::Replace)?
            .end()
    }
}
