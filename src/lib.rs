#![cfg_attr(docsrs, feature(doc_cfg))]
//! # star-forest
//!
//! star-forest is a graph-based data-exchange layer for distributed numerical
//! codes. Every process owns a set of *roots* and a set of *leaves*; each leaf
//! references exactly one root, possibly on another process. Once the graph
//! is set, the star forest moves data along its edges with split-phase
//! primitives that overlap communication with computation.
//!
//! ## Features
//! - Split-phase broadcast (root → leaf), reduce (leaf → root) and
//!   fetch-and-op, each returning a request that borrows its destination
//!   buffer until it is ended
//! - Lazy, cached topology resolution with a distinguished self partition
//!   that never touches the transport
//! - Pack plans that slice contiguous index runs instead of copying and
//!   keep duplicate-index partitions sequential
//! - Derived star forests: multi (gather/scatter), embedded, local, patterns
//! - Pluggable transports: in-process threads, MPI (`mpi-support`), and a
//!   one-sided window backend
//! - Memory-type aware staging through registered [`memory::MemoryOps`]
//!
//! ## Usage
//!
//! ```
//! use star_forest::prelude::*;
//!
//! let results = ThreadWorld::run(3, |comm| {
//!     let ctx = SfContext::default();
//!     let mut sf = StarForest::new(&ctx, &comm).unwrap();
//!     // one leaf per rank, all pointing at root 0 on rank 0
//!     let nroots = if comm.rank() == 0 { 1 } else { 0 };
//!     sf.set_graph(nroots, 1, None, vec![SfNode::new(0, 0)]).unwrap();
//!     let roots = vec![42u32; nroots];
//!     let mut leaves = [0u32];
//!     let req = sf.bcast_begin(Unit::scalar(), &roots, &mut leaves, ReduceOp::Replace).unwrap();
//!     req.end().unwrap();
//!     leaves[0]
//! });
//! assert_eq!(results, vec![42, 42, 42]);
//! ```
//!
//! ## Determinism
//!
//! Rank plans list the self partition first and the other ranks in
//! ascending order, and within a rank keep leaf order, so identical graphs
//! always produce identical plans and identical message sequences.

pub mod algs;
pub mod config;
pub mod context;
pub mod debug_invariants;
pub mod memory;
pub mod ops;
pub mod sf;
pub mod sf_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{Communicator, NoComm, ThreadComm, ThreadWorld, Wait};
    pub use crate::config::{SfBackend, SfConfig};
    pub use crate::context::SfContext;
    pub use crate::memory::{DeviceFamily, MemType, MemoryOps, SfBuffer};
    pub use crate::ops::{ReduceOp, Scalar, Unit};
    pub use crate::sf::{
        BcastRequest, DuplicateOption, FetchAndOpRequest, Pattern, ReduceRequest, StarForest,
    };
    pub use crate::sf_error::SfError;
    pub use crate::topology::{GraphView, RankPlan, SfNode};
}
