//! Star forest topology: the graph itself and the plans derived from it.
//!
//! - [`graph`]: roots, leaves and leaf → root edges, pure bookkeeping
//! - [`rank_plan`]: edges grouped by peer rank, self partition first
//! - [`pack_plan`]: contiguity and duplicate analysis of every partition

pub mod graph;
pub mod node;
pub mod pack_plan;
pub mod rank_plan;

pub use graph::{Graph, GraphView};
pub use node::SfNode;
pub use pack_plan::{PackPlan, PartitionLayout, SegmentPlan};
pub use rank_plan::{Partition, RankPlan, Scope};

// Iteration order of this alias is never relied upon; plans are built
// from ordered maps.

#[cfg(all(feature = "fast-hash", not(feature = "deterministic-order")))]
pub type FastSet<T> = ahash::AHashSet<T>;

#[cfg(feature = "deterministic-order")]
pub type FastSet<T> = std::collections::BTreeSet<T>;

#[cfg(not(any(feature = "fast-hash", feature = "deterministic-order")))]
pub type FastSet<T> = hashbrown::HashSet<T>;

