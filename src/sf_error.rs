//! SfError: unified error type for star-forest public APIs
//!
//! Every fallible operation in the crate returns `Result<_, SfError>`.
//! Configuration problems are detected locally before any message is posted,
//! so the star forest stays usable after the caller fixes its input.
//! Transport problems surface as [`SfError::CommError`] and are fatal for the
//! operation that observed them.

use crate::memory::MemType;
use crate::ops::reduce::{ReduceOp, ScalarKind};
use thiserror::Error;

/// Unified error type for star-forest operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SfError {
    /// A communication primitive or accessor was used before `set_graph`.
    #[error("star forest graph has not been set")]
    GraphNotSet,
    /// `set_graph` was called twice without an intervening `reset`.
    #[error("star forest graph is already set; call reset() first")]
    GraphAlreadySet,
    /// The declared leaf count disagrees with the supplied arrays.
    #[error("leaf count mismatch: declared {expected}, got {got}")]
    LeafCountMismatch { expected: usize, got: usize },
    /// A leaf references a rank outside the process group.
    #[error("leaf {leaf} references rank {rank}, but the group has {size} ranks")]
    RankOutOfRange { leaf: usize, rank: usize, size: usize },
    /// A remote process referenced a root index this process does not own.
    #[error("rank {rank} referenced root {index}, but only {nroots} roots exist")]
    RootIndexOutOfRange {
        rank: usize,
        index: usize,
        nroots: usize,
    },
    /// Another rank rejected its part of the graph during set-up.
    #[error("rank {rank} rejected the star forest graph during set-up")]
    RemoteSetupFailed { rank: usize },
    /// A star forest limited to this process was given a leaf on another rank.
    #[error("leaf {leaf} references rank {rank}, but this star forest is local to its process")]
    RemoteLeafInLocalSf { leaf: usize, rank: usize },
    /// Every fetch-and-op reply channel is held by an unfinished request.
    #[error("{limit} fetch-and-ops are already in flight on this star forest")]
    FetchSlotsExhausted { limit: u16 },
    /// Two leaves share a buffer slot and multi-leaf graphs are not allowed.
    #[error("leaf slot {0} is used by more than one leaf")]
    DuplicateLeafSlot(usize),
    /// A subset passed to an embedding builder is out of range.
    #[error("subset index {index} out of range 0..{len}")]
    SubsetIndexOutOfRange { index: usize, len: usize },
    /// A unit with zero elements per vertex was requested.
    #[error("block size must be at least 1")]
    InvalidBlockSize,
    /// The reduction operator is not defined for the element type.
    #[error("reduction {op:?} is not defined for {kind:?} data")]
    OpNotSupported { op: ReduceOp, kind: ScalarKind },
    /// A caller buffer cannot hold every vertex the graph addresses.
    #[error("{what} buffer too short: need {needed} elements, got {got}")]
    BufferTooShort {
        what: &'static str,
        needed: usize,
        got: usize,
    },
    /// No memory backend is registered for the requested memory type.
    #[error("no memory backend registered for {0:?}")]
    UnsupportedMemType(MemType),
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
    /// The owning context was finalized.
    #[error("star-forest context has been finalized")]
    ContextFinalized,
    /// Transport failure while talking to `neighbor`.
    #[error("communication error with rank {neighbor}: {reason}")]
    CommError { neighbor: usize, reason: String },
}

impl SfError {
    /// True for errors detected locally before any communication started.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, SfError::CommError { .. })
    }
}
