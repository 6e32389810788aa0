//! Reduction rules for fusing data that arrives over star-forest edges.

pub mod reduce;

pub use reduce::{ReduceOp, Scalar, ScalarKind, Unit};
