//! Reduction operators and the element types they act on.
//!
//! A [`ReduceOp`] decides how an incoming value is fused into the value
//! already present at its destination. [`Scalar`] is implemented for the
//! primitive numeric types that can travel on the wire, and [`Unit`] groups
//! `bs` consecutive scalars into the quantum attached to one vertex.

use std::fmt::Debug;
use std::marker::PhantomData;

use bytemuck::Pod;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::sf_error::SfError;

/// How an incoming value combines with the value at its destination.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Overwrite the destination.
    Replace,
    Sum,
    Prod,
    Min,
    Max,
    /// Logical and; nonzero is true, result is 0 or 1.
    LAnd,
    LOr,
    LXor,
    /// Bitwise and.
    BAnd,
    BOr,
    BXor,
}

/// Broad family of a scalar, used to validate operator/type pairings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Float,
    Signed,
    Unsigned,
}

impl ReduceOp {
    /// True if `self` is meaningful for data of the given kind.
    pub fn supports(self, kind: ScalarKind) -> bool {
        match self {
            ReduceOp::Replace | ReduceOp::Sum | ReduceOp::Prod | ReduceOp::Min | ReduceOp::Max => {
                true
            }
            ReduceOp::LAnd
            | ReduceOp::LOr
            | ReduceOp::LXor
            | ReduceOp::BAnd
            | ReduceOp::BOr
            | ReduceOp::BXor => kind != ScalarKind::Float,
        }
    }

    /// Reject pairings such as a bitwise operator on floating-point data.
    pub fn check<T: Scalar>(self) -> Result<(), SfError> {
        if self.supports(T::KIND) {
            Ok(())
        } else {
            Err(SfError::OpNotSupported {
                op: self,
                kind: T::KIND,
            })
        }
    }

    /// Fuse `incoming` into `local`.
    #[inline]
    pub fn fuse<T: Scalar>(self, local: &mut T, incoming: T) {
        *local = T::combine(self, *local, incoming);
    }
}

/// Element types the star forest can move and reduce.
pub trait Scalar: Pod + PartialOrd + Debug + Send + Sync + 'static {
    const KIND: ScalarKind;

    /// Combine the resident value `acc` with `incoming` under `op`.
    fn combine(op: ReduceOp, acc: Self, incoming: Self) -> Self;
}

macro_rules! impl_integer_scalar {
    ($kind:expr => $($t:ty),*) => {$(
        impl Scalar for $t {
            const KIND: ScalarKind = $kind;

            #[inline]
            fn combine(op: ReduceOp, acc: Self, incoming: Self) -> Self {
                let truth = |b: bool| if b { <$t>::one() } else { <$t>::zero() };
                match op {
                    ReduceOp::Replace => incoming,
                    ReduceOp::Sum => acc.wrapping_add(incoming),
                    ReduceOp::Prod => acc.wrapping_mul(incoming),
                    ReduceOp::Min => if incoming < acc { incoming } else { acc },
                    ReduceOp::Max => if incoming > acc { incoming } else { acc },
                    ReduceOp::LAnd => truth(!acc.is_zero() && !incoming.is_zero()),
                    ReduceOp::LOr => truth(!acc.is_zero() || !incoming.is_zero()),
                    ReduceOp::LXor => truth(acc.is_zero() != incoming.is_zero()),
                    ReduceOp::BAnd => acc & incoming,
                    ReduceOp::BOr => acc | incoming,
                    ReduceOp::BXor => acc ^ incoming,
                }
            }
        }
    )*};
}

macro_rules! impl_float_scalar {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const KIND: ScalarKind = ScalarKind::Float;

            #[inline]
            fn combine(op: ReduceOp, acc: Self, incoming: Self) -> Self {
                match op {
                    ReduceOp::Replace => incoming,
                    ReduceOp::Sum => acc + incoming,
                    ReduceOp::Prod => acc * incoming,
                    ReduceOp::Min => acc.min(incoming),
                    ReduceOp::Max => acc.max(incoming),
                    // rejected by ReduceOp::check before any data moves
                    _ => incoming,
                }
            }
        }
    )*};
}

impl_integer_scalar!(ScalarKind::Signed => i8, i16, i32, i64);
impl_integer_scalar!(ScalarKind::Unsigned => u8, u16, u32, u64);
impl_float_scalar!(f32, f64);

/// The data attached to one vertex: `bs` consecutive values of `T`.
#[derive(Debug)]
pub struct Unit<T> {
    bs: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Unit<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Unit<T> {}

impl<T: Scalar> Unit<T> {
    /// One scalar per vertex.
    pub fn scalar() -> Self {
        Self {
            bs: 1,
            _marker: PhantomData,
        }
    }

    /// `bs` scalars per vertex (a contiguous block, like an MPI contiguous type).
    pub fn block(bs: usize) -> Result<Self, SfError> {
        if bs == 0 {
            return Err(SfError::InvalidBlockSize);
        }
        Ok(Self {
            bs,
            _marker: PhantomData,
        })
    }

    /// Scalars per vertex.
    #[inline]
    pub fn bs(&self) -> usize {
        self.bs
    }

    /// Bytes per vertex on the wire.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bs * std::mem::size_of::<T>()
    }
}
