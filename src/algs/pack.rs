//! Pack, unpack and fetch kernels.
//!
//! All kernels work in units of `bs` scalars per vertex. Index runs come
//! from a [`RankPlan`](crate::topology::RankPlan) partition and their
//! [`PartitionLayout`] decides the strategy: contiguous runs are sliced,
//! scattered runs are gathered or scattered one vertex at a time.

use std::borrow::Cow;

use crate::ops::reduce::{ReduceOp, Scalar};
use crate::topology::pack_plan::PartitionLayout;

/// Gather `src[idx[k]]` blocks into wire order.
///
/// Contiguous runs borrow straight from `src`.
pub fn pack<'a, T: Scalar>(
    src: &'a [T],
    idx: &[usize],
    layout: &PartitionLayout,
    bs: usize,
) -> Cow<'a, [T]> {
    if let Some(span) = layout.span() {
        return Cow::Borrowed(&src[span.start * bs..span.end * bs]);
    }
    let mut out = Vec::with_capacity(idx.len() * bs);
    for &i in idx {
        out.extend_from_slice(&src[i * bs..(i + 1) * bs]);
    }
    Cow::Owned(out)
}

/// Scatter wire-ordered `data` into `dst[idx[k]]`, fusing with `op`.
///
/// Partitions that are [`PartitionLayout::parallel_safe`] and hold at least
/// `threshold` scalars are split across the rayon pool when the `rayon`
/// feature is enabled. Everything else runs in index order, so duplicate
/// indices see their contributions in wire order.
pub fn unpack<T: Scalar>(
    dst: &mut [T],
    idx: &[usize],
    layout: &PartitionLayout,
    bs: usize,
    data: &[T],
    op: ReduceOp,
    threshold: usize,
) {
    debug_assert_eq!(data.len(), idx.len() * bs);
    if let Some(span) = layout.span() {
        let target = &mut dst[span.start * bs..span.end * bs];
        if op == ReduceOp::Replace {
            target.copy_from_slice(data);
            return;
        }
        if layout.parallel_safe() && data.len() >= threshold {
            fuse_parallel(target, data, op);
            return;
        }
        for (t, &d) in target.iter_mut().zip(data) {
            op.fuse(t, d);
        }
        return;
    }
    for (chunk, &i) in data.chunks_exact(bs).zip(idx) {
        for (t, &d) in dst[i * bs..(i + 1) * bs].iter_mut().zip(chunk) {
            op.fuse(t, d);
        }
    }
}

#[cfg(feature = "rayon")]
fn fuse_parallel<T: Scalar>(target: &mut [T], data: &[T], op: ReduceOp) {
    use rayon::prelude::*;
    target
        .par_iter_mut()
        .zip(data.par_iter())
        .for_each(|(t, &d)| op.fuse(t, d));
}

#[cfg(not(feature = "rayon"))]
fn fuse_parallel<T: Scalar>(target: &mut [T], data: &[T], op: ReduceOp) {
    for (t, &d) in target.iter_mut().zip(data) {
        op.fuse(t, d);
    }
}

/// Atomically (with respect to this partition) fetch-and-op each vertex.
///
/// Returns the value each request observed before it was applied. Requests
/// are applied strictly in wire order, so a vertex hit twice returns the
/// first update to the second request.
pub fn fetch_and_op<T: Scalar>(
    dst: &mut [T],
    idx: &[usize],
    bs: usize,
    updates: &[T],
    op: ReduceOp,
) -> Vec<T> {
    debug_assert_eq!(updates.len(), idx.len() * bs);
    let mut fetched = Vec::with_capacity(updates.len());
    for (chunk, &i) in updates.chunks_exact(bs).zip(idx) {
        let target = &mut dst[i * bs..(i + 1) * bs];
        fetched.extend_from_slice(target);
        for (t, &u) in target.iter_mut().zip(chunk) {
            op.fuse(t, u);
        }
    }
    fetched
}
