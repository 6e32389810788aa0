//! Pack/unpack optimization plan.
//!
//! For every partition of a [`RankPlan`] the buffer-side index run is
//! classified once: a run `s, s+1, .., s+count-1` is *contiguous* and moves
//! with a single slice copy (or no copy at all when packing), anything else
//! goes through an explicit gather/scatter. Runs that name the same index
//! twice are flagged with `has_duplicates`; such runs are unpacked
//! sequentially because the scatter is then itself a reduction.
//!
//! The same analysis is applied to the whole self segment and the whole
//! remote segment, which is what the one-sided backend exposes as windows.

use itertools::Itertools;

use crate::topology::FastSet;
use crate::topology::rank_plan::{RankPlan, Scope};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionLayout {
    /// First index of the run when `contiguous`.
    pub start: usize,
    pub count: usize,
    pub contiguous: bool,
    pub has_duplicates: bool,
}

impl PartitionLayout {
    /// Classify one index run.
    pub fn analyze(indices: &[usize]) -> Self {
        let count = indices.len();
        let start = indices.first().copied().unwrap_or(0);
        let contiguous = indices.iter().tuple_windows().all(|(&a, &b)| b == a + 1);
        let has_duplicates = !contiguous && {
            let mut seen = FastSet::default();
            !indices.iter().all(|i| seen.insert(*i))
        };
        Self {
            start,
            count,
            contiguous,
            has_duplicates,
        }
    }

    /// The run as a range, when it is contiguous.
    pub fn span(&self) -> Option<std::ops::Range<usize>> {
        self.contiguous.then(|| self.start..self.start + self.count)
    }

    /// Unpacking may be split across worker threads.
    pub fn parallel_safe(&self) -> bool {
        self.contiguous && !self.has_duplicates
    }
}

/// Summary of the self or remote segment of one side.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentPlan {
    pub layout: PartitionLayout,
    /// Vertices in the segment's packed buffer.
    pub buflen: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackPlan {
    partitions: Vec<PartitionLayout>,
    segments: [SegmentPlan; 2],
}

impl PackPlan {
    pub fn new(plan: &RankPlan) -> Self {
        let partitions = plan
            .partitions()
            .map(|p| PartitionLayout::analyze(p.local))
            .collect();
        let segment = |scope| {
            let range = plan.segment(scope);
            SegmentPlan {
                layout: PartitionLayout::analyze(&plan.local()[range.clone()]),
                buflen: range.len(),
            }
        };
        Self {
            partitions,
            segments: [segment(Scope::Local), segment(Scope::Remote)],
        }
    }

    pub fn partition(&self, k: usize) -> &PartitionLayout {
        &self.partitions[k]
    }

    pub fn segment(&self, scope: Scope) -> &SegmentPlan {
        &self.segments[scope as usize]
    }

    /// Vertices in the packed buffer of `scope` (`leafbuflen`/`rootbuflen`).
    pub fn buflen(&self, scope: Scope) -> usize {
        self.segments[scope as usize].buflen
    }

    pub fn any_duplicates(&self) -> bool {
        self.partitions.iter().any(|p| p.has_duplicates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[test]
    fn scattered_with_duplicates() {
        let l = PartitionLayout::analyze(&[4, 1, 4]);
        assert!(!l.contiguous);
        assert!(l.has_duplicates);
        assert!(!l.parallel_safe());
        assert_eq!(l.span(), None);
    }

    #[test]
    fn empty_run_is_contiguous() {
        let l = PartitionLayout::analyze(&[]);
        assert!(l.contiguous);
        assert_eq!(l.span(), Some(0..0));
    }

    #[test]
    fn segments_cover_the_plan() {
        let mut groups = BTreeMap::new();
        groups.insert(0, (vec![5, 6], vec![0, 1]));
        groups.insert(2, (vec![0, 2], vec![3, 3]));
        groups.insert(3, (vec![3], vec![0]));
        let plan = RankPlan::from_groups(0, groups);
        let pack = PackPlan::new(&plan);
        assert_eq!(pack.buflen(Scope::Local), 2);
        assert_eq!(pack.buflen(Scope::Remote), 3);
        assert_eq!(pack.segment(Scope::Local).layout.span(), Some(5..7));
        assert!(!pack.partition(1).contiguous);
        // ranks 2 and 3 together hold 0, 2, 3
        assert!(!pack.segment(Scope::Remote).layout.contiguous);
        assert!(!pack.any_duplicates());
    }

    proptest! {
        #[test]
        fn arithmetic_runs_are_contiguous(start in 0usize..1000, count in 1usize..64) {
            let run: Vec<usize> = (start..start + count).collect();
            let l = PartitionLayout::analyze(&run);
            prop_assert!(l.contiguous);
            prop_assert_eq!(l.start, start);
            prop_assert_eq!(l.count, count);
            prop_assert!(!l.has_duplicates);
        }

        #[test]
        fn permuted_runs_are_not(start in 0usize..1000, count in 2usize..64, rot in 1usize..64) {
            let mut run: Vec<usize> = (start..start + count).collect();
            run.rotate_left(rot % count);
            run.swap(0, count - 1);
            prop_assume!(run.windows(2).any(|w| w[1] != w[0] + 1));
            let l = PartitionLayout::analyze(&run);
            prop_assert!(!l.contiguous);
            prop_assert!(!l.has_duplicates);
        }
    }
}
