#![allow(dead_code)]
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use star_forest::prelude::*;

/// Route `log` output to the test harness once per binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Roots owned by `rank` in the random graphs below.
pub fn roots_on(rank: usize) -> usize {
    3 + rank
}

/// Reproducible random leaves for `me` in a group of `size` ranks.
///
/// Leaf `i` sits at slot `i`; roots are drawn uniformly over every rank's
/// `roots_on(rank)` roots.
pub fn random_leaves(seed: u64, me: usize, size: usize, nleaves: usize) -> Vec<SfNode> {
    let mut rng = SmallRng::seed_from_u64(seed ^ (me as u64).wrapping_mul(0x9E37_79B9));
    (0..nleaves)
        .map(|_| {
            let rank = rng.gen_range(0..size);
            SfNode::new(rank, rng.gen_range(0..roots_on(rank)))
        })
        .collect()
}

/// The 4-rank graph: rank 0 owns two roots, ranks 1..=3 hold one leaf on
/// each of them.
pub fn fan_out_graph(sf: &mut StarForest<'_, ThreadComm>, rank: usize) {
    if rank == 0 {
        sf.set_graph(2, 0, None, Vec::<SfNode>::new()).unwrap();
    } else {
        sf.set_graph(0, 2, None, vec![SfNode::new(0, 0), SfNode::new(0, 1)])
            .unwrap();
    }
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Copy + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort_unstable();
    let mut b = want.to_vec();
    b.sort_unstable();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}
