mod util;

use star_forest::prelude::*;
use util::*;

/// Each rank `r` has `r + 1` leaves, all on root 0 of rank 0, plus one on
/// its own root 0.
fn crowded_root(sf: &mut StarForest<'_, ThreadComm>, me: usize) {
    let mut remote = vec![SfNode::new(0, 0); me + 1];
    remote.push(SfNode::new(me, 0));
    sf.set_graph(1, remote.len(), None, remote).unwrap();
}

#[test]
fn gather_then_scatter_round_trips() {
    init_logging();
    let out = ThreadWorld::run(3, |comm| {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        let me = comm.rank();
        crowded_root(&mut sf, me);

        let offsets = sf.multi_root_offsets().unwrap();
        let nmulti = *offsets.last().unwrap();
        let leaves: Vec<i32> = (0..sf.leaf_buffer_len().unwrap() as i32)
            .map(|i| 100 * me as i32 + i)
            .collect();
        let mut gathered = vec![0i32; nmulti];
        let req = sf.gather_begin(Unit::scalar(), &leaves, &mut gathered).unwrap();
        sf.gather_end(req).unwrap();

        let mut back = vec![-1i32; leaves.len()];
        let req = sf.scatter_begin(Unit::scalar(), &gathered, &mut back).unwrap();
        sf.scatter_end(req).unwrap();
        assert_eq!(back, leaves);
        (offsets, gathered)
    });
    // root 0 of rank 0 collects 2 + 2 + 3 contributions
    assert_eq!(out[0].0, vec![0, 7]);
    assert_permutation(&out[0].1, &[0, 1, 100, 101, 200, 201, 202]);
    for (offsets, gathered) in &out[1..] {
        assert_eq!(offsets, &vec![0, 1]);
        assert_eq!(gathered.len(), 1);
    }
}

#[test]
fn rank_order_sorts_each_roots_contributions() {
    let config = SfConfig {
        rank_order: true,
        ..SfConfig::default()
    };
    let out = ThreadWorld::run(3, |comm| {
        let ctx = SfContext::initialize(config.clone());
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        let me = comm.rank();
        // two leaves per rank on root 0 of rank 0, listed in reverse slot order
        sf.set_graph(
            1,
            2,
            Some(vec![1, 0].into()),
            vec![SfNode::new(0, 0), SfNode::new(0, 0)],
        )
        .unwrap();
        let leaves: Vec<u32> = vec![10 * me as u32, 10 * me as u32 + 1];
        let nmulti = *sf.multi_root_offsets().unwrap().last().unwrap();
        let mut gathered = vec![0u32; nmulti];
        let req = sf.gather_begin(Unit::scalar(), &leaves, &mut gathered).unwrap();
        req.end().unwrap();
        gathered
    });
    // leaf 0 sits at slot 1, leaf 1 at slot 0: (rank, leaf index) order
    assert_eq!(out[0], vec![1, 0, 11, 10, 21, 20]);
    assert!(out[1].is_empty() && out[2].is_empty());
}

#[test]
fn multi_sf_is_memoized_until_reset() {
    ThreadWorld::run(2, |comm| {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        crowded_root(&mut sf, comm.rank());
        let first: *const _ = sf.multi_sf().unwrap();
        let second: *const _ = sf.multi_sf().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(sf.multi_sf().unwrap().nroots().unwrap(), sf.compute_degree().unwrap().iter().sum::<usize>());
        sf.reset();
        assert_eq!(sf.compute_degree().unwrap_err(), SfError::GraphNotSet);
    });
}

#[test]
fn embedded_root_sf_keeps_matching_leaves() {
    let out = ThreadWorld::run(3, |comm| {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        let me = comm.rank();
        // every rank: 3 roots, one leaf on each root of rank (me + 1) % 3
        let next = (me + 1) % 3;
        sf.set_graph(3, 3, None, (0..3).map(|r| SfNode::new(next, r)).collect::<Vec<_>>())
            .unwrap();
        // rank r keeps only root r
        let sub = sf.create_embedded_root_sf(&[me]).unwrap();
        let view = sub.graph().unwrap();
        assert_eq!(view.nroots, 3);
        let kept: Vec<(usize, SfNode)> = view
            .iremote
            .iter()
            .enumerate()
            .map(|(i, &n)| (view.ilocal.map_or(i, |s| s[i]), n))
            .collect();

        let mut leaves = vec![0u8; 3];
        sub.bcast(Unit::scalar(), &[1, 2, 3], &mut leaves, ReduceOp::Replace)
            .unwrap();
        (kept, leaves)
    });
    for (me, (kept, leaves)) in out.iter().enumerate() {
        let next = (me + 1) % 3;
        assert_eq!(kept, &vec![(next, SfNode::new(next, next))]);
        let mut want = vec![0u8; 3];
        want[next] = next as u8 + 1;
        assert_eq!(leaves, &want);
    }
}

#[test]
fn embedded_root_sf_rejects_bad_subset() {
    let ctx = SfContext::default();
    let mut sf = StarForest::new(&ctx, &NoComm).unwrap();
    sf.set_graph(2, 1, None, vec![SfNode::new(0, 1)]).unwrap();
    assert_eq!(
        sf.create_embedded_root_sf(&[5]).unwrap_err(),
        SfError::SubsetIndexOutOfRange { index: 5, len: 2 }
    );
}

#[test]
fn local_sf_keeps_only_self_edges() {
    let out = ThreadWorld::run(4, |comm| {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        let me = comm.rank();
        let remote = random_leaves(5, me, 4, 10);
        sf.set_graph(roots_on(me), remote.len(), None, remote.clone())
            .unwrap();
        let local = sf.local_sf().unwrap();
        assert!(local.root_ranks().unwrap().remote_ranks().is_empty());
        assert!(local.leaf_ranks().unwrap().remote_ranks().is_empty());

        let roots: Vec<i32> = (0..roots_on(me) as i32).map(|r| r + 1).collect();
        let mut leaves = vec![0i32; sf.leaf_buffer_len().unwrap()];
        local
            .bcast(Unit::scalar(), &roots, &mut leaves, ReduceOp::Replace)
            .unwrap();
        for (i, node) in remote.iter().enumerate() {
            let want = if node.rank == me { node.index as i32 + 1 } else { 0 };
            assert_eq!(leaves[i], want);
        }
        local.nleaves().unwrap()
    });
    assert_eq!(out.len(), 4);
}

#[test]
fn duplicate_with_ranks_needs_no_set_up() {
    let out = ThreadWorld::run(2, |comm| {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        let peer = 1 - comm.rank();
        sf.set_graph(1, 1, None, vec![SfNode::new(peer, 0)]).unwrap();
        sf.set_up().unwrap();
        let dup = sf.duplicate(DuplicateOption::Ranks).unwrap();
        assert_eq!(dup.root_ranks().unwrap(), sf.root_ranks().unwrap());
        assert_eq!(dup.config(), sf.config());
        let mut leaf = [0u64];
        dup.bcast(Unit::scalar(), &[comm.rank() as u64 + 1], &mut leaf, ReduceOp::Replace)
            .unwrap();
        leaf[0]
    });
    assert_eq!(out, vec![2, 1]);
}

#[test]
fn duplicate_config_only_can_take_a_new_graph() {
    let ctx = SfContext::default();
    let mut sf = StarForest::new(&ctx, &NoComm).unwrap();
    sf.set_graph(1, 1, None, vec![SfNode::new(0, 0)]).unwrap();
    let mut dup = sf.duplicate(DuplicateOption::ConfigOnly).unwrap();
    assert_eq!(dup.nroots().unwrap_err(), SfError::GraphNotSet);
    dup.set_graph(2, 1, None, vec![SfNode::new(0, 1)]).unwrap();
    let mut leaf = [0i8];
    dup.bcast(Unit::scalar(), &[3, 4], &mut leaf, ReduceOp::Replace).unwrap();
    assert_eq!(leaf, [4]);
}

#[test]
fn children_of_a_local_sf_stay_local() {
    let out = ThreadWorld::run(2, |comm| {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        let me = comm.rank();
        sf.set_graph(1, 2, None, vec![SfNode::new(me, 0), SfNode::new(1 - me, 0)])
            .unwrap();
        // only rank 0 derives anything; rank 1 must not be needed
        if me == 0 {
            let local = sf.local_sf().unwrap();
            let multi = local.multi_sf().unwrap();
            assert!(multi.is_local_only());
            assert_eq!(multi.tags(), sf.tags());

            let nmulti = *local.multi_root_offsets().unwrap().last().unwrap();
            let mut gathered = vec![0i32; nmulti];
            local
                .gather_begin(Unit::scalar(), &[4, 5], &mut gathered)
                .unwrap()
                .end()
                .unwrap();
            assert_eq!(gathered, vec![4]);

            let children = [
                local.create_embedded_root_sf(&[0]).unwrap(),
                local.create_embedded_leaf_sf(&[0]).unwrap(),
                local.duplicate(DuplicateOption::Graph).unwrap(),
            ];
            for child in &children {
                assert!(child.is_local_only());
                assert_eq!(child.tags(), sf.tags());
                let mut leaf = [0i32];
                child
                    .bcast(Unit::scalar(), &[6], &mut leaf, ReduceOp::Replace)
                    .unwrap();
                assert_eq!(leaf, [6]);
            }
        }
        // tag allocators still agree, so the group can keep going
        let mut next = StarForest::new(&ctx, &comm).unwrap();
        next.set_graph(1, 1, None, vec![SfNode::new(1 - me, 0)]).unwrap();
        let mut leaf = [0u32];
        next.bcast(Unit::scalar(), &[me as u32 + 1], &mut leaf, ReduceOp::Replace)
            .unwrap();
        (next.tags(), leaf[0])
    });
    assert_eq!(out[0].0, out[1].0);
    assert_eq!((out[0].1, out[1].1), (2, 1));
}

#[test]
fn local_sf_refuses_remote_leaves() {
    ThreadWorld::run(2, |comm| {
        let ctx = SfContext::default();
        let mut sf = StarForest::new(&ctx, &comm).unwrap();
        let me = comm.rank();
        sf.set_graph(1, 1, None, vec![SfNode::new(me, 0)]).unwrap();
        let mut blank = sf.local_sf().unwrap().duplicate(DuplicateOption::ConfigOnly).unwrap();
        assert_eq!(
            blank.set_graph(1, 2, None, vec![SfNode::new(me, 0), SfNode::new(1 - me, 0)]),
            Err(SfError::RemoteLeafInLocalSf { leaf: 1, rank: 1 - me })
        );
        blank.set_graph(1, 1, None, vec![SfNode::new(me, 0)]).unwrap();
    });
}
