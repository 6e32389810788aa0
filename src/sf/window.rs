//! One-sided backend.
//!
//! Each side exposes its remote segment as a window: leaves receive
//! broadcasts into the packed remote leaf segment, roots receive reductions
//! into the packed remote root segment. A sender therefore needs to know
//! where its partition starts inside the peer's segment. Those
//! displacements are exchanged once per star forest and cached.

use std::mem::size_of;

use crate::algs::communicator::{CommTag, Communicator, WindowKey, Wait};
use crate::algs::wire::{WireCount, cast_slice, decode_vec, expect_exact_len};
use crate::sf::SfSetup;
use crate::sf_error::SfError;

/// Where this rank's partitions land in peers' windows, in vertices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowDisp {
    /// Indexed by root-side partition: offset in that leaf rank's leaf window.
    pub leaf_disp: Vec<usize>,
    /// Indexed by leaf-side partition: offset in that root rank's root window.
    pub root_disp: Vec<usize>,
}

/// Exchange window displacements with every peer.
///
/// Every rank first sends its leaf-side offsets (to root owners), then its
/// root-side offsets (to leaf owners); receives are posted in the same
/// order, so one tag carries both rounds.
pub(crate) fn handshake<C: Communicator>(
    comm: &C,
    tag: CommTag,
    setup: &SfSetup,
) -> Result<WindowDisp, SfError> {
    let (leaf, root) = (setup.leaf_plan(), setup.root_plan());
    let word = size_of::<WireCount>();

    let mut recvs = Vec::new();
    for p in root.remote_partitions() {
        recvs.push((true, p.k, p.rank, comm.irecv(p.rank, tag.as_u16(), word)));
    }
    for p in leaf.remote_partitions() {
        recvs.push((false, p.k, p.rank, comm.irecv(p.rank, tag.as_u16(), word)));
    }

    let mut sends = Vec::new();
    for p in leaf.remote_partitions() {
        let off = WireCount::new(leaf.segment_offset(p.k));
        sends.push(comm.isend(p.rank, tag.as_u16(), cast_slice(std::slice::from_ref(&off))));
    }
    for p in root.remote_partitions() {
        let off = WireCount::new(root.segment_offset(p.k));
        sends.push(comm.isend(p.rank, tag.as_u16(), cast_slice(std::slice::from_ref(&off))));
    }

    let mut disp = WindowDisp {
        leaf_disp: vec![0; root.nranks()],
        root_disp: vec![0; leaf.nranks()],
    };
    let mut maybe_err = None;
    for (is_leaf_offset, k, rank, h) in recvs {
        let res = h
            .wait()
            .ok_or_else(|| format!("no window displacement from rank {rank}"))
            .and_then(|data| {
                expect_exact_len(data.len(), word)?;
                decode_vec::<WireCount>(&data)
            });
        match res {
            Ok(v) if is_leaf_offset => disp.leaf_disp[k] = v[0].get(),
            Ok(v) => disp.root_disp[k] = v[0].get(),
            Err(reason) if maybe_err.is_none() => {
                maybe_err = Some(SfError::CommError {
                    neighbor: rank,
                    reason,
                })
            }
            Err(_) => {}
        }
    }
    for s in sends {
        let _ = s.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => {
            log::debug!(
                "rank {}: window displacements leaf {:?} root {:?}",
                comm.rank(),
                disp.leaf_disp,
                disp.root_disp
            );
            Ok(disp)
        }
    }
}

/// A window this rank waits on at End.
#[derive(Copy, Clone, Debug)]
pub(crate) struct WindowRecv {
    pub key: WindowKey,
    /// Puts expected, one per remote partition.
    pub signals: usize,
    /// Window size in bytes.
    pub len: usize,
}
