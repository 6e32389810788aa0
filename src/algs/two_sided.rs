//! Discovery helpers: learn who talks to whom.
//!
//! Roots do not know a priori which ranks reference them, so the root-side
//! plan is built in two rounds: every rank tells every other rank how many
//! edges it will send (possibly zero), then the edges themselves travel to
//! the ranks that expect them. All helpers guarantee that every send and
//! receive handle is drained before returning, even if an error occurs.

use std::collections::BTreeMap;
use std::mem::size_of;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, WireEdge, cast_slice, decode_vec, expect_exact_len};
use crate::sf_error::SfError;

fn drain<H: Wait>(sends: Vec<H>) {
    for s in sends {
        let _ = s.wait();
    }
}

/// Personalized all-to-all of one count per peer.
///
/// `outgoing[r]` is the number sent to rank `r`; the result holds, at index
/// `r`, the number rank `r` sent to us. The entry for our own rank is copied
/// from `outgoing` without communication.
pub fn exchange_counts<C>(
    comm: &C,
    tag: CommTag,
    outgoing: &[usize],
) -> Result<Vec<usize>, SfError>
where
    C: Communicator,
{
    let (me, size) = (comm.rank(), comm.size());
    debug_assert_eq!(outgoing.len(), size);

    // 1) post all receives
    let mut recvs = Vec::with_capacity(size.saturating_sub(1));
    for peer in (0..size).filter(|&p| p != me) {
        recvs.push((peer, comm.irecv(peer, tag.as_u16(), size_of::<WireCount>())));
    }

    // 2) post all sends and keep buffers alive until completion
    let mut sends = Vec::with_capacity(size.saturating_sub(1));
    for peer in (0..size).filter(|&p| p != me) {
        let cnt = WireCount::new(outgoing[peer]);
        sends.push(comm.isend(peer, tag.as_u16(), cast_slice(std::slice::from_ref(&cnt))));
    }

    // 3) wait for all recvs (but do not early-return)
    let mut incoming = vec![0usize; size];
    incoming[me] = outgoing[me];
    let mut maybe_err = None;
    for (peer, h) in recvs {
        let res = h
            .wait()
            .ok_or_else(|| format!("failed to receive count from rank {peer}"))
            .and_then(|data| {
                expect_exact_len(data.len(), size_of::<WireCount>())?;
                decode_vec::<WireCount>(&data)
            });
        match res {
            Ok(cnt) => incoming[peer] = cnt[0].get(),
            Err(reason) if maybe_err.is_none() => {
                maybe_err = Some(SfError::CommError {
                    neighbor: peer,
                    reason,
                })
            }
            Err(_) => {}
        }
    }

    // 4) always drain all send handles before returning
    drain(sends);

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

/// Every rank contributes `n`; every rank learns all contributions by rank.
pub fn allgather_count<C>(comm: &C, tag: CommTag, n: usize) -> Result<Vec<usize>, SfError>
where
    C: Communicator,
{
    let outgoing = vec![n; comm.size()];
    exchange_counts(comm, tag, &outgoing)
}

/// Ship edge lists to the ranks that own their roots.
///
/// `outgoing` maps destination rank to edges; `expected[r]` is the number of
/// edges rank `r` will send us (from [`exchange_counts`]). Returns the edges
/// received from each remote rank, keyed and ordered by rank.
pub fn exchange_edges<C>(
    comm: &C,
    tag: CommTag,
    outgoing: &BTreeMap<usize, Vec<WireEdge>>,
    expected: &[usize],
) -> Result<BTreeMap<usize, Vec<WireEdge>>, SfError>
where
    C: Communicator,
{
    let me = comm.rank();

    let mut recvs = Vec::new();
    for (peer, &n) in expected.iter().enumerate() {
        if peer != me && n > 0 {
            let len = n * size_of::<WireEdge>();
            recvs.push((peer, n, comm.irecv(peer, tag.as_u16(), len)));
        }
    }

    let mut sends = Vec::with_capacity(outgoing.len());
    for (&peer, edges) in outgoing.iter().filter(|(p, e)| **p != me && !e.is_empty()) {
        sends.push(comm.isend(peer, tag.as_u16(), cast_slice(edges)));
    }

    let mut incoming = BTreeMap::new();
    let mut maybe_err = None;
    for (peer, n, h) in recvs {
        let res = h
            .wait()
            .ok_or_else(|| format!("failed to receive edges from rank {peer}"))
            .and_then(|data| {
                expect_exact_len(data.len(), n * size_of::<WireEdge>())?;
                decode_vec::<WireEdge>(&data)
            });
        match res {
            Ok(edges) => {
                incoming.insert(peer, edges);
            }
            Err(reason) if maybe_err.is_none() => {
                maybe_err = Some(SfError::CommError {
                    neighbor: peer,
                    reason,
                })
            }
            Err(_) => {}
        }
    }

    drain(sends);

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadWorld};

    #[test]
    fn single_rank_needs_no_messages() {
        let got = exchange_counts(&NoComm, CommTag::new(1), &[5]).unwrap();
        assert_eq!(got, vec![5]);
    }

    #[test]
    fn counts_are_transposed() {
        // rank r sends r*10 + peer to each peer
        let out = ThreadWorld::run(3, |comm| {
            let me = comm.rank();
            let outgoing: Vec<usize> = (0..3).map(|p| me * 10 + p).collect();
            exchange_counts(&comm, CommTag::new(2), &outgoing).unwrap()
        });
        for (me, got) in out.iter().enumerate() {
            let want: Vec<usize> = (0..3).map(|p| p * 10 + me).collect();
            assert_eq!(got, &want);
        }
    }

    #[test]
    fn allgather_sees_everyone() {
        let out = ThreadWorld::run(4, |comm| {
            let me = comm.rank();
            allgather_count(&comm, CommTag::new(3), me + 1).unwrap()
        });
        for got in out {
            assert_eq!(got, vec![1, 2, 3, 4]);
        }
    }
}
