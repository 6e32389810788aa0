//! Fixed, little-endian wire records used while building communication plans.
//!
//! Payload data of the communication primitives is sent as raw `Pod` slices;
//! only the topology handshakes use these records.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Decode `bytes` into a freshly allocated, correctly aligned vector of `T`.
///
/// Received byte buffers carry no alignment guarantee, so they are copied
/// rather than reinterpreted in place.
pub fn decode_vec<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, String> {
    let sz = size_of::<T>();
    if sz == 0 || bytes.len() % sz != 0 {
        return Err(format!(
            "payload of {} bytes is not a multiple of {sz}",
            bytes.len()
        ));
    }
    let mut out = vec![T::zeroed(); bytes.len() / sz];
    cast_slice_mut(&mut out).copy_from_slice(bytes);
    Ok(out)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

/// All multi-byte integers in these structs are **little-endian** on the wire.
/// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// One star-forest edge as seen by the root owner:
/// the root index it targets and the leaf slot on the sending rank.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireEdge {
    pub root_le: u64,
    pub leaf_le: u64,
}

impl WireEdge {
    pub fn new(root: usize, leaf: usize) -> Self {
        Self {
            root_le: (root as u64).to_le(),
            leaf_le: (leaf as u64).to_le(),
        }
    }
    pub fn root(&self) -> usize {
        u64::from_le(self.root_le) as usize
    }
    pub fn leaf(&self) -> usize {
        u64::from_le(self.leaf_le) as usize
    }
}

const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireEdge>(), 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_bytes_are_little_endian() {
        let e = WireEdge::new(0x0102, 7);
        let bytes = cast_slice(std::slice::from_ref(&e));
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(bytes[8], 7);
    }

    #[test]
    fn decode_rejects_ragged_payload() {
        assert!(decode_vec::<WireCount>(&[0u8; 12]).is_err());
        let v = decode_vec::<WireEdge>(cast_slice(&[WireEdge::new(3, 4)])).unwrap();
        assert_eq!((v[0].root(), v[0].leaf()), (3, 4));
    }
}
