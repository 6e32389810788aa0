//! Memory-type aware allocation hooks.
//!
//! Star forest operations stage packed data in buffers whose memory kind
//! follows the caller's buffers. The allocator itself is supplied from the
//! outside through [`MemoryOps`]; [`HostMemory`] is always available and
//! device families are registered on the [`SfContext`](crate::context::SfContext).

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::sf_error::SfError;

/// Accelerator families a device backend may serve.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    Cuda,
    Hip,
    Kokkos,
    Sycl,
}

/// Where a buffer lives.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    #[default]
    Host,
    Device(DeviceFamily),
}

impl MemType {
    pub fn is_device(self) -> bool {
        matches!(self, MemType::Device(_))
    }
}

/// A byte buffer owned by a memory backend.
///
/// Device backends decide what the bytes mean; the star forest only reads
/// and writes them through [`MemoryOps::copy`] and the slice accessors.
#[derive(Debug)]
pub struct SfBuffer {
    mtype: MemType,
    bytes: Vec<u8>,
}

impl SfBuffer {
    /// Wrap `bytes` as a buffer of memory type `mtype`. Intended for allocators.
    pub fn from_vec(mtype: MemType, bytes: Vec<u8>) -> Self {
        Self { mtype, bytes }
    }

    pub fn mtype(&self) -> MemType {
        self.mtype
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

/// Allocation and copy hooks for one memory backend.
pub trait MemoryOps: Send + Sync {
    /// Allocate `len` zeroed bytes of memory type `mtype`.
    fn malloc(&self, mtype: MemType, len: usize) -> Result<SfBuffer, SfError>;
    /// Release a buffer obtained from [`MemoryOps::malloc`].
    fn free(&self, buf: SfBuffer) -> Result<(), SfError>;
    /// Copy `src` into `dst`; both must have the same length.
    fn copy(&self, dst: &mut SfBuffer, src: &SfBuffer) -> Result<(), SfError> {
        if dst.len() != src.len() {
            return Err(SfError::BufferTooShort {
                what: "staging",
                needed: src.len(),
                got: dst.len(),
            });
        }
        dst.as_bytes_mut().copy_from_slice(src.as_bytes());
        Ok(())
    }
}

/// Plain host allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct HostMemory;

impl MemoryOps for HostMemory {
    fn malloc(&self, mtype: MemType, len: usize) -> Result<SfBuffer, SfError> {
        if mtype != MemType::Host {
            return Err(SfError::UnsupportedMemType(mtype));
        }
        Ok(SfBuffer::from_vec(MemType::Host, vec![0u8; len]))
    }

    fn free(&self, buf: SfBuffer) -> Result<(), SfError> {
        drop(buf);
        Ok(())
    }
}

/// Backend selected per memory type at construction time.
pub struct MemoryRegistry {
    host: HostMemory,
    devices: DashMap<DeviceFamily, Arc<dyn MemoryOps>>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self {
            host: HostMemory,
            devices: DashMap::new(),
        }
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let families: Vec<DeviceFamily> = self.devices.iter().map(|e| *e.key()).collect();
        f.debug_struct("MemoryRegistry")
            .field("devices", &families)
            .finish()
    }
}

impl MemoryRegistry {
    /// Install (or replace) the backend for a device family.
    pub fn register(&self, family: DeviceFamily, ops: Arc<dyn MemoryOps>) {
        log::debug!("registering memory backend for {family:?}");
        self.devices.insert(family, ops);
    }

    /// True if buffers of `mtype` can be allocated.
    pub fn supports(&self, mtype: MemType) -> bool {
        match mtype {
            MemType::Host => true,
            MemType::Device(family) => self.devices.contains_key(&family),
        }
    }

    /// Look up the backend serving `mtype`.
    pub fn ops(&self, mtype: MemType) -> Result<Arc<dyn MemoryOps>, SfError> {
        match mtype {
            MemType::Host => Ok(Arc::new(self.host)),
            MemType::Device(family) => self
                .devices
                .get(&family)
                .map(|e| Arc::clone(e.value()))
                .ok_or(SfError::UnsupportedMemType(mtype)),
        }
    }

    pub fn malloc(&self, mtype: MemType, len: usize) -> Result<SfBuffer, SfError> {
        self.ops(mtype)?.malloc(mtype, len)
    }

    pub fn free(&self, buf: SfBuffer) -> Result<(), SfError> {
        self.ops(buf.mtype())?.free(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_always_available() {
        let reg = MemoryRegistry::default();
        assert!(reg.supports(MemType::Host));
        let buf = reg.malloc(MemType::Host, 16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
        reg.free(buf).unwrap();
    }

    #[test]
    fn unregistered_device_errors() {
        let reg = MemoryRegistry::default();
        let mt = MemType::Device(DeviceFamily::Hip);
        assert!(!reg.supports(mt));
        assert_eq!(reg.malloc(mt, 4).unwrap_err(), SfError::UnsupportedMemType(mt));
    }

    #[test]
    fn copy_checks_lengths() {
        let mut dst = SfBuffer::from_vec(MemType::Host, vec![0; 2]);
        let src = SfBuffer::from_vec(MemType::Host, vec![1, 2, 3]);
        assert!(HostMemory.copy(&mut dst, &src).is_err());
    }
}
