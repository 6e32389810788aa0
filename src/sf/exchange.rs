//! In-flight state shared by every split-phase primitive.
//!
//! A [`Link`] owns the transport handles and staging buffers of one
//! Begin/End pair. Handles are always waited on, and staging buffers always
//! returned to their allocator, whether the operation ends normally, fails
//! half-way, or is dropped without an End.

use std::borrow::Cow;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::decode_vec;
use crate::memory::{MemType, MemoryRegistry, SfBuffer};
use crate::ops::reduce::Scalar;
use crate::sf_error::SfError;

/// A posted receive.
pub(crate) struct Incoming<H> {
    /// Partition of the receiving side's plan.
    pub k: usize,
    pub rank: usize,
    pub tag: CommTag,
    len: usize,
    handle: H,
}

pub(crate) struct Link<'s, C: Communicator> {
    what: &'static str,
    comm: &'s C,
    memory: &'s MemoryRegistry,
    gpu_aware: bool,
    monitor: bool,
    incoming: Vec<Incoming<C::RecvHandle>>,
    sends: Vec<C::SendHandle>,
    staging: Vec<SfBuffer>,
    bytes_out: usize,
    bytes_in: usize,
    closed: bool,
}

impl<'s, C: Communicator> Link<'s, C> {
    pub fn new(
        what: &'static str,
        comm: &'s C,
        memory: &'s MemoryRegistry,
        gpu_aware: bool,
        monitor: bool,
    ) -> Self {
        Self {
            what,
            comm,
            memory,
            gpu_aware,
            monitor,
            incoming: Vec::new(),
            sends: Vec::new(),
            staging: Vec::new(),
            bytes_out: 0,
            bytes_in: 0,
            closed: false,
        }
    }

    pub fn post_recv(&mut self, k: usize, rank: usize, tag: CommTag, len: usize) {
        log::trace!("{}: rank {} posts {len} bytes from {rank}", self.what, self.comm.rank());
        let handle = self.comm.irecv(rank, tag.as_u16(), len);
        self.incoming.push(Incoming {
            k,
            rank,
            tag,
            len,
            handle,
        });
    }

    /// Bytes to hand to the transport for `packed`, which lives in `mtype` memory.
    ///
    /// Device data is first placed in a device buffer and, unless the
    /// transport is device-aware, copied to a host staging buffer.
    pub fn outbound<'b>(&mut self, mtype: MemType, packed: &'b [u8]) -> Result<Cow<'b, [u8]>, SfError> {
        if !mtype.is_device() {
            return Ok(Cow::Borrowed(packed));
        }
        let mut device = self.memory.malloc(mtype, packed.len())?;
        device.as_bytes_mut().copy_from_slice(packed);
        let wire = if self.gpu_aware {
            device
        } else {
            let mut host = self.memory.malloc(MemType::Host, packed.len())?;
            self.memory.ops(mtype)?.copy(&mut host, &device)?;
            self.staging.push(device);
            host
        };
        let bytes = wire.as_bytes().to_vec();
        self.staging.push(wire);
        Ok(Cow::Owned(bytes))
    }

    pub fn send(&mut self, rank: usize, tag: CommTag, mtype: MemType, packed: &[u8]) -> Result<(), SfError> {
        let wire = self.outbound(mtype, packed)?;
        log::trace!("{}: rank {} sends {} bytes to {rank}", self.what, self.comm.rank(), wire.len());
        self.bytes_out += wire.len();
        let handle = self.comm.isend(rank, tag.as_u16(), &wire);
        self.sends.push(handle);
        Ok(())
    }

    /// Count bytes delivered outside the two-sided path.
    pub fn note_put(&mut self, n: usize) {
        self.bytes_out += n;
    }

    pub fn take_incoming(&mut self) -> Vec<Incoming<C::RecvHandle>> {
        std::mem::take(&mut self.incoming)
    }

    /// Wait for one receive and decode it into `mtype` memory.
    pub fn receive<T: Scalar>(&mut self, inc: Incoming<C::RecvHandle>, mtype: MemType) -> Result<Vec<T>, SfError> {
        let Incoming { rank, len, handle, .. } = inc;
        let bytes = handle.wait().ok_or_else(|| SfError::CommError {
            neighbor: rank,
            reason: format!("{}: receive completed without data", self.what),
        })?;
        if bytes.len() != len {
            return Err(SfError::CommError {
                neighbor: rank,
                reason: format!("{}: expected {len} bytes, got {}", self.what, bytes.len()),
            });
        }
        self.land(mtype, bytes, rank)
    }

    /// Move bytes received in host memory into `mtype` memory and decode them.
    pub fn land<T: Scalar>(&mut self, mtype: MemType, bytes: Vec<u8>, neighbor: usize) -> Result<Vec<T>, SfError> {
        self.bytes_in += bytes.len();
        let decode = |b: &[u8]| {
            decode_vec::<T>(b).map_err(|reason| SfError::CommError { neighbor, reason })
        };
        if !mtype.is_device() {
            return decode(bytes.as_slice());
        }
        let mut device = self.memory.malloc(mtype, bytes.len())?;
        if self.gpu_aware {
            device.as_bytes_mut().copy_from_slice(&bytes);
        } else {
            let host = SfBuffer::from_vec(MemType::Host, bytes);
            self.memory.ops(mtype)?.copy(&mut device, &host)?;
        }
        let out = decode(device.as_bytes());
        self.staging.push(device);
        out
    }

    fn drain(&mut self) -> Result<(), SfError> {
        for inc in self.incoming.drain(..) {
            let _ = inc.handle.wait();
        }
        for s in self.sends.drain(..) {
            let _ = s.wait();
        }
        let mut first = Ok(());
        for buf in self.staging.drain(..) {
            if let Err(e) = self.memory.free(buf) {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    pub fn begun(&self) {
        if self.monitor {
            log::info!(
                "{} begin: rank {}, {} receives posted, {} sends, {} bytes out",
                self.what,
                self.comm.rank(),
                self.incoming.len(),
                self.sends.len(),
                self.bytes_out
            );
        }
    }

    /// Complete every outstanding request and release staging buffers.
    pub fn close(mut self) -> Result<(), SfError> {
        let res = self.drain();
        self.closed = true;
        if self.monitor {
            log::info!(
                "{} end: rank {}, {} bytes in, {} bytes out",
                self.what,
                self.comm.rank(),
                self.bytes_in,
                self.bytes_out
            );
        }
        res
    }
}

impl<'s, C: Communicator> Drop for Link<'s, C> {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!(
                "{} request on rank {} dropped without end; draining",
                self.what,
                self.comm.rank()
            );
            let _ = self.drain();
        }
    }
}
