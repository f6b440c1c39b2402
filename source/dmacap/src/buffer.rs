//! # Transfer Buffer
//!
//! One allocation of `capacity` bytes that is (a) addressable by the DMA
//! engine and (b) exposable to a consumer as a directly addressable view,
//! with no copy in between.
//!
//! The buffer knows nothing about transfers except a single `mapped` flag:
//! while the region is hardware-mapped, the engine is the authoritative
//! writer and consumer reads are undefined. The
//! [controller](crate::channel::DmaChannel) brackets every transfer with
//! [`begin_hw_access`](CoherentBuffer::begin_hw_access) /
//! [`end_hw_access`](CoherentBuffer::end_hw_access); the buffer just records
//! the fact.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fmt,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::debug;

use crate::engine::DmaRegion;

/// Coherent allocations are page-aligned, like any real DMA pool would hand
/// out.
const PAGE_ALIGN: usize = 4096;

/// A single physically-contiguous (or IOMMU-backed), CPU/DMA-coherent
/// memory region, allocated once for the lifetime of a channel.
pub struct CoherentBuffer {
    data: NonNull<u8>,
    bus_addr: u64,
    capacity: usize,
    unit: usize,
    hw_mapped: AtomicBool,
    /// Whether `data` came from our own allocator (and must be freed on
    /// drop) or was adopted from a collaborator.
    owned: bool,
}

// Shared access is mediated by the mapping discipline, not by references:
// the raw pointer is only written through while hardware-mapped, and only
// read through while not.
unsafe impl Send for CoherentBuffer {}
unsafe impl Sync for CoherentBuffer {}

impl CoherentBuffer {
    /// Allocate a zeroed, host-coherent region of `capacity` bytes with a
    /// transfer granularity of `unit` bytes.
    ///
    /// This is the allocation path used by hosts and simulations. On real
    /// hardware the platform glue owns the coherent allocator and should use
    /// [`from_raw_parts`](Self::from_raw_parts) instead.
    pub fn allocate(capacity: usize, unit: usize) -> Result<Self, BufferError> {
        check_geometry(capacity, unit)?;
        let layout =
            Layout::from_size_align(capacity, PAGE_ALIGN).map_err(|_| BufferError::AllocFailed)?;
        let data =
            NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(BufferError::AllocFailed)?;
        debug!(capacity, unit, cpu = ?data, "allocated coherent buffer");
        Ok(Self {
            bus_addr: data.as_ptr() as u64,
            data,
            capacity,
            unit,
            hw_mapped: AtomicBool::new(false),
            owned: true,
        })
    }

    /// Adopt a collaborator-provided CPU pointer / bus address pair.
    ///
    /// The region is *not* freed on drop; whoever allocated it keeps
    /// ownership of the memory itself.
    ///
    /// # Safety
    ///
    /// `cpu` must point to at least `capacity` bytes that remain valid (and
    /// reachable by the engine at `bus_addr`) for the lifetime of this
    /// buffer, and nothing else may access them for that duration.
    pub unsafe fn from_raw_parts(
        cpu: NonNull<u8>,
        bus_addr: u64,
        capacity: usize,
        unit: usize,
    ) -> Result<Self, BufferError> {
        check_geometry(capacity, unit)?;
        debug!(capacity, unit, bus_addr, "adopted coherent buffer");
        Ok(Self {
            data: cpu,
            bus_addr,
            capacity,
            unit,
            hw_mapped: AtomicBool::new(false),
            owned: false,
        })
    }

    /// Fixed maximum transfer size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Minimum transfer granularity in bytes (one hardware sample width).
    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Hardware-visible address of the region.
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Whether the region is currently registered with the engine for
    /// hardware access.
    pub fn is_hw_mapped(&self) -> bool {
        self.hw_mapped.load(Ordering::Acquire)
    }

    pub(crate) fn begin_hw_access(&self) {
        self.hw_mapped.store(true, Ordering::Release);
    }

    pub(crate) fn end_hw_access(&self) {
        self.hw_mapped.store(false, Ordering::Release);
    }

    /// The leading `len` bytes of the region, as a descriptor extent.
    pub(crate) fn region(&self, len: usize) -> DmaRegion {
        debug_assert!(len <= self.capacity);
        DmaRegion::new(self.data, self.bus_addr, len)
    }

    /// Map (a prefix of) the buffer for a consumer.
    ///
    /// Single-region design: `offset` must be 0 and `len` may not exceed the
    /// capacity. There is no sub-buffer paging.
    pub fn view(self: &Arc<Self>, offset: usize, len: usize) -> Result<BufferView, InvalidRange> {
        if offset != 0 || len > self.capacity {
            return Err(InvalidRange { offset, len });
        }
        Ok(BufferView {
            buf: self.clone(),
            len,
        })
    }
}

impl Drop for CoherentBuffer {
    fn drop(&mut self) {
        if self.owned {
            // geometry was validated at allocation time
            let layout = unsafe { Layout::from_size_align_unchecked(self.capacity, PAGE_ALIGN) };
            unsafe { dealloc(self.data.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for CoherentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoherentBuffer")
            .field("capacity", &self.capacity)
            .field("unit", &self.unit)
            .field("bus_addr", &self.bus_addr)
            .field("hw_mapped", &self.is_hw_mapped())
            .finish()
    }
}

fn check_geometry(capacity: usize, unit: usize) -> Result<(), BufferError> {
    if capacity == 0 {
        return Err(BufferError::ZeroCapacity);
    }
    if unit == 0 {
        return Err(BufferError::ZeroUnit);
    }
    if capacity % unit != 0 {
        return Err(BufferError::Misaligned { capacity, unit });
    }
    Ok(())
}

/// A zero-copy consumer mapping of (a prefix of) the transfer buffer.
///
/// Cheap to clone and `Send`; it keeps the underlying buffer alive. The
/// bytes are only meaningful while no transfer is in flight: after a
/// [`wait`](crate::channel::DmaChannel::wait) or
/// [`status`](crate::channel::DmaChannel::status) has reported a terminal
/// status, and before the next submit.
#[derive(Clone)]
pub struct BufferView {
    buf: Arc<CoherentBuffer>,
    len: usize,
}

impl BufferView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf.data.as_ptr(), self.len) }
    }
}

impl fmt::Debug for BufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("len", &self.len)
            .field("capacity", &self.buf.capacity)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Error Types
////////////////////////////////////////////////////////////////////////////////

/// The channel never comes online with a broken buffer; these are
/// initialization-time failures, fatal to bring-up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferError {
    ZeroCapacity,
    ZeroUnit,
    /// Capacity is not a whole number of transfer units.
    Misaligned { capacity: usize, unit: usize },
    AllocFailed,
}

/// A consumer mapping request addressed something other than the single
/// buffer region at offset 0.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InvalidRange {
    pub offset: usize,
    pub len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_validated() {
        assert_eq!(
            CoherentBuffer::allocate(0, 4).unwrap_err(),
            BufferError::ZeroCapacity
        );
        assert_eq!(
            CoherentBuffer::allocate(4096, 0).unwrap_err(),
            BufferError::ZeroUnit
        );
        assert_eq!(
            CoherentBuffer::allocate(4097, 4).unwrap_err(),
            BufferError::Misaligned {
                capacity: 4097,
                unit: 4
            }
        );
    }

    #[test]
    fn fresh_buffer_is_zeroed_and_unmapped() {
        let buf = Arc::new(CoherentBuffer::allocate(4096, 4).unwrap());
        assert!(!buf.is_hw_mapped());
        let view = buf.view(0, 4096).unwrap();
        assert!(view.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn view_rejects_bad_ranges() {
        let buf = Arc::new(CoherentBuffer::allocate(4096, 4).unwrap());
        assert_eq!(
            buf.view(1, 16).unwrap_err(),
            InvalidRange { offset: 1, len: 16 }
        );
        assert_eq!(
            buf.view(0, 4097).unwrap_err(),
            InvalidRange {
                offset: 0,
                len: 4097
            }
        );
        assert_eq!(buf.view(0, 4096).unwrap().len(), 4096);
    }
}
