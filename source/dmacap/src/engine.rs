//! # DMA Engine Binding
//!
//! The transfer engine itself is an external collaborator: an opaque,
//! asynchronous piece of hardware (or a simulation of one) that accepts a
//! transfer descriptor and fires a completion notification when it has
//! finished moving bytes. This module is only the seam: the [`DmaEngine`]
//! trait plus the descriptor/ticket/status vocabulary shared between the
//! engine and the [controller](crate::channel).

use std::{num::NonZeroU32, ptr::NonNull};

use crate::comms::CompletionSignal;

////////////////////////////////////////////////////////////////////////////////
// Engine Definition
////////////////////////////////////////////////////////////////////////////////

/// Interface to an asynchronous hardware DMA engine.
///
/// Implementations are handed a fully-built [`TransferDescriptor`] and a
/// [`CompletionSignal`]. The contract:
///
/// * [`submit`](DmaEngine::submit) must not block. On success it returns a
///   [`Ticket`] identifying the transfer for later status queries.
/// * The engine fires the signal **exactly once** per accepted descriptor,
///   from whatever context it likes (another task, another thread, or even
///   synchronously from within `submit` itself). Firing late (after the
///   channel has cancelled or resubmitted) is tolerated; the signal
///   degrades to a no-op.
/// * [`terminate_all`](DmaEngine::terminate_all) stops all activity on the
///   channel. It may race an in-flight completion; that race is absorbed on
///   the signal side, not here.
pub trait DmaEngine: Send + Sync {
    /// Hand a descriptor to the hardware. Non-blocking.
    fn submit(
        &self,
        descriptor: TransferDescriptor,
        done: CompletionSignal,
    ) -> Result<Ticket, EngineError>;

    /// Report the engine's view of the transfer identified by `ticket`.
    ///
    /// Must never sleep. A ticket the engine no longer knows about reads as
    /// [`EngineStatus::Error`].
    fn transfer_status(&self, ticket: Ticket) -> EngineStatus;

    /// Terminate all activity on the channel. Idempotent.
    fn terminate_all(&self);
}

////////////////////////////////////////////////////////////////////////////////
// Descriptor Types
////////////////////////////////////////////////////////////////////////////////

/// One transfer request, as handed to the engine.
#[derive(Copy, Clone, Debug)]
pub struct TransferDescriptor {
    /// The memory extent registered for hardware access.
    pub region: DmaRegion,
    /// Which way the bytes flow. This system only issues
    /// [`Direction::DeviceToMemory`].
    pub direction: Direction,
}

/// Direction of a transfer, relative to memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device writes into memory (capture).
    DeviceToMemory,
    /// Memory is read out to the device.
    MemoryToDevice,
}

/// A memory extent visible to both the CPU and the engine.
///
/// Carries the CPU-visible pointer and the hardware-visible bus address of
/// the same bytes. The region is only ever derived from a
/// [`CoherentBuffer`](crate::buffer::CoherentBuffer), whose mapping bracket
/// decides who may touch it at any given moment; the raw pointer here is for
/// the engine's side of that bracket.
#[derive(Copy, Clone, Debug)]
pub struct DmaRegion {
    cpu: NonNull<u8>,
    bus: u64,
    len: usize,
}

// The pointer is only dereferenced by whichever actor currently holds the
// mapping, which is what makes handing it across threads sound.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    pub(crate) fn new(cpu: NonNull<u8>, bus: u64, len: usize) -> Self {
        Self { cpu, bus, len }
    }

    /// CPU-visible base of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.cpu.as_ptr()
    }

    /// Hardware-visible address of the same bytes.
    pub fn bus_addr(&self) -> u64 {
        self.bus
    }

    /// Extent of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Opaque identifier for one submitted transfer.
///
/// Tickets are engine-issued and never zero; the channel represents "no
/// transfer has ever been submitted" as the absence of a ticket.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ticket(NonZeroU32);

impl Ticket {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Status and Error Types
////////////////////////////////////////////////////////////////////////////////

/// The engine's view of a submitted transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    /// The hardware has finished the transfer successfully.
    Complete,
    /// The transfer is still moving (or queued).
    InProgress,
    /// The transfer is paused on the hardware side.
    Paused,
    /// The hardware reported a failure, or the ticket is unknown.
    Error,
}

/// Why the engine refused a descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EngineError {
    /// Descriptor preparation failed or the engine rejected the request.
    Rejected,
    /// The engine is out of resources (descriptor slots, bounce space, ...).
    Exhausted,
}
