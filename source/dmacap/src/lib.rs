//! # The dmacap transfer controller
//!
//! `dmacap` moves bulk sample data from a streaming hardware source into a
//! CPU-visible buffer using an asynchronous DMA engine, and hands that buffer
//! to consumers as a zero-copy view instead of a copy-based read path.
//!
//! The crate is a library; it contains no device discovery, no device-node
//! glue, and no knowledge of the acquisition hardware's own register
//! protocol. A hosting adapter (see the `simadc` crate in this workspace for
//! a simulated one) is expected to:
//!
//! * obtain a ready-to-use engine implementing [`DmaEngine`],
//! * provide the coherent memory region as a [`CoherentBuffer`] (either
//!   allocated here, or adopted from a collaborator-provided CPU
//!   pointer / bus address pair),
//! * construct a [`DmaChannel`] from the two, and
//! * either call the channel directly or serve it over the
//!   [`service`] request/response surface.
//!
//! ## Two actors, one buffer
//!
//! Everything interesting in this crate comes down to the fact that two
//! actors touch the same memory region: the consumer (through
//! [`BufferView`]) and the hardware engine (through the descriptor it was
//! handed). The controller brackets every transfer with a hardware-mapping
//! of the buffer, and the completion path unmaps it again *before* the
//! waiter is released, so a consumer that has seen a terminal
//! [`TransferStatus`] is guaranteed the hardware is done writing.
//!
//! The engine's completion callback is modeled as a [`CompletionSignal`]: a
//! single-use handle onto the channel's completion slot, gated by a
//! generation counter so that a callback arriving after cancellation (or
//! after a later submit) is a harmless no-op.
//!
//! At most one transfer is ever in flight; a second submit while one is
//! outstanding fails with [`SubmitError::Busy`] rather than queueing.

pub mod buffer;
pub mod channel;
pub mod comms;
pub mod engine;
pub mod service;

#[cfg(test)]
pub(crate) mod test_util;

pub use buffer::{BufferError, BufferView, CoherentBuffer, InvalidRange};
pub use channel::{ChannelSettings, ChannelState, DmaChannel, SubmitError, TransferStatus};
pub use comms::CompletionSignal;
pub use engine::{
    Direction, DmaEngine, DmaRegion, EngineError, EngineStatus, Ticket, TransferDescriptor,
};
pub use service::{ChannelClient, ChannelError, ChannelServer, Message, Request, Response};
