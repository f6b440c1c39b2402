//! # DMA Transfer Controller
//!
//! [`DmaChannel`] owns the transfer buffer and the engine handle for one
//! hardware channel, and coordinates a synchronous submit/wait/status/cancel
//! protocol on top of the engine's asynchronous completion path.
//!
//! The bookkeeping (state, ticket, active size, timeout) lives under one
//! mutex that is never held across an await point; the completion path never
//! takes it at all (it only touches the [completion
//! slot](crate::comms::Completion) and the buffer's mapping flag), so an
//! engine that fires its callback synchronously from inside `submit` cannot
//! deadlock the channel.
//!
//! Outcome recording is epoch-gated: `wait` and `status` remember which
//! submission epoch they observed and only write their result back if no
//! cancel or resubmit happened in between. A drained waiter can therefore
//! never clobber the clean Idle state a cancel just established.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::{
    buffer::{BufferView, CoherentBuffer, InvalidRange},
    comms::Completion,
    engine::{Direction, DmaEngine, EngineError, EngineStatus, Ticket, TransferDescriptor},
};

////////////////////////////////////////////////////////////////////////////////
// Status Taxonomy
////////////////////////////////////////////////////////////////////////////////

/// Externally visible transfer status, as reported by
/// [`wait`](DmaChannel::wait) and [`status`](DmaChannel::status).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer finished and the buffer holds its data.
    Complete,
    /// A transfer is still moving.
    InProgress,
    /// The transfer is paused on the hardware side.
    Paused,
    /// The hardware reported a failure; buffer contents are not guaranteed.
    Error,
    /// The wait deadline elapsed with no completion. The transfer is left
    /// outstanding; cancel it to abandon it.
    Timeout,
    /// No transfer has ever been submitted on this channel.
    NoTransfer,
    /// The most recent submit was rejected before reaching the hardware.
    SubmitError,
}

impl TransferStatus {
    /// Whether this status ends a transfer (as opposed to describing one
    /// still owned by the hardware, or the absence of one).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Complete
                | TransferStatus::Error
                | TransferStatus::Timeout
                | TransferStatus::SubmitError
        )
    }
}

/// Internal channel state. Totals: every operation yields a defined next
/// state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Submitting,
    InProgress,
    Paused,
    Complete,
    Error,
    TimedOut,
    SubmitError,
}

/// Why a submit was refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubmitError {
    /// A transfer is already in flight; wait for it or cancel it first.
    Busy,
    /// The size is zero, exceeds the buffer capacity, or is not a multiple
    /// of the transfer unit.
    InvalidSize(usize),
    /// The engine rejected the descriptor. The mapping was rolled back and
    /// the channel is immediately reusable.
    Engine(EngineError),
}

////////////////////////////////////////////////////////////////////////////////
// Settings
////////////////////////////////////////////////////////////////////////////////

#[derive(Copy, Clone, Debug)]
pub struct ChannelSettings {
    /// Deadline applied to every [`wait`](DmaChannel::wait).
    pub timeout: Duration,
}

impl ChannelSettings {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Controller
////////////////////////////////////////////////////////////////////////////////

/// The DMA transfer controller for a single hardware channel.
///
/// Owns the [`CoherentBuffer`] and the [`DmaEngine`] handle for its whole
/// lifetime; transfers are created and retired repeatedly within it. At most
/// one transfer is ever in flight.
pub struct DmaChannel {
    engine: Arc<dyn DmaEngine>,
    buffer: Arc<CoherentBuffer>,
    completion: Completion,
    shared: Mutex<Bookkeeping>,
}

struct Bookkeeping {
    state: ChannelState,
    ticket: Option<Ticket>,
    active_size: usize,
    timeout: Duration,
    /// Bumped on every submit and cancel; gates late outcome recording.
    epoch: u64,
}

impl DmaChannel {
    pub fn new(
        engine: Arc<dyn DmaEngine>,
        buffer: Arc<CoherentBuffer>,
        settings: ChannelSettings,
    ) -> Self {
        info!(
            capacity = buffer.capacity(),
            unit = buffer.unit(),
            timeout = ?settings.timeout,
            "dma channel ready"
        );
        Self {
            engine,
            buffer,
            completion: Completion::new(),
            shared: Mutex::new(Bookkeeping {
                state: ChannelState::Idle,
                ticket: None,
                active_size: 0,
                timeout: settings.timeout,
                epoch: 0,
            }),
        }
    }

    /// Submit a transfer of `size` bytes. Non-blocking.
    ///
    /// Validation happens in order, before any engine interaction: Busy if a
    /// transfer is already in flight, then `0 < size <= capacity`, then
    /// `size % unit == 0`. On acceptance the buffer is hardware-mapped, the
    /// completion slot armed, and the descriptor handed to the engine; the
    /// channel is then `InProgress` with `active_size = size`.
    pub fn submit(&self, size: usize) -> Result<(), SubmitError> {
        let mut bk = self.shared.lock().unwrap();

        if matches!(
            bk.state,
            ChannelState::Submitting | ChannelState::InProgress
        ) {
            trace!(size, "submit refused, transfer in flight");
            return Err(SubmitError::Busy);
        }
        if size == 0 || size > self.buffer.capacity() || size % self.buffer.unit() != 0 {
            trace!(
                size,
                capacity = self.buffer.capacity(),
                unit = self.buffer.unit(),
                "submit refused, invalid size"
            );
            return Err(SubmitError::InvalidSize(size));
        }

        bk.state = ChannelState::Submitting;
        bk.epoch += 1;

        self.buffer.begin_hw_access();
        let done = self.completion.arm(self.buffer.clone());
        let descriptor = TransferDescriptor {
            region: self.buffer.region(size),
            direction: Direction::DeviceToMemory,
        };

        match self.engine.submit(descriptor, done) {
            Ok(ticket) => {
                debug!(size, ticket = ticket.get(), "transfer submitted");
                bk.ticket = Some(ticket);
                bk.active_size = size;
                bk.state = ChannelState::InProgress;
                Ok(())
            }
            Err(error) => {
                warn!(size, ?error, "engine refused transfer");
                // roll the mapping back before reporting
                self.buffer.end_hw_access();
                bk.state = ChannelState::SubmitError;
                Err(SubmitError::Engine(error))
            }
        }
    }

    /// Block (asynchronously) until the in-flight transfer resolves or the
    /// configured timeout elapses.
    ///
    /// Fast paths: [`TransferStatus::NoTransfer`] if nothing was ever
    /// submitted, [`TransferStatus::SubmitError`] if the last submit
    /// failed. Both are immediate and neither touches hardware. A timeout
    /// leaves the
    /// transfer outstanding.
    pub async fn wait(&self) -> TransferStatus {
        let (ticket, timeout, epoch) = {
            let bk = self.shared.lock().unwrap();
            if bk.state == ChannelState::SubmitError {
                return TransferStatus::SubmitError;
            }
            let Some(ticket) = bk.ticket else {
                return TransferStatus::NoTransfer;
            };
            (ticket, bk.timeout, bk.epoch)
        };

        let status = match time::timeout(timeout, self.completion.wait()).await {
            Err(_elapsed) => {
                warn!(ticket = ticket.get(), ?timeout, "transfer timed out");
                TransferStatus::Timeout
            }
            Ok(()) => match self.engine.transfer_status(ticket) {
                EngineStatus::Complete => TransferStatus::Complete,
                EngineStatus::Paused => TransferStatus::Paused,
                // a signaled transfer the engine still calls in-progress is
                // inconsistent; compress unknowns to an error
                EngineStatus::InProgress | EngineStatus::Error => TransferStatus::Error,
            },
        };

        let mut bk = self.shared.lock().unwrap();
        if bk.epoch == epoch {
            bk.state = match status {
                TransferStatus::Complete => ChannelState::Complete,
                TransferStatus::Paused => ChannelState::Paused,
                TransferStatus::Timeout => ChannelState::TimedOut,
                _ => ChannelState::Error,
            };
        }
        trace!(?status, "wait resolved");
        status
    }

    /// Non-blocking status poll; same taxonomy as [`wait`](Self::wait).
    ///
    /// An engine-reported completion is only surfaced as `Complete` once the
    /// completion signal has actually run (i.e. the buffer is unmapped and
    /// safe to read); until then it reads as `InProgress`.
    pub fn status(&self) -> TransferStatus {
        let (ticket, epoch) = {
            let bk = self.shared.lock().unwrap();
            if bk.state == ChannelState::SubmitError {
                return TransferStatus::SubmitError;
            }
            let Some(ticket) = bk.ticket else {
                return TransferStatus::NoTransfer;
            };
            (ticket, bk.epoch)
        };

        let status = match self.engine.transfer_status(ticket) {
            EngineStatus::Complete if !self.completion.is_signaled() => TransferStatus::InProgress,
            EngineStatus::Complete => TransferStatus::Complete,
            EngineStatus::InProgress => TransferStatus::InProgress,
            EngineStatus::Paused => TransferStatus::Paused,
            EngineStatus::Error => TransferStatus::Error,
        };

        let mut bk = self.shared.lock().unwrap();
        // a poll may only refine a live transfer's state; terminal states
        // persist until the next submit
        if bk.epoch == epoch
            && matches!(bk.state, ChannelState::InProgress | ChannelState::Paused)
        {
            bk.state = match status {
                TransferStatus::Complete => ChannelState::Complete,
                TransferStatus::InProgress => ChannelState::InProgress,
                TransferStatus::Paused => ChannelState::Paused,
                TransferStatus::Error => ChannelState::Error,
                _ => bk.state,
            };
        }
        status
    }

    /// Terminate all hardware activity and reset the channel to a clean
    /// Idle, as if no transfer had ever been submitted.
    ///
    /// Drains any blocked [`wait`](Self::wait), undoes a residual mapping,
    /// and invalidates outstanding completion signals, so a hardware
    /// callback racing this call lands as a no-op. Safe in every state and
    /// idempotent; always invoked when a consumer session ends.
    pub fn cancel(&self) {
        debug!("terminating channel activity");
        // the whole reset runs under the bookkeeping lock, so a cancel
        // racing a submit cannot terminate the engine before the descriptor
        // handover and then reset over the live transfer; the signal path
        // uses its own lock and never takes this one
        let mut bk = self.shared.lock().unwrap();
        self.engine.terminate_all();
        self.completion.force_signal();
        self.buffer.end_hw_access();

        bk.epoch += 1;
        bk.ticket = None;
        bk.active_size = 0;
        bk.state = ChannelState::Idle;
    }

    /// Change the wait deadline. Takes effect on the next
    /// [`wait`](Self::wait); a wait already in progress keeps its deadline.
    pub fn set_timeout(&self, timeout: Duration) {
        debug!(?timeout, "wait deadline updated");
        self.shared.lock().unwrap().timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.shared.lock().unwrap().timeout
    }

    /// Map (a prefix of) the buffer for consumer access. Zero-copy;
    /// `offset` must be 0 and `len` may not exceed the capacity.
    pub fn map_for_consumer(&self, offset: usize, len: usize) -> Result<BufferView, InvalidRange> {
        self.buffer.view(offset, len)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn transfer_unit(&self) -> usize {
        self.buffer.unit()
    }

    /// Byte count of the most recently submitted transfer.
    pub fn active_size(&self) -> usize {
        self.shared.lock().unwrap().active_size
    }

    pub fn state(&self) -> ChannelState {
        self.shared.lock().unwrap().state
    }

    /// Ticket of the current transfer, if any was ever submitted.
    pub fn ticket(&self) -> Option<Ticket> {
        self.shared.lock().unwrap().ticket
    }
}

impl Drop for DmaChannel {
    fn drop(&mut self) {
        // channel teardown: stop the hardware before the buffer goes away
        self.engine.terminate_all();
    }
}
