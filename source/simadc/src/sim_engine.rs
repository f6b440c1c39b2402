//! A simulated acquisition engine.
//!
//! [`SimAcquisition`] plays the hardware's role: each accepted transfer
//! spawns a task that sleeps for the acquisition time the sample rate
//! implies, then writes a recognizable sample ramp into the region and
//! fires the completion signal. Termination aborts the task, so a
//! cancelled capture leaves the buffer untouched.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use dmacap::{
    CompletionSignal, Direction, DmaEngine, DmaRegion, EngineError, EngineStatus, Ticket,
    TransferDescriptor,
};

/// Width of one simulated ADC sample.
pub const SAMPLE_BYTES: usize = 4;

pub struct SimAcquisition {
    sample_period: Duration,
    shared: Arc<Mutex<Shared>>,
}

struct Shared {
    next_ticket: u32,
    active: Option<Active>,
}

struct Active {
    ticket: Ticket,
    status: EngineStatus,
    task: JoinHandle<()>,
}

impl SimAcquisition {
    pub fn new(sample_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            sample_period,
            shared: Arc::new(Mutex::new(Shared {
                next_ticket: 1,
                active: None,
            })),
        })
    }
}

impl DmaEngine for SimAcquisition {
    fn submit(
        &self,
        descriptor: TransferDescriptor,
        done: CompletionSignal,
    ) -> Result<Ticket, EngineError> {
        // an ADC only produces data; it has nothing to read from memory
        if descriptor.direction != Direction::DeviceToMemory {
            return Err(EngineError::Rejected);
        }

        let mut shared = self.shared.lock().unwrap();
        let ticket = Ticket::new(shared.next_ticket).ok_or(EngineError::Exhausted)?;
        shared.next_ticket = shared.next_ticket.wrapping_add(1);

        let region = descriptor.region;
        let samples = region.len() / SAMPLE_BYTES;
        let acquisition = self.sample_period * samples as u32;
        debug!(
            ticket = ticket.get(),
            samples,
            ?acquisition,
            "acquisition started"
        );

        let shared_handle = self.shared.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(acquisition).await;
            {
                let mut shared = shared_handle.lock().unwrap();
                match shared.active.as_mut() {
                    Some(active) if active.ticket == ticket => {
                        write_ramp(&region, ticket);
                        active.status = EngineStatus::Complete;
                    }
                    // terminated or superseded while we slept
                    _ => return,
                }
            }
            trace!(ticket = ticket.get(), "acquisition complete");
            done.signal();
        });

        shared.active = Some(Active {
            ticket,
            status: EngineStatus::InProgress,
            task,
        });
        Ok(ticket)
    }

    fn transfer_status(&self, ticket: Ticket) -> EngineStatus {
        match self.shared.lock().unwrap().active.as_ref() {
            Some(active) if active.ticket == ticket => active.status,
            _ => EngineStatus::Error,
        }
    }

    fn terminate_all(&self) {
        let mut shared = self.shared.lock().unwrap();
        if let Some(active) = shared.active.as_mut() {
            debug!(ticket = active.ticket.get(), "acquisition terminated");
            active.task.abort();
            if active.status == EngineStatus::InProgress {
                active.status = EngineStatus::Error;
            }
        }
    }
}

/// Fill the region with a little-endian `u32` ramp tagged with the ticket,
/// so each capture's data is distinguishable from the last.
fn write_ramp(region: &DmaRegion, ticket: Ticket) {
    let base = region.as_ptr();
    for i in 0..(region.len() / SAMPLE_BYTES) {
        let sample = (ticket.get() << 16) | (i as u32 & 0xFFFF);
        let bytes = sample.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(i * SAMPLE_BYTES), SAMPLE_BYTES)
        };
    }
}
