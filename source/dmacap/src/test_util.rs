//! Shared test helpers: a scripted in-memory [`DmaEngine`] and tracing
//! setup.

use std::sync::{Arc, Mutex};

use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use crate::{
    comms::CompletionSignal,
    engine::{Direction, DmaEngine, DmaRegion, EngineError, EngineStatus, Ticket, TransferDescriptor},
};

pub(crate) fn trace_init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::TRACE.into())
        .from_env_lossy();
    // a second init in the same process is fine, keep the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .without_time()
        .try_init();
}

/// A hand-cranked engine: tests decide when (and how) each transfer
/// finishes. [`FakeEngine::auto_complete`] builds the self-driving variant
/// that completes every transfer from inside `submit`.
pub(crate) struct FakeEngine {
    inner: Mutex<Inner>,
}

struct Inner {
    next_ticket: u32,
    submits: usize,
    terminates: usize,
    reject_next: bool,
    auto_complete: bool,
    active: Option<Active>,
}

struct Active {
    ticket: Ticket,
    region: DmaRegion,
    status: EngineStatus,
    done: Option<CompletionSignal>,
}

impl FakeEngine {
    /// Byte written over a completed transfer's region, so tests can tell
    /// captured data from the zeroed buffer.
    pub(crate) const FILL: u8 = 0xA5;

    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_ticket: 1,
                submits: 0,
                terminates: 0,
                reject_next: false,
                auto_complete: false,
                active: None,
            }),
        })
    }

    pub(crate) fn auto_complete() -> Arc<Self> {
        let engine = Self::new();
        engine.inner.lock().unwrap().auto_complete = true;
        engine
    }

    /// Make the next submit fail with [`EngineError::Rejected`].
    pub(crate) fn reject_next(&self) {
        self.inner.lock().unwrap().reject_next = true;
    }

    pub(crate) fn submit_count(&self) -> usize {
        self.inner.lock().unwrap().submits
    }

    pub(crate) fn terminate_count(&self) -> usize {
        self.inner.lock().unwrap().terminates
    }

    /// Change the active transfer's reported status without firing its
    /// completion signal.
    pub(crate) fn set_status(&self, status: EngineStatus) {
        let mut inner = self.inner.lock().unwrap();
        let active = inner.active.as_mut().expect("no active transfer");
        active.status = status;
    }

    /// Resolve the active transfer: set its status, fill the region on
    /// success, and fire its completion signal.
    pub(crate) fn finish(&self, status: EngineStatus) {
        let done = {
            let mut inner = self.inner.lock().unwrap();
            let active = inner.active.as_mut().expect("no active transfer");
            if status == EngineStatus::Complete {
                fill(&active.region);
            }
            active.status = status;
            active.done.take()
        };
        // fire outside the lock, like a real completion context would
        if let Some(done) = done {
            done.signal();
        }
    }

    /// Steal the active transfer's completion signal, so a test can fire it
    /// at a moment of its choosing.
    pub(crate) fn take_signal(&self) -> Option<CompletionSignal> {
        self.inner
            .lock()
            .unwrap()
            .active
            .as_mut()
            .and_then(|active| active.done.take())
    }
}

impl DmaEngine for FakeEngine {
    fn submit(
        &self,
        descriptor: TransferDescriptor,
        done: CompletionSignal,
    ) -> Result<Ticket, EngineError> {
        let (ticket, done) = {
            let mut inner = self.inner.lock().unwrap();
            inner.submits += 1;
            if inner.reject_next {
                inner.reject_next = false;
                return Err(EngineError::Rejected);
            }
            assert_eq!(descriptor.direction, Direction::DeviceToMemory);

            let ticket = Ticket::new(inner.next_ticket).unwrap();
            inner.next_ticket += 1;

            let mut active = Active {
                ticket,
                region: descriptor.region,
                status: EngineStatus::InProgress,
                done: Some(done),
            };
            let done = if inner.auto_complete {
                fill(&active.region);
                active.status = EngineStatus::Complete;
                active.done.take()
            } else {
                None
            };
            inner.active = Some(active);
            (ticket, done)
        };
        if let Some(done) = done {
            done.signal();
        }
        Ok(ticket)
    }

    fn transfer_status(&self, ticket: Ticket) -> EngineStatus {
        match self.inner.lock().unwrap().active.as_ref() {
            Some(active) if active.ticket == ticket => active.status,
            // forgotten tickets read as an error
            _ => EngineStatus::Error,
        }
    }

    fn terminate_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.terminates += 1;
        if let Some(active) = inner.active.as_mut() {
            // the signal is deliberately kept: tests use it to model a
            // callback that was already in flight when the terminate landed
            active.status = EngineStatus::Error;
        }
    }
}

fn fill(region: &DmaRegion) {
    unsafe { std::ptr::write_bytes(region.as_ptr(), FakeEngine::FILL, region.len()) };
}
