//! # Completion Signalling
//!
//! The channel only ever has one transfer's completion to track, so instead
//! of a queue there is a single reusable completion slot: the channel owns a
//! [`Completion`], and each submit arms it and hands the engine a single-use
//! [`CompletionSignal`].
//!
//! Arming bumps a generation counter, and a signal only takes effect if its
//! generation is still the current one. That one rule absorbs the awkward
//! race in the whole design: a hardware callback can fire *after* the
//! channel has been cancelled (or after a later transfer has been
//! submitted), and when it does, it must be a harmless no-op rather than a
//! use-after-reset.
//!
//! The signal path performs the mirror image of submission before releasing
//! the waiter: it ends the buffer's hardware mapping first, then publishes
//! the completion. A waiter can therefore treat "the completion resolved" as
//! "the hardware is done writing".

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::trace;

use crate::buffer::CoherentBuffer;

/// The channel's reusable completion slot.
///
/// Created in the signaled state: "no transfer pending".
pub(crate) struct Completion {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    generation: u64,
    signaled: bool,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    generation: 0,
                    signaled: true,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Arm the slot for a new transfer, returning the signal handle for the
    /// engine. Any previously-issued signal goes stale.
    pub(crate) fn arm(&self, buffer: Arc<CoherentBuffer>) -> CompletionSignal {
        let mut st = self.inner.state.lock().unwrap();
        st.generation += 1;
        st.signaled = false;
        CompletionSignal {
            inner: self.inner.clone(),
            buffer,
            generation: st.generation,
        }
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.inner.state.lock().unwrap().signaled
    }

    /// Force the slot into the signaled state, draining any blocked waiter,
    /// and invalidate every outstanding [`CompletionSignal`]. The cancel
    /// path.
    pub(crate) fn force_signal(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.generation += 1;
        st.signaled = true;
        drop(st);
        self.inner.notify.notify_waiters();
    }

    /// Resolve once the slot is signaled. Returns immediately if it already
    /// is.
    pub(crate) async fn wait(&self) {
        // register-before-check, so a signal landing between the check and
        // the await cannot be missed
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.is_signaled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

/// The engine-facing half of the completion slot.
///
/// Consumed by [`signal`](CompletionSignal::signal), which the engine's
/// completion path invokes exactly once per accepted transfer, from whatever
/// context it runs its callbacks on.
pub struct CompletionSignal {
    inner: Arc<Inner>,
    buffer: Arc<CoherentBuffer>,
    generation: u64,
}

impl CompletionSignal {
    /// Mark the transfer finished: unmap the buffer, then release the
    /// waiter.
    ///
    /// Stale signals (outlived by a cancel or a later submit) do nothing at
    /// all; in particular they do not touch the mapping, which by then
    /// belongs to somebody else. This never blocks beyond a few-instruction
    /// critical section.
    pub fn signal(self) {
        let mut st = self.inner.state.lock().unwrap();
        if st.generation != self.generation {
            trace!(
                generation = self.generation,
                current = st.generation,
                "stale completion signal ignored"
            );
            return;
        }
        // mirror of submission: hardware is done, unmap before publishing
        self.buffer.end_hw_access();
        st.signaled = true;
        drop(st);
        self.inner.notify.notify_waiters();
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> Arc<CoherentBuffer> {
        Arc::new(CoherentBuffer::allocate(64, 4).unwrap())
    }

    #[test]
    fn starts_signaled() {
        let cmp = Completion::new();
        assert!(cmp.is_signaled());
    }

    #[test]
    fn arm_then_signal() {
        let cmp = Completion::new();
        let buf = buffer();
        buf.begin_hw_access();
        let sig = cmp.arm(buf.clone());
        assert!(!cmp.is_signaled());
        sig.signal();
        assert!(cmp.is_signaled());
        assert!(!buf.is_hw_mapped());
    }

    #[test]
    fn superseded_signal_is_inert() {
        let cmp = Completion::new();
        let buf = buffer();
        let stale = cmp.arm(buf.clone());

        // a later transfer arms the slot again
        buf.begin_hw_access();
        let current = cmp.arm(buf.clone());

        stale.signal();
        assert!(!cmp.is_signaled(), "stale signal must not resolve the slot");
        assert!(buf.is_hw_mapped(), "stale signal must not unmap");

        current.signal();
        assert!(cmp.is_signaled());
        assert!(!buf.is_hw_mapped());
    }

    #[test]
    fn cancelled_signal_is_inert() {
        let cmp = Completion::new();
        let buf = buffer();
        buf.begin_hw_access();
        let sig = cmp.arm(buf.clone());

        cmp.force_signal();
        buf.end_hw_access();
        assert!(cmp.is_signaled());

        // late hardware callback after the cancel
        sig.signal();
        assert!(cmp.is_signaled());
        assert!(!buf.is_hw_mapped());
    }

    #[tokio::test]
    async fn wait_resolves_on_signal() {
        let cmp = Completion::new();
        let sig = cmp.arm(buffer());

        let waited = tokio::spawn({
            let inner = cmp.inner.clone();
            async move {
                let cmp = Completion { inner };
                cmp.wait().await;
            }
        });
        tokio::task::yield_now().await;

        sig.signal();
        waited.await.unwrap();
    }

    #[tokio::test]
    async fn force_signal_drains_waiter() {
        let cmp = Completion::new();
        let _sig = cmp.arm(buffer());

        let waited = tokio::spawn({
            let inner = cmp.inner.clone();
            async move {
                let cmp = Completion { inner };
                cmp.wait().await;
            }
        });
        tokio::task::yield_now().await;

        cmp.force_signal();
        waited.await.unwrap();
    }
}
