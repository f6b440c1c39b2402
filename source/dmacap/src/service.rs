//! # Channel Access Surface
//!
//! The request/response protocol a consumer process speaks to the channel:
//! a thin translation layer over [`DmaChannel`], split into a
//! [`ChannelServer`] (owns the run loop) and a cloneable [`ChannelClient`]
//! (typed convenience methods, one per operation).
//!
//! Requests travel as [`Message`]s over a bounded channel, each carrying a
//! one-shot reply handle. `Wait` is the only operation that can block, so
//! the server hands it off to its own task; a blocked wait never stalls
//! submit/status/cancel traffic from other sessions, which is what keeps
//! the Busy semantics observable to concurrent callers.
//!
//! `Close` ends a consumer session: it cancels whatever is in flight and
//! returns the channel to a guaranteed-clean Idle. The same reset runs when
//! the last client is dropped.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::{
    buffer::{BufferView, InvalidRange},
    channel::{DmaChannel, SubmitError, TransferStatus},
    engine::EngineError,
};

////////////////////////////////////////////////////////////////////////////////
// Message and Error Types
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub enum Request {
    /// Submit a transfer of `len` bytes. Non-blocking.
    Submit { len: u32 },
    /// Block until the in-flight transfer resolves or the deadline elapses.
    Wait,
    /// Non-blocking status poll.
    Status,
    /// Change the wait deadline; affects subsequent waits only.
    SetTimeout { ms: u32 },
    /// Map the buffer region for zero-copy access. `offset` must be 0.
    MapBuffer { offset: u32, len: u32 },
    /// End the session: cancel anything in flight, reset to Idle.
    Close,
}

#[derive(Debug)]
pub enum Response {
    Submitted,
    Status(TransferStatus),
    TimeoutSet,
    Mapped(BufferView),
    Closed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelError {
    /// A transfer is already in flight.
    Busy,
    /// Zero, oversized, or misaligned transfer size.
    InvalidSize,
    /// Map request outside the single buffer region at offset 0.
    InvalidRange,
    /// The engine refused the descriptor.
    Engine(EngineError),
    /// The server side of this channel is gone.
    Closed,
}

impl From<SubmitError> for ChannelError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::Busy => ChannelError::Busy,
            SubmitError::InvalidSize(_) => ChannelError::InvalidSize,
            SubmitError::Engine(e) => ChannelError::Engine(e),
        }
    }
}

impl From<InvalidRange> for ChannelError {
    fn from(_: InvalidRange) -> Self {
        ChannelError::InvalidRange
    }
}

/// One request/response exchange in flight.
pub struct Message {
    pub body: Request,
    pub reply: oneshot::Sender<Result<Response, ChannelError>>,
}

////////////////////////////////////////////////////////////////////////////////
// Server Definition
////////////////////////////////////////////////////////////////////////////////

/// Serves the access surface for one [`DmaChannel`].
pub struct ChannelServer {
    channel: Arc<DmaChannel>,
    reqs: mpsc::Receiver<Message>,
}

impl ChannelServer {
    /// Create a server (and the first client) over `channel`, with room for
    /// `depth` queued requests.
    pub fn new(channel: Arc<DmaChannel>, depth: usize) -> (Self, ChannelClient) {
        let (tx, rx) = mpsc::channel(depth);
        (
            Self {
                channel,
                reqs: rx,
            },
            ChannelClient { tx },
        )
    }

    /// Run the request loop until every client has been dropped, then reset
    /// the channel.
    #[tracing::instrument(name = "ChannelServer::run", level = "debug", skip(self))]
    pub async fn run(mut self) {
        while let Some(Message { body, reply }) = self.reqs.recv().await {
            trace!(request = ?body, "incoming");
            match body {
                Request::Submit { len } => {
                    let res = self
                        .channel
                        .submit(len as usize)
                        .map(|()| Response::Submitted)
                        .map_err(ChannelError::from);
                    let _ = reply.send(res);
                }
                Request::Wait => {
                    // waits get their own task so they can't stall the loop
                    let channel = self.channel.clone();
                    tokio::spawn(async move {
                        let status = channel.wait().await;
                        let _ = reply.send(Ok(Response::Status(status)));
                    });
                }
                Request::Status => {
                    let _ = reply.send(Ok(Response::Status(self.channel.status())));
                }
                Request::SetTimeout { ms } => {
                    self.channel
                        .set_timeout(Duration::from_millis(u64::from(ms)));
                    let _ = reply.send(Ok(Response::TimeoutSet));
                }
                Request::MapBuffer { offset, len } => {
                    let res = self
                        .channel
                        .map_for_consumer(offset as usize, len as usize)
                        .map(Response::Mapped)
                        .map_err(ChannelError::from);
                    let _ = reply.send(res);
                }
                Request::Close => {
                    self.channel.cancel();
                    let _ = reply.send(Ok(Response::Closed));
                }
            }
        }
        // last client hung up; the next session must find a clean channel
        debug!("all clients disconnected, resetting channel");
        self.channel.cancel();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Client Definition
////////////////////////////////////////////////////////////////////////////////

/// A handle onto the access surface. Cloneable; every clone is an
/// independent session endpoint over the same channel.
#[derive(Clone)]
pub struct ChannelClient {
    tx: mpsc::Sender<Message>,
}

impl ChannelClient {
    async fn request(&self, body: Request) -> Result<Response, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message { body, reply })
            .await
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Submit a transfer of `len` bytes. Non-blocking on the channel side;
    /// resolves as soon as the server has accepted or refused it.
    pub async fn submit(&self, len: u32) -> Result<(), ChannelError> {
        match self.request(Request::Submit { len }).await? {
            Response::Submitted => Ok(()),
            resp => unreachable!("submit answered with {resp:?}"),
        }
    }

    /// Block until the in-flight transfer resolves or times out.
    pub async fn wait(&self) -> Result<TransferStatus, ChannelError> {
        match self.request(Request::Wait).await? {
            Response::Status(status) => Ok(status),
            resp => unreachable!("wait answered with {resp:?}"),
        }
    }

    /// Non-blocking status poll.
    pub async fn status(&self) -> Result<TransferStatus, ChannelError> {
        match self.request(Request::Status).await? {
            Response::Status(status) => Ok(status),
            resp => unreachable!("status answered with {resp:?}"),
        }
    }

    /// Set the wait deadline in milliseconds; affects subsequent waits.
    pub async fn set_timeout(&self, ms: u32) -> Result<(), ChannelError> {
        match self.request(Request::SetTimeout { ms }).await? {
            Response::TimeoutSet => Ok(()),
            resp => unreachable!("set_timeout answered with {resp:?}"),
        }
    }

    /// Map `len` bytes of the buffer at `offset` (which must be 0) for
    /// zero-copy access.
    pub async fn map_buffer(&self, offset: u32, len: u32) -> Result<BufferView, ChannelError> {
        match self.request(Request::MapBuffer { offset, len }).await? {
            Response::Mapped(view) => Ok(view),
            resp => unreachable!("map_buffer answered with {resp:?}"),
        }
    }

    /// End this session, cancelling anything in flight.
    pub async fn close(&self) -> Result<(), ChannelError> {
        match self.request(Request::Close).await? {
            Response::Closed => Ok(()),
            resp => unreachable!("close answered with {resp:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::CoherentBuffer,
        channel::{ChannelSettings, ChannelState},
        engine::EngineStatus,
        test_util::{trace_init, FakeEngine},
    };

    fn serve(engine: Arc<FakeEngine>) -> (ChannelClient, Arc<DmaChannel>) {
        trace_init();
        let buffer = Arc::new(CoherentBuffer::allocate(4096, 4).unwrap());
        let channel = Arc::new(DmaChannel::new(
            engine,
            buffer,
            ChannelSettings::default(),
        ));
        let (server, client) = ChannelServer::new(channel.clone(), 8);
        tokio::spawn(server.run());
        (client, channel)
    }

    #[tokio::test]
    async fn end_to_end_capture() {
        let engine = FakeEngine::auto_complete();
        let (client, _) = serve(engine);

        client.set_timeout(1_000).await.unwrap();
        client.submit(64).await.unwrap();
        assert_eq!(client.wait().await.unwrap(), TransferStatus::Complete);

        let view = client.map_buffer(0, 64).await.unwrap();
        assert_eq!(view.len(), 64);
        assert!(view.as_slice().iter().all(|&b| b == FakeEngine::FILL));

        assert_eq!(client.status().await.unwrap(), TransferStatus::Complete);
    }

    #[tokio::test]
    async fn concurrent_submit_sees_busy() {
        let engine = FakeEngine::new();
        let (client, _) = serve(engine.clone());

        client.submit(16).await.unwrap();

        // a second caller waits on the transfer...
        let second = client.clone();
        let waiter = tokio::spawn(async move { second.wait().await });
        tokio::task::yield_now().await;

        // ...while a third tries to submit over it
        assert_eq!(client.submit(16).await.unwrap_err(), ChannelError::Busy);

        engine.finish(EngineStatus::Complete);
        assert_eq!(waiter.await.unwrap().unwrap(), TransferStatus::Complete);
    }

    #[tokio::test]
    async fn map_requests_are_validated() {
        let (client, _) = serve(FakeEngine::new());

        assert_eq!(
            client.map_buffer(1, 16).await.unwrap_err(),
            ChannelError::InvalidRange
        );
        assert_eq!(
            client.map_buffer(0, 8192).await.unwrap_err(),
            ChannelError::InvalidRange
        );
        assert!(client.map_buffer(0, 4096).await.is_ok());
    }

    #[tokio::test]
    async fn close_resets_the_session() {
        let engine = FakeEngine::new();
        let (client, channel) = serve(engine.clone());

        client.submit(16).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Idle);
        assert_eq!(client.status().await.unwrap(), TransferStatus::NoTransfer);

        // the channel is reusable after a close
        client.submit(16).await.unwrap();
        assert_eq!(client.status().await.unwrap(), TransferStatus::InProgress);
    }

    #[tokio::test]
    async fn dropping_every_client_resets_the_channel() {
        let engine = FakeEngine::new();
        trace_init();
        let buffer = Arc::new(CoherentBuffer::allocate(4096, 4).unwrap());
        let channel = Arc::new(DmaChannel::new(
            engine.clone(),
            buffer,
            ChannelSettings::default(),
        ));
        let (server, client) = ChannelServer::new(channel.clone(), 8);
        let server = tokio::spawn(server.run());

        client.submit(16).await.unwrap();
        drop(client);
        server.await.unwrap();

        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(engine.terminate_count() >= 1);
    }
}
