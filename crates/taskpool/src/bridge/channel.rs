//! Channel pair: one full-duplex link built from two one-directional pipes.
//!
//! Each side owns the write end of one pipe and the read end of the other.
//! For a spawned child that is the child's stdin and stdout; inside the child
//! it is its own stdio; in tests it is a pair of in-memory streams.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures::SinkExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Inbound frame stream of a link.
pub type FrameReader<T> = FramedRead<BoxedReader, JsonCodec<T>>;

/// Capacity of each in-memory pipe.
const IN_MEMORY_PIPE_CAPACITY: usize = 256 * 1024;

pub struct ChannelPair {
    inbound: BoxedReader,
    outbound: BoxedWriter,
}

impl ChannelPair {
    pub fn new(
        inbound: impl AsyncRead + Send + 'static,
        outbound: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            inbound: Box::pin(inbound),
            outbound: Box::pin(outbound),
        }
    }

    /// The link a child process has to its parent.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// The link a parent has to a child spawned with piped stdin and stdout.
    pub fn from_child(child: &mut Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"))?;
        Ok(Self::new(stdout, stdin))
    }

    /// Two connected ends: whatever one side writes, the other reads.
    pub fn in_memory() -> (Self, Self) {
        // Only one direction of each duplex stream is used, so each behaves as a pipe.
        let (left_tx, right_rx) = tokio::io::duplex(IN_MEMORY_PIPE_CAPACITY);
        let (right_tx, left_rx) = tokio::io::duplex(IN_MEMORY_PIPE_CAPACITY);
        (Self::new(left_rx, left_tx), Self::new(right_rx, right_tx))
    }

    /// Attach the frame codec: frames of `In` are read, frames of `Out` are written.
    pub fn into_framed<In, Out>(self) -> (FrameReader<In>, FrameSender<Out>)
    where
        In: DeserializeOwned,
        Out: Serialize,
    {
        let reader = FramedRead::new(self.inbound, JsonCodec::<In>::new());
        let writer = FramedWrite::new(self.outbound, JsonCodec::<Out>::new());
        (reader, FrameSender::new(writer))
    }
}

/// Shared write half of a link. Cloned into every task that needs to send.
pub struct FrameSender<T> {
    inner: Arc<Mutex<FramedWrite<BoxedWriter, JsonCodec<T>>>>,
}

impl<T> Clone for FrameSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Serialize> FrameSender<T> {
    fn new(writer: FramedWrite<BoxedWriter, JsonCodec<T>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Encode and flush one frame.
    pub async fn send(&self, frame: T) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.send(frame).await
    }

    /// Close the write end so the peer sees end-of-stream.
    pub async fn close(&self) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CorrelationId, Outbound, Reply, Status, WorkerInbound};
    use futures::StreamExt;

    #[tokio::test]
    async fn in_memory_pair_is_full_duplex() {
        let (parent, child) = ChannelPair::in_memory();
        let (mut parent_rx, parent_tx) = parent.into_framed::<Outbound, WorkerInbound>();
        let (mut child_rx, child_tx) = child.into_framed::<WorkerInbound, Outbound>();

        parent_tx
            .send(WorkerInbound::Control(crate::bridge::protocol::Request::new(
                crate::bridge::protocol::Verb::GetStatus,
                CorrelationId::new(1),
            )))
            .await
            .unwrap();
        child_tx
            .send(Outbound::Reply(Reply::new(Status::Running, CorrelationId::new(1))))
            .await
            .unwrap();

        assert!(matches!(
            child_rx.next().await,
            Some(Ok(WorkerInbound::Control(_)))
        ));
        assert!(matches!(
            parent_rx.next().await,
            Some(Ok(Outbound::Reply(reply))) if reply.value == Status::Running
        ));
    }

    #[tokio::test]
    async fn closing_one_direction_ends_the_peer_stream() {
        let (parent, child) = ChannelPair::in_memory();
        let (_parent_rx, parent_tx) = parent.into_framed::<Outbound, WorkerInbound>();
        let (mut child_rx, _child_tx) = child.into_framed::<WorkerInbound, Outbound>();

        parent_tx.close().await.unwrap();
        drop(parent_tx);

        assert!(child_rx.next().await.is_none());
    }
}
