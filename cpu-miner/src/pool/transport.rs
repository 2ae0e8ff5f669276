//! Line-delimited message I/O.
//!
//! Pools speak newline-delimited JSON over TCP. [`LineTransport`] frames any
//! byte stream with tokio-util's `LinesCodec` and (de)serializes complete
//! JSON-RPC messages. The [`Transport`] trait abstracts message I/O and the
//! [`Connector`] trait abstracts dialing, so connections can run over TCP in
//! production and over channels in tests.

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use super::descriptor::PoolDescriptor;
use super::messages::JsonRpcMessage;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Longest line accepted from a pool. Jobs are a few hundred bytes.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Message-level I/O for the pool protocol.
#[async_trait]
pub trait Transport: Send {
    /// Read one complete JSON-RPC message.
    ///
    /// Returns `None` on clean connection close (EOF).
    async fn read_message(&mut self) -> Result<Option<JsonRpcMessage>>;

    /// Write a JSON-RPC message.
    async fn write_message(&mut self, msg: &JsonRpcMessage) -> Result<()>;
}

/// Opens transports to pools.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, pool: &PoolDescriptor) -> Result<Box<dyn Transport>>;
}

/// JSON-RPC over any newline-framed byte stream.
pub struct LineTransport<S> {
    framed: Framed<S, LinesCodec>,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        }
    }
}

#[async_trait]
impl<S> Transport for LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_message(&mut self) -> Result<Option<JsonRpcMessage>> {
        loop {
            let line = match self.framed.next().await {
                None => return Ok(None),
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::Io(e))) => return Err(Error::Io(e)),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(Error::Protocol(format!(
                        "line exceeds {} bytes",
                        MAX_LINE_LENGTH
                    )))
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            trace!(rx = %line, "Received message");

            let msg = serde_json::from_str(line).map_err(|e| {
                Error::Protocol(format!("Failed to parse JSON: {}, line: {}", e, line))
            })?;
            return Ok(Some(msg));
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending message");

        self.framed.send(json).await.map_err(|e| match e {
            LinesCodecError::Io(e) => Error::Io(e),
            other => Error::Transport(other.to_string()),
        })
    }
}

/// Plain TCP dialer.
///
/// TLS pools need a connector that wraps the stream before framing; this one
/// refuses them so the failure is visible instead of speaking cleartext to a
/// TLS port.
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, pool: &PoolDescriptor) -> Result<Box<dyn Transport>> {
        if pool.tls {
            return Err(Error::Transport(format!(
                "{} requires TLS, which this connector does not provide",
                pool
            )));
        }

        let address = pool.address();
        debug!(pool = %address, "Connecting to pool");

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| Error::Transport(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        debug!(pool = %address, "Connected to pool");
        Ok(Box::new(LineTransport::new(stream)))
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// connection's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Test-side handle for a [`MockTransport`].
///
/// Dropping the handle closes the connection from the pool's side.
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: client_rx,
            tx: client_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> Result<Option<JsonRpcMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> Result<()> {
        self.tx.send(msg.clone()).map_err(|_| Error::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the connection.
    pub fn send(&self, msg: JsonRpcMessage) {
        self.tx.send(msg).expect("transport dropped");
    }

    /// Receive a message the connection wrote.
    pub async fn recv(&mut self) -> JsonRpcMessage {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Receive a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<JsonRpcMessage> {
        self.rx.try_recv().ok()
    }
}

/// Scripted connector: each dial takes the next queued outcome, refusing
/// once the script runs out.
#[cfg(test)]
pub(crate) struct MockConnector {
    dials: parking_lot::Mutex<std::collections::VecDeque<Option<MockTransport>>>,
    attempts: parking_lot::Mutex<Vec<tokio::time::Instant>>,
}

#[cfg(test)]
impl MockConnector {
    pub fn new() -> Self {
        Self {
            dials: parking_lot::Mutex::new(Default::default()),
            attempts: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Queue a refused dial.
    pub fn refuse(&self) {
        self.dials.lock().push_back(None);
    }

    /// Queue a successful dial and return the pool's side of it.
    pub fn accept(&self) -> MockTransportHandle {
        let (transport, handle) = MockTransport::pair();
        self.dials.lock().push_back(Some(transport));
        handle
    }

    /// When each dial happened.
    pub fn attempts(&self) -> Vec<tokio::time::Instant> {
        self.attempts.lock().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _pool: &PoolDescriptor) -> Result<Box<dyn Transport>> {
        self.attempts.lock().push(tokio::time::Instant::now());
        match self.dials.lock().pop_front() {
            Some(Some(transport)) => Ok(Box::new(transport)),
            _ => Err(Error::Transport("connection refused".to_string())),
        }
    }
}
