//! Socket transport for wire messages.
//!
//! - [`Transport`]: Opens outbound connections (the seam tests replace)
//! - [`Connection`]: Sends and receives [`WireMessage`]s with explicit timeouts
//! - [`TcpTransport`]: Newline-delimited JSON over TCP
//!
//! Every operation is bounded by a timeout so that a silent peer can only
//! stall a loop for one bound, never indefinitely.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::error::P2pError;
use crate::message::WireMessage;

/// Longest accepted frame, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens connections to peers.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Connects to `host:port`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unreachable or the timeout elapses.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, P2pError>>;
}

/// An open, message-framed connection to a peer.
pub trait Connection: Send {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or times out.
    fn send<'a>(&'a mut self, message: &'a WireMessage) -> BoxFuture<'a, Result<(), P2pError>>;

    /// Receives one message, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, closed stream, or malformed frame.
    fn recv(&mut self, timeout: Duration) -> BoxFuture<'_, Result<WireMessage, P2pError>>;

    /// Flushes and closes the connection.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// TCP transport using one JSON document per line.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    write_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TcpTransport {
    /// Creates a transport whose writes are bounded by `write_timeout`.
    #[must_use]
    pub const fn new(write_timeout: Duration) -> Self {
        Self { write_timeout }
    }
}

impl Transport for TcpTransport {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, P2pError>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| P2pError::Timeout {
                    operation: "connect",
                    after: timeout,
                })?
                .map_err(|e| P2pError::Connection(format!("{host}:{port}: {e}")))?;

            let conn: Box<dyn Connection> =
                Box::new(FramedConnection::new(stream, self.write_timeout));
            Ok(conn)
        })
    }
}

/// A [`Connection`] over a line-framed TCP stream.
#[derive(Debug)]
pub struct FramedConnection {
    framed: Framed<TcpStream, LinesCodec>,
    write_timeout: Duration,
}

impl FramedConnection {
    /// Wraps an accepted or connected stream.
    #[must_use]
    pub fn new(stream: TcpStream, write_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
            write_timeout,
        }
    }

    /// Returns the remote address, if the socket still knows it.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.framed.get_ref().peer_addr().ok()
    }
}

impl Connection for FramedConnection {
    fn send<'a>(&'a mut self, message: &'a WireMessage) -> BoxFuture<'a, Result<(), P2pError>> {
        Box::pin(async move {
            let line = message.to_line()?;
            let after = self.write_timeout;
            tokio::time::timeout(after, self.framed.send(line))
                .await
                .map_err(|_| P2pError::Timeout {
                    operation: "send",
                    after,
                })?
                .map_err(codec_error)
        })
    }

    fn recv(&mut self, timeout: Duration) -> BoxFuture<'_, Result<WireMessage, P2pError>> {
        Box::pin(async move {
            let next = tokio::time::timeout(timeout, self.framed.next())
                .await
                .map_err(|_| P2pError::Timeout {
                    operation: "recv",
                    after: timeout,
                })?;

            match next {
                Some(Ok(line)) => WireMessage::from_line(&line)
                    .map_err(|e| P2pError::Protocol(format!("malformed message: {e}"))),
                Some(Err(e)) => Err(codec_error(e)),
                None => Err(P2pError::Connection("connection closed by peer".into())),
            }
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let mut framed = self.framed;
        Box::pin(async move {
            // Peer may already be gone
            let _ = SinkExt::<String>::close(&mut framed).await;
        })
    }
}

fn codec_error(err: LinesCodecError) -> P2pError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            P2pError::Protocol(format!("frame exceeds {MAX_FRAME_LEN} bytes"))
        }
        LinesCodecError::Io(e) => P2pError::Io(e),
    }
}

/// Binds a listening socket without awaiting, so callers can report bind
/// failures synchronously.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the address is invalid or already in use.
pub fn bind_listener(host: &str, port: u16) -> Result<TcpListener, P2pError> {
    let listener = std::net::TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

/// Sends `message` to `host:port` and waits for one reply.
///
/// # Errors
///
/// Returns any connect, send, or receive failure.
pub async fn request(
    transport: &dyn Transport,
    host: &str,
    port: u16,
    message: &WireMessage,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> Result<WireMessage, P2pError> {
    let mut conn = transport.connect(host, port, connect_timeout).await?;
    let result = match conn.send(message).await {
        Ok(()) => conn.recv(io_timeout).await,
        Err(e) => Err(e),
    };
    conn.close().await;
    result
}

/// Sends `message` to `host:port` without waiting for a reply.
///
/// # Errors
///
/// Returns any connect or send failure.
pub async fn deliver(
    transport: &dyn Transport,
    host: &str,
    port: u16,
    message: &WireMessage,
    connect_timeout: Duration,
) -> Result<(), P2pError> {
    let mut conn = transport.connect(host, port, connect_timeout).await?;
    let result = conn.send(message).await;
    conn.close().await;
    result
}
