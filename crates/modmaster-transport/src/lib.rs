//! Byte transports for the modmaster protocol engine.
//!
//! The engine never blocks on I/O: it asks a [`Transport`] to push out a
//! frame and to hand over whatever bytes the peer has already delivered.
//! Establishing the connection is the job of a [`Connector`].

#![forbid(unsafe_code)]

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryPeer, MemoryTransport};
pub use tcp::{TcpConnector, TcpTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("short write ({written} of {expected} bytes)")]
    ShortWrite { expected: usize, written: usize },
}

impl TransportError {
    /// Whether the error means the peer is gone rather than a local fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::NotConnected)
    }
}

/// Lifecycle of one TCP session to a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The byte stream lost framing or the socket failed; reconnect before
    /// issuing more requests.
    Faulted,
}

impl ConnectionState {
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// A duplex byte stream that never blocks the caller.
pub trait Transport: Send {
    /// Writes `bytes`, returning how many were accepted.
    ///
    /// Accepting fewer than `bytes.len()` is legal but callers treat it as
    /// a broken connection.
    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Copies already-received bytes into `buf`. `Ok(0)` means nothing is
    /// waiting right now; a closed peer is reported as
    /// [`TransportError::ConnectionClosed`].
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).receive(buf)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}

/// Opens transports, once at start-up and again after a fault.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport + 'static;

    async fn connect(&self) -> Result<Self::Transport, TransportError>;
}
