use crate::{Connector, Transport, TransportError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, trace};

fn is_peer_gone(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

fn write_available(stream: &TcpStream, bytes: &[u8]) -> Result<usize, TransportError> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.try_write(&bytes[written..]) {
            Ok(0) => return Err(TransportError::ConnectionClosed),
            Ok(n) => written += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if is_peer_gone(err.kind()) => return Err(TransportError::ConnectionClosed),
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    Ok(written)
}

fn read_available(stream: &TcpStream, buf: &mut [u8]) -> Result<usize, TransportError> {
    match stream.try_read(buf) {
        Ok(0) => Err(TransportError::ConnectionClosed),
        Ok(n) => Ok(n),
        Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
        Err(err) if is_peer_gone(err.kind()) => Err(TransportError::ConnectionClosed),
        Err(err) => Err(TransportError::Io(err)),
    }
}

/// Modbus TCP session on a tokio socket, driven with `try_read`/`try_write`.
///
/// Must be used from inside a tokio runtime so the reactor keeps socket
/// readiness current.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "could not disable nagle on modbus socket");
        }
        let peer = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            peer,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Waits until the socket has something to read (or has closed).
    pub async fn readable(&self) -> Result<(), TransportError> {
        let stream = self.stream.as_ref().ok_or(TransportError::NotConnected)?;
        stream.readable().await?;
        Ok(())
    }

    fn drop_stream(&mut self) {
        if self.stream.take().is_some() {
            debug!(peer = ?self.peer, "modbus tcp connection closed");
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_ref().ok_or(TransportError::NotConnected)?;
        let result = write_available(stream, bytes);
        match &result {
            Ok(written) => trace!(peer = ?self.peer, written, "sent modbus tcp bytes"),
            Err(TransportError::ConnectionClosed) => self.drop_stream(),
            Err(_) => {}
        }
        result
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_ref().ok_or(TransportError::NotConnected)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let result = read_available(stream, buf);
        match &result {
            Ok(0) => {}
            Ok(len) => trace!(peer = ?self.peer, len, "received modbus tcp bytes"),
            Err(TransportError::ConnectionClosed) => self.drop_stream(),
            Err(_) => {}
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        self.drop_stream();
    }
}

/// Connects to `host:port`, optionally bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self) -> Result<TcpTransport, TransportError> {
        debug!(addr = %self.addr, "connecting to modbus slave");
        let connecting = TcpTransport::connect(self.addr.as_str());
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting).await.map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "modbus connect timed out",
                ))
            })?,
            None => connecting.await,
        }
    }
}
