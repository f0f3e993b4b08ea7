//! In-process transport pair for driving the engine without sockets.

use crate::{Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Pipe {
    to_master: VecDeque<u8>,
    from_master: Vec<u8>,
    master_open: bool,
    peer_open: bool,
    write_limit: Option<usize>,
}

#[derive(Debug, Clone)]
struct Shared(Arc<Mutex<Pipe>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pipe> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Master side of an in-memory pipe.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Shared,
}

/// Slave side of an in-memory pipe: feeds bytes to the master and collects
/// what it sent.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    shared: Shared,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let shared = Shared(Arc::new(Mutex::new(Pipe {
            to_master: VecDeque::new(),
            from_master: Vec::new(),
            master_open: true,
            peer_open: true,
            write_limit: None,
        })));
        (
            MemoryTransport {
                shared: shared.clone(),
            },
            MemoryPeer { shared },
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let mut pipe = self.shared.lock();
        if !pipe.master_open {
            return Err(TransportError::NotConnected);
        }
        if !pipe.peer_open {
            pipe.master_open = false;
            return Err(TransportError::ConnectionClosed);
        }
        let accepted = pipe.write_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
        pipe.from_master.extend_from_slice(&bytes[..accepted]);
        Ok(accepted)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut pipe = self.shared.lock();
        if !pipe.master_open {
            return Err(TransportError::NotConnected);
        }
        if pipe.to_master.is_empty() {
            if !pipe.peer_open {
                pipe.master_open = false;
                return Err(TransportError::ConnectionClosed);
            }
            return Ok(0);
        }
        let len = buf.len().min(pipe.to_master.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.to_master.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().master_open
    }

    fn disconnect(&mut self) {
        self.shared.lock().master_open = false;
    }
}

impl MemoryPeer {
    /// Queues bytes for the master's next `receive`.
    pub fn push(&self, bytes: &[u8]) {
        self.shared.lock().to_master.extend(bytes.iter().copied());
    }

    /// Takes everything the master has sent so far.
    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().from_master)
    }

    /// Caps how many bytes one `send` accepts, to provoke short writes.
    pub fn limit_writes(&self, limit: Option<usize>) {
        self.shared.lock().write_limit = limit;
    }

    /// Hangs up. Bytes already queued are still delivered first.
    pub fn close(&self) {
        self.shared.lock().peer_open = false;
    }

    /// Whether the master side still considers itself connected.
    pub fn master_connected(&self) -> bool {
        self.shared.lock().master_open
    }
}
