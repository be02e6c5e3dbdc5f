//! Transport collaborator: the byte stream a connection runs over.
//!
//! The engine is agnostic to what sits underneath (plain TCP, TLS, a test
//! script). Two implementations ship with the crate:
//!
//! - [`TcpTransport`]: blocking `std::net::TcpStream` with a read timeout
//!   used as the poll interval for deadline checks
//! - [`MemoryTransport`]: scripted in-memory stream with a shared
//!   [`MemoryHandle`] for feeding inbound bytes and inspecting outbound ones

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::handshake::Uri;

/// Result of one transport read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were written into the buffer.
    Data(usize),
    /// Nothing arrived within the transport's poll interval.
    Idle,
    /// The peer closed the stream.
    Closed,
}

/// Unblocks a pending [`Transport::read`] from another thread.
pub type Interrupter = Box<dyn Fn() + Send + Sync>;

/// Byte-stream abstraction consumed by the connection.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;
    /// Write the whole buffer, blocking while the stream applies backpressure.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Release the stream. Called exactly once, when the connection terminates.
    fn close(&mut self);
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

// ---------------------------------------------------------------------------
// Plain TCP
// ---------------------------------------------------------------------------

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to the host and port named by `uri`.
    ///
    /// `poll` bounds how long a read may block before reporting
    /// [`ReadOutcome::Idle`].
    pub fn connect(uri: &Uri, poll: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect((uri.host.as_str(), uri.port))?;
        stream.set_nodelay(true)?;
        Self::new(stream, poll)
    }

    pub fn new(stream: TcpStream, poll: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(poll))?;
        Ok(TcpTransport { stream })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        match self.stream.read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            // Read timeouts surface as WouldBlock on Unix and TimedOut on Windows.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::Idle)
            }
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let stream = self.stream.try_clone().ok()?;
        Some(Box::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Shared {
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<u8>,
    peer_closed: bool,
    closed: bool,
    read_error: Option<io::ErrorKind>,
    /// Successful writes left before the injected failure, and its kind.
    write_error: Option<(usize, io::ErrorKind)>,
    writes: usize,
}

/// In-memory transport. Inbound bytes are delivered in the chunks they
/// were pushed in, so tests control exactly how frames are split.
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

/// Test-side handle to a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    pub fn new() -> (MemoryTransport, MemoryHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            MemoryTransport {
                shared: shared.clone(),
            },
            MemoryHandle { shared },
        )
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut shared = self.shared.lock();
        if let Some(kind) = shared.read_error.take() {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        if shared.closed {
            return Ok(ReadOutcome::Closed);
        }
        let Some(mut chunk) = shared.inbound.pop_front() else {
            return Ok(if shared.peer_closed {
                ReadOutcome::Closed
            } else {
                ReadOutcome::Idle
            });
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            shared.inbound.push_front(chunk);
        }
        Ok(ReadOutcome::Data(n))
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        match shared.write_error {
            Some((0, kind)) => {
                shared.write_error = None;
                return Err(io::Error::new(kind, "injected write failure"));
            }
            Some((left, kind)) => shared.write_error = Some((left - 1, kind)),
            None => {}
        }
        shared.outbound.extend_from_slice(bytes);
        shared.writes += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.shared.lock().closed = true;
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let shared = self.shared.clone();
        Some(Box::new(move || shared.lock().closed = true))
    }
}

impl MemoryHandle {
    /// Queue bytes for the connection to read.
    pub fn push(&self, bytes: impl Into<Vec<u8>>) {
        self.shared.lock().inbound.push_back(bytes.into());
    }

    /// Signal end-of-stream once the queued bytes are drained.
    pub fn finish(&self) {
        self.shared.lock().peer_closed = true;
    }

    /// Make the next read fail with `kind`.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.shared.lock().read_error = Some(kind);
    }

    /// Make the next write fail with `kind`.
    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        self.fail_write_after(0, kind);
    }

    /// Let `successful` writes through, then fail the one after with `kind`.
    pub fn fail_write_after(&self, successful: usize, kind: io::ErrorKind) {
        self.shared.lock().write_error = Some((successful, kind));
    }

    /// Take everything written so far.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().outbound)
    }

    pub fn write_count(&self) -> usize {
        self.shared.lock().writes
    }

    /// Whether the connection released the transport.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}
