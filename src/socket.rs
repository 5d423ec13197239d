//! Non-blocking socket abstraction used by the session drivers.
//!
//! The drivers never block on I/O: `read` and `write` return
//! `Err(WouldBlock)` when the socket is not ready, `read` returns `Ok(0)`
//! at end of stream. The tokio-backed implementation pairs with the
//! reactor's readiness loop; tests substitute scripted sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;

pub trait SocketChannel: Send {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn write(&self, buf: &[u8]) -> std::io::Result<usize>;

    /// Mark the socket closed. The underlying descriptor is released when
    /// the owning reactor task drops its references.
    fn shutdown(&self);

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// `SocketChannel` over a shared tokio `TcpStream`. The reactor task holds
/// another reference to the same stream for readiness polling.
pub struct TokioSocket {
    stream: Arc<TcpStream>,
    shut: AtomicBool,
}

impl TokioSocket {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self {
            stream,
            shut: AtomicBool::new(false),
        }
    }
}

impl SocketChannel for TokioSocket {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.shut.load(Ordering::Acquire) {
            return Ok(0);
        }
        self.stream.try_read(buf)
    }

    fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        if self.shut.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "socket is shut down",
            ));
        }
        self.stream.try_write(buf)
    }

    fn shutdown(&self) {
        self.shut.store(true, Ordering::Release);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}
