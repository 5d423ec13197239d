//! The application-facing event handler contract.
//!
//! An application attaches a `CommsHandler` to a socket and is called back
//! on accept/connect/read/write readiness. For TLS sessions the channel
//! passed to the callbacks is the plaintext window; wrap and unwrap happen
//! behind it. After servicing an event the handler re-arms readiness
//! through the retained `SessionHandle`.

use std::sync::Arc;

use crate::bridge::SelectorBridge;

/// Non-blocking byte channel handed to handler callbacks.
///
/// `read` returns `Err(WouldBlock)` when currently drained and `Ok(0)` at
/// end of stream. `write` accepts as many bytes as fit right now and
/// returns `Err(WouldBlock)` when it can make no progress at all.
pub trait Channel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
}

/// Retained by the application to re-arm readiness and to close.
///
/// Cloning is cheap; all clones refer to the same session.
#[derive(Clone)]
pub struct SessionHandle {
    index: u64,
    bridge: Arc<dyn SelectorBridge>,
}

impl SessionHandle {
    pub(crate) fn new(index: u64, bridge: Arc<dyn SelectorBridge>) -> Self {
        Self { index, bridge }
    }

    /// Opaque identifier of the session within its reactor.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Put the socket back in the select queue for reading.
    pub fn select_for_read(&self) {
        self.bridge.select_for_read();
    }

    /// Put the socket back in the select queue for writing.
    pub fn select_for_write(&self) {
        self.bridge.select_for_write();
    }

    /// Request an orderly close of the session. Idempotent.
    pub fn close(&self) {
        self.bridge.request_close();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("index", &self.index)
            .field("bridge", &self.bridge.name())
            .finish()
    }
}

/// The interface an application implements to handle read, write, accept
/// and connect events on a socket.
///
/// `on_accept` fires exactly once for an inbound socket and `on_connect`
/// exactly once for an outbound one, in both cases only after any TLS
/// handshake has completed; the handler is expected to store the
/// `SessionHandle` for later re-arms. `on_read` fires whenever readable
/// plaintext is available; the handler pulls from the channel until it
/// reports `WouldBlock` and re-arms with `handle.select_for_read()`.
/// `on_write` fires when the channel can accept more bytes. `closing` is
/// the last call before teardown.
pub trait CommsHandler: Send {
    fn on_accept(&mut self, channel: &mut dyn Channel, handle: SessionHandle);

    fn on_connect(&mut self, channel: &mut dyn Channel, handle: SessionHandle);

    fn on_read(&mut self, channel: &mut dyn Channel);

    fn on_write(&mut self, channel: &mut dyn Channel);

    /// The session is going away; perform any cleanup necessary.
    fn closing(&mut self, channel: &mut dyn Channel);
}

/// Creates one `CommsHandler` per accepted connection.
pub trait CommsHandlerFactory: Send + Sync {
    fn create_handler(&self) -> Box<dyn CommsHandler>;
}
