//! The contract the session drivers require from the outer I/O loop.
//!
//! The reactor owns readiness registration and the executor for delegated
//! tasks; a session only ever talks to it through this trait. Neither side
//! holds a strong reference into the other's internals: the session index
//! is the stable identity used for registry lookup and delink.

use crate::engine::DelegatedTask;

/// Which driver variant is currently registered for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// TLS session still in the handshake phase.
    TlsHandshake,
    /// TLS session transporting application plaintext.
    TlsFlow,
    /// Raw TCP session, no TLS.
    Plain,
}

/// Registry entry describing the active driver for a socket.
#[derive(Debug, Clone, Copy)]
pub struct HandlerDescriptor {
    pub index: u64,
    pub kind: HandlerKind,
}

/// Resumption points dispatched when a suspended session is re-entered.
/// These replace per-event callback objects with plain enum dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Re-enter the handshake drive loop.
    HandshakeResume,
    /// Write readiness during the handshake: flush the outbound buffer,
    /// then drive if it fully drained.
    WriteFlushThenHandshake,
    /// A delegated task finished on the executor.
    TaskCompletion,
}

/// Interface to the outer I/O loop, implemented per session by the reactor.
///
/// `select_for_read` and `select_for_write` are idempotent re-arms. All
/// methods must be callable from any thread; the reactor serializes the
/// resulting dispatches onto the session's owning task.
pub trait SelectorBridge: Send + Sync {
    /// Re-arm read readiness for this session's socket.
    fn select_for_read(&self);

    /// Re-arm write readiness for this session's socket.
    fn select_for_write(&self);

    /// Run a CPU-bound unit off the I/O thread. Completion is delivered
    /// back to the owning reactor task as a task-completion event.
    fn execute(&self, task: DelegatedTask);

    /// Remove this session's handler registration.
    fn delink(&self);

    /// Register the active driver for this session. Paired with `delink`
    /// in the same dispatch, this is the atomic swap performed at
    /// handshake completion.
    fn add_handler(&self, descriptor: HandlerDescriptor);

    /// Diagnostic label of the owning loop.
    fn name(&self) -> String;

    /// Route an application close request to the owning reactor task.
    fn request_close(&self);
}
