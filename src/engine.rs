//! The TLS engine adapter contract.
//!
//! The session state machine drives an opaque TLS primitive through this
//! trait. Every call is synchronous and non-blocking: `wrap` consumes
//! plaintext (possibly zero bytes, for handshake records) and produces
//! ciphertext, `unwrap` does the reverse, and the returned handshake status
//! tells the driver what to do next. CPU-heavy work the engine cannot do
//! inline is surfaced as a delegated task that the driver must run off the
//! I/O thread before re-entering the state machine.

/// Outcome class of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The operation made progress.
    Ok,
    /// Not enough source bytes for a complete record; read more first.
    BufferUnderflow,
    /// Not enough room in the destination buffer.
    BufferOverflow,
    /// The TLS session is closed in this direction.
    Closed,
}

/// The engine's declared next-step requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Feed the engine more ciphertext.
    NeedUnwrap,
    /// Ask the engine to produce a handshake record.
    NeedWrap,
    /// Run a delegated task off the I/O thread, then re-enter.
    NeedTask,
    /// The handshake just completed; reported exactly once.
    Finished,
    /// No handshake in progress.
    NotHandshaking,
}

/// Result of a single `wrap` or `unwrap` call.
#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: EngineStatus,
    /// Handshake status observed after the operation.
    pub handshake: HandshakeStatus,
    /// Bytes consumed from the source slice.
    pub consumed: usize,
    /// Bytes produced into the destination slice.
    pub produced: usize,
}

/// A CPU-bound unit of work the engine asks the caller to run off the I/O
/// thread (key computation, certificate verification, and the like).
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// The façade over a TLS primitive that the session drivers operate on.
///
/// Consumed/produced byte counts are relative to the slices passed in; the
/// caller owns the surrounding buffer bookkeeping. TLS protocol failures
/// surface as `Err` with `ErrorKind::InvalidData`.
pub trait TlsEngine: Send {
    /// Required capacity for the session's record staging buffers.
    fn packet_buffer_size(&self) -> usize;

    /// Start (or restart) the handshake.
    fn begin_handshake(&mut self) -> std::io::Result<()>;

    /// Encrypt plaintext from `src` into ciphertext records in `dst`.
    /// During the handshake `src` is empty and the engine emits pure
    /// handshake records.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> std::io::Result<EngineResult>;

    /// Decrypt ciphertext from `src` into plaintext in `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> std::io::Result<EngineResult>;

    /// Current next-step requirement. `Finished` is latched: it is reported
    /// once when the handshake completes and `NotHandshaking` thereafter.
    fn handshake_status(&mut self) -> HandshakeStatus;

    /// Take the pending delegated task, if any.
    fn take_delegated_task(&mut self) -> Option<DelegatedTask>;

    /// Signal that the peer's byte stream ended. An error here means the
    /// peer closed without `close_notify` (possible truncation attack).
    fn close_inbound(&mut self) -> std::io::Result<()>;

    /// Queue `close_notify` for the outbound direction. Idempotent.
    fn close_outbound(&mut self);

    /// True once the outbound direction is closed and fully drained.
    fn is_outbound_done(&self) -> bool;
}
