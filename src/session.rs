//! TLS session state and lifecycle control.
//!
//! A `TlsSession` aggregates the engine, the buffer triad, the socket, the
//! application event handler and the bridge to the outer I/O loop. The
//! handshake-phase and data-phase drivers are variants of a tagged `Phase`
//! selecting on this shared state, so the substitution at handshake
//! completion is atomic from the selector's viewpoint: a `delink` plus
//! `add_handler` under a single dispatch, with no window in which two
//! handlers are registered for the socket.
//!
//! The controller here owns close coordination: `close()` is idempotent,
//! defers while wrapped bytes are pending, emits at most one `close_notify`
//! (fire-and-forget, per RFC the peer's is not awaited), and tears the raw
//! socket down last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, trace, warn};

use crate::bridge::{Continuation, HandlerDescriptor, HandlerKind, SelectorBridge};
use crate::buffer::SessionBuffer;
use crate::comms::CommsHandler;
use crate::engine::{EngineResult, TlsEngine};
use crate::flow::TlsChannel;
use crate::socket::SocketChannel;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Active driver variant for a TLS session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Handshake,
    Flow,
}

/// Failure recorded by the plaintext channel during an application
/// callback, surfaced to the driver once the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelFailure {
    /// TLS protocol error; attempt an orderly close.
    Tls,
    /// Socket error; no further wrap or flush attempts.
    Socket,
}

/// State shared by both driver variants: the engine, the buffer triad and
/// the socket. Split out so the plaintext channel view handed to
/// application callbacks can borrow it while the handler itself is borrowed
/// separately.
pub(crate) struct SessionCore {
    pub(crate) role: Role,
    pub(crate) index: u64,
    pub(crate) engine: Box<dyn TlsEngine>,
    pub(crate) socket: Box<dyn SocketChannel>,
    pub(crate) inbound_encrypted: SessionBuffer,
    pub(crate) inbound_clear: SessionBuffer,
    pub(crate) outbound_encrypted: SessionBuffer,
    /// Monotonic true-to-false, flipped exactly once at teardown. Shared
    /// with delegated-task continuations, hence release/acquire.
    pub(crate) open: Arc<AtomicBool>,
    /// Peer's byte stream ended (TCP end of stream observed).
    pub(crate) at_eof: bool,
    /// A mid-session wrap/unwrap reported a handshake requirement; the
    /// driver re-enters the handshake state machine after the current
    /// application callback returns.
    pub(crate) reneg_pending: bool,
    /// Failure recorded by the channel view during a callback.
    pub(crate) failure: Option<ChannelFailure>,
}

/// A socket session that wraps and unwraps its data with TLS.
pub struct TlsSession {
    pub(crate) core: SessionCore,
    pub(crate) events: Box<dyn CommsHandler>,
    pub(crate) bridge: Arc<dyn SelectorBridge>,
    pub(crate) phase: Phase,
    /// `on_accept`/`on_connect` already delivered; a renegotiation
    /// completion must not deliver it again.
    pub(crate) announced: bool,
    pub(crate) close_requested: bool,
    pub(crate) close_notify_sent: bool,
    pub(crate) task_in_flight: bool,
}

/// Reactor-facing driver surface, shared by TLS and plain sessions.
pub(crate) trait SessionDriver: Send {
    /// Dispatch the accept/connect entry point.
    fn start(&mut self);
    fn on_readable(&mut self);
    fn on_writable(&mut self);
    fn on_task_complete(&mut self);
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// Decrypted bytes already buffered and deliverable. The reactor
    /// services a read re-arm immediately instead of polling the socket
    /// while this is non-zero.
    fn buffered_plaintext(&self) -> usize;
}

impl TlsSession {
    pub(crate) fn new(
        role: Role,
        engine: Box<dyn TlsEngine>,
        socket: Box<dyn SocketChannel>,
        events: Box<dyn CommsHandler>,
        bridge: Arc<dyn SelectorBridge>,
        index: u64,
    ) -> Self {
        let packet_size = engine.packet_buffer_size();
        bridge.add_handler(HandlerDescriptor {
            index,
            kind: HandlerKind::TlsHandshake,
        });
        Self {
            core: SessionCore {
                role,
                index,
                engine,
                socket,
                inbound_encrypted: SessionBuffer::new(packet_size),
                inbound_clear: SessionBuffer::new(packet_size),
                outbound_encrypted: SessionBuffer::new(packet_size),
                open: Arc::new(AtomicBool::new(true)),
                at_eof: false,
                reneg_pending: false,
                failure: None,
            },
            events,
            bridge,
            phase: Phase::Handshake,
            announced: false,
            close_requested: false,
            close_notify_sent: false,
            task_in_flight: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.core.open.load(Ordering::Acquire)
    }

    /// Orderly close. Idempotent; if wrapped bytes are still pending the
    /// shutdown is deferred until the write-drain continuation observes an
    /// empty outbound buffer.
    pub(crate) fn close(&mut self) {
        if !self.is_open() || self.close_requested {
            return;
        }
        self.close_requested = true;
        self.core.engine.close_outbound();
        if !self.core.outbound_encrypted.is_empty() {
            trace!(
                "data left to send on session {}, waiting for close [{}]",
                self.core.index,
                self.bridge.name()
            );
            self.bridge.select_for_write();
            return;
        }
        self.do_shutdown();
    }

    /// Emit `close_notify` (fire-and-forget) and close the raw socket.
    fn do_shutdown(&mut self) {
        debug_assert!(
            self.core.outbound_encrypted.is_empty(),
            "outbound buffer was not empty [{}]",
            self.bridge.name()
        );
        if self.core.engine.is_outbound_done() {
            trace!(
                "outbound data is finished, closing session {} [{}]",
                self.core.index,
                self.bridge.name()
            );
            self.teardown();
            return;
        }

        let res = match wrap_record(&mut self.core) {
            Ok(res) => res,
            Err(e) => {
                warn!(
                    "error wrapping shutdown record on session {}: {} [{}]",
                    self.core.index,
                    e,
                    self.bridge.name()
                );
                self.teardown();
                return;
            }
        };
        trace!(
            "wrapping shutdown on session {}: {:?} [{}]",
            self.core.index,
            res,
            self.bridge.name()
        );
        self.close_notify_sent = true;
        match flush_outbound(&mut self.core) {
            Ok(true) => self.teardown(),
            Ok(false) => self.bridge.select_for_write(),
            Err(e) => {
                warn!(
                    "error flushing shutdown record on session {}: {} [{}]",
                    self.core.index,
                    e,
                    self.bridge.name()
                );
                self.teardown();
            }
        }
    }

    /// Final teardown: flip `open` (exactly once), delink from the
    /// selector registry, deliver `closing`, release the socket.
    pub(crate) fn teardown(&mut self) {
        if !self.core.open.swap(false, Ordering::AcqRel) {
            return;
        }
        trace!(
            "tearing down session {} [{}]",
            self.core.index,
            self.bridge.name()
        );
        self.bridge.delink();
        let core = &mut self.core;
        self.events.closing(&mut TlsChannel::new(core));
        self.core.socket.shutdown();
    }

    /// Fatal socket error: no further wrap or flush attempts, straight to
    /// teardown.
    pub(crate) fn fatal(&mut self, what: &str, e: &std::io::Error) {
        error!(
            "{} failed on session {}: {} [{}]",
            what,
            self.core.index,
            e,
            self.bridge.name()
        );
        self.core.outbound_encrypted.clear();
        self.close_requested = true;
        self.core.engine.close_outbound();
        self.teardown();
    }

    /// Handshake completion: substitute the data-phase driver for the
    /// handshake driver and announce the session to the application,
    /// exactly once.
    pub(crate) fn finish_handshake(&mut self) {
        self.phase = Phase::Flow;
        if self.announced {
            // A renegotiation completed; the session was announced long ago.
            return;
        }
        self.announced = true;
        self.bridge.delink();
        self.bridge.add_handler(HandlerDescriptor {
            index: self.core.index,
            kind: HandlerKind::TlsFlow,
        });
        let handle = crate::comms::SessionHandle::new(self.core.index, self.bridge.clone());
        let role = self.core.role;
        trace!(
            "handshake complete on session {} ({:?}) [{}]",
            self.core.index,
            role,
            self.bridge.name()
        );
        let core = &mut self.core;
        let mut channel = TlsChannel::new(core);
        match role {
            Role::Client => self.events.on_connect(&mut channel, handle),
            Role::Server => self.events.on_accept(&mut channel, handle),
        }
        self.after_callback();
    }

    /// Re-entry point for a suspended session.
    pub(crate) fn resume(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::HandshakeResume => self.drive(),
            Continuation::WriteFlushThenHandshake => match flush_outbound(&mut self.core) {
                Ok(true) => {
                    if self.close_requested {
                        self.continue_shutdown();
                    } else {
                        self.drive();
                    }
                }
                Ok(false) => self.bridge.select_for_write(),
                Err(e) => self.fatal("handshake flush", &e),
            },
            Continuation::TaskCompletion => {
                self.task_in_flight = false;
                if !self.is_open() || self.close_requested {
                    // close() won the race; do not mutate session state.
                    return;
                }
                self.drive();
            }
        }
    }

    /// The write-drain continuation observed an empty outbound buffer
    /// while a close was pending.
    pub(crate) fn continue_shutdown(&mut self) {
        if self.close_notify_sent || self.core.engine.is_outbound_done() {
            self.teardown();
        } else {
            self.do_shutdown();
        }
    }
}

impl SessionDriver for TlsSession {
    fn start(&mut self) {
        self.begin_handshake();
    }

    fn on_readable(&mut self) {
        if !self.is_open() || self.close_requested {
            return;
        }
        match self.phase {
            Phase::Handshake => {
                if let Err(e) = self.drive_unwrap() {
                    error!(
                        "error during handshake on session {}: {} [{}]",
                        self.core.index,
                        e,
                        self.bridge.name()
                    );
                    self.close();
                }
            }
            Phase::Flow => self.flow_read(),
        }
    }

    fn on_writable(&mut self) {
        if !self.is_open() {
            return;
        }
        if self.close_requested {
            match flush_outbound(&mut self.core) {
                Ok(true) => self.continue_shutdown(),
                Ok(false) => self.bridge.select_for_write(),
                Err(e) => self.fatal("shutdown flush", &e),
            }
            return;
        }
        match self.phase {
            Phase::Handshake => self.resume(Continuation::WriteFlushThenHandshake),
            Phase::Flow => self.flow_writable(),
        }
    }

    fn on_task_complete(&mut self) {
        self.resume(Continuation::TaskCompletion);
    }

    fn close(&mut self) {
        TlsSession::close(self);
    }

    fn is_open(&self) -> bool {
        TlsSession::is_open(self)
    }

    fn buffered_plaintext(&self) -> usize {
        if self.phase == Phase::Flow {
            self.core.inbound_clear.len()
        } else {
            0
        }
    }
}

/// Write as much of the outbound ciphertext as the socket accepts right
/// now. `Ok(true)` means fully drained. A socket error marks the buffer
/// drained so no further flush attempts are made.
pub(crate) fn flush_outbound(core: &mut SessionCore) -> std::io::Result<bool> {
    while !core.outbound_encrypted.is_empty() {
        match core.socket.write(core.outbound_encrypted.as_slice()) {
            Ok(0) => break,
            Ok(n) => {
                core.outbound_encrypted.consume(n);
                trace!(
                    "wrote {} bytes, remaining: {} on session {}",
                    n,
                    core.outbound_encrypted.len(),
                    core.index
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                core.outbound_encrypted.clear();
                return Err(e);
            }
        }
    }
    Ok(core.outbound_encrypted.is_empty())
}

/// Produce one engine record (handshake or `close_notify`) into the
/// outbound buffer. Precondition: the buffer is drained; a wrap is never
/// allowed to clobber unflushed bytes.
pub(crate) fn wrap_record(core: &mut SessionCore) -> std::io::Result<EngineResult> {
    debug_assert!(
        core.outbound_encrypted.is_empty(),
        "wrap while outbound bytes are unflushed on session {}",
        core.index
    );
    core.outbound_encrypted.clear();
    let res = core.engine.wrap(&[], core.outbound_encrypted.write_slice())?;
    core.outbound_encrypted.advance_write(res.produced);
    Ok(res)
}
