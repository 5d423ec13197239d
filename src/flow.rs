//! The data-phase driver.
//!
//! After handshake completion the session transports application plaintext:
//! inbound records are unwrapped into the clear buffer and handed to the
//! application's `on_read`, outbound application writes are wrapped and
//! flushed. A mid-session wrap or unwrap that reports a handshake
//! requirement re-enters the handshake driver transparently; the
//! application is never announced twice.

use log::{debug, error, trace};

use crate::bridge::Continuation;
use crate::comms::Channel;
use crate::engine::{EngineStatus, HandshakeStatus};
use crate::session::{flush_outbound, ChannelFailure, Phase, SessionCore, TlsSession};

impl TlsSession {
    /// Read readiness in the data phase: pull ciphertext, unwrap, deliver
    /// plaintext to the application until it stops consuming.
    pub(crate) fn flow_read(&mut self) {
        // A full ciphertext buffer would hand the socket an empty slice,
        // whose Ok(0) is indistinguishable from end of stream.
        let res = if self.core.inbound_encrypted.remaining_capacity() == 0 {
            Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
        } else {
            self.core
                .socket
                .read(self.core.inbound_encrypted.write_slice())
        };
        match res {
            Ok(0) => {
                trace!("end of stream on session {}", self.core.index);
                self.core.at_eof = true;
                if let Err(e) = self.core.engine.close_inbound() {
                    debug!(
                        "inbound close on session {} without close_notify: {}",
                        self.core.index, e
                    );
                }
            }
            Ok(n) => {
                trace!("read {} bytes from socket on session {}", n, self.core.index);
                self.core.inbound_encrypted.advance_write(n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                self.fatal("socket read", &e);
                return;
            }
        }

        let mut reneg = false;
        loop {
            if !self.fill_clear(&mut reneg) {
                return;
            }
            if self.core.inbound_clear.is_empty() {
                break;
            }
            let before = self.core.inbound_clear.len();
            let core = &mut self.core;
            self.events.on_read(&mut TlsChannel::new(core));
            self.core.inbound_clear.compact();
            if self.core.inbound_clear.len() == before {
                // The application made no progress; it will re-arm when it
                // wants the rest.
                break;
            }
            if reneg {
                // Deliver what was already decrypted, then let the
                // handshake machine take over.
                break;
            }
        }
        self.core.inbound_encrypted.compact();

        if reneg {
            self.core.reneg_pending = true;
        }
        self.after_callback();
        if self.core.at_eof {
            self.close();
        }
    }

    /// Unwrap records into the clear buffer until it is full, the
    /// ciphertext runs dry, or the engine changes requirement. Returns
    /// false if the session died on a protocol error.
    fn fill_clear(&mut self, reneg: &mut bool) -> bool {
        loop {
            if self.core.inbound_clear.remaining_capacity() == 0 {
                return true;
            }
            let core = &mut self.core;
            let res = match core.engine.unwrap(
                core.inbound_encrypted.as_slice(),
                core.inbound_clear.write_slice(),
            ) {
                Ok(res) => res,
                Err(e) => {
                    error!(
                        "tls error unwrapping on session {}: {} [{}]",
                        core.index,
                        e,
                        self.bridge.name()
                    );
                    self.close();
                    return false;
                }
            };
            core.inbound_encrypted.consume(res.consumed);
            core.inbound_clear.advance_write(res.produced);
            trace!("session {} unwrapping: {:?}", core.index, res);
            match res.status {
                EngineStatus::Ok => match res.handshake {
                    HandshakeStatus::NeedWrap | HandshakeStatus::NeedTask => {
                        *reneg = true;
                        return true;
                    }
                    _ => {
                        if res.consumed == 0 && res.produced == 0 {
                            return true;
                        }
                    }
                },
                EngineStatus::BufferUnderflow => return true,
                EngineStatus::Closed => {
                    self.core.at_eof = true;
                    return true;
                }
                EngineStatus::BufferOverflow => {
                    // The clear buffer is sized to the packet size; a
                    // conforming engine never overflows it.
                    error!(
                        "buffer overflow unwrapping on session {} [{}]",
                        self.core.index,
                        self.bridge.name()
                    );
                    self.close();
                    return false;
                }
            }
        }
    }

    /// Write readiness in the data phase: drain pending ciphertext, then
    /// let the application write more.
    pub(crate) fn flow_writable(&mut self) {
        match flush_outbound(&mut self.core) {
            Ok(true) => {}
            Ok(false) => {
                self.bridge.select_for_write();
                return;
            }
            Err(e) => {
                self.fatal("socket flush", &e);
                return;
            }
        }
        let core = &mut self.core;
        self.events.on_write(&mut TlsChannel::new(core));
        self.after_callback();
    }

    /// Post-callback bookkeeping: surface channel failures, re-enter the
    /// handshake driver on renegotiation, and keep the suspension
    /// invariant (pending wrapped bytes imply write selection).
    pub(crate) fn after_callback(&mut self) {
        if !self.is_open() {
            return;
        }
        match self.core.failure.take() {
            Some(ChannelFailure::Socket) => {
                self.core.outbound_encrypted.clear();
                self.close_requested = true;
                self.core.engine.close_outbound();
                self.teardown();
                return;
            }
            Some(ChannelFailure::Tls) => {
                self.close();
                return;
            }
            None => {}
        }
        if self.core.reneg_pending {
            self.core.reneg_pending = false;
            self.phase = Phase::Handshake;
            trace!(
                "session {} re-entering handshake mid-session [{}]",
                self.core.index,
                self.bridge.name()
            );
            self.resume(Continuation::HandshakeResume);
            return;
        }
        if !self.core.outbound_encrypted.is_empty() && !self.close_requested {
            self.bridge.select_for_write();
        }
    }
}

/// The plaintext window over a TLS session, handed to application
/// callbacks. Reads drain the clear buffer filled by the data-phase
/// driver; writes wrap immediately and flush as much as the socket
/// accepts.
pub(crate) struct TlsChannel<'a> {
    core: &'a mut SessionCore,
}

impl<'a> TlsChannel<'a> {
    pub(crate) fn new(core: &'a mut SessionCore) -> Self {
        Self { core }
    }
}

impl Channel for TlsChannel<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.core.inbound_clear.read_into(buf);
        if n > 0 {
            return Ok(n);
        }
        if self.core.at_eof || !self.core.open.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(0);
        }
        Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.core.open.load(std::sync::atomic::Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "session is closed",
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let core = &mut *self.core;
        let mut written = 0;
        let mut engine_pending = false;
        loop {
            // Never wrap over unflushed ciphertext.
            if !core.outbound_encrypted.is_empty() {
                match flush_outbound(core) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        core.failure = Some(ChannelFailure::Socket);
                        return Err(e);
                    }
                }
            }
            if written == buf.len() && !engine_pending {
                break;
            }
            let res = match core
                .engine
                .wrap(&buf[written..], core.outbound_encrypted.write_slice())
            {
                Ok(res) => res,
                Err(e) => {
                    core.failure = Some(ChannelFailure::Tls);
                    return Err(e);
                }
            };
            core.outbound_encrypted.advance_write(res.produced);
            written += res.consumed;
            engine_pending = res.handshake == HandshakeStatus::NeedWrap;
            match res.status {
                EngineStatus::Ok => {}
                EngineStatus::BufferOverflow => {
                    // The wrap destination was a drained packet-size
                    // buffer; overflowing it is an engine conformance
                    // failure and the driver tears the session down.
                    core.failure = Some(ChannelFailure::Tls);
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "tls engine overflowed a drained outbound buffer",
                    ));
                }
                EngineStatus::Closed => {
                    if written == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "tls session closed outbound",
                        ));
                    }
                    break;
                }
                EngineStatus::BufferUnderflow => break,
            }
            if res.handshake == HandshakeStatus::NeedUnwrap
                || res.handshake == HandshakeStatus::NeedTask
            {
                // Mid-session handshake requirement; the driver re-enters
                // the handshake state machine after this callback returns.
                core.reneg_pending = true;
                break;
            }
            if res.consumed == 0 && res.produced == 0 {
                break;
            }
        }
        if written == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        }
        Ok(written)
    }
}
