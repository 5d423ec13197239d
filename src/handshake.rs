//! The handshake-phase driver.
//!
//! Drives the engine from `begin_handshake` to `Finished`, arbitrating
//! between reading ciphertext, wrapping handshake records, offloading
//! delegated tasks and going back to the select queue. The driver suspends
//! at exactly three points: after re-arming readiness, after submitting a
//! delegated task, and after a clean return to the reactor. It never wraps
//! while the outbound buffer still holds unflushed bytes; a write-readiness
//! event drains them first.

use log::{debug, error, trace};

use crate::engine::{EngineStatus, HandshakeStatus};
use crate::session::{flush_outbound, wrap_record, TlsSession};

impl TlsSession {
    /// Accept/connect entry point: start the engine handshake and drive.
    pub(crate) fn begin_handshake(&mut self) {
        if let Err(e) = self.core.engine.begin_handshake() {
            error!(
                "error beginning handshake on session {}: {} [{}]",
                self.core.index,
                e,
                self.bridge.name()
            );
            self.close();
            return;
        }
        self.drive();
    }

    /// The handshake drive loop: inspect the engine's requirement and act
    /// until the session suspends or the handshake completes.
    pub(crate) fn drive(&mut self) {
        loop {
            let status = self.core.engine.handshake_status();
            trace!(
                "session {} handshake status: {:?} [{}]",
                self.core.index,
                status,
                self.bridge.name()
            );
            match status {
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    self.finish_handshake();
                    return;
                }
                HandshakeStatus::NeedTask => {
                    self.offload_task();
                    return;
                }
                HandshakeStatus::NeedUnwrap => {
                    if let Err(e) = self.drive_unwrap() {
                        error!(
                            "error unwrapping during handshake on session {}: {} [{}]",
                            self.core.index,
                            e,
                            self.bridge.name()
                        );
                        self.close();
                    }
                    return;
                }
                HandshakeStatus::NeedWrap => {
                    if !self.core.outbound_encrypted.is_empty() {
                        // Unflushed bytes from a prior wrap; drain them on
                        // write readiness before producing another record.
                        self.bridge.select_for_write();
                        return;
                    }
                    let res = match wrap_record(&mut self.core) {
                        Ok(res) => res,
                        Err(e) => {
                            error!(
                                "error wrapping outbound data during handshake on session {}: {} [{}]",
                                self.core.index,
                                e,
                                self.bridge.name()
                            );
                            self.close();
                            return;
                        }
                    };
                    trace!(
                        "session {} wrapping: {:?} [{}]",
                        self.core.index,
                        res,
                        self.bridge.name()
                    );
                    debug_assert!(
                        res.produced != 0,
                        "no net data produced during handshake wrap [{}]",
                        self.bridge.name()
                    );
                    debug_assert!(
                        res.consumed == 0,
                        "app data consumed during handshake wrap [{}]",
                        self.bridge.name()
                    );
                    match flush_outbound(&mut self.core) {
                        Ok(true) => continue,
                        Ok(false) => {
                            self.bridge.select_for_write();
                            return;
                        }
                        Err(e) => {
                            self.fatal("handshake flush", &e);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One unwrap step: read ciphertext off the socket, drain as many
    /// handshake records as are complete, then dispatch on the outcome.
    pub(crate) fn drive_unwrap(&mut self) -> std::io::Result<()> {
        let core = &mut self.core;
        // A full ciphertext buffer would hand the socket an empty slice,
        // whose Ok(0) is indistinguishable from end of stream.
        let res = if core.inbound_encrypted.remaining_capacity() == 0 {
            Err(std::io::Error::from(std::io::ErrorKind::WouldBlock))
        } else {
            core.socket.read(core.inbound_encrypted.write_slice())
        };
        match res {
            Ok(0) => {
                // End of stream mid-handshake.
                trace!("end of stream during handshake on session {}", core.index);
                core.at_eof = true;
                if let Err(e) = core.engine.close_inbound() {
                    debug!(
                        "inbound close on session {} without close_notify: {}",
                        core.index, e
                    );
                }
                self.close();
                return Ok(());
            }
            Ok(n) => {
                trace!("read {} bytes from socket on session {}", n, core.index);
                core.inbound_encrypted.advance_write(n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        // Drain partial records: keep unwrapping while the engine makes
        // handshake progress without producing plaintext.
        let mut res;
        loop {
            res = core.engine.unwrap(
                core.inbound_encrypted.as_slice(),
                core.inbound_clear.write_slice(),
            )?;
            core.inbound_encrypted.consume(res.consumed);
            core.inbound_clear.advance_write(res.produced);
            trace!("session {} unwrapping: {:?}", core.index, res);
            let drained_record = res.status == EngineStatus::Ok
                && res.handshake == HandshakeStatus::NeedUnwrap
                && res.produced == 0;
            if !drained_record || res.consumed == 0 {
                break;
            }
        }
        if res.status == EngineStatus::Ok && !core.inbound_encrypted.is_empty() {
            res = core.engine.unwrap(
                core.inbound_encrypted.as_slice(),
                core.inbound_clear.write_slice(),
            )?;
            core.inbound_encrypted.consume(res.consumed);
            core.inbound_clear.advance_write(res.produced);
            trace!("session {} unwrapping: {:?}", core.index, res);
        }

        core.inbound_encrypted.compact();

        match res.status {
            EngineStatus::BufferUnderflow => {
                self.bridge.select_for_read();
                return Ok(());
            }
            EngineStatus::Closed => {
                self.close();
                return Ok(());
            }
            EngineStatus::BufferOverflow => {
                // The plaintext buffer is sized to the packet size, so this
                // cannot happen with a conforming engine.
                debug_assert!(false, "buffer overflow on handshake unwrap");
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "buffer overflow on handshake unwrap of session {}",
                        self.core.index
                    ),
                ));
            }
            EngineStatus::Ok => {}
        }

        match res.handshake {
            HandshakeStatus::Finished => self.finish_handshake(),
            HandshakeStatus::NeedWrap => self.wrap_step(),
            HandshakeStatus::NeedTask => self.offload_task(),
            HandshakeStatus::NeedUnwrap => self.bridge.select_for_read(),
            HandshakeStatus::NotHandshaking => {
                debug_assert!(false, "engine not handshaking after handshake unwrap");
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("session {} not handshaking", self.core.index),
                ));
            }
        }
        Ok(())
    }

    /// The shared wrap step: produce one handshake record, flush it, then
    /// re-enter the driver state the engine asks for. On a partial flush
    /// the session stays selected for write and resumes there.
    pub(crate) fn wrap_step(&mut self) {
        let res = match wrap_record(&mut self.core) {
            Ok(res) => res,
            Err(e) => {
                error!(
                    "error wrapping outbound data during handshake on session {}: {} [{}]",
                    self.core.index,
                    e,
                    self.bridge.name()
                );
                self.close();
                return;
            }
        };
        trace!(
            "session {} wrapping: {:?} [{}]",
            self.core.index,
            res,
            self.bridge.name()
        );
        debug_assert!(
            res.produced != 0,
            "no net data produced during handshake wrap [{}]",
            self.bridge.name()
        );
        debug_assert!(
            res.consumed == 0,
            "app data consumed during handshake wrap [{}]",
            self.bridge.name()
        );

        match flush_outbound(&mut self.core) {
            Ok(true) => {}
            Ok(false) => {
                self.bridge.select_for_write();
                return;
            }
            Err(e) => {
                self.fatal("handshake flush", &e);
                return;
            }
        }

        match res.handshake {
            HandshakeStatus::Finished => self.finish_handshake(),
            HandshakeStatus::NeedTask => self.offload_task(),
            HandshakeStatus::NeedUnwrap => self.bridge.select_for_read(),
            HandshakeStatus::NeedWrap => self.drive(),
            HandshakeStatus::NotHandshaking => {
                error!(
                    "engine not handshaking after handshake wrap on session {} [{}]",
                    self.core.index,
                    self.bridge.name()
                );
                debug_assert!(false, "engine not handshaking after handshake wrap");
                self.close();
            }
        }
    }

    /// Submit the engine's delegated task to the executor. The completion
    /// event re-enters the drive loop on the owning reactor; at most one
    /// task is in flight per session.
    pub(crate) fn offload_task(&mut self) {
        match self.core.engine.take_delegated_task() {
            Some(task) => {
                debug_assert!(
                    !self.task_in_flight,
                    "second delegated task submitted while one is in flight"
                );
                trace!(
                    "session {} offloading delegated task [{}]",
                    self.core.index,
                    self.bridge.name()
                );
                self.task_in_flight = true;
                self.bridge.execute(task);
            }
            // The requirement changed between the status check and the
            // take; re-inspect.
            None => self.drive(),
        }
    }
}
