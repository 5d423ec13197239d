//! Raw TCP session, no TLS.
//!
//! Shares the TLS session's external shape (the same event handler
//! contract and the same bridge), but the channel handed to callbacks
//! reads and writes the socket directly. Accept/connect are announced
//! immediately on registration since there is no handshake to wait for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;

use crate::bridge::{HandlerDescriptor, HandlerKind, SelectorBridge};
use crate::comms::{Channel, CommsHandler, SessionHandle};
use crate::session::{Role, SessionDriver};
use crate::socket::SocketChannel;

/// A socket session that passes bytes through untouched.
pub struct PlainSession {
    role: Role,
    index: u64,
    socket: Box<dyn SocketChannel>,
    events: Box<dyn CommsHandler>,
    bridge: Arc<dyn SelectorBridge>,
    open: Arc<AtomicBool>,
    at_eof: bool,
}

impl PlainSession {
    pub(crate) fn new(
        role: Role,
        socket: Box<dyn SocketChannel>,
        events: Box<dyn CommsHandler>,
        bridge: Arc<dyn SelectorBridge>,
        index: u64,
    ) -> Self {
        bridge.add_handler(HandlerDescriptor {
            index,
            kind: HandlerKind::Plain,
        });
        Self {
            role,
            index,
            socket,
            events,
            bridge,
            open: Arc::new(AtomicBool::new(true)),
            at_eof: false,
        }
    }

    fn teardown(&mut self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        trace!("tearing down session {} [{}]", self.index, self.bridge.name());
        self.bridge.delink();
        let mut channel = PlainChannel {
            socket: self.socket.as_ref(),
            at_eof: &mut self.at_eof,
        };
        self.events.closing(&mut channel);
        self.socket.shutdown();
    }
}

impl SessionDriver for PlainSession {
    fn start(&mut self) {
        let handle = SessionHandle::new(self.index, self.bridge.clone());
        let mut channel = PlainChannel {
            socket: self.socket.as_ref(),
            at_eof: &mut self.at_eof,
        };
        match self.role {
            Role::Client => self.events.on_connect(&mut channel, handle),
            Role::Server => self.events.on_accept(&mut channel, handle),
        }
    }

    fn on_readable(&mut self) {
        if !self.is_open() {
            return;
        }
        let mut channel = PlainChannel {
            socket: self.socket.as_ref(),
            at_eof: &mut self.at_eof,
        };
        self.events.on_read(&mut channel);
        if self.at_eof {
            self.teardown();
        }
    }

    fn on_writable(&mut self) {
        if !self.is_open() {
            return;
        }
        let mut channel = PlainChannel {
            socket: self.socket.as_ref(),
            at_eof: &mut self.at_eof,
        };
        self.events.on_write(&mut channel);
    }

    fn on_task_complete(&mut self) {}

    fn close(&mut self) {
        self.teardown();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn buffered_plaintext(&self) -> usize {
        0
    }
}

/// Channel view straight onto the socket.
struct PlainChannel<'a> {
    socket: &'a dyn SocketChannel,
    at_eof: &'a mut bool,
}

impl Channel for PlainChannel<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.socket.read(buf)?;
        if n == 0 && !buf.is_empty() {
            *self.at_eof = true;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.write(buf)
    }
}
