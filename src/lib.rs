//! laces - a readiness-driven non-blocking TCP communications framework
//! with transparent TLS.
//!
//! Applications attach a [`CommsHandler`] to a socket and are called back
//! on accept/connect/read/write readiness. For TLS listeners and
//! connectors the framework mediates the TLS handshake and record
//! wrap/unwrap behind the channel handed to the callbacks, so the
//! application only ever sees plaintext bytes.
//!
//! ```ignore
//! struct Echo { handle: Option<SessionHandle> }
//!
//! impl CommsHandler for Echo {
//!     fn on_accept(&mut self, _channel: &mut dyn Channel, handle: SessionHandle) {
//!         handle.select_for_read();
//!         self.handle = Some(handle);
//!     }
//!     // on_read pulls plaintext until WouldBlock, writes it back, and
//!     // re-arms with handle.select_for_read() ...
//! #   fn on_connect(&mut self, _: &mut dyn Channel, _: SessionHandle) {}
//! #   fn on_read(&mut self, _: &mut dyn Channel) {}
//! #   fn on_write(&mut self, _: &mut dyn Channel) {}
//! #   fn closing(&mut self, _: &mut dyn Channel) {}
//! }
//! ```

mod bridge;
mod buffer;
mod comms;
mod engine;
mod flow;
mod handshake;
mod plain;
mod reactor;
mod rustls_engine;
mod session;
mod socket;

/// Configuration types.
pub mod config;

/// rustls client/server configuration builders.
pub mod rustls_config;

/// Server bootstrap and outbound connect.
pub mod server;

pub use bridge::{Continuation, HandlerDescriptor, HandlerKind, SelectorBridge};
pub use buffer::SessionBuffer;
pub use comms::{Channel, CommsHandler, CommsHandlerFactory, SessionHandle};
pub use engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
pub use reactor::{spawn_plain_session, spawn_tls_session, HandlerRegistry};
pub use rustls_engine::{RustlsEngine, PACKET_BUFFER_SIZE};
pub use session::Role;
pub use socket::{SocketChannel, TokioSocket};

#[cfg(test)]
mod test_util;
