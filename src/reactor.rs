//! tokio-backed reactor: readiness loop and selector bridge.
//!
//! Each connection is owned by one tokio task. The session requests
//! readiness through the bridge, which records armed interest and wakes
//! the task; the task polls `TcpStream::ready()` for exactly the armed
//! interest and dispatches the session's entry points. Delegated tasks run
//! on the blocking pool and their completion is delivered back to the
//! owning task as an event, which keeps every engine call and buffer
//! mutation for a session on its own task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::bridge::{HandlerDescriptor, SelectorBridge};
use crate::comms::CommsHandler;
use crate::engine::{DelegatedTask, TlsEngine};
use crate::plain::PlainSession;
use crate::session::{Role, SessionDriver, TlsSession};
use crate::socket::TokioSocket;

/// Events delivered to a session's owning task from other contexts.
pub(crate) enum ControlEvent {
    /// A delegated task finished on the blocking pool.
    TaskDone,
    /// The application requested an orderly close.
    CloseRequest,
    /// Armed interest changed; recompute the poll set.
    Rearm,
}

/// Per-loop bookkeeping of active sessions and their current driver kind.
pub struct HandlerRegistry {
    name: String,
    next_index: AtomicU64,
    handlers: Mutex<FxHashMap<u64, HandlerDescriptor>>,
}

impl HandlerRegistry {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            next_index: AtomicU64::new(0),
            handlers: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_sessions(&self) -> usize {
        self.handlers.lock().len()
    }

    fn allocate_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, descriptor: HandlerDescriptor) {
        self.handlers.lock().insert(descriptor.index, descriptor);
    }

    fn remove(&self, index: u64) {
        self.handlers.lock().remove(&index);
    }
}

/// `SelectorBridge` for one session owned by a reactor task.
pub(crate) struct ReactorBridge {
    index: u64,
    registry: Arc<HandlerRegistry>,
    read_armed: AtomicBool,
    write_armed: AtomicBool,
    events: mpsc::UnboundedSender<ControlEvent>,
}

impl SelectorBridge for ReactorBridge {
    fn select_for_read(&self) {
        if !self.read_armed.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(ControlEvent::Rearm);
        }
    }

    fn select_for_write(&self) {
        if !self.write_armed.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(ControlEvent::Rearm);
        }
    }

    fn execute(&self, task: DelegatedTask) {
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            task();
            let _ = events.send(ControlEvent::TaskDone);
        });
    }

    fn delink(&self) {
        self.registry.remove(self.index);
    }

    fn add_handler(&self, descriptor: HandlerDescriptor) {
        self.registry.insert(descriptor);
    }

    fn name(&self) -> String {
        self.registry.name.clone()
    }

    fn request_close(&self) {
        let _ = self.events.send(ControlEvent::CloseRequest);
    }
}

/// Attach a TLS session to an established stream and run it to completion.
pub fn spawn_tls_session(
    stream: TcpStream,
    role: Role,
    engine: Box<dyn TlsEngine>,
    events: Box<dyn CommsHandler>,
    registry: Arc<HandlerRegistry>,
) {
    let (stream, bridge, rx) = split_stream(stream, registry);
    let socket = Box::new(TokioSocket::new(stream.clone()));
    let session = TlsSession::new(role, engine, socket, events, bridge.clone(), bridge.index);
    tokio::spawn(run_session(Box::new(session), stream, bridge, rx));
}

/// Attach a plaintext session to an established stream.
pub fn spawn_plain_session(
    stream: TcpStream,
    role: Role,
    events: Box<dyn CommsHandler>,
    registry: Arc<HandlerRegistry>,
) {
    let (stream, bridge, rx) = split_stream(stream, registry);
    let socket = Box::new(TokioSocket::new(stream.clone()));
    let session = PlainSession::new(role, socket, events, bridge.clone(), bridge.index);
    tokio::spawn(run_session(Box::new(session), stream, bridge, rx));
}

fn split_stream(
    stream: TcpStream,
    registry: Arc<HandlerRegistry>,
) -> (
    Arc<TcpStream>,
    Arc<ReactorBridge>,
    mpsc::UnboundedReceiver<ControlEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let bridge = Arc::new(ReactorBridge {
        index: registry.allocate_index(),
        registry,
        read_armed: AtomicBool::new(false),
        write_armed: AtomicBool::new(false),
        events: tx,
    });
    (Arc::new(stream), bridge, rx)
}

fn armed_interest(bridge: &ReactorBridge) -> Option<Interest> {
    let read = bridge.read_armed.load(Ordering::Acquire);
    let write = bridge.write_armed.load(Ordering::Acquire);
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

pub(crate) async fn run_session(
    mut driver: Box<dyn SessionDriver>,
    stream: Arc<TcpStream>,
    bridge: Arc<ReactorBridge>,
    mut events: mpsc::UnboundedReceiver<ControlEvent>,
) {
    driver.start();

    // Guards the buffered-plaintext fast path against an application that
    // re-arms read without consuming anything.
    let mut stalled_at = None;

    while driver.is_open() {
        let buffered = driver.buffered_plaintext();
        if buffered > 0
            && bridge.read_armed.load(Ordering::Acquire)
            && stalled_at != Some(buffered)
        {
            // Deliverable plaintext is already buffered; service the read
            // re-arm without touching the socket, unless the last such
            // delivery made no progress.
            bridge.read_armed.store(false, Ordering::Release);
            driver.on_readable();
            stalled_at = Some(buffered);
            continue;
        }

        let interest = armed_interest(&bridge);
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(ControlEvent::TaskDone) => {
                    stalled_at = None;
                    driver.on_task_complete();
                }
                Some(ControlEvent::CloseRequest) => driver.close(),
                Some(ControlEvent::Rearm) => {}
                None => break,
            },
            ready = stream.ready(interest.unwrap_or(Interest::READABLE)), if interest.is_some() => {
                stalled_at = None;
                match ready {
                    Ok(ready) => {
                        if (ready.is_readable() || ready.is_read_closed())
                            && bridge.read_armed.swap(false, Ordering::AcqRel)
                        {
                            driver.on_readable();
                        }
                        if !driver.is_open() {
                            break;
                        }
                        if (ready.is_writable() || ready.is_write_closed())
                            && bridge.write_armed.swap(false, Ordering::AcqRel)
                        {
                            driver.on_writable();
                        }
                    }
                    Err(e) => {
                        error!("readiness poll failed on session {}: {}", bridge.index, e);
                        driver.close();
                        break;
                    }
                }
            }
        }
    }
    debug!("session {} finished [{}]", bridge.index, bridge.registry.name);
}
