//! Scripted doubles for driving the session state machine in tests: a
//! scripted TLS engine, a scripted socket, a recording bridge that lets
//! the test play reactor, and a recording application handler.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::{HandlerDescriptor, HandlerKind, SelectorBridge};
use crate::comms::{Channel, CommsHandler, SessionHandle};
use crate::engine::{
    DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, TlsEngine,
};
use crate::session::{Role, TlsSession};
use crate::socket::SocketChannel;

pub(crate) const CLOSE_NOTIFY: &[u8] = b"!close_notify!";

/// One scripted response to a wrap call.
pub(crate) struct WrapStep {
    pub produce: usize,
    pub status: EngineStatus,
    pub next: HandshakeStatus,
}

/// One scripted response to an unwrap call. The step holds until `need`
/// source bytes are available; until then the engine reports underflow.
pub(crate) struct UnwrapStep {
    pub need: usize,
    pub consume: usize,
    pub produce: usize,
    pub status: EngineStatus,
    pub next: HandshakeStatus,
}

pub(crate) struct MockEngineState {
    pub status: HandshakeStatus,
    pub wrap_script: VecDeque<WrapStep>,
    pub unwrap_script: VecDeque<UnwrapStep>,
    /// Statuses delegated tasks set on completion, one per NeedTask.
    pub task_script: VecDeque<HandshakeStatus>,
    /// Pass application bytes through unchanged once not handshaking.
    pub transparent: bool,
    pub wrap_calls: usize,
    pub unwrap_calls: usize,
    pub tasks_taken: usize,
    pub inbound_closed: bool,
    pub outbound_closed: bool,
    pub close_notify_wraps: usize,
}

impl MockEngineState {
    pub fn new(status: HandshakeStatus) -> Self {
        Self {
            status,
            wrap_script: VecDeque::new(),
            unwrap_script: VecDeque::new(),
            task_script: VecDeque::new(),
            transparent: false,
            wrap_calls: 0,
            unwrap_calls: 0,
            tasks_taken: 0,
            inbound_closed: false,
            outbound_closed: false,
            close_notify_wraps: 0,
        }
    }
}

pub(crate) struct MockEngine {
    pub state: Arc<Mutex<MockEngineState>>,
    pub packet_size: usize,
}

impl TlsEngine for MockEngine {
    fn packet_buffer_size(&self) -> usize {
        self.packet_size
    }

    fn begin_handshake(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> std::io::Result<EngineResult> {
        let mut state = self.state.lock();
        state.wrap_calls += 1;
        if state.outbound_closed {
            if state.close_notify_wraps == 0 {
                state.close_notify_wraps = 1;
                assert!(dst.len() >= CLOSE_NOTIFY.len());
                dst[..CLOSE_NOTIFY.len()].copy_from_slice(CLOSE_NOTIFY);
                return Ok(EngineResult {
                    status: EngineStatus::Ok,
                    handshake: state.status,
                    consumed: 0,
                    produced: CLOSE_NOTIFY.len(),
                });
            }
            return Ok(EngineResult {
                status: EngineStatus::Closed,
                handshake: state.status,
                consumed: 0,
                produced: 0,
            });
        }
        if let Some(step) = state.wrap_script.pop_front() {
            assert!(
                dst.len() >= step.produce,
                "wrap destination too small for scripted record"
            );
            dst[..step.produce].fill(b'w');
            state.status = step.next;
            return Ok(EngineResult {
                status: step.status,
                handshake: step.next,
                consumed: 0,
                produced: step.produce,
            });
        }
        if state.transparent && state.status == HandshakeStatus::NotHandshaking {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            return Ok(EngineResult {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: n,
                produced: n,
            });
        }
        panic!("unexpected wrap call (status {:?})", state.status);
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> std::io::Result<EngineResult> {
        let mut state = self.state.lock();
        state.unwrap_calls += 1;
        if state.inbound_closed {
            return Ok(EngineResult {
                status: EngineStatus::Closed,
                handshake: state.status,
                consumed: 0,
                produced: 0,
            });
        }
        if let Some(step) = state.unwrap_script.front() {
            if src.len() < step.need {
                let handshake = state.status;
                return Ok(EngineResult {
                    status: EngineStatus::BufferUnderflow,
                    handshake,
                    consumed: 0,
                    produced: 0,
                });
            }
            let step = state.unwrap_script.pop_front().unwrap();
            assert!(dst.len() >= step.produce);
            dst[..step.produce].fill(b'u');
            state.status = step.next;
            return Ok(EngineResult {
                status: step.status,
                handshake: step.next,
                consumed: step.consume,
                produced: step.produce,
            });
        }
        if state.transparent && state.status == HandshakeStatus::NotHandshaking {
            if src.is_empty() {
                return Ok(EngineResult {
                    status: EngineStatus::BufferUnderflow,
                    handshake: HandshakeStatus::NotHandshaking,
                    consumed: 0,
                    produced: 0,
                });
            }
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            return Ok(EngineResult {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NotHandshaking,
                consumed: n,
                produced: n,
            });
        }
        Ok(EngineResult {
            status: EngineStatus::BufferUnderflow,
            handshake: state.status,
            consumed: 0,
            produced: 0,
        })
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        let mut state = self.state.lock();
        let status = state.status;
        if status == HandshakeStatus::Finished {
            state.status = HandshakeStatus::NotHandshaking;
        }
        status
    }

    fn take_delegated_task(&mut self) -> Option<DelegatedTask> {
        let mut state = self.state.lock();
        if state.status != HandshakeStatus::NeedTask {
            return None;
        }
        let next = state.task_script.pop_front()?;
        state.tasks_taken += 1;
        let shared = self.state.clone();
        Some(Box::new(move || {
            shared.lock().status = next;
        }))
    }

    fn close_inbound(&mut self) -> std::io::Result<()> {
        self.state.lock().inbound_closed = true;
        Ok(())
    }

    fn close_outbound(&mut self) {
        self.state.lock().outbound_closed = true;
    }

    fn is_outbound_done(&self) -> bool {
        let state = self.state.lock();
        state.outbound_closed && state.close_notify_wraps > 0
    }
}

pub(crate) enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Error(std::io::ErrorKind),
}

pub(crate) struct MockSocketState {
    pub reads: VecDeque<ReadEvent>,
    pub written: Vec<u8>,
    /// Max bytes accepted per write call.
    pub write_cap: usize,
    /// Total bytes accepted before reporting WouldBlock; None = unlimited.
    pub write_budget: Option<usize>,
    pub write_error: Option<std::io::ErrorKind>,
    pub shutdown: bool,
}

impl MockSocketState {
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            written: vec![],
            write_cap: usize::MAX,
            write_budget: None,
            write_error: None,
            shutdown: false,
        }
    }
}

pub(crate) struct MockSocket(pub Arc<Mutex<MockSocketState>>);

impl SocketChannel for MockSocket {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.0.lock();
        match state.reads.pop_front() {
            Some(ReadEvent::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    data.drain(..n);
                    state.reads.push_front(ReadEvent::Data(data));
                }
                Ok(n)
            }
            Some(ReadEvent::Eof) => {
                state.reads.push_front(ReadEvent::Eof);
                Ok(0)
            }
            Some(ReadEvent::Error(kind)) => Err(std::io::Error::from(kind)),
            None => Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)),
        }
    }

    fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.0.lock();
        if let Some(kind) = state.write_error.take() {
            return Err(std::io::Error::from(kind));
        }
        let budget = state.write_budget.unwrap_or(usize::MAX);
        let allowed = buf.len().min(state.write_cap).min(budget);
        if allowed == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        }
        state.written.extend_from_slice(&buf[..allowed]);
        if let Some(ref mut budget) = state.write_budget {
            *budget -= allowed;
        }
        Ok(allowed)
    }

    fn shutdown(&self) {
        self.0.lock().shutdown = true;
    }

    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BridgeCall {
    SelectRead,
    SelectWrite,
    Execute,
    Delink,
    AddHandler(HandlerKind),
    RequestClose,
}

pub(crate) struct RecordingBridge {
    pub calls: Mutex<Vec<BridgeCall>>,
    pub tasks: Mutex<Vec<DelegatedTask>>,
}

impl RecordingBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(vec![]),
            tasks: Mutex::new(vec![]),
        })
    }

    pub fn count(&self, call: BridgeCall) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    /// Run the oldest submitted delegated task, as the executor would.
    pub fn run_next_task(&self) {
        let task = self.tasks.lock().remove(0);
        task();
    }
}

impl SelectorBridge for RecordingBridge {
    fn select_for_read(&self) {
        self.calls.lock().push(BridgeCall::SelectRead);
    }

    fn select_for_write(&self) {
        self.calls.lock().push(BridgeCall::SelectWrite);
    }

    fn execute(&self, task: DelegatedTask) {
        self.calls.lock().push(BridgeCall::Execute);
        self.tasks.lock().push(task);
    }

    fn delink(&self) {
        self.calls.lock().push(BridgeCall::Delink);
    }

    fn add_handler(&self, descriptor: HandlerDescriptor) {
        self.calls.lock().push(BridgeCall::AddHandler(descriptor.kind));
    }

    fn name(&self) -> String {
        "test".to_string()
    }

    fn request_close(&self) {
        self.calls.lock().push(BridgeCall::RequestClose);
    }
}

#[derive(Default)]
pub(crate) struct HandlerLog {
    pub accepted: usize,
    pub connected: usize,
    pub closings: usize,
    pub read_events: usize,
    pub write_events: usize,
    /// Concatenation of all bytes pulled in `on_read`.
    pub reads: Vec<u8>,
    pub handle: Option<SessionHandle>,
    /// Re-arm read after each `on_read`.
    pub rearm_read: bool,
    /// Skip draining in `on_read`, to exercise redelivery.
    pub skip_reads: bool,
    /// Bytes to write as soon as the session is announced.
    pub write_on_announce: Vec<u8>,
    /// Outcome of the announce-time write.
    pub announce_write_result: Option<std::io::Result<usize>>,
}

pub(crate) struct RecordingHandler(pub Arc<Mutex<HandlerLog>>);

impl RecordingHandler {
    fn announce(&mut self, channel: &mut dyn Channel, handle: SessionHandle) {
        let mut log = self.0.lock();
        log.handle = Some(handle);
        if !log.write_on_announce.is_empty() {
            let data = log.write_on_announce.clone();
            log.announce_write_result = Some(channel.write(&data));
        }
    }
}

impl CommsHandler for RecordingHandler {
    fn on_accept(&mut self, channel: &mut dyn Channel, handle: SessionHandle) {
        self.0.lock().accepted += 1;
        self.announce(channel, handle);
    }

    fn on_connect(&mut self, channel: &mut dyn Channel, handle: SessionHandle) {
        self.0.lock().connected += 1;
        self.announce(channel, handle);
    }

    fn on_read(&mut self, channel: &mut dyn Channel) {
        let mut log = self.0.lock();
        log.read_events += 1;
        if log.skip_reads {
            return;
        }
        let mut buf = [0u8; 256];
        loop {
            match channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => log.reads.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected channel read error: {}", e),
            }
        }
        if log.rearm_read {
            if let Some(ref handle) = log.handle {
                handle.select_for_read();
            }
        }
    }

    fn on_write(&mut self, _channel: &mut dyn Channel) {
        self.0.lock().write_events += 1;
    }

    fn closing(&mut self, _channel: &mut dyn Channel) {
        self.0.lock().closings += 1;
    }
}

/// A TLS session wired to scripted doubles, plus handles to all of them.
pub(crate) struct SessionFixture {
    pub session: TlsSession,
    pub engine: Arc<Mutex<MockEngineState>>,
    pub socket: Arc<Mutex<MockSocketState>>,
    pub bridge: Arc<RecordingBridge>,
    pub log: Arc<Mutex<HandlerLog>>,
}

pub(crate) fn fixture(role: Role, initial: HandshakeStatus) -> SessionFixture {
    let engine = Arc::new(Mutex::new(MockEngineState::new(initial)));
    let socket = Arc::new(Mutex::new(MockSocketState::new()));
    let bridge = RecordingBridge::new();
    let log = Arc::new(Mutex::new(HandlerLog::default()));
    let session = TlsSession::new(
        role,
        Box::new(MockEngine {
            state: engine.clone(),
            packet_size: 1024,
        }),
        Box::new(MockSocket(socket.clone())),
        Box::new(RecordingHandler(log.clone())),
        bridge.clone(),
        7,
    );
    SessionFixture {
        session,
        engine,
        socket,
        bridge,
        log,
    }
}
