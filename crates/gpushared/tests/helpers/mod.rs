//! Helpers for running integration tests.
//!
//! It has to be under `tests/helpers/mod.rs` instead of
//! `tests/helpers.rs` to avoid it being treated as another test module.
//!
//! `TestScheduler` runs the real daemon threads on a socket inside a
//! temporary directory; `TestClient` speaks the wire protocol against
//! it like an agent would, with read timeouts so a misbehaving
//! scheduler fails the test instead of hanging it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use std::os::unix::net::UnixStream;
use tempfile::TempDir;

use gpushare_proto::transport;
use gpushare_proto::{Message, MessageType};
use gpushared::scheduler::Mode;
use gpushared::startup::{init_tracing, start_scheduler};

/// Default patience for replies that should arrive promptly.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        init_tracing(std::io::stdout).expect("Failed to initialize tracing");
    } else {
        init_tracing(std::io::sink).expect("Failed to initialize tracing");
    }
});

pub struct TestScheduler {
    pub socket_path: PathBuf,
    _dir: TempDir,
}

impl TestScheduler {
    /// Start the real scheduler threads on a fresh socket.
    pub fn start(mode: Mode, quantum_s: u64) -> Self {
        Lazy::force(&TRACING);

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let socket_path = dir.path().join("scheduler.sock");
        let listener =
            transport::bind_listener(&socket_path).expect("Failed to bind test socket");
        start_scheduler(listener, mode, Duration::from_secs(quantum_s))
            .expect("Failed to start scheduler");

        TestScheduler {
            socket_path,
            _dir: dir,
        }
    }

    /// Send one administrative frame the way gpusharectl does: fresh
    /// connection, one frame, close.
    pub fn send_control(&self, kind: MessageType, data: &str) {
        let stream = transport::connect(&self.socket_path).expect("Failed to connect");
        let mut msg = Message::new(kind, 0xBEEF);
        msg.data = data.into();
        transport::write_frame(&stream, &msg).expect("Failed to send control frame");
    }
}

pub struct TestClient {
    stream: UnixStream,
    pub id: u64,
}

impl TestClient {
    /// Connect without registering.
    pub fn connect(path: &Path) -> Self {
        let stream = transport::connect(path).expect("Failed to connect");
        stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .expect("Failed to set read timeout");
        TestClient { stream, id: 0 }
    }

    /// Connect and register, returning the client and the mode the
    /// scheduler reported.
    pub fn register(sched: &TestScheduler, pod_name: &str) -> (Self, MessageType) {
        let mut client = Self::connect(&sched.socket_path);
        let mut msg = Message::new(MessageType::Register, 0);
        msg.pod_name = pod_name.into();
        msg.pod_namespace = "default".into();
        client.send_msg(&msg);
        let reply = client.recv().expect("No registration reply");
        client.id = reply.client_id().expect("Registration reply without id");
        (client, reply.kind)
    }

    pub fn send(&self, kind: MessageType) {
        self.send_msg(&Message::new(kind, self.id));
    }

    fn send_msg(&self, msg: &Message) {
        transport::write_frame(&self.stream, msg).expect("Failed to send frame");
    }

    pub fn recv(&self) -> io::Result<Message> {
        let buf = transport::read_frame(&self.stream)?;
        Ok(Message::decode(&buf).expect("Scheduler sent an undecodable frame"))
    }

    /// Receive one frame and assert its type.
    pub fn expect(&self, kind: MessageType) -> Message {
        let msg = self
            .recv()
            .unwrap_or_else(|e| panic!("Expected {kind}, got error: {e}"));
        assert_eq!(msg.kind, kind, "expected {kind}, received {}", msg.kind);
        msg
    }

    /// Assert that nothing arrives within `window`.
    pub fn expect_silence(&self, window: Duration) {
        self.stream
            .set_read_timeout(Some(window))
            .expect("Failed to set read timeout");
        match self.recv() {
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Ok(msg) => panic!("Expected silence, received {}", msg.kind),
            Err(e) => panic!("Expected silence, got error: {e}"),
        }
        self.stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .expect("Failed to set read timeout");
    }

    /// Assert that the scheduler has closed this connection.
    pub fn expect_closed(&self) {
        match self.recv() {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
            Ok(msg) => panic!("Expected closed connection, received {}", msg.kind),
            Err(e) => panic!("Expected closed connection, got error: {e}"),
        }
    }
}
