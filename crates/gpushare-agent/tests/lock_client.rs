//! Lock client tests against a scripted scheduler end.
//!
//! A `UnixStream` pair stands in for the scheduler connection: the test
//! plays the scheduler on the far end while a real `LockClient` runs on
//! the near end with mock device and telemetry seams.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use std::os::unix::net::UnixStream;

use gpushare_proto::transport;
use gpushare_proto::{Message, MessageType};

use gpushare_agent::client::{DeviceOps, LockClient};
use gpushare_agent::telemetry::UtilizationProbe;
use gpushare_agent::window::KernelWindow;
use gpushare_agent::AgentError;

const FAST: Duration = Duration::from_millis(50);

struct MockDevice {
    captures: AtomicU32,
    syncs: AtomicU32,
    sync_duration: Mutex<Duration>,
}

impl MockDevice {
    fn new() -> Arc<Self> {
        Arc::new(MockDevice {
            captures: AtomicU32::new(0),
            syncs: AtomicU32::new(0),
            sync_duration: Mutex::new(Duration::ZERO),
        })
    }

    fn set_sync_duration(&self, d: Duration) {
        *self.sync_duration.lock().unwrap() = d;
    }
}

struct MockDeviceHandle(Arc<MockDevice>);

impl DeviceOps for MockDeviceHandle {
    fn capture_context(&self) -> Result<(), AgentError> {
        self.0.captures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn synchronize(&self) -> Result<Duration, AgentError> {
        self.0.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(*self.0.sync_duration.lock().unwrap())
    }
}

struct MockProbe {
    utilization: Arc<Mutex<u32>>,
}

impl UtilizationProbe for MockProbe {
    fn utilization(&mut self) -> Result<u32, AgentError> {
        Ok(*self.utilization.lock().unwrap())
    }
}

/// The scripted scheduler side of the connection.
struct FakeScheduler {
    stream: UnixStream,
}

impl FakeScheduler {
    fn send(&self, kind: MessageType) {
        transport::write_frame(&self.stream, &Message::new(kind, 0)).unwrap();
    }

    fn recv(&self) -> io::Result<Message> {
        let buf = transport::read_frame(&self.stream)?;
        Ok(Message::decode(&buf).expect("agent sent an undecodable frame"))
    }

    fn expect(&self, kind: MessageType) -> Message {
        let msg = self
            .recv()
            .unwrap_or_else(|e| panic!("expected {kind}, got error: {e}"));
        assert_eq!(msg.kind, kind, "expected {kind}, received {}", msg.kind);
        msg
    }

    fn expect_silence(&self, window: Duration) {
        self.stream.set_read_timeout(Some(window)).unwrap();
        match self.recv() {
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Ok(msg) => panic!("expected silence, received {}", msg.kind),
            Err(e) => panic!("expected silence, got error: {e}"),
        }
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }
}

/// Bootstrap a client against a scripted scheduler reporting `initial`
/// as the mode, with the receiver thread running.
fn bootstrap(
    initial: MessageType,
    idle_interval: Duration,
) -> (Arc<LockClient>, FakeScheduler, Arc<MockDevice>) {
    let (near, far) = UnixStream::pair().unwrap();
    far.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Socket buffers are per-direction, so the registration reply can
    // be queued before the client even sends REGISTER.
    let mut reply = Message::new(initial, 0);
    reply.set_client_id(0x00c0_ffee_0000_4242);
    transport::write_frame(&far, &reply).unwrap();

    let device = MockDevice::new();
    let window = Arc::new(Mutex::new(KernelWindow::new()));
    let client = LockClient::bootstrap(
        near,
        Box::new(MockDeviceHandle(Arc::clone(&device))),
        window,
        "pod-test".into(),
        "default".into(),
        idle_interval,
    )
    .expect("bootstrap failed");

    let sched = FakeScheduler { stream: far };
    let register = sched.expect(MessageType::Register);
    assert_eq!(register.pod_name, "pod-test");

    let receiver = Arc::clone(&client);
    thread::spawn(move || {
        // Ends with an error once the test drops the scheduler end.
        let _ = receiver.receiver_loop();
    });

    (client, sched, device)
}

/// Run `continue_with_lock` on another thread, returning a handle that
/// reports completion.
fn gated_call(client: &Arc<LockClient>) -> std::sync::mpsc::Receiver<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let client = Arc::clone(client);
    thread::spawn(move || {
        client.continue_with_lock().expect("gate failed");
        let _ = tx.send(());
    });
    rx
}

#[test]
fn regaining_the_lock_resets_the_launch_count() {
    let (near, far) = UnixStream::pair().unwrap();
    far.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reply = Message::new(MessageType::SchedOn, 0);
    reply.set_client_id(1);
    transport::write_frame(&far, &reply).unwrap();

    let device = MockDevice::new();
    let window = Arc::new(Mutex::new(KernelWindow::new()));
    let client = LockClient::bootstrap(
        near,
        Box::new(MockDeviceHandle(Arc::clone(&device))),
        Arc::clone(&window),
        "pod-test".into(),
        "default".into(),
        Duration::from_secs(30),
    )
    .unwrap();
    let sched = FakeScheduler { stream: far };
    sched.expect(MessageType::Register);
    let receiver = Arc::clone(&client);
    thread::spawn(move || {
        let _ = receiver.receiver_loop();
    });

    // Widen the window to 2, then leave one launch pending.
    {
        let mut w = window.lock().unwrap();
        w.note_sync(Duration::from_millis(1));
        assert!(!w.note_launch());
    }

    // A fresh grant forgets the pending launch.
    sched.send(MessageType::LockOk);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !client.owns_lock() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!window.lock().unwrap().note_launch());
}

#[test]
fn bootstrap_learns_the_scheduler_mode() {
    let (client, _sched, _dev) = bootstrap(MessageType::SchedOn, Duration::from_secs(30));
    assert_eq!(client.client_id, 0x00c0_ffee_0000_4242);
    assert!(client.scheduler_on());
    assert!(!client.owns_lock());

    let (client, _sched, _dev) = bootstrap(MessageType::SchedOff, Duration::from_secs(30));
    assert!(!client.scheduler_on());
    assert!(client.owns_lock());
}

#[test]
fn gated_call_requests_the_lock_and_blocks_until_granted() {
    let (client, sched, device) = bootstrap(MessageType::SchedOn, Duration::from_secs(30));

    let done = gated_call(&client);
    sched.expect(MessageType::ReqLock);
    assert!(
        done.recv_timeout(Duration::from_millis(200)).is_err(),
        "gate returned before LOCK_OK"
    );

    sched.send(MessageType::LockOk);
    done.recv_timeout(Duration::from_secs(5))
        .expect("gate did not unblock on LOCK_OK");
    assert!(client.owns_lock());
    assert_eq!(device.captures.load(Ordering::SeqCst), 1);
}

#[test]
fn the_lock_is_requested_once_for_the_whole_process() {
    let (client, sched, _dev) = bootstrap(MessageType::SchedOn, Duration::from_secs(30));

    let first = gated_call(&client);
    let second = gated_call(&client);
    sched.expect(MessageType::ReqLock);
    // Two waiting threads, one REQ_LOCK.
    sched.expect_silence(Duration::from_millis(300));

    sched.send(MessageType::LockOk);
    first.recv_timeout(Duration::from_secs(5)).unwrap();
    second.recv_timeout(Duration::from_secs(5)).unwrap();

    // Subsequent gated calls while holding return without traffic.
    client.continue_with_lock().unwrap();
    sched.expect_silence(Duration::from_millis(200));
}

#[test]
fn drop_lock_drains_then_releases() {
    let (client, sched, device) = bootstrap(MessageType::SchedOn, Duration::from_secs(30));

    let done = gated_call(&client);
    sched.expect(MessageType::ReqLock);
    sched.send(MessageType::LockOk);
    done.recv_timeout(Duration::from_secs(5)).unwrap();

    sched.send(MessageType::DropLock);
    sched.expect(MessageType::LockReleased);
    assert!(!client.owns_lock());
    assert!(device.syncs.load(Ordering::SeqCst) >= 1);
}

#[test]
fn drop_lock_without_ownership_is_ignored() {
    let (client, sched, device) = bootstrap(MessageType::SchedOn, Duration::from_secs(30));

    sched.send(MessageType::DropLock);
    sched.expect_silence(Duration::from_millis(300));
    assert!(!client.owns_lock());
    assert_eq!(device.syncs.load(Ordering::SeqCst), 0);
}

#[test]
fn permissive_mode_unblocks_waiters_and_reverting_requires_a_new_request() {
    let (client, sched, _dev) = bootstrap(MessageType::SchedOn, Duration::from_secs(30));

    let done = gated_call(&client);
    sched.expect(MessageType::ReqLock);

    // The scheduler goes permissive; the waiter proceeds without a
    // grant.
    sched.send(MessageType::SchedOff);
    done.recv_timeout(Duration::from_secs(5))
        .expect("waiter did not unblock on SCHED_OFF");
    assert!(client.owns_lock());

    // Anti-thrash returns: ownership is revoked and the next gated call
    // starts a fresh REQ_LOCK round.
    sched.send(MessageType::SchedOn);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while client.owns_lock() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!client.owns_lock());

    let _pending = gated_call(&client);
    sched.expect(MessageType::ReqLock);
}

#[test]
fn idle_watcher_releases_an_unused_lock() {
    let (client, sched, _dev) = bootstrap(MessageType::SchedOn, FAST);
    let utilization = Arc::new(Mutex::new(0u32));
    let probe = Box::new(MockProbe {
        utilization: Arc::clone(&utilization),
    });
    let watcher = Arc::clone(&client);
    thread::spawn(move || {
        let _ = watcher.idle_loop(Some(probe));
    });

    let done = gated_call(&client);
    sched.expect(MessageType::ReqLock);
    sched.send(MessageType::LockOk);
    done.recv_timeout(Duration::from_secs(5)).unwrap();

    // No further work and 0% utilization: the lock goes back early.
    sched.expect(MessageType::LockReleased);
    assert!(!client.owns_lock());

    // The next submission starts a fresh request round.
    let _pending = gated_call(&client);
    sched.expect(MessageType::ReqLock);
}

#[test]
fn idle_watcher_defers_to_reported_utilization() {
    let (client, sched, _dev) = bootstrap(MessageType::SchedOn, FAST);
    let utilization = Arc::new(Mutex::new(87u32));
    let probe = Box::new(MockProbe {
        utilization: Arc::clone(&utilization),
    });
    let watcher = Arc::clone(&client);
    thread::spawn(move || {
        let _ = watcher.idle_loop(Some(probe));
    });

    let done = gated_call(&client);
    sched.expect(MessageType::ReqLock);
    sched.send(MessageType::LockOk);
    done.recv_timeout(Duration::from_secs(5)).unwrap();

    // Busy GPU: several idle intervals pass without a release.
    sched.expect_silence(FAST * 6);

    *utilization.lock().unwrap() = 0;
    sched.expect(MessageType::LockReleased);
}

#[test]
fn idle_watcher_falls_back_to_drain_timing() {
    let (client, sched, device) = bootstrap(MessageType::SchedOn, FAST);
    // Drains take longer than the busy threshold: still working.
    device.set_sync_duration(Duration::from_millis(150));
    let watcher = Arc::clone(&client);
    thread::spawn(move || {
        let _ = watcher.idle_loop(None);
    });

    let done = gated_call(&client);
    sched.expect(MessageType::ReqLock);
    sched.send(MessageType::LockOk);
    done.recv_timeout(Duration::from_secs(5)).unwrap();

    sched.expect_silence(FAST * 6);

    device.set_sync_duration(Duration::from_millis(1));
    sched.expect(MessageType::LockReleased);
    assert!(!client.owns_lock());
}

#[test]
fn submissions_keep_the_idle_watcher_at_bay() {
    let (client, sched, _dev) = bootstrap(MessageType::SchedOn, Duration::from_millis(200));
    let utilization = Arc::new(Mutex::new(0u32));
    let probe = Box::new(MockProbe {
        utilization: Arc::clone(&utilization),
    });
    let watcher = Arc::clone(&client);
    thread::spawn(move || {
        let _ = watcher.idle_loop(Some(probe));
    });

    let done = gated_call(&client);
    sched.expect(MessageType::ReqLock);
    sched.send(MessageType::LockOk);
    done.recv_timeout(Duration::from_secs(5)).unwrap();

    // Keep submitting; every call marks the interval as busy.
    for _ in 0..6 {
        thread::sleep(Duration::from_millis(60));
        client.continue_with_lock().unwrap();
    }
    assert!(client.owns_lock());

    // Stop submitting; the watcher lets go within a couple intervals.
    sched.expect(MessageType::LockReleased);
}
