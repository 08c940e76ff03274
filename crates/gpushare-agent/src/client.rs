//! The lock client: the agent's side of the scheduler protocol.
//!
//! Two helper threads run next to the application: a receiver that owns
//! the persistent connection and applies scheduler messages, and an
//! idle watcher that hands the lock back when the application stops
//! using the GPU. Application threads enter through
//! [`LockClient::continue_with_lock`], which blocks until the process
//! owns the lock (or trivially returns in permissive mode).
//!
//! Both loops return the fatal error instead of exiting so tests can
//! drive them in-process; the injected agent wraps them and terminates
//! the process on return, because losing the scheduler means losing the
//! arbitration the whole scheme depends on.

use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use gpushare_proto::transport;
use gpushare_proto::{Message, MessageType};

use crate::error::AgentError;
use crate::telemetry::UtilizationProbe;
use crate::window::KernelWindow;

/// How often the idle watcher checks for inactivity.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(5);

/// A context synchronize taking at least this long means work was still
/// in flight, so the process is not idle. Used only when no telemetry
/// probe is available.
const SYNC_BUSY_THRESHOLD: Duration = Duration::from_millis(100);

/// The GPU-facing operations the lock client needs. The real
/// implementation calls the CUDA driver; tests substitute a mock.
pub trait DeviceOps: Send + Sync {
    /// Capture the calling thread's GPU context so later drains can
    /// target it. Invoked from an application thread on its first gated
    /// call.
    fn capture_context(&self) -> Result<(), AgentError>;

    /// Drain all work submitted so far, returning how long the drain
    /// took.
    fn synchronize(&self) -> Result<Duration, AgentError>;
}

#[derive(Debug)]
struct ClientState {
    /// Observed scheduler mode: true while anti-thrash scheduling is on.
    scheduler_on: bool,
    owns_lock: bool,
    /// The lock was requested and not yet granted. The application may
    /// comprise many threads; the lock is requested once on behalf of
    /// the whole process.
    requested_lock: bool,
    /// Work was submitted since the idle watcher's last tick.
    did_work: bool,
    context_captured: bool,
}

pub struct LockClient {
    state: Mutex<ClientState>,
    own_lock_cv: Condvar,
    idle_cv: Condvar,
    stream: UnixStream,
    device: Box<dyn DeviceOps>,
    window: Arc<Mutex<KernelWindow>>,
    idle_interval: Duration,
    pub client_id: u64,
}

impl LockClient {
    /// Register with the scheduler over `stream` and learn the current
    /// mode. In permissive mode the client starts out owning the lock.
    pub fn bootstrap(
        stream: UnixStream,
        device: Box<dyn DeviceOps>,
        window: Arc<Mutex<KernelWindow>>,
        pod_name: String,
        pod_namespace: String,
        idle_interval: Duration,
    ) -> Result<Arc<Self>, AgentError> {
        let mut register = Message::new(MessageType::Register, 0);
        register.pod_name = pod_name;
        register.pod_namespace = pod_namespace;
        transport::write_frame(&stream, &register)?;
        tracing::debug!("Sent {}", register.kind);

        let reply = Message::decode(&transport::read_frame(&stream)?)?;
        tracing::debug!("Received {}", reply.kind);
        let scheduler_on = match reply.kind {
            MessageType::SchedOn => true,
            MessageType::SchedOff => false,
            other => return Err(AgentError::UnexpectedInitialMessage(other)),
        };
        let client_id = reply.client_id()?;
        tracing::info!("Successfully initialized gpushare GPU");
        tracing::info!("Client ID = {client_id:016x}");

        Ok(Arc::new(LockClient {
            state: Mutex::new(ClientState {
                scheduler_on,
                owns_lock: !scheduler_on,
                requested_lock: false,
                did_work: false,
                context_captured: false,
            }),
            own_lock_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            stream,
            device,
            window,
            idle_interval,
            client_id,
        }))
    }

    pub fn owns_lock(&self) -> bool {
        self.state.lock().expect("agent mutex poisoned").owns_lock
    }

    pub fn scheduler_on(&self) -> bool {
        self.state.lock().expect("agent mutex poisoned").scheduler_on
    }

    /// Gate used by every intercepted work-submission call. Returns
    /// only when the process owns the lock or the scheduler is
    /// permissive; the wait can last many seconds under contention.
    pub fn continue_with_lock(&self) -> Result<(), AgentError> {
        let mut st = self.state.lock().expect("agent mutex poisoned");

        if !st.context_captured {
            self.device.capture_context()?;
            st.context_captured = true;
        }

        while !st.owns_lock {
            if !st.requested_lock {
                st.requested_lock = true;
                let msg = Message::new(MessageType::ReqLock, self.client_id);
                transport::write_frame(&self.stream, &msg)?;
                tracing::debug!("Sent {}", msg.kind);
            }
            st = self
                .own_lock_cv
                .wait(st)
                .expect("agent mutex poisoned");
        }

        // We did something; push the early-release timer back.
        st.did_work = true;
        self.idle_cv.notify_all();
        Ok(())
    }

    /// Process scheduler messages until the transport fails. Returns
    /// the fatal error.
    pub fn receiver_loop(&self) -> AgentError {
        loop {
            let buf = match transport::read_frame(&self.stream) {
                Ok(buf) => buf,
                Err(e) => return e.into(),
            };
            let msg = match Message::decode(&buf) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!("Ignoring undecodable frame from scheduler: {e}");
                    continue;
                }
            };
            tracing::debug!("Received {}", msg.kind);

            let mut st = self.state.lock().expect("agent mutex poisoned");
            match msg.kind {
                MessageType::LockOk => {
                    st.requested_lock = false;
                    st.owns_lock = true;
                    // Restart the early-release timer so a grant is not
                    // immediately judged idle.
                    st.did_work = true;
                    // Whatever was in flight at the last release has
                    // long drained.
                    self.window
                        .lock()
                        .expect("window mutex poisoned")
                        .reset_count();
                    self.own_lock_cv.notify_all();
                    self.idle_cv.notify_all();
                }
                MessageType::DropLock => {
                    if st.owns_lock {
                        // Stop further submissions first, then drain
                        // what is already on the GPU.
                        st.owns_lock = false;
                        if let Err(e) = self.device.synchronize() {
                            tracing::warn!("Context synchronize failed during release: {e}");
                        }
                        let out = Message::new(MessageType::LockReleased, self.client_id);
                        if let Err(e) = transport::write_frame(&self.stream, &out) {
                            return e.into();
                        }
                        tracing::debug!("Sent {}", out.kind);
                    }
                }
                MessageType::SchedOn => {
                    if !st.scheduler_on {
                        tracing::debug!("Scheduler status changed to ON");
                        st.scheduler_on = true;
                        st.owns_lock = false;
                        st.requested_lock = false;
                    }
                }
                MessageType::SchedOff => {
                    if st.scheduler_on {
                        tracing::debug!("Scheduler status changed to OFF");
                        st.scheduler_on = false;
                        st.owns_lock = true;
                        st.requested_lock = false;
                        self.own_lock_cv.notify_all();
                    }
                }
                other => {
                    tracing::warn!("Ignoring unexpected message type {other}");
                }
            }
        }
    }

    /// Release the lock when the application goes quiet. Ticks every
    /// `idle_interval`; a tick with no new submissions consults the
    /// telemetry probe (or times a drain when no probe is available)
    /// before letting go. Returns the fatal transport error.
    pub fn idle_loop(&self, mut probe: Option<Box<dyn UtilizationProbe>>) -> AgentError {
        let mut st = self.state.lock().expect("agent mutex poisoned");
        loop {
            st.did_work = false;
            let deadline = Instant::now() + self.idle_interval;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let (guard, timeout) = self
                    .idle_cv
                    .wait_timeout(st, remaining)
                    .expect("agent mutex poisoned");
                st = guard;

                if !timeout.timed_out() {
                    if st.did_work {
                        break;
                    }
                    // Spurious wakeup: wait the remainder.
                    continue;
                }

                if !st.scheduler_on || !st.owns_lock || st.did_work {
                    break;
                }

                // No new submissions in a whole interval. The GPU may
                // still be chewing on earlier work, so check before
                // concluding the process is idle.
                let sampled = probe.as_mut().map(|p| p.utilization());
                let idle = match sampled {
                    Some(Ok(util)) => {
                        tracing::debug!("GPU utilization = {util} %");
                        util == 0
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            "Utilization probe failed ({e}); falling back to \
                             synchronize timing"
                        );
                        probe = None;
                        break;
                    }
                    None => match self.device.synchronize() {
                        Ok(took) => took < SYNC_BUSY_THRESHOLD,
                        Err(e) => {
                            tracing::warn!("Context synchronize failed during idle check: {e}");
                            break;
                        }
                    },
                };
                if !idle {
                    tracing::debug!("Early release timer elapsed but we are not idle");
                    break;
                }

                tracing::debug!("Releasing the lock early due to inactivity");
                let msg = Message::new(MessageType::LockReleased, self.client_id);
                if let Err(e) = transport::write_frame(&self.stream, &msg) {
                    return e.into();
                }
                st.owns_lock = false;
                tracing::debug!("Sent {}", msg.kind);
                break;
            }
        }
    }
}

/// Block every signal for the calling thread, so the application's own
/// threads keep receiving them all.
pub fn block_all_signals() {
    use nix::sys::signal::{pthread_sigmask, SigmaskHow, SigSet};
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), None) {
        tracing::warn!("Could not block signals for agent thread: {e}");
    }
}
