//! Scheduler state and message handling.
//!
//! All shared state lives in [`SchedulerState`] behind a single mutex.
//! The dispatcher thread ([`crate::event_loop`]) takes the mutex for
//! each batch of ready events; the timer thread ([`crate::timer`])
//! holds it except while blocked on the condition variable. Clients are
//! handled strictly: any transport hiccup, protocol violation, or
//! unknown frame removes the offending client.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use gpushare_proto::transport;
use gpushare_proto::{Message, MessageType};

/// Frames originated by the scheduler carry this id; nothing inspects
/// it, but it keeps scheduler frames recognizable in traffic dumps.
const SCHEDULER_FRAME_ID: u64 = 0;

/// Scheduling mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// The GPU lock is mutually exclusive and granted FCFS.
    AntiThrash,
    /// Every client behaves as if it held the lock.
    Permissive,
}

impl Mode {
    /// The broadcast frame type announcing this mode.
    pub fn frame_type(self) -> MessageType {
        match self {
            Mode::AntiThrash => MessageType::SchedOn,
            Mode::Permissive => MessageType::SchedOff,
        }
    }
}

/// One connected client.
pub struct Client {
    pub stream: UnixStream,
    /// `None` until the client registers.
    pub id: Option<u64>,
    pub pod_name: String,
    pub pod_namespace: String,
}

impl Client {
    fn new(stream: UnixStream) -> Self {
        Client {
            stream,
            id: None,
            pod_name: String::new(),
            pod_namespace: String::new(),
        }
    }

    /// Hex id for log lines, or a placeholder before registration.
    pub fn label(&self) -> String {
        match self.id {
            Some(id) => format!("{id:016x}"),
            None => "<unregistered>".into(),
        }
    }
}

/// Mutable scheduler state, guarded by [`Scheduler::state`].
pub struct SchedulerState {
    /// Connected clients keyed by the raw fd of their connection.
    pub clients: HashMap<RawFd, Client>,
    /// FCFS lock requests. The head is the current holder whenever
    /// `lock_held` is set.
    pub queue: VecDeque<RawFd>,
    pub mode: Mode,
    pub quantum: Duration,
    pub lock_held: bool,
    /// Incremented on every successful grant. The timer thread only
    /// acts on a deadline armed for the current round.
    pub round: u64,
    /// Tells the timer thread that its deadline is stale.
    pub reset_timer: bool,
}

/// The scheduler: shared state plus the primitives the two threads
/// coordinate through.
pub struct Scheduler {
    pub state: Mutex<SchedulerState>,
    pub timer_cv: Condvar,
    /// Interest list of the dispatcher. epoll_ctl is thread-safe, so the
    /// timer thread may also deregister clients it removes.
    pub epoll: Epoll,
}

impl Scheduler {
    pub fn new(mode: Mode, quantum: Duration) -> nix::Result<Self> {
        Ok(Scheduler {
            state: Mutex::new(SchedulerState {
                clients: HashMap::new(),
                queue: VecDeque::new(),
                mode,
                quantum,
                lock_held: false,
                round: 0,
                reset_timer: false,
            }),
            timer_cv: Condvar::new(),
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
        })
    }

    /// Track a freshly accepted connection.
    pub fn add_client(&self, st: &mut SchedulerState, stream: UnixStream) {
        let fd = stream.as_raw_fd();
        let event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        if let Err(e) = self.epoll.add(&stream, event) {
            tracing::warn!("Could not watch new connection (fd {fd}): {e}");
            return;
        }
        st.clients.insert(fd, Client::new(stream));
        tracing::debug!("Accepted new connection (fd {fd})");
    }

    /// Remove a client: purge its queue entries (clearing `lock_held`
    /// if it was the holder), deregister it from epoll, and close the
    /// connection.
    pub fn remove_client(&self, st: &mut SchedulerState, fd: RawFd) {
        Self::drop_requests(st, fd);
        if let Some(client) = st.clients.remove(&fd) {
            tracing::info!("Removing client {}", client.label());
            if let Err(e) = self.epoll.delete(&client.stream) {
                tracing::debug!("Could not deregister fd {fd}: {e}");
            }
        }
    }

    /// Remove all of a client's entries from the request queue.
    fn drop_requests(st: &mut SchedulerState, fd: RawFd) {
        if st.queue.front() == Some(&fd) {
            // The head of the queue holds the GPU lock.
            st.lock_held = false;
        }
        st.queue.retain(|&f| f != fd);
    }

    /// Append a lock request unless the client is already enqueued.
    fn insert_request(st: &mut SchedulerState, fd: RawFd) {
        if st.queue.contains(&fd) {
            let label = st.clients[&fd].label();
            tracing::warn!("Client {label} has already requested the lock");
            return;
        }
        st.queue.push_back(fd);
    }

    /// Grant the lock to the head of the queue, dropping dead heads
    /// until a send succeeds or the queue is empty.
    pub fn try_grant(&self, st: &mut SchedulerState) {
        loop {
            let Some(&fd) = st.queue.front() else {
                tracing::debug!("No pending lock requests to grant");
                return;
            };
            let client = &st.clients[&fd];
            let msg = Message::new(MessageType::LockOk, SCHEDULER_FRAME_ID);
            match transport::try_send(&client.stream, &msg) {
                Ok(()) => {
                    tracing::info!("Sent LOCK_OK to client {}", client.label());
                    st.round = st.round.wrapping_add(1);
                    st.lock_held = true;
                    st.reset_timer = true;
                    self.timer_cv.notify_all();
                    return;
                }
                Err(e) => {
                    tracing::info!(
                        "Failed to send LOCK_OK to client {}: {e}",
                        client.label()
                    );
                    self.remove_client(st, fd);
                }
            }
        }
    }

    /// Send the current mode to every registered client, dropping those
    /// that fail.
    fn broadcast_mode(&self, st: &mut SchedulerState) {
        let msg = Message::new(st.mode.frame_type(), SCHEDULER_FRAME_ID);
        let registered: Vec<RawFd> = st
            .clients
            .iter()
            .filter(|(_, c)| c.id.is_some())
            .map(|(&fd, _)| fd)
            .collect();
        for fd in registered {
            let client = &st.clients[&fd];
            if let Err(e) = transport::try_send(&client.stream, &msg) {
                tracing::info!(
                    "Failed to send {} to client {}: {e}",
                    msg.kind,
                    client.label()
                );
                self.remove_client(st, fd);
            }
        }
    }

    /// Register a new client: pick a fresh id, store its labels, and
    /// reply with the current mode and the id as 16 hex characters.
    /// Returns false if the client must be dropped.
    fn register_client(&self, st: &mut SchedulerState, fd: RawFd, msg: &Message) -> bool {
        if st.clients[&fd].id.is_some() {
            tracing::warn!(
                "Client {} is already registered",
                st.clients[&fd].label()
            );
            return false;
        }

        let id = loop {
            let candidate: u64 = rand::random();
            if !st.clients.values().any(|c| c.id == Some(candidate)) {
                break candidate;
            }
        };

        let mode = st.mode;
        let client = st.clients.get_mut(&fd).expect("client exists");
        client.id = Some(id);
        client.pod_name = msg.pod_name.clone();
        client.pod_namespace = msg.pod_namespace.clone();

        let mut reply = Message::new(mode.frame_type(), SCHEDULER_FRAME_ID);
        reply.set_client_id(id);
        if let Err(e) = transport::try_send(&client.stream, &reply) {
            tracing::info!("Failed to send {} to client {id:016x}: {e}", reply.kind);
            return false;
        }
        tracing::info!(
            "Registered client {id:016x} with Pod name = {}, Pod namespace = {}",
            client.pod_name,
            client.pod_namespace,
        );
        true
    }

    /// Dispatch one decoded frame from a client.
    pub fn handle_message(&self, st: &mut SchedulerState, fd: RawFd, msg: &Message) {
        let label = st.clients[&fd].label();
        tracing::info!("Received {} from {label}", msg.kind);

        match msg.kind {
            MessageType::Register => {
                if !self.register_client(st, fd, msg) {
                    self.remove_client(st, fd);
                }
            }

            // Administrative, usually from gpusharectl. Control
            // connections never register, so no registration check.
            MessageType::SchedOn => {
                if st.mode == Mode::Permissive {
                    st.mode = Mode::AntiThrash;
                    tracing::info!("Anti-thrash scheduling turned ON, broadcasting it...");
                    self.broadcast_mode(st);
                }
            }
            MessageType::SchedOff => {
                if st.mode == Mode::AntiThrash {
                    st.mode = Mode::Permissive;
                    tracing::info!("Anti-thrash scheduling turned OFF, broadcasting it...");
                    self.broadcast_mode(st);
                    // In permissive mode every client believes it holds
                    // the lock, so the queue is instantaneously invalid.
                    st.queue.clear();
                    st.lock_held = false;
                }
            }
            MessageType::SetTq => match msg.quantum() {
                Ok(q) => {
                    st.quantum = Duration::from_secs(q);
                    st.reset_timer = true;
                    self.timer_cv.notify_all();
                    tracing::info!("New time quantum = {q} s");
                }
                Err(_) => {
                    tracing::info!("Ignoring SET_TQ with data {:?}", msg.data);
                }
            },

            MessageType::ReqLock => {
                if st.clients[&fd].id.is_none() {
                    self.remove_client(st, fd);
                    return;
                }
                if st.mode == Mode::AntiThrash {
                    Self::insert_request(st, fd);
                    if !st.lock_held {
                        self.try_grant(st);
                    }
                }
            }
            MessageType::LockReleased => {
                if st.clients[&fd].id.is_none() {
                    self.remove_client(st, fd);
                    return;
                }
                if st.mode == Mode::AntiThrash {
                    Self::drop_requests(st, fd);
                    if !st.lock_held {
                        self.try_grant(st);
                    }
                }
            }

            // Clients never receive these; a peer sending them is
            // confused enough to drop.
            MessageType::LockOk | MessageType::DropLock => {
                tracing::info!("Dropping client {label} after unexpected {}", msg.kind);
                self.remove_client(st, fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(Mode::AntiThrash, Duration::from_secs(30)).unwrap()
    }

    /// Build a connected client pair; the far end keeps the connection
    /// alive for the duration of the test.
    fn add_test_client(sched: &Scheduler, st: &mut SchedulerState) -> (RawFd, UnixStream) {
        let (near, far) = UnixStream::pair().unwrap();
        near.set_nonblocking(true).unwrap();
        let fd = near.as_raw_fd();
        sched.add_client(st, near);
        st.clients.get_mut(&fd).unwrap().id = Some(rand::random());
        (fd, far)
    }

    #[test]
    fn duplicate_requests_are_not_enqueued_twice() {
        let sched = scheduler();
        let mut st = sched.state.lock().unwrap();
        let st = &mut *st;
        let (fd, _far) = add_test_client(&sched, st);

        Scheduler::insert_request(st, fd);
        Scheduler::insert_request(st, fd);
        assert_eq!(st.queue.len(), 1);
    }

    #[test]
    fn removing_the_holder_clears_lock_held() {
        let sched = scheduler();
        let mut st = sched.state.lock().unwrap();
        let st = &mut *st;
        let (a, _fa) = add_test_client(&sched, st);
        let (b, _fb) = add_test_client(&sched, st);

        Scheduler::insert_request(st, a);
        sched.try_grant(st);
        Scheduler::insert_request(st, b);
        assert!(st.lock_held);
        assert_eq!(st.round, 1);

        sched.remove_client(st, a);
        assert!(!st.lock_held);
        assert_eq!(st.queue.front(), Some(&b));
    }

    #[test]
    fn grant_skips_dead_heads() {
        let sched = scheduler();
        let mut st = sched.state.lock().unwrap();
        let st = &mut *st;
        let (a, fa) = add_test_client(&sched, st);
        let (b, _fb) = add_test_client(&sched, st);

        Scheduler::insert_request(st, a);
        Scheduler::insert_request(st, b);
        drop(fa); // a's peer goes away
        sched.try_grant(st);

        // a could not be reached, so the grant lands on b.
        assert!(st.lock_held);
        assert!(!st.clients.contains_key(&a));
        assert_eq!(st.queue.front(), Some(&b));
    }
}
