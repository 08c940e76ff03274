//! The dispatcher: accept loop and event demultiplexer.
//!
//! A single thread waits on epoll over the listening socket and every
//! client connection, takes the scheduler mutex for each batch of ready
//! events, and dispatches frames through
//! [`Scheduler::handle_message`](crate::scheduler::Scheduler).

use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::epoll::{EpollEvent, EpollFlags, EpollTimeout};

use gpushare_proto::transport;
use gpushare_proto::Message;

use crate::scheduler::{Mode, Scheduler};

const MAX_EVENTS: usize = 32;

/// Run the dispatcher forever. Only setup-level failures (epoll or
/// accept breaking in a non-transient way) return.
pub fn run(sched: Arc<Scheduler>, listener: UnixListener) -> anyhow::Result<()> {
    let listen_fd = listener.as_raw_fd();
    sched.epoll.add(
        &listener,
        EpollEvent::new(EpollFlags::EPOLLIN, listen_fd as u64),
    )?;

    let mut events = [EpollEvent::empty(); MAX_EVENTS];
    loop {
        let num_events = match sched.epoll.wait(&mut events, EpollTimeout::NONE) {
            Err(Errno::EINTR) => continue,
            other => other?,
        };

        let mut st = sched.state.lock().expect("scheduler mutex poisoned");
        for event in &events[..num_events] {
            let fd = event.data() as RawFd;
            if fd == listen_fd {
                accept_one(&sched, &mut st, &listener)?;
                continue;
            }

            // A client may have been removed while handling an earlier
            // event of this batch.
            if !st.clients.contains_key(&fd) {
                continue;
            }

            if event.events().contains(EpollFlags::EPOLLIN) {
                match transport::try_recv(&st.clients[&fd].stream) {
                    Ok(buf) => match Message::decode(&buf) {
                        Ok(msg) => sched.handle_message(&mut st, fd, &msg),
                        Err(e) => {
                            tracing::info!(
                                "Dropping client {} after undecodable frame: {e}",
                                st.clients[&fd].label()
                            );
                            sched.remove_client(&mut st, fd);
                        }
                    },
                    Err(e) => {
                        tracing::debug!(
                            "Failed to receive from client {}: {e}",
                            st.clients[&fd].label()
                        );
                        sched.remove_client(&mut st, fd);
                    }
                }
            } else if event
                .events()
                .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP)
            {
                sched.remove_client(&mut st, fd);
            }

            // If the removal above freed the lock, hand it to the next
            // requester right away.
            if st.mode == Mode::AntiThrash && !st.lock_held {
                sched.try_grant(&mut st);
            }
        }
    }
}

fn accept_one(
    sched: &Scheduler,
    st: &mut crate::scheduler::SchedulerState,
    listener: &UnixListener,
) -> anyhow::Result<()> {
    match listener.accept() {
        Ok((stream, _addr)) => {
            if let Err(e) = stream.set_nonblocking(true) {
                tracing::warn!("Could not make accepted connection non-blocking: {e}");
                return Ok(());
            }
            sched.add_client(st, stream);
            Ok(())
        }
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionAborted
            ) =>
        {
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("accept() failed non-transiently: {e}")),
    }
}
