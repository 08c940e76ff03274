//! The time quantum timer thread.
//!
//! The timer re-arms whenever the lock changes hands or the quantum
//! changes (`reset_timer`), and otherwise sends DROP_LOCK to the
//! current holder once its quantum elapses. The round counter guards
//! against the race where the deadline fires after the lock has already
//! moved on: a deadline armed in round r is acted on only while the
//! round is still r.

use std::sync::Arc;
use std::time::Instant;

use gpushare_proto::transport;
use gpushare_proto::{Message, MessageType};

use crate::scheduler::Scheduler;

pub fn run(sched: Arc<Scheduler>) {
    let msg = Message::new(MessageType::DropLock, 0);
    let mut drop_lock_sent = false;

    let mut st = sched.state.lock().expect("scheduler mutex poisoned");
    loop {
        st.reset_timer = false;
        let round_at_start = st.round;
        let deadline = Instant::now() + st.quantum;

        // Wait out one deadline, re-entering the wait after spurious
        // wakeups until either the quantum elapses or a reset arrives.
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (guard, timeout) = sched
                .timer_cv
                .wait_timeout(st, remaining)
                .expect("scheduler mutex poisoned");
            st = guard;

            if timeout.timed_out() {
                tracing::debug!("Time quantum elapsed");
                if !st.lock_held || drop_lock_sent {
                    break;
                }
                if round_at_start != st.round {
                    // The lock changed hands while we slept; this
                    // deadline belongs to a finished round.
                    drop_lock_sent = false;
                    break;
                }
                let Some(&holder) = st.queue.front() else {
                    break;
                };
                let client = &st.clients[&holder];
                match transport::try_send(&client.stream, &msg) {
                    Ok(()) => {
                        tracing::info!("Sent DROP_LOCK to client {}", client.label());
                        drop_lock_sent = true;
                    }
                    Err(e) => {
                        tracing::info!(
                            "Failed to send DROP_LOCK to client {}: {e}",
                            client.label()
                        );
                        sched.remove_client(&mut st, holder);
                        sched.try_grant(&mut st);
                        drop_lock_sent = false;
                    }
                }
                break;
            } else if st.reset_timer {
                drop_lock_sent = false;
                break;
            }
            // Spurious wakeup: wait the remainder of the deadline.
        }
    }
}
