//! Entry point for the gpushare scheduler daemon.

use std::time::Duration;

use gpushared::config::get_config;
use gpushared::scheduler::Mode;
use gpushared::startup::{check_privileges, get_unix_listener, init_tracing, start_scheduler};

fn main() -> anyhow::Result<()> {
    init_tracing(std::io::stdout)?;

    let config = get_config();
    tracing::info!("Loaded {:?}", config);

    check_privileges(config.allow_unprivileged)?;

    let listener = get_unix_listener(&config.socket_path)?;
    tracing::info!("gpushared listening on {}", config.socket_path.display());

    let mode = if config.anti_thrash {
        Mode::AntiThrash
    } else {
        Mode::Permissive
    };
    let tasks = start_scheduler(listener, mode, Duration::from_secs(config.time_quantum))?;

    // The dispatcher runs until something unrecoverable happens.
    match tasks.dispatcher.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("dispatcher thread panicked"),
    }
}
