//! Startup logic.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::subscriber::set_global_default;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use gpushare_proto::transport::{self, SOCKET_DIR_MODE, SOCKET_MODE};
use gpushare_proto::ENV_DEBUG;

use crate::scheduler::{Mode, Scheduler};
use crate::{event_loop, timer};

/// Initialize tracing with the given place to write logs to.
///
/// `RUST_LOG` wins when set; otherwise the presence of `GPUSHARE_DEBUG`
/// selects debug-level logging.
pub fn init_tracing<S>(sink: S) -> anyhow::Result<()>
where
    S: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    LogTracer::init()?;

    let default_level = if std::env::var_os(ENV_DEBUG).is_some() {
        "debug"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let formatter = tracing_subscriber::fmt::layer().with_writer(sink);
    let subscriber = Registry::default().with(formatter).with(env_filter);
    set_global_default(subscriber)?;

    Ok(())
}

/// Ensure the daemon is running as root, unless explicitly waived.
pub fn check_privileges(allow_unprivileged: bool) -> anyhow::Result<()> {
    if !nix::unistd::geteuid().is_root() && !allow_unprivileged {
        tracing::error!(
            "gpushared must run as root to create its socket under /var/run. \
            If you're sure you want to run as non-root, use --allow-unprivileged."
        );
        anyhow::bail!("gpushared must be run as root");
    }
    Ok(())
}

/// Create the socket directory and bind the listening socket with the
/// permissions the protocol requires: directory `0o711` (anyone may
/// traverse), socket `0o722` (anyone may connect). chmod is applied
/// unconditionally so the modes hold regardless of umask.
pub fn get_unix_listener(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(dir) = socket_path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
            fs::set_permissions(dir, fs::Permissions::from_mode(SOCKET_DIR_MODE))?;
        }
    }

    if fs::metadata(socket_path).is_ok() {
        tracing::error!(
            "Socket file {} already exists. Please remove it and restart gpushared.",
            socket_path.display(),
        );
        anyhow::bail!("Socket file already exists");
    }

    let listener = transport::bind_listener(socket_path)?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(listener)
}

/// Handles to the two scheduler threads.
pub struct SchedulerTasks {
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: JoinHandle<anyhow::Result<()>>,
    pub timer: JoinHandle<()>,
}

/// Spawn the timer and dispatcher threads over a bound listener.
pub fn start_scheduler(
    listener: UnixListener,
    mode: Mode,
    quantum: Duration,
) -> anyhow::Result<SchedulerTasks> {
    let scheduler = Arc::new(Scheduler::new(mode, quantum)?);

    let timer_sched = Arc::clone(&scheduler);
    let timer = std::thread::Builder::new()
        .name("gpushare-timer".into())
        .spawn(move || timer::run(timer_sched))?;

    let loop_sched = Arc::clone(&scheduler);
    let dispatcher = std::thread::Builder::new()
        .name("gpushare-dispatch".into())
        .spawn(move || event_loop::run(loop_sched, listener))?;

    Ok(SchedulerTasks {
        scheduler,
        dispatcher,
        timer,
    })
}
