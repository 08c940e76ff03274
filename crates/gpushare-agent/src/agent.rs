//! Process-wide agent state and bootstrap.
//!
//! The agent must present a single identity to the scheduler no matter
//! how many application threads submit work, so everything hangs off
//! one lazily-initialized singleton. Bootstrap happens in two idempotent
//! stages, both safe to trigger from any intercepted entry point: the
//! runtime stage (logging, configuration, the real driver) and the
//! client stage (connection, registration, helper threads).

use std::fmt::Display;
use std::ptr;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use gpushare_proto::transport;
use gpushare_proto::ENV_DEBUG;

use crate::client::{block_all_signals, DeviceOps, LockClient, DEFAULT_IDLE_INTERVAL};
use crate::config::{pod_labels, AgentConfig};
use crate::cuda::{CUcontext, CUDA_SUCCESS};
use crate::driver::{self, cuda_check, Driver};
use crate::error::AgentError;
use crate::ledger::MemoryLedger;
use crate::telemetry::{NvmlProbe, UtilizationProbe};
use crate::window::KernelWindow;

pub struct Agent {
    pub client: Arc<LockClient>,
    pub ledger: Mutex<MemoryLedger>,
    pub window: Arc<Mutex<KernelWindow>>,
    pub config: AgentConfig,
    /// Allocatable bytes, learned through the interposed memory-info on
    /// first allocation.
    pub capacity: OnceCell<u64>,
}

static AGENT: OnceCell<Agent> = OnceCell::new();
static RUNTIME_INIT: Once = Once::new();
static CLIENT_INIT: Once = Once::new();

/// The fully bootstrapped agent, or None before [`init_client`] has
/// completed.
pub fn get() -> Option<&'static Agent> {
    AGENT.get()
}

/// Terminate the process. A shim must not unwind into foreign stack
/// frames, and without the scheduler the application would silently run
/// unarbitrated, so fatal conditions end the process the way the
/// scheduler's own death would.
pub(crate) fn die(msg: impl Display) -> ! {
    eprintln!("[gpushare-agent] FATAL: {msg}");
    std::process::exit(1);
}

/// Stage one: logging, configuration, and the real driver. Idempotent.
pub fn init_runtime() {
    RUNTIME_INIT.call_once(|| {
        init_tracing();
        if let Err(e) = driver::load() {
            die(e);
        }
    });
}

/// Stage two: connect, register, and spawn the helper threads.
/// Idempotent; callers run [`init_runtime`] first.
pub fn init_client() {
    CLIENT_INIT.call_once(|| match bootstrap_client() {
        Ok(agent) => {
            if AGENT.set(agent).is_err() {
                die("agent singleton initialized twice");
            }
        }
        Err(e) => die(e),
    });
}

fn init_tracing() {
    let default_level = if std::env::var_os(ENV_DEBUG).is_some() {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    // The host application may have installed its own subscriber or
    // logger; losing ours is fine in that case.
    let _ = tracing::subscriber::set_global_default(subscriber);
    let _ = tracing_log::LogTracer::init();
}

fn bootstrap_client() -> Result<Agent, AgentError> {
    let drv = driver::load()?;
    let config = AgentConfig::from_env();

    // Proof is in the caller: something in this process is using the
    // GPU, so bring the real driver up before talking to the scheduler.
    let result = unsafe { (drv.cu_init)(0) };
    if result != CUDA_SUCCESS {
        cuda_check(drv, result, "cuInit");
        return Err(AgentError::Driver(
            "cuInit failed while bootstrapping the agent".into(),
        ));
    }

    let (pod_name, pod_namespace) = pod_labels();
    tracing::debug!("Pod name = {pod_name}, Pod namespace = {pod_namespace}");

    let stream = transport::connect(&transport::default_socket_path())?;
    let window = Arc::new(Mutex::new(KernelWindow::new()));
    let device = RealDevice {
        driver: drv,
        window: Arc::clone(&window),
        context: Mutex::new(None),
    };

    let client = LockClient::bootstrap(
        stream,
        Box::new(device),
        Arc::clone(&window),
        pod_name,
        pod_namespace,
        DEFAULT_IDLE_INTERVAL,
    )?;

    let probe: Option<Box<dyn UtilizationProbe>> = match NvmlProbe::init() {
        Ok(probe) => {
            tracing::debug!("Found NVML");
            Some(Box::new(probe))
        }
        Err(e) => {
            tracing::debug!("Could not find NVML ({e}); idle detection will time drains");
            None
        }
    };

    let receiver = Arc::clone(&client);
    std::thread::Builder::new()
        .name("gpushare-recv".into())
        .spawn(move || {
            block_all_signals();
            die(receiver.receiver_loop());
        })?;

    let watcher = Arc::clone(&client);
    std::thread::Builder::new()
        .name("gpushare-idle".into())
        .spawn(move || {
            block_all_signals();
            die(watcher.idle_loop(probe));
        })?;

    Ok(Agent {
        client,
        ledger: Mutex::new(MemoryLedger::new()),
        window,
        config,
        capacity: OnceCell::new(),
    })
}

/// `CUcontext` wrapper so a captured context can live in shared state.
struct SendContext(CUcontext);

// A CUDA context handle is valid from any thread once captured.
unsafe impl Send for SendContext {}

/// [`DeviceOps`] over the real driver.
struct RealDevice {
    driver: &'static Driver,
    window: Arc<Mutex<KernelWindow>>,
    context: Mutex<Option<SendContext>>,
}

impl DeviceOps for RealDevice {
    fn capture_context(&self) -> Result<(), AgentError> {
        let mut ctx: CUcontext = ptr::null_mut();
        let result = unsafe { (self.driver.cu_ctx_get_current)(&mut ctx) };
        if result != CUDA_SUCCESS || ctx.is_null() {
            cuda_check(self.driver, result, "cuCtxGetCurrent");
            return Err(AgentError::Driver(
                "can't get the application's CUDA context".into(),
            ));
        }
        *self.context.lock().expect("context mutex poisoned") = Some(SendContext(ctx));
        Ok(())
    }

    fn synchronize(&self) -> Result<Duration, AgentError> {
        // A forced drain makes any accumulated launch backlog moot.
        self.window
            .lock()
            .expect("window mutex poisoned")
            .reset_window();

        // Drains run on agent threads, which never created a context of
        // their own; bind the application's context first.
        let captured = self
            .context
            .lock()
            .expect("context mutex poisoned")
            .as_ref()
            .map(|c| c.0);
        if let Some(ctx) = captured {
            let result = unsafe { (self.driver.cu_ctx_set_current)(ctx) };
            cuda_check(self.driver, result, "cuCtxSetCurrent");
        }

        let started = Instant::now();
        let result = unsafe { (self.driver.cu_ctx_synchronize)() };
        cuda_check(self.driver, result, "cuCtxSynchronize");
        if result != CUDA_SUCCESS {
            return Err(AgentError::Driver("cuCtxSynchronize failed".into()));
        }
        Ok(started.elapsed())
    }
}
