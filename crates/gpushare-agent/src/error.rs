//! Error handling.
//!
//! Steady-state agent errors never reach the application as Rust
//! errors: transport failures terminate the process (the scheduler is
//! gone, and so is the arbitration the application depends on), and
//! driver failures are propagated to the application as raw `CUresult`
//! codes with a log line.

use gpushare_proto::{MessageType, WireError};

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("CUDA driver library unavailable: {0}")]
    DriverUnavailable(String),
    #[error("missing CUDA driver symbol {0}")]
    MissingSymbol(String),
    #[error("CUDA driver error: {0}")]
    Driver(String),
    #[error("NVML error: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),
    #[error("scheduler transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("scheduler sent {0} instead of the initial mode")]
    UnexpectedInitialMessage(MessageType),
}
