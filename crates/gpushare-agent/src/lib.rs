//! The gpushare agent.
//!
//! This library is preloaded into GPU applications as
//! `libgpushare_agent.so`. It interposes the dynamic symbol lookup and
//! the CUDA driver API entry points the application bootstraps through,
//! redirects allocations to their unified-memory counterparts, and
//! negotiates the GPU lock with the gpushare scheduler so that
//! co-resident applications take turns instead of thrashing each other.
//!
//! The application never sees any of this: intercepted calls block
//! while the lock is contended and otherwise return the underlying
//! driver's codes unchanged.

pub mod agent;
pub mod client;
pub mod config;
pub mod cuda;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod telemetry;
pub mod window;

pub use error::AgentError;
