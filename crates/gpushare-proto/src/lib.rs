//! Wire protocol and transport shared by the gpushare components.
//!
//! The scheduler, the injected agent, and the control tool all speak the
//! same fixed-size framed protocol over a local Unix stream socket. This
//! crate owns the frame layout, the message types, and the socket
//! plumbing; policy lives entirely in the peers.

pub mod message;
pub mod transport;

pub use message::{Message, MessageType, WireError, FRAME_LEN};

/// Environment variable that switches every gpushare component to
/// debug-level logging when `RUST_LOG` is not set.
pub const ENV_DEBUG: &str = "GPUSHARE_DEBUG";
