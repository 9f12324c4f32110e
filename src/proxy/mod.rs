//! GET forwarding proxy subsystem.
//!
//! # Data Flow
//! ```text
//! GET (origin-form + Host, or absolute-form http://)
//!     → target.rs (host:port, default port 80)
//!     → forwarder.rs (connect, send minimal request)
//!     → relay origin bytes to the client until the origin closes
//! ```

pub mod forwarder;
pub mod target;

pub use forwarder::{relay, ForwardError, Forwarder, RelayError};
pub use target::ProxyTarget;
