//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Client connection:
//!     → timeouts.rs (header deadline, idle deadline on both directions)
//!
//! Origin connection (proxy mode):
//!     → timeouts.rs (connect deadline, idle deadline)
//!     → On failure: 502 before any relay, plain close after
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every socket has a deadline
//! - No automatic retries: a forwarded request is attempted once

pub mod timeouts;

pub use timeouts::{with_deadline, IdleTimeout};
