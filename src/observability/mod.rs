//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (structured fields)
//!     → logging.rs (filter, format, stdout)
//!
//! Every connection task runs in a span carrying
//! `connection_id` and `peer_addr`.
//! ```

pub mod logging;

pub use logging::init_logging;
