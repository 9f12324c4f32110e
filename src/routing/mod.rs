//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! RequestHead (method, target, host)
//!     → router.rs (mode + method + target checks)
//!     → Return: Route (ServeFile / Upload / Forward) or a ServiceError
//! ```
//!
//! # Design Decisions
//! - Deterministic: same head always yields the same route
//! - Rejections happen here, before any file or socket is touched

pub mod router;

pub use router::{Route, Router};
