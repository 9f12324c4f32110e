//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → admission.rs (wait for a free slot)
//!     → listener.rs (accept once a slot is held)
//!     → connection.rs (ID, in-flight tracking)
//!     → Hand off to the per-connection task
//!
//! Connection States:
//!     Waiting for slot → Accepted → Handling → Closed (slot released)
//! ```
//!
//! # Design Decisions
//! - Bounded admission prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Slot release is tied to drop, so it survives errors and panics

pub mod admission;
pub mod connection;
pub mod listener;

pub use admission::{AdmissionLimiter, AdmissionSlot};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{Listener, ListenerError};
