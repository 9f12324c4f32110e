//! Admission control for inbound connections.
//!
//! A counting semaphore bounds how many connections are handled at once.
//! Each admitted connection holds exactly one [`AdmissionSlot`]; dropping it
//! (normal return, error path or panic unwind) frees the slot.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-capacity pool of admission slots.
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// The limiter's semaphore was closed; no further slots can be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("admission limiter closed")]
pub struct LimiterClosed;

impl AdmissionLimiter {
    /// Create a limiter admitting at most `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait until a slot is free, then occupy it.
    ///
    /// Waiters are served in FIFO order by the underlying semaphore. There is
    /// no timeout.
    pub async fn acquire(&self) -> Result<AdmissionSlot, LimiterClosed> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;
        Ok(AdmissionSlot { _permit: permit })
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One occupied admission slot, released when dropped.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    /// Free the slot now instead of at end of scope.
    pub fn release(self) {}
}
