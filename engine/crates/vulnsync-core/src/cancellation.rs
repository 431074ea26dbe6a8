//! Cooperative cancellation shared by fetch, persistence and sync loops.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation flag checked between units of work.
///
/// Clones share the same flag, so one handle can be kept by an operator
/// while the others are handed to the client, upserter and orchestrator.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Fail with `Error::Cancelled` naming `operation` once cancelled
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(operation.to_string()));
        }
        Ok(())
    }
}
