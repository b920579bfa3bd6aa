//! Download id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out strictly increasing ids, never reusing one.
#[derive(Debug)]
pub(crate) struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Starts after `highest_used`, or at 1 for an empty history.
    pub(crate) fn after(highest_used: Option<u64>) -> Self {
        Self {
            next: AtomicU64::new(highest_used.map_or(1, |id| id.saturating_add(1))),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
