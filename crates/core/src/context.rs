//! Per-cycle correlation context.
//!
//! A [`CycleContext`] is created at the start of each trading cycle (and for
//! out-of-band tasks like the drift probe) and threaded explicitly through
//! every operation's argument list. Its correlation id appears in every log
//! line and event envelope arising from that cycle.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Correlation context for one trading cycle or out-of-band task.
#[derive(Debug, Clone)]
pub struct CycleContext {
    /// Correlation id propagated through logs and events.
    pub correlation_id: Uuid,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// Optional absolute deadline for the whole operation.
    pub deadline: Option<DateTime<Utc>>,
}

impl CycleContext {
    /// Creates a fresh context with a new correlation id and no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            started_at: Utc::now(),
            deadline: None,
        }
    }

    /// Attaches an absolute deadline relative to the start time.
    #[must_use]
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(self.started_at + budget);
        self
    }

    /// Time remaining until the deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d - Utc::now())
    }

    /// Returns true if the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Utc::now() >= d)
    }

    /// Elapsed wall-clock time since the cycle started, in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

impl Default for CycleContext {
    fn default() -> Self {
        Self::new()
    }
}
