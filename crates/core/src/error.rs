//! Error taxonomy shared across the arbitrage engine.
//!
//! Kinds map to how the engine reacts: platform failures make a component
//! skip-and-continue, risk limits are decision data returned to the caller,
//! config validation is fatal at startup, and persistence failures are
//! logged without rolling back in-memory state.

use thiserror::Error;
use uuid::Uuid;

use crate::types::Venue;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced across component boundaries.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A venue API call failed after the client layer exhausted its retries.
    #[error("{venue} API error: {message}")]
    PlatformApi {
        /// Venue that failed.
        venue: Venue,
        /// Terminal error description from the client layer.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Human-readable operation name.
        operation: String,
    },

    /// Configuration rejected at construction. Fatal at startup.
    #[error("configuration invalid: {0}")]
    ConfigValidation(String),

    /// A system-health condition (reconciliation discrepancy, clock drift,
    /// unreachable database during the startup probe).
    #[error("system health: {0}")]
    SystemHealth(String),

    /// An execution-path failure (rejected submit, single-leg exposure).
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    /// A persistence collaborator failed. Logged and swallowed at runtime.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A risk-limit decision surfaced as an error (budget reservation).
    #[error("risk limit: {0}")]
    RiskLimit(String),

    /// Programmer error: a reservation id that was never issued or already
    /// reached a terminal state.
    #[error("unknown reservation id: {0}")]
    UnknownReservation(Uuid),

    /// A value could not be represented as an exact decimal.
    #[error("invalid decimal: {0}")]
    InvalidDecimal(String),
}

impl CoreError {
    /// Shorthand constructor for venue API failures.
    #[must_use]
    pub fn platform(venue: Venue, message: impl Into<String>) -> Self {
        Self::PlatformApi {
            venue,
            message: message.into(),
        }
    }

    /// Returns true if this error should make the caller skip the current
    /// item and continue with the batch.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::PlatformApi { .. } | Self::Timeout { .. })
    }
}
