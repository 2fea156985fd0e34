//! Engine events and the broadcast event bus.
//!
//! Event names are contracts: monitoring sinks, the dashboard push, and the
//! trading engine's own halt wiring all subscribe by name. Every published
//! event is wrapped in an [`EventEnvelope`] carrying the correlation id of
//! the cycle that produced it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::context::CycleContext;
use crate::types::{DiscrepancyType, HaltReason, PositionStatus, Venue};

/// Default bus capacity; slow subscribers lag rather than block publishers.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

// =============================================================================
// Event Payloads
// =============================================================================

/// Why an opportunity was filtered by the edge calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    /// Net edge below zero after costs.
    NegativeEdge,
    /// Net edge below the effective minimum threshold.
    BelowThreshold,
}

/// Which risk limit an approach/breach event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Open-pairs slot limit.
    OpenPairs,
    /// Daily loss limit.
    DailyLoss,
}

/// All events published by the trading control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// An actionable opportunity passed all filters.
    OpportunityIdentified {
        opportunity_id: Uuid,
        pair_key: String,
        buy_venue: Venue,
        sell_venue: Venue,
        gross_edge: Decimal,
        net_edge: Decimal,
        liquidity_depth: Decimal,
    },
    /// A dislocation was dropped by the edge calculator.
    OpportunityFiltered {
        pair_key: String,
        reason: FilterReason,
        gross_edge: Decimal,
        net_edge: Decimal,
    },
    /// A leg order filled.
    OrderFilled {
        order_id: String,
        venue: Venue,
        contract_id: String,
        fill_price: Decimal,
        fill_size: Decimal,
    },
    /// A risk limit crossed its 80% approach band.
    LimitApproached {
        limit: LimitKind,
        current: Decimal,
        threshold: Decimal,
    },
    /// A risk limit was breached.
    LimitBreached {
        limit: LimitKind,
        current: Decimal,
        threshold: Decimal,
    },
    /// Budget was reserved for an opportunity.
    BudgetReserved {
        reservation_id: Uuid,
        opportunity_id: Uuid,
        reserved_capital: Decimal,
    },
    /// A reservation was committed into a deployed position.
    BudgetCommitted {
        reservation_id: Uuid,
        capital_deployed: Decimal,
        open_position_count: u32,
    },
    /// A reservation was released back to the pool.
    BudgetReleased {
        reservation_id: Uuid,
        capital_returned: Decimal,
    },
    /// An operator override was approved.
    OverrideApplied {
        opportunity_id: Uuid,
        max_position_size: Decimal,
        rationale: String,
    },
    /// An operator override was denied.
    OverrideDenied {
        opportunity_id: Uuid,
        reason: String,
    },
    /// A halt reason was added to an empty or non-empty halt set.
    TradingHalted {
        reason: HaltReason,
        active_reasons: Vec<HaltReason>,
    },
    /// A halt reason was removed; others may remain.
    TradingResumed {
        reason: HaltReason,
        remaining_reasons: Vec<HaltReason>,
    },
    /// Clock drift in the warning band (100–499 ms).
    TimeDriftWarning { drift_ms: i64, server: String },
    /// Clock drift in the critical band (500–999 ms).
    TimeDriftCritical { drift_ms: i64, server: String },
    /// Clock drift at or beyond the halt threshold (≥ 1000 ms).
    TimeDriftHalt { drift_ms: i64, server: String },
    /// Startup reconciliation finished.
    ReconciliationComplete {
        positions_checked: u32,
        orders_resolved: u32,
        discrepancies: u32,
        duration_ms: u64,
    },
    /// One position was flagged for operator resolution.
    ReconciliationDiscrepancy {
        position_id: Uuid,
        discrepancy_type: DiscrepancyType,
        recommended_status: PositionStatus,
    },
    /// A critical system-health condition (reconciliation failure set,
    /// single-leg exposure, and similar).
    SystemHealthCritical { component: String, detail: String },
}

impl EngineEvent {
    /// Returns the contract name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpportunityIdentified { .. } => "opportunity_identified",
            Self::OpportunityFiltered { .. } => "opportunity_filtered",
            Self::OrderFilled { .. } => "order_filled",
            Self::LimitApproached { .. } => "limit_approached",
            Self::LimitBreached { .. } => "limit_breached",
            Self::BudgetReserved { .. } => "budget_reserved",
            Self::BudgetCommitted { .. } => "budget_committed",
            Self::BudgetReleased { .. } => "budget_released",
            Self::OverrideApplied { .. } => "override_applied",
            Self::OverrideDenied { .. } => "override_denied",
            Self::TradingHalted { .. } => "system_trading_halted",
            Self::TradingResumed { .. } => "system_trading_resumed",
            Self::TimeDriftWarning { .. } => "time_drift_warning",
            Self::TimeDriftCritical { .. } => "time_drift_critical",
            Self::TimeDriftHalt { .. } => "time_drift_halt",
            Self::ReconciliationComplete { .. } => "reconciliation_complete",
            Self::ReconciliationDiscrepancy { .. } => "reconciliation_discrepancy",
            Self::SystemHealthCritical { .. } => "system_health_critical",
        }
    }
}

/// An event plus the correlation context it was emitted under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Correlation id of the originating cycle.
    pub correlation_id: Uuid,
    /// When the event was published.
    pub emitted_at: DateTime<Utc>,
    /// The event.
    pub event: EngineEvent,
}

// =============================================================================
// Event Bus
// =============================================================================

/// Broadcast bus connecting the control plane to its subscribers.
///
/// Cloning is cheap; all clones publish into the same channel. Publishing
/// with no live subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Creates a bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event under the given cycle context.
    pub fn publish(&self, ctx: &CycleContext, event: EngineEvent) {
        debug!(
            correlation_id = %ctx.correlation_id,
            event = event.name(),
            "Publishing event"
        );
        let envelope = EventEnvelope {
            correlation_id: ctx.correlation_id,
            emitted_at: Utc::now(),
            event,
        };
        // A send error only means no subscriber is currently listening.
        let _ = self.sender.send(envelope);
    }

    /// Creates a new subscription starting at the current position.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
