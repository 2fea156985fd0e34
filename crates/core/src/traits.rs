//! Capability traits at the engine's seams.
//!
//! Components take their collaborators as constructor arguments typed against
//! these traits: venue clients, the risk-state store, the position store, the
//! clock, and the NTP transport. Tests substitute scripted implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::types::{
    FeeSchedule, HaltReason, OrderRecord, OrderRequest, OrderState, OrderStatus, OrderSubmission,
    OrderBook, Position, Venue, VenueHealth,
};

// =============================================================================
// Venue Client Capability
// =============================================================================

/// The surface a venue integration must provide to the control plane.
///
/// Implementations live outside the core (REST/WebSocket clients, or the
/// paper venue); the client layer owns retries, so errors reaching the core
/// are terminal for the current call.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Which venue this client talks to.
    fn venue(&self) -> Venue;

    /// Reports connection health and trading mode.
    async fn get_health(&self) -> Result<VenueHealth>;

    /// Returns the venue's published fee schedule.
    async fn get_fee_schedule(&self) -> Result<FeeSchedule>;

    /// Fetches a normalized order-book snapshot for a contract.
    async fn get_order_book(&self, contract_id: &str) -> Result<OrderBook>;

    /// Submits a limit order.
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderSubmission>;

    /// Queries the current state of an order.
    async fn get_order(&self, order_id: &str) -> Result<OrderState>;
}

/// Both venue clients, addressable by venue tag.
#[derive(Clone)]
pub struct VenueClients {
    polymarket: Arc<dyn VenueClient>,
    kalshi: Arc<dyn VenueClient>,
}

impl VenueClients {
    /// Wires the two clients.
    ///
    /// # Errors
    /// Returns [`CoreError::ConfigValidation`] if a client reports the wrong
    /// venue tag.
    pub fn new(polymarket: Arc<dyn VenueClient>, kalshi: Arc<dyn VenueClient>) -> Result<Self> {
        if polymarket.venue() != Venue::Polymarket {
            return Err(CoreError::ConfigValidation(
                "first client must report Venue::Polymarket".to_string(),
            ));
        }
        if kalshi.venue() != Venue::Kalshi {
            return Err(CoreError::ConfigValidation(
                "second client must report Venue::Kalshi".to_string(),
            ));
        }
        Ok(Self { polymarket, kalshi })
    }

    /// Returns the client for a venue.
    #[must_use]
    pub fn get(&self, venue: Venue) -> &Arc<dyn VenueClient> {
        match venue {
            Venue::Polymarket => &self.polymarket,
            Venue::Kalshi => &self.kalshi,
        }
    }
}

impl std::fmt::Debug for VenueClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueClients").finish()
    }
}

// =============================================================================
// Risk-State Persistence
// =============================================================================

/// Crash-recovery snapshot of the risk singleton.
///
/// The in-memory state is authoritative at runtime; this row only matters at
/// startup. Halt reasons are stored as a JSON array; a legacy single-string
/// encoding is still accepted on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRiskState {
    /// Total bankroll in USD.
    pub bankroll: Decimal,
    /// Realized P&L since the last UTC-midnight reset.
    pub daily_pnl: Decimal,
    /// Committed open positions.
    pub open_position_count: u32,
    /// Capital committed into open positions.
    pub total_capital_deployed: Decimal,
    /// Capital held by live reservations at snapshot time.
    pub reserved_capital: Decimal,
    /// Slots held by live reservations at snapshot time.
    pub reserved_slots: u32,
    /// Last UTC-midnight reset applied, if any.
    pub last_reset_timestamp: Option<DateTime<Utc>>,
    /// Active halt-reason tags.
    #[serde(deserialize_with = "halt_reasons_compat")]
    pub active_halt_reasons: Vec<HaltReason>,
    /// When the snapshot was written.
    pub updated_at: DateTime<Utc>,
}

/// Accepts either the JSON-array encoding or the legacy single string.
fn halt_reasons_compat<'de, D>(deserializer: D) -> std::result::Result<Vec<HaltReason>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Compat {
        Many(Vec<HaltReason>),
        One(HaltReason),
    }

    Ok(match Compat::deserialize(deserializer)? {
        Compat::Many(reasons) => reasons,
        Compat::One(reason) => vec![reason],
    })
}

/// One operator-override decision, appended to the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideAuditRecord {
    /// Opportunity the override targets.
    pub opportunity_id: Uuid,
    /// Whether the override was approved.
    pub approved: bool,
    /// Operator-supplied rationale.
    pub rationale: String,
    /// Halt set active when the decision was made.
    pub halt_reasons_at_decision: Vec<HaltReason>,
    /// Position-size ceiling granted, when approved.
    pub max_position_size: Option<Decimal>,
    /// Decision time.
    pub decided_at: DateTime<Utc>,
}

/// Persistence collaborator owned by the risk manager.
#[async_trait]
pub trait RiskStateStore: Send + Sync {
    /// Loads the persisted snapshot, if one exists.
    async fn load(&self) -> Result<Option<PersistedRiskState>>;

    /// Upserts the singleton snapshot.
    async fn save(&self, state: &PersistedRiskState) -> Result<()>;

    /// Appends one override decision to the audit log.
    async fn append_override(&self, record: &OverrideAuditRecord) -> Result<()>;
}

// =============================================================================
// Position Persistence
// =============================================================================

/// Position and order views used by the execution queue and reconciliation.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Inserts a new position.
    async fn insert_position(&self, position: &Position) -> Result<()>;

    /// Updates an existing position in place.
    async fn update_position(&self, position: &Position) -> Result<()>;

    /// Fetches a position by id.
    async fn get_position(&self, position_id: Uuid) -> Result<Option<Position>>;

    /// Lists every position that is not closed.
    async fn list_active_positions(&self) -> Result<Vec<Position>>;

    /// Inserts an order row.
    async fn insert_order(&self, order: &OrderRecord) -> Result<()>;

    /// Updates an order's local status and fills.
    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        fill_price: Option<Decimal>,
        fill_size: Option<Decimal>,
    ) -> Result<()>;

    /// Fetches an order row by id.
    async fn get_order(&self, order_id: &str) -> Result<Option<OrderRecord>>;

    /// Lists orders whose local status is still pending.
    async fn list_pending_orders(&self) -> Result<Vec<OrderRecord>>;
}

// =============================================================================
// Clock and NTP
// =============================================================================

/// Wall-clock abstraction so tests can inject virtual time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One clock-offset measurement against an NTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpSample {
    /// Estimated local-clock offset in milliseconds (positive = local fast).
    pub offset_ms: i64,
    /// Server that answered.
    pub server: String,
    /// When the measurement was taken.
    pub measured_at: DateTime<Utc>,
}

/// Network abstraction for the drift probe; tests inject scripted samples.
#[async_trait]
pub trait NtpTransport: Send + Sync {
    /// Queries one server for a clock-offset sample.
    async fn query(&self, server: &str) -> Result<NtpSample>;
}
