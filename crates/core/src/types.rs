//! Shared types for the cross-venue arbitrage control plane.
//!
//! These are the data structures exchanged between the detector, edge
//! calculator, risk manager, execution queue, and reconciliation: contract
//! pairs, order-book snapshots, dislocations, enriched opportunities, budget
//! reservations, and the position/order surface.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// =============================================================================
// Venues and Outcomes
// =============================================================================

/// Identifies which venue a book, order, or position leg belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    /// Polymarket CLOB.
    Polymarket,
    /// Kalshi exchange.
    Kalshi,
}

impl Venue {
    /// Returns the display name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polymarket => "Polymarket",
            Self::Kalshi => "Kalshi",
        }
    }

    /// Returns the other venue of the pair.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Polymarket => Self::Kalshi,
            Self::Kalshi => Self::Polymarket,
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Binary outcome side of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The named outcome resolves true.
    Yes,
    /// The complementary outcome.
    No,
}

impl Outcome {
    /// Returns the opposite outcome.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Yes => Self::No,
            Self::No => Self::Yes,
        }
    }

    /// Returns the display string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Contract Pairs
// =============================================================================

/// A verified pairing of the same binary event across both venues.
///
/// Read-only once loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractPair {
    /// Polymarket condition/token id.
    pub polymarket_id: String,
    /// Kalshi market ticker.
    pub kalshi_id: String,
    /// Human description of the underlying event.
    pub event_description: String,
    /// When the pairing was last manually verified.
    pub verification_timestamp: DateTime<Utc>,
    /// Venue whose leg is submitted first during execution.
    pub primary_leg: Venue,
}

impl ContractPair {
    /// Returns the contract id on the given venue.
    #[must_use]
    pub fn contract_id(&self, venue: Venue) -> &str {
        match venue {
            Venue::Polymarket => &self.polymarket_id,
            Venue::Kalshi => &self.kalshi_id,
        }
    }

    /// Stable key identifying this pair in positions and logs.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.polymarket_id, self.kalshi_id)
    }

    /// Validates that pair ids are unique on both sides of a pair list.
    ///
    /// # Errors
    /// Returns [`CoreError::ConfigValidation`] naming the first duplicate.
    pub fn validate_unique(pairs: &[ContractPair]) -> Result<(), CoreError> {
        let mut poly = std::collections::HashSet::new();
        let mut kalshi = std::collections::HashSet::new();
        for pair in pairs {
            if !poly.insert(pair.polymarket_id.as_str()) {
                return Err(CoreError::ConfigValidation(format!(
                    "duplicate Polymarket id in pair list: {}",
                    pair.polymarket_id
                )));
            }
            if !kalshi.insert(pair.kalshi_id.as_str()) {
                return Err(CoreError::ConfigValidation(format!(
                    "duplicate Kalshi id in pair list: {}",
                    pair.kalshi_id
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Order Books
// =============================================================================

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price as an implied probability in `[0, 1]`.
    pub price: Decimal,
    /// Quantity available at this price.
    pub quantity: Decimal,
}

/// Normalized order-book snapshot for one contract on one venue.
///
/// Bids are ordered by price descending, asks ascending. The snapshot is
/// owned by the detector for the duration of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    /// Venue the snapshot came from.
    pub venue: Venue,
    /// Contract id on that venue.
    pub contract_id: String,
    /// Bid levels, best (highest) first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<PriceLevel>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    /// Returns the best (highest) bid.
    #[must_use]
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    /// Returns the best (lowest) ask.
    #[must_use]
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Returns true if both sides have at least one level.
    #[must_use]
    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Restores the canonical ordering after ingesting unsorted levels.
    pub fn normalize(&mut self) {
        self.bids.sort_by(|a, b| b.price.cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.cmp(&b.price));
    }
}

// =============================================================================
// Dislocations and Opportunities
// =============================================================================

/// A detected arbitrage dislocation in one direction for one pair.
///
/// `buy_price` is the best ask of the outcome bought on the buy venue;
/// `sell_price` is the best ask of the complementary outcome on the sell
/// venue (derived as `1 − best_bid` on a single-book venue). The invariant
/// `gross_edge = |buy_price − (1 − sell_price)|` with
/// `buy_price < 1 − sell_price` is enforced at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDislocation {
    /// The pair this dislocation is for.
    pub pair: ContractPair,
    /// Venue on which the primary outcome is bought.
    pub buy_venue: Venue,
    /// Venue on which the complementary outcome is bought.
    pub sell_venue: Venue,
    /// Best-ask price on the buy venue.
    pub buy_price: Decimal,
    /// Complementary best-ask price on the sell venue.
    pub sell_price: Decimal,
    /// Edge before fees and gas.
    pub gross_edge: Decimal,
    /// Buy-venue book snapshot backing this dislocation.
    pub buy_book: OrderBook,
    /// Sell-venue book snapshot backing this dislocation.
    pub sell_book: OrderBook,
    /// When the dislocation was detected.
    pub detected_at: DateTime<Utc>,
}

impl RawDislocation {
    /// Builds a dislocation, enforcing the true-arbitrage invariant.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidDecimal`] if the prices do not describe a
    /// true arbitrage direction (`buy_price ≥ 1 − sell_price`).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: ContractPair,
        buy_venue: Venue,
        sell_venue: Venue,
        buy_price: Decimal,
        sell_price: Decimal,
        buy_book: OrderBook,
        sell_book: OrderBook,
        detected_at: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        if buy_price >= Decimal::ONE - sell_price {
            return Err(CoreError::InvalidDecimal(format!(
                "not a true arbitrage: buy {buy_price} >= 1 - sell {sell_price}"
            )));
        }
        let gross_edge = (buy_price - (Decimal::ONE - sell_price)).abs();
        Ok(Self {
            pair,
            buy_venue,
            sell_venue,
            buy_price,
            sell_price,
            gross_edge,
            buy_book,
            sell_book,
            detected_at,
        })
    }

    /// Combined cost of buying both legs at the quoted prices.
    #[must_use]
    pub fn combined_cost(&self) -> Decimal {
        self.buy_price + self.sell_price
    }
}

/// Published fee schedule of a venue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Taker fee as a percentage of notional (e.g. `2` for 2%).
    pub taker_fee_percent: Decimal,
    /// Maker fee as a percentage of notional.
    pub maker_fee_percent: Decimal,
}

/// Per-opportunity cost breakdown applied on top of the gross edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeBreakdown {
    /// Taker fee on the buy leg, as a fraction of one contract.
    pub buy_fee_cost: Decimal,
    /// Taker fee on the sell leg, as a fraction of one contract.
    pub sell_fee_cost: Decimal,
    /// Gas amortized over the position size, as a fraction.
    pub gas_fraction: Decimal,
    /// Sum of all cost fractions.
    pub total_costs: Decimal,
    /// Fee schedule used for the buy leg.
    pub buy_schedule: FeeSchedule,
    /// Fee schedule used for the sell leg.
    pub sell_schedule: FeeSchedule,
}

/// A dislocation enriched with net edge, fees, and executable depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedOpportunity {
    /// Unique opportunity id, referenced by reservations and audits.
    pub id: Uuid,
    /// The underlying dislocation.
    pub dislocation: RawDislocation,
    /// Edge after fees and gas. Never exceeds the gross edge.
    pub net_edge: Decimal,
    /// Cost breakdown.
    pub fees: FeeBreakdown,
    /// Size the two-leg trade can cross at the quoted prices.
    pub liquidity_depth: Decimal,
    /// When enrichment completed.
    pub enriched_at: DateTime<Utc>,
}

impl EnrichedOpportunity {
    /// Stable pair key for logs and position records.
    #[must_use]
    pub fn pair_key(&self) -> String {
        self.dislocation.pair.key()
    }

    /// Gross edge of the underlying dislocation.
    #[must_use]
    pub fn gross_edge(&self) -> Decimal {
        self.dislocation.gross_edge
    }
}

// =============================================================================
// Budget Reservations
// =============================================================================

/// A pre-allocation of capital and one open-position slot.
///
/// Held exclusively for one opportunity while its legs are submitted; must be
/// committed or released, and each transition is one-way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetReservation {
    /// Unique reservation id required to commit or release.
    pub reservation_id: Uuid,
    /// Opportunity this reservation backs.
    pub opportunity_id: Uuid,
    /// Open-position slots held (always 1).
    pub reserved_slots: u32,
    /// Capital held, in USD.
    pub reserved_capital: Decimal,
    /// When the reservation was created.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Orders
// =============================================================================

/// Order type. Only limit orders are placed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Limit order at the quoted book price.
    Limit,
}

/// A request submitted to a venue client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Contract id on the target venue.
    pub contract_id: String,
    /// Target venue.
    pub venue: Venue,
    /// Outcome side being bought.
    pub side: Outcome,
    /// Quantity in contracts/shares.
    pub quantity: Decimal,
    /// Limit price as an implied probability.
    pub price: Decimal,
    /// Order type.
    pub order_type: OrderType,
}

/// Immediate status returned by `submit_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// Order filled on submission.
    Filled,
    /// Order accepted but not yet filled.
    Pending,
    /// Venue rejected the order.
    Rejected,
    /// Submission failed terminally at the client layer.
    Failed,
}

/// Result of submitting an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSubmission {
    /// Venue-assigned order id.
    pub order_id: String,
    /// Immediate status.
    pub status: SubmitStatus,
    /// Fill price, if filled.
    pub filled_price: Option<Decimal>,
    /// Fill size, if filled.
    pub filled_size: Option<Decimal>,
}

/// Status reported by `get_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order has filled.
    Filled,
    /// Order is resting, unfilled.
    Pending,
    /// Order was cancelled.
    Cancelled,
    /// Order was rejected.
    Rejected,
    /// Venue has no record of the order.
    NotFound,
}

/// Point-in-time order state reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    /// Current status.
    pub status: OrderStatus,
    /// Fill price, if filled.
    pub fill_price: Option<Decimal>,
    /// Fill size, if filled.
    pub fill_size: Option<Decimal>,
}

/// Reference to a filled (or believed-filled) leg attached to a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    /// Venue-assigned order id.
    pub order_id: String,
    /// Venue the order lives on.
    pub venue: Venue,
    /// Fill price, when known.
    pub fill_price: Option<Decimal>,
    /// Fill size, when known.
    pub fill_size: Option<Decimal>,
}

impl OrderRef {
    /// Capital represented by this leg (`fill_price · fill_size`), zero when
    /// fills are unknown.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        match (self.fill_price, self.fill_size) {
            (Some(price), Some(size)) => price * size,
            _ => Decimal::ZERO,
        }
    }
}

/// Locally persisted order row, consumed by startup reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Venue-assigned order id.
    pub order_id: String,
    /// Venue the order lives on.
    pub venue: Venue,
    /// Owning position, once one exists.
    pub position_id: Option<Uuid>,
    /// Outcome side bought.
    pub side: Outcome,
    /// Limit price.
    pub price: Decimal,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Last known local status.
    pub status: OrderStatus,
    /// When the order was submitted.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Positions
// =============================================================================

/// Lifecycle status of a two-leg position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Both legs filled; awaiting settlement.
    Open,
    /// Exactly one leg filled; the other rejected or unfilled at deadline.
    SingleLegExposed,
    /// Exit in progress, partially complete.
    ExitPartial,
    /// Position fully closed.
    Closed,
    /// Flagged by reconciliation; requires operator resolution.
    ReconciliationRequired,
}

impl PositionStatus {
    /// Returns true for statuses that still tie up capital.
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Returns true for statuses that occupy an open-pair slot.
    #[must_use]
    pub fn counts_as_open(self) -> bool {
        matches!(self, Self::Open | Self::SingleLegExposed | Self::ExitPartial)
    }

    /// Returns the display string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::SingleLegExposed => "SINGLE_LEG_EXPOSED",
            Self::ExitPartial => "EXIT_PARTIAL",
            Self::Closed => "CLOSED",
            Self::ReconciliationRequired => "RECONCILIATION_REQUIRED",
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of mismatch found between local and platform order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyType {
    /// Local status disagrees with the platform.
    OrderStatusMismatch,
    /// Platform has no record of an attached order.
    OrderNotFound,
    /// Locally pending order turned out to be filled.
    PendingFilled,
    /// Platform could not be reached to verify.
    PlatformUnavailable,
}

impl DiscrepancyType {
    /// Returns the snake_case tag used in events and persistence.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OrderStatusMismatch => "order_status_mismatch",
            Self::OrderNotFound => "order_not_found",
            Self::PendingFilled => "pending_filled",
            Self::PlatformUnavailable => "platform_unavailable",
        }
    }
}

/// Context saved on a position flagged for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationContext {
    /// Status the position should take if the operator acknowledges.
    pub recommended_status: PositionStatus,
    /// Kind of mismatch observed.
    pub discrepancy_type: DiscrepancyType,
    /// Raw platform-state summary for the operator.
    pub platform_state: String,
    /// When the discrepancy was detected.
    pub detected_at: DateTime<Utc>,
}

/// A two-leg cross-venue position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique position id.
    pub position_id: Uuid,
    /// Pair key (`polymarket_id:kalshi_id`).
    pub pair_key: String,
    /// First-submitted leg, once filled.
    pub leg_a: Option<OrderRef>,
    /// Second-submitted leg, once filled.
    pub leg_b: Option<OrderRef>,
    /// Lifecycle status.
    pub status: PositionStatus,
    /// Saved reconciliation context while flagged.
    pub reconciliation: Option<ReconciliationContext>,
    /// When the position was created.
    pub opened_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Capital tied up across both legs (`Σ fill_price · fill_size`).
    #[must_use]
    pub fn capital_at_risk(&self) -> Decimal {
        self.leg_a.as_ref().map_or(Decimal::ZERO, OrderRef::notional)
            + self.leg_b.as_ref().map_or(Decimal::ZERO, OrderRef::notional)
    }

    /// Returns true if a leg on the given venue is already attached.
    #[must_use]
    pub fn has_leg_on(&self, venue: Venue) -> bool {
        self.leg_a.as_ref().is_some_and(|l| l.venue == venue)
            || self.leg_b.as_ref().is_some_and(|l| l.venue == venue)
    }
}

// =============================================================================
// Venue Health
// =============================================================================

/// Operational status of a venue connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Impaired; market data may be stale.
    Degraded,
    /// Unreachable.
    Disconnected,
}

/// Trading mode reported by a venue client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    /// Real-money trading.
    Live,
    /// Simulated fills.
    Paper,
}

/// Health report from one venue client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueHealth {
    /// Venue reporting.
    pub venue: Venue,
    /// Connection status.
    pub status: HealthStatus,
    /// Trading mode.
    pub mode: TradingMode,
}

// =============================================================================
// Halt Reasons
// =============================================================================

/// A tag in the risk state's halt set. Multiple reasons may coexist; trading
/// is suspended while the set is non-empty.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Daily loss limit reached. Inviolable: overrides are denied while set.
    DailyLossLimit,
    /// Clock drift at or beyond the halt threshold.
    ClockDrift,
    /// Startup reconciliation found discrepancies.
    ReconciliationDiscrepancy,
    /// Operator-initiated halt.
    Manual,
}

impl HaltReason {
    /// Returns the snake_case tag stored in persistence and events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DailyLossLimit => "daily_loss_limit",
            Self::ClockDrift => "clock_drift",
            Self::ReconciliationDiscrepancy => "reconciliation_discrepancy",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for HaltReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily_loss_limit" => Ok(Self::DailyLossLimit),
            "clock_drift" => Ok(Self::ClockDrift),
            "reconciliation_discrepancy" => Ok(Self::ReconciliationDiscrepancy),
            "manual" => Ok(Self::Manual),
            other => Err(CoreError::ConfigValidation(format!(
                "unknown halt reason: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
