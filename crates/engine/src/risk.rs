//! Risk manager: the singleton financial state and its transaction algebra.
//!
//! Owns bankroll, daily P&L, open-position count, budget reservations, and
//! the multi-reason halt set. The contract guarantees at-most-one committed
//! position per reservation and never double-spends capital: a successful
//! [`RiskManager::reserve_budget`] is the only way to acquire execution
//! rights, and every reservation ends in exactly one of commit or release.
//!
//! All multi-field updates publish a persisted snapshot after the in-memory
//! mutation completes. Persistence failures are logged but never roll back
//! in-memory state; the database row exists for crash recovery only.
//!
//! Invariants held between any two public operations:
//!
//! - `0 ≤ total_capital_deployed + reserved_capital ≤ bankroll`
//! - `open_position_count + reserved_slots ≤ max_open_pairs`
//! - `trading_halted ⇔ active_halt_reasons ≠ ∅`

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pm_arb_core::{
    BudgetReservation, Clock, CoreError, CycleContext, EngineConfig, EngineEvent,
    EnrichedOpportunity, EventBus, HaltReason, LimitKind, OverrideAuditRecord,
    PersistedRiskState, RiskStateStore,
};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the risk manager.
///
/// Limit-violation decisions are data ([`Decision`]); only the reservation
/// API and programmer errors surface as `Err`.
#[derive(Debug, Clone, Error)]
pub enum RiskError {
    /// Budget reservation rejected: halt active, slots exhausted, or capital
    /// insufficient, re-checked atomically at reservation time.
    #[error("BUDGET_RESERVATION_FAILED: {0}")]
    ReservationFailed(String),

    /// The reservation id was never issued or already reached a terminal
    /// state. Programmer error.
    #[error("unknown reservation id: {0}")]
    UnknownReservation(Uuid),

    /// Limits rejected at construction.
    #[error("invalid risk limits: {0}")]
    InvalidConfig(String),
}

// =============================================================================
// Limits
// =============================================================================

/// Risk limits, validated at construction and immutable afterwards.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Total bankroll in USD.
    pub bankroll: Decimal,
    /// Maximum single-position size as a fraction of bankroll.
    pub max_position_pct: Decimal,
    /// Maximum concurrently open pairs.
    pub max_open_pairs: u32,
    /// Daily loss limit as a fraction of bankroll.
    pub daily_loss_pct: Decimal,
}

impl RiskLimits {
    /// Validates the limit ranges.
    ///
    /// # Errors
    /// Returns [`RiskError::InvalidConfig`] on the first violated range.
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.bankroll <= Decimal::ZERO {
            return Err(RiskError::InvalidConfig(format!(
                "bankroll {} must be positive",
                self.bankroll
            )));
        }
        if self.max_position_pct <= Decimal::ZERO || self.max_position_pct > Decimal::ONE {
            return Err(RiskError::InvalidConfig(format!(
                "max_position_pct {} not in (0, 1]",
                self.max_position_pct
            )));
        }
        if self.max_open_pairs == 0 {
            return Err(RiskError::InvalidConfig(
                "max_open_pairs must be a positive integer".to_string(),
            ));
        }
        if self.daily_loss_pct <= Decimal::ZERO || self.daily_loss_pct > Decimal::ONE {
            return Err(RiskError::InvalidConfig(format!(
                "daily_loss_pct {} not in (0, 1]",
                self.daily_loss_pct
            )));
        }
        Ok(())
    }

    /// Maximum capital allocated to one position.
    #[must_use]
    pub fn max_position_size(&self) -> Decimal {
        self.bankroll * self.max_position_pct
    }

    /// Absolute daily loss limit in USD.
    #[must_use]
    pub fn daily_loss_limit(&self) -> Decimal {
        self.bankroll * self.daily_loss_pct
    }
}

impl From<&EngineConfig> for RiskLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            bankroll: config.bankroll_usd,
            max_position_pct: config.max_position_pct,
            max_open_pairs: config.max_open_pairs,
            daily_loss_pct: config.daily_loss_pct,
        }
    }
}

// =============================================================================
// Decisions and Requests
// =============================================================================

/// Result of the pure pre-screen used by the scheduler loop.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the opportunity may proceed to reservation.
    pub approved: bool,
    /// Rejection reason when not approved.
    pub reason: Option<String>,
    /// Position-size ceiling currently in force.
    pub max_position_size: Decimal,
    /// Committed open positions at decision time.
    pub open_position_count: u32,
}

/// Input to [`RiskManager::reserve_budget`].
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Opportunity the reservation backs.
    pub opportunity_id: Uuid,
    /// Size recommended by the caller; capped at the position ceiling.
    pub recommended_size: Decimal,
}

/// Result of an operator override request.
#[derive(Debug, Clone)]
pub struct OverrideDecision {
    /// Whether the override was granted.
    pub approved: bool,
    /// Denial reason, if denied.
    pub reason: Option<String>,
    /// Granted position-size ceiling, if approved.
    pub max_position_size: Option<Decimal>,
}

/// Read-only view of the risk state for status surfaces.
#[derive(Debug, Clone)]
pub struct RiskSnapshot {
    /// Total bankroll.
    pub bankroll: Decimal,
    /// Daily P&L since the last reset.
    pub daily_pnl: Decimal,
    /// Committed open positions.
    pub open_position_count: u32,
    /// Capital committed into open positions.
    pub total_capital_deployed: Decimal,
    /// Capital held by live reservations.
    pub reserved_capital: Decimal,
    /// Slots held by live reservations.
    pub reserved_slots: u32,
    /// Active halt reasons.
    pub active_halt_reasons: Vec<HaltReason>,
    /// True iff the halt set is non-empty.
    pub trading_halted: bool,
    /// Last midnight reset applied.
    pub last_reset_timestamp: Option<DateTime<Utc>>,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
struct Inner {
    bankroll: Decimal,
    daily_pnl: Decimal,
    open_position_count: u32,
    total_capital_deployed: Decimal,
    reservations: HashMap<Uuid, BudgetReservation>,
    active_halt_reasons: BTreeSet<HaltReason>,
    last_reset_timestamp: Option<DateTime<Utc>>,
    // Approach-once flags. The daily flag re-arms only at midnight; the
    // open-pairs flag re-arms when effective pairs drop back under 80%.
    daily_approach_emitted: bool,
    pairs_approach_emitted: bool,
}

impl Inner {
    fn fresh(bankroll: Decimal) -> Self {
        Self {
            bankroll,
            daily_pnl: Decimal::ZERO,
            open_position_count: 0,
            total_capital_deployed: Decimal::ZERO,
            reservations: HashMap::new(),
            active_halt_reasons: BTreeSet::new(),
            last_reset_timestamp: None,
            daily_approach_emitted: false,
            pairs_approach_emitted: false,
        }
    }

    fn reserved_capital(&self) -> Decimal {
        self.reservations
            .values()
            .map(|r| r.reserved_capital)
            .sum()
    }

    fn reserved_slots(&self) -> u32 {
        self.reservations
            .values()
            .map(|r| r.reserved_slots)
            .sum()
    }

    fn available_capital(&self) -> Decimal {
        self.bankroll - self.total_capital_deployed - self.reserved_capital()
    }

    fn effective_open(&self) -> u32 {
        self.open_position_count + self.reserved_slots()
    }

    fn halt_reasons_vec(&self) -> Vec<HaltReason> {
        self.active_halt_reasons.iter().copied().collect()
    }

    fn halt_summary(&self) -> String {
        self.active_halt_reasons
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time of day")
        .and_utc()
}

// =============================================================================
// Risk Manager
// =============================================================================

/// Owner of the singleton risk state.
///
/// Methods take `&self`; the interior lock is held only across the in-memory
/// mutation and never across an await, which keeps the cooperative
/// single-cycle model free of interleaved reservations.
pub struct RiskManager {
    limits: RiskLimits,
    state: Mutex<Inner>,
    store: Arc<dyn RiskStateStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("limits", &self.limits)
            .finish()
    }
}

impl RiskManager {
    /// Creates a manager with a fresh state.
    ///
    /// # Errors
    /// Returns [`RiskError::InvalidConfig`] if the limits are out of range.
    pub fn new(
        limits: RiskLimits,
        store: Arc<dyn RiskStateStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RiskError> {
        limits.validate()?;
        let inner = Inner::fresh(limits.bankroll);
        Ok(Self {
            limits,
            state: Mutex::new(inner),
            store,
            bus,
            clock,
        })
    }

    /// Creates a manager and reloads the persisted snapshot.
    ///
    /// Reload rules:
    /// - a reset timestamp before today's UTC midnight resets daily P&L and
    ///   removes the `daily_loss_limit` halt reason;
    /// - a missing reset timestamp with non-zero daily P&L is treated as
    ///   corruption and reset with a warning;
    /// - otherwise the daily P&L is kept and the daily-loss halt re-evaluated;
    /// - reservations are always cleared: in-flight execution cannot survive
    ///   a restart.
    ///
    /// # Errors
    /// Propagates store failures; an unreachable database at startup is
    /// fatal.
    pub async fn restore(
        limits: RiskLimits,
        store: Arc<dyn RiskStateStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        limits
            .validate()
            .map_err(|e| CoreError::ConfigValidation(e.to_string()))?;
        let persisted = store.load().await?;
        let manager = Self {
            state: Mutex::new(Inner::fresh(limits.bankroll)),
            limits,
            store,
            bus,
            clock,
        };

        if let Some(p) = persisted {
            let midnight = utc_midnight(manager.clock.now_utc());
            let mut inner = manager.state.lock();
            inner.daily_pnl = p.daily_pnl;
            inner.open_position_count = p.open_position_count;
            inner.total_capital_deployed = p.total_capital_deployed;
            inner.last_reset_timestamp = p.last_reset_timestamp;
            inner.active_halt_reasons = p.active_halt_reasons.into_iter().collect();

            match inner.last_reset_timestamp {
                Some(ts) if ts < midnight => {
                    info!(
                        stale_daily_pnl = %inner.daily_pnl,
                        "Persisted daily P&L predates today's midnight; resetting"
                    );
                    inner.daily_pnl = Decimal::ZERO;
                    inner.active_halt_reasons.remove(&HaltReason::DailyLossLimit);
                    inner.last_reset_timestamp = Some(midnight);
                }
                None if p.daily_pnl != Decimal::ZERO => {
                    warn!(
                        daily_pnl = %p.daily_pnl,
                        "Persisted daily P&L has no reset timestamp; treating as corruption"
                    );
                    inner.daily_pnl = Decimal::ZERO;
                    inner.active_halt_reasons.remove(&HaltReason::DailyLossLimit);
                    inner.last_reset_timestamp = Some(midnight);
                }
                _ => {
                    let abs_loss = (-inner.daily_pnl).max(Decimal::ZERO);
                    if abs_loss >= manager.limits.daily_loss_limit() {
                        inner.active_halt_reasons.insert(HaltReason::DailyLossLimit);
                    }
                }
            }
        }

        manager.persist().await;
        Ok(manager)
    }

    /// Returns the configured limits.
    #[must_use]
    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Returns true while any halt reason is active.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        !self.state.lock().active_halt_reasons.is_empty()
    }

    /// Returns the active halt reasons.
    #[must_use]
    pub fn halt_reasons(&self) -> Vec<HaltReason> {
        self.state.lock().halt_reasons_vec()
    }

    /// Read-only snapshot for status and export surfaces.
    #[must_use]
    pub fn snapshot(&self) -> RiskSnapshot {
        let inner = self.state.lock();
        RiskSnapshot {
            bankroll: inner.bankroll,
            daily_pnl: inner.daily_pnl,
            open_position_count: inner.open_position_count,
            total_capital_deployed: inner.total_capital_deployed,
            reserved_capital: inner.reserved_capital(),
            reserved_slots: inner.reserved_slots(),
            active_halt_reasons: inner.halt_reasons_vec(),
            trading_halted: !inner.active_halt_reasons.is_empty(),
            last_reset_timestamp: inner.last_reset_timestamp,
        }
    }

    // -------------------------------------------------------------------------
    // Pre-screen
    // -------------------------------------------------------------------------

    /// Pure pre-screen used by the scheduler loop. Never mutates financial
    /// state; only the approach-once bookkeeping flag moves.
    pub fn validate_position(
        &self,
        ctx: &CycleContext,
        opportunity: &EnrichedOpportunity,
    ) -> Decision {
        let max_size = self.limits.max_position_size();
        let mut events = Vec::new();
        let decision = {
            let mut inner = self.state.lock();
            let effective = inner.effective_open();

            let approach_band =
                Decimal::from(self.limits.max_open_pairs) * dec!(0.8);
            if Decimal::from(effective) >= approach_band {
                if !inner.pairs_approach_emitted {
                    inner.pairs_approach_emitted = true;
                    events.push(EngineEvent::LimitApproached {
                        limit: LimitKind::OpenPairs,
                        current: Decimal::from(effective),
                        threshold: Decimal::from(self.limits.max_open_pairs),
                    });
                }
            } else {
                inner.pairs_approach_emitted = false;
            }

            if !inner.active_halt_reasons.is_empty() {
                Decision {
                    approved: false,
                    reason: Some(format!("trading halted: {}", inner.halt_summary())),
                    max_position_size: max_size,
                    open_position_count: inner.open_position_count,
                }
            } else if effective >= self.limits.max_open_pairs {
                Decision {
                    approved: false,
                    reason: Some(format!(
                        "max open pairs reached: {effective} >= {}",
                        self.limits.max_open_pairs
                    )),
                    max_position_size: max_size,
                    open_position_count: inner.open_position_count,
                }
            } else if inner.available_capital() < max_size {
                Decision {
                    approved: false,
                    reason: Some(format!(
                        "insufficient capital: {} available < {} required",
                        inner.available_capital(),
                        max_size
                    )),
                    max_position_size: max_size,
                    open_position_count: inner.open_position_count,
                }
            } else {
                Decision {
                    approved: true,
                    reason: None,
                    max_position_size: max_size,
                    open_position_count: inner.open_position_count,
                }
            }
        };
        for event in events {
            self.bus.publish(ctx, event);
        }
        if !decision.approved {
            debug!(
                correlation_id = %ctx.correlation_id,
                opportunity_id = %opportunity.id,
                pair = %opportunity.pair_key(),
                reason = decision.reason.as_deref().unwrap_or(""),
                "Opportunity rejected by pre-screen"
            );
        }
        decision
    }

    // -------------------------------------------------------------------------
    // Reservation Algebra
    // -------------------------------------------------------------------------

    /// Reserves capital and one open-position slot for an opportunity.
    ///
    /// The three rejection conditions of [`Self::validate_position`] are
    /// re-checked atomically under the state lock; a successful call is the
    /// only way to acquire execution rights.
    ///
    /// # Errors
    /// Returns [`RiskError::ReservationFailed`] when rejected.
    pub async fn reserve_budget(
        &self,
        ctx: &CycleContext,
        request: ReserveRequest,
    ) -> Result<BudgetReservation, RiskError> {
        let max_size = self.limits.max_position_size();
        let reservation = {
            let mut inner = self.state.lock();
            if !inner.active_halt_reasons.is_empty() {
                return Err(RiskError::ReservationFailed(format!(
                    "trading halted: {}",
                    inner.halt_summary()
                )));
            }
            if inner.effective_open() >= self.limits.max_open_pairs {
                return Err(RiskError::ReservationFailed(format!(
                    "max open pairs reached: {} >= {}",
                    inner.effective_open(),
                    self.limits.max_open_pairs
                )));
            }
            if inner.available_capital() < max_size {
                return Err(RiskError::ReservationFailed(format!(
                    "insufficient capital: {} available < {} required",
                    inner.available_capital(),
                    max_size
                )));
            }

            let reservation = BudgetReservation {
                reservation_id: Uuid::new_v4(),
                opportunity_id: request.opportunity_id,
                reserved_slots: 1,
                reserved_capital: request.recommended_size.max(Decimal::ZERO).min(max_size),
                created_at: self.clock.now_utc(),
            };
            inner
                .reservations
                .insert(reservation.reservation_id, reservation.clone());
            reservation
        };

        debug!(
            correlation_id = %ctx.correlation_id,
            reservation_id = %reservation.reservation_id,
            reserved_capital = %reservation.reserved_capital,
            "Budget reserved"
        );
        self.bus.publish(
            ctx,
            EngineEvent::BudgetReserved {
                reservation_id: reservation.reservation_id,
                opportunity_id: reservation.opportunity_id,
                reserved_capital: reservation.reserved_capital,
            },
        );
        self.persist().await;
        Ok(reservation)
    }

    /// Commits a reservation: reserved capital and slots become deployed.
    ///
    /// # Errors
    /// Returns [`RiskError::UnknownReservation`] for an id that was never
    /// issued or already terminated.
    pub async fn commit_reservation(
        &self,
        ctx: &CycleContext,
        reservation_id: Uuid,
    ) -> Result<(), RiskError> {
        let event = {
            let mut inner = self.state.lock();
            let reservation = inner
                .reservations
                .remove(&reservation_id)
                .ok_or(RiskError::UnknownReservation(reservation_id))?;
            inner.total_capital_deployed += reservation.reserved_capital;
            inner.open_position_count += reservation.reserved_slots;
            EngineEvent::BudgetCommitted {
                reservation_id,
                capital_deployed: reservation.reserved_capital,
                open_position_count: inner.open_position_count,
            }
        };
        self.bus.publish(ctx, event);
        self.persist().await;
        Ok(())
    }

    /// Releases a reservation, returning its capital and slot to the pool.
    ///
    /// # Errors
    /// Returns [`RiskError::UnknownReservation`] for an id that was never
    /// issued or already terminated.
    pub async fn release_reservation(
        &self,
        ctx: &CycleContext,
        reservation_id: Uuid,
    ) -> Result<(), RiskError> {
        let event = {
            let mut inner = self.state.lock();
            let reservation = inner
                .reservations
                .remove(&reservation_id)
                .ok_or(RiskError::UnknownReservation(reservation_id))?;
            EngineEvent::BudgetReleased {
                reservation_id,
                capital_returned: reservation.reserved_capital,
            }
        };
        self.bus.publish(ctx, event);
        self.persist().await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // P&L and Position Close
    // -------------------------------------------------------------------------

    /// Releases capital for a closed position and applies its P&L delta.
    pub async fn close_position(
        &self,
        ctx: &CycleContext,
        capital_returned: Decimal,
        pnl_delta: Decimal,
    ) {
        {
            let mut inner = self.state.lock();
            inner.open_position_count = inner.open_position_count.saturating_sub(1);
            inner.total_capital_deployed =
                (inner.total_capital_deployed - capital_returned).max(Decimal::ZERO);
        }
        self.update_daily_pnl(ctx, pnl_delta).await;
    }

    /// Applies a P&L delta and evaluates the daily-loss limit.
    ///
    /// Breaching the limit inserts the `daily_loss_limit` halt reason and
    /// emits `limit_breached`; entering the 80% band emits `limit_approached`
    /// once until the midnight reset re-arms the flag.
    pub async fn update_daily_pnl(&self, ctx: &CycleContext, delta: Decimal) {
        let limit = self.limits.daily_loss_limit();
        let mut events = Vec::new();
        {
            let mut inner = self.state.lock();
            inner.daily_pnl += delta;
            let abs_loss = (-inner.daily_pnl).max(Decimal::ZERO);

            if abs_loss >= limit
                && !inner.active_halt_reasons.contains(&HaltReason::DailyLossLimit)
            {
                inner.active_halt_reasons.insert(HaltReason::DailyLossLimit);
                events.push(EngineEvent::TradingHalted {
                    reason: HaltReason::DailyLossLimit,
                    active_reasons: inner.halt_reasons_vec(),
                });
                events.push(EngineEvent::LimitBreached {
                    limit: LimitKind::DailyLoss,
                    current: abs_loss,
                    threshold: limit,
                });
            } else if abs_loss >= limit * dec!(0.8)
                && abs_loss < limit
                && !inner.daily_approach_emitted
            {
                inner.daily_approach_emitted = true;
                events.push(EngineEvent::LimitApproached {
                    limit: LimitKind::DailyLoss,
                    current: abs_loss,
                    threshold: limit,
                });
            }
        }
        for event in events {
            self.bus.publish(ctx, event);
        }
        self.persist().await;
    }

    // -------------------------------------------------------------------------
    // Halt Set
    // -------------------------------------------------------------------------

    /// Adds a halt reason. Idempotent; emits `system_trading_halted` only on
    /// first insertion.
    pub async fn halt_trading(&self, ctx: &CycleContext, reason: HaltReason) {
        let event = {
            let mut inner = self.state.lock();
            if inner.active_halt_reasons.insert(reason) {
                Some(EngineEvent::TradingHalted {
                    reason,
                    active_reasons: inner.halt_reasons_vec(),
                })
            } else {
                None
            }
        };
        if let Some(event) = event {
            warn!(correlation_id = %ctx.correlation_id, reason = %reason, "Trading halted");
            self.bus.publish(ctx, event);
            self.persist().await;
        }
    }

    /// Removes a halt reason. Idempotent; emits `system_trading_resumed`
    /// (carrying the remaining reasons) only on actual removal. Trading
    /// stays suspended while other reasons remain.
    pub async fn resume_trading(&self, ctx: &CycleContext, reason: HaltReason) {
        let event = {
            let mut inner = self.state.lock();
            if inner.active_halt_reasons.remove(&reason) {
                Some(EngineEvent::TradingResumed {
                    reason,
                    remaining_reasons: inner.halt_reasons_vec(),
                })
            } else {
                None
            }
        };
        if let Some(event) = event {
            info!(correlation_id = %ctx.correlation_id, reason = %reason, "Halt reason removed");
            self.bus.publish(ctx, event);
            self.persist().await;
        }
    }

    // -------------------------------------------------------------------------
    // Operator Override
    // -------------------------------------------------------------------------

    /// Operator escape hatch. A `daily_loss_limit` halt is inviolable; any
    /// other halt may be overridden, with the operator taking responsibility.
    /// Every call, approved or denied, is appended to the audit log.
    pub async fn process_override(
        &self,
        ctx: &CycleContext,
        opportunity_id: Uuid,
        rationale: impl Into<String>,
    ) -> OverrideDecision {
        let rationale = rationale.into();
        let (decision, reasons) = {
            let inner = self.state.lock();
            let reasons = inner.halt_reasons_vec();
            if inner
                .active_halt_reasons
                .contains(&HaltReason::DailyLossLimit)
            {
                (
                    OverrideDecision {
                        approved: false,
                        reason: Some("daily loss limit halt is inviolable".to_string()),
                        max_position_size: None,
                    },
                    reasons,
                )
            } else {
                (
                    OverrideDecision {
                        approved: true,
                        reason: None,
                        max_position_size: Some(self.limits.max_position_size()),
                    },
                    reasons,
                )
            }
        };

        let record = OverrideAuditRecord {
            opportunity_id,
            approved: decision.approved,
            rationale: rationale.clone(),
            halt_reasons_at_decision: reasons,
            max_position_size: decision.max_position_size,
            decided_at: self.clock.now_utc(),
        };
        if let Err(e) = self.store.append_override(&record).await {
            warn!(error = %e, "Failed to append override audit record");
        }

        let event = if decision.approved {
            EngineEvent::OverrideApplied {
                opportunity_id,
                max_position_size: decision.max_position_size.unwrap_or_default(),
                rationale,
            }
        } else {
            EngineEvent::OverrideDenied {
                opportunity_id,
                reason: decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "denied".to_string()),
            }
        };
        self.bus.publish(ctx, event);
        decision
    }

    // -------------------------------------------------------------------------
    // Reconciliation and Resets
    // -------------------------------------------------------------------------

    /// Forcible reset of open count and deployed capital from the position
    /// store. Used only by startup reconciliation.
    pub async fn recalculate_from_positions(
        &self,
        ctx: &CycleContext,
        open_count: u32,
        capital_deployed: Decimal,
    ) {
        {
            let mut inner = self.state.lock();
            inner.open_position_count = open_count;
            inner.total_capital_deployed = capital_deployed.max(Decimal::ZERO);
            if inner.total_capital_deployed + inner.reserved_capital() > inner.bankroll {
                warn!(
                    deployed = %inner.total_capital_deployed,
                    bankroll = %inner.bankroll,
                    "Recalculated deployment exceeds bankroll"
                );
            }
        }
        info!(
            correlation_id = %ctx.correlation_id,
            open_count,
            capital_deployed = %capital_deployed,
            "Risk state recalculated from positions"
        );
        self.persist().await;
    }

    /// UTC-midnight reset: zeroes daily P&L, re-arms the daily approach
    /// flag, and removes the `daily_loss_limit` halt reason. Other halt
    /// reasons persist.
    pub async fn handle_midnight_reset(&self, ctx: &CycleContext) {
        let event = {
            let mut inner = self.state.lock();
            inner.daily_pnl = Decimal::ZERO;
            inner.daily_approach_emitted = false;
            inner.last_reset_timestamp = Some(utc_midnight(self.clock.now_utc()));
            if inner.active_halt_reasons.remove(&HaltReason::DailyLossLimit) {
                Some(EngineEvent::TradingResumed {
                    reason: HaltReason::DailyLossLimit,
                    remaining_reasons: inner.halt_reasons_vec(),
                })
            } else {
                None
            }
        };
        info!(correlation_id = %ctx.correlation_id, "Daily P&L reset at UTC midnight");
        if let Some(event) = event {
            self.bus.publish(ctx, event);
        }
        self.persist().await;
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Publishes a persisted snapshot of the current state. Failures are
    /// logged and swallowed: the in-memory state is authoritative.
    async fn persist(&self) {
        let snapshot = {
            let inner = self.state.lock();
            PersistedRiskState {
                bankroll: inner.bankroll,
                daily_pnl: inner.daily_pnl,
                open_position_count: inner.open_position_count,
                total_capital_deployed: inner.total_capital_deployed,
                reserved_capital: inner.reserved_capital(),
                reserved_slots: inner.reserved_slots(),
                last_reset_timestamp: inner.last_reset_timestamp,
                active_halt_reasons: inner.halt_reasons_vec(),
                updated_at: self.clock.now_utc(),
            }
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(error = %e, "Failed to persist risk state snapshot");
        }
    }

    /// Asserts the quantified risk invariants. Test support.
    #[cfg(test)]
    fn assert_invariants(&self) {
        let inner = self.state.lock();
        let committed = inner.total_capital_deployed + inner.reserved_capital();
        assert!(committed >= Decimal::ZERO);
        assert!(
            committed <= inner.bankroll,
            "deployed + reserved {} exceeds bankroll {}",
            committed,
            inner.bankroll
        );
        assert!(inner.effective_open() <= self.limits.max_open_pairs);
    }
}
