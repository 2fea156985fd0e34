//! Startup reconciliation: cross-checking local positions and orders
//! against the venues before the first trading cycle.
//!
//! Safety policy: discrepancies are flagged for an operator, never resolved
//! automatically. The engine will not cancel orders or close positions on a
//! venue by itself; it halts trading and waits.
//!
//! Phases (each skipped once the overall budget is exhausted):
//! 1. Pending-order resolution, including single-leg repair when a pending
//!    second leg turns out to have filled.
//! 2. Active-position verification against platform order state.
//! 3. Discrepancy flagging: `RECONCILIATION_REQUIRED` with saved context,
//!    one `system_health_critical`, and a trading halt.
//! 4. Budget recalculation — always runs, even on a clean pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pm_arb_core::{
    Clock, CoreError, CycleContext, DiscrepancyType, EngineEvent, EventBus, HaltReason, OrderRef,
    OrderState, OrderStatus, Position, PositionStatus, PositionStore, ReconciliationContext,
    Venue, VenueClients,
};

use crate::risk::RiskManager;

// =============================================================================
// Configuration and Results
// =============================================================================

/// Time budgets for the reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Overall budget for the whole pass.
    pub overall_budget: Duration,
    /// Budget for each individual venue call.
    pub call_budget: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            overall_budget: Duration::from_secs(60),
            call_budget: Duration::from_secs(10),
        }
    }
}

/// Operator action on a flagged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionAction {
    /// Accept the saved recommended status.
    Acknowledge,
    /// Write the position off as closed with no P&L credited.
    ForceClose,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    /// Pending orders resolved in phase 1.
    pub orders_resolved: u32,
    /// Positions verified in phase 2.
    pub positions_checked: u32,
    /// Positions flagged in phase 3.
    pub discrepancies: u32,
    /// Open count applied in phase 4.
    pub open_count: u32,
    /// Deployed capital applied in phase 4.
    pub capital_deployed: Decimal,
    /// Wall-clock duration of the pass.
    pub duration_ms: u64,
    /// True if the overall budget cut the pass short.
    pub timed_out: bool,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Runs once after the risk-state reload, before the first scheduler tick.
pub struct StartupReconciler {
    clients: VenueClients,
    positions: Arc<dyn PositionStore>,
    risk: Arc<RiskManager>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl std::fmt::Debug for StartupReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupReconciler")
            .field("config", &self.config)
            .finish()
    }
}

impl StartupReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        clients: VenueClients,
        positions: Arc<dyn PositionStore>,
        risk: Arc<RiskManager>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            clients,
            positions,
            risk,
            bus,
            clock,
            config,
        }
    }

    /// Runs the full reconciliation pass.
    ///
    /// # Errors
    /// Propagates position-store failures; an unreachable database at
    /// startup is fatal.
    pub async fn run(&self, ctx: &CycleContext) -> Result<ReconciliationReport, CoreError> {
        let started = Instant::now();
        let deadline = started + self.config.overall_budget;
        let mut timed_out = false;
        let mut orders_resolved = 0u32;
        let mut positions_checked = 0u32;
        let mut flagged: Vec<(Position, ReconciliationContext)> = Vec::new();

        // ---------------------------------------------------------------
        // Phase 1: pending-order resolution
        // ---------------------------------------------------------------
        let pending = self.positions.list_pending_orders().await?;
        info!(
            correlation_id = %ctx.correlation_id,
            pending = pending.len(),
            "Reconciliation phase 1: resolving pending orders"
        );
        for order in pending {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            let state = match self.query_order(order.venue, &order.order_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        order_id = %order.order_id,
                        error = %e,
                        "Pending-order query failed; leaving unresolved"
                    );
                    continue;
                }
            };
            match state.status {
                OrderStatus::Filled => {
                    self.positions
                        .update_order_status(
                            &order.order_id,
                            OrderStatus::Filled,
                            state.fill_price,
                            state.fill_size,
                        )
                        .await?;
                    orders_resolved += 1;
                    if let Some(position_id) = order.position_id {
                        self.repair_single_leg(ctx, position_id, &order.order_id, order.venue, &state)
                            .await?;
                    }
                }
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    self.positions
                        .update_order_status(&order.order_id, state.status, None, None)
                        .await?;
                    orders_resolved += 1;
                }
                OrderStatus::NotFound => {
                    if let Some(position_id) = order.position_id {
                        if let Some(position) = self.positions.get_position(position_id).await? {
                            if position.status != PositionStatus::ReconciliationRequired {
                                let context = ReconciliationContext {
                                    recommended_status: recommend_for_missing(
                                        &position,
                                        order.venue,
                                    ),
                                    discrepancy_type: DiscrepancyType::OrderNotFound,
                                    platform_state: format!(
                                        "pending order {} unknown to {}",
                                        order.order_id, order.venue
                                    ),
                                    detected_at: self.clock.now_utc(),
                                };
                                flagged.push((position, context));
                            }
                        }
                    } else {
                        warn!(
                            correlation_id = %ctx.correlation_id,
                            order_id = %order.order_id,
                            "Orphan pending order unknown to its venue"
                        );
                    }
                }
                OrderStatus::Pending => {}
            }
        }

        // ---------------------------------------------------------------
        // Phase 2: active-position verification
        // ---------------------------------------------------------------
        if !timed_out {
            let active = self.positions.list_active_positions().await?;
            info!(
                correlation_id = %ctx.correlation_id,
                active = active.len(),
                "Reconciliation phase 2: verifying active positions"
            );
            for position in active {
                if position.status == PositionStatus::ReconciliationRequired {
                    continue;
                }
                if flagged.iter().any(|(p, _)| p.position_id == position.position_id) {
                    continue;
                }
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
                positions_checked += 1;
                if let Some(context) = self.verify_position(ctx, &position).await? {
                    flagged.push((position, context));
                }
            }
        }

        // ---------------------------------------------------------------
        // Phase 3: discrepancy handling
        // ---------------------------------------------------------------
        let discrepancies = flagged.len() as u32;
        for (mut position, context) in flagged {
            warn!(
                correlation_id = %ctx.correlation_id,
                position_id = %position.position_id,
                discrepancy = context.discrepancy_type.as_str(),
                recommended = %context.recommended_status,
                "Position flagged for operator reconciliation"
            );
            self.bus.publish(
                ctx,
                EngineEvent::ReconciliationDiscrepancy {
                    position_id: position.position_id,
                    discrepancy_type: context.discrepancy_type,
                    recommended_status: context.recommended_status,
                },
            );
            position.status = PositionStatus::ReconciliationRequired;
            position.reconciliation = Some(context);
            position.updated_at = self.clock.now_utc();
            self.positions.update_position(&position).await?;
        }
        if discrepancies > 0 {
            self.bus.publish(
                ctx,
                EngineEvent::SystemHealthCritical {
                    component: "reconciliation".to_string(),
                    detail: format!("{discrepancies} positions require operator resolution"),
                },
            );
            self.risk
                .halt_trading(ctx, HaltReason::ReconciliationDiscrepancy)
                .await;
        }

        // ---------------------------------------------------------------
        // Phase 4: budget recalculation (always runs)
        // ---------------------------------------------------------------
        let all_active = self.positions.list_active_positions().await?;
        let open_count = all_active
            .iter()
            .filter(|p| p.status.counts_as_open())
            .count() as u32;
        let capital_deployed: Decimal = all_active
            .iter()
            .filter(|p| p.status.is_active())
            .map(Position::capital_at_risk)
            .sum();
        self.risk
            .recalculate_from_positions(ctx, open_count, capital_deployed)
            .await;

        let report = ReconciliationReport {
            orders_resolved,
            positions_checked,
            discrepancies,
            open_count,
            capital_deployed,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
        };
        self.bus.publish(
            ctx,
            EngineEvent::ReconciliationComplete {
                positions_checked: report.positions_checked,
                orders_resolved: report.orders_resolved,
                discrepancies: report.discrepancies,
                duration_ms: report.duration_ms,
            },
        );
        info!(
            correlation_id = %ctx.correlation_id,
            orders_resolved,
            positions_checked,
            discrepancies,
            open_count,
            capital_deployed = %capital_deployed,
            timed_out,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Operator resolution of a flagged position.
    ///
    /// `Acknowledge` applies the saved recommended status; `ForceClose`
    /// closes with no P&L credited (an explicit write-off). Resolving the
    /// last flagged position removes the reconciliation halt.
    ///
    /// # Errors
    /// Fails for unknown positions or positions that are not flagged.
    pub async fn resolve_discrepancy(
        &self,
        ctx: &CycleContext,
        position_id: Uuid,
        action: ResolutionAction,
        rationale: &str,
    ) -> Result<(), CoreError> {
        let mut position = self
            .positions
            .get_position(position_id)
            .await?
            .ok_or_else(|| CoreError::SystemHealth(format!("unknown position {position_id}")))?;
        if position.status != PositionStatus::ReconciliationRequired {
            return Err(CoreError::SystemHealth(format!(
                "position {position_id} is not awaiting reconciliation"
            )));
        }

        match action {
            ResolutionAction::Acknowledge => {
                position.status = position
                    .reconciliation
                    .as_ref()
                    .map_or(PositionStatus::Open, |c| c.recommended_status);
            }
            ResolutionAction::ForceClose => {
                position.status = PositionStatus::Closed;
            }
        }
        position.reconciliation = None;
        position.updated_at = self.clock.now_utc();
        self.positions.update_position(&position).await?;

        if action == ResolutionAction::ForceClose {
            self.risk
                .close_position(ctx, Decimal::ZERO, Decimal::ZERO)
                .await;
        }

        info!(
            correlation_id = %ctx.correlation_id,
            position_id = %position_id,
            action = ?action,
            rationale,
            new_status = %position.status,
            "Reconciliation discrepancy resolved"
        );

        let remaining = self
            .positions
            .list_active_positions()
            .await?
            .iter()
            .filter(|p| p.status == PositionStatus::ReconciliationRequired)
            .count();
        if remaining == 0 {
            self.risk
                .resume_trading(ctx, HaltReason::ReconciliationDiscrepancy)
                .await;
        }
        Ok(())
    }

    /// Re-attaches a filled second leg to a single-leg-exposed position.
    async fn repair_single_leg(
        &self,
        ctx: &CycleContext,
        position_id: Uuid,
        order_id: &str,
        venue: Venue,
        state: &OrderState,
    ) -> Result<(), CoreError> {
        let Some(mut position) = self.positions.get_position(position_id).await? else {
            return Ok(());
        };
        if position.status != PositionStatus::SingleLegExposed || position.has_leg_on(venue) {
            return Ok(());
        }

        let leg = OrderRef {
            order_id: order_id.to_string(),
            venue,
            fill_price: state.fill_price,
            fill_size: state.fill_size,
        };
        self.bus.publish(
            ctx,
            EngineEvent::OrderFilled {
                order_id: leg.order_id.clone(),
                venue,
                contract_id: position.pair_key.clone(),
                fill_price: leg.fill_price.unwrap_or(Decimal::ZERO),
                fill_size: leg.fill_size.unwrap_or(Decimal::ZERO),
            },
        );
        position.leg_b = Some(leg);
        position.status = PositionStatus::Open;
        position.updated_at = self.clock.now_utc();
        self.positions.update_position(&position).await?;
        info!(
            correlation_id = %ctx.correlation_id,
            position_id = %position_id,
            order_id,
            "Single-leg exposure repaired: pending leg had filled"
        );
        Ok(())
    }

    /// Verifies one position's attached legs against the venues.
    async fn verify_position(
        &self,
        ctx: &CycleContext,
        position: &Position,
    ) -> Result<Option<ReconciliationContext>, CoreError> {
        for leg in [&position.leg_a, &position.leg_b].into_iter().flatten() {
            let state = match self.query_order(leg.venue, &leg.order_id).await {
                Ok(state) => state,
                Err(e) => {
                    debug!(
                        correlation_id = %ctx.correlation_id,
                        position_id = %position.position_id,
                        order_id = %leg.order_id,
                        error = %e,
                        "Venue unavailable during verification"
                    );
                    return Ok(Some(ReconciliationContext {
                        recommended_status: position.status,
                        discrepancy_type: DiscrepancyType::PlatformUnavailable,
                        platform_state: format!("{} unreachable: {e}", leg.venue),
                        detected_at: self.clock.now_utc(),
                    }));
                }
            };

            let local_status = self
                .positions
                .get_order(&leg.order_id)
                .await?
                .map_or(OrderStatus::Filled, |record| record.status);

            let discrepancy = match (local_status, state.status) {
                (local, platform) if local == platform => None,
                (OrderStatus::Pending, OrderStatus::Filled) => Some((
                    DiscrepancyType::PendingFilled,
                    format!("order {} filled on {}", leg.order_id, leg.venue),
                    position.status,
                )),
                (_, OrderStatus::NotFound) => Some((
                    DiscrepancyType::OrderNotFound,
                    format!("order {} unknown to {}", leg.order_id, leg.venue),
                    recommend_for_missing(position, leg.venue),
                )),
                (_, platform) => Some((
                    DiscrepancyType::OrderStatusMismatch,
                    format!(
                        "order {} is {:?} on {} but {:?} locally",
                        leg.order_id, platform, leg.venue, local_status
                    ),
                    recommend_for_missing(position, leg.venue),
                )),
            };

            if let Some((discrepancy_type, platform_state, recommended_status)) = discrepancy {
                return Ok(Some(ReconciliationContext {
                    recommended_status,
                    discrepancy_type,
                    platform_state,
                    detected_at: self.clock.now_utc(),
                }));
            }
        }
        Ok(None)
    }

    async fn query_order(&self, venue: Venue, order_id: &str) -> Result<OrderState, CoreError> {
        tokio::time::timeout(
            self.config.call_budget,
            self.clients.get(venue).get_order(order_id),
        )
        .await
        .map_err(|_| CoreError::Timeout {
            operation: format!("get_order {order_id} on {venue}"),
        })?
    }
}

/// Recommended status when one leg is effectively missing on a venue: the
/// surviving leg leaves single-sided exposure; no surviving leg leaves
/// nothing to hold open.
fn recommend_for_missing(position: &Position, missing_venue: Venue) -> PositionStatus {
    let surviving = [&position.leg_a, &position.leg_b]
        .into_iter()
        .flatten()
        .filter(|leg| leg.venue != missing_venue)
        .count();
    if surviving >= 1 {
        PositionStatus::SingleLegExposed
    } else {
        PositionStatus::Closed
    }
}
