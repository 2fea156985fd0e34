//! Sequential execution queue for approved opportunities.
//!
//! Opportunities are processed strictly one at a time, even though each
//! involves two network calls: this avoids correlated capital
//! over-allocation and keeps single-leg recovery simple.
//!
//! Per-opportunity state machine:
//!
//! ```text
//!             reserve_budget() FAILED
//!    READY ───────────────────────────▶ SKIPPED
//!      │ reserve OK
//!      ▼
//!   RESERVED ── leg-A failed ──▶ RELEASED
//!      │ leg-A filled
//!      ▼
//!   LEG_A_FILLED ── leg-B failed ──▶ SINGLE_LEG_EXPOSED
//!      │ leg-B filled                  (position persisted exposed,
//!      ▼                               alert, reservation released)
//!   BOTH_FILLED ──▶ COMMITTED
//! ```
//!
//! A pending submit is polled at a fixed interval under a hard cap; on
//! timeout the order is left pending on the venue and treated as not
//! filled. The exposed leg is never auto-retried.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pm_arb_core::{
    Clock, CycleContext, EngineEvent, EnrichedOpportunity, EventBus, OrderRecord, OrderRef,
    OrderRequest, OrderStatus, OrderType, Outcome, Position, PositionStatus, PositionStore,
    SubmitStatus, VenueClients,
};

use crate::risk::{ReserveRequest, RiskManager};

// =============================================================================
// Configuration
// =============================================================================

/// Execution-queue tunables.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Notional targeted per position, in USD.
    pub position_size_usd: Decimal,
    /// Interval between fill polls for a pending order.
    pub fill_poll_interval: Duration,
    /// Hard cap on the fill poll.
    pub fill_poll_timeout: Duration,
}

impl QueueConfig {
    /// Creates a config with the standard 500 ms / 5 s poll bounds.
    #[must_use]
    pub fn new(position_size_usd: Decimal) -> Self {
        Self {
            position_size_usd,
            fill_poll_interval: Duration::from_millis(500),
            fill_poll_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of processing one opportunity.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Opportunity this outcome is for.
    pub opportunity_id: Uuid,
    /// True iff both legs filled and the reservation was committed.
    pub committed: bool,
    /// Reason when not committed.
    pub reason: Option<String>,
}

/// Outcome of submitting one leg, after any pending poll.
#[derive(Debug)]
enum LegOutcome {
    /// The leg filled.
    Filled(OrderRef),
    /// The order is still pending on the venue at the poll deadline.
    Pending { order_id: String },
    /// Terminal failure (rejected, failed, or client error).
    Failed {
        order_id: Option<String>,
        reason: String,
    },
}

// =============================================================================
// Execution Queue
// =============================================================================

/// Processes approved opportunities strictly sequentially.
pub struct ExecutionQueue {
    clients: VenueClients,
    risk: Arc<RiskManager>,
    positions: Arc<dyn PositionStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("config", &self.config)
            .finish()
    }
}

impl ExecutionQueue {
    /// Creates a queue.
    #[must_use]
    pub fn new(
        clients: VenueClients,
        risk: Arc<RiskManager>,
        positions: Arc<dyn PositionStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            clients,
            risk,
            positions,
            bus,
            clock,
            config,
        }
    }

    /// Processes a batch of opportunities, sorted by net edge descending by
    /// the caller. At most one opportunity is in flight at a time.
    pub async fn process(
        &self,
        ctx: &CycleContext,
        opportunities: Vec<EnrichedOpportunity>,
    ) -> Vec<ExecutionOutcome> {
        let mut outcomes = Vec::with_capacity(opportunities.len());
        for opportunity in opportunities {
            let outcome = self.execute_one(ctx, &opportunity).await;
            if outcome.committed {
                info!(
                    correlation_id = %ctx.correlation_id,
                    opportunity_id = %outcome.opportunity_id,
                    "Opportunity committed"
                );
            } else {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    opportunity_id = %outcome.opportunity_id,
                    reason = outcome.reason.as_deref().unwrap_or(""),
                    "Opportunity not committed"
                );
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn execute_one(
        &self,
        ctx: &CycleContext,
        opportunity: &EnrichedOpportunity,
    ) -> ExecutionOutcome {
        let reservation = match self
            .risk
            .reserve_budget(
                ctx,
                ReserveRequest {
                    opportunity_id: opportunity.id,
                    recommended_size: self.config.position_size_usd,
                },
            )
            .await
        {
            Ok(reservation) => reservation,
            Err(e) => {
                return ExecutionOutcome {
                    opportunity_id: opportunity.id,
                    committed: false,
                    reason: Some(e.to_string()),
                };
            }
        };

        // Whole share-pairs purchasable with the reserved capital, capped by
        // what the books can cross.
        let combined_cost = opportunity.dislocation.combined_cost();
        let quantity = (reservation.reserved_capital / combined_cost)
            .floor()
            .min(opportunity.liquidity_depth.floor());
        if quantity <= Decimal::ZERO {
            self.release(ctx, reservation.reservation_id).await;
            return ExecutionOutcome {
                opportunity_id: opportunity.id,
                committed: false,
                reason: Some("no executable size at reserved capital".to_string()),
            };
        }

        let (first_request, second_request) = self.build_legs(opportunity, quantity);
        let position_id = Uuid::new_v4();

        let first_leg = match self.submit_leg(ctx, &first_request).await {
            LegOutcome::Filled(leg) => {
                self.store_order(&first_request, &leg.order_id, OrderStatus::Filled, Some(position_id), leg.fill_price, leg.fill_size)
                    .await;
                self.emit_fill(ctx, &first_request, &leg);
                leg
            }
            LegOutcome::Pending { order_id } => {
                self.store_order(&first_request, &order_id, OrderStatus::Pending, None, None, None)
                    .await;
                self.release(ctx, reservation.reservation_id).await;
                return ExecutionOutcome {
                    opportunity_id: opportunity.id,
                    committed: false,
                    reason: Some(format!(
                        "first leg unresolved at fill deadline (order {order_id} left pending)"
                    )),
                };
            }
            LegOutcome::Failed { order_id, reason } => {
                if let Some(order_id) = order_id {
                    self.store_order(&first_request, &order_id, OrderStatus::Rejected, None, None, None)
                        .await;
                }
                self.release(ctx, reservation.reservation_id).await;
                return ExecutionOutcome {
                    opportunity_id: opportunity.id,
                    committed: false,
                    reason: Some(format!("first leg failed: {reason}")),
                };
            }
        };

        match self.submit_leg(ctx, &second_request).await {
            LegOutcome::Filled(second_leg) => {
                self.store_order(&second_request, &second_leg.order_id, OrderStatus::Filled, Some(position_id), second_leg.fill_price, second_leg.fill_size)
                    .await;
                self.emit_fill(ctx, &second_request, &second_leg);

                let now = self.clock.now_utc();
                let position = Position {
                    position_id,
                    pair_key: opportunity.pair_key(),
                    leg_a: Some(first_leg),
                    leg_b: Some(second_leg),
                    status: PositionStatus::Open,
                    reconciliation: None,
                    opened_at: now,
                    updated_at: now,
                };
                if let Err(e) = self.positions.insert_position(&position).await {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        position_id = %position_id,
                        error = %e,
                        "Failed to persist open position"
                    );
                }
                if let Err(e) = self
                    .risk
                    .commit_reservation(ctx, reservation.reservation_id)
                    .await
                {
                    error!(
                        correlation_id = %ctx.correlation_id,
                        error = %e,
                        "Commit failed for a live reservation"
                    );
                }
                ExecutionOutcome {
                    opportunity_id: opportunity.id,
                    committed: true,
                    reason: None,
                }
            }
            LegOutcome::Pending { order_id } => {
                self.store_order(&second_request, &order_id, OrderStatus::Pending, Some(position_id), None, None)
                    .await;
                self.record_exposure(
                    ctx,
                    opportunity,
                    position_id,
                    first_leg,
                    reservation.reservation_id,
                    format!("second leg unresolved at fill deadline (order {order_id})"),
                )
                .await
            }
            LegOutcome::Failed { order_id, reason } => {
                if let Some(order_id) = order_id {
                    self.store_order(&second_request, &order_id, OrderStatus::Rejected, Some(position_id), None, None)
                        .await;
                }
                self.record_exposure(
                    ctx,
                    opportunity,
                    position_id,
                    first_leg,
                    reservation.reservation_id,
                    format!("second leg failed: {reason}"),
                )
                .await
            }
        }
    }

    /// Builds both leg requests, the pair's primary venue first.
    fn build_legs(
        &self,
        opportunity: &EnrichedOpportunity,
        quantity: Decimal,
    ) -> (OrderRequest, OrderRequest) {
        let dislocation = &opportunity.dislocation;
        let buy_leg = OrderRequest {
            contract_id: dislocation
                .pair
                .contract_id(dislocation.buy_venue)
                .to_string(),
            venue: dislocation.buy_venue,
            side: Outcome::Yes,
            quantity,
            price: dislocation.buy_price,
            order_type: OrderType::Limit,
        };
        let sell_leg = OrderRequest {
            contract_id: dislocation
                .pair
                .contract_id(dislocation.sell_venue)
                .to_string(),
            venue: dislocation.sell_venue,
            side: Outcome::No,
            quantity,
            price: dislocation.sell_price,
            order_type: OrderType::Limit,
        };
        if dislocation.pair.primary_leg == sell_leg.venue {
            (sell_leg, buy_leg)
        } else {
            (buy_leg, sell_leg)
        }
    }

    /// Submits one leg and resolves a pending result within the poll cap.
    async fn submit_leg(&self, ctx: &CycleContext, request: &OrderRequest) -> LegOutcome {
        let submission = match self.clients.get(request.venue).submit_order(request).await {
            Ok(submission) => submission,
            Err(e) => {
                return LegOutcome::Failed {
                    order_id: None,
                    reason: e.to_string(),
                };
            }
        };

        match submission.status {
            SubmitStatus::Filled => LegOutcome::Filled(OrderRef {
                order_id: submission.order_id,
                venue: request.venue,
                fill_price: submission.filled_price.or(Some(request.price)),
                fill_size: submission.filled_size.or(Some(request.quantity)),
            }),
            SubmitStatus::Rejected => LegOutcome::Failed {
                order_id: Some(submission.order_id.clone()),
                reason: format!("order {} rejected by {}", submission.order_id, request.venue),
            },
            SubmitStatus::Failed => LegOutcome::Failed {
                order_id: Some(submission.order_id.clone()),
                reason: format!("order {} failed on {}", submission.order_id, request.venue),
            },
            SubmitStatus::Pending => self.poll_fill(ctx, request, submission.order_id).await,
        }
    }

    /// Polls a pending order until it resolves or the cap elapses.
    async fn poll_fill(
        &self,
        ctx: &CycleContext,
        request: &OrderRequest,
        order_id: String,
    ) -> LegOutcome {
        let deadline = tokio::time::Instant::now() + self.config.fill_poll_timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    order_id = %order_id,
                    venue = %request.venue,
                    "Fill poll deadline reached; leaving order pending"
                );
                return LegOutcome::Pending { order_id };
            }
            tokio::time::sleep(self.config.fill_poll_interval).await;

            match self.clients.get(request.venue).get_order(&order_id).await {
                Ok(state) => match state.status {
                    OrderStatus::Filled => {
                        return LegOutcome::Filled(OrderRef {
                            order_id,
                            venue: request.venue,
                            fill_price: state.fill_price.or(Some(request.price)),
                            fill_size: state.fill_size.or(Some(request.quantity)),
                        });
                    }
                    OrderStatus::Cancelled | OrderStatus::Rejected => {
                        return LegOutcome::Failed {
                            order_id: Some(order_id.clone()),
                            reason: format!("order {order_id} terminal: {:?}", state.status),
                        };
                    }
                    OrderStatus::Pending | OrderStatus::NotFound => {}
                },
                Err(e) => {
                    // Transient while polling; the cap bounds total wait.
                    debug!(
                        correlation_id = %ctx.correlation_id,
                        order_id = %order_id,
                        error = %e,
                        "Fill poll error"
                    );
                }
            }
        }
    }

    /// Persists the exposed position, alerts, and releases the reservation.
    async fn record_exposure(
        &self,
        ctx: &CycleContext,
        opportunity: &EnrichedOpportunity,
        position_id: Uuid,
        filled_leg: OrderRef,
        reservation_id: Uuid,
        failure: String,
    ) -> ExecutionOutcome {
        error!(
            correlation_id = %ctx.correlation_id,
            position_id = %position_id,
            pair = %opportunity.pair_key(),
            filled_order = %filled_leg.order_id,
            failure = %failure,
            "Single-leg exposure"
        );

        let now = self.clock.now_utc();
        let position = Position {
            position_id,
            pair_key: opportunity.pair_key(),
            leg_a: Some(filled_leg),
            leg_b: None,
            status: PositionStatus::SingleLegExposed,
            reconciliation: None,
            opened_at: now,
            updated_at: now,
        };
        if let Err(e) = self.positions.insert_position(&position).await {
            warn!(
                correlation_id = %ctx.correlation_id,
                position_id = %position_id,
                error = %e,
                "Failed to persist exposed position"
            );
        }

        self.bus.publish(
            ctx,
            EngineEvent::SystemHealthCritical {
                component: "execution".to_string(),
                detail: format!(
                    "single-leg exposure on {}: {failure}",
                    opportunity.pair_key()
                ),
            },
        );
        self.release(ctx, reservation_id).await;

        ExecutionOutcome {
            opportunity_id: opportunity.id,
            committed: false,
            reason: Some(format!("single-leg exposure: {failure}")),
        }
    }

    async fn release(&self, ctx: &CycleContext, reservation_id: Uuid) {
        if let Err(e) = self.risk.release_reservation(ctx, reservation_id).await {
            error!(
                correlation_id = %ctx.correlation_id,
                reservation_id = %reservation_id,
                error = %e,
                "Release failed for a live reservation"
            );
        }
    }

    async fn store_order(
        &self,
        request: &OrderRequest,
        order_id: &str,
        status: OrderStatus,
        position_id: Option<Uuid>,
        fill_price: Option<Decimal>,
        fill_size: Option<Decimal>,
    ) {
        let record = OrderRecord {
            order_id: order_id.to_string(),
            venue: request.venue,
            position_id,
            side: request.side,
            price: fill_price.unwrap_or(request.price),
            quantity: fill_size.unwrap_or(request.quantity),
            status,
            created_at: self.clock.now_utc(),
        };
        if let Err(e) = self.positions.insert_order(&record).await {
            warn!(order_id = %order_id, error = %e, "Failed to persist order record");
        }
    }

    fn emit_fill(&self, ctx: &CycleContext, request: &OrderRequest, leg: &OrderRef) {
        self.bus.publish(
            ctx,
            EngineEvent::OrderFilled {
                order_id: leg.order_id.clone(),
                venue: leg.venue,
                contract_id: request.contract_id.clone(),
                fill_price: leg.fill_price.unwrap_or(request.price),
                fill_size: leg.fill_size.unwrap_or(request.quantity),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, VecDeque};

    use pm_arb_core::{
        ContractPair, CoreError, FeeBreakdown, FeeSchedule, HaltReason, HealthStatus, OrderBook,
        OrderState, OrderSubmission, PriceLevel, RawDislocation, SystemClock, TradingMode, Venue,
        VenueClient, VenueHealth,
    };
    use pm_arb_store::MemoryStore;

    use crate::risk::RiskLimits;

    // ==================== Scripted Venue ====================

    #[derive(Debug, Clone)]
    enum SubmitScript {
        Fill,
        Reject,
        ClientError,
        PendingThenFill { polls: u32 },
        PendingForever,
    }

    struct ExecVenue {
        venue: Venue,
        scripts: Mutex<VecDeque<SubmitScript>>,
        submitted: Mutex<Vec<OrderRequest>>,
        order_states: Mutex<HashMap<String, VecDeque<OrderState>>>,
        next_id: Mutex<u32>,
    }

    impl ExecVenue {
        fn new(venue: Venue, scripts: Vec<SubmitScript>) -> Arc<Self> {
            Arc::new(Self {
                venue,
                scripts: Mutex::new(scripts.into()),
                submitted: Mutex::new(Vec::new()),
                order_states: Mutex::new(HashMap::new()),
                next_id: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl VenueClient for ExecVenue {
        fn venue(&self) -> Venue {
            self.venue
        }

        async fn get_health(&self) -> pm_arb_core::Result<VenueHealth> {
            Ok(VenueHealth {
                venue: self.venue,
                status: HealthStatus::Healthy,
                mode: TradingMode::Paper,
            })
        }

        async fn get_fee_schedule(&self) -> pm_arb_core::Result<FeeSchedule> {
            Ok(FeeSchedule {
                taker_fee_percent: dec!(2),
                maker_fee_percent: Decimal::ZERO,
            })
        }

        async fn get_order_book(&self, _contract_id: &str) -> pm_arb_core::Result<OrderBook> {
            Err(CoreError::platform(self.venue, "not scripted"))
        }

        async fn submit_order(
            &self,
            request: &OrderRequest,
        ) -> pm_arb_core::Result<OrderSubmission> {
            self.submitted.lock().push(request.clone());
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(SubmitScript::Fill);
            let order_id = {
                let mut next = self.next_id.lock();
                *next += 1;
                format!("{}-{}", self.venue.as_str().to_lowercase(), next)
            };
            match script {
                SubmitScript::Fill => Ok(OrderSubmission {
                    order_id,
                    status: SubmitStatus::Filled,
                    filled_price: Some(request.price),
                    filled_size: Some(request.quantity),
                }),
                SubmitScript::Reject => Ok(OrderSubmission {
                    order_id,
                    status: SubmitStatus::Rejected,
                    filled_price: None,
                    filled_size: None,
                }),
                SubmitScript::ClientError => {
                    Err(CoreError::platform(self.venue, "gateway timeout"))
                }
                SubmitScript::PendingThenFill { polls } => {
                    let mut states = VecDeque::new();
                    for _ in 0..polls {
                        states.push_back(OrderState {
                            status: OrderStatus::Pending,
                            fill_price: None,
                            fill_size: None,
                        });
                    }
                    states.push_back(OrderState {
                        status: OrderStatus::Filled,
                        fill_price: Some(request.price),
                        fill_size: Some(request.quantity),
                    });
                    self.order_states.lock().insert(order_id.clone(), states);
                    Ok(OrderSubmission {
                        order_id,
                        status: SubmitStatus::Pending,
                        filled_price: None,
                        filled_size: None,
                    })
                }
                SubmitScript::PendingForever => {
                    self.order_states
                        .lock()
                        .insert(order_id.clone(), VecDeque::new());
                    Ok(OrderSubmission {
                        order_id,
                        status: SubmitStatus::Pending,
                        filled_price: None,
                        filled_size: None,
                    })
                }
            }
        }

        async fn get_order(&self, order_id: &str) -> pm_arb_core::Result<OrderState> {
            let mut states = self.order_states.lock();
            let queue = states
                .get_mut(order_id)
                .ok_or_else(|| CoreError::platform(self.venue, "unknown order"))?;
            Ok(queue.pop_front().unwrap_or(OrderState {
                status: OrderStatus::Pending,
                fill_price: None,
                fill_size: None,
            }))
        }
    }

    // ==================== Helper Functions ====================

    fn pair(primary: Venue) -> ContractPair {
        ContractPair {
            polymarket_id: "0xpoly1".to_string(),
            kalshi_id: "KXTEST-1".to_string(),
            event_description: "Test".to_string(),
            verification_timestamp: Utc::now(),
            primary_leg: primary,
        }
    }

    fn book(venue: Venue, bid: Decimal, ask: Decimal, depth: Decimal) -> OrderBook {
        OrderBook {
            venue,
            contract_id: "c".to_string(),
            bids: vec![PriceLevel {
                price: bid,
                quantity: depth,
            }],
            asks: vec![PriceLevel {
                price: ask,
                quantity: depth,
            }],
            timestamp: Utc::now(),
        }
    }

    fn opportunity(primary: Venue) -> EnrichedOpportunity {
        let dislocation = RawDislocation::new(
            pair(primary),
            Venue::Polymarket,
            Venue::Kalshi,
            dec!(0.52),
            dec!(0.45),
            book(Venue::Polymarket, dec!(0.51), dec!(0.52), dec!(100)),
            book(Venue::Kalshi, dec!(0.55), dec!(0.56), dec!(100)),
            Utc::now(),
        )
        .unwrap();
        EnrichedOpportunity {
            id: Uuid::new_v4(),
            net_edge: dec!(0.008),
            fees: FeeBreakdown {
                buy_fee_cost: dec!(0.0104),
                sell_fee_cost: dec!(0.009),
                gas_fraction: dec!(0.0026),
                total_costs: dec!(0.022),
                buy_schedule: FeeSchedule {
                    taker_fee_percent: dec!(2),
                    maker_fee_percent: Decimal::ZERO,
                },
                sell_schedule: FeeSchedule {
                    taker_fee_percent: dec!(2),
                    maker_fee_percent: Decimal::ZERO,
                },
            },
            liquidity_depth: dec!(100),
            enriched_at: Utc::now(),
            dislocation,
        }
    }

    struct Fixture {
        queue: ExecutionQueue,
        risk: Arc<RiskManager>,
        store: Arc<MemoryStore>,
        poly: Arc<ExecVenue>,
        kalshi: Arc<ExecVenue>,
        bus: EventBus,
    }

    fn fixture(poly_scripts: Vec<SubmitScript>, kalshi_scripts: Vec<SubmitScript>) -> Fixture {
        fixture_with_limits(poly_scripts, kalshi_scripts, 10)
    }

    fn fixture_with_limits(
        poly_scripts: Vec<SubmitScript>,
        kalshi_scripts: Vec<SubmitScript>,
        max_open_pairs: u32,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::default();
        let risk = Arc::new(
            RiskManager::new(
                RiskLimits {
                    bankroll: dec!(10000),
                    max_position_pct: dec!(0.03),
                    max_open_pairs,
                    daily_loss_pct: dec!(0.05),
                },
                store.clone(),
                bus.clone(),
                Arc::new(SystemClock),
            )
            .unwrap(),
        );
        let poly = ExecVenue::new(Venue::Polymarket, poly_scripts);
        let kalshi = ExecVenue::new(Venue::Kalshi, kalshi_scripts);
        let mut config = QueueConfig::new(dec!(50));
        config.fill_poll_interval = Duration::from_millis(10);
        config.fill_poll_timeout = Duration::from_millis(100);
        let queue = ExecutionQueue::new(
            VenueClients::new(poly.clone(), kalshi.clone()).unwrap(),
            risk.clone(),
            store.clone(),
            bus.clone(),
            Arc::new(SystemClock),
            config,
        );
        Fixture {
            queue,
            risk,
            store,
            poly,
            kalshi,
            bus,
        }
    }

    // ==================== State Machine Tests ====================

    #[tokio::test]
    async fn test_both_legs_fill_commits_position() {
        let f = fixture(vec![SubmitScript::Fill], vec![SubmitScript::Fill]);
        let ctx = CycleContext::new();

        let outcomes = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].committed);

        let snapshot = f.risk.snapshot();
        assert_eq!(snapshot.open_position_count, 1);
        assert_eq!(snapshot.total_capital_deployed, dec!(50));
        assert_eq!(snapshot.reserved_capital, Decimal::ZERO);

        let positions = f.store.list_active_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Open);
        assert!(positions[0].leg_a.is_some());
        assert!(positions[0].leg_b.is_some());
    }

    #[tokio::test]
    async fn test_quantity_is_whole_share_pairs() {
        let f = fixture(vec![SubmitScript::Fill], vec![SubmitScript::Fill]);
        let ctx = CycleContext::new();

        let _ = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        // floor(50 / 0.97) = 51 share-pairs.
        let submitted = f.poly.submitted.lock();
        assert_eq!(submitted[0].quantity, dec!(51));
    }

    #[tokio::test]
    async fn test_reservation_failure_skips_without_submitting() {
        let f = fixture(vec![SubmitScript::Fill], vec![SubmitScript::Fill]);
        let ctx = CycleContext::new();
        f.risk.halt_trading(&ctx, HaltReason::Manual).await;

        let outcomes = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        assert!(!outcomes[0].committed);
        assert!(outcomes[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("BUDGET_RESERVATION_FAILED"));
        assert!(f.poly.submitted.lock().is_empty());
        assert!(f.kalshi.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_first_leg_rejection_releases_reservation() {
        let f = fixture(vec![SubmitScript::Reject], vec![SubmitScript::Fill]);
        let ctx = CycleContext::new();

        let outcomes = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        assert!(!outcomes[0].committed);
        assert!(outcomes[0].reason.as_deref().unwrap().contains("first leg"));

        // Reservation fully released; second leg never attempted.
        let snapshot = f.risk.snapshot();
        assert_eq!(snapshot.reserved_capital, Decimal::ZERO);
        assert_eq!(snapshot.open_position_count, 0);
        assert!(f.kalshi.submitted.lock().is_empty());
        assert!(f.store.list_active_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_leg_client_error_releases_reservation() {
        let f = fixture(vec![SubmitScript::ClientError], vec![SubmitScript::Fill]);
        let ctx = CycleContext::new();

        let outcomes = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        assert!(!outcomes[0].committed);
        assert_eq!(f.risk.snapshot().reserved_capital, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_first_leg_pending_timeout_releases() {
        let f = fixture(vec![SubmitScript::PendingForever], vec![SubmitScript::Fill]);
        let ctx = CycleContext::new();

        let outcomes = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        assert!(!outcomes[0].committed);
        assert!(outcomes[0].reason.as_deref().unwrap().contains("pending"));
        assert_eq!(f.risk.snapshot().reserved_capital, Decimal::ZERO);

        // Order left pending locally for startup reconciliation.
        let pending = f.store.list_pending_orders().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].venue, Venue::Polymarket);
    }

    #[tokio::test]
    async fn test_second_leg_failure_records_single_leg_exposure() {
        let f = fixture(vec![SubmitScript::Fill], vec![SubmitScript::Reject]);
        let mut rx = f.bus.subscribe();
        let ctx = CycleContext::new();

        let outcomes = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        assert!(!outcomes[0].committed);
        assert!(outcomes[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("single-leg exposure"));

        let positions = f.store.list_active_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::SingleLegExposed);
        assert!(positions[0].leg_a.is_some());
        assert!(positions[0].leg_b.is_none());

        // Reservation released, nothing committed.
        let snapshot = f.risk.snapshot();
        assert_eq!(snapshot.reserved_capital, Decimal::ZERO);
        assert_eq!(snapshot.open_position_count, 0);

        let mut names = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            names.push(envelope.event.name());
        }
        assert!(names.contains(&"system_health_critical"));
        assert!(names.contains(&"budget_released"));
    }

    #[tokio::test]
    async fn test_second_leg_pending_timeout_is_exposure() {
        let f = fixture(
            vec![SubmitScript::Fill],
            vec![SubmitScript::PendingForever],
        );
        let ctx = CycleContext::new();

        let outcomes = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        assert!(!outcomes[0].committed);
        let positions = f.store.list_active_positions().await.unwrap();
        assert_eq!(positions[0].status, PositionStatus::SingleLegExposed);

        // The pending second-leg order is linked to the exposed position so
        // reconciliation can attach it if it filled after all.
        let pending = f.store.list_pending_orders().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].position_id, Some(positions[0].position_id));
    }

    #[tokio::test]
    async fn test_pending_then_fill_within_cap_commits() {
        let f = fixture(
            vec![SubmitScript::Fill],
            vec![SubmitScript::PendingThenFill { polls: 2 }],
        );
        let ctx = CycleContext::new();

        let outcomes = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Polymarket)])
            .await;

        assert!(outcomes[0].committed);
        assert_eq!(f.risk.snapshot().open_position_count, 1);
    }

    #[tokio::test]
    async fn test_primary_leg_submitted_first() {
        let f = fixture(vec![SubmitScript::Fill], vec![SubmitScript::Fill]);
        let ctx = CycleContext::new();

        // Pair designates Kalshi as the primary leg; the Kalshi (sell) leg
        // must go out before the Polymarket (buy) leg.
        let _ = f
            .queue
            .process(&ctx, vec![opportunity(Venue::Kalshi)])
            .await;

        assert_eq!(f.kalshi.submitted.lock().len(), 1);
        assert_eq!(f.poly.submitted.lock().len(), 1);
        {
            let submitted = f.kalshi.submitted.lock();
            assert_eq!(submitted[0].side, Outcome::No);
            assert_eq!(submitted[0].price, dec!(0.45));
        }

        let positions = f.store.list_active_positions().await.unwrap();
        assert_eq!(
            positions[0].leg_a.as_ref().unwrap().venue,
            Venue::Kalshi
        );
    }

    #[tokio::test]
    async fn test_sequential_processing_respects_slot_limit() {
        let f = fixture_with_limits(
            vec![SubmitScript::Fill, SubmitScript::Fill],
            vec![SubmitScript::Fill, SubmitScript::Fill],
            1,
        );
        let ctx = CycleContext::new();

        let outcomes = f
            .queue
            .process(
                &ctx,
                vec![opportunity(Venue::Polymarket), opportunity(Venue::Polymarket)],
            )
            .await;

        assert!(outcomes[0].committed);
        assert!(!outcomes[1].committed);
        assert!(outcomes[1]
            .reason
            .as_deref()
            .unwrap()
            .contains("max open pairs"));
        assert_eq!(f.risk.snapshot().open_position_count, 1);
    }
}
