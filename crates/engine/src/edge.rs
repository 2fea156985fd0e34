//! Edge calculation: fees, gas, and filtering of raw dislocations.
//!
//! The math lives in pure stateless functions so properties hold without a
//! calculator instance: complementary symmetry of the gross edge, and a net
//! edge that is monotonically non-increasing in fees and gas.

use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pm_arb_core::decimal::pct;
use pm_arb_core::{
    Clock, CycleContext, EngineEvent, EnrichedOpportunity, EventBus, FeeBreakdown, FilterReason,
    RawDislocation, VenueClients,
};

use crate::health::HealthTracker;

// =============================================================================
// Pure Edge Math
// =============================================================================

/// Gross edge of a candidate dislocation: `|buy − (1 − sell)|`.
///
/// Symmetric under outcome complement: `gross_edge(b, s) ==
/// gross_edge(1 − s, 1 − b)`.
#[must_use]
pub fn gross_edge(buy_price: Decimal, sell_price: Decimal) -> Decimal {
    (buy_price - (Decimal::ONE - sell_price)).abs()
}

/// True iff the prices describe a true arbitrage direction
/// (`buy + sell < 1`, guaranteed positive payoff before costs).
#[must_use]
pub fn is_true_arbitrage(buy_price: Decimal, sell_price: Decimal) -> bool {
    buy_price < Decimal::ONE - sell_price
}

/// Net edge after venue taker fees and amortized gas.
///
/// `position_size_usd` must be positive (validated at config construction).
#[must_use]
pub fn net_edge(
    gross: Decimal,
    buy_price: Decimal,
    sell_price: Decimal,
    buy_taker_pct: Decimal,
    sell_taker_pct: Decimal,
    gas_usd: Decimal,
    position_size_usd: Decimal,
) -> Decimal {
    gross
        - buy_price * pct(buy_taker_pct)
        - sell_price * pct(sell_taker_pct)
        - gas_usd / position_size_usd
}

// =============================================================================
// Edge Calculator
// =============================================================================

/// Static inputs to enrichment.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Minimum net edge required to act.
    pub min_edge_threshold: Decimal,
    /// Estimated gas per two-leg trade, in USD.
    pub gas_estimate_usd: Decimal,
    /// Notional size over which gas is amortized, in USD.
    pub position_size_usd: Decimal,
}

/// Batch summary returned by [`EdgeCalculator::process`].
#[derive(Debug, Clone)]
pub struct EnrichmentReport {
    /// Opportunities that passed all filters, in input order.
    pub actionable: Vec<EnrichedOpportunity>,
    /// Dislocations received.
    pub total_input: u32,
    /// Dislocations dropped by a filter.
    pub total_filtered: u32,
    /// Dislocations that passed.
    pub total_actionable: u32,
    /// Dislocations skipped because a fee lookup failed.
    pub skipped_errors: u32,
    /// Wall-clock duration of the batch.
    pub processing_duration_ms: u64,
}

/// Applies fees, gas, and thresholds to raw dislocations.
pub struct EdgeCalculator {
    clients: VenueClients,
    config: EdgeConfig,
    health: Arc<HealthTracker>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EdgeCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeCalculator")
            .field("config", &self.config)
            .finish()
    }
}

impl EdgeCalculator {
    /// Creates a calculator.
    #[must_use]
    pub fn new(
        clients: VenueClients,
        config: EdgeConfig,
        health: Arc<HealthTracker>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clients,
            config,
            health,
            bus,
            clock,
        }
    }

    /// Enriches a batch of dislocations.
    ///
    /// A dislocation whose fee lookup throws counts toward `skipped_errors`
    /// and the batch continues. Filtered and passing dislocations emit
    /// `opportunity_filtered` / `opportunity_identified` respectively.
    pub async fn process(
        &self,
        ctx: &CycleContext,
        dislocations: Vec<RawDislocation>,
    ) -> EnrichmentReport {
        let started = Instant::now();
        let total_input = dislocations.len() as u32;
        let mut actionable = Vec::new();
        let mut total_filtered = 0u32;
        let mut skipped_errors = 0u32;

        let threshold = self.config.min_edge_threshold * self.health.threshold_multiplier();

        for dislocation in dislocations {
            let buy_schedule = match self
                .clients
                .get(dislocation.buy_venue)
                .get_fee_schedule()
                .await
            {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        venue = %dislocation.buy_venue,
                        error = %e,
                        "Fee lookup failed; skipping dislocation"
                    );
                    skipped_errors += 1;
                    continue;
                }
            };
            let sell_schedule = match self
                .clients
                .get(dislocation.sell_venue)
                .get_fee_schedule()
                .await
            {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        venue = %dislocation.sell_venue,
                        error = %e,
                        "Fee lookup failed; skipping dislocation"
                    );
                    skipped_errors += 1;
                    continue;
                }
            };

            let buy_fee_cost = dislocation.buy_price * pct(buy_schedule.taker_fee_percent);
            let sell_fee_cost = dislocation.sell_price * pct(sell_schedule.taker_fee_percent);
            let gas_fraction = self.config.gas_estimate_usd / self.config.position_size_usd;
            let total_costs = buy_fee_cost + sell_fee_cost + gas_fraction;
            let net = dislocation.gross_edge - total_costs;

            if net < Decimal::ZERO {
                total_filtered += 1;
                self.bus.publish(
                    ctx,
                    EngineEvent::OpportunityFiltered {
                        pair_key: dislocation.pair.key(),
                        reason: FilterReason::NegativeEdge,
                        gross_edge: dislocation.gross_edge,
                        net_edge: net,
                    },
                );
                continue;
            }
            if net < threshold {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    pair = %dislocation.pair.key(),
                    net_edge = %net,
                    threshold = %threshold,
                    "Net edge below threshold"
                );
                total_filtered += 1;
                self.bus.publish(
                    ctx,
                    EngineEvent::OpportunityFiltered {
                        pair_key: dislocation.pair.key(),
                        reason: FilterReason::BelowThreshold,
                        gross_edge: dislocation.gross_edge,
                        net_edge: net,
                    },
                );
                continue;
            }

            // Depth the two legs can actually cross at the quoted prices:
            // buy-venue best ask vs the sell-venue best bid backing the
            // complementary ask.
            let buy_depth = dislocation
                .buy_book
                .best_ask()
                .map_or(Decimal::ZERO, |l| l.quantity);
            let sell_depth = dislocation
                .sell_book
                .best_bid()
                .map_or(Decimal::ZERO, |l| l.quantity);
            let liquidity_depth = buy_depth.min(sell_depth);

            let opportunity = EnrichedOpportunity {
                id: Uuid::new_v4(),
                net_edge: net,
                fees: FeeBreakdown {
                    buy_fee_cost,
                    sell_fee_cost,
                    gas_fraction,
                    total_costs,
                    buy_schedule,
                    sell_schedule,
                },
                liquidity_depth,
                enriched_at: self.clock.now_utc(),
                dislocation,
            };

            info!(
                correlation_id = %ctx.correlation_id,
                opportunity_id = %opportunity.id,
                pair = %opportunity.pair_key(),
                gross_edge = %opportunity.gross_edge(),
                net_edge = %opportunity.net_edge,
                liquidity_depth = %opportunity.liquidity_depth,
                "Opportunity identified"
            );
            self.bus.publish(
                ctx,
                EngineEvent::OpportunityIdentified {
                    opportunity_id: opportunity.id,
                    pair_key: opportunity.pair_key(),
                    buy_venue: opportunity.dislocation.buy_venue,
                    sell_venue: opportunity.dislocation.sell_venue,
                    gross_edge: opportunity.gross_edge(),
                    net_edge: opportunity.net_edge,
                    liquidity_depth: opportunity.liquidity_depth,
                },
            );
            actionable.push(opportunity);
        }

        let total_actionable = actionable.len() as u32;
        EnrichmentReport {
            actionable,
            total_input,
            total_filtered,
            total_actionable,
            skipped_errors,
            processing_duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
