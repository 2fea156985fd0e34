//! Dislocation detection across the active contract pairs.
//!
//! Invoked once per cycle. For each pair it fetches both venue books and
//! evaluates both directions on the best asks: buying the outcome on one
//! venue and the complementary outcome on the other. The complementary
//! best-ask on a binary book is derived as `1 − best_bid`, so all four book
//! sides must be present for a pair to be evaluated.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use pm_arb_core::{
    Clock, ContractPair, CycleContext, OrderBook, RawDislocation, Venue, VenueClients,
};

use crate::edge::is_true_arbitrage;
use crate::health::HealthTracker;

/// Per-cycle detection summary.
#[derive(Debug, Clone)]
pub struct DetectionReport {
    /// Dislocations found, up to two per pair (one per direction).
    pub dislocations: Vec<RawDislocation>,
    /// Pairs fully evaluated.
    pub pairs_evaluated: u32,
    /// Pairs skipped (degraded venue, fetch error, or empty book side).
    pub pairs_skipped: u32,
    /// Wall-clock duration of the scan.
    pub duration_ms: u64,
}

/// Scans the active pairs for arbitrage dislocations.
pub struct DislocationDetector {
    pairs: Vec<ContractPair>,
    clients: VenueClients,
    health: Arc<HealthTracker>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DislocationDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DislocationDetector")
            .field("pairs", &self.pairs.len())
            .finish()
    }
}

impl DislocationDetector {
    /// Creates a detector over the configured pair list.
    #[must_use]
    pub fn new(
        pairs: Vec<ContractPair>,
        clients: VenueClients,
        health: Arc<HealthTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pairs,
            clients,
            health,
            clock,
        }
    }

    /// Runs one detection pass over every active pair.
    pub async fn detect(&self, ctx: &CycleContext) -> DetectionReport {
        let started = Instant::now();
        let mut dislocations = Vec::new();
        let mut pairs_evaluated = 0u32;
        let mut pairs_skipped = 0u32;

        for pair in &self.pairs {
            if self.health.is_degraded(Venue::Polymarket) || self.health.is_degraded(Venue::Kalshi)
            {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    pair = %pair.key(),
                    "Skipping pair: venue degraded"
                );
                pairs_skipped += 1;
                continue;
            }

            let polymarket_book = match self
                .clients
                .get(Venue::Polymarket)
                .get_order_book(&pair.polymarket_id)
                .await
            {
                Ok(book) => book,
                Err(e) => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        pair = %pair.key(),
                        error = %e,
                        "Polymarket book fetch failed; skipping pair"
                    );
                    pairs_skipped += 1;
                    continue;
                }
            };
            let kalshi_book = match self
                .clients
                .get(Venue::Kalshi)
                .get_order_book(&pair.kalshi_id)
                .await
            {
                Ok(book) => book,
                Err(e) => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        pair = %pair.key(),
                        error = %e,
                        "Kalshi book fetch failed; skipping pair"
                    );
                    pairs_skipped += 1;
                    continue;
                }
            };

            if !polymarket_book.is_two_sided() || !kalshi_book.is_two_sided() {
                trace!(
                    correlation_id = %ctx.correlation_id,
                    pair = %pair.key(),
                    "Skipping pair: one-sided book"
                );
                pairs_skipped += 1;
                continue;
            }

            pairs_evaluated += 1;

            // Both directions may emit independently in the same cycle.
            if let Some(d) = self.check_direction(ctx, pair, &polymarket_book, &kalshi_book) {
                dislocations.push(d);
            }
            if let Some(d) = self.check_direction(ctx, pair, &kalshi_book, &polymarket_book) {
                dislocations.push(d);
            }
        }

        DetectionReport {
            dislocations,
            pairs_evaluated,
            pairs_skipped,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Evaluates one direction: buy the outcome at the buy venue's best ask,
    /// buy the complement at `1 − best_bid` on the sell venue.
    fn check_direction(
        &self,
        ctx: &CycleContext,
        pair: &ContractPair,
        buy_book: &OrderBook,
        sell_book: &OrderBook,
    ) -> Option<RawDislocation> {
        let buy_price = buy_book.best_ask()?.price;
        let sell_price = rust_decimal::Decimal::ONE - sell_book.best_bid()?.price;

        if !is_true_arbitrage(buy_price, sell_price) {
            trace!(
                correlation_id = %ctx.correlation_id,
                pair = %pair.key(),
                buy_venue = %buy_book.venue,
                buy_price = %buy_price,
                sell_price = %sell_price,
                "No dislocation in this direction"
            );
            return None;
        }

        let dislocation = RawDislocation::new(
            pair.clone(),
            buy_book.venue,
            sell_book.venue,
            buy_price,
            sell_price,
            buy_book.clone(),
            sell_book.clone(),
            self.clock.now_utc(),
        )
        .ok()?;

        if dislocation.gross_edge <= rust_decimal::Decimal::ZERO {
            return None;
        }

        debug!(
            correlation_id = %ctx.correlation_id,
            pair = %pair.key(),
            buy_venue = %dislocation.buy_venue,
            sell_venue = %dislocation.sell_venue,
            buy_price = %dislocation.buy_price,
            sell_price = %dislocation.sell_price,
            gross_edge = %dislocation.gross_edge,
            "Dislocation detected"
        );
        Some(dislocation)
    }
}
