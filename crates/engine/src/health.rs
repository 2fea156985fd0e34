//! Venue degradation tracking.
//!
//! Refreshed at the top of each cycle from `get_health` on both clients.
//! The detector skips pairs while a venue is degraded, and the edge
//! calculator raises its minimum-edge threshold by the configured
//! multiplier to suppress marginal opportunities under impaired data.

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use pm_arb_core::{CycleContext, HealthStatus, Venue, VenueClients};

/// Tracks per-venue health and derives the edge-threshold multiplier.
#[derive(Debug)]
pub struct HealthTracker {
    degraded_multiplier: Decimal,
    statuses: RwLock<HashMap<Venue, HealthStatus>>,
}

impl HealthTracker {
    /// Creates a tracker; both venues start healthy.
    #[must_use]
    pub fn new(degraded_multiplier: Decimal) -> Self {
        let mut statuses = HashMap::new();
        statuses.insert(Venue::Polymarket, HealthStatus::Healthy);
        statuses.insert(Venue::Kalshi, HealthStatus::Healthy);
        Self {
            degraded_multiplier,
            statuses: RwLock::new(statuses),
        }
    }

    /// Polls both clients and updates the tracked statuses. A failed health
    /// call marks the venue disconnected.
    pub async fn refresh(&self, ctx: &CycleContext, clients: &VenueClients) {
        for venue in [Venue::Polymarket, Venue::Kalshi] {
            let status = match clients.get(venue).get_health().await {
                Ok(health) => health.status,
                Err(e) => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        venue = %venue,
                        error = %e,
                        "Health check failed; marking venue disconnected"
                    );
                    HealthStatus::Disconnected
                }
            };
            let previous = self.statuses.write().insert(venue, status);
            if previous != Some(status) {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    venue = %venue,
                    status = ?status,
                    "Venue health changed"
                );
            }
        }
    }

    /// Returns true when the venue is degraded or disconnected.
    #[must_use]
    pub fn is_degraded(&self, venue: Venue) -> bool {
        self.statuses
            .read()
            .get(&venue)
            .is_some_and(|s| *s != HealthStatus::Healthy)
    }

    /// Returns true when the venue is fully unreachable.
    #[must_use]
    pub fn is_disconnected(&self, venue: Venue) -> bool {
        self.statuses
            .read()
            .get(&venue)
            .is_some_and(|s| *s == HealthStatus::Disconnected)
    }

    /// Edge-threshold multiplier: 1.0 normally, raised while any venue is
    /// not healthy.
    #[must_use]
    pub fn threshold_multiplier(&self) -> Decimal {
        let degraded = self
            .statuses
            .read()
            .values()
            .any(|s| *s != HealthStatus::Healthy);
        if degraded {
            self.degraded_multiplier
        } else {
            Decimal::ONE
        }
    }

    /// Directly sets a venue's status. Used by tests and operator tooling.
    pub fn set_status(&self, venue: Venue, status: HealthStatus) {
        self.statuses.write().insert(venue, status);
    }
}
