//! Polling scheduler: the periodic trading cycle and its out-of-band tasks.
//!
//! Single-threaded cooperative: the tick handler is re-entrant-guarded, so a
//! cycle that overruns its interval makes the next tick log and return.
//! Cycles are never concurrent, and cycle N fully completes before cycle
//! N+1 begins. Out-of-band work (the six-hour drift probe and the
//! UTC-midnight reset) yields to an in-progress cycle by construction and
//! touches only state the cycle does not.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use pm_arb_core::config::{MAX_POLLING_INTERVAL_MS, MIN_POLLING_INTERVAL_MS};
use pm_arb_core::{Clock, CycleContext, VenueClients};

use crate::detector::DislocationDetector;
use crate::drift::DriftProbe;
use crate::edge::EdgeCalculator;
use crate::health::HealthTracker;
use crate::queue::ExecutionQueue;
use crate::risk::RiskManager;

/// Period of the out-of-band drift probe.
const DRIFT_PROBE_PERIOD: Duration = Duration::from_secs(6 * 60 * 60);
/// Poll interval while draining in-flight work at shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    (now + chrono::Duration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time of day")
        .and_utc()
}

/// Drives periodic trading cycles and the out-of-band probes.
pub struct Scheduler {
    interval_ms: u64,
    detector: DislocationDetector,
    edge: EdgeCalculator,
    queue: ExecutionQueue,
    risk: Arc<RiskManager>,
    health: Arc<HealthTracker>,
    clients: VenueClients,
    drift: Arc<DriftProbe>,
    clock: Arc<dyn Clock>,
    cycle_in_progress: AtomicBool,
    shutdown: AtomicBool,
    in_flight: AtomicU32,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("interval_ms", &self.interval_ms)
            .field("cycle_in_progress", &self.is_cycle_in_progress())
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler. The polling interval is validated into
    /// `[1000, 300000]` milliseconds.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        polling_interval_ms: u64,
        detector: DislocationDetector,
        edge: EdgeCalculator,
        queue: ExecutionQueue,
        risk: Arc<RiskManager>,
        health: Arc<HealthTracker>,
        clients: VenueClients,
        drift: Arc<DriftProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            interval_ms: polling_interval_ms
                .clamp(MIN_POLLING_INTERVAL_MS, MAX_POLLING_INTERVAL_MS),
            detector,
            edge,
            queue,
            risk,
            health,
            clients,
            drift,
            clock,
            cycle_in_progress: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            in_flight: AtomicU32::new(0),
        }
    }

    /// Effective polling interval after validation.
    #[must_use]
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// True while a cycle is executing.
    #[must_use]
    pub fn is_cycle_in_progress(&self) -> bool {
        self.cycle_in_progress.load(Ordering::SeqCst)
    }

    /// Refuses new cycles. In-flight work is left to drain.
    pub fn initiate_shutdown(&self) {
        info!("Shutdown initiated; refusing new cycles");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// True once shutdown has been initiated.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Polls in-flight operations every 100 ms until drained or the timeout
    /// elapses. Returns true if fully drained.
    pub async fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        true
    }

    /// Runs the scheduler loop until shutdown. Spawns the six-hour drift
    /// probe and the UTC-midnight reset as side tasks.
    pub async fn run(self: Arc<Self>) {
        info!(interval_ms = self.interval_ms, "Scheduler started");

        let drift_task = tokio::spawn({
            let scheduler = self.clone();
            async move {
                let mut ticker = tokio::time::interval(DRIFT_PROBE_PERIOD);
                // The startup probe already ran; skip the immediate tick.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let ctx = CycleContext::new();
                    let _ = scheduler.drift.run_once(&ctx).await;
                }
            }
        });

        let midnight_task = tokio::spawn({
            let scheduler = self.clone();
            async move {
                loop {
                    let now = scheduler.clock.now_utc();
                    let wait = (next_utc_midnight(now) - now)
                        .to_std()
                        .unwrap_or(Duration::from_secs(1));
                    tokio::time::sleep(wait).await;
                    let ctx = CycleContext::new();
                    scheduler.risk.handle_midnight_reset(&ctx).await;
                }
            }
        });

        let mut ticker = tokio::time::interval(Duration::from_millis(self.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        while !self.is_shutting_down() {
            ticker.tick().await;
            if self.is_shutting_down() {
                break;
            }
            self.run_cycle().await;
        }

        drift_task.abort();
        midnight_task.abort();
        info!("Scheduler stopped");
    }

    /// Runs one trading cycle end-to-end, unless one is already in
    /// progress or shutdown has begun.
    pub async fn run_cycle(&self) {
        if self.is_shutting_down() {
            return;
        }
        if self
            .cycle_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("skipping cycle: previous cycle still in progress");
            return;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let ctx = CycleContext::new();
        debug!(correlation_id = %ctx.correlation_id, "Cycle started");

        self.health.refresh(&ctx, &self.clients).await;
        let detection = self.detector.detect(&ctx).await;

        let mut committed = 0usize;
        let mut actionable = 0usize;
        if !detection.dislocations.is_empty() {
            let enrichment = self.edge.process(&ctx, detection.dislocations).await;
            let mut approved: Vec<_> = enrichment
                .actionable
                .into_iter()
                .filter(|opportunity| self.risk.validate_position(&ctx, opportunity).approved)
                .collect();
            approved.sort_by(|a, b| b.net_edge.cmp(&a.net_edge));
            actionable = approved.len();

            let outcomes = self.queue.process(&ctx, approved).await;
            committed = outcomes.iter().filter(|o| o.committed).count();
        }

        info!(
            correlation_id = %ctx.correlation_id,
            pairs_evaluated = detection.pairs_evaluated,
            pairs_skipped = detection.pairs_skipped,
            actionable,
            committed,
            duration_ms = ctx.elapsed_ms(),
            "Cycle complete"
        );

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.cycle_in_progress.store(false, Ordering::SeqCst);
    }
}
