//! Trading engine: explicit construction wiring and lifecycle.
//!
//! Components take their collaborators as constructor arguments; there is
//! no runtime registry. The engine owns the startup sequence — risk-state
//! reload, one-shot drift probe, drift-halt bus subscription, startup
//! reconciliation — and then hands control to the scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use pm_arb_core::{
    Clock, CoreError, CycleContext, EngineConfig, EngineEvent, EventBus, HaltReason, NtpTransport,
    PositionStore, RiskStateStore, VenueClient, VenueClients,
};

use crate::detector::DislocationDetector;
use crate::drift::{DriftProbe, DriftSeverity};
use crate::edge::{EdgeCalculator, EdgeConfig};
use crate::health::HealthTracker;
use crate::queue::{ExecutionQueue, QueueConfig};
use crate::reconcile::{ReconcilerConfig, StartupReconciler};
use crate::risk::{RiskLimits, RiskManager};
use crate::scheduler::Scheduler;

/// The assembled trading control plane.
pub struct TradingEngine {
    scheduler: Arc<Scheduler>,
    reconciler: Arc<StartupReconciler>,
    risk: Arc<RiskManager>,
    drift: Arc<DriftProbe>,
    bus: EventBus,
}

impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine").finish()
    }
}

impl TradingEngine {
    /// Builds the engine: validates config, restores the risk state, and
    /// wires every component.
    ///
    /// # Errors
    /// Fails on invalid configuration or an unreachable risk store.
    pub async fn new(
        config: EngineConfig,
        polymarket: Arc<dyn VenueClient>,
        kalshi: Arc<dyn VenueClient>,
        risk_store: Arc<dyn RiskStateStore>,
        position_store: Arc<dyn PositionStore>,
        ntp: Arc<dyn NtpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        config.validate().map_err(CoreError::from)?;

        let bus = EventBus::default();
        let clients = VenueClients::new(polymarket, kalshi)?;
        let risk = Arc::new(
            RiskManager::restore(
                RiskLimits::from(&config),
                risk_store,
                bus.clone(),
                clock.clone(),
            )
            .await?,
        );
        let health = Arc::new(HealthTracker::new(config.degraded_threshold_multiplier));

        let detector = DislocationDetector::new(
            config.pairs.clone(),
            clients.clone(),
            health.clone(),
            clock.clone(),
        );
        let edge = EdgeCalculator::new(
            clients.clone(),
            EdgeConfig {
                min_edge_threshold: config.min_edge_threshold,
                gas_estimate_usd: config.gas_estimate_usd,
                position_size_usd: config.position_size_usd,
            },
            health.clone(),
            bus.clone(),
            clock.clone(),
        );
        let queue = ExecutionQueue::new(
            clients.clone(),
            risk.clone(),
            position_store.clone(),
            bus.clone(),
            clock.clone(),
            QueueConfig::new(config.position_size_usd),
        );
        let drift = Arc::new(DriftProbe::new(ntp, config.ntp.clone(), bus.clone()));
        let reconciler = Arc::new(StartupReconciler::new(
            clients.clone(),
            position_store,
            risk.clone(),
            bus.clone(),
            clock.clone(),
            ReconcilerConfig::default(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.polling_interval_ms,
            detector,
            edge,
            queue,
            risk.clone(),
            health,
            clients,
            drift.clone(),
            clock,
        ));

        Ok(Self {
            scheduler,
            reconciler,
            risk,
            drift,
            bus,
        })
    }

    /// The event bus shared by every component.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The risk manager.
    #[must_use]
    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    /// The reconciler, for operator discrepancy resolution.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<StartupReconciler> {
        &self.reconciler
    }

    /// The scheduler, for direct cycle control in tests and tooling.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Runs the startup sequence: one-shot drift probe (halting before the
    /// first cycle on severe drift), drift-halt bus subscription, and
    /// startup reconciliation.
    ///
    /// # Errors
    /// Propagates reconciliation store failures; fatal at startup.
    pub async fn startup(&self) -> Result<(), CoreError> {
        let ctx = CycleContext::new();
        if let Some(reading) = self.drift.run_once(&ctx).await {
            if reading.severity == DriftSeverity::Halt {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    drift_ms = reading.offset_ms,
                    "Severe clock drift at startup; halting before first cycle"
                );
                self.risk.halt_trading(&ctx, HaltReason::ClockDrift).await;
            }
        }

        // Explicit halt-on-drift wiring: the probe only publishes; this
        // subscription owns the risk-state reaction.
        let mut rx = self.bus.subscribe();
        let risk = self.risk.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if matches!(envelope.event, EngineEvent::TimeDriftHalt { .. }) {
                            let ctx = CycleContext::new();
                            risk.halt_trading(&ctx, HaltReason::ClockDrift).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Drift-halt subscription lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let ctx = CycleContext::new().with_deadline(chrono::Duration::seconds(60));
        let report = self.reconciler.run(&ctx).await?;
        info!(
            discrepancies = report.discrepancies,
            open_count = report.open_count,
            "Startup sequence complete"
        );
        Ok(())
    }

    /// Runs startup and then the scheduler loop until shutdown.
    ///
    /// # Errors
    /// Propagates startup failures.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.startup().await?;
        self.scheduler.clone().run().await;
        Ok(())
    }

    /// Refuses new cycles.
    pub fn initiate_shutdown(&self) {
        self.scheduler.initiate_shutdown();
    }

    /// Waits for in-flight work to drain, polling at 100 ms.
    pub async fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        self.scheduler.wait_for_shutdown(timeout).await
    }
}
