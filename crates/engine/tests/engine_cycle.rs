//! End-to-end cycle tests: paper venues, in-memory store, full engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal_macros::dec;

use pm_arb_core::{
    ContractPair, CycleContext, EngineConfig, HaltReason, NtpConfig, NtpSample, NtpTransport,
    OrderStatus, PositionStatus, PositionStore, SystemClock, Venue,
};
use pm_arb_engine::TradingEngine;
use pm_arb_store::MemoryStore;
use pm_arb_venue_paper::{FillBehavior, PaperVenue};

struct FixedNtp;

#[async_trait]
impl NtpTransport for FixedNtp {
    async fn query(&self, server: &str) -> pm_arb_core::Result<NtpSample> {
        Ok(NtpSample {
            offset_ms: 12,
            server: server.to_string(),
            measured_at: Utc::now(),
        })
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        polling_interval_ms: 1_000,
        bankroll_usd: dec!(10000),
        max_position_pct: dec!(0.03),
        max_open_pairs: 10,
        daily_loss_pct: dec!(0.05),
        min_edge_threshold: dec!(0.008),
        gas_estimate_usd: dec!(0.13),
        position_size_usd: dec!(50),
        degraded_threshold_multiplier: dec!(1.5),
        pairs: vec![ContractPair {
            polymarket_id: "0xpoly1".to_string(),
            kalshi_id: "KXBTC-TEST".to_string(),
            event_description: "BTC above threshold".to_string(),
            verification_timestamp: Utc::now(),
            primary_leg: Venue::Polymarket,
        }],
        ntp: NtpConfig {
            primary: "primary.test".to_string(),
            fallback: "fallback.test".to_string(),
            attempts: 1,
            retry_delay_ms: 1,
        },
        database_url: None,
    }
}

struct Harness {
    engine: TradingEngine,
    store: Arc<MemoryStore>,
    poly: Arc<PaperVenue>,
    kalshi: Arc<PaperVenue>,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let poly = Arc::new(PaperVenue::new(Venue::Polymarket));
    let kalshi = Arc::new(PaperVenue::new(Venue::Kalshi));
    let engine = TradingEngine::new(
        config(),
        poly.clone(),
        kalshi.clone(),
        store.clone(),
        store.clone(),
        Arc::new(FixedNtp),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();
    Harness {
        engine,
        store,
        poly,
        kalshi,
    }
}

#[tokio::test]
async fn full_cycle_commits_a_two_leg_position() {
    let h = harness().await;
    // Polymarket YES ask 0.52; Kalshi bid 0.55 prices the complement at 0.45.
    // Gross edge 0.03, net 0.008 at 2% taker fees and $0.13 gas over $50.
    h.poly.set_book("0xpoly1", dec!(0.51), dec!(0.52), dec!(100));
    h.kalshi.set_book("KXBTC-TEST", dec!(0.55), dec!(0.56), dec!(100));

    h.engine.startup().await.unwrap();
    h.engine.scheduler().run_cycle().await;

    let snapshot = h.engine.risk().snapshot();
    assert_eq!(snapshot.open_position_count, 1);
    assert_eq!(snapshot.total_capital_deployed, dec!(50));
    assert_eq!(snapshot.reserved_capital, dec!(0));
    assert!(!snapshot.trading_halted);

    let positions = h.store.list_active_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    let position = &positions[0];
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.leg_a.as_ref().unwrap().venue, Venue::Polymarket);
    assert_eq!(position.leg_b.as_ref().unwrap().venue, Venue::Kalshi);

    // Both venues saw exactly one order, primary venue first.
    assert_eq!(h.poly.submitted().len(), 1);
    assert_eq!(h.kalshi.submitted().len(), 1);
    assert_eq!(h.poly.submitted()[0].price, dec!(0.52));
    assert_eq!(h.kalshi.submitted()[0].price, dec!(0.45));
}

#[tokio::test]
async fn second_leg_rejection_leaves_exposed_position_and_released_budget() {
    let h = harness().await;
    h.poly.set_book("0xpoly1", dec!(0.51), dec!(0.52), dec!(100));
    h.kalshi.set_book("KXBTC-TEST", dec!(0.55), dec!(0.56), dec!(100));
    h.kalshi.set_fill_behavior(FillBehavior::Reject);

    h.engine.startup().await.unwrap();
    h.engine.scheduler().run_cycle().await;

    let snapshot = h.engine.risk().snapshot();
    assert_eq!(snapshot.open_position_count, 0);
    assert_eq!(snapshot.reserved_capital, dec!(0));

    let positions = h.store.list_active_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].status, PositionStatus::SingleLegExposed);
}

#[tokio::test]
async fn restart_after_exposure_repairs_position_through_reconciliation() {
    // Session one: second leg times out pending, leaving an exposed
    // position and a locally-pending order.
    let h = harness().await;
    h.poly.set_book("0xpoly1", dec!(0.51), dec!(0.52), dec!(100));
    h.kalshi.set_book("KXBTC-TEST", dec!(0.55), dec!(0.56), dec!(100));
    h.kalshi.set_fill_behavior(FillBehavior::Pending {
        resolve_after_polls: 1_000,
    });

    h.engine.startup().await.unwrap();
    h.engine.scheduler().run_cycle().await;

    let exposed = h.store.list_active_positions().await.unwrap();
    assert_eq!(exposed[0].status, PositionStatus::SingleLegExposed);
    let pending = h.store.list_pending_orders().await.unwrap();
    assert_eq!(pending.len(), 1);

    // The venue fills the order after the engine gave up on it.
    h.kalshi.resolve_order(
        &pending[0].order_id,
        pm_arb_core::OrderState {
            status: OrderStatus::Filled,
            fill_price: Some(dec!(0.45)),
            fill_size: Some(pending[0].quantity),
        },
    );

    // Session two: same stores, fresh engine. Startup reconciliation
    // attaches the late fill and reopens the position.
    let engine2 = TradingEngine::new(
        config(),
        h.poly.clone(),
        h.kalshi.clone(),
        h.store.clone(),
        h.store.clone(),
        Arc::new(FixedNtp),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();
    engine2.startup().await.unwrap();

    let repaired = h.store.list_active_positions().await.unwrap();
    assert_eq!(repaired[0].status, PositionStatus::Open);
    assert!(repaired[0].leg_b.is_some());
    assert!(!engine2.risk().is_halted());

    // Budget recalculation picked up the restored position.
    let snapshot = engine2.risk().snapshot();
    assert_eq!(snapshot.open_position_count, 1);
    assert!(snapshot.total_capital_deployed > dec!(0));
}

#[tokio::test]
async fn reconciliation_discrepancy_halts_until_resolved() {
    // Session one commits a clean position.
    let h = harness().await;
    h.poly.set_book("0xpoly1", dec!(0.51), dec!(0.52), dec!(100));
    h.kalshi.set_book("KXBTC-TEST", dec!(0.55), dec!(0.56), dec!(100));
    h.engine.startup().await.unwrap();
    h.engine.scheduler().run_cycle().await;

    // Simulate a fresh process against a Kalshi that lost the order: a new
    // paper venue has no ledger, so the attached order is NotFound.
    let amnesiac_kalshi = Arc::new(PaperVenue::new(Venue::Kalshi));
    let engine2 = TradingEngine::new(
        config(),
        h.poly.clone(),
        amnesiac_kalshi,
        h.store.clone(),
        h.store.clone(),
        Arc::new(FixedNtp),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();
    engine2.startup().await.unwrap();

    assert!(engine2.risk().is_halted());
    assert!(engine2
        .risk()
        .halt_reasons()
        .contains(&HaltReason::ReconciliationDiscrepancy));

    let flagged = h.store.list_active_positions().await.unwrap();
    let flagged_position = flagged
        .iter()
        .find(|p| p.status == PositionStatus::ReconciliationRequired)
        .expect("position flagged");

    // A halted engine refuses work even on crossed books.
    let before = h.poly.submitted().len();
    engine2.scheduler().run_cycle().await;
    assert_eq!(h.poly.submitted().len(), before);

    // Operator acknowledges; the halt lifts.
    engine2
        .reconciler()
        .resolve_discrepancy(
            &CycleContext::new(),
            flagged_position.position_id,
            pm_arb_engine::ResolutionAction::Acknowledge,
            "kalshi support confirmed the fill",
        )
        .await
        .unwrap();
    assert!(!engine2.risk().is_halted());
}

#[tokio::test]
async fn shutdown_drains_cleanly() {
    let h = harness().await;
    h.poly.set_book("0xpoly1", dec!(0.49), dec!(0.51), dec!(100));
    h.kalshi.set_book("KXBTC-TEST", dec!(0.49), dec!(0.51), dec!(100));
    h.engine.startup().await.unwrap();

    h.engine.initiate_shutdown();
    assert!(h.engine.wait_for_shutdown(Duration::from_secs(12)).await);
    h.engine.scheduler().run_cycle().await;
    assert_eq!(h.poly.book_fetch_count(), 0);
}
