//! Deterministic paper venue client.
//!
//! Implements the venue capability against in-memory state: scripted order
//! books, a configurable fee schedule, health toggles, and an order ledger.
//! Used by the CLI's paper mode and by integration tests. No network, no
//! randomness beyond order-id assignment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use pm_arb_core::{
    CoreError, FeeSchedule, HealthStatus, OrderBook, OrderRequest, OrderState, OrderStatus,
    OrderSubmission, PriceLevel, SubmitStatus, TradingMode, Venue, VenueClient, VenueHealth,
};

/// How the paper venue answers `submit_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillBehavior {
    /// Fill immediately at the requested price and size.
    Fill,
    /// Accept the order and report it filled after N `get_order` polls.
    Pending {
        /// Polls answered `pending` before the fill appears.
        resolve_after_polls: u32,
    },
    /// Reject the order.
    Reject,
    /// Fail the submission at the client layer.
    Fail,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    state: OrderState,
    polls_until_fill: Option<u32>,
}

/// A scriptable in-memory venue.
pub struct PaperVenue {
    venue: Venue,
    books: Mutex<HashMap<String, OrderBook>>,
    fee_schedule: Mutex<FeeSchedule>,
    health: Mutex<HealthStatus>,
    fill_behavior: Mutex<FillBehavior>,
    orders: Mutex<HashMap<String, PaperOrder>>,
    submitted: Mutex<Vec<OrderRequest>>,
    latency: Mutex<Option<std::time::Duration>>,
    book_fetches: AtomicU32,
    next_id: AtomicU32,
}

impl std::fmt::Debug for PaperVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperVenue")
            .field("venue", &self.venue)
            .finish()
    }
}

impl PaperVenue {
    /// Creates a healthy paper venue with a 2% taker fee and immediate fills.
    #[must_use]
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            books: Mutex::new(HashMap::new()),
            fee_schedule: Mutex::new(FeeSchedule {
                taker_fee_percent: dec!(2),
                maker_fee_percent: Decimal::ZERO,
            }),
            health: Mutex::new(HealthStatus::Healthy),
            fill_behavior: Mutex::new(FillBehavior::Fill),
            orders: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            book_fetches: AtomicU32::new(0),
            next_id: AtomicU32::new(0),
        }
    }

    /// Adds a simulated round-trip delay to every call.
    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock() = Some(latency);
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Installs a one-level book for a contract.
    pub fn set_book(&self, contract_id: &str, bid: Decimal, ask: Decimal, depth: Decimal) {
        self.books.lock().insert(
            contract_id.to_string(),
            OrderBook {
                venue: self.venue,
                contract_id: contract_id.to_string(),
                bids: vec![PriceLevel {
                    price: bid,
                    quantity: depth,
                }],
                asks: vec![PriceLevel {
                    price: ask,
                    quantity: depth,
                }],
                timestamp: Utc::now(),
            },
        );
    }

    /// Installs a full book snapshot.
    pub fn set_book_snapshot(&self, book: OrderBook) {
        self.books
            .lock()
            .insert(book.contract_id.clone(), book);
    }

    /// Removes a contract's book so fetches fail.
    pub fn clear_book(&self, contract_id: &str) {
        self.books.lock().remove(contract_id);
    }

    /// Replaces the fee schedule.
    pub fn set_fee_schedule(&self, schedule: FeeSchedule) {
        *self.fee_schedule.lock() = schedule;
    }

    /// Sets the reported health status.
    pub fn set_health(&self, status: HealthStatus) {
        *self.health.lock() = status;
    }

    /// Sets how subsequent submissions behave.
    pub fn set_fill_behavior(&self, behavior: FillBehavior) {
        *self.fill_behavior.lock() = behavior;
    }

    /// Orders submitted so far, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.submitted.lock().clone()
    }

    /// Number of book fetches served.
    #[must_use]
    pub fn book_fetch_count(&self) -> u32 {
        self.book_fetches.load(Ordering::SeqCst)
    }

    /// Directly overwrites an order's state in the ledger.
    pub fn resolve_order(&self, order_id: &str, state: OrderState) {
        if let Some(order) = self.orders.lock().get_mut(order_id) {
            order.state = state;
            order.polls_until_fill = None;
        }
    }

    fn next_order_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{n}", self.venue.as_str().to_lowercase())
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn get_health(&self) -> pm_arb_core::Result<VenueHealth> {
        self.simulate_latency().await;
        Ok(VenueHealth {
            venue: self.venue,
            status: *self.health.lock(),
            mode: TradingMode::Paper,
        })
    }

    async fn get_fee_schedule(&self) -> pm_arb_core::Result<FeeSchedule> {
        self.simulate_latency().await;
        Ok(*self.fee_schedule.lock())
    }

    async fn get_order_book(&self, contract_id: &str) -> pm_arb_core::Result<OrderBook> {
        self.simulate_latency().await;
        self.book_fetches.fetch_add(1, Ordering::SeqCst);
        self.books
            .lock()
            .get(contract_id)
            .cloned()
            .ok_or_else(|| CoreError::platform(self.venue, format!("no book for {contract_id}")))
    }

    async fn submit_order(&self, request: &OrderRequest) -> pm_arb_core::Result<OrderSubmission> {
        self.simulate_latency().await;
        self.submitted.lock().push(request.clone());
        let behavior = *self.fill_behavior.lock();
        let order_id = self.next_order_id();
        debug!(
            venue = %self.venue,
            order_id = %order_id,
            contract_id = %request.contract_id,
            side = %request.side,
            price = %request.price,
            quantity = %request.quantity,
            behavior = ?behavior,
            "Paper order submitted"
        );

        let (submission, state, polls) = match behavior {
            FillBehavior::Fill => (
                OrderSubmission {
                    order_id: order_id.clone(),
                    status: SubmitStatus::Filled,
                    filled_price: Some(request.price),
                    filled_size: Some(request.quantity),
                },
                OrderState {
                    status: OrderStatus::Filled,
                    fill_price: Some(request.price),
                    fill_size: Some(request.quantity),
                },
                None,
            ),
            FillBehavior::Pending {
                resolve_after_polls,
            } => (
                OrderSubmission {
                    order_id: order_id.clone(),
                    status: SubmitStatus::Pending,
                    filled_price: None,
                    filled_size: None,
                },
                OrderState {
                    status: OrderStatus::Pending,
                    fill_price: None,
                    fill_size: None,
                },
                Some(resolve_after_polls),
            ),
            FillBehavior::Reject => (
                OrderSubmission {
                    order_id: order_id.clone(),
                    status: SubmitStatus::Rejected,
                    filled_price: None,
                    filled_size: None,
                },
                OrderState {
                    status: OrderStatus::Rejected,
                    fill_price: None,
                    fill_size: None,
                },
                None,
            ),
            FillBehavior::Fail => {
                return Err(CoreError::platform(self.venue, "simulated gateway failure"));
            }
        };

        self.orders.lock().insert(
            order_id,
            PaperOrder {
                request: request.clone(),
                state,
                polls_until_fill: polls,
            },
        );
        Ok(submission)
    }

    async fn get_order(&self, order_id: &str) -> pm_arb_core::Result<OrderState> {
        self.simulate_latency().await;
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(order_id) else {
            return Ok(OrderState {
                status: OrderStatus::NotFound,
                fill_price: None,
                fill_size: None,
            });
        };

        if let Some(remaining) = order.polls_until_fill {
            if remaining == 0 {
                order.state = OrderState {
                    status: OrderStatus::Filled,
                    fill_price: Some(order.request.price),
                    fill_size: Some(order.request.quantity),
                };
                order.polls_until_fill = None;
            } else {
                order.polls_until_fill = Some(remaining - 1);
            }
        }
        Ok(order.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_arb_core::{Outcome, OrderType};

    fn request() -> OrderRequest {
        OrderRequest {
            contract_id: "c1".to_string(),
            venue: Venue::Polymarket,
            side: Outcome::Yes,
            quantity: dec!(50),
            price: dec!(0.52),
            order_type: OrderType::Limit,
        }
    }

    #[tokio::test]
    async fn test_book_round_trip() {
        let venue = PaperVenue::new(Venue::Polymarket);
        venue.set_book("c1", dec!(0.51), dec!(0.52), dec!(100));

        let book = venue.get_order_book("c1").await.unwrap();
        assert_eq!(book.best_bid().unwrap().price, dec!(0.51));
        assert_eq!(book.best_ask().unwrap().price, dec!(0.52));
        assert_eq!(venue.book_fetch_count(), 1);

        assert!(venue.get_order_book("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_immediate_fill() {
        let venue = PaperVenue::new(Venue::Polymarket);
        let submission = venue.submit_order(&request()).await.unwrap();

        assert_eq!(submission.status, SubmitStatus::Filled);
        assert_eq!(submission.filled_price, Some(dec!(0.52)));

        let state = venue.get_order(&submission.order_id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_pending_resolves_after_polls() {
        let venue = PaperVenue::new(Venue::Polymarket);
        venue.set_fill_behavior(FillBehavior::Pending {
            resolve_after_polls: 2,
        });
        let submission = venue.submit_order(&request()).await.unwrap();
        assert_eq!(submission.status, SubmitStatus::Pending);

        let id = &submission.order_id;
        assert_eq!(
            venue.get_order(id).await.unwrap().status,
            OrderStatus::Pending
        );
        assert_eq!(
            venue.get_order(id).await.unwrap().status,
            OrderStatus::Pending
        );
        assert_eq!(
            venue.get_order(id).await.unwrap().status,
            OrderStatus::Filled
        );
    }

    #[tokio::test]
    async fn test_reject_and_fail_behaviors() {
        let venue = PaperVenue::new(Venue::Kalshi);
        venue.set_fill_behavior(FillBehavior::Reject);
        let submission = venue.submit_order(&request()).await.unwrap();
        assert_eq!(submission.status, SubmitStatus::Rejected);

        venue.set_fill_behavior(FillBehavior::Fail);
        assert!(venue.submit_order(&request()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let venue = PaperVenue::new(Venue::Kalshi);
        let state = venue.get_order("ghost").await.unwrap();
        assert_eq!(state.status, OrderStatus::NotFound);
    }

    #[tokio::test]
    async fn test_health_toggle() {
        let venue = PaperVenue::new(Venue::Kalshi);
        assert_eq!(
            venue.get_health().await.unwrap().status,
            HealthStatus::Healthy
        );
        venue.set_health(HealthStatus::Degraded);
        assert_eq!(
            venue.get_health().await.unwrap().status,
            HealthStatus::Degraded
        );
        assert_eq!(venue.get_health().await.unwrap().mode, TradingMode::Paper);
    }
}
