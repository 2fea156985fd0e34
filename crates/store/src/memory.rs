//! In-memory store implementing the persistence contracts.
//!
//! Ships as a real module rather than test scaffolding: the CLI's paper
//! mode runs against it, and engine tests use it to exercise the same code
//! paths the Postgres store serves in production.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use pm_arb_core::{
    CoreError, OrderRecord, OrderStatus, OverrideAuditRecord, PersistedRiskState, Position,
    PositionStore, RiskStateStore,
};

/// In-memory risk-state, override-log, and position/order store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    risk_state: Mutex<Option<PersistedRiskState>>,
    override_log: Mutex<Vec<OverrideAuditRecord>>,
    positions: Mutex<HashMap<Uuid, Position>>,
    orders: Mutex<HashMap<String, OrderRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded override decisions, oldest first.
    #[must_use]
    pub fn override_log(&self) -> Vec<OverrideAuditRecord> {
        self.override_log.lock().clone()
    }
}

#[async_trait]
impl RiskStateStore for MemoryStore {
    async fn load(&self) -> pm_arb_core::Result<Option<PersistedRiskState>> {
        Ok(self.risk_state.lock().clone())
    }

    async fn save(&self, state: &PersistedRiskState) -> pm_arb_core::Result<()> {
        *self.risk_state.lock() = Some(state.clone());
        Ok(())
    }

    async fn append_override(&self, record: &OverrideAuditRecord) -> pm_arb_core::Result<()> {
        self.override_log.lock().push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn insert_position(&self, position: &Position) -> pm_arb_core::Result<()> {
        self.positions
            .lock()
            .insert(position.position_id, position.clone());
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> pm_arb_core::Result<()> {
        let mut positions = self.positions.lock();
        if !positions.contains_key(&position.position_id) {
            return Err(CoreError::Persistence(format!(
                "unknown position {}",
                position.position_id
            )));
        }
        positions.insert(position.position_id, position.clone());
        Ok(())
    }

    async fn get_position(&self, position_id: Uuid) -> pm_arb_core::Result<Option<Position>> {
        Ok(self.positions.lock().get(&position_id).cloned())
    }

    async fn list_active_positions(&self) -> pm_arb_core::Result<Vec<Position>> {
        let mut active: Vec<Position> = self
            .positions
            .lock()
            .values()
            .filter(|p| p.status.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|p| p.opened_at);
        Ok(active)
    }

    async fn insert_order(&self, order: &OrderRecord) -> pm_arb_core::Result<()> {
        self.orders
            .lock()
            .insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        fill_price: Option<Decimal>,
        fill_size: Option<Decimal>,
    ) -> pm_arb_core::Result<()> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| CoreError::Persistence(format!("unknown order {order_id}")))?;
        order.status = status;
        if let Some(price) = fill_price {
            order.price = price;
        }
        if let Some(size) = fill_size {
            order.quantity = size;
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> pm_arb_core::Result<Option<OrderRecord>> {
        Ok(self.orders.lock().get(order_id).cloned())
    }

    async fn list_pending_orders(&self) -> pm_arb_core::Result<Vec<OrderRecord>> {
        let mut pending: Vec<OrderRecord> = self
            .orders
            .lock()
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.created_at);
        Ok(pending)
    }
}
