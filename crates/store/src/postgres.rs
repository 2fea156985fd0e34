//! Postgres-backed store.
//!
//! Owns three surfaces: the `risk_state` singleton row (crash recovery
//! only), the append-only `risk_override_log`, and the position/order rows
//! read back by startup reconciliation. Queries use the runtime sqlx API;
//! the schema lives in `migrations/0001_init.sql`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use pm_arb_core::{
    CoreError, OrderRecord, OrderStatus, OverrideAuditRecord, PersistedRiskState, Position,
    PositionStore, RiskStateStore,
};

fn pg_err(e: sqlx::Error) -> CoreError {
    CoreError::Persistence(e.to_string())
}

fn json_err(e: serde_json::Error) -> CoreError {
    CoreError::Persistence(format!("encode/decode: {e}"))
}

/// Serializes a unit enum to its snake_case tag.
fn enum_to_str<T: Serialize>(value: &T) -> Result<String, CoreError> {
    match serde_json::to_value(value).map_err(json_err)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(CoreError::Persistence(format!(
            "expected string tag, got {other}"
        ))),
    }
}

/// Parses a snake_case tag back into a unit enum.
fn enum_from_str<T: DeserializeOwned>(tag: &str) -> Result<T, CoreError> {
    serde_json::from_value(serde_json::Value::String(tag.to_string())).map_err(json_err)
}

fn parse_uuid(raw: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(raw).map_err(|e| CoreError::Persistence(format!("bad uuid {raw}: {e}")))
}

/// sqlx-backed implementation of the persistence contracts.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to Postgres.
    ///
    /// # Errors
    /// Returns [`CoreError::Persistence`] if the pool cannot be created.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(pg_err)?;
        info!(max_connections, "Connected to Postgres");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema DDL. Idempotent.
    ///
    /// # Errors
    /// Returns [`CoreError::Persistence`] on DDL failure.
    pub async fn ensure_schema(&self) -> Result<(), CoreError> {
        sqlx::raw_sql(include_str!("../migrations/0001_init.sql"))
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    fn row_to_position(row: &sqlx::postgres::PgRow) -> Result<Position, CoreError> {
        let position_id: String = row.try_get("position_id").map_err(pg_err)?;
        let status: String = row.try_get("status").map_err(pg_err)?;
        let leg_a: Option<serde_json::Value> = row.try_get("leg_a").map_err(pg_err)?;
        let leg_b: Option<serde_json::Value> = row.try_get("leg_b").map_err(pg_err)?;
        let reconciliation: Option<serde_json::Value> =
            row.try_get("reconciliation").map_err(pg_err)?;
        Ok(Position {
            position_id: parse_uuid(&position_id)?,
            pair_key: row.try_get("pair_key").map_err(pg_err)?,
            leg_a: leg_a
                .map(serde_json::from_value)
                .transpose()
                .map_err(json_err)?,
            leg_b: leg_b
                .map(serde_json::from_value)
                .transpose()
                .map_err(json_err)?,
            status: enum_from_str(&status)?,
            reconciliation: reconciliation
                .map(serde_json::from_value)
                .transpose()
                .map_err(json_err)?,
            opened_at: row.try_get("opened_at").map_err(pg_err)?,
            updated_at: row.try_get("updated_at").map_err(pg_err)?,
        })
    }

    fn row_to_order(row: &sqlx::postgres::PgRow) -> Result<OrderRecord, CoreError> {
        let venue: String = row.try_get("venue").map_err(pg_err)?;
        let side: String = row.try_get("side").map_err(pg_err)?;
        let status: String = row.try_get("status").map_err(pg_err)?;
        let position_id: Option<String> = row.try_get("position_id").map_err(pg_err)?;
        Ok(OrderRecord {
            order_id: row.try_get("order_id").map_err(pg_err)?,
            venue: enum_from_str(&venue)?,
            position_id: position_id.as_deref().map(parse_uuid).transpose()?,
            side: enum_from_str(&side)?,
            price: row.try_get("price").map_err(pg_err)?,
            quantity: row.try_get("quantity").map_err(pg_err)?,
            status: enum_from_str(&status)?,
            created_at: row.try_get("created_at").map_err(pg_err)?,
        })
    }
}

#[async_trait]
impl RiskStateStore for PgStore {
    async fn load(&self) -> pm_arb_core::Result<Option<PersistedRiskState>> {
        let row = sqlx::query(
            "SELECT bankroll, daily_pnl, open_position_count, total_capital_deployed, \
             reserved_capital, reserved_slots, last_reset_timestamp, active_halt_reasons, \
             updated_at FROM risk_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        // Route through JSON so the halt-reason compat decoding (array or
        // legacy single string) applies uniformly.
        let halt_reasons: serde_json::Value =
            row.try_get("active_halt_reasons").map_err(pg_err)?;
        let state = serde_json::from_value(serde_json::json!({
            "bankroll": row.try_get::<Decimal, _>("bankroll").map_err(pg_err)?,
            "daily_pnl": row.try_get::<Decimal, _>("daily_pnl").map_err(pg_err)?,
            "open_position_count": row.try_get::<i32, _>("open_position_count").map_err(pg_err)?,
            "total_capital_deployed":
                row.try_get::<Decimal, _>("total_capital_deployed").map_err(pg_err)?,
            "reserved_capital": row.try_get::<Decimal, _>("reserved_capital").map_err(pg_err)?,
            "reserved_slots": row.try_get::<i32, _>("reserved_slots").map_err(pg_err)?,
            "last_reset_timestamp":
                row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>("last_reset_timestamp")
                    .map_err(pg_err)?,
            "active_halt_reasons": halt_reasons,
            "updated_at": row.try_get::<chrono::DateTime<chrono::Utc>, _>("updated_at")
                .map_err(pg_err)?,
        }))
        .map_err(json_err)?;
        Ok(Some(state))
    }

    async fn save(&self, state: &PersistedRiskState) -> pm_arb_core::Result<()> {
        sqlx::query(
            "INSERT INTO risk_state (id, bankroll, daily_pnl, open_position_count, \
             total_capital_deployed, reserved_capital, reserved_slots, last_reset_timestamp, \
             active_halt_reasons, updated_at) \
             VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET \
             bankroll = EXCLUDED.bankroll, \
             daily_pnl = EXCLUDED.daily_pnl, \
             open_position_count = EXCLUDED.open_position_count, \
             total_capital_deployed = EXCLUDED.total_capital_deployed, \
             reserved_capital = EXCLUDED.reserved_capital, \
             reserved_slots = EXCLUDED.reserved_slots, \
             last_reset_timestamp = EXCLUDED.last_reset_timestamp, \
             active_halt_reasons = EXCLUDED.active_halt_reasons, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(state.bankroll)
        .bind(state.daily_pnl)
        .bind(state.open_position_count as i32)
        .bind(state.total_capital_deployed)
        .bind(state.reserved_capital)
        .bind(state.reserved_slots as i32)
        .bind(state.last_reset_timestamp)
        .bind(serde_json::to_value(&state.active_halt_reasons).map_err(json_err)?)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn append_override(&self, record: &OverrideAuditRecord) -> pm_arb_core::Result<()> {
        sqlx::query(
            "INSERT INTO risk_override_log \
             (opportunity_id, approved, rationale, halt_reasons, max_position_size, decided_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.opportunity_id.to_string())
        .bind(record.approved)
        .bind(&record.rationale)
        .bind(serde_json::to_value(&record.halt_reasons_at_decision).map_err(json_err)?)
        .bind(record.max_position_size)
        .bind(record.decided_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for PgStore {
    async fn insert_position(&self, position: &Position) -> pm_arb_core::Result<()> {
        sqlx::query(
            "INSERT INTO positions \
             (position_id, pair_key, leg_a, leg_b, status, reconciliation, opened_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(position.position_id.to_string())
        .bind(&position.pair_key)
        .bind(
            position
                .leg_a
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(json_err)?,
        )
        .bind(
            position
                .leg_b
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(json_err)?,
        )
        .bind(enum_to_str(&position.status)?)
        .bind(
            position
                .reconciliation
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(json_err)?,
        )
        .bind(position.opened_at)
        .bind(position.updated_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> pm_arb_core::Result<()> {
        let result = sqlx::query(
            "UPDATE positions SET pair_key = $2, leg_a = $3, leg_b = $4, status = $5, \
             reconciliation = $6, updated_at = $7 WHERE position_id = $1",
        )
        .bind(position.position_id.to_string())
        .bind(&position.pair_key)
        .bind(
            position
                .leg_a
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(json_err)?,
        )
        .bind(
            position
                .leg_b
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(json_err)?,
        )
        .bind(enum_to_str(&position.status)?)
        .bind(
            position
                .reconciliation
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(json_err)?,
        )
        .bind(position.updated_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Persistence(format!(
                "unknown position {}",
                position.position_id
            )));
        }
        Ok(())
    }

    async fn get_position(&self, position_id: Uuid) -> pm_arb_core::Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE position_id = $1")
            .bind(position_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;
        row.as_ref().map(Self::row_to_position).transpose()
    }

    async fn list_active_positions(&self) -> pm_arb_core::Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE status != 'closed' ORDER BY opened_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.iter().map(Self::row_to_position).collect()
    }

    async fn insert_order(&self, order: &OrderRecord) -> pm_arb_core::Result<()> {
        sqlx::query(
            "INSERT INTO orders \
             (order_id, venue, position_id, side, price, quantity, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (order_id) DO UPDATE SET status = EXCLUDED.status, \
             position_id = EXCLUDED.position_id, price = EXCLUDED.price, \
             quantity = EXCLUDED.quantity",
        )
        .bind(&order.order_id)
        .bind(enum_to_str(&order.venue)?)
        .bind(order.position_id.map(|id| id.to_string()))
        .bind(enum_to_str(&order.side)?)
        .bind(order.price)
        .bind(order.quantity)
        .bind(enum_to_str(&order.status)?)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        fill_price: Option<Decimal>,
        fill_size: Option<Decimal>,
    ) -> pm_arb_core::Result<()> {
        let result = sqlx::query(
            "UPDATE orders SET status = $2, price = COALESCE($3, price), \
             quantity = COALESCE($4, quantity) WHERE order_id = $1",
        )
        .bind(order_id)
        .bind(enum_to_str(&status)?)
        .bind(fill_price)
        .bind(fill_size)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Persistence(format!("unknown order {order_id}")));
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> pm_arb_core::Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM orders WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?;
        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn list_pending_orders(&self) -> pm_arb_core::Result<Vec<OrderRecord>> {
        let rows =
            sqlx::query("SELECT * FROM orders WHERE status = 'pending' ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(pg_err)?;
        rows.iter().map(Self::row_to_order).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_arb_core::{HaltReason, PositionStatus, Venue};

    // Pool-backed paths are covered by integration environments with a live
    // Postgres; these tests pin the tag mappings the schema relies on.

    #[test]
    fn test_enum_tags_match_schema_literals() {
        assert_eq!(enum_to_str(&PositionStatus::Closed).unwrap(), "closed");
        assert_eq!(
            enum_to_str(&PositionStatus::ReconciliationRequired).unwrap(),
            "reconciliation_required"
        );
        assert_eq!(enum_to_str(&OrderStatus::Pending).unwrap(), "pending");
        assert_eq!(enum_to_str(&Venue::Polymarket).unwrap(), "polymarket");
    }

    #[test]
    fn test_enum_round_trip() {
        let status: OrderStatus = enum_from_str("cancelled").unwrap();
        assert_eq!(status, OrderStatus::Cancelled);
        let venue: Venue = enum_from_str("kalshi").unwrap();
        assert_eq!(venue, Venue::Kalshi);
        assert!(enum_from_str::<Venue>("nasdaq").is_err());
    }

    #[test]
    fn test_halt_reason_array_encoding() {
        let value =
            serde_json::to_value(vec![HaltReason::DailyLossLimit, HaltReason::ClockDrift])
                .unwrap();
        assert_eq!(
            value,
            serde_json::json!(["daily_loss_limit", "clock_drift"])
        );
    }

    #[test]
    fn test_uuid_parse_guard() {
        assert!(parse_uuid("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_uuid(&id.to_string()).unwrap(), id);
    }
}
