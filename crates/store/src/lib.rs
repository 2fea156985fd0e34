//! Persistence collaborators for the arbitrage engine.
//!
//! - [`postgres`]: sqlx-backed store — the `risk_state` singleton row, the
//!   append-only `risk_override_log`, and the position/order views consumed
//!   by startup reconciliation.
//! - [`memory`]: in-memory store with the same contract, used by the paper
//!   mode and tests.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;
