//! Core types, events, and capability traits for the cross-venue
//! prediction-market arbitrage engine.
//!
//! This crate carries everything the control plane's components agree on:
//!
//! - [`types`]: contract pairs, order books, dislocations, opportunities,
//!   reservations, and the position/order surface
//! - [`decimal`]: exact-decimal helpers for every money path
//! - [`context`]: the per-cycle correlation context
//! - [`config`]: validated engine configuration
//! - [`error`]: the error taxonomy
//! - [`events`]: the event contract and broadcast bus
//! - [`traits`]: capability seams (venue clients, stores, clock, NTP)

pub mod config;
pub mod context;
pub mod decimal;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use config::{ConfigError, EngineConfig, NtpConfig};
pub use context::CycleContext;
pub use error::{CoreError, Result};
pub use events::{EngineEvent, EventBus, EventEnvelope, FilterReason, LimitKind};
pub use traits::{
    Clock, NtpSample, NtpTransport, OverrideAuditRecord, PersistedRiskState, PositionStore,
    RiskStateStore, SystemClock, VenueClient, VenueClients,
};
pub use types::{
    BudgetReservation, ContractPair, DiscrepancyType, EnrichedOpportunity, FeeBreakdown,
    FeeSchedule, HaltReason, HealthStatus, OrderBook, OrderRecord, OrderRef, OrderRequest,
    OrderState, OrderStatus, OrderSubmission, OrderType, Outcome, Position, PositionStatus,
    PriceLevel, RawDislocation, ReconciliationContext, SubmitStatus, TradingMode, Venue,
    VenueHealth,
};
