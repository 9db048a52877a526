//! Off-chain manager for a pooled comet liquidity position.
//!
//! Runs as a long-lived loop that:
//! - Keeps a cache of the manager, position, pool and oracle records
//! - Scores the position's health and values it in collateral terms
//! - Pays queued redemptions, shrinking the position to free collateral
//! - Otherwise rebalances committed liquidity toward a target health score
//!
//! Every change is submitted as one atomic batch; the ledger re-validates
//! each batch, so a stale plan is rejected rather than applied.

pub mod batch;
pub mod planner;
pub mod redemption;
pub mod risk;
pub mod scheduler;
pub mod state_cache;
pub mod valuation;

pub use batch::{BatchBuilder, BatchLimits, BatchSize};
pub use planner::{plan_rebalance, PositionTarget, RebalanceParams, RebalancePlan, Shortfall};
pub use redemption::{
    collateral_owed, plan_redemptions, process_redemptions, select_requests, RedemptionParams,
    RedemptionPlan, SelectedRequest,
};
pub use risk::{compute_health_score, HealthReport};
pub use scheduler::{backoff_delay, ControlLoop, CycleOutcome};
pub use state_cache::{CacheUpdate, Snapshot, StateCache, UPDATE_CHANNEL_CAPACITY};
pub use valuation::{estimate_net_value, refresh_net_value, NetValue};
