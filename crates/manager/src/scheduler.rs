//! Control loop scheduler.
//!
//! Each cycle: pick up config changes, drain push updates, re-read the
//! ledger, then either drain redemptions or rebalance. Never both in the
//! same cycle, and never two cycles at once. Every cycle ends in exactly one
//! structured log line.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use comet_keeper_core::{
    AppConfig, BackoffConfig, KeeperError, LedgerReader, LedgerSubmitter, ManagerConfig, Result,
};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::batch::BatchBuilder;
use crate::planner::{plan_rebalance, RebalanceParams};
use crate::redemption::{process_redemptions, RedemptionParams};
use crate::risk::compute_health_score;
use crate::state_cache::StateCache;

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    NoOp,
    Rebalanced { actions: usize },
    Redeemed { count: usize },
    Failed { kind: &'static str },
}

impl CycleOutcome {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NoOp => "no_op",
            Self::Rebalanced { .. } => "rebalanced",
            Self::Redeemed { .. } => "redeemed",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "no-op"),
            Self::Rebalanced { actions } => write!(f, "rebalanced {actions}"),
            Self::Redeemed { count } => write!(f, "redeemed {count}"),
            Self::Failed { kind } => write!(f, "error {kind}"),
        }
    }
}

/// Delay added after `failures` consecutive submission failures.
#[must_use]
pub fn backoff_delay(config: &BackoffConfig, failures: u32) -> Option<Duration> {
    if !config.enabled || failures == 0 {
        return None;
    }
    let exponent = (failures - 1).min(16);
    let secs = config
        .base_secs
        .saturating_mul(1u64 << exponent)
        .min(config.max_secs);
    Some(Duration::from_secs(secs))
}

/// The single writer driving the managed position.
pub struct ControlLoop<L> {
    ledger: Arc<L>,
    cache: StateCache,
    batches: BatchBuilder,
    config: ManagerConfig,
    backoff: BackoffConfig,
    config_updates: Option<watch::Receiver<AppConfig>>,
    consecutive_failures: u32,
}

impl<L> ControlLoop<L>
where
    L: LedgerReader + LedgerSubmitter,
{
    #[must_use]
    pub fn new(
        ledger: Arc<L>,
        cache: StateCache,
        batches: BatchBuilder,
        config: ManagerConfig,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            ledger,
            cache,
            batches,
            config,
            backoff,
            config_updates: None,
            consecutive_failures: 0,
        }
    }

    /// Applies tunables from `updates` at the start of each cycle.
    #[must_use]
    pub fn with_config_updates(mut self, updates: watch::Receiver<AppConfig>) -> Self {
        self.config_updates = Some(updates);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn apply_config_updates(&mut self) {
        let Some(updates) = self.config_updates.as_mut() else {
            return;
        };
        if !updates.has_changed().unwrap_or(false) {
            return;
        }
        let next = updates.borrow_and_update().clone();
        if next.manager.owner != self.config.owner {
            warn!(
                current = %self.config.owner,
                requested = %next.manager.owner,
                "Manager owner cannot change at runtime, keeping current"
            );
        }
        let owner = std::mem::take(&mut self.config.owner);
        self.config = ManagerConfig {
            owner,
            ..next.manager
        };
        self.backoff = next.failure_backoff;
        info!(
            target_health_score = %self.config.target_health_score,
            rebalance_threshold = %self.config.rebalance_threshold,
            max_redemptions = self.config.max_redemptions_per_cycle,
            poll_secs = self.config.poll_interval_secs,
            "Applied configuration update"
        );
    }

    async fn cycle(&mut self) -> Result<CycleOutcome> {
        self.apply_config_updates();
        self.cache.drain();
        self.cache.refresh(self.ledger.as_ref()).await?;
        let snapshot = self.cache.snapshot()?;

        let redemption = RedemptionParams {
            max_per_cycle: self.config.max_redemptions_per_cycle,
            target_health_score: self.config.target_health_score,
            threshold: self.config.rebalance_threshold,
            collateral_decimals: self.config.collateral_decimals,
            net_value_tolerance: self.config.net_value_tolerance,
        };
        if let Some(count) =
            process_redemptions(self.ledger.as_ref(), &self.batches, &snapshot, &redemption).await?
        {
            return Ok(CycleOutcome::Redeemed { count });
        }

        let health = compute_health_score(&snapshot.position, &snapshot.pools, &snapshot.oracles)?;
        if health.is_liquidatable() {
            warn!(
                health_score = %health.health_score,
                effective_collateral = %health.effective_collateral_value,
                "Position at liquidation risk"
            );
        }

        let seeds: Vec<u8> = self
            .config
            .seed_pools
            .iter()
            .copied()
            .filter(|&index| match snapshot.pool(index) {
                Ok(_) => true,
                Err(_) => {
                    warn!(pool = index, "Configured pool not on ledger, not seeding");
                    false
                }
            })
            .collect();
        let position = snapshot.position.with_seeded_pools(&seeds);
        let params = RebalanceParams::new(
            self.config.target_health_score,
            &health,
            snapshot.position.collateral,
            self.config.rebalance_threshold,
        );
        let mut plan = plan_rebalance(&position, &snapshot.pools, &params)?;
        if snapshot.manager.is_closing() {
            plan = plan.without_additions();
        }
        for shortfall in &plan.shortfalls {
            warn!(
                pool = shortfall.pool_index,
                requested = %shortfall.requested,
                available = %shortfall.available,
                "Rebalance withdrawal deferred"
            );
        }
        if plan.is_noop() {
            return Ok(CycleOutcome::NoOp);
        }

        let actions = plan.actions.len();
        let batch = self.batches.build(plan.actions, &snapshot)?;
        let receipt = self.ledger.submit(&batch).await?;
        info!(
            actions,
            health_score = %health.health_score,
            revision = receipt.revision,
            "Rebalance submitted"
        );
        Ok(CycleOutcome::Rebalanced { actions })
    }

    /// Runs a single cycle. Errors are logged and folded into the outcome.
    pub async fn run_once(&mut self) -> CycleOutcome {
        let started = Instant::now();
        let result = self.cycle().await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(outcome) => {
                self.consecutive_failures = 0;
                info!(outcome = outcome.label(), summary = %outcome, elapsed_ms, "Cycle complete");
                outcome
            }
            Err(e) => {
                if e.is_submission_failure() {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                }
                log_failure(&e, elapsed_ms, self.consecutive_failures);
                CycleOutcome::Failed { kind: e.kind() }
            }
        }
    }

    /// Runs cycles on the configured interval until the process is stopped.
    pub async fn run(mut self) {
        info!(
            poll_secs = self.config.poll_interval_secs,
            target_health_score = %self.config.target_health_score,
            rebalance_threshold = %self.config.rebalance_threshold,
            max_redemptions = self.config.max_redemptions_per_cycle,
            backoff = self.backoff.enabled,
            "Comet keeper started"
        );

        let mut poll_secs = self.config.poll_interval_secs;
        let mut interval = interval_at(Instant::now(), Duration::from_secs(poll_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.run_once().await;

            if let Some(delay) = backoff_delay(&self.backoff, self.consecutive_failures) {
                warn!(
                    failures = self.consecutive_failures,
                    delay_secs = delay.as_secs(),
                    "Backing off after repeated submission failures"
                );
                tokio::time::sleep(delay).await;
            }

            if self.config.poll_interval_secs != poll_secs {
                poll_secs = self.config.poll_interval_secs;
                let period = Duration::from_secs(poll_secs);
                interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }
    }
}

fn log_failure(e: &KeeperError, elapsed_ms: u64, failures: u32) {
    error!(
        outcome = "failed",
        kind = e.kind(),
        retryable = e.is_retryable(),
        consecutive_failures = failures,
        elapsed_ms,
        error = %e,
        "Cycle failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(enabled: bool) -> BackoffConfig {
        BackoffConfig {
            enabled,
            base_secs: 5,
            max_secs: 60,
        }
    }

    #[test]
    fn backoff_is_off_by_default() {
        assert_eq!(backoff_delay(&BackoffConfig::default(), 3), None);
        assert_eq!(backoff_delay(&backoff(false), 3), None);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = backoff(true);
        assert_eq!(backoff_delay(&config, 0), None);
        assert_eq!(backoff_delay(&config, 1), Some(Duration::from_secs(5)));
        assert_eq!(backoff_delay(&config, 3), Some(Duration::from_secs(20)));
        assert_eq!(backoff_delay(&config, 10), Some(Duration::from_secs(60)));
        assert_eq!(backoff_delay(&config, u32::MAX), Some(Duration::from_secs(60)));
    }

    #[test]
    fn outcomes_render_for_logs() {
        assert_eq!(CycleOutcome::NoOp.to_string(), "no-op");
        assert_eq!(CycleOutcome::Redeemed { count: 3 }.to_string(), "redeemed 3");
        assert_eq!(
            CycleOutcome::Failed { kind: "stale_price" }.label(),
            "failed"
        );
    }
}
