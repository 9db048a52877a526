//! Rebalance planning.
//!
//! The risk budget left after impermanent-loss debt is split evenly across
//! every entry of the position. Each entry's target size is its share
//! divided by the pool's position coefficient; entries within the threshold
//! of their target are left alone.

use comet_keeper_core::{
    ActionRequest, AddLiquidityRequest, AggregatedPosition, KeeperError, Pool, Result,
    WithdrawLiquidityRequest,
};
use rust_decimal::Decimal;

use crate::risk::HealthReport;

/// Inputs that are not part of the position or pool records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceParams {
    pub target_health_score: Decimal,
    pub il_health_impact: Decimal,
    pub available_collateral: Decimal,
    /// Fraction of the target size below which a delta is ignored.
    pub threshold: Decimal,
}

impl RebalanceParams {
    #[must_use]
    pub fn new(
        target_health_score: Decimal,
        health: &HealthReport,
        available_collateral: Decimal,
        threshold: Decimal,
    ) -> Self {
        Self {
            target_health_score,
            il_health_impact: health.il_health_impact,
            available_collateral,
            threshold,
        }
    }
}

/// Per-entry sizing, kept for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionTarget {
    pub pool_index: u8,
    pub current_size: Decimal,
    pub target_size: Decimal,
    pub delta: Decimal,
}

/// A withdrawal the pool could not cover this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    pub pool_index: u8,
    pub requested: Decimal,
    pub available: Decimal,
}

/// Output of [`plan_rebalance`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    pub actions: Vec<ActionRequest>,
    pub targets: Vec<PositionTarget>,
    pub shortfalls: Vec<Shortfall>,
}

impl RebalancePlan {
    /// No action to submit.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drops every liquidity addition. Used while the manager is closing.
    #[must_use]
    pub fn without_additions(mut self) -> Self {
        self.actions
            .retain(|a| !matches!(a, ActionRequest::AddLiquidity(_)));
        self
    }

    /// Keeps only withdrawals.
    #[must_use]
    pub fn withdrawals(&self) -> Vec<ActionRequest> {
        self.actions
            .iter()
            .filter(|a| matches!(a, ActionRequest::WithdrawLiquidity(_)))
            .cloned()
            .collect()
    }
}

fn find_pool(pools: &[Pool], index: u8) -> Result<&Pool> {
    pools
        .iter()
        .find(|p| p.index == index)
        .ok_or(KeeperError::MissingPool { pool_index: index })
}

/// Computes target sizes for every entry of `position` and the actions that
/// move it there.
///
/// # Errors
/// Returns `MissingPool` if an entry references a pool that is not in `pools`.
pub fn plan_rebalance(
    position: &AggregatedPosition,
    pools: &[Pool],
    params: &RebalanceParams,
) -> Result<RebalancePlan> {
    let mut plan = RebalancePlan::default();
    if position.entries.is_empty() {
        return Ok(plan);
    }

    let target_position_impact = params.target_health_score - params.il_health_impact;
    let per_position_impact = target_position_impact * params.available_collateral
        / Decimal::from(position.entries.len());

    for entry in &position.entries {
        let pool = find_pool(pools, entry.pool_index)?;
        let coefficient = pool.position_health_score_coefficient;
        if coefficient <= Decimal::ZERO {
            tracing::warn!(pool = pool.index, %coefficient, "Pool has no position coefficient, skipping");
            continue;
        }

        let current_size = entry.committed_collateral_liquidity;
        let target_size = (per_position_impact / coefficient).max(Decimal::ZERO);
        let delta = target_size - current_size;
        plan.targets.push(PositionTarget {
            pool_index: pool.index,
            current_size,
            target_size,
            delta,
        });

        if delta.is_zero() {
            continue;
        }
        if target_size > Decimal::ZERO && delta.abs() / target_size <= params.threshold {
            continue;
        }

        if delta > Decimal::ZERO {
            plan.actions.push(ActionRequest::AddLiquidity(AddLiquidityRequest {
                pool_index: pool.index,
                collateral_amount: delta,
            }));
            continue;
        }

        let requested = delta.abs();
        let available = pool.committed_collateral_liquidity.min(current_size);
        if requested > available || pool.committed_collateral_liquidity.is_zero() {
            tracing::warn!(
                pool = pool.index,
                %requested,
                %available,
                "Insufficient pool liquidity, deferring withdrawal"
            );
            plan.shortfalls.push(Shortfall {
                pool_index: pool.index,
                requested,
                available,
            });
            continue;
        }

        let lp_to_withdraw =
            requested * pool.liquidity_token_supply / pool.committed_collateral_liquidity;
        plan.actions.push(ActionRequest::WithdrawLiquidity(WithdrawLiquidityRequest {
            pool_index: pool.index,
            liquidity_token_amount: lp_to_withdraw,
            collateral_amount: requested,
        }));
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_keeper_core::PositionEntry;
    use rust_decimal_macros::dec;

    fn pool(index: u8, coefficient: Decimal) -> Pool {
        Pool {
            index,
            committed_collateral_liquidity: dec!(100000000),
            collateral_ild: Decimal::ZERO,
            synthetic_ild: Decimal::ZERO,
            liquidity_token_supply: dec!(50000000),
            trading_fee_bps: 30,
            position_health_score_coefficient: coefficient,
            il_health_score_coefficient: dec!(1),
            oracle_index: index,
        }
    }

    fn position(sizes: &[(u8, Decimal)]) -> AggregatedPosition {
        AggregatedPosition {
            collateral: dec!(300000),
            entries: sizes
                .iter()
                .map(|&(pool_index, size)| PositionEntry {
                    pool_index,
                    committed_collateral_liquidity: size,
                    collateral_ild: Decimal::ZERO,
                    synthetic_ild: Decimal::ZERO,
                })
                .collect(),
        }
    }

    fn params(available: Decimal, threshold: Decimal) -> RebalanceParams {
        RebalanceParams {
            target_health_score: dec!(90),
            il_health_impact: dec!(10),
            available_collateral: available,
            threshold,
        }
    }

    /// Applies a plan the way the ledger would, for idempotence checks.
    fn apply(position: &AggregatedPosition, pools: &[Pool], plan: &RebalancePlan) -> AggregatedPosition {
        let mut next = position.clone();
        for action in &plan.actions {
            match action {
                ActionRequest::AddLiquidity(r) => {
                    let e = next.entries.iter_mut().find(|e| e.pool_index == r.pool_index).unwrap();
                    e.committed_collateral_liquidity += r.collateral_amount;
                }
                ActionRequest::WithdrawLiquidity(r) => {
                    let p = pools.iter().find(|p| p.index == r.pool_index).unwrap();
                    let e = next.entries.iter_mut().find(|e| e.pool_index == r.pool_index).unwrap();
                    e.committed_collateral_liquidity -= r.liquidity_token_amount
                        * p.committed_collateral_liquidity
                        / p.liquidity_token_supply;
                }
                _ => unreachable!(),
            }
        }
        next
    }

    #[test]
    fn empty_position_without_collateral_plans_nothing() {
        let empty = AggregatedPosition::default();
        let plan = plan_rebalance(&empty, &[pool(0, dec!(1))], &params(Decimal::ZERO, dec!(0.05)))
            .unwrap();
        assert!(plan.is_noop());
        assert!(plan.targets.is_empty());
    }

    #[test]
    fn target_sizes_split_budget_evenly() {
        let pools = [pool(0, dec!(1)), pool(1, dec!(2)), pool(2, dec!(8))];
        let position = position(&[(0, Decimal::ZERO), (1, Decimal::ZERO), (2, Decimal::ZERO)]);
        let plan = plan_rebalance(&position, &pools, &params(dec!(300000), dec!(0.05))).unwrap();

        let targets: Vec<Decimal> = plan.targets.iter().map(|t| t.target_size).collect();
        assert_eq!(targets, vec![dec!(8000000), dec!(4000000), dec!(1000000)]);
        assert_eq!(plan.actions.len(), 3);
        assert!(plan
            .actions
            .iter()
            .all(|a| matches!(a, ActionRequest::AddLiquidity(_))));
    }

    #[test]
    fn deltas_within_threshold_are_skipped() {
        let pools = [pool(0, dec!(1))];
        // target = 80 * 100000 = 8,000,000; 3% away
        let position = position(&[(0, dec!(7760000))]);
        let plan = plan_rebalance(&position, &pools, &params(dec!(100000), dec!(0.05))).unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.targets[0].delta, dec!(240000));
    }

    #[test]
    fn oversized_entries_withdraw_proportional_tokens() {
        let pools = [pool(0, dec!(1))];
        let position = position(&[(0, dec!(10000000))]);
        let plan = plan_rebalance(&position, &pools, &params(dec!(100000), dec!(0.05))).unwrap();

        assert_eq!(
            plan.actions,
            vec![ActionRequest::WithdrawLiquidity(WithdrawLiquidityRequest {
                pool_index: 0,
                liquidity_token_amount: dec!(1000000),
                collateral_amount: dec!(2000000),
            })]
        );
    }

    #[test]
    fn negative_budget_withdraws_everything() {
        let pools = [pool(0, dec!(1))];
        let position = position(&[(0, dec!(5000))]);
        let params = RebalanceParams {
            target_health_score: dec!(10),
            il_health_impact: dec!(20),
            available_collateral: dec!(1000),
            threshold: dec!(0.05),
        };
        let plan = plan_rebalance(&position, &pools, &params).unwrap();
        assert_eq!(plan.targets[0].target_size, Decimal::ZERO);
        assert!(matches!(
            &plan.actions[0],
            ActionRequest::WithdrawLiquidity(r) if r.collateral_amount == dec!(5000)
        ));
    }

    #[test]
    fn withdrawals_beyond_pool_liquidity_become_shortfalls() {
        let mut thin = pool(0, dec!(1));
        thin.committed_collateral_liquidity = dec!(1000);
        let position = position(&[(0, dec!(10000000))]);
        let plan = plan_rebalance(&position, &[thin], &params(dec!(100000), dec!(0.05))).unwrap();

        assert!(plan.is_noop());
        assert_eq!(
            plan.shortfalls,
            vec![Shortfall {
                pool_index: 0,
                requested: dec!(2000000),
                available: dec!(1000),
            }]
        );
    }

    #[test]
    fn second_pass_on_applied_plan_is_noop() {
        let pools = [pool(0, dec!(1)), pool(1, dec!(3)), pool(2, dec!(7))];
        let start = position(&[(0, dec!(100)), (1, dec!(9000000)), (2, Decimal::ZERO)]);
        let p = params(dec!(300000), dec!(0.01));

        let first = plan_rebalance(&start, &pools, &p).unwrap();
        assert!(!first.is_noop());
        let settled = apply(&start, &pools, &first);
        let second = plan_rebalance(&settled, &pools, &p).unwrap();
        assert!(second.is_noop());
    }

    #[test]
    fn closing_plans_keep_only_withdrawals() {
        let pools = [pool(0, dec!(1)), pool(1, dec!(1))];
        let position = position(&[(0, Decimal::ZERO), (1, dec!(99000000))]);
        let plan = plan_rebalance(&position, &pools, &params(dec!(300000), dec!(0.05)))
            .unwrap()
            .without_additions();
        assert_eq!(plan.actions.len(), 1);
        assert!(matches!(plan.actions[0], ActionRequest::WithdrawLiquidity(_)));
    }

    #[test]
    fn unknown_pool_is_an_error() {
        let position = position(&[(9, dec!(1))]);
        let err = plan_rebalance(&position, &[], &params(dec!(1), dec!(0.05))).unwrap_err();
        assert!(matches!(err, KeeperError::MissingPool { pool_index: 9 }));
    }
}
