//! Health scoring for the aggregated position.
//!
//! The score starts at 100 and loses budget to impermanent-loss debt and to
//! committed liquidity, each weighted by its pool's coefficient and
//! normalised by the collateral left after debt.

use comet_keeper_core::{AggregatedPosition, KeeperError, Oracle, Pool, Result};
use rust_decimal::Decimal;

const FULL_HEALTH: Decimal = Decimal::ONE_HUNDRED;

/// Decomposed health of the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// 100 is risk-free; at or below zero the position can be liquidated.
    pub health_score: Decimal,
    /// Budget consumed by unrealised impermanent-loss debt.
    pub il_health_impact: Decimal,
    /// Budget consumed by committed liquidity.
    pub position_health_impact: Decimal,
    /// Collateral net of impermanent-loss debt.
    pub effective_collateral_value: Decimal,
}

impl HealthReport {
    #[must_use]
    pub fn is_liquidatable(&self) -> bool {
        self.health_score <= Decimal::ZERO
    }
}

fn find_pool(pools: &[Pool], index: u8) -> Result<&Pool> {
    pools
        .iter()
        .find(|p| p.index == index)
        .ok_or(KeeperError::MissingPool { pool_index: index })
}

fn find_price(oracles: &[Oracle], index: u8) -> Result<Decimal> {
    oracles
        .iter()
        .find(|o| o.index == index)
        .ok_or(KeeperError::MissingOracle { oracle_index: index })?
        .price()
}

/// Scores `position` against the pool and oracle records.
///
/// # Errors
/// Returns `MissingPool` or `MissingOracle` if an entry references a record
/// that is not present.
pub fn compute_health_score(
    position: &AggregatedPosition,
    pools: &[Pool],
    oracles: &[Oracle],
) -> Result<HealthReport> {
    let mut il_raw = Decimal::ZERO;
    let mut position_raw = Decimal::ZERO;
    let mut debt = Decimal::ZERO;

    for entry in &position.entries {
        let pool = find_pool(pools, entry.pool_index)?;
        let price = find_price(oracles, pool.oracle_index)?;
        let ild = entry.ild_value(price).max(Decimal::ZERO);

        debt += ild;
        il_raw += ild * pool.il_health_score_coefficient;
        position_raw += entry.committed_collateral_liquidity * pool.position_health_score_coefficient;
    }

    let effective = position.collateral - debt;
    if effective <= Decimal::ZERO {
        return Ok(HealthReport {
            health_score: Decimal::ZERO,
            il_health_impact: FULL_HEALTH,
            position_health_impact: Decimal::ZERO,
            effective_collateral_value: effective,
        });
    }

    let il_health_impact = il_raw / effective;
    let position_health_impact = position_raw / effective;
    Ok(HealthReport {
        health_score: FULL_HEALTH - il_health_impact - position_health_impact,
        il_health_impact,
        position_health_impact,
        effective_collateral_value: effective,
    })
}
