//! Redemption queue processing.
//!
//! Up to `max_per_cycle` occupied slots are taken in slot order. Each request
//! is owed its pro-rata share of the ledger-confirmed net value; the position
//! is shrunk with a smaller collateral budget so the owed collateral can be
//! withdrawn, and every payout is submitted in the same batch.

use comet_keeper_core::{
    ActionRequest, Address, Batch, KeeperError, LedgerReader, LedgerSubmitter,
    PayRedemptionRequest, RedemptionSlot, Result, WithdrawCollateralRequest,
};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::batch::BatchBuilder;
use crate::planner::{plan_rebalance, RebalanceParams, Shortfall};
use crate::risk::compute_health_score;
use crate::state_cache::Snapshot;
use crate::valuation::{estimate_net_value, refresh_net_value};

/// Tunables for one pass over the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedemptionParams {
    pub max_per_cycle: usize,
    pub target_health_score: Decimal,
    pub threshold: Decimal,
    /// Payouts are rounded down to this many decimals.
    pub collateral_decimals: u32,
    pub net_value_tolerance: Decimal,
}

/// A queued request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRequest {
    pub slot_index: usize,
    pub subscriber: Address,
    pub membership_tokens: Decimal,
}

/// Everything a redemption batch contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionPlan {
    pub withdrawals: Vec<ActionRequest>,
    pub shortfalls: Vec<Shortfall>,
    pub total_collateral: Decimal,
    pub payouts: Vec<PayRedemptionRequest>,
}

impl RedemptionPlan {
    /// Liquidity withdrawals, then one collateral withdrawal, then payouts.
    #[must_use]
    pub fn actions(&self) -> Vec<ActionRequest> {
        let mut actions = self.withdrawals.clone();
        if self.total_collateral > Decimal::ZERO {
            actions.push(ActionRequest::WithdrawCollateral(WithdrawCollateralRequest {
                amount: self.total_collateral,
            }));
        }
        actions.extend(self.payouts.iter().cloned().map(ActionRequest::PayRedemption));
        actions
    }
}

/// `tokens / supply * net_value`, multiplied first to keep precision.
#[must_use]
pub fn collateral_owed(tokens: Decimal, supply: Decimal, net_value: Decimal) -> Decimal {
    if supply.is_zero() {
        return Decimal::ZERO;
    }
    tokens * net_value / supply
}

/// Validates one occupied slot against the subscriber's holdings. Requests
/// the ledger would refuse stay in their slot and are skipped here.
fn eligible(snapshot: &Snapshot, slot_index: usize, slot: &RedemptionSlot) -> Option<SelectedRequest> {
    if slot.membership_tokens <= Decimal::ZERO {
        tracing::warn!(slot = slot_index, "Redemption request for zero tokens, skipping");
        return None;
    }
    let Some(holder) = snapshot.subscriber(&slot.subscriber) else {
        tracing::warn!(slot = slot_index, subscriber = %slot.subscriber, "Unknown subscriber, skipping");
        return None;
    };
    if slot.membership_tokens > holder.membership_tokens {
        tracing::warn!(
            slot = slot_index,
            subscriber = %slot.subscriber,
            requested = %slot.membership_tokens,
            held = %holder.membership_tokens,
            "Redemption exceeds holdings, skipping"
        );
        return None;
    }
    Some(SelectedRequest {
        slot_index,
        subscriber: slot.subscriber,
        membership_tokens: slot.membership_tokens,
    })
}

/// Up to `max` eligible requests, in slot order. Ineligible requests
/// (zero tokens, unknown subscriber, more tokens than held) do not count
/// toward `max`.
#[must_use]
pub fn select_requests(snapshot: &Snapshot, max: usize) -> Vec<SelectedRequest> {
    snapshot
        .manager
        .pending_redemptions()
        .filter_map(|(slot_index, slot)| eligible(snapshot, slot_index, slot))
        .take(max)
        .collect()
}

/// Builds the redemption plan for `requests` at `net_value`.
///
/// # Errors
/// Fails if the snapshot references a missing pool or oracle.
pub fn plan_redemptions(
    snapshot: &Snapshot,
    requests: &[SelectedRequest],
    net_value: Decimal,
    params: &RedemptionParams,
) -> Result<RedemptionPlan> {
    let supply = snapshot.manager.membership_token_supply;
    let payouts: Vec<PayRedemptionRequest> = requests
        .iter()
        .map(|r| PayRedemptionRequest {
            slot_index: r.slot_index,
            subscriber: r.subscriber,
            membership_tokens: r.membership_tokens,
            collateral_amount: collateral_owed(r.membership_tokens, supply, net_value)
                .round_dp_with_strategy(params.collateral_decimals, RoundingStrategy::ToZero),
        })
        .collect();
    let total_collateral: Decimal = payouts.iter().map(|p| p.collateral_amount).sum();

    let health = compute_health_score(&snapshot.position, &snapshot.pools, &snapshot.oracles)?;
    let rebalance = plan_rebalance(
        &snapshot.position,
        &snapshot.pools,
        &RebalanceParams::new(
            params.target_health_score,
            &health,
            snapshot.position.collateral - total_collateral,
            params.threshold,
        ),
    )?;

    Ok(RedemptionPlan {
        withdrawals: rebalance.withdrawals(),
        shortfalls: rebalance.shortfalls,
        total_collateral,
        payouts,
    })
}

/// Plans and assembles a batch for the longest prefix of `requests` that
/// fits, halving the count while the batch is too large.
///
/// # Errors
/// `BatchTooLarge` if even a single request does not fit; planning and
/// assembly errors otherwise.
pub fn fit_redemptions(
    snapshot: &Snapshot,
    batches: &BatchBuilder,
    requests: &[SelectedRequest],
    net_value: Decimal,
    params: &RedemptionParams,
) -> Result<(RedemptionPlan, Batch)> {
    let mut count = requests.len();
    loop {
        let plan = plan_redemptions(snapshot, &requests[..count], net_value, params)?;
        match batches.build(plan.actions(), snapshot) {
            Ok(batch) => return Ok((plan, batch)),
            Err(KeeperError::BatchTooLarge { bytes, accounts, .. }) if count > 1 => {
                tracing::warn!(
                    requests = count,
                    retry_with = count / 2,
                    bytes,
                    accounts,
                    "Redemption batch over limit, shrinking"
                );
                count /= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drains up to `max_per_cycle` requests in one atomic batch.
///
/// The batch is sized against the local net value estimate before the
/// ledger refresh is spent, so a queue that cannot fit fails without any
/// submission. Returns `None` when no request was eligible, otherwise the
/// number of requests paid. A failed submission leaves every slot in place.
///
/// # Errors
/// Propagates net value refresh, planning, batch and submission failures.
pub async fn process_redemptions<L>(
    ledger: &L,
    batches: &BatchBuilder,
    snapshot: &Snapshot,
    params: &RedemptionParams,
) -> Result<Option<usize>>
where
    L: LedgerReader + LedgerSubmitter + ?Sized,
{
    let requests = select_requests(snapshot, params.max_per_cycle);
    if requests.is_empty() {
        return Ok(None);
    }

    let estimate = estimate_net_value(snapshot)?;
    let (sized, _) = fit_redemptions(snapshot, batches, &requests, estimate, params)?;
    let requests = &requests[..sized.payouts.len()];

    let net_value = refresh_net_value(ledger, batches, snapshot, params.net_value_tolerance).await?;
    let (plan, batch) = fit_redemptions(snapshot, batches, requests, net_value.value, params)?;
    for shortfall in &plan.shortfalls {
        tracing::warn!(
            pool = shortfall.pool_index,
            requested = %shortfall.requested,
            available = %shortfall.available,
            "Redemption withdrawal deferred"
        );
    }

    let receipt = ledger.submit(&batch).await?;
    tracing::info!(
        count = plan.payouts.len(),
        pending = requests.len(),
        total_collateral = %plan.total_collateral,
        net_value = %net_value.value,
        revision = receipt.revision,
        "Redemptions paid"
    );
    Ok(Some(plan.payouts.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::batch::BatchLimits;
    use comet_keeper_core::{
        AggregatedPosition, FeeConfig, ManagerState, ManagerStatus, Oracle, Pool, PositionEntry,
        ProgramIds, Subscriber, MAX_REDEMPTION_SLOTS,
    };
    use comet_keeper_ledger::{AccountSet, OperationBuilder};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn holder(byte: u8, tokens: Decimal) -> Subscriber {
        Subscriber {
            owner: Address([byte; 32]),
            principal: tokens,
            membership_tokens: tokens,
            redemption_request: None,
        }
    }

    fn slot(byte: u8, tokens: Decimal) -> Option<RedemptionSlot> {
        Some(RedemptionSlot {
            subscriber: Address([byte; 32]),
            membership_tokens: tokens,
            requested_at: Utc::now(),
        })
    }

    fn snapshot(slots: Vec<(usize, Option<RedemptionSlot>)>, holders: Vec<Subscriber>) -> Snapshot {
        let mut redemption_slots = vec![None; MAX_REDEMPTION_SLOTS];
        for (i, s) in slots {
            redemption_slots[i] = s;
        }
        Snapshot {
            revision: 9,
            manager: ManagerState {
                owner: Address([3; 32]),
                status: ManagerStatus::Open,
                membership_token_supply: dec!(1000000),
                fees: FeeConfig::default(),
                fees_accrued: Decimal::ZERO,
                redemption_slots,
                collateral_balance: Decimal::ZERO,
                net_value: dec!(500000),
                net_value_revision: 9,
            },
            position: AggregatedPosition {
                collateral: dec!(500000),
                entries: vec![PositionEntry {
                    pool_index: 0,
                    committed_collateral_liquidity: dec!(40000000),
                    collateral_ild: Decimal::ZERO,
                    synthetic_ild: Decimal::ZERO,
                }],
            },
            pools: vec![Pool {
                index: 0,
                committed_collateral_liquidity: dec!(100000000),
                collateral_ild: Decimal::ZERO,
                synthetic_ild: Decimal::ZERO,
                liquidity_token_supply: dec!(100000000),
                trading_fee_bps: 30,
                position_health_score_coefficient: dec!(1),
                il_health_score_coefficient: dec!(1),
                oracle_index: 0,
            }],
            oracles: vec![Oracle {
                index: 0,
                raw_price: 1,
                expo: 0,
                last_update_revision: 9,
            }],
            subscribers: holders.into_iter().map(|h| (h.owner, h)).collect::<HashMap<_, _>>(),
        }
    }

    fn params() -> RedemptionParams {
        RedemptionParams {
            max_per_cycle: 8,
            target_health_score: dec!(80),
            threshold: dec!(0.01),
            collateral_decimals: 6,
            net_value_tolerance: dec!(0.01),
        }
    }

    #[test]
    fn entitlement_is_pro_rata() {
        assert_eq!(collateral_owed(dec!(50000), dec!(1000000), dec!(500000)), dec!(25000));
        assert_eq!(collateral_owed(dec!(1), Decimal::ZERO, dec!(500000)), Decimal::ZERO);
    }

    #[test]
    fn selection_is_bounded_and_in_slot_order() {
        let slots = (0..12).map(|i| (i * 5, slot(i as u8 + 1, dec!(10)))).collect();
        let holders = (0..12).map(|i| holder(i as u8 + 1, dec!(10))).collect();
        let snap = snapshot(slots, holders);

        let selected = select_requests(&snap, 8);
        assert_eq!(selected.len(), 8);
        let indices: Vec<usize> = selected.iter().map(|r| r.slot_index).collect();
        assert_eq!(indices, vec![0, 5, 10, 15, 20, 25, 30, 35]);
    }

    #[test]
    fn invalid_requests_are_skipped() {
        let snap = snapshot(
            vec![
                (0, slot(1, Decimal::ZERO)),
                (1, slot(2, dec!(500))),
                (2, slot(3, dec!(10))),
                (3, slot(4, dec!(10))),
            ],
            vec![holder(2, dec!(100)), holder(3, dec!(10))],
        );
        let selected = select_requests(&snap, 8);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].slot_index, 2);
    }

    #[test]
    fn ineligible_slots_do_not_use_up_the_cycle_bound() {
        let mut slots: Vec<_> = (0..9).map(|i| (i, slot(i as u8 + 1, dec!(99999)))).collect();
        slots.push((9, slot(10, dec!(10000))));
        let holders = (1..=10).map(|b| holder(b, dec!(10000))).collect();
        let snap = snapshot(slots, holders);

        let selected = select_requests(&snap, 8);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].slot_index, 9);
    }

    fn batches() -> BatchBuilder {
        let accounts = AccountSet::derive(ProgramIds {
            comet_program: Address([1; 32]),
            manager_program: Address([2; 32]),
            manager_owner: Address([3; 32]),
        });
        BatchBuilder::new(OperationBuilder::new(accounts), None)
    }

    #[test]
    fn oversized_redemptions_are_halved_until_they_fit() {
        let slots = (0..8).map(|i| (i, slot(i as u8 + 1, dec!(10000)))).collect();
        let holders = (1..=8).map(|b| holder(b, dec!(10000))).collect();
        let snap = snapshot(slots, holders);
        let requests = select_requests(&snap, 8);
        assert_eq!(requests.len(), 8);

        let (plan, batch) =
            fit_redemptions(&snap, &batches(), &requests, dec!(500000), &params()).unwrap();
        let paid: Vec<usize> = plan.payouts.iter().map(|p| p.slot_index).collect();
        assert_eq!(paid, vec![0, 1, 2, 3]);
        assert_eq!(plan.total_collateral, dec!(20000));
        assert_eq!(
            batch.kinds().iter().filter(|k| **k == comet_keeper_core::ActionKind::PayRedemption).count(),
            4
        );
    }

    #[test]
    fn single_request_over_limit_is_reported() {
        let snap = snapshot(vec![(0, slot(1, dec!(10000)))], vec![holder(1, dec!(10000))]);
        let requests = select_requests(&snap, 8);
        let tight = batches().with_limits(BatchLimits {
            max_transaction_bytes: 300,
            ..BatchLimits::default()
        });

        let err = fit_redemptions(&snap, &tight, &requests, dec!(500000), &params()).unwrap_err();
        assert_eq!(err.kind(), "batch_too_large");
    }

    #[test]
    fn plan_withdraws_owed_collateral_then_pays() {
        let snap = snapshot(vec![(4, slot(1, dec!(50000)))], vec![holder(1, dec!(50000))]);
        let requests = select_requests(&snap, 8);
        let plan = plan_redemptions(&snap, &requests, dec!(500000), &params()).unwrap();

        assert_eq!(plan.total_collateral, dec!(25000));
        assert_eq!(plan.payouts[0].collateral_amount, dec!(25000));
        assert_eq!(plan.payouts[0].slot_index, 4);

        // Budget: 80 * (500000 - 25000) = 38,000,000 against 40,000,000 held.
        assert_eq!(plan.withdrawals.len(), 1);
        assert!(matches!(
            &plan.withdrawals[0],
            ActionRequest::WithdrawLiquidity(r) if r.collateral_amount == dec!(2000000)
        ));

        let kinds: Vec<_> = plan.actions().iter().map(ActionRequest::kind).collect();
        assert_eq!(
            kinds,
            vec![
                comet_keeper_core::ActionKind::WithdrawLiquidity,
                comet_keeper_core::ActionKind::WithdrawCollateral,
                comet_keeper_core::ActionKind::PayRedemption,
            ]
        );
    }

    #[test]
    fn payouts_round_down_to_collateral_scale() {
        let snap = snapshot(vec![(0, slot(1, dec!(1)))], vec![holder(1, dec!(1))]);
        let requests = select_requests(&snap, 8);
        let plan = plan_redemptions(&snap, &requests, dec!(1), &params()).unwrap();
        assert_eq!(plan.payouts[0].collateral_amount, dec!(0.000001));

        // 0.0000009999999 truncates to zero
        let plan = plan_redemptions(&snap, &requests, dec!(0.9999999), &params()).unwrap();
        assert_eq!(plan.payouts[0].collateral_amount, Decimal::ZERO);
        assert!(plan
            .actions()
            .iter()
            .all(|a| !matches!(a, ActionRequest::WithdrawCollateral(_))));
    }
}
