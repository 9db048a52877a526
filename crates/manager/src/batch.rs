//! Batch assembly.
//!
//! Every batch that contains a price-dependent action starts with exactly one
//! price refresh covering the oracles those actions read. References found in
//! the lookup table cost one byte instead of a full address. Batches that
//! still exceed the platform ceiling are rejected before submission.

use std::collections::{BTreeSet, HashSet};

use comet_keeper_core::{
    ActionRequest, Address, AddressLookupTable, Batch, KeeperError, Operation,
    RefreshPricesRequest, Result,
};
use comet_keeper_ledger::OperationBuilder;

use crate::state_cache::Snapshot;

/// Platform limits on a single submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Unique references that must be written out in full.
    pub max_accounts: usize,
    pub max_transaction_bytes: usize,
    pub inline_reference_bytes: usize,
    pub table_reference_bytes: usize,
    /// Signature, message header and recent-revision hash.
    pub envelope_bytes: usize,
    /// Program index, account count and data length of one operation.
    pub operation_header_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_accounts: 64,
            max_transaction_bytes: 1232,
            inline_reference_bytes: 32,
            table_reference_bytes: 1,
            envelope_bytes: 100,
            operation_header_bytes: 3,
        }
    }
}

/// Size estimate of a set of operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSize {
    /// Unique references written inline.
    pub inline_accounts: usize,
    /// Unique references resolved through the lookup table.
    pub table_accounts: usize,
    pub bytes: usize,
}

/// Turns planned actions into submittable batches.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    operations: OperationBuilder,
    lookup_table: Option<AddressLookupTable>,
    limits: BatchLimits,
}

impl BatchBuilder {
    #[must_use]
    pub fn new(operations: OperationBuilder, lookup_table: Option<AddressLookupTable>) -> Self {
        Self {
            operations,
            lookup_table,
            limits: BatchLimits::default(),
        }
    }

    #[must_use]
    pub const fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub const fn lookup_table(&self) -> Option<&AddressLookupTable> {
        self.lookup_table.as_ref()
    }

    /// Oracles read by `actions`, resolved against `snapshot`.
    fn oracles_for(actions: &[ActionRequest], snapshot: &Snapshot) -> Result<BTreeSet<u8>> {
        let mut oracles = BTreeSet::new();
        for action in actions.iter().filter(|a| a.requires_fresh_prices()) {
            let pools = action.priced_pools().unwrap_or_else(|| snapshot.held_pools());
            for index in pools {
                oracles.insert(snapshot.pool(index)?.oracle_index);
            }
        }
        Ok(oracles)
    }

    /// Validates, orders and encodes `actions`.
    ///
    /// Caller-supplied price refreshes are replaced by a single one at the
    /// front when any action reads prices.
    ///
    /// # Errors
    /// `InvalidAction` for an empty or malformed action list, `MissingPool`
    /// for an unknown pool and `BatchTooLarge` when the batch cannot fit.
    pub fn build(&self, actions: Vec<ActionRequest>, snapshot: &Snapshot) -> Result<Batch> {
        let actions: Vec<ActionRequest> = actions
            .into_iter()
            .filter(|a| !matches!(a, ActionRequest::RefreshPrices(_)))
            .collect();
        if actions.is_empty() {
            return Err(KeeperError::InvalidAction("batch has no actions".into()));
        }
        for action in &actions {
            action.validate()?;
            if let ActionRequest::AddLiquidity(r) = action {
                snapshot.pool(r.pool_index)?;
            }
        }

        let oracles = Self::oracles_for(&actions, snapshot)?;
        let mut ordered = Vec::with_capacity(actions.len() + 1);
        if actions.iter().any(ActionRequest::requires_fresh_prices) {
            let oracle_indices: Vec<u8> = if oracles.is_empty() {
                // Nothing held yet; refresh every known oracle.
                snapshot.oracles.iter().map(|o| o.index).collect()
            } else {
                oracles.into_iter().collect()
            };
            ordered.push(ActionRequest::RefreshPrices(RefreshPricesRequest { oracle_indices }));
        }
        ordered.extend(actions);

        let operations = ordered
            .into_iter()
            .map(|action| self.operations.build(action))
            .collect::<Result<Vec<Operation>>>()?;

        let size = self.measure(&operations);
        if size.inline_accounts > self.limits.max_accounts
            || size.bytes > self.limits.max_transaction_bytes
        {
            return Err(KeeperError::BatchTooLarge {
                accounts: size.inline_accounts,
                max_accounts: self.limits.max_accounts,
                bytes: size.bytes,
                max_bytes: self.limits.max_transaction_bytes,
            });
        }

        let lookup_table = self
            .lookup_table
            .as_ref()
            .filter(|_| size.table_accounts > 0)
            .map(|t| t.address);
        tracing::debug!(
            operations = operations.len(),
            inline_accounts = size.inline_accounts,
            table_accounts = size.table_accounts,
            bytes = size.bytes,
            "Batch assembled"
        );
        Ok(Batch {
            operations,
            lookup_table,
        })
    }

    /// Estimates the serialized size of `operations`.
    #[must_use]
    pub fn measure(&self, operations: &[Operation]) -> BatchSize {
        let mut references: HashSet<Address> = HashSet::new();
        let mut bytes = self.limits.envelope_bytes;
        for op in operations {
            references.insert(op.program_id);
            references.extend(op.accounts.iter().map(|m| m.address));
            bytes += self.limits.operation_header_bytes + op.accounts.len() + op.data.len();
        }

        let table_accounts = self.lookup_table.as_ref().map_or(0, |table| {
            references.iter().filter(|a| table.contains(a)).count()
        });
        let inline_accounts = references.len() - table_accounts;
        bytes += inline_accounts * self.limits.inline_reference_bytes
            + table_accounts * self.limits.table_reference_bytes;
        if table_accounts > 0 {
            bytes += self.limits.inline_reference_bytes;
        }

        BatchSize {
            inline_accounts,
            table_accounts,
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_keeper_core::{
        ActionKind, AddCollateralRequest, AddLiquidityRequest, AggregatedPosition, FeeConfig,
        ManagerState, ManagerStatus, Oracle, PayRedemptionRequest, Pool, PositionEntry,
        ProgramIds, WithdrawCollateralRequest, MAX_REDEMPTION_SLOTS,
    };
    use comet_keeper_ledger::AccountSet;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn accounts() -> AccountSet {
        AccountSet::derive(ProgramIds {
            comet_program: Address([1; 32]),
            manager_program: Address([2; 32]),
            manager_owner: Address([3; 32]),
        })
    }

    fn snapshot() -> Snapshot {
        let pool = |index: u8| Pool {
            index,
            committed_collateral_liquidity: dec!(1000000),
            collateral_ild: Decimal::ZERO,
            synthetic_ild: Decimal::ZERO,
            liquidity_token_supply: dec!(1000000),
            trading_fee_bps: 30,
            position_health_score_coefficient: dec!(1),
            il_health_score_coefficient: dec!(1),
            oracle_index: index + 10,
        };
        let oracle = |index: u8| Oracle {
            index,
            raw_price: 100,
            expo: 0,
            last_update_revision: 1,
        };
        Snapshot {
            revision: 1,
            manager: ManagerState {
                owner: Address([3; 32]),
                status: ManagerStatus::Open,
                membership_token_supply: dec!(1000),
                fees: FeeConfig::default(),
                fees_accrued: Decimal::ZERO,
                redemption_slots: vec![None; MAX_REDEMPTION_SLOTS],
                collateral_balance: Decimal::ZERO,
                net_value: dec!(1000),
                net_value_revision: 1,
            },
            position: AggregatedPosition {
                collateral: dec!(1000),
                entries: vec![PositionEntry::empty(0), PositionEntry::empty(1)],
            },
            pools: vec![pool(0), pool(1), pool(2)],
            oracles: vec![oracle(10), oracle(11), oracle(12)],
            subscribers: HashMap::new(),
        }
    }

    fn add(pool_index: u8) -> ActionRequest {
        ActionRequest::AddLiquidity(AddLiquidityRequest {
            pool_index,
            collateral_amount: dec!(10),
        })
    }

    fn payout(slot_index: usize) -> ActionRequest {
        ActionRequest::PayRedemption(PayRedemptionRequest {
            slot_index,
            subscriber: Address([100 + slot_index as u8; 32]),
            membership_tokens: dec!(1),
            collateral_amount: dec!(1),
        })
    }

    fn builder(table: bool) -> BatchBuilder {
        let accounts = accounts();
        let table = table.then(|| AddressLookupTable {
            address: Address([42; 32]),
            entries: accounts.static_references(3),
        });
        BatchBuilder::new(OperationBuilder::new(accounts), table)
    }

    #[test]
    fn single_refresh_leads_price_dependent_batches() {
        let stray_refresh = ActionRequest::RefreshPrices(RefreshPricesRequest {
            oracle_indices: vec![12],
        });
        let batch = builder(false)
            .build(vec![add(0), stray_refresh, add(2)], &snapshot())
            .unwrap();

        let kinds = batch.kinds();
        assert_eq!(kinds[0], ActionKind::RefreshPrices);
        assert_eq!(kinds.iter().filter(|k| **k == ActionKind::RefreshPrices).count(), 1);
        assert_eq!(
            batch.operations[0].request,
            ActionRequest::RefreshPrices(RefreshPricesRequest {
                oracle_indices: vec![10, 12],
            })
        );
    }

    #[test]
    fn collateral_withdrawal_refreshes_every_held_pool() {
        let withdraw = ActionRequest::WithdrawCollateral(WithdrawCollateralRequest { amount: dec!(5) });
        let batch = builder(false).build(vec![withdraw], &snapshot()).unwrap();
        assert_eq!(
            batch.operations[0].request,
            ActionRequest::RefreshPrices(RefreshPricesRequest {
                oracle_indices: vec![10, 11],
            })
        );
    }

    #[test]
    fn price_independent_batches_have_no_refresh() {
        let deposit = ActionRequest::AddCollateral(AddCollateralRequest { amount: dec!(5) });
        let batch = builder(false).build(vec![deposit, payout(0)], &snapshot()).unwrap();
        assert_eq!(batch.kinds(), vec![ActionKind::AddCollateral, ActionKind::PayRedemption]);
    }

    #[test]
    fn empty_batches_are_rejected() {
        let err = builder(false).build(Vec::new(), &snapshot()).unwrap_err();
        assert!(matches!(err, KeeperError::InvalidAction(_)));
    }

    #[test]
    fn unknown_pools_are_rejected_before_encoding() {
        let err = builder(false).build(vec![add(7)], &snapshot()).unwrap_err();
        assert!(matches!(err, KeeperError::MissingPool { pool_index: 7 }));
    }

    #[test]
    fn lookup_table_shrinks_batches_below_ceiling() {
        let mut actions = vec![ActionRequest::WithdrawCollateral(WithdrawCollateralRequest {
            amount: dec!(8),
        })];
        actions.extend((0..8).map(payout));

        let err = builder(false).build(actions.clone(), &snapshot()).unwrap_err();
        assert!(matches!(err, KeeperError::BatchTooLarge { .. }));

        let batch = builder(true).build(actions, &snapshot()).unwrap();
        assert_eq!(batch.lookup_table, Some(Address([42; 32])));
        assert_eq!(batch.len(), 10);
    }

    #[test]
    fn reference_ceiling_fails_fast() {
        let tight = BatchLimits {
            max_accounts: 4,
            ..BatchLimits::default()
        };
        let err = builder(false)
            .with_limits(tight)
            .build(vec![add(0)], &snapshot())
            .unwrap_err();
        assert!(matches!(err, KeeperError::BatchTooLarge { max_accounts: 4, .. }));
    }
}
