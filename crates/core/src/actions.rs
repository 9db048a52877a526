//! Logical ledger actions and the opaque operations they are turned into.
//!
//! Each action kind has its own request struct. Requests are validated before
//! they are placed in a batch; the ledger program remains the final arbiter.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;
use crate::error::{KeeperError, Result};
use crate::types::Revision;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPricesRequest {
    pub oracle_indices: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshNetValueRequest {
    pub pool_indices: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLiquidityRequest {
    pub pool_index: u8,
    pub collateral_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawLiquidityRequest {
    pub pool_index: u8,
    pub liquidity_token_amount: Decimal,
    /// Collateral the withdrawal is expected to free, for logging.
    pub collateral_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddCollateralRequest {
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawCollateralRequest {
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayRedemptionRequest {
    pub slot_index: usize,
    pub subscriber: Address,
    pub membership_tokens: Decimal,
    pub collateral_amount: Decimal,
}

/// A logical action the keeper wants applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionRequest {
    RefreshPrices(RefreshPricesRequest),
    RefreshNetValue(RefreshNetValueRequest),
    AddLiquidity(AddLiquidityRequest),
    WithdrawLiquidity(WithdrawLiquidityRequest),
    AddCollateral(AddCollateralRequest),
    WithdrawCollateral(WithdrawCollateralRequest),
    PayRedemption(PayRedemptionRequest),
}

/// Discriminant of an [`ActionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RefreshPrices,
    RefreshNetValue,
    AddLiquidity,
    WithdrawLiquidity,
    AddCollateral,
    WithdrawCollateral,
    PayRedemption,
}

impl ActionKind {
    /// Wire discriminator.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::RefreshPrices => 0,
            Self::RefreshNetValue => 1,
            Self::AddLiquidity => 2,
            Self::WithdrawLiquidity => 3,
            Self::AddCollateral => 4,
            Self::WithdrawCollateral => 5,
            Self::PayRedemption => 6,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RefreshPrices => "refresh_prices",
            Self::RefreshNetValue => "refresh_net_value",
            Self::AddLiquidity => "add_liquidity",
            Self::WithdrawLiquidity => "withdraw_liquidity",
            Self::AddCollateral => "add_collateral",
            Self::WithdrawCollateral => "withdraw_collateral",
            Self::PayRedemption => "pay_redemption",
        };
        write!(f, "{name}")
    }
}

fn require_positive(what: &str, amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(KeeperError::InvalidAction(format!(
            "{what} must be positive, got {amount}"
        )));
    }
    Ok(())
}

impl ActionRequest {
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::RefreshPrices(_) => ActionKind::RefreshPrices,
            Self::RefreshNetValue(_) => ActionKind::RefreshNetValue,
            Self::AddLiquidity(_) => ActionKind::AddLiquidity,
            Self::WithdrawLiquidity(_) => ActionKind::WithdrawLiquidity,
            Self::AddCollateral(_) => ActionKind::AddCollateral,
            Self::WithdrawCollateral(_) => ActionKind::WithdrawCollateral,
            Self::PayRedemption(_) => ActionKind::PayRedemption,
        }
    }

    /// Whether the ledger reads oracle prices while applying this action.
    /// Such actions must be preceded by a price refresh in the same batch.
    #[must_use]
    pub const fn requires_fresh_prices(&self) -> bool {
        matches!(
            self,
            Self::RefreshNetValue(_)
                | Self::AddLiquidity(_)
                | Self::WithdrawLiquidity(_)
                | Self::WithdrawCollateral(_)
        )
    }

    /// Pools whose prices this action depends on. `None` means all pools
    /// held by the position.
    #[must_use]
    pub fn priced_pools(&self) -> Option<Vec<u8>> {
        match self {
            Self::AddLiquidity(r) => Some(vec![r.pool_index]),
            Self::WithdrawLiquidity(r) => Some(vec![r.pool_index]),
            Self::RefreshNetValue(r) => Some(r.pool_indices.clone()),
            Self::WithdrawCollateral(_) => None,
            Self::RefreshPrices(_) | Self::AddCollateral(_) | Self::PayRedemption(_) => {
                Some(Vec::new())
            }
        }
    }

    /// Checks the request is well-formed before it enters a batch.
    ///
    /// # Errors
    /// Returns `KeeperError::InvalidAction` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::RefreshPrices(r) => {
                if r.oracle_indices.is_empty() {
                    return Err(KeeperError::InvalidAction(
                        "price refresh without oracles".to_string(),
                    ));
                }
                Ok(())
            }
            Self::RefreshNetValue(_) => Ok(()),
            Self::AddLiquidity(r) => require_positive("liquidity to add", r.collateral_amount),
            Self::WithdrawLiquidity(r) => {
                require_positive("liquidity tokens to withdraw", r.liquidity_token_amount)
            }
            Self::AddCollateral(r) => require_positive("collateral to add", r.amount),
            Self::WithdrawCollateral(r) => require_positive("collateral to withdraw", r.amount),
            Self::PayRedemption(r) => {
                if r.subscriber.is_zero() {
                    return Err(KeeperError::InvalidAction(format!(
                        "redemption slot {} has no subscriber",
                        r.slot_index
                    )));
                }
                require_positive("redeemed membership tokens", r.membership_tokens)?;
                // A zero payout is legal when net value is zero.
                if r.collateral_amount < Decimal::ZERO {
                    return Err(KeeperError::InvalidAction(format!(
                        "negative payout for slot {}",
                        r.slot_index
                    )));
                }
                Ok(())
            }
        }
    }
}

/// A reference to an account touched by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMeta {
    pub address: Address,
    pub writable: bool,
    pub signer: bool,
}

impl AccountMeta {
    #[must_use]
    pub const fn writable(address: Address) -> Self {
        Self {
            address,
            writable: true,
            signer: false,
        }
    }

    #[must_use]
    pub const fn readonly(address: Address) -> Self {
        Self {
            address,
            writable: false,
            signer: false,
        }
    }

    #[must_use]
    pub const fn signer(address: Address) -> Self {
        Self {
            address,
            writable: true,
            signer: true,
        }
    }
}

/// An encoded ledger operation. The keeper only inspects `request` for
/// logging; the ledger consumes `program_id`, `accounts` and `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub request: ActionRequest,
    pub program_id: Address,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

impl Operation {
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        self.request.kind()
    }
}

/// A published address-compression table. References listed here cost one
/// byte in a batch instead of a full address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressLookupTable {
    pub address: Address,
    pub entries: Vec<Address>,
}

impl AddressLookupTable {
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains(address)
    }

    #[must_use]
    pub fn index_of(&self, address: &Address) -> Option<u8> {
        self.entries
            .iter()
            .position(|a| a == address)
            .and_then(|i| u8::try_from(i).ok())
    }
}

/// An ordered list of operations applied atomically by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub operations: Vec<Operation>,
    pub lookup_table: Option<Address>,
}

impl Batch {
    #[must_use]
    pub fn kinds(&self) -> Vec<ActionKind> {
        self.operations.iter().map(Operation::kind).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Ledger acknowledgement of an applied batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub revision: Revision,
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_dependency_by_kind() {
        let add = ActionRequest::AddLiquidity(AddLiquidityRequest {
            pool_index: 1,
            collateral_amount: dec!(10),
        });
        let pay = ActionRequest::PayRedemption(PayRedemptionRequest {
            slot_index: 0,
            subscriber: Address([1; 32]),
            membership_tokens: dec!(1),
            collateral_amount: dec!(1),
        });
        assert!(add.requires_fresh_prices());
        assert!(!pay.requires_fresh_prices());
        assert_eq!(add.priced_pools(), Some(vec![1]));
    }

    #[test]
    fn validation_rejects_non_positive_amounts() {
        let add = ActionRequest::AddLiquidity(AddLiquidityRequest {
            pool_index: 0,
            collateral_amount: Decimal::ZERO,
        });
        assert!(matches!(add.validate(), Err(KeeperError::InvalidAction(_))));

        let withdraw = ActionRequest::WithdrawCollateral(WithdrawCollateralRequest {
            amount: dec!(-1),
        });
        assert!(withdraw.validate().is_err());
    }

    #[test]
    fn validation_rejects_payout_without_subscriber() {
        let pay = ActionRequest::PayRedemption(PayRedemptionRequest {
            slot_index: 4,
            subscriber: Address::ZERO,
            membership_tokens: dec!(10),
            collateral_amount: dec!(5),
        });
        let err = pay.validate().unwrap_err();
        assert!(err.to_string().contains("slot 4"));
    }

    #[test]
    fn lookup_table_indexes_entries() {
        let table = AddressLookupTable {
            address: Address([9; 32]),
            entries: vec![Address([1; 32]), Address([2; 32])],
        };
        assert_eq!(table.index_of(&Address([2; 32])), Some(1));
        assert!(!table.contains(&Address([3; 32])));
    }
}
