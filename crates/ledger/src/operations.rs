//! Turns validated action requests into encoded ledger operations.
//!
//! Layout of `data`: one discriminator byte followed by the request's fields.
//! Decimals are written with `Decimal::serialize` (16 bytes), indices as
//! single bytes, slot indices as little-endian `u16`. Accounts are never
//! repeated in `data`; the ledger reads them from the account list.

use comet_keeper_core::{
    AccountMeta, ActionRequest, Address, KeeperError, Operation, Result,
};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::accounts::AccountSet;

/// Builds operations against a fixed [`AccountSet`].
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    accounts: AccountSet,
}

impl OperationBuilder {
    #[must_use]
    pub const fn new(accounts: AccountSet) -> Self {
        Self { accounts }
    }

    #[must_use]
    pub const fn accounts(&self) -> &AccountSet {
        &self.accounts
    }

    /// Validates `request` and encodes it.
    ///
    /// # Errors
    /// Returns `KeeperError::InvalidAction` if the request fails validation.
    pub fn build(&self, request: ActionRequest) -> Result<Operation> {
        request.validate()?;
        let set = &self.accounts;
        let owner = AccountMeta::signer(set.programs.manager_owner);

        let (program_id, accounts) = match &request {
            ActionRequest::RefreshPrices(r) => {
                let mut metas = vec![AccountMeta::writable(set.oracles)];
                metas.extend(
                    r.oracle_indices
                        .iter()
                        .map(|&i| AccountMeta::readonly(set.price_feed(i))),
                );
                (set.programs.comet_program, metas)
            }
            ActionRequest::RefreshNetValue(_) => (
                set.programs.manager_program,
                vec![
                    owner,
                    AccountMeta::writable(set.manager_info),
                    AccountMeta::readonly(set.position),
                    AccountMeta::readonly(set.pools),
                    AccountMeta::readonly(set.oracles),
                ],
            ),
            ActionRequest::AddLiquidity(_) | ActionRequest::WithdrawLiquidity(_) => (
                set.programs.manager_program,
                vec![
                    owner,
                    AccountMeta::readonly(set.manager_info),
                    AccountMeta::writable(set.position),
                    AccountMeta::writable(set.pools),
                    AccountMeta::readonly(set.oracles),
                    AccountMeta::readonly(set.programs.comet_program),
                ],
            ),
            ActionRequest::AddCollateral(_) | ActionRequest::WithdrawCollateral(_) => (
                set.programs.manager_program,
                vec![
                    owner,
                    AccountMeta::readonly(set.manager_info),
                    AccountMeta::writable(set.position),
                    AccountMeta::writable(set.collateral_vault),
                    AccountMeta::writable(set.manager_collateral),
                    AccountMeta::readonly(set.pools),
                    AccountMeta::readonly(set.oracles),
                    AccountMeta::readonly(set.programs.comet_program),
                ],
            ),
            ActionRequest::PayRedemption(r) => (
                set.programs.manager_program,
                vec![
                    owner,
                    AccountMeta::writable(set.manager_info),
                    AccountMeta::writable(set.manager_collateral),
                    AccountMeta::writable(set.subscriber(&r.subscriber)),
                    AccountMeta::writable(set.subscriber_collateral(&r.subscriber)),
                ],
            ),
        };

        let data = encode(&request)?;
        Ok(Operation {
            request,
            program_id,
            accounts,
            data,
        })
    }
}

fn put_decimal(buf: &mut Vec<u8>, value: Decimal) {
    buf.extend_from_slice(&value.serialize());
}

fn encode(request: &ActionRequest) -> Result<Vec<u8>> {
    let mut buf = vec![request.kind().tag()];
    match request {
        ActionRequest::RefreshPrices(r) => {
            let count = u8::try_from(r.oracle_indices.len())
                .map_err(|_| KeeperError::InvalidAction("too many oracles in refresh".into()))?;
            buf.push(count);
            buf.extend_from_slice(&r.oracle_indices);
        }
        ActionRequest::RefreshNetValue(r) => {
            let count = u8::try_from(r.pool_indices.len())
                .map_err(|_| KeeperError::InvalidAction("too many pools in refresh".into()))?;
            buf.push(count);
            buf.extend_from_slice(&r.pool_indices);
        }
        ActionRequest::AddLiquidity(r) => {
            buf.push(r.pool_index);
            put_decimal(&mut buf, r.collateral_amount);
        }
        ActionRequest::WithdrawLiquidity(r) => {
            buf.push(r.pool_index);
            put_decimal(&mut buf, r.liquidity_token_amount);
        }
        ActionRequest::AddCollateral(r) => put_decimal(&mut buf, r.amount),
        ActionRequest::WithdrawCollateral(r) => put_decimal(&mut buf, r.amount),
        ActionRequest::PayRedemption(r) => {
            let slot = u16::try_from(r.slot_index)
                .map_err(|_| KeeperError::InvalidAction(format!("slot {} out of range", r.slot_index)))?;
            buf.extend_from_slice(&slot.to_le_bytes());
            put_decimal(&mut buf, r.membership_tokens);
            put_decimal(&mut buf, r.collateral_amount);
        }
    }
    Ok(buf)
}

/// Digest signed for a batch: every operation's program, accounts and data
/// in order, followed by the lookup table address if any.
#[must_use]
pub fn batch_digest(operations: &[Operation], lookup_table: Option<&Address>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for op in operations {
        hasher.update(op.program_id.as_bytes());
        for meta in &op.accounts {
            hasher.update(meta.address.as_bytes());
            hasher.update([u8::from(meta.writable), u8::from(meta.signer)]);
        }
        hasher.update((op.data.len() as u32).to_le_bytes());
        hasher.update(&op.data);
    }
    if let Some(table) = lookup_table {
        hasher.update(table.as_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_keeper_core::{
        AddLiquidityRequest, PayRedemptionRequest, ProgramIds, RefreshPricesRequest,
    };
    use rust_decimal_macros::dec;

    fn builder() -> OperationBuilder {
        OperationBuilder::new(AccountSet::derive(ProgramIds {
            comet_program: Address([1; 32]),
            manager_program: Address([2; 32]),
            manager_owner: Address([3; 32]),
        }))
    }

    #[test]
    fn refresh_prices_references_each_feed() {
        let op = builder()
            .build(ActionRequest::RefreshPrices(RefreshPricesRequest {
                oracle_indices: vec![0, 2, 5],
            }))
            .unwrap();
        assert_eq!(op.accounts.len(), 4);
        assert_eq!(op.data, vec![0, 3, 0, 2, 5]);
    }

    #[test]
    fn add_liquidity_encodes_pool_and_amount() {
        let op = builder()
            .build(ActionRequest::AddLiquidity(AddLiquidityRequest {
                pool_index: 7,
                collateral_amount: dec!(1250.5),
            }))
            .unwrap();
        assert_eq!(op.data[0], 2);
        assert_eq!(op.data[1], 7);
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&op.data[2..18]);
        assert_eq!(Decimal::deserialize(raw), dec!(1250.5));
        assert!(op.accounts[0].signer);
    }

    #[test]
    fn invalid_requests_are_not_encoded() {
        let err = builder()
            .build(ActionRequest::AddLiquidity(AddLiquidityRequest {
                pool_index: 0,
                collateral_amount: dec!(0),
            }))
            .unwrap_err();
        assert!(matches!(err, KeeperError::InvalidAction(_)));
    }

    #[test]
    fn payouts_touch_subscriber_accounts() {
        let b = builder();
        let subscriber = Address([9; 32]);
        let op = b
            .build(ActionRequest::PayRedemption(PayRedemptionRequest {
                slot_index: 3,
                subscriber,
                membership_tokens: dec!(10),
                collateral_amount: dec!(5),
            }))
            .unwrap();
        let addresses: Vec<Address> = op.accounts.iter().map(|m| m.address).collect();
        assert!(addresses.contains(&b.accounts().subscriber(&subscriber)));
        assert!(addresses.contains(&b.accounts().subscriber_collateral(&subscriber)));
    }

    #[test]
    fn digest_changes_with_lookup_table() {
        let op = builder()
            .build(ActionRequest::RefreshPrices(RefreshPricesRequest {
                oracle_indices: vec![0],
            }))
            .unwrap();
        let ops = vec![op];
        assert_ne!(
            batch_digest(&ops, None),
            batch_digest(&ops, Some(&Address([4; 32])))
        );
    }
}
