//! Stable account addresses derived from program seeds.

use comet_keeper_core::{Address, ProgramIds};

const MANAGER_SEED: &[u8] = b"manager-info";
const POSITION_SEED: &[u8] = b"comet";
const POOLS_SEED: &[u8] = b"pools";
const ORACLES_SEED: &[u8] = b"oracles";
const PRICE_FEED_SEED: &[u8] = b"price-feed";
const VAULT_SEED: &[u8] = b"collateral-vault";
const MANAGER_TOKEN_SEED: &[u8] = b"manager-collateral";
const SUBSCRIBER_SEED: &[u8] = b"subscriber";
const SUBSCRIBER_TOKEN_SEED: &[u8] = b"subscriber-collateral";

/// Every address the keeper reads or writes, derived once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountSet {
    pub programs: ProgramIds,
    pub manager_info: Address,
    pub position: Address,
    pub pools: Address,
    pub oracles: Address,
    pub collateral_vault: Address,
    pub manager_collateral: Address,
}

impl AccountSet {
    #[must_use]
    pub fn derive(programs: ProgramIds) -> Self {
        let manager_info = Address::derive(
            &programs.manager_program,
            &[MANAGER_SEED, programs.manager_owner.as_bytes()],
        );
        Self {
            programs,
            manager_info,
            position: Address::derive(&programs.comet_program, &[POSITION_SEED, manager_info.as_bytes()]),
            pools: Address::derive(&programs.comet_program, &[POOLS_SEED]),
            oracles: Address::derive(&programs.comet_program, &[ORACLES_SEED]),
            collateral_vault: Address::derive(&programs.comet_program, &[VAULT_SEED]),
            manager_collateral: Address::derive(
                &programs.manager_program,
                &[MANAGER_TOKEN_SEED, manager_info.as_bytes()],
            ),
        }
    }

    /// Price feed account backing oracle `index`.
    #[must_use]
    pub fn price_feed(&self, index: u8) -> Address {
        Address::derive(&self.programs.comet_program, &[PRICE_FEED_SEED, &[index]])
    }

    /// Subscriber record for `owner` under this manager.
    #[must_use]
    pub fn subscriber(&self, owner: &Address) -> Address {
        Address::derive(
            &self.programs.manager_program,
            &[SUBSCRIBER_SEED, owner.as_bytes(), self.manager_info.as_bytes()],
        )
    }

    /// Collateral token account receiving `owner`'s payouts.
    #[must_use]
    pub fn subscriber_collateral(&self, owner: &Address) -> Address {
        Address::derive(
            &self.programs.manager_program,
            &[SUBSCRIBER_TOKEN_SEED, owner.as_bytes()],
        )
    }

    /// References worth publishing in an address-compression table: the
    /// static accounts plus one price feed per pool.
    #[must_use]
    pub fn static_references(&self, pool_count: u8) -> Vec<Address> {
        let mut refs = vec![
            self.programs.comet_program,
            self.programs.manager_program,
            self.programs.manager_owner,
            self.manager_info,
            self.position,
            self.pools,
            self.oracles,
            self.collateral_vault,
            self.manager_collateral,
        ];
        refs.extend((0..pool_count).map(|i| self.price_feed(i)));
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programs() -> ProgramIds {
        ProgramIds {
            comet_program: Address([1; 32]),
            manager_program: Address([2; 32]),
            manager_owner: Address([3; 32]),
        }
    }

    #[test]
    fn derived_addresses_are_distinct() {
        let set = AccountSet::derive(programs());
        let refs = set.static_references(4);
        let mut unique = refs.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), refs.len());
    }

    #[test]
    fn subscriber_addresses_depend_on_owner() {
        let set = AccountSet::derive(programs());
        assert_ne!(
            set.subscriber(&Address([4; 32])),
            set.subscriber(&Address([5; 32]))
        );
        assert_ne!(
            set.subscriber(&Address([4; 32])),
            set.subscriber_collateral(&Address([4; 32]))
        );
    }
}
