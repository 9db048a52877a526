//! Ledger records the keeper reads: pools, oracles, the aggregated position,
//! manager state and subscriber records.
//!
//! All of these are owned by the ledger. The keeper only ever holds copies
//! taken at a known revision.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::{KeeperError, Result};

/// Monotonic ledger revision (slot / block height).
pub type Revision = u64;

/// Maximum live entries in the aggregated position.
pub const MAX_POSITION_ENTRIES: usize = 32;

/// Capacity of the manager's redemption queue.
pub const MAX_REDEMPTION_SLOTS: usize = 64;

/// A record together with the ledger revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: Revision,
}

impl<T> Versioned<T> {
    pub const fn new(value: T, revision: Revision) -> Self {
        Self { value, revision }
    }
}

/// Price oracle entry. `price = raw_price * 10^expo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Oracle {
    pub index: u8,
    pub raw_price: i64,
    pub expo: i32,
    pub last_update_revision: Revision,
}

impl Oracle {
    /// Current price as a decimal.
    ///
    /// # Errors
    /// Returns `KeeperError::Serialization` if a positive exponent takes the
    /// price outside the decimal range.
    pub fn price(&self) -> Result<Decimal> {
        if self.expo < 0 {
            // rust_decimal caps scale at 28.
            return Ok(Decimal::new(self.raw_price, self.expo.unsigned_abs().min(28)));
        }
        (0..self.expo)
            .try_fold(Decimal::from(self.raw_price), |acc, _| acc.checked_mul(Decimal::TEN))
            .ok_or_else(|| {
                KeeperError::Serialization(format!(
                    "oracle {} price {}e{} out of range",
                    self.index, self.raw_price, self.expo
                ))
            })
    }

    /// Whether the price is older than `max_age` revisions at `current`.
    #[must_use]
    pub const fn is_stale(&self, current: Revision, max_age: u64) -> bool {
        current.saturating_sub(self.last_update_revision) > max_age
    }
}

/// A liquidity pool for one synthetic asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub index: u8,
    /// Total collateral liquidity committed by all participants.
    pub committed_collateral_liquidity: Decimal,
    /// Outstanding impermanent-loss debt in collateral terms.
    pub collateral_ild: Decimal,
    /// Outstanding impermanent-loss debt in synthetic-asset terms.
    pub synthetic_ild: Decimal,
    /// Liquidity tokens issued against `committed_collateral_liquidity`.
    pub liquidity_token_supply: Decimal,
    pub trading_fee_bps: u16,
    /// Risk budget consumed per unit of committed liquidity.
    pub position_health_score_coefficient: Decimal,
    /// Risk budget consumed per unit of impermanent-loss debt.
    pub il_health_score_coefficient: Decimal,
    pub oracle_index: u8,
}

impl Pool {
    /// Converts a collateral amount into this pool's liquidity tokens.
    #[must_use]
    pub fn liquidity_tokens_for(&self, collateral: Decimal) -> Decimal {
        if self.committed_collateral_liquidity.is_zero() {
            return Decimal::ZERO;
        }
        collateral * self.liquidity_token_supply / self.committed_collateral_liquidity
    }
}

/// One pool's share of the aggregated position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub pool_index: u8,
    pub committed_collateral_liquidity: Decimal,
    /// Impermanent-loss debt owed by this entry in collateral terms.
    pub collateral_ild: Decimal,
    /// Impermanent-loss debt owed by this entry in synthetic-asset terms.
    pub synthetic_ild: Decimal,
}

impl PositionEntry {
    #[must_use]
    pub const fn empty(pool_index: u8) -> Self {
        Self {
            pool_index,
            committed_collateral_liquidity: Decimal::ZERO,
            collateral_ild: Decimal::ZERO,
            synthetic_ild: Decimal::ZERO,
        }
    }

    /// Total impermanent-loss debt in collateral terms at `price`.
    /// Negative values are gains.
    #[must_use]
    pub fn ild_value(&self, price: Decimal) -> Decimal {
        self.collateral_ild + self.synthetic_ild * price
    }

    /// An entry with nothing committed and no debt can be closed.
    #[must_use]
    pub fn is_removable(&self) -> bool {
        self.committed_collateral_liquidity.is_zero()
            && self.collateral_ild.is_zero()
            && self.synthetic_ild.is_zero()
    }
}

/// The managed, aggregated liquidity position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedPosition {
    pub collateral: Decimal,
    pub entries: Vec<PositionEntry>,
}

impl AggregatedPosition {
    #[must_use]
    pub fn entry(&self, pool_index: u8) -> Option<&PositionEntry> {
        self.entries.iter().find(|e| e.pool_index == pool_index)
    }

    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.entries.len() < MAX_POSITION_ENTRIES
    }

    /// Returns a copy extended with empty entries for `pool_indices` not yet
    /// held, stopping at the entry ceiling.
    #[must_use]
    pub fn with_seeded_pools(&self, pool_indices: &[u8]) -> Self {
        let mut seeded = self.clone();
        for &index in pool_indices {
            if !seeded.has_capacity() {
                break;
            }
            if seeded.entry(index).is_none() {
                seeded.entries.push(PositionEntry::empty(index));
            }
        }
        seeded
    }
}

/// Manager lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerStatus {
    Open,
    Closing,
}

/// Fee configuration, in basis points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    pub management_fee_bps: u16,
    pub withdrawal_fee_bps: u16,
}

/// A queued redemption occupying one slot of the manager's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionSlot {
    pub subscriber: Address,
    pub membership_tokens: Decimal,
    pub requested_at: DateTime<Utc>,
}

/// Manager-wide state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerState {
    pub owner: Address,
    pub status: ManagerStatus,
    pub membership_token_supply: Decimal,
    pub fees: FeeConfig,
    /// Fees earned by the manager owner and not yet claimed.
    pub fees_accrued: Decimal,
    /// Fixed-capacity queue. Slots are addressed by index, not by age.
    pub redemption_slots: Vec<Option<RedemptionSlot>>,
    /// Collateral held by the manager outside the position (payout float).
    pub collateral_balance: Decimal,
    pub net_value: Decimal,
    pub net_value_revision: Revision,
}

impl ManagerState {
    /// Occupied redemption slots in index order.
    pub fn pending_redemptions(&self) -> impl Iterator<Item = (usize, &RedemptionSlot)> {
        self.redemption_slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (i, s)))
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.status == ManagerStatus::Closing
    }
}

/// A subscriber's pending withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRequest {
    pub membership_tokens: Decimal,
    pub requested_at: DateTime<Utc>,
}

/// A depositor's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub owner: Address,
    pub principal: Decimal,
    pub membership_tokens: Decimal,
    pub redemption_request: Option<RedemptionRequest>,
}

/// A typed record pushed by the ledger when an account's revision changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "account", content = "data", rename_all = "snake_case")]
pub enum AccountUpdate {
    Manager(Versioned<ManagerState>),
    Position(Versioned<AggregatedPosition>),
    Pools(Versioned<Vec<Pool>>),
    Oracles(Versioned<Vec<Oracle>>),
    Subscriber(Versioned<Subscriber>),
}

impl AccountUpdate {
    #[must_use]
    pub const fn revision(&self) -> Revision {
        match self {
            Self::Manager(v) => v.revision,
            Self::Position(v) => v.revision,
            Self::Pools(v) => v.revision,
            Self::Oracles(v) => v.revision,
            Self::Subscriber(v) => v.revision,
        }
    }
}
