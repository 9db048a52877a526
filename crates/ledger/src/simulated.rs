//! In-process ledger used for paper trading and tests.
//!
//! Batches are applied to a clone of the state and committed only if every
//! operation succeeds, so a failing batch leaves nothing behind. Faults can be
//! injected to exercise the keeper's failure handling.

use async_trait::async_trait;
use comet_keeper_core::{
    AccountUpdate, ActionKind, ActionRequest, Address, AddressLookupTable, AggregatedPosition,
    Batch, KeeperError, LedgerReader, LedgerSubmitter, LedgerSubscriber, ManagerState, Oracle,
    PositionEntry, Pool, RedemptionRequest, RedemptionSlot, Result, Revision, SubmissionReceipt,
    Subscriber, Versioned,
};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tokio::sync::mpsc;

use crate::operations::batch_digest;

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);
const DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 12);

/// Complete ledger contents. Also the paper-trading fixture format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub revision: Revision,
    pub manager: ManagerState,
    pub position: AggregatedPosition,
    pub pools: Vec<Pool>,
    pub oracles: Vec<Oracle>,
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
    /// Latest prices published by the feeds, applied on the next refresh.
    #[serde(default)]
    pub feed_prices: BTreeMap<u8, i64>,
    #[serde(default)]
    pub lookup_tables: Vec<AddressLookupTable>,
    #[serde(default)]
    pub max_price_age: u64,
}

impl LedgerState {
    fn pool_mut(&mut self, index: u8) -> Result<&mut Pool> {
        self.pools
            .iter_mut()
            .find(|p| p.index == index)
            .ok_or(KeeperError::MissingPool { pool_index: index })
    }

    fn pool(&self, index: u8) -> Result<&Pool> {
        self.pools
            .iter()
            .find(|p| p.index == index)
            .ok_or(KeeperError::MissingPool { pool_index: index })
    }

    fn oracle(&self, index: u8) -> Result<&Oracle> {
        self.oracles
            .iter()
            .find(|o| o.index == index)
            .ok_or(KeeperError::MissingOracle { oracle_index: index })
    }

    fn subscriber_mut(&mut self, owner: &Address) -> Option<&mut Subscriber> {
        self.subscribers.iter_mut().find(|s| &s.owner == owner)
    }

    fn require_fresh(&self, pool_index: u8, current: Revision) -> Result<()> {
        let oracle = self.oracle(self.pool(pool_index)?.oracle_index)?;
        if oracle.is_stale(current, self.max_price_age) {
            return Err(KeeperError::StalePrice {
                oracle_index: oracle.index,
                last_update: oracle.last_update_revision,
                required: current.saturating_sub(self.max_price_age),
            });
        }
        Ok(())
    }

    fn held_pools(&self) -> Vec<u8> {
        self.position.entries.iter().map(|e| e.pool_index).collect()
    }

    fn price_of(&self, pool_index: u8) -> Result<Decimal> {
        self.oracle(self.pool(pool_index)?.oracle_index)?.price()
    }

    /// Net value as the manager program computes it.
    fn compute_net_value(&self) -> Result<Decimal> {
        let mut ild = Decimal::ZERO;
        for entry in &self.position.entries {
            ild += entry.ild_value(self.price_of(entry.pool_index)?);
        }
        Ok(self.position.collateral + self.manager.collateral_balance
            - ild
            - self.manager.fees_accrued)
    }

    fn apply(&mut self, request: &ActionRequest, current: Revision) -> Result<()> {
        match request {
            ActionRequest::RefreshPrices(r) => {
                for &index in &r.oracle_indices {
                    let feed = self.feed_prices.get(&index).copied();
                    let oracle = self
                        .oracles
                        .iter_mut()
                        .find(|o| o.index == index)
                        .ok_or(KeeperError::MissingOracle { oracle_index: index })?;
                    if let Some(raw) = feed {
                        oracle.raw_price = raw;
                    }
                    oracle.last_update_revision = current;
                }
            }
            ActionRequest::RefreshNetValue(r) => {
                let pools = if r.pool_indices.is_empty() {
                    self.held_pools()
                } else {
                    r.pool_indices.clone()
                };
                for index in pools {
                    self.require_fresh(index, current)?;
                }
                self.manager.net_value = self.compute_net_value()?;
                self.manager.net_value_revision = current;
            }
            ActionRequest::AddLiquidity(r) => {
                self.require_fresh(r.pool_index, current)?;
                if self.position.entry(r.pool_index).is_none() {
                    if !self.position.has_capacity() {
                        return Err(KeeperError::InvalidAction(format!(
                            "position has no room for pool {}",
                            r.pool_index
                        )));
                    }
                    self.position.entries.push(PositionEntry::empty(r.pool_index));
                }
                let pool = self.pool_mut(r.pool_index)?;
                let minted = if pool.liquidity_token_supply.is_zero() {
                    r.collateral_amount
                } else {
                    pool.liquidity_tokens_for(r.collateral_amount)
                };
                pool.committed_collateral_liquidity += r.collateral_amount;
                pool.liquidity_token_supply += minted;
                if let Some(entry) = self
                    .position
                    .entries
                    .iter_mut()
                    .find(|e| e.pool_index == r.pool_index)
                {
                    entry.committed_collateral_liquidity += r.collateral_amount;
                }
            }
            ActionRequest::WithdrawLiquidity(r) => {
                self.require_fresh(r.pool_index, current)?;
                let pool = self.pool(r.pool_index)?;
                if r.liquidity_token_amount > pool.liquidity_token_supply {
                    return Err(KeeperError::insufficient_liquidity(
                        r.pool_index,
                        r.liquidity_token_amount,
                        pool.liquidity_token_supply,
                    ));
                }
                let freed = r.liquidity_token_amount * pool.committed_collateral_liquidity
                    / pool.liquidity_token_supply;
                let held = self
                    .position
                    .entry(r.pool_index)
                    .map_or(Decimal::ZERO, |e| e.committed_collateral_liquidity);
                // Token conversion rounds at the last digit; a full withdrawal may land just above.
                let freed = if freed > held && freed - held <= DUST { held } else { freed };
                if freed > held {
                    return Err(KeeperError::insufficient_liquidity(r.pool_index, freed, held));
                }
                let pool = self.pool_mut(r.pool_index)?;
                pool.committed_collateral_liquidity -= freed;
                pool.liquidity_token_supply -= r.liquidity_token_amount;
                if let Some(entry) = self
                    .position
                    .entries
                    .iter_mut()
                    .find(|e| e.pool_index == r.pool_index)
                {
                    entry.committed_collateral_liquidity -= freed;
                }
                self.position.entries.retain(|e| !e.is_removable());
            }
            ActionRequest::AddCollateral(r) => {
                if r.amount > self.manager.collateral_balance {
                    return Err(KeeperError::submission(format!(
                        "manager holds {} collateral, cannot deposit {}",
                        self.manager.collateral_balance, r.amount
                    )));
                }
                self.manager.collateral_balance -= r.amount;
                self.position.collateral += r.amount;
            }
            ActionRequest::WithdrawCollateral(r) => {
                for index in self.held_pools() {
                    self.require_fresh(index, current)?;
                }
                if r.amount > self.position.collateral {
                    return Err(KeeperError::submission(format!(
                        "position holds {} collateral, cannot withdraw {}",
                        self.position.collateral, r.amount
                    )));
                }
                self.position.collateral -= r.amount;
                self.manager.collateral_balance += r.amount;
            }
            ActionRequest::PayRedemption(r) => self.pay_redemption(r)?,
        }
        Ok(())
    }

    fn pay_redemption(&mut self, r: &comet_keeper_core::PayRedemptionRequest) -> Result<()> {
        let slot = self
            .manager
            .redemption_slots
            .get(r.slot_index)
            .and_then(Option::as_ref)
            .ok_or_else(|| KeeperError::submission(format!("slot {} is empty", r.slot_index)))?;
        if slot.subscriber != r.subscriber || slot.membership_tokens != r.membership_tokens {
            return Err(KeeperError::submission(format!(
                "slot {} does not match payout request",
                r.slot_index
            )));
        }
        if r.collateral_amount > self.manager.collateral_balance {
            return Err(KeeperError::submission(format!(
                "manager holds {} collateral, cannot pay {}",
                self.manager.collateral_balance, r.collateral_amount
            )));
        }
        let fee = r.collateral_amount * Decimal::from(self.manager.fees.withdrawal_fee_bps) / BPS;
        let subscriber = self
            .subscriber_mut(&r.subscriber)
            .ok_or_else(|| KeeperError::submission(format!("unknown subscriber {}", r.subscriber)))?;
        if subscriber.membership_tokens < r.membership_tokens {
            return Err(KeeperError::submission(format!(
                "subscriber {} holds {} tokens, cannot redeem {}",
                r.subscriber, subscriber.membership_tokens, r.membership_tokens
            )));
        }
        let principal_share = if subscriber.membership_tokens.is_zero() {
            Decimal::ZERO
        } else {
            subscriber.principal * r.membership_tokens / subscriber.membership_tokens
        };
        subscriber.principal -= principal_share;
        subscriber.membership_tokens -= r.membership_tokens;
        subscriber.redemption_request = None;

        self.subscribers.retain(|s| !s.membership_tokens.is_zero());
        self.manager.collateral_balance -= r.collateral_amount - fee;
        self.manager.fees_accrued += fee;
        self.manager.membership_token_supply -= r.membership_tokens;
        self.manager.redemption_slots[r.slot_index] = None;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Faults {
    next_submission: Option<String>,
    failing_kinds: HashSet<ActionKind>,
}

/// A ledger held in memory.
#[derive(Debug)]
pub struct SimulatedLedger {
    state: Mutex<LedgerState>,
    faults: Mutex<Faults>,
    listeners: Mutex<Vec<mpsc::Sender<AccountUpdate>>>,
    submitted: Mutex<Vec<Batch>>,
}

impl SimulatedLedger {
    #[must_use]
    pub fn new(state: LedgerState) -> Self {
        Self {
            state: Mutex::new(state),
            faults: Mutex::new(Faults::default()),
            listeners: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Loads a JSON fixture.
    ///
    /// # Errors
    /// Returns `KeeperError::Configuration` if the file cannot be read and
    /// `KeeperError::Serialization` if it is not a valid ledger state.
    pub fn from_fixture(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KeeperError::config(format!("cannot read fixture {}: {e}", path.display()))
        })?;
        let state: LedgerState =
            serde_json::from_str(&raw).map_err(|e| KeeperError::Serialization(e.to_string()))?;
        tracing::info!(
            path = %path.display(),
            revision = state.revision,
            pools = state.pools.len(),
            "Loaded simulated ledger fixture"
        );
        Ok(Self::new(state))
    }

    /// Copy of the full state.
    #[must_use]
    pub fn state(&self) -> LedgerState {
        self.state.lock().clone()
    }

    /// Batches committed so far, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<Batch> {
        self.submitted.lock().clone()
    }

    /// Rejects the next submission with `reason`.
    pub fn fail_next_submission(&self, reason: impl Into<String>) {
        self.faults.lock().next_submission = Some(reason.into());
    }

    /// Rejects every batch containing an action of `kind` until cleared.
    pub fn fail_operation_kind(&self, kind: ActionKind) {
        self.faults.lock().failing_kinds.insert(kind);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Moves the ledger forward without applying anything, ageing prices.
    pub fn advance_revision(&self, by: u64) {
        self.state.lock().revision += by;
    }

    /// Publishes a new feed price, picked up by the next price refresh.
    pub fn set_feed_price(&self, oracle_index: u8, raw_price: i64) {
        self.state.lock().feed_prices.insert(oracle_index, raw_price);
    }

    /// Queues a redemption for `owner` in the first free slot.
    ///
    /// # Errors
    /// Fails if the subscriber is unknown, holds fewer tokens than requested
    /// or the queue is full.
    pub fn request_redemption(&self, owner: &Address, membership_tokens: Decimal) -> Result<usize> {
        let mut state = self.state.lock();
        let requested_at = Utc::now();
        let subscriber = state
            .subscriber_mut(owner)
            .ok_or_else(|| KeeperError::InvalidAction(format!("unknown subscriber {owner}")))?;
        if subscriber.membership_tokens < membership_tokens {
            return Err(KeeperError::InvalidAction(format!(
                "subscriber {owner} holds {} tokens",
                subscriber.membership_tokens
            )));
        }
        subscriber.redemption_request = Some(RedemptionRequest {
            membership_tokens,
            requested_at,
        });
        let slot = state
            .manager
            .redemption_slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| KeeperError::InvalidAction("redemption queue is full".into()))?;
        state.manager.redemption_slots[slot] = Some(RedemptionSlot {
            subscriber: *owner,
            membership_tokens,
            requested_at,
        });
        state.revision += 1;
        Ok(slot)
    }

    fn check_faults(&self, batch: &Batch) -> Result<()> {
        let mut faults = self.faults.lock();
        if let Some(reason) = faults.next_submission.take() {
            return Err(KeeperError::submission(reason));
        }
        if let Some(kind) = batch.kinds().into_iter().find(|k| faults.failing_kinds.contains(k)) {
            return Err(KeeperError::submission(format!("injected failure on {kind}")));
        }
        Ok(())
    }

    fn notify(&self, state: &LedgerState, touched: &BTreeSet<Address>) {
        let rev = state.revision;
        let mut updates = vec![
            AccountUpdate::Manager(Versioned::new(state.manager.clone(), rev)),
            AccountUpdate::Position(Versioned::new(state.position.clone(), rev)),
            AccountUpdate::Pools(Versioned::new(state.pools.clone(), rev)),
            AccountUpdate::Oracles(Versioned::new(state.oracles.clone(), rev)),
        ];
        updates.extend(
            state
                .subscribers
                .iter()
                .filter(|s| touched.contains(&s.owner))
                .map(|s| AccountUpdate::Subscriber(Versioned::new(s.clone(), rev))),
        );

        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| !tx.is_closed());
        for tx in listeners.iter() {
            for update in &updates {
                if tx.try_send(update.clone()).is_err() {
                    tracing::warn!(revision = rev, "Listener channel full, dropping update");
                }
            }
        }
    }
}

#[async_trait]
impl LedgerReader for SimulatedLedger {
    async fn revision(&self) -> Result<Revision> {
        Ok(self.state.lock().revision)
    }

    async fn manager_state(&self) -> Result<Versioned<ManagerState>> {
        let state = self.state.lock();
        Ok(Versioned::new(state.manager.clone(), state.revision))
    }

    async fn position(&self) -> Result<Versioned<AggregatedPosition>> {
        let state = self.state.lock();
        Ok(Versioned::new(state.position.clone(), state.revision))
    }

    async fn pools(&self) -> Result<Versioned<Vec<Pool>>> {
        let state = self.state.lock();
        Ok(Versioned::new(state.pools.clone(), state.revision))
    }

    async fn oracles(&self) -> Result<Versioned<Vec<Oracle>>> {
        let state = self.state.lock();
        Ok(Versioned::new(state.oracles.clone(), state.revision))
    }

    async fn subscriber(&self, owner: &Address) -> Result<Option<Versioned<Subscriber>>> {
        let state = self.state.lock();
        Ok(state
            .subscribers
            .iter()
            .find(|s| &s.owner == owner)
            .map(|s| Versioned::new(s.clone(), state.revision)))
    }

    async fn lookup_table(&self, address: &Address) -> Result<Option<AddressLookupTable>> {
        Ok(self
            .state
            .lock()
            .lookup_tables
            .iter()
            .find(|t| &t.address == address)
            .cloned())
    }
}

#[async_trait]
impl LedgerSubmitter for SimulatedLedger {
    async fn submit(&self, batch: &Batch) -> Result<SubmissionReceipt> {
        if batch.is_empty() {
            return Err(KeeperError::InvalidAction("empty batch".into()));
        }
        self.check_faults(batch)?;

        let committed = {
            let mut state = self.state.lock();
            let current = state.revision + 1;
            let mut next = state.clone();
            for (position, op) in batch.operations.iter().enumerate() {
                next.apply(&op.request, current).map_err(|e| {
                    tracing::debug!(position, kind = %op.kind(), error = %e, "Simulated batch rejected");
                    e
                })?;
            }
            next.revision = current;
            *state = next;
            state.clone()
        };

        let touched: BTreeSet<Address> = batch
            .operations
            .iter()
            .filter_map(|op| match &op.request {
                ActionRequest::PayRedemption(r) => Some(r.subscriber),
                _ => None,
            })
            .collect();
        self.notify(&committed, &touched);
        self.submitted.lock().push(batch.clone());

        Ok(SubmissionReceipt {
            revision: committed.revision,
            signature: hex::encode(batch_digest(&batch.operations, batch.lookup_table.as_ref())),
        })
    }

    async fn publish_lookup_table(&self, entries: &[Address]) -> Result<AddressLookupTable> {
        let mut hasher = Sha256::new();
        for entry in entries {
            hasher.update(entry.as_bytes());
        }
        let table = AddressLookupTable {
            address: Address(hasher.finalize().into()),
            entries: entries.to_vec(),
        };
        let mut state = self.state.lock();
        state.lookup_tables.retain(|t| t.address != table.address);
        state.lookup_tables.push(table.clone());
        state.revision += 1;
        Ok(table)
    }
}

#[async_trait]
impl LedgerSubscriber for SimulatedLedger {
    async fn subscribe(&self, tx: mpsc::Sender<AccountUpdate>) -> Result<()> {
        self.listeners.lock().push(tx);
        Ok(())
    }
}
