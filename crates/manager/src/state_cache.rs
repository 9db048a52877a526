//! Latest known ledger state, owned by the control loop.
//!
//! Push notifications arrive on a bounded channel and are only applied when
//! the loop drains it at the top of a cycle, so a [`Snapshot`] never changes
//! underneath a computation.

use std::collections::HashMap;

use comet_keeper_core::{
    AccountUpdate, Address, AggregatedPosition, KeeperError, LedgerReader, ManagerState, Oracle,
    Pool, Result, Revision, Subscriber, Versioned,
};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

/// Message carried on the cache channel.
pub type CacheUpdate = AccountUpdate;

/// Default depth of the update channel.
pub const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Immutable view of the cache taken at cycle start.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Newest revision among the records in this snapshot.
    pub revision: Revision,
    pub manager: ManagerState,
    pub position: AggregatedPosition,
    pub pools: Vec<Pool>,
    pub oracles: Vec<Oracle>,
    pub subscribers: HashMap<Address, Subscriber>,
}

impl Snapshot {
    /// # Errors
    /// Returns `KeeperError::MissingPool` if the pool is not in the snapshot.
    pub fn pool(&self, index: u8) -> Result<&Pool> {
        self.pools
            .iter()
            .find(|p| p.index == index)
            .ok_or(KeeperError::MissingPool { pool_index: index })
    }

    /// # Errors
    /// Returns `KeeperError::MissingOracle` if the oracle is not in the snapshot.
    pub fn oracle(&self, index: u8) -> Result<&Oracle> {
        self.oracles
            .iter()
            .find(|o| o.index == index)
            .ok_or(KeeperError::MissingOracle { oracle_index: index })
    }

    /// Current price of `pool_index`'s synthetic asset.
    ///
    /// # Errors
    /// Fails if the pool or its oracle is missing.
    pub fn price(&self, pool_index: u8) -> Result<Decimal> {
        let pool = self.pool(pool_index)?;
        self.oracle(pool.oracle_index)?.price()
    }

    /// Pools the position currently holds, in entry order.
    #[must_use]
    pub fn held_pools(&self) -> Vec<u8> {
        self.position.entries.iter().map(|e| e.pool_index).collect()
    }

    #[must_use]
    pub fn subscriber(&self, owner: &Address) -> Option<&Subscriber> {
        self.subscribers.get(owner)
    }
}

/// Keeps the newest copy of each record.
#[derive(Debug)]
pub struct StateCache {
    manager: Option<Versioned<ManagerState>>,
    position: Option<Versioned<AggregatedPosition>>,
    pools: Option<Versioned<Vec<Pool>>>,
    oracles: Option<Versioned<Vec<Oracle>>>,
    subscribers: HashMap<Address, Versioned<Subscriber>>,
    updates: mpsc::Receiver<CacheUpdate>,
}

/// Replaces `slot` unless it already holds a newer revision.
fn store<T>(slot: &mut Option<Versioned<T>>, incoming: Versioned<T>) -> bool {
    if slot.as_ref().is_some_and(|current| incoming.revision < current.revision) {
        return false;
    }
    *slot = Some(incoming);
    true
}

impl StateCache {
    /// Creates an empty cache and the sender push subscriptions write into.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<CacheUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                manager: None,
                position: None,
                pools: None,
                oracles: None,
                subscribers: HashMap::new(),
                updates: rx,
            },
            tx,
        )
    }

    /// Applies one update. Returns `false` if it was older than the cached
    /// record and dropped.
    pub fn apply(&mut self, update: CacheUpdate) -> bool {
        let revision = update.revision();
        let applied = match update {
            AccountUpdate::Manager(v) => store(&mut self.manager, v),
            AccountUpdate::Position(v) => store(&mut self.position, v),
            AccountUpdate::Pools(v) => store(&mut self.pools, v),
            AccountUpdate::Oracles(v) => store(&mut self.oracles, v),
            AccountUpdate::Subscriber(v) => {
                let owner = v.value.owner;
                let mut slot = self.subscribers.remove(&owner);
                let applied = store(&mut slot, v);
                if let Some(record) = slot {
                    self.subscribers.insert(owner, record);
                }
                applied
            }
        };
        if !applied {
            tracing::debug!(revision, "Dropped out-of-date cache update");
        }
        applied
    }

    /// Applies every queued push update. Returns how many were applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.updates.try_recv() {
            if self.apply(update) {
                applied += 1;
            }
        }
        applied
    }

    /// Reads the manager, position, pools and oracles directly, plus the
    /// subscriber record behind every occupied redemption slot.
    ///
    /// # Errors
    /// Propagates the first failed read.
    pub async fn refresh<L: LedgerReader + ?Sized>(&mut self, ledger: &L) -> Result<()> {
        let (manager, position, pools, oracles) = tokio::try_join!(
            ledger.manager_state(),
            ledger.position(),
            ledger.pools(),
            ledger.oracles(),
        )?;

        let owners: Vec<Address> = manager
            .value
            .pending_redemptions()
            .map(|(_, slot)| slot.subscriber)
            .collect();

        self.apply(AccountUpdate::Manager(manager));
        self.apply(AccountUpdate::Position(position));
        self.apply(AccountUpdate::Pools(pools));
        self.apply(AccountUpdate::Oracles(oracles));

        for owner in owners {
            match ledger.subscriber(&owner).await? {
                Some(record) => {
                    self.apply(AccountUpdate::Subscriber(record));
                }
                None => {
                    self.subscribers.remove(&owner);
                }
            }
        }
        Ok(())
    }

    /// Takes an immutable snapshot.
    ///
    /// # Errors
    /// Returns `KeeperError::CacheNotReady` until every record has been read once.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let missing = |what: &str| KeeperError::CacheNotReady(format!("{what} not loaded"));
        let manager = self.manager.as_ref().ok_or_else(|| missing("manager state"))?;
        let position = self.position.as_ref().ok_or_else(|| missing("position"))?;
        let pools = self.pools.as_ref().ok_or_else(|| missing("pools"))?;
        let oracles = self.oracles.as_ref().ok_or_else(|| missing("oracles"))?;

        let revision = [manager.revision, position.revision, pools.revision, oracles.revision]
            .into_iter()
            .max()
            .unwrap_or_default();

        Ok(Snapshot {
            revision,
            manager: manager.value.clone(),
            position: position.value.clone(),
            pools: pools.value.clone(),
            oracles: oracles.value.clone(),
            subscribers: self
                .subscribers
                .iter()
                .map(|(owner, record)| (*owner, record.value.clone()))
                .collect(),
        })
    }
}
