use crate::actions::{AddressLookupTable, Batch, SubmissionReceipt};
use crate::address::Address;
use crate::error::Result;
use crate::types::{
    AccountUpdate, AggregatedPosition, ManagerState, Oracle, Pool, Revision, Subscriber, Versioned,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Typed reads of the records the keeper manages.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn revision(&self) -> Result<Revision>;
    async fn manager_state(&self) -> Result<Versioned<ManagerState>>;
    async fn position(&self) -> Result<Versioned<AggregatedPosition>>;
    async fn pools(&self) -> Result<Versioned<Vec<Pool>>>;
    async fn oracles(&self) -> Result<Versioned<Vec<Oracle>>>;
    async fn subscriber(&self, owner: &Address) -> Result<Option<Versioned<Subscriber>>>;
    async fn lookup_table(&self, address: &Address) -> Result<Option<AddressLookupTable>>;
}

/// Atomic, all-or-nothing batch submission.
#[async_trait]
pub trait LedgerSubmitter: Send + Sync {
    async fn submit(&self, batch: &Batch) -> Result<SubmissionReceipt>;
    async fn publish_lookup_table(&self, entries: &[Address]) -> Result<AddressLookupTable>;
}

/// Push notifications for account changes. Implementations forward every
/// update into `tx` until the receiver is dropped.
#[async_trait]
pub trait LedgerSubscriber: Send + Sync {
    async fn subscribe(&self, tx: mpsc::Sender<AccountUpdate>) -> Result<()>;
}
