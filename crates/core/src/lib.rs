pub mod actions;
pub mod address;
pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod error;
pub mod traits;
pub mod types;

pub use actions::{
    AccountMeta, ActionKind, ActionRequest, AddCollateralRequest, AddLiquidityRequest,
    AddressLookupTable, Batch, Operation, PayRedemptionRequest, RefreshNetValueRequest,
    RefreshPricesRequest, SubmissionReceipt, WithdrawCollateralRequest, WithdrawLiquidityRequest,
};
pub use address::Address;
pub use config::{AppConfig, BackoffConfig, LedgerConfig, ManagerConfig, ProgramIds, SignerConfig};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use error::{KeeperError, Result};
pub use traits::{LedgerReader, LedgerSubmitter, LedgerSubscriber};
pub use types::{
    AccountUpdate, AggregatedPosition, FeeConfig, ManagerState, ManagerStatus, Oracle, Pool,
    PositionEntry, RedemptionRequest, RedemptionSlot, Revision, Subscriber, Versioned,
    MAX_POSITION_ENTRIES, MAX_REDEMPTION_SLOTS,
};
