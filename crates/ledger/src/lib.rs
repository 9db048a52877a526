pub mod accounts;
pub mod operations;
pub mod push;
pub mod rpc;
pub mod signer;
pub mod simulated;

pub use accounts::AccountSet;
pub use operations::{batch_digest, OperationBuilder};
pub use push::{forward_update, PushSubscriber};
pub use rpc::{JsonRpcLedger, RpcConfig, RpcError};
pub use signer::KeeperSigner;
pub use simulated::{LedgerState, SimulatedLedger};
