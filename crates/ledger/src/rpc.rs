//! JSON-RPC ledger client with rate limiting.
//!
//! Reads return typed records keyed by the derived [`AccountSet`] addresses.
//! Submissions carry the encoded operations, the optional lookup table and
//! the owner's signature over [`batch_digest`].

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use comet_keeper_core::{
    AccountMeta, Address, AddressLookupTable, AggregatedPosition, Batch, KeeperError,
    LedgerReader, LedgerSubmitter, ManagerState, Oracle, Pool, Result, Revision,
    SubmissionReceipt, Subscriber, Versioned,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::accounts::AccountSet;
use crate::operations::batch_digest;
use crate::signer::KeeperSigner;

/// Ledger error codes with a dedicated [`KeeperError`] mapping.
pub mod codes {
    pub const STALE_PRICE: i64 = -32010;
    pub const INSUFFICIENT_LIQUIDITY: i64 = -32011;
    pub const ACCOUNT_NOT_FOUND: i64 = -32004;
}

/// Errors specific to the JSON-RPC transport.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("rpc response had neither result nor error")]
    EmptyResponse,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

impl From<RpcError> for KeeperError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote {
                code: codes::STALE_PRICE,
                data,
                message,
            } => {
                let field = |name: &str| data.as_ref().and_then(|d| d.get(name)).and_then(Value::as_u64);
                match (field("oracle_index"), field("last_update"), field("required")) {
                    (Some(oracle), Some(last_update), Some(required)) => Self::StalePrice {
                        oracle_index: u8::try_from(oracle).unwrap_or(u8::MAX),
                        last_update,
                        required,
                    },
                    _ => Self::SubmissionFailure(format!("stale price: {message}")),
                }
            }
            RpcError::Remote {
                code: codes::INSUFFICIENT_LIQUIDITY,
                message,
                ..
            } => Self::SubmissionFailure(format!("insufficient liquidity: {message}")),
            RpcError::Remote { code, message, .. } => {
                Self::SubmissionFailure(format!("rpc error {code}: {message}"))
            }
            RpcError::EmptyResponse => {
                Self::Serialization("rpc response had neither result nor error".into())
            }
            RpcError::Http(e) => Self::Network(e.to_string()),
            RpcError::Decode(e) => Self::Serialization(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Serialize)]
struct WireAccount {
    address: Address,
    writable: bool,
    signer: bool,
}

impl From<&AccountMeta> for WireAccount {
    fn from(meta: &AccountMeta) -> Self {
        Self {
            address: meta.address,
            writable: meta.writable,
            signer: meta.signer,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireOperation {
    program_id: Address,
    accounts: Vec<WireAccount>,
    data: String,
}

#[derive(Debug, Serialize)]
struct WireBatch {
    operations: Vec<WireOperation>,
    lookup_table: Option<Address>,
    signer: Address,
    signature: String,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: String,
    pub requests_per_second: NonZeroU32,
    pub timeout_secs: u64,
}

/// HTTP JSON-RPC implementation of the ledger traits.
pub struct JsonRpcLedger {
    config: RpcConfig,
    http: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    accounts: AccountSet,
    signer: Arc<KeeperSigner>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for JsonRpcLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcLedger")
            .field("url", &self.config.url)
            .field("requests_per_second", &self.config.requests_per_second)
            .finish_non_exhaustive()
    }
}

impl JsonRpcLedger {
    /// Creates a client.
    ///
    /// # Errors
    /// Returns `KeeperError::Network` if the HTTP client cannot be built.
    pub fn new(config: RpcConfig, accounts: AccountSet, signer: Arc<KeeperSigner>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KeeperError::Network(format!("failed to build HTTP client: {e}")))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(
            config.requests_per_second,
        )));
        Ok(Self {
            config,
            http,
            rate_limiter,
            accounts,
            signer,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> std::result::Result<T, RpcError> {
        self.rate_limiter.until_ready().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(method, id, "rpc call");

        let response: RpcResponse<T> = self
            .http
            .post(&self.config.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(RpcError::Remote {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        response.result.ok_or(RpcError::EmptyResponse)
    }

    async fn read<T: DeserializeOwned>(&self, method: &str, address: &Address) -> Result<T> {
        Ok(self.call(method, json!([address])).await?)
    }
}

#[async_trait]
impl LedgerReader for JsonRpcLedger {
    async fn revision(&self) -> Result<Revision> {
        Ok(self.call("getRevision", json!([])).await?)
    }

    async fn manager_state(&self) -> Result<Versioned<ManagerState>> {
        self.read("getManagerState", &self.accounts.manager_info).await
    }

    async fn position(&self) -> Result<Versioned<AggregatedPosition>> {
        self.read("getPosition", &self.accounts.position).await
    }

    async fn pools(&self) -> Result<Versioned<Vec<Pool>>> {
        self.read("getPools", &self.accounts.pools).await
    }

    async fn oracles(&self) -> Result<Versioned<Vec<Oracle>>> {
        self.read("getOracles", &self.accounts.oracles).await
    }

    async fn subscriber(&self, owner: &Address) -> Result<Option<Versioned<Subscriber>>> {
        let address = self.accounts.subscriber(owner);
        match self.call("getSubscriber", json!([address])).await {
            Ok(record) => Ok(Some(record)),
            Err(RpcError::Remote {
                code: codes::ACCOUNT_NOT_FOUND,
                ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup_table(&self, address: &Address) -> Result<Option<AddressLookupTable>> {
        match self.call("getLookupTable", json!([address])).await {
            Ok(table) => Ok(Some(table)),
            Err(RpcError::Remote {
                code: codes::ACCOUNT_NOT_FOUND,
                ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LedgerSubmitter for JsonRpcLedger {
    async fn submit(&self, batch: &Batch) -> Result<SubmissionReceipt> {
        let digest = batch_digest(&batch.operations, batch.lookup_table.as_ref());
        let wire = WireBatch {
            operations: batch
                .operations
                .iter()
                .map(|op| WireOperation {
                    program_id: op.program_id,
                    accounts: op.accounts.iter().map(WireAccount::from).collect(),
                    data: BASE64.encode(&op.data),
                })
                .collect(),
            lookup_table: batch.lookup_table,
            signer: self.signer.authority(),
            signature: self.signer.sign_digest(&digest)?,
        };
        Ok(self.call("submitBatch", json!([wire])).await?)
    }

    async fn publish_lookup_table(&self, entries: &[Address]) -> Result<AddressLookupTable> {
        Ok(self
            .call("publishLookupTable", json!([entries, self.signer.authority()]))
            .await?)
    }
}
