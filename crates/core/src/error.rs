//! Error taxonomy for the keeper.
//!
//! Every per-cycle failure maps onto one of these variants so the control
//! loop can log a stable `kind()` label and decide whether the cycle is
//! simply retried. Only `Configuration` is fatal, and only at startup.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the keeper and its ledger collaborators.
#[derive(Debug, Error)]
pub enum KeeperError {
    /// The ledger rejected a price-dependent operation because the oracle
    /// refresh predates what the operation requires.
    #[error("stale price: oracle {oracle_index} last updated at revision {last_update}, required {required}")]
    StalePrice {
        /// Oracle that was stale.
        oracle_index: u8,
        /// Revision of the last oracle update.
        last_update: u64,
        /// Minimum revision the operation required.
        required: u64,
    },

    /// A withdrawal asked for more liquidity than the pool or entry holds.
    #[error("insufficient liquidity in pool {pool_index}: requested {requested}, available {available}")]
    InsufficientLiquidity {
        /// Pool the withdrawal targeted.
        pool_index: u8,
        /// Collateral-denominated amount requested.
        requested: Decimal,
        /// Collateral-denominated amount available.
        available: Decimal,
    },

    /// The batch still exceeds the platform ceiling after address compression.
    #[error("batch too large: {accounts} accounts / {bytes} bytes exceeds {max_accounts} accounts / {max_bytes} bytes")]
    BatchTooLarge {
        /// Unique references in the batch.
        accounts: usize,
        /// Reference ceiling.
        max_accounts: usize,
        /// Estimated serialized size.
        bytes: usize,
        /// Size ceiling.
        max_bytes: usize,
    },

    /// The ledger rejected the batch or the submission never reached it.
    #[error("submission failed: {0}")]
    SubmissionFailure(String),

    /// Missing or invalid identifiers, credentials or tunables.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A position entry references a pool that is not in the snapshot.
    #[error("pool {pool_index} not found in snapshot")]
    MissingPool {
        /// The missing pool index.
        pool_index: u8,
    },

    /// A pool references an oracle that is not in the snapshot.
    #[error("oracle {oracle_index} not found in snapshot")]
    MissingOracle {
        /// The missing oracle index.
        oracle_index: u8,
    },

    /// An action failed validation before being placed in a batch.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// The state cache has not been populated yet.
    #[error("state cache not ready: {0}")]
    CacheNotReady(String),

    /// Transport-level failure talking to the ledger.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed payload from the ledger.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key material could not be loaded or used.
    #[error("signing error: {0}")]
    Signing(String),
}

impl KeeperError {
    /// Creates an insufficient liquidity error.
    pub fn insufficient_liquidity(pool_index: u8, requested: Decimal, available: Decimal) -> Self {
        Self::InsufficientLiquidity {
            pool_index,
            requested,
            available,
        }
    }

    /// Creates a submission failure from any displayable reason.
    pub fn submission(reason: impl Into<String>) -> Self {
        Self::SubmissionFailure(reason.into())
    }

    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Stable snake_case label used in cycle outcome logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StalePrice { .. } => "stale_price",
            Self::InsufficientLiquidity { .. } => "insufficient_liquidity",
            Self::BatchTooLarge { .. } => "batch_too_large",
            Self::SubmissionFailure(_) => "submission_failure",
            Self::Configuration(_) => "configuration",
            Self::MissingPool { .. } => "missing_pool",
            Self::MissingOracle { .. } => "missing_oracle",
            Self::InvalidAction(_) => "invalid_action",
            Self::CacheNotReady(_) => "cache_not_ready",
            Self::Network(_) => "network",
            Self::Serialization(_) => "serialization",
            Self::Signing(_) => "signing",
        }
    }

    /// Returns true if the next cycle can be expected to succeed without
    /// operator intervention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Configuration(_) | Self::Signing(_) | Self::BatchTooLarge { .. }
        )
    }

    /// Returns true if the error counts towards submission backoff.
    #[must_use]
    pub const fn is_submission_failure(&self) -> bool {
        matches!(self, Self::SubmissionFailure(_) | Self::Network(_))
    }
}

/// Result type alias for keeper operations.
pub type Result<T> = std::result::Result<T, KeeperError>;
