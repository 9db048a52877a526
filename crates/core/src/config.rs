use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::address::Address;
use crate::error::{KeeperError, Result};
use crate::types::MAX_REDEMPTION_SLOTS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub manager: ManagerConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub failure_backoff: BackoffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub ws_url: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Program that owns pools, oracles and the aggregated position.
    #[serde(default)]
    pub comet_program_id: String,
    /// Program that owns manager and subscriber records.
    #[serde(default)]
    pub manager_program_id: String,
    /// Previously published address-compression table, if any.
    #[serde(default)]
    pub lookup_table: Option<String>,
    /// Oracle revisions a price may lag before the ledger rejects it.
    #[serde(default)]
    pub max_price_age: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Identity that owns the manager and signs its batches.
    #[serde(default)]
    pub owner: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    pub target_health_score: Decimal,
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: Decimal,
    #[serde(default = "default_max_redemptions")]
    pub max_redemptions_per_cycle: usize,
    /// Pools to open entries in when not yet held.
    #[serde(default)]
    pub seed_pools: Vec<u8>,
    /// Relative divergence between local and ledger net value that is logged.
    #[serde(default = "default_net_value_tolerance")]
    pub net_value_tolerance: Decimal,
    /// Decimal places of the collateral token; payouts round down to this.
    #[serde(default = "default_collateral_decimals")]
    pub collateral_decimals: u32,
}

/// Where the signing key comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SignerConfig {
    /// Hex key in an environment variable.
    Env { var: String },
    /// Hex key in a local file.
    File { path: PathBuf },
    /// Remote secret store returning `{"secret": "<hex>"}`.
    Remote {
        url: String,
        /// Environment variable holding a bearer token for the store.
        #[serde(default)]
        token_env: Option<String>,
    },
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self::Env {
            var: "KEEPER_SIGNER_KEY".to_string(),
        }
    }
}

/// Exponential backoff after consecutive submission failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_secs: default_backoff_base(),
            max_secs: default_backoff_max(),
        }
    }
}

const fn default_requests_per_second() -> u32 {
    10
}

const fn default_poll_interval() -> u64 {
    30
}

fn default_rebalance_threshold() -> Decimal {
    Decimal::new(5, 2) // 5%
}

const fn default_max_redemptions() -> usize {
    8
}

fn default_net_value_tolerance() -> Decimal {
    Decimal::new(1, 2) // 1%
}

const fn default_collateral_decimals() -> u32 {
    6
}

const fn default_backoff_base() -> u64 {
    5
}

const fn default_backoff_max() -> u64 {
    300
}

/// Program ids and the manager owner, parsed from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramIds {
    pub comet_program: Address,
    pub manager_program: Address,
    pub manager_owner: Address,
}

fn required_address(field: &str, value: &str) -> Result<Address> {
    if value.trim().is_empty() {
        return Err(KeeperError::config(format!("missing {field}")));
    }
    value
        .parse()
        .map_err(|e| KeeperError::config(format!("{field}: {e}")))
}

impl AppConfig {
    /// Checks identifiers and tunables. Any error here aborts startup.
    ///
    /// # Errors
    /// Returns `KeeperError::Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        self.program_ids()?;
        if let Some(table) = &self.ledger.lookup_table {
            required_address("ledger.lookup_table", table)?;
        }
        if self.ledger.rpc_url.trim().is_empty() {
            return Err(KeeperError::config("missing ledger.rpc_url"));
        }
        if self.ledger.requests_per_second == 0 {
            return Err(KeeperError::config("ledger.requests_per_second must be > 0"));
        }
        self.manager.validate()?;
        if self.failure_backoff.enabled && self.failure_backoff.base_secs == 0 {
            return Err(KeeperError::config("failure_backoff.base_secs must be > 0"));
        }
        Ok(())
    }

    /// Parses the configured program ids and manager owner.
    ///
    /// # Errors
    /// Returns `KeeperError::Configuration` if any identifier is missing or malformed.
    pub fn program_ids(&self) -> Result<ProgramIds> {
        Ok(ProgramIds {
            comet_program: required_address("ledger.comet_program_id", &self.ledger.comet_program_id)?,
            manager_program: required_address(
                "ledger.manager_program_id",
                &self.ledger.manager_program_id,
            )?,
            manager_owner: required_address("manager.owner", &self.manager.owner)?,
        })
    }

    /// Parsed lookup table address, if configured.
    ///
    /// # Errors
    /// Returns `KeeperError::Configuration` if the address is malformed.
    pub fn lookup_table(&self) -> Result<Option<Address>> {
        self.ledger
            .lookup_table
            .as_deref()
            .map(|t| required_address("ledger.lookup_table", t))
            .transpose()
    }
}

impl ManagerConfig {
    /// Checks the tunables that can change at runtime.
    ///
    /// # Errors
    /// Returns `KeeperError::Configuration` for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        let hundred = Decimal::from(100);
        if self.target_health_score <= Decimal::ZERO || self.target_health_score > hundred {
            return Err(KeeperError::config(format!(
                "manager.target_health_score must be in (0, 100], got {}",
                self.target_health_score
            )));
        }
        if self.rebalance_threshold < Decimal::ZERO || self.rebalance_threshold >= Decimal::ONE {
            return Err(KeeperError::config(format!(
                "manager.rebalance_threshold must be in [0, 1), got {}",
                self.rebalance_threshold
            )));
        }
        if self.max_redemptions_per_cycle == 0 || self.max_redemptions_per_cycle > MAX_REDEMPTION_SLOTS {
            return Err(KeeperError::config(format!(
                "manager.max_redemptions_per_cycle must be in 1..={MAX_REDEMPTION_SLOTS}, got {}",
                self.max_redemptions_per_cycle
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(KeeperError::config("manager.poll_interval_secs must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample() -> AppConfig {
        AppConfig {
            ledger: LedgerConfig {
                rpc_url: "http://127.0.0.1:8899".to_string(),
                ws_url: "ws://127.0.0.1:8900".to_string(),
                requests_per_second: 10,
                comet_program_id: "11".repeat(32),
                manager_program_id: "22".repeat(32),
                lookup_table: None,
                max_price_age: 0,
            },
            manager: ManagerConfig {
                owner: "33".repeat(32),
                poll_interval_secs: 30,
                target_health_score: dec!(90),
                rebalance_threshold: dec!(0.05),
                max_redemptions_per_cycle: 8,
                seed_pools: vec![],
                net_value_tolerance: dec!(0.01),
                collateral_decimals: 6,
            },
            signer: SignerConfig::default(),
            failure_backoff: BackoffConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn missing_program_id_is_a_configuration_error() {
        let mut config = sample();
        config.ledger.comet_program_id = String::new();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, KeeperError::Configuration(_)));
        assert!(err.to_string().contains("comet_program_id"));
    }

    #[test]
    fn out_of_range_tunables_are_rejected() {
        let mut config = sample();
        config.manager.target_health_score = dec!(120);
        assert!(config.validate().is_err());

        let mut config = sample();
        config.manager.max_redemptions_per_cycle = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.manager.rebalance_threshold = dec!(1.5);
        assert!(config.validate().is_err());
    }
}
