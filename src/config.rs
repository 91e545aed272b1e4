//! Configuration management for the L1 transaction manager
//!
//! Loads configuration from TOML files with environment variable substitution.
//! [`L1TxConfig`] is the transaction policy; every field has a default so a
//! bare `[tx]` section is valid.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{L1TxError, L1TxResult};

/// Root configuration structure for the binary
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub l1: L1Config,
    #[serde(default)]
    pub tx: L1TxConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct L1Config {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    /// Name of the environment variable holding the signing key
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Transaction policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L1TxConfig {
    /// Buffer added on top of the node's gas estimate, in percent
    pub gas_limit_buffer_percentage: f64,
    /// Cap on `maxFeePerGas`, in gwei
    pub max_gwei: u64,
    /// Cap on `maxFeePerBlobGas`, in gwei
    pub max_blob_gwei: u64,
    /// Buffer on the node's priority fee estimate for first attempts
    pub priority_fee_bump_percentage: f64,
    /// Bump applied to every replacement
    pub priority_fee_retry_bump_percentage: f64,
    /// Replacement floor enforced by mempools; callers can only raise it
    pub minimum_bump_percentage: f64,
    /// Use this priority fee (gwei) instead of the node estimate
    pub fixed_priority_fee_per_gas: Option<f64>,
    pub max_speed_up_attempts: u32,
    pub check_interval_ms: u64,
    pub stall_time_ms: u64,
    pub tx_timeout_ms: u64,
    /// Absolute deadline, takes precedence over `tx_timeout_ms`
    pub tx_timeout_at: Option<DateTime<Utc>>,
    pub cancel_tx_on_timeout: bool,
    pub tx_cancellation_final_timeout_ms: u64,
    pub tx_unseen_considered_dropped_ms: u64,
    /// Expected block interval of the base layer
    pub block_time_ms: u64,
    /// Largest base fee increase one block can carry, in percent
    pub base_fee_growth_per_block_percentage: f64,
}

pub const MIN_REPLACEMENT_BUMP_PERCENTAGE: f64 = 10.0;

impl Default for L1TxConfig {
    fn default() -> Self {
        Self {
            gas_limit_buffer_percentage: 20.0,
            max_gwei: 500,
            max_blob_gwei: 1_500,
            priority_fee_bump_percentage: 20.0,
            priority_fee_retry_bump_percentage: 50.0,
            minimum_bump_percentage: MIN_REPLACEMENT_BUMP_PERCENTAGE,
            fixed_priority_fee_per_gas: None,
            max_speed_up_attempts: 3,
            check_interval_ms: 1_000,
            stall_time_ms: 45_000,
            tx_timeout_ms: 300_000,
            tx_timeout_at: None,
            cancel_tx_on_timeout: true,
            tx_cancellation_final_timeout_ms: 600_000,
            tx_unseen_considered_dropped_ms: 72_000,
            block_time_ms: 12_000,
            base_fee_growth_per_block_percentage: 12.5,
        }
    }
}

/// Per-transaction overrides of [`L1TxConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfigOverrides {
    pub gas_limit_buffer_percentage: Option<f64>,
    pub max_gwei: Option<u64>,
    pub max_blob_gwei: Option<u64>,
    pub priority_fee_bump_percentage: Option<f64>,
    pub priority_fee_retry_bump_percentage: Option<f64>,
    pub minimum_bump_percentage: Option<f64>,
    pub fixed_priority_fee_per_gas: Option<f64>,
    pub max_speed_up_attempts: Option<u32>,
    pub check_interval_ms: Option<u64>,
    pub stall_time_ms: Option<u64>,
    pub tx_timeout_ms: Option<u64>,
    pub tx_timeout_at: Option<DateTime<Utc>>,
    pub cancel_tx_on_timeout: Option<bool>,
    pub tx_cancellation_final_timeout_ms: Option<u64>,
    pub tx_unseen_considered_dropped_ms: Option<u64>,
}

impl L1TxConfig {
    /// Apply per-transaction overrides on top of this policy
    pub fn with_overrides(&self, o: &TxConfigOverrides) -> Self {
        let mut c = self.clone();
        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(v) = o.$field { c.$field = v; })*
            };
        }
        apply!(
            gas_limit_buffer_percentage,
            max_gwei,
            max_blob_gwei,
            priority_fee_bump_percentage,
            priority_fee_retry_bump_percentage,
            max_speed_up_attempts,
            check_interval_ms,
            stall_time_ms,
            tx_timeout_ms,
            cancel_tx_on_timeout,
            tx_cancellation_final_timeout_ms,
            tx_unseen_considered_dropped_ms
        );
        if let Some(v) = o.minimum_bump_percentage {
            c.minimum_bump_percentage = v.max(self.minimum_bump_percentage);
        }
        if o.fixed_priority_fee_per_gas.is_some() {
            c.fixed_priority_fee_per_gas = o.fixed_priority_fee_per_gas;
        }
        if o.tx_timeout_at.is_some() {
            c.tx_timeout_at = o.tx_timeout_at;
        }
        c
    }

    /// Effective replacement bump: never below the mempool floor
    pub fn retry_bump_percentage(&self) -> f64 {
        self.priority_fee_retry_bump_percentage
            .max(self.minimum_bump_percentage)
            .max(MIN_REPLACEMENT_BUMP_PERCENTAGE)
    }

    /// Number of blocks after which a pending transaction counts as stalled
    pub fn stall_blocks(&self) -> u64 {
        let block_time = self.block_time_ms.max(1);
        self.stall_time_ms.div_ceil(block_time).max(1)
    }

    pub fn validate(&self) -> L1TxResult<()> {
        if self.check_interval_ms == 0 {
            return Err(L1TxError::Config("check_interval_ms must be positive".into()));
        }
        if self.block_time_ms == 0 {
            return Err(L1TxError::Config("block_time_ms must be positive".into()));
        }
        if self.max_gwei == 0 || self.max_blob_gwei == 0 {
            return Err(L1TxError::Config("gas price caps must be positive".into()));
        }
        if self.gas_limit_buffer_percentage < 0.0
            || self.priority_fee_bump_percentage < 0.0
            || self.priority_fee_retry_bump_percentage < 0.0
        {
            return Err(L1TxError::Config("percentages must not be negative".into()));
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("L1TX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.l1.rpc_urls.is_empty() {
            anyhow::bail!("No L1 RPC URLs configured");
        }
        self.tx.validate()?;
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
