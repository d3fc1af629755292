//! Configuration types and structures.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain::normalize_address;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3001;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub tasks: TasksConfig,
}

/// HTTP server and storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory for uploaded proof artifacts.
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,

    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum size of a single uploaded file in bytes (default: 10 MB).
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Maximum number of files per upload request (default: 5).
    #[serde(default = "default_max_upload_files")]
    pub max_upload_files: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            blob_dir: default_blob_dir(),
            bind: default_bind(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
            max_upload_files: default_max_upload_files(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("task-settlement/tasks.db")
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("task-settlement/blobs")
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_upload_files() -> usize {
    5
}

/// Which ledger backs escrow and eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// In-process ledger; nothing leaves the machine (default).
    #[default]
    Memory,
    /// JSON-RPC node holding the operator key.
    Rpc,
}

impl std::str::FromStr for ChainMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(ChainMode::Memory),
            "rpc" => Ok(ChainMode::Rpc),
            other => Err(anyhow!("Unknown chain mode '{}' (expected rpc or memory)", other)),
        }
    }
}

/// Blockchain access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub mode: ChainMode,

    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    #[serde(default)]
    pub chain_id: Option<u64>,

    /// TaskEscrow contract address.
    #[serde(default)]
    pub escrow_address: Option<String>,

    /// Operator address that receives deposits and signs escrow writes.
    #[serde(default)]
    pub settlement_address: Option<String>,

    /// Stake registry contract address. Unset disables eligibility checks
    /// only when `allow_unconfigured_eligibility` is true.
    #[serde(default)]
    pub eligibility_registry: Option<String>,

    #[serde(default)]
    pub allow_unconfigured_eligibility: bool,

    /// Gas limit attached to escrow writes; unset lets the node estimate.
    #[serde(default)]
    pub gas_limit: Option<u64>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,

    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            mode: ChainMode::default(),
            rpc_url: default_rpc_url(),
            chain_id: None,
            escrow_address: None,
            settlement_address: None,
            eligibility_registry: None,
            allow_unconfigured_eligibility: false,
            gas_limit: None,
            request_timeout_ms: default_request_timeout_ms(),
            receipt_timeout_ms: default_receipt_timeout_ms(),
            receipt_poll_ms: default_receipt_poll_ms(),
        }
    }
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_receipt_timeout_ms() -> u64 {
    60_000
}

fn default_receipt_poll_ms() -> u64 {
    1_000
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("chain.escrow_address", &self.escrow_address),
            ("chain.settlement_address", &self.settlement_address),
            ("chain.eligibility_registry", &self.eligibility_registry),
        ] {
            if let Some(address) = value {
                normalize_address(address).map_err(|e| anyhow!("{}: {}", name, e))?;
            }
        }

        if self.request_timeout_ms == 0 || self.receipt_timeout_ms == 0 || self.receipt_poll_ms == 0
        {
            return Err(anyhow!("chain timeouts must be greater than zero"));
        }

        if self.mode == ChainMode::Rpc {
            if self.escrow_address.is_none() {
                return Err(anyhow!("chain.escrow_address is required in rpc mode"));
            }
            if self.settlement_address.is_none() {
                return Err(anyhow!("chain.settlement_address is required in rpc mode"));
            }
        }

        Ok(())
    }
}

/// Task lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_currency")]
    pub default_currency: String,

    #[serde(default = "default_sla_seconds")]
    pub default_sla_seconds: i64,

    /// Minimum provider stake as a multiple of the task budget.
    #[serde(default = "default_min_stake_multiplier")]
    pub min_stake_multiplier: f64,

    /// Age after which a settlement reservation is considered abandoned.
    #[serde(default = "default_stale_settlement_secs")]
    pub stale_settlement_secs: i64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_currency: default_currency(),
            default_sla_seconds: default_sla_seconds(),
            min_stake_multiplier: default_min_stake_multiplier(),
            stale_settlement_secs: default_stale_settlement_secs(),
        }
    }
}

fn default_currency() -> String {
    "MON".to_string()
}

fn default_sla_seconds() -> i64 {
    3600
}

fn default_min_stake_multiplier() -> f64 {
    2.0
}

fn default_stale_settlement_secs() -> i64 {
    300 // 5 minutes
}

impl TasksConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_sla_seconds <= 0 {
            return Err(anyhow!("tasks.default_sla_seconds must be positive"));
        }
        if !self.min_stake_multiplier.is_finite() || self.min_stake_multiplier < 0.0 {
            return Err(anyhow!("tasks.min_stake_multiplier must be a non-negative number"));
        }
        if self.stale_settlement_secs < 0 {
            return Err(anyhow!("tasks.stale_settlement_secs must not be negative"));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Empty or comment-only files parse as null
        let config: Option<Config> = serde_yaml::from_str(&content)?;
        Ok(config.unwrap_or_default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_upload_files == 0 || self.server.max_upload_bytes == 0 {
            return Err(anyhow!("server upload limits must be greater than zero"));
        }
        self.chain.validate()?;
        self.tasks.validate()
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn blob_dir(&self) -> &Path {
        &self.server.blob_dir
    }
}
