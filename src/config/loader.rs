//! Configuration loader with tier-based merging.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Defaults = 0,
    Project = 1,
    User = 2,
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        let user_dir = std::env::var("TASK_SETTLEMENT_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".task-settlement")));

        let project_dir = std::env::var("TASK_SETTLEMENT_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("task-settlement")));

        Self {
            project_dir,
            user_dir,
        }
    }

    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }

    fn tier_files(&self) -> Vec<(ConfigTier, PathBuf)> {
        [
            (ConfigTier::Project, &self.project_dir),
            (ConfigTier::User, &self.user_dir),
        ]
        .into_iter()
        .filter_map(|(tier, dir)| dir.as_ref().map(|d| (tier, d.join("config.yaml"))))
        .collect()
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Highest-priority file that contributed (if any).
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load a single explicit file, then apply environment overrides.
    pub fn load_file(path: &Path) -> Result<Self> {
        let mut config = Config::load(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(Self {
            paths: ConfigPaths::with_dirs(None, None),
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Load configuration with explicit paths.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        if let Ok(explicit_path) = std::env::var("TASK_SETTLEMENT_CONFIG_PATH") {
            let mut loader = Self::load_file(Path::new(&explicit_path))?;
            loader.paths = paths;
            return Ok(loader);
        }

        let mut configs: Vec<Value> = Vec::new();
        configs.push(serde_json::to_value(Config::default())?);

        let mut config_path = None;
        for (tier, file) in paths.tier_files() {
            if !file.exists() {
                continue;
            }
            match read_yaml(&file) {
                Ok(value) => {
                    debug!(tier = %tier, path = %file.display(), "loaded config tier");
                    configs.push(value);
                    config_path = Some(file);
                }
                Err(e) => {
                    warn!(tier = %tier, path = %file.display(), error = %e, "ignoring unreadable config file");
                }
            }
        }

        let merged = deep_merge_all(configs);
        let mut config: Config = serde_json::from_value(merged)?;

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

fn read_yaml(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str::<Value>(&content)?)
}

/// Apply `TASK_SETTLEMENT_*` overrides read through `lookup`.
pub(super) fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(db_path) = lookup("TASK_SETTLEMENT_DB_PATH") {
        config.server.db_path = PathBuf::from(db_path);
    }

    if let Some(blob_dir) = lookup("TASK_SETTLEMENT_BLOB_DIR") {
        config.server.blob_dir = PathBuf::from(blob_dir);
    }

    if let Some(port) = lookup("TASK_SETTLEMENT_PORT") {
        config.server.port = port
            .parse()
            .with_context(|| format!("TASK_SETTLEMENT_PORT is not a port: {}", port))?;
    }

    if let Some(mode) = lookup("TASK_SETTLEMENT_CHAIN_MODE") {
        config.chain.mode = mode.parse()?;
    }

    if let Some(url) = lookup("TASK_SETTLEMENT_RPC_URL") {
        config.chain.rpc_url = url;
    }

    if let Some(address) = lookup("TASK_SETTLEMENT_ESCROW_ADDRESS") {
        config.chain.escrow_address = Some(address);
    }

    if let Some(address) = lookup("TASK_SETTLEMENT_SETTLEMENT_ADDRESS") {
        config.chain.settlement_address = Some(address);
    }

    if let Some(address) = lookup("TASK_SETTLEMENT_ELIGIBILITY_REGISTRY") {
        config.chain.eligibility_registry = Some(address);
    }

    if let Some(flag) = lookup("TASK_SETTLEMENT_ALLOW_UNCONFIGURED_ELIGIBILITY") {
        config.chain.allow_unconfigured_eligibility =
            matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }

    Ok(())
}
