//! Unified configuration system.
//!
//! Consolidates configuration from tiers with field-by-field YAML merging:
//! 1. **Defaults** - Compiled into the binary
//! 2. **Project** - `$CWD/task-settlement/config.yaml`
//! 3. **User** - `~/.task-settlement/config.yaml`
//! 4. **Environment** - `TASK_SETTLEMENT_*` variables
//!
//! ## Environment Variables
//! - `TASK_SETTLEMENT_CONFIG_PATH` - Explicit config file (overrides all tiers)
//! - `TASK_SETTLEMENT_DB_PATH` - Database path
//! - `TASK_SETTLEMENT_BLOB_DIR` - Upload directory
//! - `TASK_SETTLEMENT_PORT` - HTTP port
//! - `TASK_SETTLEMENT_CHAIN_MODE` - `memory` or `rpc`
//! - `TASK_SETTLEMENT_RPC_URL` - JSON-RPC endpoint
//! - `TASK_SETTLEMENT_ESCROW_ADDRESS` - Escrow contract
//! - `TASK_SETTLEMENT_SETTLEMENT_ADDRESS` - Operator address
//! - `TASK_SETTLEMENT_ELIGIBILITY_REGISTRY` - Stake registry contract
//! - `TASK_SETTLEMENT_ALLOW_UNCONFIGURED_ELIGIBILITY` - Fail-open eligibility
//! - `TASK_SETTLEMENT_USER_DIR` / `TASK_SETTLEMENT_PROJECT_DIR` - Tier directories

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::deep_merge;
pub use types::*;
