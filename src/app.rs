//! Wiring from configuration to a ready [`Lifecycle`].

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::blobs::BlobStore;
use crate::chain::{
    to_wei, EligibilityChecker, EscrowClient, MemoryLedger, RpcClient, RpcEscrowClient,
    RpcStakeRegistry, StakeRegistry,
};
use crate::config::{ChainConfig, ChainMode, Config};
use crate::db::Database;
use crate::lifecycle::Lifecycle;

/// Chain-facing half of the service.
pub struct ChainBackend {
    pub escrow: Arc<dyn EscrowClient>,
    pub eligibility: EligibilityChecker,
    /// Present in memory mode so callers can seed deposits and stakes.
    pub ledger: Option<Arc<MemoryLedger>>,
}

impl ChainBackend {
    pub fn from_config(chain: &ChainConfig) -> Result<Self> {
        match chain.mode {
            ChainMode::Memory => {
                let ledger = Arc::new(match &chain.settlement_address {
                    Some(address) => MemoryLedger::new(address),
                    None => MemoryLedger::default(),
                });
                let registry: Arc<dyn StakeRegistry> = ledger.clone();
                info!(
                    settlement_address = ledger.settlement_address(),
                    "using in-memory ledger"
                );
                Ok(Self {
                    escrow: ledger.clone(),
                    eligibility: EligibilityChecker::new(Some(registry), false),
                    ledger: Some(ledger),
                })
            }
            ChainMode::Rpc => {
                let rpc = Arc::new(
                    RpcClient::new(
                        chain.rpc_url.clone(),
                        chain.request_timeout(),
                        chain.receipt_timeout(),
                        chain.receipt_poll_interval(),
                    )
                    .context("Failed to build RPC client")?,
                );

                let escrow_address = chain
                    .escrow_address
                    .as_deref()
                    .context("chain.escrow_address is required in rpc mode")?;
                let settlement_address = chain
                    .settlement_address
                    .as_deref()
                    .context("chain.settlement_address is required in rpc mode")?;

                let escrow = RpcEscrowClient::new(
                    Arc::clone(&rpc),
                    escrow_address,
                    settlement_address,
                    chain.gas_limit,
                )?;

                let registry = match &chain.eligibility_registry {
                    Some(address) => {
                        let registry: Arc<dyn StakeRegistry> =
                            Arc::new(RpcStakeRegistry::new(Arc::clone(&rpc), address)?);
                        Some(registry)
                    }
                    None => None,
                };

                if registry.is_none() && chain.allow_unconfigured_eligibility {
                    error!(
                        "ELIGIBILITY CHECKS DISABLED: no stake registry configured and \
                         allow_unconfigured_eligibility is set; every provider is treated as eligible"
                    );
                }

                info!(
                    rpc_url = %chain.rpc_url,
                    escrow = escrow_address,
                    chain_id = ?chain.chain_id,
                    "using JSON-RPC chain backend"
                );

                Ok(Self {
                    escrow: Arc::new(escrow),
                    eligibility: EligibilityChecker::new(
                        registry,
                        chain.allow_unconfigured_eligibility,
                    ),
                    ledger: None,
                })
            }
        }
    }
}

/// Everything a command needs.
pub struct App {
    pub lifecycle: Lifecycle,
    pub blobs: BlobStore,
    pub ledger: Option<Arc<MemoryLedger>>,
}

impl App {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        config.ensure_db_dir()?;

        let db = Database::open(&config.server.db_path).with_context(|| {
            format!(
                "Failed to open database {}",
                config.server.db_path.display()
            )
        })?;
        let chain = ChainBackend::from_config(&config.chain)?;

        let app = Self::assemble(db, chain, config);
        let seeded = app.seed_ledger_stakes()?;
        if seeded > 0 {
            info!(providers = seeded, "seeded in-memory stakes from provider records");
        }
        Ok(app)
    }

    /// Load each stored provider's declared stake into the memory ledger.
    ///
    /// The ledger does not outlive the process, so provider records are the
    /// only durable source of stake in memory mode. No-op in rpc mode.
    pub fn seed_ledger_stakes(&self) -> Result<usize> {
        let Some(ledger) = &self.ledger else {
            return Ok(0);
        };

        let mut seeded = 0;
        for provider in self.lifecycle.db().list_providers(None)? {
            match to_wei(provider.stake_amount) {
                Some(stake_wei) => {
                    ledger.set_stake(&provider.wallet_address, stake_wei);
                    seeded += 1;
                }
                None => warn!(
                    provider = %provider.id,
                    stake = provider.stake_amount,
                    "skipping provider with unrepresentable stake"
                ),
            }
        }
        Ok(seeded)
    }

    pub fn assemble(db: Database, chain: ChainBackend, config: &Config) -> Self {
        let lifecycle = Lifecycle::new(
            db,
            chain.escrow,
            chain.eligibility,
            config.tasks.clone(),
        );
        let blobs = BlobStore::new(
            config.server.blob_dir.clone(),
            config.server.max_upload_bytes,
            config.server.max_upload_files,
        );
        Self {
            lifecycle,
            blobs,
            ledger: chain.ledger,
        }
    }
}
