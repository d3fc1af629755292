//! Provider stake eligibility.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::abi::{self, encode_call, Token};
use super::rpc::RpcClient;
use super::{normalize_address, ChainError, StakeRegistry};

const IS_ELIGIBLE: &str = "isEligible(address,uint256)";

pub struct RpcStakeRegistry {
    rpc: Arc<RpcClient>,
    registry_address: String,
}

impl RpcStakeRegistry {
    pub fn new(rpc: Arc<RpcClient>, registry_address: &str) -> Result<Self, ChainError> {
        Ok(Self {
            rpc,
            registry_address: normalize_address(registry_address)?,
        })
    }
}

#[async_trait]
impl StakeRegistry for RpcStakeRegistry {
    async fn is_eligible(&self, provider: &str, min_stake_wei: u128) -> Result<bool, ChainError> {
        let data = encode_call(
            IS_ELIGIBLE,
            &[Token::address(provider)?, Token::Uint(min_stake_wei)],
        );
        let ret = self.rpc.eth_call(&self.registry_address, &data).await?;
        abi::decode_bool(&ret)
    }
}

/// Eligibility gate in front of an optional stake registry.
///
/// Without a registry every check fails with `NotConfigured`, unless
/// `allow_unconfigured` is set, in which case providers are treated as
/// eligible and a warning is logged for each check.
#[derive(Clone)]
pub struct EligibilityChecker {
    registry: Option<Arc<dyn StakeRegistry>>,
    allow_unconfigured: bool,
}

impl EligibilityChecker {
    pub fn new(registry: Option<Arc<dyn StakeRegistry>>, allow_unconfigured: bool) -> Self {
        Self {
            registry,
            allow_unconfigured,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.registry.is_some()
    }

    pub async fn is_eligible(&self, provider: &str, min_stake_wei: u128) -> Result<bool, ChainError> {
        match &self.registry {
            Some(registry) => registry.is_eligible(provider, min_stake_wei).await,
            None if self.allow_unconfigured => {
                warn!(
                    provider,
                    min_stake_wei,
                    "stake registry not configured, treating provider as eligible"
                );
                Ok(true)
            }
            None => Err(ChainError::NotConfigured("stake registry")),
        }
    }
}
