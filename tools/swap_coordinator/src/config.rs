use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::{address, Address};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::contract::ConfirmationConfig;

pub const MAINNET_CHAIN_ID: u64 = 1;
pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;
pub const DEVELOPMENT_CHAIN_ID: u64 = 1337;

/// Average Ethereum block time, used to turn a confirmation depth into wall time.
pub const BLOCK_TIME: Duration = Duration::from_secs(12);

pub const DEFAULT_ETH_KEY_FILE: &str = "eth.key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Mainnet,
    Stagenet,
    Development,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mainnet => "mainnet",
            Self::Stagenet => "stagenet",
            Self::Development => "dev",
        };
        f.write_str(name)
    }
}

/// Network-level defaults for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    pub env: Environment,
    pub chain_id: u64,
    pub data_dir: PathBuf,
    pub swap_creator_addr: Address,
    pub forwarder_addr: Address,
    pub swap_timeout: Duration,
    pub confirmations: u64,
}

impl SwapConfig {
    pub fn for_env(env: Environment) -> Self {
        match env {
            Environment::Mainnet => Self::mainnet(),
            Environment::Stagenet => Self::stagenet(),
            Environment::Development => Self::development(),
        }
    }

    pub fn mainnet() -> Self {
        Self {
            env: Environment::Mainnet,
            chain_id: MAINNET_CHAIN_ID,
            data_dir: base_dir().join("mainnet"),
            // No mainnet swap creator has been deployed yet.
            swap_creator_addr: Address::ZERO,
            forwarder_addr: address!("B2b5841DBeF766d4b521221732F9B618fCf34A87"),
            swap_timeout: swap_timeout_for_env(Environment::Mainnet),
            confirmations: 12,
        }
    }

    pub fn stagenet() -> Self {
        Self {
            env: Environment::Stagenet,
            chain_id: SEPOLIA_CHAIN_ID,
            data_dir: base_dir().join("stagenet"),
            swap_creator_addr: address!("45cc2dB5021dc9C01513D9ee7914b61810bd6Ad6"),
            forwarder_addr: address!("a030E074b8398005a454CB7c51E9b7CDb966744a"),
            swap_timeout: swap_timeout_for_env(Environment::Stagenet),
            confirmations: 3,
        }
    }

    pub fn development() -> Self {
        Self {
            env: Environment::Development,
            chain_id: DEVELOPMENT_CHAIN_ID,
            data_dir: base_dir().join("dev"),
            swap_creator_addr: Address::ZERO,
            forwarder_addr: Address::ZERO,
            swap_timeout: swap_timeout_for_env(Environment::Development),
            confirmations: 1,
        }
    }

    pub fn eth_key_file(&self) -> PathBuf {
        self.data_dir.join(DEFAULT_ETH_KEY_FILE)
    }

    pub fn confirmation(&self) -> ConfirmationConfig {
        ConfirmationConfig {
            depth: self.confirmations.max(1),
            ..ConfirmationConfig::default()
        }
    }

    /// Time to stop retrying before a deadline: one confirmation depth worth of blocks.
    pub fn deadline_margin(&self) -> Duration {
        BLOCK_TIME.saturating_mul(self.confirmations.max(1) as u32)
    }
}

pub fn swap_timeout_for_env(env: Environment) -> Duration {
    match env {
        Environment::Mainnet | Environment::Stagenet => Duration::from_secs(60 * 60),
        Environment::Development => Duration::from_secs(2 * 60),
    }
}

fn base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".atomicswap")
}

pub fn validate_rpc_url(label: &str, value: &str) -> Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!("{label} must start with http:// or https://"))
    }
}

pub fn validate_nonzero(label: &str, value: u64) -> Result<()> {
    if value == 0 {
        Err(anyhow!("{label} must be greater than zero"))
    } else {
        Ok(())
    }
}
