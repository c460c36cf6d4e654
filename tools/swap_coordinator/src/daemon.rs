//! Administrative surface of a running coordinator.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::config::{validate_nonzero, Environment, SwapConfig};

/// Protocol id announced to peers; the chain id is appended.
pub const PROTOCOL_ID: &str = "/atomic-swap/0.4";

pub trait ProtocolBackend: Send + Sync {
    fn chain_id(&self) -> u64;
    fn env(&self) -> Environment;
    fn swap_creator_addr(&self) -> Address;
}

/// Backend backed by the environment configuration.
#[derive(Debug, Clone)]
pub struct RuntimeBackend {
    config: SwapConfig,
}

impl RuntimeBackend {
    pub fn new(config: SwapConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SwapConfig {
        &self.config
    }
}

impl ProtocolBackend for RuntimeBackend {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn env(&self) -> Environment {
        self.config.env
    }

    fn swap_creator_addr(&self) -> Address {
        self.config.swap_creator_addr
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub swapd_version: String,
    pub p2p_version: String,
    pub env: Environment,
    #[serde(rename = "swapCreatorAddress")]
    pub swap_creator_addr: Address,
}

pub struct DaemonService {
    backend: Arc<dyn ProtocolBackend>,
    shutdown: watch::Sender<bool>,
    swap_timeout: RwLock<Duration>,
}

impl DaemonService {
    pub fn new(backend: Arc<dyn ProtocolBackend>, swap_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            shutdown,
            swap_timeout: RwLock::new(swap_timeout),
        }
    }

    pub fn version(&self) -> VersionResponse {
        VersionResponse {
            swapd_version: env!("CARGO_PKG_VERSION").to_string(),
            p2p_version: format!("{PROTOCOL_ID}/{}", self.backend.chain_id()),
            env: self.backend.env(),
            swap_creator_addr: self.backend.swap_creator_addr(),
        }
    }

    /// Receivers observe `true` once shutdown is requested.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Timeout used for swaps created from now on.
    pub async fn swap_timeout(&self) -> Duration {
        *self.swap_timeout.read().await
    }

    pub async fn set_swap_timeout(&self, timeout_secs: u64) -> Result<()> {
        validate_nonzero("swap timeout", timeout_secs)?;
        *self.swap_timeout.write().await = Duration::from_secs(timeout_secs);
        info!(timeout_secs, "Swap timeout updated");
        Ok(())
    }
}
