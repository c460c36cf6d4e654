//! Typed access to the swap creator contract.
//!
//! [`ChainBackend`] is the raw chain seam (submit, receipts, reads). [`SwapContract`]
//! layers nonce serialization, confirmation depth and bytecode verification on top.

pub mod abi;
pub mod confirm;
pub mod ethereum;
pub mod memory;
pub mod nonce;
pub mod verify;

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swap_keys::Secret;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::params::{SwapId, SwapParameters};
use crate::relay::RelayClaimRequest;
use confirm::{ConfirmationWatcher, WatcherConfig, WatcherEvent};
use nonce::NonceManager;
use verify::{check_swap_creator_code, ExpectedContract};

/// On-chain stage of one swap record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Invalid,
    Pending,
    Ready,
    Completed,
}

impl From<u8> for Stage {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Pending,
            2 => Self::Ready,
            3 => Self::Completed,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    Ready { swap_id: SwapId },
    Claimed { swap_id: SwapId, secret: B256 },
    Refunded { swap_id: SwapId, secret: B256 },
}

impl ChainEvent {
    pub fn swap_id(&self) -> SwapId {
        match self {
            Self::Ready { swap_id }
            | Self::Claimed { swap_id, .. }
            | Self::Refunded { swap_id, .. } => *swap_id,
        }
    }
}

/// A state-changing call against the swap creator.
#[derive(Debug, Clone)]
pub enum SwapCall {
    NewSwap(SwapParameters),
    SetReady(SwapParameters),
    Claim {
        params: SwapParameters,
        secret: B256,
    },
    ClaimRelayer {
        params: SwapParameters,
        secret: B256,
        fee: U256,
        signature: Bytes,
    },
    Refund {
        params: SwapParameters,
        secret: B256,
    },
}

impl SwapCall {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NewSwap(_) => "new_swap",
            Self::SetReady(_) => "set_ready",
            Self::Claim { .. } => "claim",
            Self::ClaimRelayer { .. } => "claim_relayer",
            Self::Refund { .. } => "refund",
        }
    }

    pub fn params(&self) -> &SwapParameters {
        match self {
            Self::NewSwap(params) | Self::SetReady(params) => params,
            Self::Claim { params, .. }
            | Self::ClaimRelayer { params, .. }
            | Self::Refund { params, .. } => params,
        }
    }

    /// Wei attached to the transaction.
    pub fn value(&self) -> U256 {
        match self {
            Self::NewSwap(params) if params.is_eth() => params.value,
            _ => U256::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inclusion {
    pub block_number: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub confirmations: u64,
}

/// Where a swap lives: the swap creator address and the record key inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractHandle {
    pub address: Address,
    pub swap_id: SwapId,
}

#[derive(Debug, Clone, Error)]
pub enum ContractError {
    #[error("caller not permitted: {0}")]
    Unauthorized(String),
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("transaction {tx_hash} not confirmed after {waited:?}")]
    ConfirmationTimeout { tx_hash: B256, waited: Duration },
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("deployed bytecode does not match the swap creator contract")]
    InvalidContract,
    #[error("swap {0} not found on chain")]
    SwapNotFound(SwapId),
}

impl ContractError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_) | Self::ConfirmationTimeout { .. }
        )
    }
}

#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Account that signs submitted transactions.
    fn sender(&self) -> Address;

    async fn chain_id(&self) -> Result<u64, ContractError>;

    async fn pending_nonce(&self) -> Result<u64, ContractError>;

    /// Broadcasts `call` with an explicit nonce. Calls the contract would reject are
    /// reported here, before anything reaches the mempool.
    async fn submit(
        &self,
        contract: Address,
        call: SwapCall,
        nonce: u64,
    ) -> Result<B256, ContractError>;

    async fn inclusion(&self, tx_hash: B256) -> Result<Option<Inclusion>, ContractError>;

    async fn block_number(&self) -> Result<u64, ContractError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, ContractError>;

    async fn swap_stage(&self, contract: Address, swap_id: SwapId) -> Result<Stage, ContractError>;

    async fn swap_events(
        &self,
        contract: Address,
        swap_id: SwapId,
    ) -> Result<Vec<ChainEvent>, ContractError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    pub depth: u64,
    pub reorg_buffer: u64,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            depth: 1,
            reorg_buffer: 5,
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Swap creator client for one signing account.
#[derive(Clone)]
pub struct SwapContract {
    backend: Arc<dyn ChainBackend>,
    nonces: Arc<NonceManager>,
    confirmation: ConfirmationConfig,
    address: Address,
}

impl SwapContract {
    pub fn new(
        backend: Arc<dyn ChainBackend>,
        nonces: Arc<NonceManager>,
        confirmation: ConfirmationConfig,
        address: Address,
    ) -> Self {
        Self {
            backend,
            nonces,
            confirmation,
            address,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sender(&self) -> Address {
        self.backend.sender()
    }

    pub fn backend(&self) -> &Arc<dyn ChainBackend> {
        &self.backend
    }

    pub fn confirmation(&self) -> ConfirmationConfig {
        self.confirmation
    }

    /// Same account and settings against another swap creator address.
    pub fn at(&self, address: Address) -> Self {
        Self {
            address,
            ..self.clone()
        }
    }

    pub fn handle_for(&self, params: &SwapParameters) -> ContractHandle {
        ContractHandle {
            address: self.address,
            swap_id: params.swap_id(),
        }
    }

    /// Creates the swap record, funding it with `params.value`.
    pub async fn deploy(
        &self,
        params: &SwapParameters,
    ) -> Result<(ContractHandle, Receipt), ContractError> {
        let handle = self.handle_for(params);
        let receipt = self.send(SwapCall::NewSwap(params.clone())).await?;
        match self.stage(&handle).await? {
            Stage::Invalid => Err(ContractError::SwapNotFound(handle.swap_id)),
            stage => {
                info!(swap_id = %handle.swap_id, ?stage, tx_hash = %receipt.tx_hash, "Swap created on chain");
                Ok((handle, receipt))
            }
        }
    }

    pub async fn set_ready(
        &self,
        handle: &ContractHandle,
        params: &SwapParameters,
    ) -> Result<Receipt, ContractError> {
        self.at(handle.address)
            .send(SwapCall::SetReady(params.clone()))
            .await
    }

    pub async fn claim(
        &self,
        handle: &ContractHandle,
        params: &SwapParameters,
        secret: &Secret,
    ) -> Result<Receipt, ContractError> {
        self.at(handle.address)
            .send(SwapCall::Claim {
                params: params.clone(),
                secret: B256::from(secret.to_bytes()),
            })
            .await
    }

    /// Submits a counterparty-signed claim; the sender only pays gas and earns the fee.
    pub async fn claim_relayer(
        &self,
        request: &RelayClaimRequest,
    ) -> Result<Receipt, ContractError> {
        self.at(request.swap_creator_addr)
            .send(SwapCall::ClaimRelayer {
                params: request.swap.clone(),
                secret: request.secret,
                fee: request.fee,
                signature: request.signature.clone(),
            })
            .await
    }

    pub async fn refund(
        &self,
        handle: &ContractHandle,
        params: &SwapParameters,
        secret: &Secret,
    ) -> Result<Receipt, ContractError> {
        self.at(handle.address)
            .send(SwapCall::Refund {
                params: params.clone(),
                secret: B256::from(secret.to_bytes()),
            })
            .await
    }

    pub async fn stage(&self, handle: &ContractHandle) -> Result<Stage, ContractError> {
        self.backend
            .swap_stage(handle.address, handle.swap_id)
            .await
    }

    pub async fn events(&self, handle: &ContractHandle) -> Result<Vec<ChainEvent>, ContractError> {
        self.backend
            .swap_events(handle.address, handle.swap_id)
            .await
    }

    /// Checks that `handle` points at a genuine swap creator holding a live record for
    /// exactly `params`. `Ok(false)` means the counterparty's contract cannot be trusted.
    pub async fn verify_deployed_parameters(
        &self,
        handle: &ContractHandle,
        params: &SwapParameters,
        expected: &ExpectedContract,
    ) -> Result<bool, ContractError> {
        if handle.swap_id != params.swap_id() {
            warn!(swap_id = %handle.swap_id, "Swap id does not hash the announced parameters");
            return Ok(false);
        }

        let code = self.backend.code_at(handle.address).await?;
        match check_swap_creator_code(&code, expected) {
            Ok(forwarder) if forwarder == expected.trusted_forwarder => {}
            Ok(forwarder) => {
                warn!(contract = %handle.address, %forwarder, "Swap creator embeds an untrusted forwarder");
                return Ok(false);
            }
            Err(ContractError::InvalidContract) => {
                warn!(contract = %handle.address, "Bytecode is not the swap creator");
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        match self.stage(handle).await? {
            Stage::Invalid => {
                warn!(swap_id = %handle.swap_id, "No swap record for announced parameters");
                Ok(false)
            }
            Stage::Completed => {
                warn!(swap_id = %handle.swap_id, "Swap record already completed");
                Ok(false)
            }
            Stage::Pending | Stage::Ready => Ok(true),
        }
    }

    async fn send(&self, call: SwapCall) -> Result<Receipt, ContractError> {
        let label = call.label();
        let tx_hash = self
            .nonces
            .submit(self.backend.as_ref(), self.address, call)
            .await?;
        debug!(call = label, %tx_hash, "Awaiting confirmation");
        self.await_confirmation(tx_hash).await
    }

    /// Polls until `tx_hash` is buried `depth` blocks deep.
    pub async fn await_confirmation(&self, tx_hash: B256) -> Result<Receipt, ContractError> {
        let started = Instant::now();
        let mut watcher = ConfirmationWatcher::new(WatcherConfig {
            confirmations_required: self.confirmation.depth,
            reorg_buffer: self.confirmation.reorg_buffer,
        });

        loop {
            let height = self.backend.block_number().await?;
            watcher.update_height(height);

            if let Some(inclusion) = self.backend.inclusion(tx_hash).await? {
                if !inclusion.success {
                    return Err(ContractError::Reverted(format!(
                        "transaction {tx_hash} reverted in block {}",
                        inclusion.block_number
                    )));
                }
                watcher.observe_inclusion(inclusion.block_number);
            }

            if let WatcherEvent::Confirmed {
                included_height,
                confirmations,
            } = watcher.evaluate(height)
            {
                return Ok(Receipt {
                    tx_hash,
                    block_number: included_height,
                    confirmations,
                });
            }

            let waited = started.elapsed();
            if waited >= self.confirmation.timeout {
                return Err(ContractError::ConfirmationTimeout { tx_hash, waited });
            }
            tokio::time::sleep(self.confirmation.poll_interval).await;
        }
    }
}
