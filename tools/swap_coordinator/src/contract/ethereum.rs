use alloy::{
    network::EthereumWallet,
    primitives::{Address, Bytes, B256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    transports::http::reqwest::Url,
};
use async_trait::async_trait;

use super::abi::ISwapCreator;
use super::{ChainBackend, ChainEvent, ContractError, Inclusion, Stage, SwapCall};
use crate::params::SwapId;

/// JSON-RPC node access through alloy, signing with one local key.
#[derive(Clone)]
pub struct EthereumBackend {
    provider: DynProvider,
    sender: Address,
}

impl EthereumBackend {
    pub fn connect(rpc_url: &str, private_key: &str) -> Result<Self, ContractError> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| ContractError::Rpc(format!("Invalid private key: {}", e)))?;
        let sender = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = DynProvider::new(
            ProviderBuilder::new()
                .wallet(wallet)
                .connect_http(parse_url(rpc_url)?),
        );
        Ok(Self { provider, sender })
    }

    /// Reads only; any submission fails at the node for lack of a signer.
    pub fn read_only(rpc_url: &str) -> Result<Self, ContractError> {
        let provider = DynProvider::new(ProviderBuilder::new().connect_http(parse_url(rpc_url)?));
        Ok(Self {
            provider,
            sender: Address::ZERO,
        })
    }
}

fn parse_url(rpc_url: &str) -> Result<Url, ContractError> {
    rpc_url
        .parse()
        .map_err(|e| ContractError::Rpc(format!("Invalid RPC URL: {}", e)))
}

fn rpc_error(err: impl std::fmt::Display) -> ContractError {
    ContractError::Rpc(err.to_string())
}

/// Sorts node errors into caller restrictions, other reverts and transport failures.
fn map_send_error(err: impl std::fmt::Display) -> ContractError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("onlyswapowner")
        || lower.contains("onlyswapclaimer")
        || lower.contains("unauthorized")
        || lower.contains("invalidsignature")
    {
        ContractError::Unauthorized(message)
    } else if lower.contains("revert") {
        ContractError::Reverted(message)
    } else {
        ContractError::Rpc(message)
    }
}

#[async_trait]
impl ChainBackend for EthereumBackend {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn chain_id(&self) -> Result<u64, ContractError> {
        self.provider.get_chain_id().await.map_err(rpc_error)
    }

    async fn pending_nonce(&self) -> Result<u64, ContractError> {
        self.provider
            .get_transaction_count(self.sender)
            .pending()
            .await
            .map_err(rpc_error)
    }

    async fn submit(
        &self,
        contract: Address,
        call: SwapCall,
        nonce: u64,
    ) -> Result<B256, ContractError> {
        let creator = ISwapCreator::new(contract, &self.provider);
        let value = call.value();
        let pending = match call {
            SwapCall::NewSwap(params) => {
                let swap = params.to_sol();
                creator
                    .newSwap(
                        swap.pubKeyClaim,
                        swap.pubKeyRefund,
                        swap.claimer,
                        swap.timeout0,
                        swap.timeout1,
                        swap.asset,
                        swap.value,
                        swap.nonce,
                    )
                    .value(value)
                    .nonce(nonce)
                    .send()
                    .await
            }
            SwapCall::SetReady(params) => {
                creator
                    .setReady(params.to_sol())
                    .nonce(nonce)
                    .send()
                    .await
            }
            SwapCall::Claim { params, secret } => {
                creator
                    .claim(params.to_sol(), secret)
                    .nonce(nonce)
                    .send()
                    .await
            }
            SwapCall::ClaimRelayer {
                params,
                secret,
                fee,
                signature,
            } => {
                creator
                    .claimRelayer(params.to_sol(), secret, fee, signature)
                    .nonce(nonce)
                    .send()
                    .await
            }
            SwapCall::Refund { params, secret } => {
                creator
                    .refund(params.to_sol(), secret)
                    .nonce(nonce)
                    .send()
                    .await
            }
        }
        .map_err(map_send_error)?;

        Ok(*pending.tx_hash())
    }

    async fn inclusion(&self, tx_hash: B256) -> Result<Option<Inclusion>, ContractError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_error)?;
        Ok(receipt.and_then(|receipt| {
            receipt.block_number.map(|block_number| Inclusion {
                block_number,
                success: receipt.status(),
            })
        }))
    }

    async fn block_number(&self) -> Result<u64, ContractError> {
        self.provider.get_block_number().await.map_err(rpc_error)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ContractError> {
        self.provider.get_code_at(address).await.map_err(rpc_error)
    }

    async fn swap_stage(&self, contract: Address, swap_id: SwapId) -> Result<Stage, ContractError> {
        let creator = ISwapCreator::new(contract, &self.provider);
        let stage = creator.swaps(swap_id).call().await.map_err(rpc_error)?;
        Ok(Stage::from(stage))
    }

    async fn swap_events(
        &self,
        contract: Address,
        swap_id: SwapId,
    ) -> Result<Vec<ChainEvent>, ContractError> {
        let creator = ISwapCreator::new(contract, &self.provider);

        // Position is (block, log index) so the merged list keeps chain order.
        let mut positioned: Vec<((u64, u64), ChainEvent)> = Vec::new();

        let ready = creator
            .Ready_filter()
            .topic1(swap_id)
            .from_block(0)
            .query()
            .await
            .map_err(rpc_error)?;
        for (_, log) in ready {
            positioned.push((
                (log.block_number.unwrap_or_default(), log.log_index.unwrap_or_default()),
                ChainEvent::Ready { swap_id },
            ));
        }

        let claimed = creator
            .Claimed_filter()
            .topic1(swap_id)
            .from_block(0)
            .query()
            .await
            .map_err(rpc_error)?;
        for (event, log) in claimed {
            positioned.push((
                (log.block_number.unwrap_or_default(), log.log_index.unwrap_or_default()),
                ChainEvent::Claimed {
                    swap_id,
                    secret: event.s,
                },
            ));
        }

        let refunded = creator
            .Refunded_filter()
            .topic1(swap_id)
            .from_block(0)
            .query()
            .await
            .map_err(rpc_error)?;
        for (event, log) in refunded {
            positioned.push((
                (log.block_number.unwrap_or_default(), log.log_index.unwrap_or_default()),
                ChainEvent::Refunded {
                    swap_id,
                    secret: event.s,
                },
            ));
        }

        positioned.sort_by_key(|(position, _)| *position);
        Ok(positioned.into_iter().map(|(_, event)| event).collect())
    }
}
