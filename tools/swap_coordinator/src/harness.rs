//! Two parties running swaps against one in-memory chain.
//!
//! Used by the `demo` command and the integration tests. Peer messages are routed
//! directly between the two registries; time only moves through the shared
//! [`ManualClock`].

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use swap_keys::{combine_commitments, commit, Secret};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DEVELOPMENT_CHAIN_ID;
use crate::contract::memory::MemoryChain;
use crate::contract::nonce::NonceManager;
use crate::contract::verify::ExpectedContract;
use crate::contract::{ConfirmationConfig, SwapContract};
use crate::events::ChainEventPoller;
use crate::machine::{SwapContext, SwapOptions, SwapSetup};
use crate::message::LockProof;
use crate::metrics::{SwapMetrics, TracingMetrics};
use crate::params::{SwapId, SwapParameters};
use crate::registry::{Outbound, SwapRegistry};
use crate::relay::ContractRelayer;
use crate::retry::RetryConfig;
use crate::state::Role;
use crate::timeout::{Clock, ManualClock};

pub const SWAP_CREATOR: Address = Address::new([0x5c; 20]);
pub const TRUSTED_FORWARDER: Address = Address::new([0xf0; 20]);
/// Swap creator look-alike the maker can be told to use instead.
pub const ROGUE_SWAP_CREATOR: Address = Address::new([0xee; 20]);

const CODE_LEN: usize = 96;
const ROUTE_TIMEOUT: Duration = Duration::from_secs(5);
const FORWARDER_SLOTS: [usize; 2] = [10, 60];

/// Runtime code of the swap creator deployed at [`SWAP_CREATOR`].
fn swap_creator_code() -> Vec<u8> {
    let mut code = vec![0x60u8; CODE_LEN];
    for index in FORWARDER_SLOTS {
        code[index..index + 20].copy_from_slice(TRUSTED_FORWARDER.as_slice());
    }
    code
}

/// Bytecode reference the taker checks announced contracts against.
pub fn expected_swap_creator() -> ExpectedContract {
    let mut masked = swap_creator_code();
    for index in FORWARDER_SLOTS {
        masked[index..index + 20].fill(0);
    }
    ExpectedContract {
        masked_code: Bytes::from(masked),
        forwarder_indices: FORWARDER_SLOTS.to_vec(),
        trusted_forwarder: TRUSTED_FORWARDER,
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub start_time: u64,
    pub swap_timeout: Duration,
    /// Taker claims go through a third-party relayer account.
    pub taker_relayer: bool,
    /// Deploy the maker's swaps at [`ROGUE_SWAP_CREATOR`].
    pub rogue_maker_contract: bool,
    pub confirmation: ConfirmationConfig,
    pub retry: RetryConfig,
    pub poll_interval: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            start_time: 1_700_000_000,
            swap_timeout: Duration::from_secs(120),
            taker_relayer: false,
            rogue_maker_contract: false,
            confirmation: ConfirmationConfig {
                depth: 1,
                reorg_buffer: 5,
                poll_interval: Duration::from_millis(5),
                timeout: Duration::from_secs(2),
            },
            retry: RetryConfig {
                attempt_timeout: Duration::from_secs(5),
                max_retries: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                jitter_ms: 0,
                deadline_margin: Duration::from_secs(12),
            },
            poll_interval: Duration::from_millis(10),
        }
    }
}

pub struct Party {
    pub role: Role,
    pub key: PrivateKeySigner,
    pub contract: SwapContract,
    pub registry: Arc<SwapRegistry>,
    poller: JoinHandle<()>,
}

impl Party {
    pub fn address(&self) -> Address {
        self.key.address()
    }
}

pub struct SwapHarness {
    pub config: HarnessConfig,
    pub clock: Arc<ManualClock>,
    pub chain: Arc<MemoryChain>,
    pub maker: Party,
    pub taker: Party,
    /// Third-party relayer account, when configured.
    pub relayer: Option<Address>,
    routers: Vec<JoinHandle<()>>,
}

impl SwapHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self::with_metrics(config, Arc::new(TracingMetrics))
    }

    pub fn with_metrics(config: HarnessConfig, metrics: Arc<dyn SwapMetrics>) -> Self {
        let clock = ManualClock::new(config.start_time);
        let chain = MemoryChain::new(DEVELOPMENT_CHAIN_ID, clock.clone());
        let expected = expected_swap_creator();
        chain.deploy_swap_creator(SWAP_CREATOR, Bytes::from(swap_creator_code()));
        chain.deploy_swap_creator(ROGUE_SWAP_CREATOR, Bytes::from(vec![0xfe; CODE_LEN]));

        let maker_key = PrivateKeySigner::random();
        let taker_key = PrivateKeySigner::random();
        let maker_address = if config.rogue_maker_contract {
            ROGUE_SWAP_CREATOR
        } else {
            SWAP_CREATOR
        };

        let contract_for = |account: Address, address: Address| {
            SwapContract::new(
                chain.connect(account),
                Arc::new(NonceManager::new()),
                config.confirmation,
                address,
            )
        };
        let context = |contract: SwapContract| {
            SwapContext::new(contract, clock.clone(), DEVELOPMENT_CHAIN_ID, expected.clone())
                .with_metrics(metrics.clone())
                .with_retry(config.retry.clone())
        };

        let maker_contract = contract_for(maker_key.address(), maker_address);
        let maker_ctx = context(maker_contract.clone());

        let taker_contract = contract_for(taker_key.address(), SWAP_CREATOR);
        let mut taker_ctx = context(taker_contract.clone()).with_claimer_key(taker_key.clone());
        let mut relayer = None;
        if config.taker_relayer {
            let relayer_account = PrivateKeySigner::random().address();
            let relay = ContractRelayer::new(
                contract_for(relayer_account, SWAP_CREATOR),
                DEVELOPMENT_CHAIN_ID,
            );
            relayer = Some(relay.address());
            taker_ctx = taker_ctx.with_relay(Arc::new(relay));
        }

        let (maker_registry, maker_outbound) = SwapRegistry::new(Arc::new(maker_ctx));
        let (taker_registry, taker_outbound) = SwapRegistry::new(Arc::new(taker_ctx));

        let routers = vec![
            spawn_router(maker_outbound, taker_registry.clone(), Role::Maker),
            spawn_router(taker_outbound, maker_registry.clone(), Role::Taker),
        ];

        let maker = Party {
            role: Role::Maker,
            poller: spawn_poller(&maker_registry, &maker_contract, config.poll_interval),
            key: maker_key,
            contract: maker_contract,
            registry: maker_registry,
        };
        let taker = Party {
            role: Role::Taker,
            poller: spawn_poller(&taker_registry, &taker_contract, config.poll_interval),
            key: taker_key,
            contract: taker_contract,
            registry: taker_registry,
        };

        Self {
            config,
            clock,
            chain,
            maker,
            taker,
            relayer,
            routers,
        }
    }

    /// Fresh parameters and setups for both sides of one swap.
    pub fn new_swap(
        &self,
        value: U256,
        counter_amount: u64,
    ) -> Result<(SwapSetup, SwapSetup)> {
        let maker_secret = Secret::generate()?;
        let taker_secret = Secret::generate()?;
        let params = SwapParameters::new_eth_swap(
            self.maker.address(),
            self.taker.address(),
            commit(&maker_secret),
            commit(&taker_secret),
            value,
            self.clock.now(),
            self.config.swap_timeout,
            SwapParameters::random_nonce(),
        );
        let maker = SwapSetup::new(Role::Maker, params.clone(), maker_secret, counter_amount);
        let taker = SwapSetup::new(Role::Taker, params, taker_secret, counter_amount)
            .with_options(SwapOptions {
                claim_via_relay: self.config.taker_relayer,
                ..SwapOptions::default()
            });
        Ok((maker, taker))
    }

    /// Taker agrees to the swap, then the maker initiates it. Returns once both sides
    /// run the swap.
    pub async fn open(&self, maker: SwapSetup, taker: SwapSetup) -> Result<SwapId> {
        self.taker.registry.expect(taker).await;
        let swap_id = self.maker.registry.initiate(maker).await?;
        tokio::time::timeout(ROUTE_TIMEOUT, async {
            while self.taker.registry.status(swap_id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .context("taker never accepted the initiate request")?;
        Ok(swap_id)
    }

    pub async fn shutdown(self) {
        self.maker.registry.shutdown().await;
        self.taker.registry.shutdown().await;
        self.maker.poller.abort();
        self.taker.poller.abort();
        for router in self.routers {
            router.abort();
        }
    }
}

/// Lock proof for XMR sent to the swap's joint key.
pub fn lock_proof(params: &SwapParameters, amount: u64) -> Result<LockProof> {
    let joint_key = combine_commitments(&params.refund_commitment, &params.claim_commitment)?;
    Ok(LockProof {
        joint_key,
        amount,
        tx_id: format!("{:x}", params.swap_id()),
    })
}

fn spawn_router(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    peer: Arc<SwapRegistry>,
    from: Role,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Outbound { swap_id, message }) = outbound.recv().await {
            debug!(%swap_id, %from, kind = message.kind(), "Routing peer message");
            if let Err(err) = peer.deliver(message).await {
                warn!(%swap_id, %from, error = %err, "Peer rejected message");
            }
        }
    })
}

fn spawn_poller(
    registry: &Arc<SwapRegistry>,
    contract: &SwapContract,
    interval: Duration,
) -> JoinHandle<()> {
    let poller = ChainEventPoller::new(registry.clone(), contract.clone(), interval);
    tokio::spawn(poller.run(registry.shutdown_signal()))
}
