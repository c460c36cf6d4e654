//! In-process chain that enforces the swap creator rules, for tests and the demo.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use swap_keys::{verify_secret_matches_commitment, Commitment, Secret};
use tracing::debug;

use super::{ChainBackend, ChainEvent, ContractError, Inclusion, Stage, SwapCall};
use crate::params::{SwapId, SwapParameters};
use crate::relay::{recover_relay_signer, RelayClaimRequest};
use crate::timeout::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    pub tx_hash: B256,
    pub sender: Address,
    pub nonce: u64,
    pub call: &'static str,
}

#[derive(Default)]
struct DeployedContract {
    code: Bytes,
    swaps: HashMap<SwapId, Stage>,
    events: Vec<ChainEvent>,
}

#[derive(Default)]
struct ChainInner {
    block_number: u64,
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    contracts: HashMap<Address, DeployedContract>,
    receipts: HashMap<B256, Inclusion>,
    withheld: Vec<B256>,
    withhold_inclusion: bool,
    fail_submissions: u32,
    fail_stage_reads: u32,
    deny_submission: Option<String>,
    submitted: Vec<SubmittedTx>,
}

pub struct MemoryChain {
    chain_id: u64,
    clock: Arc<dyn Clock>,
    inner: Mutex<ChainInner>,
}

impl MemoryChain {
    pub fn new(chain_id: u64, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            clock,
            inner: Mutex::new(ChainInner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChainInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connect(self: &Arc<Self>, sender: Address) -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend {
            chain: self.clone(),
            sender,
        })
    }

    pub fn deploy_swap_creator(&self, address: Address, code: Bytes) {
        self.lock().contracts.insert(
            address,
            DeployedContract {
                code,
                ..Default::default()
            },
        );
    }

    /// Mines `blocks` empty blocks, including any withheld transactions in the first one.
    pub fn mine(&self, blocks: u64) {
        let mut inner = self.lock();
        for _ in 0..blocks {
            inner.block_number += 1;
            let height = inner.block_number;
            for tx_hash in std::mem::take(&mut inner.withheld) {
                inner.receipts.insert(
                    tx_hash,
                    Inclusion {
                        block_number: height,
                        success: true,
                    },
                );
            }
        }
    }

    /// The next `count` submissions fail with a transient rpc error.
    pub fn fail_next_submissions(&self, count: u32) {
        self.lock().fail_submissions = count;
    }

    /// The next `count` stage reads fail with a transient rpc error.
    pub fn fail_next_stage_reads(&self, count: u32) {
        self.lock().fail_stage_reads = count;
    }

    /// The next submission reverts with a caller restriction.
    pub fn deny_next_submission(&self, reason: &str) {
        self.lock().deny_submission = Some(reason.to_string());
    }

    /// Appends an event without executing a call, as a non-conforming contract would.
    pub fn record_event(&self, contract: Address, event: ChainEvent) {
        if let Some(deployed) = self.lock().contracts.get_mut(&contract) {
            deployed.events.push(event);
        }
    }

    /// While set, accepted transactions stay out of blocks until [`MemoryChain::mine`].
    pub fn withhold_inclusions(&self, withhold: bool) {
        self.lock().withhold_inclusion = withhold;
    }

    pub fn balance(&self, account: Address) -> U256 {
        self.lock()
            .balances
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    pub fn submitted(&self) -> Vec<SubmittedTx> {
        self.lock().submitted.clone()
    }

    pub fn stage_of(&self, contract: Address, swap_id: SwapId) -> Stage {
        self.lock()
            .contracts
            .get(&contract)
            .and_then(|deployed| deployed.swaps.get(&swap_id).copied())
            .unwrap_or(Stage::Invalid)
    }

    fn submit(
        &self,
        sender: Address,
        contract: Address,
        call: SwapCall,
        nonce: u64,
    ) -> Result<B256, ContractError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        if inner.fail_submissions > 0 {
            inner.fail_submissions -= 1;
            return Err(ContractError::Rpc("connection reset by peer".into()));
        }
        if let Some(reason) = inner.deny_submission.take() {
            return Err(ContractError::Unauthorized(reason));
        }

        let expected_nonce = inner.nonces.get(&sender).copied().unwrap_or_default();
        if nonce != expected_nonce {
            return Err(ContractError::Rpc(format!(
                "nonce {nonce} does not match account nonce {expected_nonce}"
            )));
        }

        let label = call.label();
        let chain_id = self.chain_id;
        let deployed = inner
            .contracts
            .get_mut(&contract)
            .ok_or_else(|| ContractError::Reverted(format!("no contract at {contract}")))?;
        let payouts = apply_call(deployed, chain_id, contract, sender, call, now)?;

        for (account, amount) in payouts {
            *inner.balances.entry(account).or_default() += amount;
        }
        inner.nonces.insert(sender, expected_nonce + 1);

        let mut preimage = Vec::with_capacity(20 + 8 + 8);
        preimage.extend_from_slice(sender.as_slice());
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(&chain_id.to_be_bytes());
        let tx_hash = keccak256(preimage);

        if inner.withhold_inclusion {
            inner.withheld.push(tx_hash);
        } else {
            inner.block_number += 1;
            let block_number = inner.block_number;
            inner.receipts.insert(
                tx_hash,
                Inclusion {
                    block_number,
                    success: true,
                },
            );
        }
        inner.submitted.push(SubmittedTx {
            tx_hash,
            sender,
            nonce,
            call: label,
        });
        debug!(%sender, nonce, call = label, %tx_hash, "Memory chain accepted transaction");
        Ok(tx_hash)
    }
}

fn secret_opens(secret: B256, commitment: &Commitment) -> bool {
    Secret::from_canonical_bytes(secret.0)
        .map(|secret| verify_secret_matches_commitment(&secret, commitment))
        .unwrap_or(false)
}

fn require_stage(
    deployed: &DeployedContract,
    swap_id: SwapId,
) -> Result<Stage, ContractError> {
    match deployed.swaps.get(&swap_id) {
        Some(stage) => Ok(*stage),
        None => Err(ContractError::SwapNotFound(swap_id)),
    }
}

/// Executes `call` against one contract and returns the ETH payouts it makes.
fn apply_call(
    deployed: &mut DeployedContract,
    chain_id: u64,
    contract: Address,
    sender: Address,
    call: SwapCall,
    now: u64,
) -> Result<Vec<(Address, U256)>, ContractError> {
    match call {
        SwapCall::NewSwap(params) => {
            if sender != params.owner {
                return Err(ContractError::Unauthorized("sender is not the swap owner".into()));
            }
            if params.value.is_zero() {
                return Err(ContractError::Reverted("zero value".into()));
            }
            if params.timeout_0 <= now || params.timeout_1 <= params.timeout_0 {
                return Err(ContractError::Reverted("invalid timeouts".into()));
            }
            let swap_id = params.swap_id();
            if deployed.swaps.contains_key(&swap_id) {
                return Err(ContractError::Reverted("swap already exists".into()));
            }
            deployed.swaps.insert(swap_id, Stage::Pending);
            Ok(Vec::new())
        }
        SwapCall::SetReady(params) => {
            let swap_id = params.swap_id();
            let stage = require_stage(deployed, swap_id)?;
            if sender != params.owner {
                return Err(ContractError::Unauthorized("only the swap owner".into()));
            }
            if stage != Stage::Pending {
                return Err(ContractError::Reverted(format!("swap is {stage:?}")));
            }
            if now >= params.timeout_0 {
                return Err(ContractError::Reverted("too late to set ready".into()));
            }
            deployed.swaps.insert(swap_id, Stage::Ready);
            deployed.events.push(ChainEvent::Ready { swap_id });
            Ok(Vec::new())
        }
        SwapCall::Claim { params, secret } => {
            if sender != params.claimer {
                return Err(ContractError::Unauthorized("only the swap claimer".into()));
            }
            claim(deployed, &params, secret, now)?;
            Ok(vec![(params.claimer, params.value)])
        }
        SwapCall::ClaimRelayer {
            params,
            secret,
            fee,
            signature,
        } => {
            let request = RelayClaimRequest {
                offer_id: None,
                swap_creator_addr: contract,
                swap: params.clone(),
                secret,
                fee,
                signature,
            };
            let signer = recover_relay_signer(&request, chain_id)
                .map_err(|err| ContractError::Reverted(err.to_string()))?;
            if signer != params.claimer {
                return Err(ContractError::Unauthorized("signer is not the swap claimer".into()));
            }
            if fee >= params.value {
                return Err(ContractError::Reverted("fee exceeds value".into()));
            }
            claim(deployed, &params, secret, now)?;
            Ok(vec![(params.claimer, params.value - fee), (sender, fee)])
        }
        SwapCall::Refund { params, secret } => {
            let swap_id = params.swap_id();
            let stage = require_stage(deployed, swap_id)?;
            if sender != params.owner {
                return Err(ContractError::Unauthorized("only the swap owner".into()));
            }
            let before_t0 = stage == Stage::Pending && now < params.timeout_0;
            let after_t1 = stage != Stage::Completed && now >= params.timeout_1;
            if !(before_t0 || after_t1) {
                return Err(ContractError::Reverted("refund not allowed now".into()));
            }
            if !secret_opens(secret, &params.refund_commitment) {
                return Err(ContractError::Reverted("invalid refund secret".into()));
            }
            deployed.swaps.insert(swap_id, Stage::Completed);
            deployed.events.push(ChainEvent::Refunded { swap_id, secret });
            Ok(vec![(params.owner, params.value)])
        }
    }
}

fn claim(
    deployed: &mut DeployedContract,
    params: &SwapParameters,
    secret: B256,
    now: u64,
) -> Result<(), ContractError> {
    let swap_id = params.swap_id();
    let stage = require_stage(deployed, swap_id)?;
    if stage != Stage::Ready {
        return Err(ContractError::Reverted(format!("swap is {stage:?}")));
    }
    if now >= params.timeout_1 {
        return Err(ContractError::Reverted("too late to claim".into()));
    }
    if !secret_opens(secret, &params.claim_commitment) {
        return Err(ContractError::Reverted("invalid claim secret".into()));
    }
    deployed.swaps.insert(swap_id, Stage::Completed);
    deployed.events.push(ChainEvent::Claimed { swap_id, secret });
    Ok(())
}

/// One account's connection to a [`MemoryChain`].
pub struct MemoryBackend {
    chain: Arc<MemoryChain>,
    sender: Address,
}

#[async_trait]
impl ChainBackend for MemoryBackend {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn chain_id(&self) -> Result<u64, ContractError> {
        Ok(self.chain.chain_id)
    }

    async fn pending_nonce(&self) -> Result<u64, ContractError> {
        Ok(self
            .chain
            .lock()
            .nonces
            .get(&self.sender)
            .copied()
            .unwrap_or_default())
    }

    async fn submit(
        &self,
        contract: Address,
        call: SwapCall,
        nonce: u64,
    ) -> Result<B256, ContractError> {
        self.chain.submit(self.sender, contract, call, nonce)
    }

    async fn inclusion(&self, tx_hash: B256) -> Result<Option<Inclusion>, ContractError> {
        Ok(self.chain.lock().receipts.get(&tx_hash).copied())
    }

    async fn block_number(&self) -> Result<u64, ContractError> {
        Ok(self.chain.lock().block_number)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ContractError> {
        Ok(self
            .chain
            .lock()
            .contracts
            .get(&address)
            .map(|deployed| deployed.code.clone())
            .unwrap_or_default())
    }

    async fn swap_stage(&self, contract: Address, swap_id: SwapId) -> Result<Stage, ContractError> {
        {
            let mut inner = self.chain.lock();
            if inner.fail_stage_reads > 0 {
                inner.fail_stage_reads -= 1;
                return Err(ContractError::Rpc("request timed out".into()));
            }
        }
        Ok(self.chain.stage_of(contract, swap_id))
    }

    async fn swap_events(
        &self,
        contract: Address,
        swap_id: SwapId,
    ) -> Result<Vec<ChainEvent>, ContractError> {
        Ok(self
            .chain
            .lock()
            .contracts
            .get(&contract)
            .map(|deployed| {
                deployed
                    .events
                    .iter()
                    .filter(|event| event.swap_id() == swap_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::timeout::ManualClock;
    use swap_keys::commit;

    const CONTRACT: Address = Address::new([0x55; 20]);

    fn setup() -> (Arc<ManualClock>, Arc<MemoryChain>, SwapParameters, Secret, Secret) {
        let clock = ManualClock::new(1_000);
        let chain = MemoryChain::new(1337, clock.clone());
        chain.deploy_swap_creator(CONTRACT, Bytes::from(vec![0x60; 8]));
        let maker = Secret::from_bytes([1u8; 32]).unwrap();
        let taker = Secret::from_bytes([2u8; 32]).unwrap();
        let params = SwapParameters::new_eth_swap(
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
            commit(&maker),
            commit(&taker),
            U256::from(10u64),
            1_000,
            Duration::from_secs(100),
            U256::ZERO,
        );
        (clock, chain, params, maker, taker)
    }

    #[tokio::test]
    async fn only_owner_creates_and_refunds() {
        let (_, chain, params, maker, _) = setup();
        let owner = chain.connect(params.owner);
        let claimer = chain.connect(params.claimer);

        let err = claimer
            .submit(CONTRACT, SwapCall::NewSwap(params.clone()), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ContractError::Unauthorized(_)));

        owner
            .submit(CONTRACT, SwapCall::NewSwap(params.clone()), 0)
            .await
            .unwrap();
        let refund = SwapCall::Refund {
            params: params.clone(),
            secret: B256::from(maker.to_bytes()),
        };
        assert!(matches!(
            claimer.submit(CONTRACT, refund.clone(), 0).await,
            Err(ContractError::Unauthorized(_))
        ));
        owner.submit(CONTRACT, refund, 1).await.unwrap();
        assert_eq!(chain.stage_of(CONTRACT, params.swap_id()), Stage::Completed);
        assert_eq!(chain.balance(params.owner), params.value);
    }

    #[tokio::test]
    async fn claim_requires_ready_and_correct_secret() {
        let (clock, chain, params, maker, taker) = setup();
        let owner = chain.connect(params.owner);
        let claimer = chain.connect(params.claimer);
        owner
            .submit(CONTRACT, SwapCall::NewSwap(params.clone()), 0)
            .await
            .unwrap();

        let claim = |secret: &Secret| SwapCall::Claim {
            params: params.clone(),
            secret: B256::from(secret.to_bytes()),
        };
        assert!(claimer.submit(CONTRACT, claim(&taker), 0).await.is_err());

        owner
            .submit(CONTRACT, SwapCall::SetReady(params.clone()), 1)
            .await
            .unwrap();
        assert!(claimer.submit(CONTRACT, claim(&maker), 0).await.is_err());

        clock.set(params.timeout_1);
        assert!(claimer.submit(CONTRACT, claim(&taker), 0).await.is_err());

        clock.set(params.timeout_1 - 1);
        claimer.submit(CONTRACT, claim(&taker), 0).await.unwrap();
        let events = claimer.swap_events(CONTRACT, params.swap_id()).await.unwrap();
        assert_eq!(
            events.last(),
            Some(&ChainEvent::Claimed {
                swap_id: params.swap_id(),
                secret: B256::from(taker.to_bytes()),
            })
        );
    }

    #[tokio::test]
    async fn refund_blocked_between_t0_and_t1() {
        let (clock, chain, params, maker, _) = setup();
        let owner = chain.connect(params.owner);
        owner
            .submit(CONTRACT, SwapCall::NewSwap(params.clone()), 0)
            .await
            .unwrap();
        let refund = SwapCall::Refund {
            params: params.clone(),
            secret: B256::from(maker.to_bytes()),
        };

        clock.set(params.timeout_0);
        assert!(owner.submit(CONTRACT, refund.clone(), 1).await.is_err());
        clock.set(params.timeout_1);
        owner.submit(CONTRACT, refund, 1).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_out_of_order_nonce() {
        let (_, chain, params, _, _) = setup();
        let owner = chain.connect(params.owner);
        let err = owner
            .submit(CONTRACT, SwapCall::NewSwap(params), 3)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
