//! Lifecycle of one swap, seen from one side.
//!
//! Every chain action first re-reads the swap record, so a retried or resumed action
//! never submits twice. Fund-moving transitions (`Claimed`, `Refunded`) are taken only
//! once the matching event is read back from the chain.

use std::sync::Arc;
use std::time::Instant;

use alloy::signers::local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use swap_keys::{
    combine_commitments, derive_joint_spend_key, verify_secret_matches_commitment, CryptoError,
    JointKey, Secret,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SwapConfig;
use crate::contract::verify::ExpectedContract;
use crate::contract::{ChainEvent, ContractError, ContractHandle, Receipt, Stage, SwapContract};
use crate::message::{LockProof, PeerMessage};
use crate::metrics::{NoopMetrics, SwapMetrics};
use crate::params::{SwapId, SwapParameters};
use crate::relay::{
    build_relay_claim, submit_relay_claim, RelayClaimRequest, RelayError, RelayTransport,
    ReplayGuard,
};
use crate::retry::{retry_before_deadline, RetryConfig, RetryError};
use crate::state::{Role, SwapState};
use crate::timeout::{Clock, DeadlineKind, DeadlineStatus, TimeoutMonitor};

/// Shared by every swap one party runs.
pub struct SwapContext {
    pub contract: SwapContract,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn SwapMetrics>,
    pub retry: RetryConfig,
    pub expected_contract: ExpectedContract,
    pub chain_id: u64,
    /// Signs relay claims; only the taker needs it.
    pub claimer_key: Option<PrivateKeySigner>,
    pub relay: Option<Arc<dyn RelayTransport>>,
    pub relay_guard: Arc<ReplayGuard>,
}

impl SwapContext {
    pub fn new(
        contract: SwapContract,
        clock: Arc<dyn Clock>,
        chain_id: u64,
        expected_contract: ExpectedContract,
    ) -> Self {
        Self {
            contract,
            clock,
            metrics: Arc::new(NoopMetrics),
            retry: RetryConfig::default(),
            expected_contract,
            chain_id,
            claimer_key: None,
            relay: None,
            relay_guard: Arc::new(ReplayGuard::new()),
        }
    }

    /// Context for a live network: chain id from `config`, retry margin scaled to its
    /// confirmation depth, `SWAP_RETRY_*` overrides on top.
    pub fn for_network(
        contract: SwapContract,
        clock: Arc<dyn Clock>,
        config: &SwapConfig,
        expected_contract: ExpectedContract,
    ) -> Self {
        Self::new(contract, clock, config.chain_id, expected_contract)
            .with_retry(RetryConfig::for_network(config))
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn SwapMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_claimer_key(mut self, key: PrivateKeySigner) -> Self {
        self.claimer_key = Some(key);
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn RelayTransport>) -> Self {
        self.relay = Some(relay);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOptions {
    /// Maker calls `set_ready` as soon as the counter-asset lock is accepted.
    pub auto_ready: bool,
    /// Taker claims as soon as the swap is ready.
    pub auto_claim: bool,
    /// Taker claims through a relayer instead of paying gas.
    pub claim_via_relay: bool,
}

impl Default for SwapOptions {
    fn default() -> Self {
        Self {
            auto_ready: true,
            auto_claim: true,
            claim_via_relay: false,
        }
    }
}

pub struct SwapSetup {
    pub role: Role,
    pub params: SwapParameters,
    /// This party's secret: the refund secret for the maker, the claim secret for the taker.
    pub secret: Secret,
    /// Agreed XMR amount in piconero.
    pub counter_amount: u64,
    /// Known contract location when resuming.
    pub handle: Option<ContractHandle>,
    pub options: SwapOptions,
}

impl SwapSetup {
    pub fn new(role: Role, params: SwapParameters, secret: Secret, counter_amount: u64) -> Self {
        Self {
            role,
            params,
            secret,
            counter_amount,
            handle: None,
            options: SwapOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SwapOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_handle(mut self, handle: ContractHandle) -> Self {
        self.handle = Some(handle);
        self
    }
}

#[derive(Debug, Clone)]
pub enum SwapEvent {
    /// Maker's local decision to fund the contract.
    Deploy,
    Peer(PeerMessage),
    /// Taker's own XMR lock reached the required depth.
    CounterAssetLocked(LockProof),
    /// Maker's local decision to mark the swap ready.
    SetReady,
    /// Taker's local decision to claim.
    Claim,
    Chain(ChainEvent),
    Deadline(DeadlineKind),
    Resync,
    Cancel,
}

impl SwapEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Peer(message) => message.kind(),
            Self::CounterAssetLocked(_) => "counter_asset_locked",
            Self::SetReady => "set_ready",
            Self::Claim => "claim",
            Self::Chain(ChainEvent::Ready { .. }) => "chain_ready",
            Self::Chain(ChainEvent::Claimed { .. }) => "chain_claimed",
            Self::Chain(ChainEvent::Refunded { .. }) => "chain_refunded",
            Self::Deadline(DeadlineKind::T0) => "deadline_t0",
            Self::Deadline(DeadlineKind::T1) => "deadline_t1",
            Self::Deadline(DeadlineKind::ClaimFallback) => "deadline_claim_fallback",
            Self::Resync => "resync",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("{event} not allowed for {role} in state {state}: {reason}")]
    PolicyViolation {
        role: Role,
        state: SwapState,
        event: &'static str,
        reason: String,
    },
    #[error("swap already finished in state {0}")]
    Terminal(SwapState),
    #[error("{action} not allowed in timelock window {status:?}")]
    Timelock {
        action: &'static str,
        status: DeadlineStatus,
    },
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Retry(#[from] RetryError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl MachineError {
    /// Errors caused by the event itself rather than by the environment; retrying the same
    /// event cannot succeed.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::PolicyViolation { .. }
                | Self::Terminal(_)
                | Self::Timelock { .. }
                | Self::Rejected(_)
                | Self::Crypto(_)
        )
    }
}

/// Outcome of one handled event.
#[derive(Debug, Clone)]
pub struct Step {
    pub from: SwapState,
    pub to: SwapState,
    /// Messages for the counterparty.
    pub outbound: Vec<PeerMessage>,
}

impl Step {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

pub struct SwapMachine {
    ctx: Arc<SwapContext>,
    role: Role,
    swap_id: SwapId,
    params: SwapParameters,
    secret: Secret,
    joint_key: JointKey,
    counter_amount: u64,
    options: SwapOptions,
    state: SwapState,
    handle: Option<ContractHandle>,
    monitor: TimeoutMonitor,
    lock_proof: Option<LockProof>,
    counterparty_secret: Option<Secret>,
    t0_handled: bool,
    ready_attempted: bool,
    claim_submitted: bool,
    /// The secret left through a relayer or the counterparty and no outcome is on chain yet.
    claim_relayed: bool,
    /// A direct claim could not start before the deadline margin.
    claim_abandoned: bool,
}

impl SwapMachine {
    pub fn new(setup: SwapSetup, ctx: Arc<SwapContext>) -> Result<Self, MachineError> {
        let SwapSetup {
            role,
            params,
            secret,
            counter_amount,
            handle,
            options,
        } = setup;

        let own_commitment = match role {
            Role::Maker => &params.refund_commitment,
            Role::Taker => &params.claim_commitment,
        };
        if !verify_secret_matches_commitment(&secret, own_commitment) {
            return Err(MachineError::Rejected(format!(
                "{role} secret does not match its commitment"
            )));
        }
        let joint_key = combine_commitments(&params.refund_commitment, &params.claim_commitment)?;

        let sender = ctx.contract.sender();
        let expected_sender = match role {
            Role::Maker => params.owner,
            Role::Taker => params.claimer,
        };
        if sender != expected_sender {
            return Err(MachineError::Rejected(format!(
                "signing account {sender} is not the swap {role} {expected_sender}"
            )));
        }

        let monitor = TimeoutMonitor::new(params.deadlines(), ctx.clock.clone());
        Ok(Self {
            swap_id: params.swap_id(),
            ctx,
            role,
            params,
            secret,
            joint_key,
            counter_amount,
            options,
            state: SwapState::Created,
            handle,
            monitor,
            lock_proof: None,
            counterparty_secret: None,
            t0_handled: false,
            ready_attempted: false,
            claim_submitted: false,
            claim_relayed: false,
            claim_abandoned: false,
        })
    }

    pub fn swap_id(&self) -> SwapId {
        self.swap_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SwapState {
        self.state
    }

    pub fn params(&self) -> &SwapParameters {
        &self.params
    }

    pub fn contract_handle(&self) -> Option<ContractHandle> {
        self.handle
    }

    pub fn joint_key(&self) -> JointKey {
        self.joint_key
    }

    pub fn lock_proof(&self) -> Option<&LockProof> {
        self.lock_proof.as_ref()
    }

    pub fn deadline_status(&self) -> DeadlineStatus {
        self.monitor.status()
    }

    /// Spend key of the shared XMR account, available once the counterparty's secret has
    /// been revealed on chain.
    pub fn recovered_spend_key(&self) -> Option<Secret> {
        self.counterparty_secret
            .as_ref()
            .map(|other| derive_joint_spend_key(&self.secret, other))
    }

    /// Next timelock this machine must react to, with the time it fires.
    pub fn next_deadline(&self) -> Option<(DeadlineKind, u64)> {
        if self.state.is_terminal() {
            return None;
        }
        let deadlines = self.monitor.deadlines();
        let margin = self.ctx.retry.deadline_margin.as_secs();
        match self.role {
            Role::Maker => match self.state {
                SwapState::Created | SwapState::ContractDeployed | SwapState::CounterAssetLocked
                    if !self.t0_handled =>
                {
                    Some((DeadlineKind::T0, deadlines.t0.saturating_sub(margin)))
                }
                SwapState::ContractDeployed | SwapState::CounterAssetLocked | SwapState::Ready => {
                    Some((DeadlineKind::T1, deadlines.t1))
                }
                _ => None,
            },
            Role::Taker => match self.state {
                SwapState::Created | SwapState::ContractDeployed if !self.t0_handled => {
                    Some((DeadlineKind::T0, deadlines.t0))
                }
                SwapState::Ready if self.claim_relayed => Some((
                    DeadlineKind::ClaimFallback,
                    deadlines.claim_fallback(margin),
                )),
                _ => None,
            },
        }
    }

    /// Local action the options ask for in the current state.
    pub fn follow_up(&self) -> Option<SwapEvent> {
        match (self.role, self.state) {
            (Role::Maker, SwapState::CounterAssetLocked)
                if self.options.auto_ready && !self.ready_attempted =>
            {
                Some(SwapEvent::SetReady)
            }
            (Role::Taker, SwapState::Ready)
                if self.options.auto_claim
                    && !self.claim_submitted
                    && !self.claim_abandoned
                    && self.monitor.can_claim_at(self.monitor.now()) =>
            {
                Some(SwapEvent::Claim)
            }
            _ => None,
        }
    }

    /// Re-derives the local state from the swap record on chain.
    pub async fn resync(&mut self) -> Result<Step, MachineError> {
        self.handle(SwapEvent::Resync).await
    }

    pub async fn handle(&mut self, event: SwapEvent) -> Result<Step, MachineError> {
        if self.state.is_terminal() {
            return Err(MachineError::Terminal(self.state));
        }

        let from = self.state;
        let label = event.label();
        let result = match event {
            SwapEvent::Cancel => self.on_cancel(),
            SwapEvent::Resync => self.on_resync().await,
            SwapEvent::Chain(event) => self.on_chain_event(event).await,
            SwapEvent::Deadline(kind) => self.on_deadline(kind).await,
            SwapEvent::Peer(PeerMessage::InitiateRequest { .. }) => {
                Err(self.violation("initiate_request", "swap already running"))
            }
            event => match self.role {
                Role::Maker => self.on_maker_event(event).await,
                Role::Taker => self.on_taker_event(event).await,
            },
        };

        let outbound = match result {
            Ok(outbound) => outbound,
            Err(err) => {
                if err.is_violation() {
                    warn!(swap_id = %self.swap_id, role = %self.role, state = %self.state, event = label, error = %err, "Rejected swap event");
                    self.ctx.metrics.record_rejection(&self.swap_id, label);
                }
                return Err(err);
            }
        };

        let to = self.state;
        if from != to {
            info!(swap_id = %self.swap_id, role = %self.role, %from, %to, event = label, "Swap transition");
            self.ctx.metrics.record_transition(&self.swap_id, from, to);
        }
        Ok(Step { from, to, outbound })
    }

    async fn on_maker_event(&mut self, event: SwapEvent) -> Result<Vec<PeerMessage>, MachineError> {
        match event {
            SwapEvent::Deploy => self.deploy().await,
            SwapEvent::Peer(PeerMessage::NotifyCounterAssetLocked { swap_id, lock_proof }) => {
                self.require_swap_id(swap_id)?;
                self.accept_counter_lock(lock_proof)
            }
            SwapEvent::SetReady => self.set_ready().await,
            SwapEvent::Peer(PeerMessage::RelayClaim(request)) => self.relay_for_taker(request).await,
            other => Err(self.violation(other.label(), "not a maker event")),
        }
    }

    async fn on_taker_event(&mut self, event: SwapEvent) -> Result<Vec<PeerMessage>, MachineError> {
        match event {
            SwapEvent::Peer(PeerMessage::NotifyContractDeployed {
                swap_id,
                contract_address,
            }) => {
                self.require_swap_id(swap_id)?;
                self.verify_contract(ContractHandle {
                    address: contract_address,
                    swap_id,
                })
                .await
            }
            SwapEvent::CounterAssetLocked(lock_proof) => self.counter_asset_locked(lock_proof),
            SwapEvent::Peer(PeerMessage::NotifyReady { swap_id }) => {
                self.require_swap_id(swap_id)?;
                self.observe_ready().await
            }
            SwapEvent::Claim => self.claim().await,
            other => Err(self.violation(other.label(), "not a taker event")),
        }
    }

    /// Allowed until this side has moved funds: the maker's deploy, the taker's XMR lock.
    fn on_cancel(&mut self) -> Result<Vec<PeerMessage>, MachineError> {
        let cancellable = match self.role {
            Role::Maker => self.state == SwapState::Created,
            Role::Taker => matches!(self.state, SwapState::Created | SwapState::ContractDeployed),
        };
        if !cancellable {
            return Err(self.violation("cancel", "funds already committed"));
        }
        self.state = SwapState::Aborted;
        Ok(Vec::new())
    }

    async fn deploy(&mut self) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_state("deploy", &[SwapState::Created])?;
        let now = self.monitor.now();
        let margin = self.ctx.retry.deadline_margin.as_secs();
        if now.saturating_add(margin) >= self.params.timeout_0 {
            return Err(MachineError::Timelock {
                action: "deploy",
                status: self.monitor.status_at(now),
            });
        }

        let ctx = self.ctx.clone();
        let handle = ctx.contract.handle_for(&self.params);
        let contract = &ctx.contract;
        let params = &self.params;
        let result = with_retry(&ctx, "new_swap", Some(params.timeout_0), || {
            create_swap(contract, handle, params)
        })
        .await;
        if let Err(err) = result {
            return self.chain_action_failed("new_swap", err);
        }

        self.handle = Some(handle);
        self.state = SwapState::ContractDeployed;
        Ok(vec![PeerMessage::NotifyContractDeployed {
            swap_id: self.swap_id,
            contract_address: handle.address,
        }])
    }

    fn accept_counter_lock(&mut self, proof: LockProof) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_state("notify_counter_asset_locked", &[SwapState::ContractDeployed])?;
        self.check_lock_proof(&proof)?;
        let status = self.monitor.status();
        if status != DeadlineStatus::BeforeT0 {
            return Err(MachineError::Timelock {
                action: "accept_counter_lock",
                status,
            });
        }
        debug!(swap_id = %self.swap_id, amount = proof.amount, tx_id = %proof.tx_id, "Counter-asset lock accepted");
        self.lock_proof = Some(proof);
        self.state = SwapState::CounterAssetLocked;
        Ok(Vec::new())
    }

    async fn set_ready(&mut self) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_state("set_ready", &[SwapState::CounterAssetLocked])?;
        let now = self.monitor.now();
        if !self.monitor.can_set_ready_at(now) {
            return Err(MachineError::Timelock {
                action: "set_ready",
                status: self.monitor.status_at(now),
            });
        }
        self.ready_attempted = true;

        let handle = self.require_handle()?;
        let ctx = self.ctx.clone();
        let contract = &ctx.contract;
        let params = &self.params;
        let result = with_retry(&ctx, "set_ready", Some(params.timeout_0), || {
            ensure_ready(contract, handle, params)
        })
        .await;
        match result {
            Ok(Stage::Completed) => return self.settle_from_chain(handle).await,
            Ok(_) => {}
            Err(err) => return self.chain_action_failed("set_ready", err),
        }

        self.monitor.mark_ready();
        self.state = SwapState::Ready;
        Ok(vec![PeerMessage::NotifyReady {
            swap_id: self.swap_id,
        }])
    }

    /// Maker submits the taker's signed claim and learns the taker's secret from it.
    async fn relay_for_taker(
        &mut self,
        request: RelayClaimRequest,
    ) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_state("relay_claim", &[SwapState::Ready])?;
        let handle = self.require_handle()?;
        if request.swap != self.params || request.swap_creator_addr != handle.address {
            return Err(MachineError::Rejected(
                "relay claim is for a different swap".into(),
            ));
        }
        let status = self.monitor.status();
        if status != DeadlineStatus::ReadyBeforeT1 {
            return Err(MachineError::Timelock {
                action: "relay_claim",
                status,
            });
        }

        let ctx = self.ctx.clone();
        let started = Instant::now();
        let receipt =
            submit_relay_claim(&ctx.contract, &ctx.relay_guard, ctx.chain_id, &request).await;
        ctx.metrics.record_latency("claim_relayer", started.elapsed());
        let receipt = receipt?;
        debug!(swap_id = %self.swap_id, tx_hash = %receipt.tx_hash, "Relayed claim confirmed");
        self.settle_from_chain(handle).await
    }

    async fn verify_contract(
        &mut self,
        handle: ContractHandle,
    ) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_state("notify_contract_deployed", &[SwapState::Created])?;
        let now = self.monitor.now();
        let margin = self.ctx.retry.deadline_margin.as_secs();
        if now.saturating_add(margin) >= self.params.timeout_0 {
            return Err(MachineError::Timelock {
                action: "verify_contract",
                status: self.monitor.status_at(now),
            });
        }

        let ctx = self.ctx.clone();
        let started = Instant::now();
        let verified = ctx
            .contract
            .verify_deployed_parameters(&handle, &self.params, &ctx.expected_contract)
            .await;
        ctx.metrics.record_latency("verify_contract", started.elapsed());
        if !verified? {
            return Err(MachineError::Rejected(format!(
                "contract at {} does not hold the agreed swap",
                handle.address
            )));
        }

        self.handle = Some(handle);
        self.state = SwapState::ContractDeployed;
        Ok(Vec::new())
    }

    fn counter_asset_locked(&mut self, proof: LockProof) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_state("counter_asset_locked", &[SwapState::ContractDeployed])?;
        self.check_lock_proof(&proof)?;
        self.lock_proof = Some(proof.clone());
        self.state = SwapState::CounterAssetLocked;
        Ok(vec![PeerMessage::NotifyCounterAssetLocked {
            swap_id: self.swap_id,
            lock_proof: proof,
        }])
    }

    /// Moves the taker to `Ready` once the chain says so; peer notifications alone are not
    /// trusted.
    async fn observe_ready(&mut self) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_state("notify_ready", &[SwapState::CounterAssetLocked])?;
        let handle = self.require_handle()?;
        match self.ctx.contract.stage(&handle).await? {
            Stage::Ready => {
                self.monitor.mark_ready();
                self.state = SwapState::Ready;
                Ok(Vec::new())
            }
            Stage::Completed => self.settle_from_chain(handle).await,
            stage => Err(MachineError::Rejected(format!(
                "swap is {stage:?} on chain, not ready"
            ))),
        }
    }

    async fn claim(&mut self) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_state("claim", &[SwapState::Ready])?;
        let now = self.monitor.now();
        if !self.monitor.can_claim_at(now) {
            return Err(MachineError::Timelock {
                action: "claim",
                status: self.monitor.status_at(now),
            });
        }
        let handle = self.require_handle()?;
        let margin = self.ctx.retry.deadline_margin.as_secs();
        if self.options.claim_via_relay && now < self.params.deadlines().claim_fallback(margin) {
            return self.claim_via_relay(handle).await;
        }
        self.claim_directly(handle).await
    }

    async fn claim_directly(
        &mut self,
        handle: ContractHandle,
    ) -> Result<Vec<PeerMessage>, MachineError> {
        let ctx = self.ctx.clone();
        let contract = &ctx.contract;
        let params = &self.params;
        let secret = &self.secret;
        let result = with_retry(&ctx, "claim", Some(params.timeout_1), || {
            ensure_claimed(contract, handle, params, secret)
        })
        .await;
        match result {
            Ok(_) => {}
            Err(err @ RetryError::DeadlineAtRisk { .. }) => {
                warn!(swap_id = %self.swap_id, error = %err, "Claim window closing; no further claim attempts");
                self.claim_abandoned = true;
                return Err(err.into());
            }
            Err(err) => return self.chain_action_failed("claim", err),
        }
        self.claim_submitted = true;
        self.settle_from_chain(handle).await
    }

    /// The relayed claim never showed up on chain; claim with our own account.
    async fn claim_fallback(&mut self) -> Result<Vec<PeerMessage>, MachineError> {
        self.claim_relayed = false;
        self.claim_submitted = false;
        let handle = self.require_handle()?;
        if let Some(outcome) = self.observed_outcome(handle).await? {
            self.apply_outcome(outcome)?;
            return Ok(Vec::new());
        }
        let now = self.monitor.now();
        if !self.monitor.can_claim_at(now) {
            return Err(MachineError::Timelock {
                action: "claim",
                status: self.monitor.status_at(now),
            });
        }
        warn!(swap_id = %self.swap_id, "Relayed claim not on chain; claiming directly");
        self.claim_directly(handle).await
    }

    async fn claim_via_relay(
        &mut self,
        handle: ContractHandle,
    ) -> Result<Vec<PeerMessage>, MachineError> {
        let ctx = self.ctx.clone();
        let key = ctx
            .claimer_key
            .as_ref()
            .ok_or_else(|| MachineError::Rejected("no claimer key for relay claims".into()))?;
        let request = build_relay_claim(key, &handle, &self.params, &self.secret, ctx.chain_id)?;

        match &ctx.relay {
            Some(relay) => {
                let started = Instant::now();
                let tx_hash = relay.submit(request).await;
                ctx.metrics.record_latency("relay_submit", started.elapsed());
                let tx_hash = tx_hash?;
                info!(swap_id = %self.swap_id, %tx_hash, "Claim submitted through relayer");
                self.claim_submitted = true;
                self.claim_relayed = true;
                if let Some(outcome) = self.observed_outcome(handle).await? {
                    self.apply_outcome(outcome)?;
                }
                Ok(Vec::new())
            }
            None => {
                info!(swap_id = %self.swap_id, "Forwarding relay claim to counterparty");
                self.claim_submitted = true;
                self.claim_relayed = true;
                Ok(vec![PeerMessage::RelayClaim(
                    request.with_offer_id(self.swap_id),
                )])
            }
        }
    }

    async fn on_chain_event(&mut self, event: ChainEvent) -> Result<Vec<PeerMessage>, MachineError> {
        self.require_swap_id(event.swap_id())?;
        let Some(handle) = self.handle else {
            return Err(self.violation("chain_event", "contract location unknown"));
        };

        match event {
            ChainEvent::Ready { .. } => {
                if self.role == Role::Taker && self.state == SwapState::CounterAssetLocked {
                    return self.observe_ready().await;
                }
                debug!(swap_id = %self.swap_id, state = %self.state, "Ready event needs no transition");
                Ok(Vec::new())
            }
            ChainEvent::Claimed { .. } | ChainEvent::Refunded { .. } => {
                if !self.state.is_funded() {
                    return Err(self.violation("chain_event", "no funds in the contract"));
                }
                let events = self.ctx.contract.events(&handle).await?;
                if !events.contains(&event) {
                    return Err(MachineError::Rejected(
                        "event not found on chain".into(),
                    ));
                }
                self.apply_outcome(event)?;
                Ok(Vec::new())
            }
        }
    }

    async fn on_deadline(&mut self, kind: DeadlineKind) -> Result<Vec<PeerMessage>, MachineError> {
        if kind == DeadlineKind::T0 {
            self.t0_handled = true;
        }
        if kind == DeadlineKind::ClaimFallback {
            if self.role == Role::Taker && self.state == SwapState::Ready {
                return self.claim_fallback().await;
            }
            self.claim_relayed = false;
            return Ok(Vec::new());
        }

        match (self.role, kind, self.state) {
            (_, DeadlineKind::T0, SwapState::Created) => {
                info!(swap_id = %self.swap_id, role = %self.role, "t0 reached before the contract was deployed; aborting");
                self.state = SwapState::Aborted;
                Ok(Vec::new())
            }
            (Role::Taker, DeadlineKind::T0, SwapState::ContractDeployed) => {
                info!(swap_id = %self.swap_id, "t0 reached before the counter-asset was locked; aborting");
                self.state = SwapState::Aborted;
                Ok(Vec::new())
            }
            (
                Role::Maker,
                DeadlineKind::T0,
                SwapState::ContractDeployed | SwapState::CounterAssetLocked,
            ) => {
                info!(swap_id = %self.swap_id, state = %self.state, "Swap not ready before t0; aborting and refunding");
                self.refund(Some(self.params.timeout_0)).await
            }
            (
                Role::Maker,
                DeadlineKind::T1,
                SwapState::ContractDeployed | SwapState::CounterAssetLocked | SwapState::Ready,
            ) => {
                info!(swap_id = %self.swap_id, state = %self.state, "t1 reached without a claim; refunding");
                self.refund(None).await
            }
            _ => {
                debug!(swap_id = %self.swap_id, ?kind, state = %self.state, "Deadline needs no action");
                Ok(Vec::new())
            }
        }
    }

    async fn refund(&mut self, deadline: Option<u64>) -> Result<Vec<PeerMessage>, MachineError> {
        let handle = self.require_handle()?;
        if let Some(outcome) = self.observed_outcome(handle).await? {
            self.apply_outcome(outcome)?;
            return Ok(Vec::new());
        }

        let now = self.monitor.now();
        if !self.monitor.can_refund_at(now, false) {
            return Err(MachineError::Timelock {
                action: "refund",
                status: self.monitor.status_at(now),
            });
        }

        let ctx = self.ctx.clone();
        let contract = &ctx.contract;
        let params = &self.params;
        let secret = &self.secret;
        let result = with_retry(&ctx, "refund", deadline, || {
            ensure_refunded(contract, handle, params, secret)
        })
        .await;
        if let Err(err) = result {
            return self.chain_action_failed("refund", err);
        }
        self.settle_from_chain(handle).await
    }

    async fn on_resync(&mut self) -> Result<Vec<PeerMessage>, MachineError> {
        let handle = match (self.handle, self.role) {
            (Some(handle), _) => handle,
            (None, Role::Maker) => self.ctx.contract.handle_for(&self.params),
            (None, Role::Taker) => {
                debug!(swap_id = %self.swap_id, "No contract announced yet; nothing to resync");
                return Ok(Vec::new());
            }
        };

        let stage = self.ctx.contract.stage(&handle).await?;
        if stage == Stage::Invalid {
            debug!(swap_id = %self.swap_id, "No swap record on chain");
            return Ok(Vec::new());
        }
        self.handle = Some(handle);

        if let Some(outcome) = self.observed_outcome(handle).await? {
            self.apply_outcome(outcome)?;
            return Ok(Vec::new());
        }

        match stage {
            Stage::Ready => {
                self.monitor.mark_ready();
                self.state = SwapState::Ready;
            }
            Stage::Pending if self.state == SwapState::Created => {
                self.state = SwapState::ContractDeployed;
            }
            _ => {}
        }
        Ok(Vec::new())
    }

    /// Reads the final outcome back from the chain and applies it.
    async fn settle_from_chain(
        &mut self,
        handle: ContractHandle,
    ) -> Result<Vec<PeerMessage>, MachineError> {
        match self.observed_outcome(handle).await? {
            Some(outcome) => {
                self.apply_outcome(outcome)?;
                Ok(Vec::new())
            }
            None => Err(ContractError::Rpc("swap outcome not visible on chain yet".into()).into()),
        }
    }

    async fn observed_outcome(
        &self,
        handle: ContractHandle,
    ) -> Result<Option<ChainEvent>, MachineError> {
        let events = self.ctx.contract.events(&handle).await?;
        Ok(events.into_iter().find(|event| {
            matches!(
                event,
                ChainEvent::Claimed { .. } | ChainEvent::Refunded { .. }
            )
        }))
    }

    fn apply_outcome(&mut self, event: ChainEvent) -> Result<(), MachineError> {
        match event {
            ChainEvent::Claimed { secret, .. } => {
                let revealed = Secret::from_canonical_bytes(secret.0)?;
                if !verify_secret_matches_commitment(&revealed, &self.params.claim_commitment) {
                    return Err(MachineError::Rejected(
                        "claimed secret does not open the claim commitment".into(),
                    ));
                }
                if self.role == Role::Maker {
                    self.learn_counterparty_secret(revealed)?;
                }
                self.state = SwapState::Claimed;
            }
            ChainEvent::Refunded { secret, .. } => {
                let revealed = Secret::from_canonical_bytes(secret.0)?;
                if !verify_secret_matches_commitment(&revealed, &self.params.refund_commitment) {
                    return Err(MachineError::Rejected(
                        "refund secret does not open the refund commitment".into(),
                    ));
                }
                if self.role == Role::Taker {
                    self.learn_counterparty_secret(revealed)?;
                }
                self.state = SwapState::Refunded;
            }
            ChainEvent::Ready { .. } => self.monitor.mark_ready(),
        }
        Ok(())
    }

    fn learn_counterparty_secret(&mut self, revealed: Secret) -> Result<(), MachineError> {
        let spend_key = derive_joint_spend_key(&self.secret, &revealed);
        if !self.joint_key.is_spendable_by(&spend_key) {
            return Err(MachineError::Rejected(
                "revealed secret does not unlock the joint key".into(),
            ));
        }
        info!(swap_id = %self.swap_id, role = %self.role, joint_key = ?self.joint_key, "Recovered joint spend key");
        self.counterparty_secret = Some(revealed);
        Ok(())
    }

    fn check_lock_proof(&self, proof: &LockProof) -> Result<(), MachineError> {
        if proof.joint_key != self.joint_key {
            return Err(MachineError::Rejected(
                "counter-asset locked to the wrong joint key".into(),
            ));
        }
        if proof.amount < self.counter_amount {
            return Err(MachineError::Rejected(format!(
                "counter-asset amount {} below agreed {}",
                proof.amount, self.counter_amount
            )));
        }
        Ok(())
    }

    /// Unauthorized means this account can never perform the action; the swap is abandoned
    /// locally. Everything else is reported and the state is kept.
    fn chain_action_failed(
        &mut self,
        action: &'static str,
        err: RetryError,
    ) -> Result<Vec<PeerMessage>, MachineError> {
        if err.is_unauthorized() {
            warn!(swap_id = %self.swap_id, role = %self.role, action, error = %err, "Caller not permitted; aborting swap");
            self.state = SwapState::Aborted;
            return Ok(Vec::new());
        }
        Err(err.into())
    }

    fn require_state(
        &self,
        event: &'static str,
        allowed: &[SwapState],
    ) -> Result<(), MachineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.violation(event, format!("expected one of {allowed:?}")))
        }
    }

    fn require_swap_id(&self, swap_id: SwapId) -> Result<(), MachineError> {
        if swap_id == self.swap_id {
            Ok(())
        } else {
            Err(MachineError::Rejected(format!(
                "event for swap {swap_id} delivered to {}",
                self.swap_id
            )))
        }
    }

    fn require_handle(&self) -> Result<ContractHandle, MachineError> {
        self.handle
            .ok_or_else(|| self.violation("chain_action", "contract location unknown"))
    }

    fn violation(&self, event: &'static str, reason: impl Into<String>) -> MachineError {
        MachineError::PolicyViolation {
            role: self.role,
            state: self.state,
            event,
            reason: reason.into(),
        }
    }
}

async fn with_retry<T, F, Fut>(
    ctx: &SwapContext,
    label: &'static str,
    deadline: Option<u64>,
    action: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ContractError>>,
{
    let started = Instant::now();
    let result = retry_before_deadline(label, &ctx.retry, ctx.clock.as_ref(), deadline, action).await;
    ctx.metrics.record_latency(label, started.elapsed());
    result
}

async fn create_swap(
    contract: &SwapContract,
    handle: ContractHandle,
    params: &SwapParameters,
) -> Result<Option<Receipt>, ContractError> {
    if contract.stage(&handle).await? != Stage::Invalid {
        return Ok(None);
    }
    let (_, receipt) = contract.deploy(params).await?;
    Ok(Some(receipt))
}

/// Returns the stage the swap ended up in.
async fn ensure_ready(
    contract: &SwapContract,
    handle: ContractHandle,
    params: &SwapParameters,
) -> Result<Stage, ContractError> {
    match contract.stage(&handle).await? {
        Stage::Pending => {
            contract.set_ready(&handle, params).await?;
            Ok(Stage::Ready)
        }
        Stage::Invalid => Err(ContractError::SwapNotFound(handle.swap_id)),
        stage => Ok(stage),
    }
}

async fn ensure_claimed(
    contract: &SwapContract,
    handle: ContractHandle,
    params: &SwapParameters,
    secret: &Secret,
) -> Result<Option<Receipt>, ContractError> {
    match contract.stage(&handle).await? {
        Stage::Completed => Ok(None),
        Stage::Invalid => Err(ContractError::SwapNotFound(handle.swap_id)),
        _ => contract.claim(&handle, params, secret).await.map(Some),
    }
}

async fn ensure_refunded(
    contract: &SwapContract,
    handle: ContractHandle,
    params: &SwapParameters,
    secret: &Secret,
) -> Result<Option<Receipt>, ContractError> {
    match contract.stage(&handle).await? {
        Stage::Completed => Ok(None),
        Stage::Invalid => Err(ContractError::SwapNotFound(handle.swap_id)),
        _ => contract.refund(&handle, params, secret).await.map(Some),
    }
}
