use std::time::Duration;

use alloy::primitives::{B256, U256};
use swap_coordinator::contract::{ConfirmationConfig, Stage};
use swap_coordinator::harness::{lock_proof, HarnessConfig, SwapHarness, SWAP_CREATOR};
use swap_coordinator::machine::{MachineError, SwapEvent, SwapOptions, SwapSetup};
use swap_coordinator::message::PeerMessage;
use swap_coordinator::params::{SwapId, SwapParameters};
use swap_coordinator::registry::{RegistryError, SwapRegistry};
use swap_coordinator::retry::RetryError;
use swap_coordinator::state::{Role, SwapState};

const ONE_ETH: u128 = 1_000_000_000_000_000_000;
const XMR: u64 = 1_000_000_000_000;
const WAIT: Duration = Duration::from_secs(5);

fn copy(setup: &SwapSetup) -> SwapSetup {
    SwapSetup::new(
        setup.role,
        setup.params.clone(),
        setup.secret.clone(),
        setup.counter_amount,
    )
}

#[tokio::test]
async fn swap_ids_register_once() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let (maker, _) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let swap_id = harness.maker.registry.start(copy(&maker)).await.unwrap();
    assert_eq!(swap_id, maker.params.swap_id());

    let err = harness.maker.registry.start(maker).await.unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateSwap(id) if id == swap_id));
    assert_eq!(harness.maker.registry.statuses().await.len(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn events_for_unknown_swaps_are_rejected() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let unknown = B256::repeat_byte(0x42);
    let err = harness
        .maker
        .registry
        .dispatch(unknown, SwapEvent::Deploy)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnknownSwap(id) if id == unknown));

    let err = harness
        .taker
        .registry
        .deliver(PeerMessage::NotifyReady { swap_id: unknown })
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnknownSwap(_)));
    harness.shutdown().await;
}

#[tokio::test]
async fn initiate_requests_must_match_the_agreed_swap() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let (maker, taker) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let swap_id = harness.taker.registry.expect(taker).await;

    let wrong_role = PeerMessage::InitiateRequest {
        swap_id,
        role: Role::Taker,
        params: maker.params.clone(),
    };
    let err = harness.taker.registry.deliver(wrong_role).await.unwrap_err();
    assert!(matches!(err, RegistryError::InitiateRejected(_)));

    let mut altered = maker.params.clone();
    altered.value = U256::from(1u64);
    let wrong_params = PeerMessage::InitiateRequest {
        swap_id,
        role: Role::Maker,
        params: altered,
    };
    let err = harness.taker.registry.deliver(wrong_params).await.unwrap_err();
    assert!(matches!(err, RegistryError::InitiateRejected(_)));
    assert!(harness.taker.registry.status(swap_id).await.is_none());

    let accepted = PeerMessage::InitiateRequest {
        swap_id,
        role: Role::Maker,
        params: maker.params.clone(),
    };
    harness.taker.registry.deliver(accepted.clone()).await.unwrap();
    let status = harness.taker.registry.status(swap_id).await.unwrap();
    assert_eq!(status.role, Role::Taker);
    assert_eq!(status.state, SwapState::Created);

    // The agreement is consumed by the first request.
    let err = harness.taker.registry.deliver(accepted).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnknownSwap(_)));
    harness.shutdown().await;
}

#[tokio::test]
async fn concurrent_deploys_use_distinct_nonces() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let (first, _) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let (second, _) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let registry = &harness.maker.registry;
    let first = registry.start(first).await.unwrap();
    let second = registry.start(second).await.unwrap();

    let (a, b) = tokio::join!(
        registry.submit(first, SwapEvent::Deploy),
        registry.submit(second, SwapEvent::Deploy)
    );
    assert_eq!(a.unwrap().to, SwapState::ContractDeployed);
    assert_eq!(b.unwrap().to, SwapState::ContractDeployed);

    let mut nonces: Vec<u64> = harness
        .chain
        .submitted()
        .into_iter()
        .filter(|tx| tx.sender == harness.maker.address())
        .map(|tx| tx.nonce)
        .collect();
    nonces.sort_unstable();
    assert_eq!(nonces, vec![0, 1]);
    assert_eq!(harness.chain.stage_of(SWAP_CREATOR, first), Stage::Pending);
    assert_eq!(harness.chain.stage_of(SWAP_CREATOR, second), Stage::Pending);
    assert_eq!(registry.watched_contracts().await.len(), 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn transient_submission_failures_are_retried() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let (maker, _) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let swap_id = harness.maker.registry.start(maker).await.unwrap();

    harness.chain.fail_next_submissions(2);
    let step = harness
        .maker
        .registry
        .submit(swap_id, SwapEvent::Deploy)
        .await
        .unwrap();
    assert_eq!(step.to, SwapState::ContractDeployed);
    assert_eq!(harness.chain.submitted().len(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_leave_the_state_unchanged() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let (maker, _) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let swap_id = harness.maker.registry.start(maker).await.unwrap();

    harness.chain.fail_next_submissions(100);
    let err = harness
        .maker
        .registry
        .submit(swap_id, SwapEvent::Deploy)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Machine(MachineError::Retry(RetryError::Exhausted { attempts: 4, .. }))
    ));
    let status = harness.maker.registry.status(swap_id).await.unwrap();
    assert_eq!(status.state, SwapState::Created);
    assert!(status.last_error.is_some());
    harness.shutdown().await;
}

#[tokio::test]
async fn confirmation_timeout_rereads_chain_before_resubmitting() {
    let harness = SwapHarness::new(HarnessConfig {
        confirmation: ConfirmationConfig {
            timeout: Duration::from_millis(100),
            ..HarnessConfig::default().confirmation
        },
        ..HarnessConfig::default()
    });
    let (maker, _) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let swap_id = harness.maker.registry.start(maker).await.unwrap();

    harness.chain.withhold_inclusions(true);
    let step = harness
        .maker
        .registry
        .submit(swap_id, SwapEvent::Deploy)
        .await
        .unwrap();
    assert_eq!(step.to, SwapState::ContractDeployed);

    let creates = harness
        .chain
        .submitted()
        .into_iter()
        .filter(|tx| tx.call == "new_swap")
        .count();
    assert_eq!(creates, 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn resumed_swap_recovers_state_from_chain() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let (maker, _) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let resumed_setup = copy(&maker);
    let swap_id = harness.maker.registry.start(maker).await.unwrap();
    harness
        .maker
        .registry
        .submit(swap_id, SwapEvent::Deploy)
        .await
        .unwrap();

    let (restarted, _outbound) = SwapRegistry::new(harness.maker.registry.context().clone());
    restarted.resume(resumed_setup).await.unwrap();
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        restarted.wait_for_state(swap_id, SwapState::ContractDeployed),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.state, SwapState::ContractDeployed);
    assert_eq!(status.handle.map(|handle| handle.address), Some(SWAP_CREATOR));

    // Resuming never re-creates the swap.
    let creates = harness
        .chain
        .submitted()
        .into_iter()
        .filter(|tx| tx.call == "new_swap")
        .count();
    assert_eq!(creates, 1);

    restarted.shutdown().await;
    harness.shutdown().await;
}

async fn deploy_and_lock(harness: &SwapHarness, swap_id: SwapId, params: &SwapParameters) {
    harness
        .maker
        .registry
        .submit(swap_id, SwapEvent::Deploy)
        .await
        .unwrap();
    tokio::time::timeout(
        WAIT,
        harness
            .taker
            .registry
            .wait_for_state(swap_id, SwapState::ContractDeployed),
    )
    .await
    .unwrap()
    .unwrap();
    harness
        .taker
        .registry
        .submit(
            swap_id,
            SwapEvent::CounterAssetLocked(lock_proof(params, XMR).unwrap()),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn resumed_taker_does_not_claim_after_t1() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let (maker, mut taker) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    let resumed = copy(&taker);
    taker.options = SwapOptions {
        auto_claim: false,
        ..taker.options
    };
    let params = maker.params.clone();
    let swap_id = harness.open(maker, taker).await.unwrap();
    deploy_and_lock(&harness, swap_id, &params).await;
    let status = tokio::time::timeout(
        WAIT,
        harness.taker.registry.wait_for_state(swap_id, SwapState::Ready),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.state, SwapState::Ready);

    // Maker is offline; the claim window has closed.
    harness.maker.registry.shutdown().await;
    harness.clock.set(params.timeout_1 + 1);

    let (restarted, _outbound) = SwapRegistry::new(harness.taker.registry.context().clone());
    let handle = harness.taker.contract.handle_for(&params);
    restarted.resume(resumed.with_handle(handle)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = restarted.status(swap_id).await.unwrap();
    assert_eq!(status.state, SwapState::Ready);
    assert_eq!(status.events_handled, 1);
    assert!(harness
        .chain
        .submitted()
        .iter()
        .all(|tx| !tx.call.starts_with("claim")));

    restarted.shutdown().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn ready_event_lost_to_a_failed_read_is_recovered() {
    let harness = SwapHarness::new(HarnessConfig::default());
    let (mut maker, taker) = harness.new_swap(U256::from(ONE_ETH), XMR).unwrap();
    maker.options = SwapOptions {
        auto_ready: false,
        ..maker.options
    };
    let params = maker.params.clone();
    let swap_id = harness.open(maker, taker).await.unwrap();
    deploy_and_lock(&harness, swap_id, &params).await;
    tokio::time::timeout(
        WAIT,
        harness
            .maker
            .registry
            .wait_for_state(swap_id, SwapState::CounterAssetLocked),
    )
    .await
    .unwrap()
    .unwrap();

    // The taker's stage check after the Ready event hits a dead node once.
    harness.chain.fail_next_stage_reads(1);
    let handle = harness.maker.contract.handle_for(&params);
    harness
        .maker
        .contract
        .set_ready(&handle, &params)
        .await
        .unwrap();

    let status = tokio::time::timeout(WAIT, harness.taker.registry.wait_for_terminal(swap_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, SwapState::Claimed);
    harness.shutdown().await;
}
