use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::U256;

use swap_coordinator::harness::{lock_proof, HarnessConfig, SwapHarness};
use swap_coordinator::machine::SwapEvent;
use swap_coordinator::metrics::SwapMetrics;
use swap_coordinator::params::SwapId;
use swap_coordinator::state::SwapState;

#[derive(Default)]
struct TestMetrics {
    transitions: Arc<Mutex<Vec<(SwapState, SwapState)>>>,
    latencies: Arc<Mutex<Vec<String>>>,
    rejections: Arc<Mutex<Vec<String>>>,
}

impl SwapMetrics for TestMetrics {
    fn record_transition(&self, _swap_id: &SwapId, from: SwapState, to: SwapState) {
        self.transitions.lock().unwrap().push((from, to));
    }

    fn record_latency(&self, stage: &'static str, _elapsed: Duration) {
        self.latencies.lock().unwrap().push(stage.to_string());
    }

    fn record_rejection(&self, _swap_id: &SwapId, reason: &'static str) {
        self.rejections.lock().unwrap().push(reason.to_string());
    }
}

#[tokio::test]
async fn metrics_are_emitted_on_transition() {
    let metrics = Arc::new(TestMetrics::default());
    let harness = SwapHarness::with_metrics(HarnessConfig::default(), metrics.clone());
    let (maker, taker) = harness
        .new_swap(U256::from(1_000_000_000_000_000_000u128), 10)
        .unwrap();
    let params = maker.params.clone();
    let swap_id = harness.open(maker, taker).await.unwrap();

    let step = harness
        .maker
        .registry
        .submit(swap_id, SwapEvent::Deploy)
        .await
        .unwrap();
    assert!(step.changed());

    {
        let transitions = metrics.transitions.lock().unwrap();
        assert_eq!(
            transitions.first(),
            Some(&(SwapState::Created, SwapState::ContractDeployed))
        );
        let latencies = metrics.latencies.lock().unwrap();
        assert_eq!(latencies.first().map(String::as_str), Some("new_swap"));
    }

    harness
        .taker
        .registry
        .wait_for_state(swap_id, SwapState::ContractDeployed)
        .await
        .unwrap();
    harness
        .taker
        .registry
        .submit(swap_id, SwapEvent::CounterAssetLocked(lock_proof(&params, 10).unwrap()))
        .await
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        harness.maker.registry.wait_for_terminal(swap_id),
    )
    .await
    .unwrap()
    .unwrap();

    let transitions = metrics.transitions.lock().unwrap();
    assert!(transitions.contains(&(SwapState::CounterAssetLocked, SwapState::Ready)));
    assert!(transitions.contains(&(SwapState::Ready, SwapState::Claimed)));
    let latencies = metrics.latencies.lock().unwrap();
    for stage in ["verify_contract", "set_ready", "claim"] {
        assert!(latencies.iter().any(|recorded| recorded == stage), "missing {stage}");
    }
    drop(transitions);
    drop(latencies);
    harness.shutdown().await;
}

#[tokio::test]
async fn rejected_events_are_counted() {
    let metrics = Arc::new(TestMetrics::default());
    let harness = SwapHarness::with_metrics(HarnessConfig::default(), metrics.clone());
    let (maker, _) = harness
        .new_swap(U256::from(1_000_000_000_000_000_000u128), 10)
        .unwrap();
    let swap_id = harness.maker.registry.start(maker).await.unwrap();

    assert!(harness
        .maker
        .registry
        .submit(swap_id, SwapEvent::SetReady)
        .await
        .is_err());
    assert_eq!(
        metrics.rejections.lock().unwrap().as_slice(),
        &["set_ready".to_string()]
    );
    harness.shutdown().await;
}
