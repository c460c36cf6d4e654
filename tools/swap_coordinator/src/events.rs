//! Feeds contract events to the swaps that are waiting for them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::contract::{ChainEvent, SwapContract};
use crate::machine::SwapEvent;
use crate::registry::{RegistryError, SwapRegistry};

pub struct ChainEventPoller {
    registry: Arc<SwapRegistry>,
    contract: SwapContract,
    interval: Duration,
    seen: HashSet<ChainEvent>,
}

impl ChainEventPoller {
    pub fn new(registry: Arc<SwapRegistry>, contract: SwapContract, interval: Duration) -> Self {
        Self {
            registry,
            contract,
            interval,
            seen: HashSet::new(),
        }
    }

    /// Reads events for every watched contract once and dispatches those not seen before.
    /// Returns how many were dispatched.
    pub async fn poll_once(&mut self) -> usize {
        let mut dispatched = 0;
        let watched = self.registry.watched_contracts().await;
        // Finished swaps are no longer watched; their events can go.
        self.seen
            .retain(|event| watched.iter().any(|handle| handle.swap_id == event.swap_id()));
        for handle in watched {
            let events = match self.contract.at(handle.address).events(&handle).await {
                Ok(events) => events,
                Err(err) => {
                    warn!(swap_id = %handle.swap_id, error = %err, "Failed to read swap events");
                    continue;
                }
            };

            for event in events {
                if self.seen.contains(&event) {
                    continue;
                }
                match self
                    .registry
                    .dispatch(handle.swap_id, SwapEvent::Chain(event.clone()))
                    .await
                {
                    Ok(()) => {
                        debug!(swap_id = %handle.swap_id, ?event, "Chain event dispatched");
                        self.seen.insert(event);
                        dispatched += 1;
                    }
                    Err(RegistryError::Finished { .. }) => {
                        self.seen.insert(event);
                    }
                    Err(err) => warn!(swap_id = %handle.swap_id, error = %err, "Chain event not delivered"),
                }
            }
        }
        dispatched
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Chain event poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Chain event poller stopped");
    }
}
