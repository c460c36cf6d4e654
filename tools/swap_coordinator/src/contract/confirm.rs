use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub confirmations_required: u64,
    pub reorg_buffer: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            confirmations_required: 1,
            reorg_buffer: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherEvent {
    NotIncluded,
    AwaitingConfirmations {
        included_height: u64,
        current_height: u64,
        remaining: u64,
    },
    Confirmed {
        included_height: u64,
        confirmations: u64,
    },
    ReorgDetected {
        previous_height: u64,
        current_height: u64,
    },
}

/// Tracks one transaction from inclusion to the required confirmation depth.
#[derive(Debug)]
pub struct ConfirmationWatcher {
    config: WatcherConfig,
    last_seen_height: Option<u64>,
    included_height: Option<u64>,
}

impl ConfirmationWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            last_seen_height: None,
            included_height: None,
        }
    }

    pub fn observe_inclusion(&mut self, height: u64) {
        if self.included_height != Some(height) {
            debug!(included_height = height, "Observed transaction inclusion");
            self.included_height = Some(height);
        }
    }

    pub fn update_height(&mut self, current_height: u64) -> Option<WatcherEvent> {
        if let Some(previous) = self.last_seen_height {
            if current_height + self.config.reorg_buffer < previous {
                warn!(
                    previous_height = previous,
                    current_height,
                    "Reorg detected; clearing observed inclusion"
                );
                self.last_seen_height = Some(current_height);
                self.included_height = None;
                return Some(WatcherEvent::ReorgDetected {
                    previous_height: previous,
                    current_height,
                });
            }
        }

        self.last_seen_height = Some(current_height);
        None
    }

    /// The inclusion block counts as the first confirmation.
    pub fn evaluate(&self, current_height: u64) -> WatcherEvent {
        match self.included_height {
            None => WatcherEvent::NotIncluded,
            Some(included_height) => {
                let required = self.config.confirmations_required.max(1);
                let confirmations = (current_height + 1).saturating_sub(included_height);
                if confirmations >= required {
                    WatcherEvent::Confirmed {
                        included_height,
                        confirmations,
                    }
                } else {
                    WatcherEvent::AwaitingConfirmations {
                        included_height,
                        current_height,
                        remaining: required - confirmations,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_not_included_without_observation() {
        let watcher = ConfirmationWatcher::new(WatcherConfig::default());
        assert_eq!(watcher.evaluate(100), WatcherEvent::NotIncluded);
    }

    #[test]
    fn waits_for_depth_then_confirms() {
        let mut watcher = ConfirmationWatcher::new(WatcherConfig {
            confirmations_required: 3,
            reorg_buffer: 5,
        });
        watcher.observe_inclusion(50);
        assert_eq!(
            watcher.evaluate(50),
            WatcherEvent::AwaitingConfirmations {
                included_height: 50,
                current_height: 50,
                remaining: 2,
            }
        );
        assert_eq!(
            watcher.evaluate(52),
            WatcherEvent::Confirmed {
                included_height: 50,
                confirmations: 3,
            }
        );
    }

    #[test]
    fn reorg_clears_inclusion() {
        let mut watcher = ConfirmationWatcher::new(WatcherConfig {
            confirmations_required: 3,
            reorg_buffer: 5,
        });
        watcher.observe_inclusion(50);
        watcher.update_height(100);
        assert_eq!(
            watcher.update_height(90),
            Some(WatcherEvent::ReorgDetected {
                previous_height: 100,
                current_height: 90,
            })
        );
        assert_eq!(watcher.evaluate(90), WatcherEvent::NotIncluded);
    }
}
