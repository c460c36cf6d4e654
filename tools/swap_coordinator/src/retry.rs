use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::SwapConfig;
use crate::contract::ContractError;
use crate::timeout::Clock;

const DEADLINE_MARGIN_ENV: &str = "SWAP_RETRY_DEADLINE_MARGIN_SECS";

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempt_timeout: Duration,
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ms: u64,
    /// No attempt starts once the deadline is closer than this.
    pub deadline_margin: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(300),
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_ms: 250,
            deadline_margin: Duration::from_secs(12),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let attempt_timeout_ms = read_env_u64(
            "SWAP_RETRY_ATTEMPT_TIMEOUT_MS",
            default.attempt_timeout.as_millis() as u64,
        );
        let max_retries = read_env_u64("SWAP_RETRY_MAX_RETRIES", default.max_retries as u64);
        let base_delay_ms = read_env_u64("SWAP_RETRY_BASE_DELAY_MS", default.base_delay.as_millis() as u64);
        let max_delay_ms = read_env_u64("SWAP_RETRY_MAX_DELAY_MS", default.max_delay.as_millis() as u64);
        let jitter_ms = read_env_u64("SWAP_RETRY_JITTER_MS", default.jitter_ms);
        let margin_secs = read_env_u64(DEADLINE_MARGIN_ENV, default.deadline_margin.as_secs());
        Self {
            attempt_timeout: Duration::from_millis(attempt_timeout_ms),
            max_retries: max_retries as usize,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            jitter_ms,
            deadline_margin: Duration::from_secs(margin_secs),
        }
    }

    /// Environment settings with the margin taken from the network's confirmation depth,
    /// unless the environment sets one explicitly.
    pub fn for_network(config: &SwapConfig) -> Self {
        let mut retry = Self::from_env();
        if std::env::var_os(DEADLINE_MARGIN_ENV).is_none() {
            retry.deadline_margin = config.deadline_margin();
        }
        retry
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt as u32));
        let capped = std::cmp::min(backoff, self.max_delay);
        let jitter = if self.jitter_ms == 0 {
            Duration::from_millis(0)
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
        };
        capped + jitter
    }
}

fn read_env_u64(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{label}: deadline {deadline} too close to keep retrying")]
    DeadlineAtRisk {
        label: &'static str,
        deadline: u64,
        last_error: Option<ContractError>,
    },
    #[error("{label}: gave up after {attempts} attempts: {source}")]
    Exhausted {
        label: &'static str,
        attempts: usize,
        source: ContractError,
    },
    #[error("{label}: {source}")]
    Fatal {
        label: &'static str,
        source: ContractError,
    },
}

impl RetryError {
    pub fn contract_error(&self) -> Option<&ContractError> {
        match self {
            Self::DeadlineAtRisk { last_error, .. } => last_error.as_ref(),
            Self::Exhausted { source, .. } | Self::Fatal { source, .. } => Some(source),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::Fatal {
                source: ContractError::Unauthorized(_),
                ..
            }
        )
    }
}

/// Runs `action` with exponential backoff. Non-retryable errors return at once, and no
/// attempt starts later than `deadline_margin` before `deadline`.
pub async fn retry_before_deadline<T, F, Fut>(
    label: &'static str,
    config: &RetryConfig,
    clock: &dyn Clock,
    deadline: Option<u64>,
    mut action: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ContractError>>,
{
    let margin = config.deadline_margin.as_secs();
    let attempts = config.max_retries.saturating_add(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if let Some(deadline) = deadline {
            if clock.now().saturating_add(margin) > deadline {
                warn!(label, deadline, attempt, "Deadline within safety margin; not retrying");
                return Err(RetryError::DeadlineAtRisk {
                    label,
                    deadline,
                    last_error,
                });
            }
        }

        let err = match timeout(config.attempt_timeout, action()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if !err.is_retryable() => {
                return Err(RetryError::Fatal { label, source: err });
            }
            Ok(Err(err)) => err,
            Err(_) => ContractError::Rpc(format!("{label} attempt timed out")),
        };

        if attempt + 1 >= attempts {
            return Err(RetryError::Exhausted {
                label,
                attempts,
                source: err,
            });
        }
        warn!(attempt = attempt + 1, error = %err, "Chain error on {label}; retrying");
        last_error = Some(err);
        sleep(config.backoff(attempt)).await;
    }

    Err(RetryError::Exhausted {
        label,
        attempts,
        source: last_error.unwrap_or_else(|| ContractError::Rpc("no attempts configured".into())),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::timeout::ManualClock;

    fn config() -> RetryConfig {
        RetryConfig {
            attempt_timeout: Duration::from_millis(50),
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_ms: 0,
            deadline_margin: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let clock = ManualClock::new(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = retry_before_deadline("test", &config(), clock.as_ref(), Some(100), move || {
            let calls = calls_clone.clone();
            async move {
                let current = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if current < 3 {
                    Err(ContractError::Rpc("fail".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_never_retried() {
        let clock = ManualClock::new(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> =
            retry_before_deadline("test", &config(), clock.as_ref(), None, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ContractError::Unauthorized("OnlySwapOwner".into()))
                }
            })
            .await;
        assert!(result.unwrap_err().is_unauthorized());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_inside_deadline_margin() {
        let clock = ManualClock::new(95);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> =
            retry_before_deadline("test", &config(), clock.as_ref(), Some(100), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(RetryError::DeadlineAtRisk { deadline: 100, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausts_retries() {
        let clock = ManualClock::new(0);
        let result: Result<(), _> =
            retry_before_deadline("test", &config(), clock.as_ref(), None, || async {
                Err(ContractError::Rpc("down".into()))
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
    }
}
