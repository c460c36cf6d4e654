//! Swap timelocks and the clock they are measured against.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Source of unix time (seconds) with a suspend-until primitive.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;

    /// Returns once `now() >= deadline`. Cancel by dropping the future.
    async fn sleep_until(&self, deadline: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    async fn sleep_until(&self, deadline: u64) {
        loop {
            let now = self.now();
            if now >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_secs(deadline - now)).await;
        }
    }
}

/// Clock that only moves when told to. Sleepers wake as soon as it passes their deadline.
pub struct ManualClock {
    now: watch::Sender<u64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Arc<Self> {
        let (now, _) = watch::channel(start);
        Arc::new(Self { now })
    }

    pub fn advance(&self, secs: u64) {
        self.now.send_modify(|now| *now += secs);
    }

    pub fn set(&self, at: u64) {
        self.now.send_modify(|now| *now = at);
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.now.borrow())
            .finish()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> u64 {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline: u64) {
        let mut rx = self.now.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Absolute protocol deadlines, fixed when the contract is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadlines {
    /// Last moment (exclusive) the maker may call `set_ready` or refund without waiting.
    pub t0: u64,
    /// Claim window closes and the refund window reopens at this time.
    pub t1: u64,
}

impl Deadlines {
    /// Both windows span `timeout`, the second one starting at `t0`.
    pub fn from_start(start: u64, timeout: Duration) -> Self {
        let secs = timeout.as_secs();
        Self {
            t0: start + secs,
            t1: start + 2 * secs,
        }
    }

    /// Latest time a relayed claim may still be unconfirmed. A direct claim started then
    /// keeps one `margin` clear of t1 through all of its retries.
    pub fn claim_fallback(&self, margin: u64) -> u64 {
        self.t1.saturating_sub(margin.saturating_mul(2))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineKind {
    T0,
    T1,
    /// Taker stops waiting for a relayed claim and claims itself.
    ClaimFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineStatus {
    BeforeT0,
    AfterT0BeforeReady,
    ReadyBeforeT1,
    AfterT1,
}

/// Evaluates timelock guards for one swap.
pub struct TimeoutMonitor {
    deadlines: Deadlines,
    ready: bool,
    clock: Arc<dyn Clock>,
}

impl TimeoutMonitor {
    pub fn new(deadlines: Deadlines, clock: Arc<dyn Clock>) -> Self {
        Self {
            deadlines,
            ready: false,
            clock,
        }
    }

    pub fn deadlines(&self) -> Deadlines {
        self.deadlines
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn status(&self) -> DeadlineStatus {
        self.status_at(self.clock.now())
    }

    pub fn status_at(&self, now: u64) -> DeadlineStatus {
        if now >= self.deadlines.t1 {
            DeadlineStatus::AfterT1
        } else if self.ready {
            DeadlineStatus::ReadyBeforeT1
        } else if now < self.deadlines.t0 {
            DeadlineStatus::BeforeT0
        } else {
            DeadlineStatus::AfterT0BeforeReady
        }
    }

    pub fn can_set_ready_at(&self, now: u64) -> bool {
        self.status_at(now) == DeadlineStatus::BeforeT0
    }

    pub fn can_claim_at(&self, now: u64) -> bool {
        self.status_at(now) == DeadlineStatus::ReadyBeforeT1
    }

    /// Refund windows: before t0 while not ready, or from t1 on if nothing was claimed.
    pub fn can_refund_at(&self, now: u64, claimed: bool) -> bool {
        match self.status_at(now) {
            DeadlineStatus::BeforeT0 => true,
            DeadlineStatus::AfterT1 => !claimed,
            DeadlineStatus::AfterT0BeforeReady | DeadlineStatus::ReadyBeforeT1 => false,
        }
    }

    pub async fn sleep_until(&self, at: u64) {
        self.clock.sleep_until(at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (Arc<ManualClock>, TimeoutMonitor) {
        let clock = ManualClock::new(1_000);
        let deadlines = Deadlines::from_start(1_000, Duration::from_secs(100));
        (clock.clone(), TimeoutMonitor::new(deadlines, clock))
    }

    #[test]
    fn status_follows_deadlines() {
        let (_, mut monitor) = monitor();
        assert_eq!(monitor.status_at(1_099), DeadlineStatus::BeforeT0);
        assert_eq!(monitor.status_at(1_100), DeadlineStatus::AfterT0BeforeReady);
        monitor.mark_ready();
        assert_eq!(monitor.status_at(1_050), DeadlineStatus::ReadyBeforeT1);
        assert_eq!(monitor.status_at(1_199), DeadlineStatus::ReadyBeforeT1);
        assert_eq!(monitor.status_at(1_200), DeadlineStatus::AfterT1);
    }

    #[test]
    fn refund_reopens_exactly_at_t1_after_ready() {
        let (_, mut monitor) = monitor();
        monitor.mark_ready();
        assert!(!monitor.can_refund_at(1_199, false));
        assert!(monitor.can_refund_at(1_200, false));
        assert!(!monitor.can_refund_at(1_200, true));
    }

    #[test]
    fn claim_and_refund_windows_are_disjoint() {
        let (_, mut monitor) = monitor();
        for now in [1_000, 1_099, 1_100, 1_150, 1_199, 1_200, 1_500] {
            assert!(!(monitor.can_claim_at(now) && monitor.can_refund_at(now, false)));
        }
        monitor.mark_ready();
        for now in [1_000, 1_099, 1_100, 1_150, 1_199, 1_200, 1_500] {
            assert!(!(monitor.can_claim_at(now) && monitor.can_refund_at(now, false)));
        }
    }

    #[test]
    fn nothing_allowed_between_t0_and_t1_without_ready() {
        let (_, monitor) = monitor();
        assert!(!monitor.can_set_ready_at(1_100));
        assert!(!monitor.can_claim_at(1_150));
        assert!(!monitor.can_refund_at(1_150, false));
    }

    #[test]
    fn claim_fallback_leaves_room_for_a_direct_claim() {
        let deadlines = Deadlines::from_start(1_000, Duration::from_secs(100));
        assert_eq!(deadlines.claim_fallback(12), 1_176);
        assert_eq!(deadlines.claim_fallback(5_000), 0);
    }

    #[tokio::test]
    async fn manual_clock_wakes_sleepers() {
        let (clock, monitor) = monitor();
        let sleeper = tokio::spawn(async move { monitor.sleep_until(1_100).await });
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());
        clock.advance(100);
        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
    }
}
