//! One-shot readiness signal shared by every waiter of a tunnel attempt
//!
//! The signal is a single `watch` slot that goes from `None` to `Some(outcome)`
//! exactly once. Waiters subscribe at any time: a waiter that arrives after the
//! outcome was decided sees it immediately instead of blocking.

use std::time::Duration;

use tokio::sync::watch;

use ssmtun_common::LaunchError;

/// Terminal outcome of one launch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
    Ready,
    Failed(LaunchError),
}

impl From<Result<(), LaunchError>> for TunnelOutcome {
    fn from(result: Result<(), LaunchError>) -> Self {
        match result {
            Ok(()) => TunnelOutcome::Ready,
            Err(e) => TunnelOutcome::Failed(e),
        }
    }
}

/// Exactly-once, multi-waiter outcome broadcast
#[derive(Debug)]
pub struct ReadySignal {
    slot: watch::Sender<Option<TunnelOutcome>>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Publish the outcome. Returns false if an outcome was already published,
    /// in which case the stored outcome is left untouched.
    pub fn fire(&self, outcome: TunnelOutcome) -> bool {
        let mut outcome = Some(outcome);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    /// The published outcome, if any
    pub fn outcome(&self) -> Option<TunnelOutcome> {
        self.slot.borrow().clone()
    }

    pub fn has_fired(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Wait until an outcome is published
    pub async fn wait(&self) -> TunnelOutcome {
        let mut rx = self.slot.subscribe();
        let result = rx.wait_for(Option::is_some).await;
        match result {
            Ok(slot) => (*slot)
                .clone()
                .unwrap_or(TunnelOutcome::Failed(LaunchError::Abandoned)),
            // The sender lives in `self`, so the channel cannot close under us
            Err(_) => TunnelOutcome::Failed(LaunchError::Abandoned),
        }
    }

    /// Wait at most `timeout`; `None` when it elapsed first
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<TunnelOutcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fires_exactly_once() {
        let signal = ReadySignal::new();
        assert!(!signal.has_fired());

        assert!(signal.fire(TunnelOutcome::Ready));
        assert!(!signal.fire(TunnelOutcome::Failed(LaunchError::Rejected(
            "late".to_string()
        ))));

        assert_eq!(signal.outcome(), Some(TunnelOutcome::Ready));
    }

    #[tokio::test]
    async fn test_all_waiters_see_same_outcome() {
        let signal = Arc::new(ReadySignal::new());
        let mut waiters = Vec::new();
        for _ in 0..16 {
            let signal = signal.clone();
            waiters.push(tokio::spawn(async move { signal.wait().await }));
        }
        tokio::task::yield_now().await;

        let failure = TunnelOutcome::Failed(LaunchError::Spawn("no aws cli".to_string()));
        assert!(signal.fire(failure.clone()));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), failure);
        }
    }

    #[tokio::test]
    async fn test_late_joiner_does_not_block() {
        let signal = ReadySignal::new();
        signal.fire(TunnelOutcome::Ready);

        let outcome = signal.wait_timeout(Duration::from_millis(50)).await;
        assert_eq!(outcome, Some(TunnelOutcome::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_elapses() {
        let signal = ReadySignal::new();
        assert_eq!(signal.wait_timeout(Duration::from_secs(5)).await, None);
        assert!(!signal.has_fired());
    }
}
