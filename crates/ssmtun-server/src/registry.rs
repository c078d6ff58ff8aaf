//! Registry of tunnel launch attempts
//!
//! One mutex guards the id -> record map and every record's terminal
//! transition. Waiting on a record's signal never holds that lock, so the
//! launch task can always get in to resolve the record.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ssmtun_common::LaunchError;
use ssmtun_protocol::{TunnelState, TunnelSummary};

use crate::signal::{ReadySignal, TunnelOutcome};

/// One launch attempt for a tunnel id
#[derive(Debug)]
pub struct TunnelRecord {
    id: String,
    attempt: u64,
    local_port: u16,
    created_at: Instant,
    signal: ReadySignal,
}

impl TunnelRecord {
    fn new(id: String, attempt: u64, local_port: u16) -> Self {
        Self {
            id,
            attempt,
            local_port,
            created_at: Instant::now(),
            signal: ReadySignal::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn state(&self) -> TunnelState {
        match self.signal.outcome() {
            None => TunnelState::Starting,
            Some(TunnelOutcome::Ready) => TunnelState::Ready,
            Some(TunnelOutcome::Failed(_)) => TunnelState::Failed,
        }
    }
}

/// Result of [`TunnelRegistry::resolve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This call decided the attempt's outcome
    Applied,
    /// The attempt was already decided; the call had no effect
    Discarded,
}

/// Result of [`TunnelRegistry::wait_ready`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Failed(LaunchError),
    TimedOut,
}

struct Inner {
    tunnels: HashMap<String, Arc<TunnelRecord>>,
    next_attempt: u64,
}

/// In-memory registry of tunnels, keyed by caller-chosen id
pub struct TunnelRegistry {
    inner: Mutex<Inner>,
    discarded: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Return the record registered under `id`, or register a new `Starting`
    /// one on the port chosen by `pick_port`.
    ///
    /// `pick_port` runs under the registry lock and only when a record is
    /// created. It receives the ports held by every live record, so two ids
    /// are never handed the same port. An error from it registers nothing.
    ///
    /// The boolean is true only for the caller that created the record; that
    /// caller owns the launch. Existing records are returned whatever their
    /// state.
    pub fn acquire_or_join<E>(
        &self,
        id: &str,
        pick_port: impl FnOnce(&HashSet<u16>) -> Result<u16, E>,
    ) -> Result<(Arc<TunnelRecord>, bool), E> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.tunnels.get(id) {
            return Ok((existing.clone(), false));
        }

        let reserved: HashSet<u16> = inner
            .tunnels
            .values()
            .map(|record| record.local_port)
            .collect();
        let local_port = pick_port(&reserved)?;

        inner.next_attempt += 1;
        let record = Arc::new(TunnelRecord::new(
            id.to_string(),
            inner.next_attempt,
            local_port,
        ));
        inner.tunnels.insert(id.to_string(), record.clone());
        Ok((record, true))
    }

    /// Decide the outcome of an attempt.
    ///
    /// The first call per attempt wins. A failed attempt is dropped from the
    /// map in the same critical section so the next request for the id starts
    /// fresh. Later calls are discarded, logged and counted.
    pub fn resolve(&self, record: &Arc<TunnelRecord>, outcome: TunnelOutcome) -> Resolution {
        let mut inner = self.inner.lock();

        if !record.signal.fire(outcome.clone()) {
            let kept = record.state();
            drop(inner);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            match outcome {
                TunnelOutcome::Failed(e) => tracing::warn!(
                    "Discarding late failure for tunnel {} (attempt {}, already {}): {}",
                    record.id,
                    record.attempt,
                    kept,
                    e
                ),
                TunnelOutcome::Ready => tracing::debug!(
                    "Discarding late success for tunnel {} (attempt {}, already {})",
                    record.id,
                    record.attempt,
                    kept
                ),
            }
            return Resolution::Discarded;
        }

        if let TunnelOutcome::Failed(e) = &outcome {
            let is_current = inner
                .tunnels
                .get(&record.id)
                .is_some_and(|current| Arc::ptr_eq(current, record));
            if is_current {
                inner.tunnels.remove(&record.id);
            }
            drop(inner);
            tracing::warn!(
                "Tunnel {} (attempt {}) failed: {}",
                record.id,
                record.attempt,
                e
            );
        } else {
            drop(inner);
            tracing::info!(
                "Tunnel {} (attempt {}) ready on port {}",
                record.id,
                record.attempt,
                record.local_port
            );
        }

        Resolution::Applied
    }

    /// Wait until the attempt is decided, or until `deadline` elapses
    pub async fn wait_ready(
        &self,
        record: &TunnelRecord,
        deadline: Option<Duration>,
    ) -> WaitOutcome {
        let outcome = match deadline {
            Some(deadline) => record.signal.wait_timeout(deadline).await,
            None => Some(record.signal.wait().await),
        };

        match outcome {
            Some(TunnelOutcome::Ready) => WaitOutcome::Ready,
            Some(TunnelOutcome::Failed(e)) => WaitOutcome::Failed(e),
            None => WaitOutcome::TimedOut,
        }
    }

    /// Current state of the tunnel registered under `id`
    pub fn state(&self, id: &str) -> Option<TunnelState> {
        let inner = self.inner.lock();
        inner.tunnels.get(id).map(|record| record.state())
    }

    /// All registered tunnels, ordered by id
    pub fn snapshot(&self) -> Vec<TunnelSummary> {
        let inner = self.inner.lock();
        let mut tunnels: Vec<TunnelSummary> = inner
            .tunnels
            .values()
            .map(|record| TunnelSummary {
                id: record.id.clone(),
                attempt: record.attempt,
                state: record.state(),
                local_port: record.local_port,
                age_secs: record.created_at.elapsed().as_secs(),
            })
            .collect();
        drop(inner);

        tunnels.sort_by(|a, b| a.id.cmp(&b.id));
        tunnels
    }

    /// Number of resolutions that lost the race to an earlier one
    pub fn discarded_resolutions(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tunnels.is_empty()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tunnels: HashMap::new(),
                next_attempt: 0,
            }),
            discarded: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssmtun_common::PortError;

    fn acquire(registry: &TunnelRegistry, id: &str, port: u16) -> (Arc<TunnelRecord>, bool) {
        registry
            .acquire_or_join(id, |_| Ok::<_, PortError>(port))
            .unwrap()
    }

    fn failure(reason: &str) -> TunnelOutcome {
        TunnelOutcome::Failed(LaunchError::Rejected(reason.to_string()))
    }

    #[test]
    fn test_first_caller_creates() {
        let registry = TunnelRegistry::new();

        let (first, created) = acquire(&registry, "a", 18342);
        assert!(created);
        assert_eq!(first.local_port(), 18342);
        assert_eq!(registry.state("a"), Some(TunnelState::Starting));

        let (second, created) = acquire(&registry, "a", 19000);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.local_port(), 18342);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_acquire_creates_once() {
        let registry = TunnelRegistry::new();
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || acquire(&registry, "shared", 20000 + i).1)
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|created| *created)
            .count();
        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ready_is_kept() {
        let registry = TunnelRegistry::new();
        let (record, _) = acquire(&registry, "a", 18342);

        assert_eq!(registry.resolve(&record, TunnelOutcome::Ready), Resolution::Applied);
        assert_eq!(registry.state("a"), Some(TunnelState::Ready));

        let (joined, created) = acquire(&registry, "a", 0);
        assert!(!created);
        assert_eq!(joined.local_port(), 18342);
    }

    #[test]
    fn test_failure_frees_the_id() {
        let registry = TunnelRegistry::new();
        let (record, _) = acquire(&registry, "b", 18000);

        assert_eq!(registry.resolve(&record, failure("boom")), Resolution::Applied);
        assert_eq!(registry.state("b"), None);
        assert!(registry.is_empty());

        let (retry, created) = acquire(&registry, "b", 18001);
        assert!(created);
        assert!(!Arc::ptr_eq(&record, &retry));
        assert!(retry.attempt() > record.attempt());
        assert_eq!(retry.state(), TunnelState::Starting);
    }

    #[test]
    fn test_second_resolution_is_discarded() {
        let registry = TunnelRegistry::new();
        let (record, _) = acquire(&registry, "a", 18342);

        registry.resolve(&record, TunnelOutcome::Ready);
        assert_eq!(registry.resolve(&record, failure("late")), Resolution::Discarded);

        assert_eq!(registry.state("a"), Some(TunnelState::Ready));
        assert_eq!(registry.discarded_resolutions(), 1);
    }

    #[test]
    fn test_stale_failure_does_not_remove_retry() {
        let registry = TunnelRegistry::new();
        let (old, _) = acquire(&registry, "b", 18000);
        registry.resolve(&old, failure("first"));

        let (retry, _) = acquire(&registry, "b", 18001);
        assert_eq!(registry.resolve(&old, failure("again")), Resolution::Discarded);
        assert_eq!(registry.state("b"), Some(TunnelState::Starting));
        assert_eq!(registry.resolve(&retry, TunnelOutcome::Ready), Resolution::Applied);
    }

    #[tokio::test]
    async fn test_wait_ready_after_resolution() {
        let registry = TunnelRegistry::new();
        let (record, _) = acquire(&registry, "b", 18000);
        registry.resolve(&record, failure("denied"));

        // The record is gone from the map but holders still see the outcome
        assert_eq!(
            registry.wait_ready(&record, None).await,
            WaitOutcome::Failed(LaunchError::Rejected("denied".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_deadline() {
        let registry = TunnelRegistry::new();
        let (record, _) = acquire(&registry, "slow", 18000);

        assert_eq!(
            registry
                .wait_ready(&record, Some(Duration::from_secs(1)))
                .await,
            WaitOutcome::TimedOut
        );
        assert_eq!(registry.state("slow"), Some(TunnelState::Starting));
    }

    #[tokio::test]
    async fn test_waiters_released_by_resolve() {
        let registry = TunnelRegistry::new();
        let (record, _) = acquire(&registry, "a", 18342);

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let (record, created) = acquire(&registry, "a", 0);
            assert!(!created);
            waiters.push(tokio::spawn(async move {
                registry.wait_ready(&record, None).await
            }));
        }

        registry.resolve(&record, TunnelOutcome::Ready);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), WaitOutcome::Ready);
        }
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = TunnelRegistry::new();
        let (b, _) = acquire(&registry, "b", 2);
        acquire(&registry, "a", 1);
        registry.resolve(&b, TunnelOutcome::Ready);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "a");
        assert_eq!(snapshot[0].state, TunnelState::Starting);
        assert_eq!(snapshot[1].id, "b");
        assert_eq!(snapshot[1].state, TunnelState::Ready);
        assert_eq!(snapshot[1].local_port, 2);
    }

    #[test]
    fn test_port_picked_only_on_create() {
        let registry = TunnelRegistry::new();
        acquire(&registry, "a", 18342);

        let mut picked = false;
        let (joined, created) = registry
            .acquire_or_join("a", |_| {
                picked = true;
                Err(PortError::Exhausted {
                    low: 18342,
                    high: 18342,
                })
            })
            .unwrap();
        assert!(!created);
        assert!(!picked);
        assert_eq!(joined.local_port(), 18342);
    }

    #[test]
    fn test_live_ports_are_reserved() {
        let registry = TunnelRegistry::new();
        acquire(&registry, "a", 18000);
        let (b, _) = acquire(&registry, "b", 18001);
        registry.resolve(&b, TunnelOutcome::Ready);
        let (c, _) = acquire(&registry, "c", 18002);
        registry.resolve(&c, failure("gone"));

        let mut seen = HashSet::new();
        registry
            .acquire_or_join("d", |reserved| {
                seen = reserved.clone();
                Ok::<_, PortError>(18003)
            })
            .unwrap();
        // The failed attempt released its port
        assert_eq!(seen, HashSet::from([18000, 18001]));
    }

    #[test]
    fn test_pick_error_registers_nothing() {
        let registry = TunnelRegistry::new();
        let result = registry.acquire_or_join("a", |_| {
            Err(PortError::Exhausted {
                low: 18000,
                high: 18000,
            })
        });
        assert!(result.is_err());
        assert!(registry.is_empty());
    }
}
