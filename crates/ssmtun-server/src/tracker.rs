//! Tunnel tracker: validates requests, deduplicates launches by id and waits
//! for the shared outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ssmtun_common::{LaunchError, PortAllocator, TunnelError, LOCAL_HOST};

use crate::launcher::{SessionLauncher, SessionParams};
use crate::registry::{TunnelRecord, TunnelRegistry, WaitOutcome};
use crate::signal::TunnelOutcome;

/// How long a launch may run without failing before it is reported ready
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Tracker settings
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub grace_period: Duration,
    /// Upper bound on a single caller's wait; `None` waits for the outcome
    pub wait_timeout: Option<Duration>,
    /// Host reported back to callers of a ready tunnel
    pub local_host: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            wait_timeout: None,
            local_host: LOCAL_HOST.to_string(),
        }
    }
}

/// A request to start (or rejoin) a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTunnelRequest {
    pub id: String,
    pub target: String,
    pub remote_host: String,
    pub remote_port: u16,
    /// 0 lets the tracker pick a free port
    pub local_port: u16,
    pub region: String,
}

impl StartTunnelRequest {
    fn validate(&self) -> Result<(), TunnelError> {
        let required = [
            ("id", &self.id),
            ("target", &self.target),
            ("remote_host", &self.remote_host),
            ("region", &self.region),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(TunnelError::validation(field, "must not be empty"));
            }
        }

        if self.remote_port == 0 {
            return Err(TunnelError::validation(
                "remote_port",
                "must be between 1 and 65535",
            ));
        }

        Ok(())
    }

    fn session_params(&self, local_port: u16) -> SessionParams {
        SessionParams {
            target: self.target.clone(),
            region: self.region.clone(),
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            local_port,
        }
    }
}

/// Where a ready tunnel can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub local_host: String,
    pub local_port: u16,
}

/// Starts tunnels at most once per id and fans the outcome out to every caller
pub struct TunnelTracker {
    registry: Arc<TunnelRegistry>,
    launcher: Arc<dyn SessionLauncher>,
    allocator: Arc<dyn PortAllocator>,
    config: TrackerConfig,
}

impl TunnelTracker {
    pub fn new(
        launcher: Arc<dyn SessionLauncher>,
        allocator: Arc<dyn PortAllocator>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            registry: TunnelRegistry::new(),
            launcher,
            allocator,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start the tunnel `request.id`, or join the attempt already registered
    /// under it, and wait until that attempt is decided.
    ///
    /// Cancelling `cancel` or hitting the configured wait timeout only ends
    /// this caller's wait. The launch keeps running for everyone else.
    pub async fn start_tunnel(
        &self,
        request: StartTunnelRequest,
        cancel: &CancellationToken,
    ) -> Result<TunnelInfo, TunnelError> {
        request.validate()?;

        let requested_port = request.local_port;
        let (record, created) = self.registry.acquire_or_join(&request.id, |reserved| {
            if requested_port == 0 {
                return self.allocator.allocate(reserved);
            }
            if reserved.contains(&requested_port) {
                tracing::warn!(
                    "Local port {} requested for tunnel {} is already held by another tunnel",
                    requested_port,
                    request.id
                );
            }
            Ok(requested_port)
        })?;

        if created {
            tracing::info!(
                "Starting tunnel {} (attempt {}): {}:{} via {} in {} on local port {}",
                request.id,
                record.attempt(),
                request.remote_host,
                request.remote_port,
                request.target,
                request.region,
                record.local_port()
            );
            self.spawn_launch(record.clone(), request.session_params(record.local_port()));
        } else {
            if requested_port != 0 && requested_port != record.local_port() {
                tracing::warn!(
                    "Tunnel {} already uses local port {}, ignoring requested port {}",
                    request.id,
                    record.local_port(),
                    requested_port
                );
            }
            tracing::debug!(
                "Joining tunnel {} (attempt {})",
                request.id,
                record.attempt()
            );
        }

        let outcome = tokio::select! {
            biased;
            outcome = self.registry.wait_ready(&record, self.config.wait_timeout) => outcome,
            _ = cancel.cancelled() => {
                tracing::debug!("Wait for tunnel {} cancelled", request.id);
                return Err(TunnelError::Cancelled { id: request.id });
            }
        };

        match outcome {
            WaitOutcome::Ready => Ok(TunnelInfo {
                local_host: self.config.local_host.clone(),
                local_port: record.local_port(),
            }),
            WaitOutcome::Failed(source) => Err(TunnelError::Launch {
                id: request.id,
                source,
            }),
            WaitOutcome::TimedOut => Err(TunnelError::TimedOut {
                id: request.id,
                waited: self.config.wait_timeout.unwrap_or_default(),
            }),
        }
    }

    /// Run the launcher in the background and resolve `record` from whichever
    /// comes first: the launcher finishing or the grace period elapsing.
    fn spawn_launch(&self, record: Arc<TunnelRecord>, params: SessionParams) {
        let registry = self.registry.clone();
        let launcher = self.launcher.clone();
        let grace_period = self.config.grace_period;

        tokio::spawn(async move {
            let session = tokio::spawn(async move { launcher.start_session(&params).await });
            tokio::pin!(session);

            tokio::select! {
                biased;
                result = &mut session => {
                    registry.resolve(&record, session_outcome(result));
                    return;
                }
                _ = tokio::time::sleep(grace_period) => {
                    tracing::debug!(
                        "Tunnel {} still running after {:?}, reporting ready",
                        record.id(),
                        grace_period
                    );
                    registry.resolve(&record, TunnelOutcome::Ready);
                }
            }

            // The session outlived the grace period. Whatever it reports now
            // is too late to change the recorded outcome.
            let result = session.await;
            registry.resolve(&record, session_outcome(result));
        });
    }
}

fn session_outcome(
    result: Result<Result<(), LaunchError>, tokio::task::JoinError>,
) -> TunnelOutcome {
    match result {
        Ok(result) => result.into(),
        Err(e) => {
            tracing::error!("Session task ended abnormally: {}", e);
            TunnelOutcome::Failed(LaunchError::Abandoned)
        }
    }
}
