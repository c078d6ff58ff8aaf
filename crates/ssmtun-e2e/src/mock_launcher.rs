//! Mock session launcher for E2E tests
//!
//! Stands in for the AWS CLI. Behaviour is chosen per remote host so one test
//! server can run tunnels that succeed, fail or hang side by side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use ssmtun_common::LaunchError;
use ssmtun_server::{SessionLauncher, SessionParams};

/// What a mocked session does once started
#[derive(Debug, Clone)]
pub enum LaunchBehavior {
    /// Bind the local port and echo every connection until dropped
    Forward,
    /// Stay running without binding anything
    Hang,
    /// End cleanly after the delay
    SucceedAfter(Duration),
    /// Fail with the given stderr after the delay
    FailAfter(Duration, String),
}

/// Mock launcher that records every session it is asked to start
pub struct MockSessionLauncher {
    /// Behaviour per remote host
    behaviors: DashMap<String, LaunchBehavior>,
    /// Behaviour for hosts without an entry
    default_behavior: Mutex<LaunchBehavior>,
    /// Launch count per remote host
    calls: DashMap<String, u64>,
    total_calls: AtomicU64,
    /// Every session request, in call order
    sessions: Mutex<Vec<SessionParams>>,
}

impl MockSessionLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the behaviour for sessions to `remote_host`
    pub fn set_behavior(&self, remote_host: &str, behavior: LaunchBehavior) {
        self.behaviors.insert(remote_host.to_string(), behavior);
    }

    pub fn set_default_behavior(&self, behavior: LaunchBehavior) {
        *self.default_behavior.lock() = behavior;
    }

    /// Number of sessions started for `remote_host`
    pub fn calls_for(&self, remote_host: &str) -> u64 {
        self.calls.get(remote_host).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<SessionParams> {
        self.sessions.lock().clone()
    }

    fn behavior_for(&self, remote_host: &str) -> LaunchBehavior {
        match self.behaviors.get(remote_host) {
            Some(behavior) => behavior.clone(),
            None => self.default_behavior.lock().clone(),
        }
    }
}

impl Default for MockSessionLauncher {
    fn default() -> Self {
        Self {
            behaviors: DashMap::new(),
            default_behavior: Mutex::new(LaunchBehavior::Forward),
            calls: DashMap::new(),
            total_calls: AtomicU64::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SessionLauncher for MockSessionLauncher {
    async fn start_session(&self, params: &SessionParams) -> Result<(), LaunchError> {
        *self.calls.entry(params.remote_host.clone()).or_insert(0) += 1;
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().push(params.clone());

        let behavior = self.behavior_for(&params.remote_host);
        tracing::debug!(
            "MockSessionLauncher: {:?} for {}:{} on local port {}",
            behavior,
            params.remote_host,
            params.remote_port,
            params.local_port
        );

        match behavior {
            LaunchBehavior::Forward => forward(params.local_port).await,
            LaunchBehavior::Hang => std::future::pending().await,
            LaunchBehavior::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            LaunchBehavior::FailAfter(delay, stderr) => {
                tokio::time::sleep(delay).await;
                Err(LaunchError::Exited {
                    code: Some(255),
                    stderr,
                })
            }
        }
    }
}

/// Listen on the local port and echo, like a forwarder to an echo server
async fn forward(local_port: u16) -> Result<(), LaunchError> {
    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(|e| LaunchError::Spawn(format!("bind 127.0.0.1:{}: {}", local_port, e)))?;

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!("MockSessionLauncher: accept failed: {}", e);
                continue;
            }
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(remote_host: &str) -> SessionParams {
        SessionParams {
            target: "i-test".to_string(),
            region: "us-east-1".to_string(),
            remote_host: remote_host.to_string(),
            remote_port: 5432,
            local_port: 0,
        }
    }

    #[tokio::test]
    async fn test_counts_per_host() {
        let launcher = MockSessionLauncher::new();
        launcher.set_default_behavior(LaunchBehavior::SucceedAfter(Duration::ZERO));

        launcher.start_session(&params("a")).await.unwrap();
        launcher.start_session(&params("a")).await.unwrap();
        launcher.start_session(&params("b")).await.unwrap();

        assert_eq!(launcher.calls_for("a"), 2);
        assert_eq!(launcher.calls_for("b"), 1);
        assert_eq!(launcher.calls_for("c"), 0);
        assert_eq!(launcher.total_calls(), 3);
        assert_eq!(launcher.sessions().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_simulation() {
        let launcher = MockSessionLauncher::new();
        launcher.set_behavior(
            "bad",
            LaunchBehavior::FailAfter(Duration::ZERO, "TargetNotConnected".to_string()),
        );

        let result = launcher.start_session(&params("bad")).await;
        assert!(matches!(
            result,
            Err(LaunchError::Exited { stderr, .. }) if stderr == "TargetNotConnected"
        ));
    }
}
