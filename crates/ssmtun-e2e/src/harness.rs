//! Test server harness for E2E tests
//!
//! Starts the control plane in-process on an ephemeral port, backed by a
//! [`MockSessionLauncher`] and a short grace period.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use ssmtun_common::RangePortAllocator;
use ssmtun_server::{ControlPlane, RequestDefaults, TrackerConfig, TunnelRegistry, TunnelTracker};

use crate::mock_launcher::MockSessionLauncher;

/// Global counter for allocating unique port ranges to each test server
static PORT_RANGE_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Number of local ports per test server
const PORTS_PER_SERVER: u16 = 20;

/// Base port for local tunnel ports
const BASE_LOCAL_PORT: u16 = 52000;

/// Knobs for [`TestServer::start_with`]
#[derive(Debug, Clone)]
pub struct TestServerOptions {
    pub grace_period: Duration,
    pub wait_timeout: Option<Duration>,
    pub defaults: RequestDefaults,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(200),
            wait_timeout: None,
            defaults: RequestDefaults {
                target: Some("i-0123456789abcdef0".to_string()),
                region: Some("us-east-1".to_string()),
            },
        }
    }
}

/// A running test daemon
pub struct TestServer {
    /// Control plane address
    pub control_addr: SocketAddr,
    /// Mock launcher for behaviour setup and assertions
    pub launcher: Arc<MockSessionLauncher>,
    /// Local port range handed to the allocator
    pub port_range: (u16, u16),
    pub grace_period: Duration,
    tracker: Arc<TunnelTracker>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a test server with default options
    pub async fn start() -> Self {
        Self::start_with(TestServerOptions::default()).await
    }

    pub async fn start_with(options: TestServerOptions) -> Self {
        let launcher = MockSessionLauncher::new();

        // Allocate a unique port range for this test server
        let range_index = PORT_RANGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let start_port = BASE_LOCAL_PORT + (range_index * PORTS_PER_SERVER);
        let end_port = start_port + PORTS_PER_SERVER - 1;
        let allocator = Arc::new(RangePortAllocator::new(start_port, end_port));

        let tracker = Arc::new(TunnelTracker::new(
            launcher.clone(),
            allocator,
            TrackerConfig {
                grace_period: options.grace_period,
                wait_timeout: options.wait_timeout,
                ..TrackerConfig::default()
            },
        ));
        let control_plane = ControlPlane::new(tracker.clone(), options.defaults);

        let control_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind control plane");
        let control_addr = control_listener
            .local_addr()
            .expect("Control plane has no local address");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                result = control_plane.run_with_listener(control_listener) => {
                    if let Err(e) = result {
                        tracing::error!("Control plane error: {}", e);
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("Control plane shutting down");
                }
            }
        });

        Self {
            control_addr,
            launcher,
            port_range: (start_port, end_port),
            grace_period: options.grace_period,
            tracker,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Registry behind the control plane, for direct assertions
    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        self.tracker.registry()
    }

    /// Shutdown the test server
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
