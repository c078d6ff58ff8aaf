//! End-to-end test utilities for ssmtun
//!
//! Runs the daemon's control plane in-process with a mock session launcher,
//! so tests need neither the AWS CLI nor AWS credentials.

pub mod harness;
pub mod mock_launcher;
pub mod test_client;

pub use harness::{TestServer, TestServerOptions};
pub use mock_launcher::{LaunchBehavior, MockSessionLauncher};
pub use test_client::{start_tunnel, TestClient};
