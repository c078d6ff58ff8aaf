//! ssmtun daemon library
//!
//! Coordinates SSM port-forwarding tunnels for concurrent callers: each tunnel
//! id is launched at most once and every caller sees the same outcome. The
//! library is used by the `ssmtun-server` binary and by the e2e harness.

mod config;
mod control_plane;
mod credentials;
mod launcher;
mod registry;
mod signal;
mod ssm;
mod tracker;

pub use config::{AwsConfig, ResolvedServerConfig, ServerConfig, DEFAULT_CONTROL_PORT};
pub use control_plane::{ControlPlane, RequestDefaults};
pub use credentials::{AwsCredentials, SecretError, SecretRef};
pub use launcher::{SessionLauncher, SessionParams};
pub use registry::{Resolution, TunnelRecord, TunnelRegistry, WaitOutcome};
pub use signal::{ReadySignal, TunnelOutcome};
pub use ssm::{session_args, SsmSessionLauncher, PORT_FORWARDING_DOCUMENT};
pub use tracker::{
    StartTunnelRequest, TrackerConfig, TunnelInfo, TunnelTracker, DEFAULT_GRACE_PERIOD,
};
