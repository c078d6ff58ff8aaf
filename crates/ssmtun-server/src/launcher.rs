//! Session launcher abstraction
//!
//! A launcher performs the long-running work behind one tunnel: negotiating the
//! remote session and running the local forwarding process bound to
//! `local_port`. The production implementation drives the AWS CLI (see
//! [`crate::SsmSessionLauncher`]); tests plug in a mock.

use async_trait::async_trait;

use ssmtun_common::LaunchError;

/// Everything a launcher needs to open one port-forwarding session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Instance (or other SSM target) the session runs through
    pub target: String,
    pub region: String,
    /// Host reachable from the target
    pub remote_host: String,
    pub remote_port: u16,
    /// Local port the forwarding process binds
    pub local_port: u16,
}

/// Trait for starting port-forwarding sessions
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// Run one session.
    ///
    /// The future resolves when the session is over: `Ok(())` when it ended
    /// cleanly, `Err` when it could not be established or died. It is not
    /// required to report when the session becomes usable; callers treat a
    /// session that is still running after a grace period as ready.
    async fn start_session(&self, params: &SessionParams) -> Result<(), LaunchError>;
}
