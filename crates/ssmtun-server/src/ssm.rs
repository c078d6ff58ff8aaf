//! Session launcher backed by the AWS CLI
//!
//! Each session is one `aws ssm start-session` process using the
//! `AWS-StartPortForwardingSessionToRemoteHost` document. The process lives as
//! long as the tunnel does; it is killed if the launch task is dropped.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use ssmtun_common::LaunchError;

use crate::credentials::AwsCredentials;
use crate::launcher::{SessionLauncher, SessionParams};

/// SSM document that forwards a local port to a host reachable from the target
pub const PORT_FORWARDING_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// Stderr lines kept for the error report
const STDERR_TAIL_LINES: usize = 20;

pub struct SsmSessionLauncher {
    cli_path: String,
    credentials: AwsCredentials,
}

impl SsmSessionLauncher {
    pub fn new(cli_path: impl Into<String>, credentials: AwsCredentials) -> Self {
        Self {
            cli_path: cli_path.into(),
            credentials,
        }
    }

    pub fn cli_path(&self) -> &str {
        &self.cli_path
    }
}

/// Command-line arguments for one port-forwarding session
pub fn session_args(params: &SessionParams) -> Vec<String> {
    let parameters = serde_json::json!({
        "host": [params.remote_host],
        "portNumber": [params.remote_port.to_string()],
        "localPortNumber": [params.local_port.to_string()],
    });

    vec![
        "ssm".to_string(),
        "start-session".to_string(),
        "--target".to_string(),
        params.target.clone(),
        "--region".to_string(),
        params.region.clone(),
        "--document-name".to_string(),
        PORT_FORWARDING_DOCUMENT.to_string(),
        "--parameters".to_string(),
        parameters.to_string(),
    ]
}

#[async_trait]
impl SessionLauncher for SsmSessionLauncher {
    async fn start_session(&self, params: &SessionParams) -> Result<(), LaunchError> {
        let mut cmd = Command::new(&self.cli_path);
        cmd.args(session_args(params))
            .envs(self.credentials.child_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                LaunchError::Spawn(format!(
                    "'{}' not found; install the AWS CLI and the session-manager-plugin",
                    self.cli_path
                ))
            } else {
                LaunchError::Spawn(format!("{}: {}", self.cli_path, e))
            }
        })?;

        tracing::debug!(
            "Session process {:?} started for {} -> {}:{}",
            child.id(),
            params.local_port,
            params.remote_host,
            params.remote_port
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Spawn("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LaunchError::Spawn("stderr was not captured".to_string()))?;

        let local_port = params.local_port;
        let (_, stderr_tail, status) = tokio::join!(
            log_lines(stdout, local_port),
            tail_lines(stderr, STDERR_TAIL_LINES),
            child.wait(),
        );

        let status = status.map_err(|e| LaunchError::Spawn(format!("wait failed: {}", e)))?;
        if status.success() {
            tracing::info!("Session on local port {} ended", local_port);
            Ok(())
        } else {
            Err(LaunchError::Exited {
                code: status.code(),
                stderr: stderr_tail,
            })
        }
    }
}

async fn log_lines(reader: impl AsyncRead + Unpin, local_port: u16) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("[session {}] {}", local_port, line);
    }
}

/// Drain `reader`, keeping its last `max` non-empty lines
async fn tail_lines(reader: impl AsyncRead + Unpin, max: usize) -> String {
    let mut tail = VecDeque::with_capacity(max);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == max {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}
