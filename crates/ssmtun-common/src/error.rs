use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors returned to a caller of `start_tunnel`
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Caller input was malformed; nothing was registered
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// No local port could be allocated
    #[error("Port allocation failed: {0}")]
    PortAllocation(#[from] PortError),

    /// The session launcher reported a failure for this attempt
    #[error("Tunnel '{id}' failed to start: {source}")]
    Launch {
        id: String,
        #[source]
        source: LaunchError,
    },

    /// The caller stopped waiting before the tunnel was decided
    #[error("Wait for tunnel '{id}' was cancelled")]
    Cancelled { id: String },

    /// The configured wait timeout elapsed before the tunnel was decided
    #[error("Tunnel '{id}' was not ready after {waited:?}")]
    TimedOut { id: String, waited: Duration },
}

impl TunnelError {
    /// Create a validation error
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Coarse category, used on the wire and in logs
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Validation { .. } => ErrorKind::Validation,
            TunnelError::PortAllocation(_) => ErrorKind::PortAllocation,
            TunnelError::Launch { .. } => ErrorKind::Launch,
            TunnelError::Cancelled { .. } => ErrorKind::Cancelled,
            TunnelError::TimedOut { .. } => ErrorKind::TimedOut,
        }
    }
}

/// Category of a [`TunnelError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    PortAllocation,
    Launch,
    Cancelled,
    TimedOut,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::PortAllocation => "port_allocation",
            ErrorKind::Launch => "launch",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the port allocator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("Invalid port range {low}-{high}")]
    InvalidRange { low: u16, high: u16 },

    #[error("No open port found in the range {low}-{high}")]
    Exhausted { low: u16, high: u16 },
}

/// Failure reported by a session launcher.
///
/// Cloneable so that one failed attempt can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// The forwarding process could not be started at all
    #[error("Failed to spawn session process: {0}")]
    Spawn(String),

    /// The forwarding process exited unsuccessfully
    #[error("Session process exited with {}: {stderr}", exit_code_display(.code))]
    Exited { code: Option<i32>, stderr: String },

    /// The launcher refused the session parameters
    #[error("Session rejected: {0}")]
    Rejected(String),

    /// The launch task went away without reporting an outcome
    #[error("Launch abandoned before an outcome was reported")]
    Abandoned,
}

fn exit_code_display(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_wraps_reason() {
        let err = TunnelError::Launch {
            id: "b".to_string(),
            source: LaunchError::Exited {
                code: Some(255),
                stderr: "TargetNotConnected".to_string(),
            },
        };
        let message = err.to_string();
        assert!(message.contains("'b'"));
        assert!(message.contains("status 255"));
        assert!(message.contains("TargetNotConnected"));
        assert_eq!(err.kind(), ErrorKind::Launch);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            TunnelError::validation("id", "must not be empty").kind().as_str(),
            "validation"
        );
        let port_err: TunnelError = PortError::Exhausted { low: 1, high: 2 }.into();
        assert_eq!(port_err.kind().as_str(), "port_allocation");
        assert_eq!(ErrorKind::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_signal_exit_display() {
        let err = LaunchError::Exited {
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }
}
