use serde::{Deserialize, Serialize};

/// Lifecycle state of one tunnel attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// Launch in progress, outcome not decided yet
    Starting,
    /// Launch succeeded, or the grace period passed without a failure
    Ready,
    /// Launch failed; the id is free for a new attempt
    Failed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TunnelState::Starting => "starting",
            TunnelState::Ready => "ready",
            TunnelState::Failed => "failed",
        })
    }
}

/// One row of a tunnel listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelSummary {
    pub id: String,
    /// Attempt number, increases every time an id is (re)started
    pub attempt: u64,
    pub state: TunnelState,
    pub local_port: u16,
    /// Seconds since the attempt was registered
    pub age_secs: u64,
}

/// Messages sent from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a tunnel, or join the one already registered under `id`
    StartTunnel {
        /// Caller-chosen correlation key
        id: String,
        /// Instance to tunnel through (None = daemon default)
        #[serde(default)]
        target: Option<String>,
        /// Region of the target (None = daemon default)
        #[serde(default)]
        region: Option<String>,
        /// Host reachable from the target
        remote_host: String,
        /// Port on the remote host
        remote_port: u16,
        /// Local port to forward from (0 = allocate one)
        #[serde(default)]
        local_port: u16,
    },

    /// Request the current tunnel registry
    ListTunnels,

    /// Keepalive ping
    Ping {
        /// Timestamp for RTT measurement
        timestamp: u64,
    },
}

/// Messages sent from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Tunnel is up and accepting connections locally
    TunnelReady {
        id: String,
        local_host: String,
        local_port: u16,
    },

    /// Tunnel could not be started
    TunnelFailed {
        id: String,
        /// Error category (validation, port_allocation, launch, cancelled, timed_out)
        kind: String,
        /// Human-readable reason
        reason: String,
    },

    /// Snapshot of the registry
    Tunnels {
        tunnels: Vec<TunnelSummary>,
        /// Resolutions that lost the race against an earlier one
        discarded_resolutions: u64,
    },

    /// Keepalive response
    Pong {
        /// Echoed timestamp from Ping
        timestamp: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_tunnel_optional_fields_default() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"start_tunnel","id":"a","remote_host":"10.0.0.5","remote_port":443}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::StartTunnel {
                id,
                target,
                region,
                local_port,
                ..
            } => {
                assert_eq!(id, "a");
                assert!(target.is_none());
                assert!(region.is_none());
                assert_eq!(local_port, 0);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&TunnelState::Starting).unwrap();
        assert_eq!(json, r#""starting""#);
        assert_eq!(TunnelState::Ready.to_string(), "ready");
    }
}
