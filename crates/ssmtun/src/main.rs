use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ssmtun_protocol::{ClientMessage, ServerMessage};

mod connection;

use connection::DaemonConnection;

/// ssmtun - request shared AWS SSM tunnels from the local daemon
#[derive(Parser, Debug)]
#[command(name = "ssmtun")]
#[command(about = "Start and inspect shared AWS SSM port-forwarding tunnels")]
struct Cli {
    /// Daemon control address (host:port)
    #[arg(short, long, env = "SSMTUN_SERVER", default_value = "127.0.0.1:4750")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a tunnel, or join the one already running under the same id
    Start {
        /// Host to reach from the SSM target
        #[arg(long)]
        remote_host: String,

        /// Port on the remote host
        #[arg(long)]
        remote_port: u16,

        /// Tunnel id shared by every caller of the same tunnel (random if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Local port to bind (picked by the daemon if omitted)
        #[arg(long, default_value_t = 0)]
        local_port: u16,

        /// SSM target, e.g. an instance id (daemon default if omitted)
        #[arg(long)]
        target: Option<String>,

        /// AWS region (daemon default if omitted)
        #[arg(long)]
        region: Option<String>,
    },

    /// List tunnels known to the daemon
    List,

    /// Check that the daemon is reachable
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ssmtun=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut conn = DaemonConnection::connect(&cli.server).await?;

    match cli.command {
        Commands::Start {
            remote_host,
            remote_port,
            id,
            local_port,
            target,
            region,
        } => {
            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            tracing::info!("Requesting tunnel {} to {}:{}", id, remote_host, remote_port);

            let reply = conn
                .request(ClientMessage::StartTunnel {
                    id,
                    target,
                    region,
                    remote_host,
                    remote_port,
                    local_port,
                })
                .await?;

            match reply {
                ServerMessage::TunnelReady {
                    local_host,
                    local_port,
                    ..
                } => println!("{}:{}", local_host, local_port),
                ServerMessage::TunnelFailed { id, kind, reason } => {
                    anyhow::bail!("Tunnel {} failed ({}): {}", id, kind, reason)
                }
                other => anyhow::bail!("Unexpected reply from daemon: {:?}", other),
            }
        }
        Commands::List => match conn.request(ClientMessage::ListTunnels).await? {
            ServerMessage::Tunnels {
                tunnels,
                discarded_resolutions,
            } => {
                if tunnels.is_empty() {
                    println!("No tunnels");
                } else {
                    println!(
                        "{:<38} {:>7} {:<8} {:>6} {:>8}",
                        "ID", "ATTEMPT", "STATE", "PORT", "AGE"
                    );
                    for t in tunnels {
                        println!(
                            "{:<38} {:>7} {:<8} {:>6} {:>7}s",
                            t.id,
                            t.attempt,
                            t.state.to_string(),
                            t.local_port,
                            t.age_secs
                        );
                    }
                }
                if discarded_resolutions > 0 {
                    println!("{} late launch results discarded", discarded_resolutions);
                }
            }
            other => anyhow::bail!("Unexpected reply from daemon: {:?}", other),
        },
        Commands::Ping => {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            let started = Instant::now();

            match conn.request(ClientMessage::Ping { timestamp }).await? {
                ServerMessage::Pong { timestamp: echoed } if echoed == timestamp => {
                    println!("pong from {} in {:?}", cli.server, started.elapsed());
                }
                other => anyhow::bail!("Unexpected reply from daemon: {:?}", other),
            }
        }
    }

    Ok(())
}
