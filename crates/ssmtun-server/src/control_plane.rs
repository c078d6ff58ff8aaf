use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use ssmtun_protocol::{ClientMessage, ServerMessage, TunnelCodec};

use crate::tracker::{StartTunnelRequest, TunnelTracker};

/// Values filled in for requests that leave them out
#[derive(Debug, Clone, Default)]
pub struct RequestDefaults {
    pub target: Option<String>,
    pub region: Option<String>,
}

/// Local control socket serving tunnel requests from out-of-process callers
pub struct ControlPlane {
    tracker: Arc<TunnelTracker>,
    defaults: RequestDefaults,
}

impl ControlPlane {
    pub fn new(tracker: Arc<TunnelTracker>, defaults: RequestDefaults) -> Arc<Self> {
        Arc::new(Self { tracker, defaults })
    }

    /// Start listening for control connections
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Control plane listening on {}", addr);
        self.run_with_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = self.clone();

            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr).await {
                    tracing::error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        tracing::debug!("New control connection from {}", peer_addr);

        let (mut read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(32);

        // Waits still running when the connection goes away are cancelled;
        // their launches carry on.
        let connection_cancel = CancellationToken::new();

        let write_handle = tokio::spawn(async move {
            let mut write_half = write_half;
            let mut codec = TunnelCodec::<ServerMessage>::new();
            let mut write_buf = BytesMut::with_capacity(1024);

            while let Some(msg) = rx.recv().await {
                write_buf.clear();
                if let Err(e) = codec.encode(msg, &mut write_buf) {
                    tracing::error!("Failed to encode message: {}", e);
                    break;
                }
                if let Err(e) = write_half.write_all(&write_buf).await {
                    tracing::debug!("Failed to write message: {}", e);
                    break;
                }
            }
        });

        let mut codec = TunnelCodec::<ClientMessage>::new();
        let mut read_buf = BytesMut::with_capacity(4096);

        'read: loop {
            match read_half.read_buf(&mut read_buf).await {
                Ok(0) => {
                    tracing::debug!("Control client {} disconnected", peer_addr);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Read error from {}: {}", peer_addr, e);
                    break;
                }
            }

            loop {
                match codec.decode(&mut read_buf) {
                    Ok(Some(msg)) => self.dispatch(msg, &tx, &connection_cancel).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Decode error from {}: {}", peer_addr, e);
                        break 'read;
                    }
                }
            }
        }

        // Cancel outstanding waits, then let the writer drain what they send
        connection_cancel.cancel();
        drop(tx);
        let _ = write_handle.await;
        Ok(())
    }

    async fn dispatch(
        &self,
        msg: ClientMessage,
        tx: &mpsc::Sender<ServerMessage>,
        cancel: &CancellationToken,
    ) {
        match msg {
            ClientMessage::StartTunnel {
                id,
                target,
                region,
                remote_host,
                remote_port,
                local_port,
            } => {
                let request = StartTunnelRequest {
                    id,
                    target: target
                        .or_else(|| self.defaults.target.clone())
                        .unwrap_or_default(),
                    remote_host,
                    remote_port,
                    local_port,
                    region: region
                        .or_else(|| self.defaults.region.clone())
                        .unwrap_or_default(),
                };
                tracing::debug!(
                    "start_tunnel {} -> {}:{} (local port {})",
                    request.id,
                    request.remote_host,
                    request.remote_port,
                    request.local_port
                );

                let tracker = self.tracker.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let id = request.id.clone();
                    let reply = match tracker.start_tunnel(request, &cancel).await {
                        Ok(info) => ServerMessage::TunnelReady {
                            id,
                            local_host: info.local_host,
                            local_port: info.local_port,
                        },
                        Err(e) => ServerMessage::TunnelFailed {
                            id,
                            kind: e.kind().to_string(),
                            reason: e.to_string(),
                        },
                    };
                    // The client may already be gone
                    let _ = tx.send(reply).await;
                });
            }
            ClientMessage::ListTunnels => {
                let registry = self.tracker.registry();
                let _ = tx
                    .send(ServerMessage::Tunnels {
                        tunnels: registry.snapshot(),
                        discarded_resolutions: registry.discarded_resolutions(),
                    })
                    .await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = tx.send(ServerMessage::Pong { timestamp }).await;
            }
        }
    }
}
