use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use ssmtun_protocol::{ClientMessage, ServerMessage, TunnelCodec};

/// Connection to the daemon's control socket
pub struct DaemonConnection {
    reader: FramedRead<OwnedReadHalf, TunnelCodec<ServerMessage>>,
    writer: FramedWrite<OwnedWriteHalf, TunnelCodec<ClientMessage>>,
}

impl DaemonConnection {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to ssmtun daemon at {}", addr))?;
        tracing::debug!("Connected to daemon at {}", addr);

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(read_half, TunnelCodec::new()),
            writer: FramedWrite::new(write_half, TunnelCodec::new()),
        })
    }

    pub async fn send(&mut self, msg: ClientMessage) -> Result<()> {
        self.writer
            .send(msg)
            .await
            .context("Failed to send request to daemon")
    }

    pub async fn recv(&mut self) -> Result<ServerMessage> {
        match self.reader.next().await {
            Some(msg) => msg.context("Failed to read reply from daemon"),
            None => anyhow::bail!("Daemon closed the connection"),
        }
    }

    /// Send `msg` and return the first reply
    pub async fn request(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        self.send(msg).await?;
        self.recv().await
    }
}
