//! Test client for E2E tests
//!
//! Speaks the control protocol over a plain socket, one reply at a time.

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use ssmtun_protocol::{ClientMessage, ServerMessage, TunnelCodec};

use crate::harness::TestServer;

/// A control connection to a [`TestServer`]
pub struct TestClient {
    stream: TcpStream,
    read_codec: TunnelCodec<ServerMessage>,
    read_buf: BytesMut,
}

impl TestClient {
    pub async fn connect(server: &TestServer) -> Result<Self> {
        let stream = TcpStream::connect(server.control_addr).await?;
        Ok(Self {
            stream,
            read_codec: TunnelCodec::new(),
            read_buf: BytesMut::with_capacity(4096),
        })
    }

    pub async fn send(&mut self, msg: ClientMessage) -> Result<()> {
        let mut codec = TunnelCodec::<ClientMessage>::new();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write raw bytes, bypassing the codec
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Read the next reply; `None` once the daemon closed the connection
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            if let Some(msg) = self.read_codec.decode(&mut self.read_buf)? {
                return Ok(Some(msg));
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    pub async fn request(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        self.send(msg).await?;
        self.recv()
            .await?
            .ok_or_else(|| anyhow::anyhow!("Daemon disconnected before replying"))
    }

    /// Request tunnel `id` to `remote_host:5432` with daemon defaults for the rest
    pub async fn start_tunnel(
        &mut self,
        id: &str,
        remote_host: &str,
        local_port: u16,
    ) -> Result<ServerMessage> {
        self.request(start_tunnel(id, remote_host, local_port)).await
    }
}

/// A `start_tunnel` request relying on the daemon's default target and region
pub fn start_tunnel(id: &str, remote_host: &str, local_port: u16) -> ClientMessage {
    ClientMessage::StartTunnel {
        id: id.to_string(),
        target: None,
        region: None,
        remote_host: remote_host.to_string(),
        remote_port: 5432,
        local_port,
    }
}
