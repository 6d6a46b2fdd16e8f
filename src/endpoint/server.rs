use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::endpoint::config::ServerConfig;
use crate::transport::error::Result;
use crate::transport::pool::TcpPool;
use crate::transport::socket;
use crate::transport::{PacketReader, PacketWriter};

/// The accepting side of the tunnel. All accepted connections go into a single pool, so
///  a server serves exactly one tunneled flow.
pub struct Server {
    pool: Arc<TcpPool>,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the listener and starts accepting in the background. Binding happens here so that
    ///  an unusable address is reported to the caller.
    pub async fn new(cancel: CancellationToken, config: ServerConfig) -> anyhow::Result<Server> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr.as_str()).await
            .with_context(|| format!("listen on {} failed", config.listen_addr))?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        let pool = Arc::new(TcpPool::new(cancel.clone(), config.pool_size, config.read_buffer_size));

        let accepting_pool = pool.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_loop(listener, accepting_pool, cancel).await {
                error!("accepting connections failed: {}", e);
            }
        });

        Ok(Server {
            pool,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &Arc<TcpPool> {
        &self.pool
    }

    /// Broken connections are not reported - it is up to the client to replace them
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        match self.pool.write(buf).await {
            Err(e) if e.is_broken_connection() => {
                debug!("write connection broken: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn read(&self) -> Result<Bytes> {
        self.pool.read().await
    }
}

#[async_trait]
impl PacketReader for Server {
    async fn read(&self) -> Result<Bytes> {
        Server::read(self).await
    }
}

#[async_trait]
impl PacketWriter for Server {
    async fn write(&self, buf: &[u8]) -> Result<()> {
        Server::write(self, buf).await
    }
}

async fn accept_loop(listener: TcpListener, pool: Arc<TcpPool>, cancel: CancellationToken) -> anyhow::Result<()> {
    loop {
        let (stream, peer_addr) = select! {
            _ = cancel.cancelled() => {
                debug!("shutting down listener");
                return Ok(());
            }
            result = listener.accept() => result?,
        };

        debug!("accepted connection from {}", peer_addr);
        socket::configure_stream(&stream);
        pool.push(stream);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use crate::test_util::{eventually, within_a_second, write_broken_pair};
    use super::*;

    async fn test_server(cancel: CancellationToken) -> Server {
        Server::new(cancel, ServerConfig::new("127.0.0.1:0")).await.unwrap()
    }

    #[tokio::test]
    async fn test_read_raw_frame() {
        let server = test_server(CancellationToken::new()).await;

        let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
        peer.write_all(b"\x00\x05hello").await.unwrap();

        let packet = within_a_second(server.read()).await.unwrap();
        assert_eq!(packet.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let server = test_server(CancellationToken::new()).await;

        let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
        eventually(|| server.pool().connection_count() == 1).await;

        server.write(b"abc").await.unwrap();

        let mut buf = [0u8; 5];
        within_a_second(peer.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"\x00\x03abc");
    }

    #[tokio::test]
    async fn test_write_without_connections() {
        let server = test_server(CancellationToken::new()).await;
        server.write(b"dropped").await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_write_is_not_reported() {
        let server = test_server(CancellationToken::new()).await;

        let (broken, _peer) = write_broken_pair().await;
        server.pool().push(broken);
        assert_eq!(server.pool().connection_count(), 1);

        within_a_second(server.write(b"lost")).await.unwrap();
        assert_eq!(server.pool().connection_count(), 0);
        assert_eq!(server.pool().usable_writers(), 0);
    }

    #[tokio::test]
    async fn test_accepted_connections_grow_pool() {
        let mut config = ServerConfig::new("127.0.0.1:0");
        config.pool_size = 2;
        let server = Server::new(CancellationToken::new(), config).await.unwrap();

        let mut peers = Vec::new();
        for _ in 0..3 {
            peers.push(TcpStream::connect(server.local_addr()).await.unwrap());
        }

        eventually(|| server.pool().connection_count() == 3).await;
        assert_eq!(server.pool().capacity(), 4);
    }

    #[tokio::test]
    async fn test_address_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let result = Server::new(CancellationToken::new(), ServerConfig::new(addr.to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_accepting() {
        let cancel = CancellationToken::new();
        let server = test_server(cancel.clone()).await;

        cancel.cancel();

        assert!(server.read().await.unwrap_err().is_closed());

        // the listener is dropped once the accept loop notices the cancellation
        within_a_second(async {
            while TcpStream::connect(server.local_addr()).await.is_ok() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }).await;
    }
}
