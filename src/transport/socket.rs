use std::time::Duration;

use anyhow::anyhow;
use socket2::SockRef;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{info, warn};

/// Applies the options every pooled connection needs, regardless of whether it was dialed or
///  accepted: TCP keep-alive replaces an application level heartbeat, and Nagle's algorithm
///  would add latency to small datagrams.
pub fn configure_stream(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        warn!("set keepalive failed: {}", e);
    }
    if let Err(e) = stream.set_nodelay(true) {
        warn!("set nodelay failed: {}", e);
    }
}

pub async fn dial(addr: impl ToSocketAddrs, dial_timeout: Duration) -> anyhow::Result<TcpStream> {
    let stream = timeout(dial_timeout, TcpStream::connect(addr)).await
        .map_err(|_| anyhow!("connecting timed out after {:?}", dial_timeout))??;

    configure_stream(&stream);
    info!("new connection {:?} <-> {:?}", stream.local_addr().ok(), stream.peer_addr().ok());
    Ok(stream)
}
