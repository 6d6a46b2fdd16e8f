use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use socket2::SockRef;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::transport::error::Result;
use crate::transport::frame;

/// A pooled TCP connection, split into the half read by the connection's watcher and the half
///  that circulates through the pool as a write token.
///
/// Both halves share an availability flag. Closing flips the flag before the socket is shut
///  down, so a writer that dequeues the token of a closing connection sees it as unavailable
///  instead of writing to a half closed socket.
pub struct TrackedConn {
    reader: TrackedReadHalf,
    writer: TrackedWriteHalf,
}

struct ConnMark {
    available: AtomicBool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl TrackedConn {
    pub fn new(stream: TcpStream) -> TrackedConn {
        let mark = Arc::new(ConnMark {
            available: AtomicBool::new(true),
            local_addr: stream.local_addr().ok(),
            peer_addr: stream.peer_addr().ok(),
        });
        let (read_half, write_half) = stream.into_split();

        TrackedConn {
            reader: TrackedReadHalf {
                stream: BufReader::new(read_half),
                mark: mark.clone(),
            },
            writer: TrackedWriteHalf {
                stream: write_half,
                mark,
            },
        }
    }

    pub fn split(self) -> (TrackedReadHalf, TrackedWriteHalf) {
        (self.reader, self.writer)
    }
}

pub struct TrackedReadHalf {
    stream: BufReader<OwnedReadHalf>,
    mark: Arc<ConnMark>,
}

impl TrackedReadHalf {
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        frame::decode(&mut self.stream).await
    }

    pub fn is_available(&self) -> bool {
        self.mark.available.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.mark.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mark.local_addr
    }

    /// Marks the connection unavailable, then shuts down both directions of the socket. The
    ///  write half may still be sitting in the pool's token queue, it is discarded when it is
    ///  dequeued next.
    pub fn close(&self) {
        self.mark.available.store(false, Ordering::Release);

        let stream: &TcpStream = self.stream.get_ref().as_ref();
        if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Both) {
            // typically the peer is gone already
            debug!("shutting down connection to {:?}: {}", self.mark.peer_addr, e);
        }
    }
}

pub struct TrackedWriteHalf {
    stream: OwnedWriteHalf,
    mark: Arc<ConnMark>,
}

impl TrackedWriteHalf {
    pub async fn write_frame(&mut self, packet: &[u8]) -> Result<()> {
        frame::encode(packet, &mut self.stream).await
    }

    pub fn is_available(&self) -> bool {
        self.mark.available.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.mark.peer_addr
    }

    pub fn mark_unavailable(&self) {
        self.mark.available.store(false, Ordering::Release);
    }
}
