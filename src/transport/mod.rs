//! Multiplexing a single packet flow over a pool of TCP connections.
//!
//! Each packet is sent as a length prefixed [frame] over one of the pool's connections. There
//!  is no ordering guarantee across connections, and packets are dropped rather than queued
//!  when the pool has no spare capacity - the tunnel keeps UDP semantics.

pub mod error;
pub mod frame;
pub mod pool;
pub mod socket;
pub mod tracked_conn;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::transport::error::Result;

/// Source of packets for the forwarding loops
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketReader: Send + Sync + 'static {
    /// Waits for the next packet
    async fn read(&self) -> Result<Bytes>;
}

/// Sink of packets for the forwarding loops. Writing is best effort: it must not block
///  indefinitely, and may drop the packet silently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketWriter: Send + Sync + 'static {
    async fn write(&self, buf: &[u8]) -> Result<()>;
}
