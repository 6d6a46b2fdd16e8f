//! Loops that connect a UDP socket with one end of the tunnel, one loop per direction.

use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::transport::error::MctcpError;
use crate::transport::{PacketReader, PacketWriter};

/// Receive buffer per datagram, large enough for a full Ethernet MTU
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 1600;

/// Sends every packet read from the tunnel to the UDP socket's connected peer. Runs until
///  either side fails.
pub async fn mctcp_to_udp<R: PacketReader + ?Sized>(reader: &R, socket: &UdpSocket) -> anyhow::Result<()> {
    loop {
        let packet = reader.read().await?;
        trace!("forwarding {} bytes to udp", packet.len());
        socket.send(&packet).await
            .context("udp send failed")?;
    }
}

/// Writes every datagram received on the UDP socket into the tunnel. Each write runs on its own
///  task, so a stalled connection never delays receiving. The first failed write ends the loop
///  when the next datagram arrives.
pub async fn udp_to_mctcp<W: PacketWriter + ?Sized>(socket: &UdpSocket, writer: Arc<W>, buffer_size: usize) -> anyhow::Result<()> {
    let (error_tx, mut error_rx) = mpsc::channel::<MctcpError>(1);

    loop {
        let mut buf = BytesMut::zeroed(buffer_size);
        let len = socket.recv(&mut buf).await
            .context("udp receive failed")?;
        buf.truncate(len);

        if let Ok(e) = error_rx.try_recv() {
            return Err(e.into());
        }

        let packet = buf.freeze();
        let writer = writer.clone();
        let error_tx = error_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.write(&packet).await {
                debug!("forwarding {} bytes failed: {}", packet.len(), e);
                // only the first error matters
                let _ = error_tx.try_send(e);
            }
        });
    }
}
