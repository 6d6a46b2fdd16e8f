//! Wire format of a single pooled TCP connection: an unbounded sequence of frames, each
//!  carrying exactly one UDP payload.
//!
//! ```ascii
//! 0: payload length (u16 BE)
//! 2: payload (length bytes)
//! ```
//!
//! There is no handshake and no application level keep-alive.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::error::{MctcpError, Result};

pub const HEADER_LEN: usize = 2;

/// Header and payload together must fit into a u16
pub const MAX_PACKET_LEN: usize = u16::MAX as usize - HEADER_LEN;

/// Reads exactly one frame. Any failure - EOF in the middle of a frame included - means the
///  stream can not be resynchronized and is reported as a broken connection.
pub async fn decode<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let mut len_buf = [0u8; HEADER_LEN];
    r.read_exact(&mut len_buf).await
        .map_err(MctcpError::BrokenConnection)?;
    let payload_len = u16::from_be_bytes(len_buf) as usize;

    let mut payload = BytesMut::zeroed(payload_len);
    r.read_exact(&mut payload).await
        .map_err(MctcpError::BrokenConnection)?;
    Ok(payload.freeze())
}

/// Writes one frame as a single buffer. An oversized packet is rejected before anything is
///  written.
pub async fn encode<W: AsyncWrite + Unpin>(packet: &[u8], w: &mut W) -> Result<()> {
    if packet.len() > MAX_PACKET_LEN {
        return Err(MctcpError::PacketTooLong(packet.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + packet.len());
    buf.put_u16(packet.len() as u16);
    buf.put_slice(packet);

    // a frame that is only partially on the wire corrupts the stream for good, so there is
    //  no point in continuing after a failed write
    w.write_all(&buf).await
        .map_err(MctcpError::BrokenConnection)?;
    Ok(())
}
