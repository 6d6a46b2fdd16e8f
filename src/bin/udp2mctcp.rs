use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap_derive::Parser;
use tokio::net::UdpSocket;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use mctcp::endpoint::client::Client;
use mctcp::endpoint::config::ClientConfig;
use mctcp::forward::{self, DEFAULT_UDP_BUFFER_SIZE};
use mctcp::util::logging::init_logging;

/// Receives UDP datagrams and tunnels them to a `mctcp2udp` instance over a pool of TCP
///  connections. Replies travel back to the first UDP peer that sent a datagram.
#[derive(Parser)]
struct Args {
    /// UDP address to receive datagrams on
    #[clap(short, long)]
    listen: String,

    /// TCP address of the `mctcp2udp` instance
    #[clap(short, long)]
    forward: String,

    /// Number of TCP connections
    #[clap(short, long, default_value_t = 8)]
    connections: usize,

    /// Number of received packets buffered for the UDP side
    #[clap(short = 'b', long, default_value_t = 4096)]
    read_buffer_size: usize,

    #[clap(long, default_value_t = DEFAULT_UDP_BUFFER_SIZE)]
    udp_buffer_size: usize,

    #[clap(long, default_value = "info")]
    log: Level,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log);

    let socket = UdpSocket::bind(args.listen.as_str()).await
        .with_context(|| format!("listen on udp {} failed", args.listen))?;
    info!("waiting for the first datagram on {}", socket.local_addr()?);

    // the first datagram only serves to learn the peer's address
    let mut buf = vec![0u8; args.udp_buffer_size];
    let (_, peer_addr) = socket.recv_from(&mut buf).await?;
    socket.connect(peer_addr).await?;
    info!("forwarding datagrams from {} to {}", peer_addr, args.forward);

    let mut config = ClientConfig::new(args.forward);
    config.connection_count = args.connections;
    config.read_buffer_size = args.read_buffer_size;

    let cancel = CancellationToken::new();
    let client = Arc::new(Client::new(cancel.clone(), config).await?);

    let result = select! {
        result = forward::mctcp_to_udp(client.as_ref(), &socket) => result.context("mctcp -> udp"),
        result = forward::udp_to_mctcp(&socket, client.clone(), args.udp_buffer_size) => result.context("udp -> mctcp"),
    };

    cancel.cancel();
    if let Err(e) = &result {
        error!("forwarding stopped: {:#}", e);
    }
    result
}
