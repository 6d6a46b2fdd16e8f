use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap_derive::Parser;
use tokio::net::UdpSocket;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use mctcp::endpoint::config::ServerConfig;
use mctcp::endpoint::server::Server;
use mctcp::forward::{self, DEFAULT_UDP_BUFFER_SIZE};
use mctcp::util::logging::init_logging;

/// Accepts TCP connections from `udp2mctcp` instances and forwards the tunneled packets to a
///  UDP address.
#[derive(Parser)]
struct Args {
    /// UDP address to forward packets to
    #[clap(short, long)]
    forward: String,

    /// TCP address to accept connections on
    #[clap(short, long)]
    listen: String,

    /// Initial capacity of the connection pool
    #[clap(short = 's', long, default_value_t = 16)]
    pool_size: usize,

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

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(args.forward.as_str()).await
        .with_context(|| format!("connect to udp {} failed", args.forward))?;
    info!("forwarding to udp {}", args.forward);

    let mut config = ServerConfig::new(args.listen);
    config.pool_size = args.pool_size;
    config.read_buffer_size = args.read_buffer_size;

    let cancel = CancellationToken::new();
    let server = Arc::new(Server::new(cancel.clone(), config).await?);

    let result = select! {
        result = forward::mctcp_to_udp(server.as_ref(), &socket) => result.context("mctcp -> udp"),
        result = forward::udp_to_mctcp(&socket, server.clone(), args.udp_buffer_size) => result.context("udp -> mctcp"),
    };

    cancel.cancel();
    if let Err(e) = &result {
        error!("forwarding stopped: {:#}", e);
    }
    result
}
