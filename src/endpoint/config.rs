use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP address of the server side of the tunnel
    pub dial_addr: String,

    /// Number of connections dialed on startup. This is also the initial capacity of the pool.
    pub connection_count: usize,
    /// Number of received packets that are buffered until they are read - packets arriving
    ///  while the buffer is full are dropped
    pub read_buffer_size: usize,

    /// Upper bound for dialing, shared by the initial connections and reconnects. This protects
    ///  the peer's accept backlog when connections are flapping.
    pub dials_per_second: NonZeroU32,
    pub dial_timeout: Duration,

    /// Dial attempts per reconnect before it is abandoned
    pub reconnect_attempts: usize,
    /// Delay after the first failed reconnect attempt, doubling with every further attempt
    pub reconnect_backoff: Duration,
}

impl ClientConfig {
    pub fn new(dial_addr: impl Into<String>) -> ClientConfig {
        ClientConfig {
            dial_addr: dial_addr.into(),
            connection_count: 8,
            read_buffer_size: 4096,
            dials_per_second: NonZeroU32::MIN.saturating_add(3),
            dial_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_count == 0 {
            bail!("at least one connection is required");
        }
        if self.read_buffer_size == 0 {
            bail!("read buffer size must not be 0");
        }
        if self.reconnect_attempts == 0 {
            bail!("at least one reconnect attempt is required");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,

    /// Initial capacity of the pool - it grows when more connections arrive
    pub pool_size: usize,
    pub read_buffer_size: usize,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>) -> ServerConfig {
        ServerConfig {
            listen_addr: listen_addr.into(),
            pool_size: 16,
            read_buffer_size: 4096,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_size == 0 {
            bail!("pool size must not be 0");
        }
        if self.read_buffer_size == 0 {
            bail!("read buffer size must not be 0");
        }
        Ok(())
    }
}
