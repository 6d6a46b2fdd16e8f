use std::sync::{Arc, Weak};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::config::ClientConfig;
use crate::transport::error::{MctcpError, Result};
use crate::transport::pool::TcpPool;
use crate::transport::socket;
use crate::transport::{PacketReader, PacketWriter};
use crate::util::retry::retry;

/// The dialing side of the tunnel. It opens the configured number of connections on startup,
///  and dials a replacement whenever a connection breaks.
pub struct Client {
    cancel: CancellationToken,
    pool: Arc<TcpPool>,
    reconnector: Arc<Reconnector>,
}

impl Client {
    /// Dials all initial connections sequentially, failing if any one of them can not be
    ///  established
    pub async fn new(cancel: CancellationToken, config: ClientConfig) -> anyhow::Result<Client> {
        config.validate()?;

        // tears down the connections dialed so far if construction fails
        let lifetime = cancel.child_token();
        let guard = lifetime.clone().drop_guard();

        let pool = Arc::new(TcpPool::new(lifetime.clone(), config.connection_count, config.read_buffer_size));
        let reconnector = Arc::new(Reconnector {
            cancel: lifetime.clone(),
            dial_limiter: RateLimiter::direct(Quota::per_second(config.dials_per_second)),
            counters: Mutex::new(BrokenCounters::default()),
            pool: Arc::downgrade(&pool),
            config,
        });

        pool.on_read_broken({
            let reconnector = reconnector.clone();
            move |e| {
                if e.is_broken_connection() {
                    debug!("read connection broken: {}", e);
                    reconnector.on_broken(BrokenSide::Read);
                }
            }
        });

        for _ in 0..reconnector.config.connection_count {
            let stream = reconnector.dial().await
                .context("create connection failed")?;
            pool.push(stream);
        }
        info!("{} connections to {} established", pool.connection_count(), reconnector.config.dial_addr);

        Ok(Client {
            cancel: guard.disarm(),
            pool,
            reconnector,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pool(&self) -> &Arc<TcpPool> {
        &self.pool
    }

    /// Sends a packet over one of the connections. A broken connection is not reported to the
    ///  caller - the packet is lost as it could be with UDP - but it triggers a reconnect.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(MctcpError::Closed);
        }

        match self.pool.write(buf).await {
            Err(e) if e.is_broken_connection() => {
                debug!("write connection broken: {}", e);
                self.reconnector.on_broken(BrokenSide::Write);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn read(&self) -> Result<Bytes> {
        if self.is_closed() {
            return Err(MctcpError::Closed);
        }
        self.pool.read().await
    }
}

#[async_trait]
impl PacketReader for Client {
    async fn read(&self) -> Result<Bytes> {
        Client::read(self).await
    }
}

#[async_trait]
impl PacketWriter for Client {
    async fn write(&self, buf: &[u8]) -> Result<()> {
        Client::write(self, buf).await
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum BrokenSide {
    Read,
    Write,
}

/// Broken connections are usually detected twice, once by the watcher and once by a writer.
///  Both sides count separately and share a single threshold, so that one broken connection
///  causes one reconnect, however it is detected.
#[derive(Debug, Default)]
struct BrokenCounters {
    resume: u64,
    read_broken: u64,
    write_broken: u64,
}

impl BrokenCounters {
    /// returns `true` if this failure should trigger a reconnect
    #[must_use]
    fn on_broken(&mut self, side: BrokenSide) -> bool {
        let broken = match side {
            BrokenSide::Read => &mut self.read_broken,
            BrokenSide::Write => &mut self.write_broken,
        };
        *broken += 1;

        if *broken > self.resume {
            self.resume += 1;
            return true;
        }
        false
    }
}

struct Reconnector {
    cancel: CancellationToken,
    config: ClientConfig,
    dial_limiter: DefaultDirectRateLimiter,
    counters: Mutex<BrokenCounters>,
    /// weak to avoid a cycle: the pool holds the read-broken handler, which holds this
    pool: Weak<TcpPool>,
}

impl Reconnector {
    async fn dial(&self) -> anyhow::Result<TcpStream> {
        select! {
            _ = self.cancel.cancelled() => bail!(MctcpError::Closed),
            _ = self.dial_limiter.until_ready() => {}
        }
        select! {
            _ = self.cancel.cancelled() => bail!(MctcpError::Closed),
            result = socket::dial(self.config.dial_addr.as_str(), self.config.dial_timeout) => result,
        }
    }

    fn on_broken(self: &Arc<Self>, side: BrokenSide) {
        let mut counters = self.counters.lock();
        if counters.on_broken(side) {
            debug!("try add connection: {:?}", *counters);
            tokio::spawn(self.clone().reconnect());
        }
    }

    async fn reconnect(self: Arc<Self>) {
        let result = select! {
            _ = self.cancel.cancelled() => return,
            result = retry(self.config.reconnect_attempts, self.config.reconnect_backoff, || self.add_connection()) => result,
        };

        if let Err(e) = result {
            warn!("giving up on reconnecting to {} after {} attempts: {}", self.config.dial_addr, self.config.reconnect_attempts, e);
        }
    }

    async fn add_connection(&self) -> anyhow::Result<()> {
        let stream = self.dial().await
            .context("create connection failed")?;
        let Some(pool) = self.pool.upgrade() else {
            bail!(MctcpError::Closed);
        };
        pool.push(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use crate::test_util::{eventually, within_a_second, write_broken_pair};
    use super::*;
    use BrokenSide::*;

    #[rstest]
    #[case::single_read(vec![Read], vec![true])]
    #[case::single_write(vec![Write], vec![true])]
    #[case::two_reads(vec![Read, Read], vec![true, true])]
    #[case::write_then_read(vec![Write, Read], vec![true, false])]
    #[case::read_then_write(vec![Read, Write], vec![true, false])]
    #[case::writes_then_reads(vec![Write, Write, Read, Read], vec![true, true, false, false])]
    #[case::interleaved(vec![Read, Write, Write, Read], vec![true, false, true, false])]
    #[case::reads_catch_up(vec![Read, Read, Write, Write, Write], vec![true, true, false, false, true])]
    fn test_broken_counters(#[case] sides: Vec<BrokenSide>, #[case] expected: Vec<bool>) {
        let mut counters = BrokenCounters::default();
        let actual = sides.into_iter()
            .map(|side| counters.on_broken(side))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    /// accepts connections forever, handing them to the test
    async fn accepting_listener() -> (String, mpsc::UnboundedReceiver<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    fn test_config(addr: &str, connection_count: usize) -> ClientConfig {
        let mut config = ClientConfig::new(addr);
        config.connection_count = connection_count;
        config.reconnect_backoff = Duration::from_millis(10);
        config
    }

    #[tokio::test]
    async fn test_new_dials_connection_count() {
        let (addr, mut accepted) = accepting_listener().await;

        let client = Client::new(CancellationToken::new(), test_config(&addr, 3)).await.unwrap();

        let mut peers = Vec::new();
        for _ in 0..3 {
            peers.push(within_a_second(accepted.recv()).await.unwrap());
        }
        assert!(tokio::time::timeout(Duration::from_millis(50), accepted.recv()).await.is_err());

        assert_eq!(client.pool().connection_count(), 3);
        assert_eq!(client.pool().capacity(), 3);
    }

    #[tokio::test]
    async fn test_new_fails_if_peer_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = Client::new(CancellationToken::new(), test_config(&addr, 2)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let result = Client::new(CancellationToken::new(), test_config("127.0.0.1:1", 0)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_after_peer_closes_connection() {
        let (addr, mut accepted) = accepting_listener().await;
        let client = Client::new(CancellationToken::new(), test_config(&addr, 2)).await.unwrap();

        let first = within_a_second(accepted.recv()).await.unwrap();
        let _second = within_a_second(accepted.recv()).await.unwrap();
        drop(first);

        let _replacement = within_a_second(accepted.recv()).await.unwrap();
        eventually(|| client.pool().connection_count() == 3).await;
        eventually(|| client.pool().usable_writers() == 2).await;
    }

    #[tokio::test]
    async fn test_broken_write_triggers_single_reconnect() {
        let (addr, mut accepted) = accepting_listener().await;
        let client = Client::new(CancellationToken::new(), test_config(&addr, 1)).await.unwrap();
        let _first = within_a_second(accepted.recv()).await.unwrap();

        // a connection that is not from the listener, so every accept below is a reconnect
        let (broken, broken_peer) = write_broken_pair().await;
        client.pool().push(broken);
        assert_eq!(client.pool().connection_count(), 2);

        // rotate the healthy token to the back of the queue
        client.write(b"ok").await.unwrap();

        within_a_second(client.write(b"lost")).await.unwrap();

        let _replacement = within_a_second(accepted.recv()).await.unwrap();
        eventually(|| client.pool().connection_count() == 2).await;
        eventually(|| client.pool().usable_writers() == 2).await;

        // the watcher now notices the same connection, which must not trigger another dial
        drop(broken_peer);
        assert!(tokio::time::timeout(Duration::from_millis(200), accepted.recv()).await.is_err());
        assert_eq!(client.pool().connection_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_closes_client() {
        let (addr, mut accepted) = accepting_listener().await;
        let cancel = CancellationToken::new();
        let client = Client::new(cancel.clone(), test_config(&addr, 1)).await.unwrap();
        let _peer = within_a_second(accepted.recv()).await.unwrap();

        cancel.cancel();

        assert!(client.is_closed());
        assert!(client.write(b"x").await.unwrap_err().is_closed());
        assert!(client.read().await.unwrap_err().is_closed());
    }
}
