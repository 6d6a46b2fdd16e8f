use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::error::{MctcpError, Result};
use crate::transport::frame::MAX_PACKET_LEN;
use crate::transport::tracked_conn::{TrackedConn, TrackedReadHalf, TrackedWriteHalf};
use crate::transport::{PacketReader, PacketWriter};

pub type ReadBrokenHandler = Arc<dyn Fn(MctcpError) + Send + Sync>;

/// A set of TCP connections to the same peer that looks like a single lossy packet channel
///  to the outside.
///
/// Writes go to whichever connection is idle, taking its write token from a bounded queue and
///  putting it back afterwards. If no token is available, the packet is dropped rather than
///  blocking the caller. Every connection has its own watcher task that decodes incoming
///  frames into a shared bounded inbound queue, which is what [TcpPool::read] consumes.
///
/// The token queue starts with the capacity the pool was created with, and doubles whenever
///  more connections were pushed than it can hold. It never shrinks.
///
/// Cancelling the lifetime token closes the pool for good.
pub struct TcpPool {
    cancel: CancellationToken,

    /// connections pushed, minus connections retired by a failed write
    current: AtomicUsize,
    /// target capacity of the token queue
    size: AtomicUsize,

    /// shared access for taking / returning tokens, exclusive access for resizing
    writers: RwLock<WriterQueue>,

    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Mutex<mpsc::Receiver<Bytes>>,

    on_read_broken: RwLock<Option<ReadBrokenHandler>>,
}

struct WriterQueue {
    capacity: usize,
    tx: Sender<TrackedWriteHalf>,
    rx: Receiver<TrackedWriteHalf>,
}

impl WriterQueue {
    fn new(capacity: usize) -> WriterQueue {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        WriterQueue { capacity, tx, rx }
    }

    /// Moves every queued token into a new, bigger queue. Asking for a capacity that is not
    ///  bigger than the current one is a no-op, so concurrent growth requests can be applied
    ///  in any order.
    fn grow_to(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }

        let grown = WriterQueue::new(capacity);
        for writer in self.rx.try_iter() {
            if let Err(e) = grown.tx.try_send(writer) {
                warn!("lost a connection while growing the writer pool: {}", e);
            }
        }
        *self = grown;
    }
}

impl TcpPool {
    pub fn new(cancel: CancellationToken, size: usize, read_buffer_size: usize) -> TcpPool {
        // doubling requires a non-zero start, and neither queue supports zero capacity
        let size = size.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(read_buffer_size.max(1));

        TcpPool {
            cancel,
            current: AtomicUsize::new(0),
            size: AtomicUsize::new(size),
            writers: RwLock::new(WriterQueue::new(size)),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            on_read_broken: RwLock::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn capacity(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Registers the handler that is called when a watcher fails to read from its connection.
    ///  It runs on the watcher task, so it must not block.
    pub fn on_read_broken(&self, handler: impl Fn(MctcpError) + Send + Sync + 'static) {
        *self.on_read_broken.write() = Some(Arc::new(handler));
    }

    /// Takes ownership of a connection: makes it available for writing and starts its watcher
    pub fn push(self: &Arc<Self>, stream: TcpStream) {
        let current = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("adding connection to pool, current: {}", current);

        self.grow_if_needed();

        let (reader, writer) = TrackedConn::new(stream).split();
        self.return_writer(writer);
        tokio::spawn(self.clone().watch(reader));
    }

    fn grow_if_needed(&self) {
        loop {
            let current = self.current.load(Ordering::Acquire);
            let size = self.size.load(Ordering::Acquire);
            if current <= size {
                return;
            }

            if self.size.compare_exchange(size, size * 2, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                debug!("enlarging writer pool to {}", size * 2);
                self.writers.write()
                    .grow_to(self.size.load(Ordering::Acquire));
            }
        }
    }

    fn take_writer(&self) -> Option<TrackedWriteHalf> {
        let queue = self.writers.read();
        loop {
            match queue.rx.try_recv() {
                Ok(writer) if writer.is_available() => return Some(writer),
                Ok(writer) => {
                    trace!("discarding write token of closed connection to {:?}", writer.peer_addr());
                }
                Err(_) => return None,
            }
        }
    }

    /// Puts a token back into the queue. A concurrent `push` may have raised the target capacity
    ///  without having rebuilt the queue yet, so a full queue that is smaller than the target is
    ///  grown here rather than losing the token.
    fn return_writer(&self, writer: TrackedWriteHalf) {
        let writer = {
            let queue = self.writers.read();
            match queue.tx.try_send(writer) {
                Ok(()) => return,
                Err(TrySendError::Full(writer)) if queue.capacity < self.capacity() => writer,
                Err(e) => {
                    warn!("no room for write token, dropping it: {}", e);
                    return;
                }
            }
        };

        let mut queue = self.writers.write();
        queue.grow_to(self.capacity());
        if let Err(e) = queue.tx.try_send(writer) {
            warn!("no room for write token, dropping it: {}", e);
        }
    }

    /// Number of queued write tokens that belong to live connections. Tokens of closed
    ///  connections are purged on the way, tokens currently held by writers are not counted.
    pub fn usable_writers(&self) -> usize {
        let queue = self.writers.write();
        let usable = queue.rx.try_iter()
            .filter(|w| w.is_available())
            .collect::<Vec<_>>();

        let result = usable.len();
        for writer in usable {
            if let Err(e) = queue.tx.try_send(writer) {
                warn!("no room for write token, dropping it: {}", e);
            }
        }
        result
    }

    async fn watch(self: Arc<Self>, mut reader: TrackedReadHalf) {
        debug!("watching connection {:?} <-> {:?}", reader.local_addr(), reader.peer_addr());

        loop {
            let result = select! {
                _ = self.cancel.cancelled() => break,
                result = reader.read_frame() => result,
            };

            match result {
                Ok(packet) => {
                    trace!("tcp-> {} bytes from {:?}", packet.len(), reader.peer_addr());
                    match self.inbound_tx.try_send(packet) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("read buffer full, dropping packet");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Err(e) => {
                    debug!("reading from {:?} failed: {}", reader.peer_addr(), e);
                    reader.close();
                    debug_assert!(!reader.is_available());

                    let handler = self.on_read_broken.read().clone();
                    if let Some(handler) = handler {
                        handler(e);
                    }
                    return;
                }
            }
        }

        reader.close();
    }

    /// Waits for the next packet from any of the connections, in the order the watchers
    ///  queued them
    pub async fn read(&self) -> Result<Bytes> {
        if self.is_closed() {
            return Err(MctcpError::Closed);
        }

        select! {
            _ = self.cancel.cancelled() => Err(MctcpError::Closed),
            packet = async { self.inbound_rx.lock().await.recv().await } => {
                packet.ok_or(MctcpError::Closed)
            }
        }
    }

    /// Sends a packet over one idle connection. Without an idle connection, the packet is
    ///  dropped and this returns `Ok`.
    ///
    /// A broken connection error means the connection that was picked is retired from writing.
    ///  The pool does not retry, it is up to the caller to replace the connection.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(MctcpError::Closed);
        }
        if buf.len() > MAX_PACKET_LEN {
            return Err(MctcpError::PacketTooLong(buf.len()));
        }

        let Some(mut writer) = self.take_writer() else {
            trace!("no idle connection, dropping packet of {} bytes", buf.len());
            return Ok(());
        };

        let result = select! {
            _ = self.cancel.cancelled() => return Err(MctcpError::Closed),
            result = writer.write_frame(buf) => result,
        };

        match result {
            Ok(()) => {
                trace!("->tcp {} bytes to {:?}", buf.len(), writer.peer_addr());
                self.return_writer(writer);
                Ok(())
            }
            Err(e) => {
                writer.mark_unavailable();
                let remaining = self.current.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                debug!("writing to {:?} failed, retiring it from the pool ({} left): {}", writer.peer_addr(), remaining, e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PacketReader for TcpPool {
    async fn read(&self) -> Result<Bytes> {
        TcpPool::read(self).await
    }
}

#[async_trait]
impl PacketWriter for TcpPool {
    async fn write(&self, buf: &[u8]) -> Result<()> {
        TcpPool::write(self, buf).await
    }
}
