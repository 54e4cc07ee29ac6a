use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::branch::{run_janitor, BranchCache};
use crate::config::ConnConfig;
use crate::gate::ReadGate;
use crate::message::{Inbound, Request};
use crate::reader::{tcp_reader, udp_reader};
use crate::transport::{DatagramRegistry, TransportKind};

#[derive(Debug, Error)]
pub enum ConnError {
    /// The connection was closed before or during the operation
    #[error("connection is closed")]
    Closed,
    #[error("end of stream")]
    EndOfStream,
    #[error("unparsable message: {0}")]
    Parse(anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("the registry of UDP connection {0} is gone")]
    RegistryGone(SocketAddr),
}

/// Returns once `closed` turns true, or when its sender is gone
pub(crate) async fn closed_signal(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

enum Link {
    Udp {
        registry: Weak<dyn DatagramRegistry>,
        /// `None` after the connection is closed, which terminates the UDP reader
        datagrams: Mutex<Option<mpsc::Sender<Bytes>>>,
    },
    Tcp {
        /// `None` after the connection is closed, so the socket is released once the reader
        ///  has stopped
        writer: Mutex<Option<OwnedWriteHalf>>,
    },
}

struct InboundQueue {
    rx: mpsc::Receiver<Inbound>,
    /// units that the dispatcher took from `rx` but handed back because the gate was locked
    ///  in the meantime. They go before anything still in `rx`.
    requeued: VecDeque<Inbound>,
}
impl InboundQueue {
    async fn next(&mut self) -> Option<Inbound> {
        if let Some(unit) = self.requeued.pop_front() {
            return Some(unit);
        }
        self.rx.recv().await
    }

    fn requeue(&mut self, unit: Inbound) {
        self.requeued.push_front(unit);
    }
}

enum Dequeued {
    Unit(Inbound),
    Requeued,
    EndOfStream,
}

/// A connection with a single remote user agent, over UDP or TCP.
///
/// A transport reader task continuously decodes incoming data into the connection's inbound
///  queue, and a janitor task expires remembered branches. Both run until the connection is
///  closed.
///
/// The inbound queue is meant to be drained by a single consumer at a time: normally the
///  request dispatcher ([Connection::read_request]), or, while the connection is locked
///  ([Connection::lock]), whoever locked it using [Connection::read].
///
/// Outgoing data is collected by [Connection::write] and sent by [Connection::flush] - for
///  UDP, each flush sends a single datagram.
pub struct Connection {
    kind: TransportKind,
    peer_addr: SocketAddr,
    link: Link,
    inbound: Mutex<InboundQueue>,
    write_buffer: Mutex<BytesMut>,
    closed: watch::Sender<bool>,
    gate: ReadGate,
    created: Instant,
    last_activity_millis: AtomicU64,
    branches: Arc<BranchCache>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{}:{}}}", self.kind, self.peer_addr)
    }
}

impl Connection {
    fn new(kind: TransportKind, peer_addr: SocketAddr, link: Link, inbound_rx: mpsc::Receiver<Inbound>, config: &ConnConfig) -> Connection {
        let (closed, _) = watch::channel(false);
        Connection {
            kind,
            peer_addr,
            link,
            inbound: Mutex::new(InboundQueue {
                rx: inbound_rx,
                requeued: VecDeque::new(),
            }),
            write_buffer: Mutex::new(BytesMut::new()),
            closed,
            gate: ReadGate::new(),
            created: Instant::now(),
            last_activity_millis: AtomicU64::new(0),
            branches: Arc::new(BranchCache::new(config.branch_ttl)),
        }
    }

    /// Creates a connection to `peer_addr` that sends through `registry`'s shared socket and
    ///  receives the datagrams passed to [Connection::deliver_datagram].
    ///
    /// The caller is responsible for adding the connection to the registry; it removes itself
    ///  when it is closed.
    pub fn new_udp(peer_addr: SocketAddr, registry: Weak<dyn DatagramRegistry>, config: &ConnConfig) -> Arc<Connection> {
        let (datagram_tx, datagram_rx) = mpsc::channel(config.datagram_queue_len);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_len);

        let link = Link::Udp {
            registry,
            datagrams: Mutex::new(Some(datagram_tx)),
        };
        let conn = Arc::new(Connection::new(TransportKind::Udp, peer_addr, link, inbound_rx, config));
        debug!("new UDP connection to {}", peer_addr);

        tokio::spawn(
            udp_reader(Arc::downgrade(&conn), datagram_rx, inbound_tx, conn.closed.subscribe(), config.max_message_size)
                .instrument(info_span!("udp_reader", peer = %peer_addr))
        );
        conn.spawn_janitor(config);
        conn
    }

    /// Takes ownership of a connected TCP stream
    pub fn new_tcp(stream: TcpStream, config: &ConnConfig) -> anyhow::Result<Arc<Connection>> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_len);

        let link = Link::Tcp {
            writer: Mutex::new(Some(write_half)),
        };
        let conn = Arc::new(Connection::new(TransportKind::Tcp, peer_addr, link, inbound_rx, config));
        debug!("new TCP connection to {}", peer_addr);

        tokio::spawn(
            tcp_reader(Arc::downgrade(&conn), BufReader::new(read_half), inbound_tx, conn.closed.subscribe(), config.max_message_size)
                .instrument(info_span!("tcp_reader", peer = %peer_addr))
        );
        conn.spawn_janitor(config);
        Ok(conn)
    }

    pub async fn dial_tcp(peer_addr: SocketAddr, config: &ConnConfig) -> anyhow::Result<Arc<Connection>> {
        let stream = TcpStream::connect(peer_addr).await?;
        Connection::new_tcp(stream, config)
    }

    fn spawn_janitor(&self, config: &ConnConfig) {
        tokio::spawn(
            run_janitor(self.branches.clone(), config.branch_janitor_interval, self.closed.subscribe())
                .instrument(info_span!("branch_janitor", peer = %self.peer_addr))
        );
    }

    pub fn transport(&self) -> TransportKind {
        self.kind
    }

    pub fn addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// The time of the most recent inbound datagram, or the connection's creation. This is
    ///  tracked for UDP only.
    pub fn last_activity(&self) -> Instant {
        self.created + Duration::from_millis(self.last_activity_millis.load(Ordering::Acquire))
    }

    pub(crate) fn touch(&self) {
        let millis = self.created.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        self.last_activity_millis.fetch_max(millis, Ordering::AcqRel);
    }

    /// Returns the next unit from the inbound queue, or `None` if the connection is closed.
    ///
    /// This is meant to be called while the connection is locked, see [Connection::lock].
    pub async fn read(&self) -> Option<Inbound> {
        if self.is_closed() {
            return None;
        }

        select! {
            unit = async { self.inbound.lock().await.next().await } => unit,
            _ = closed_signal(self.closed.subscribe()) => None,
        }
    }

    /// Takes the inbound queue away from the request dispatcher until [Connection::unlock] is
    ///  called. The dispatcher does not consume anything while the connection is locked.
    pub fn lock(&self) {
        trace!("locking {:?}", self);
        self.gate.lock();
    }

    pub fn unlock(&self) {
        trace!("unlocking {:?}", self);
        self.gate.unlock();
    }

    pub fn is_locked(&self) -> bool {
        self.gate.is_locked()
    }

    /// Locks the connection for as long as the returned guard lives
    pub fn exclusive(&self) -> ExclusiveReader<'_> {
        self.lock();
        ExclusiveReader { conn: self }
    }

    /// The request dispatcher: returns the next request from the inbound queue, suspending
    ///  while the connection is locked. Responses received while the connection is not locked
    ///  are discarded.
    pub async fn read_request(&self) -> Result<Request, ConnError> {
        loop {
            if self.is_closed() {
                return Err(ConnError::EndOfStream);
            }

            select! {
                _ = self.gate.unlocked() => {}
                _ = closed_signal(self.closed.subscribe()) => return Err(ConnError::EndOfStream),
            }

            let dequeued = select! {
                dequeued = self.dequeue_unless_locked() => dequeued,
                _ = self.gate.locked() => continue,
                _ = closed_signal(self.closed.subscribe()) => return Err(ConnError::EndOfStream),
            };

            match dequeued {
                Dequeued::EndOfStream => return Err(ConnError::EndOfStream),
                Dequeued::Requeued => continue,
                Dequeued::Unit(Inbound::Request(request)) => return Ok(request),
                Dequeued::Unit(Inbound::ParseError(e)) => return Err(ConnError::Parse(e)),
                Dequeued::Unit(Inbound::Response(response)) => {
                    //TODO should this go to whoever is waiting for it rather than being dropped?
                    warn!("{:?}: discarding {:?} received while the connection was not locked", self, response);
                }
            }
        }
    }

    async fn dequeue_unless_locked(&self) -> Dequeued {
        let mut queue = self.inbound.lock().await;
        match queue.next().await {
            None => Dequeued::EndOfStream,
            Some(unit) if self.gate.is_locked() => {
                trace!("connection was locked while dequeueing - handing back {}", unit);
                queue.requeue(unit);
                Dequeued::Requeued
            }
            Some(unit) => Dequeued::Unit(unit),
        }
    }

    /// Appends `buf` to the write buffer. Nothing is sent before [Connection::flush].
    pub async fn write(&self, buf: &[u8]) -> Result<usize, ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        self.write_buffer.lock().await
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Sends everything written since the previous flush, as a single datagram for UDP. The
    ///  write buffer is empty afterwards even if sending fails, so a failed message must be
    ///  written again to be retried.
    pub async fn flush(&self) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        let buf = self.write_buffer.lock().await
            .split()
            .freeze();

        trace!("{:?}: flushing {} bytes", self, buf.len());
        match &self.link {
            Link::Udp { registry, .. } => {
                let registry = registry.upgrade()
                    .ok_or(ConnError::RegistryGone(self.peer_addr))?;
                registry.send_datagram(self.peer_addr, &buf).await?;
            }
            Link::Tcp { writer } => {
                match writer.lock().await.as_mut() {
                    Some(writer) => writer.write_all(&buf).await?,
                    None => return Err(ConnError::Closed),
                }
            }
        }
        Ok(())
    }

    /// Hands a datagram received from the peer to this connection's transport reader. This is
    ///  the registry's side of UDP dispatch; datagrams for closed connections are dropped.
    ///
    /// This never waits: if the connection's datagram queue is full (typically because it is
    ///  locked and its holder does not read), the datagram is dropped so that other peers of
    ///  the same registry are not held up. Returns whether the datagram was queued.
    pub async fn deliver_datagram(&self, datagram: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }

        let datagrams = match &self.link {
            Link::Udp { datagrams, .. } => datagrams.lock().await,
            Link::Tcp { .. } => {
                warn!("{:?}: datagram delivered to a TCP connection - ignoring", self);
                return false;
            }
        };

        match datagrams.as_ref().map(|sender| sender.try_send(datagram)) {
            Some(Ok(())) => true,
            Some(Err(TrySendError::Full(_))) => {
                warn!("{:?}: datagram queue is full - dropping datagram", self);
                false
            }
            Some(Err(TrySendError::Closed(_))) | None => {
                trace!("{:?}: reader is gone, dropping datagram", self);
                false
            }
        }
    }

    /// Closes the connection. This is idempotent and safe to call concurrently: only the first
    ///  call has an effect.
    ///
    /// Pending and future reads return end-of-stream, writes fail. A UDP connection removes
    ///  itself from its registry, a TCP connection shuts down its stream.
    pub async fn close(&self) -> Result<(), ConnError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        debug!("closing {:?}", self);

        match &self.link {
            Link::Udp { registry, datagrams } => {
                if let Some(registry) = registry.upgrade() {
                    registry.deregister(self.peer_addr).await;
                }
                datagrams.lock().await.take();
                Ok(())
            }
            Link::Tcp { writer } => {
                // dropping the write half releases the socket once the reader is gone as well
                if let Some(mut writer) = writer.lock().await.take() {
                    writer.shutdown().await?;
                }
                Ok(())
            }
        }
    }

    pub async fn remember_branch(&self, branch: &str) {
        self.branches.remember(branch).await;
    }

    /// Whether `branch` was remembered on this connection and has not expired yet
    pub async fn has_seen_branch(&self, branch: &str) -> bool {
        self.branches.contains(branch).await
    }
}

/// Holds a connection locked, unlocking it when dropped
pub struct ExclusiveReader<'a> {
    conn: &'a Connection,
}
impl ExclusiveReader<'_> {
    pub async fn read(&self) -> Option<Inbound> {
        self.conn.read().await
    }
}
impl Drop for ExclusiveReader<'_> {
    fn drop(&mut self) {
        self.conn.unlock();
    }
}
