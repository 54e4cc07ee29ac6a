use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, UdpSocket};
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

use crate::config::ListenerConfig;
use crate::connection::{closed_signal, ConnError, Connection};
use crate::message::Request;
use crate::transport::{DatagramRegistry, TransportKind};

/// A request received on one of the listener's connections, with the connection to answer on
pub struct IncomingRequest {
    pub conn: Arc<Connection>,
    pub request: Request,
}
impl Debug for IncomingRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IncomingRequest{{{:?} from {:?}}}", self.request, self.conn)
    }
}

/// The Listener owns a UDP socket that is shared by all UDP connections, and a TCP listener
///  on the same address.
///
/// It keeps a pool of UDP connections by peer address and routes each inbound datagram to the
///  connection for its sender, creating the connection when a peer is seen for the first time.
///  Every connection gets a request dispatcher, and the requests of all connections are
///  available through [Listener::accept_request].
pub struct Listener {
    config: ListenerConfig,
    local_addr: SocketAddr,
    udp_socket: Arc<UdpSocket>,
    udp_connections: RwLock<FxHashMap<SocketAddr, Arc<Connection>>>,
    tcp_connections: Mutex<Vec<Weak<Connection>>>,
    requests_tx: mpsc::Sender<IncomingRequest>,
    requests_rx: Mutex<mpsc::Receiver<IncomingRequest>>,
    closed: watch::Sender<bool>,
}
impl Debug for Listener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener{{{}}}", self.local_addr)
    }
}

impl Listener {
    pub async fn bind(config: ListenerConfig) -> anyhow::Result<Arc<Listener>> {
        config.validate()?;

        let udp_socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = udp_socket.local_addr()?;
        // the UDP socket resolves port 0, TCP goes to the same port
        let tcp_listener = TcpListener::bind(local_addr).await?;
        info!("listening on {} (UDP and TCP)", local_addr);

        let (requests_tx, requests_rx) = mpsc::channel(config.request_queue_len);
        let (closed, _) = watch::channel(false);

        let listener = Arc::new(Listener {
            config,
            local_addr,
            udp_socket: udp_socket.clone(),
            udp_connections: Default::default(),
            tcp_connections: Default::default(),
            requests_tx,
            requests_rx: Mutex::new(requests_rx),
            closed,
        });

        tokio::spawn(udp_receive_loop(Arc::downgrade(&listener), udp_socket, listener.config.max_datagram_size, listener.closed.subscribe()));
        tokio::spawn(tcp_accept_loop(Arc::downgrade(&listener), tcp_listener, listener.closed.subscribe()));
        if let Some(idle_timeout) = listener.config.udp_idle_timeout {
            tokio::spawn(reap_idle_udp_connections(Arc::downgrade(&listener), idle_timeout, listener.closed.subscribe()));
        }

        Ok(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn udp_connection_count(&self) -> usize {
        self.udp_connections.read().await
            .len()
    }

    /// Returns the next request received on any of the listener's connections, or `None` after
    ///  the listener is closed
    pub async fn accept_request(&self) -> Option<IncomingRequest> {
        if self.is_closed() {
            return None;
        }

        select! {
            request = async { self.requests_rx.lock().await.recv().await } => request,
            _ = closed_signal(self.closed.subscribe()) => None,
        }
    }

    /// Returns a connection to `peer_addr`. For UDP, this is the pooled connection if there is
    ///  one, for TCP a new stream is connected.
    pub async fn dial(self: &Arc<Self>, kind: TransportKind, peer_addr: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        if self.is_closed() {
            bail!("listener is closed");
        }

        match kind {
            TransportKind::Udp => Ok(self.udp_connection_for(peer_addr).await),
            TransportKind::Tcp => {
                let conn = Connection::dial_tcp(peer_addr, &self.config.conn).await?;
                self.add_tcp_connection(conn.clone()).await;
                Ok(conn)
            }
        }
    }

    /// Stops the listener's loops and closes its connections. Calling this more than once has
    ///  no additional effect.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        info!("closing listener on {}", self.local_addr);

        let udp_connections = self.udp_connections.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for conn in udp_connections {
            if let Err(e) = conn.close().await {
                debug!("error closing {:?}: {}", conn, e);
            }
        }

        let tcp_connections = self.tcp_connections.lock().await
            .drain(..)
            .collect::<Vec<_>>();
        for conn in tcp_connections.iter().filter_map(Weak::upgrade) {
            if let Err(e) = conn.close().await {
                debug!("error closing {:?}: {}", conn, e);
            }
        }
    }

    async fn udp_connection_for(self: &Arc<Self>, peer_addr: SocketAddr) -> Arc<Connection> {
        {
            // trying with a read lock first is an optimization for the common case
            if let Some(conn) = self.udp_connections.read().await
                .get(&peer_addr)
            {
                return conn.clone();
            }
        }

        let mut udp_connections = self.udp_connections.write().await;
        // check again now that we have the exclusive lock to avoid racy initialization
        if let Some(conn) = udp_connections.get(&peer_addr) {
            return conn.clone();
        }

        let registry: Weak<Listener> = Arc::downgrade(self);
        let conn = Connection::new_udp(peer_addr, registry, &self.config.conn);
        udp_connections.insert(peer_addr, conn.clone());
        drop(udp_connections);

        self.spawn_dispatcher(conn.clone());
        conn
    }

    async fn add_tcp_connection(&self, conn: Arc<Connection>) {
        {
            let mut tcp_connections = self.tcp_connections.lock().await;
            tcp_connections.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
            tcp_connections.push(Arc::downgrade(&conn));
        }
        self.spawn_dispatcher(conn);
    }

    fn spawn_dispatcher(&self, conn: Arc<Connection>) {
        let span = info_span!("dispatcher", transport = %conn.transport(), peer = %conn.addr());
        tokio::spawn(dispatch_requests(conn, self.requests_tx.clone(), self.closed.subscribe()).instrument(span));
    }
}

#[async_trait]
impl DatagramRegistry for Listener {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> std::io::Result<()> {
        trace!("sending {} bytes to {}", buf.len(), to);
        self.udp_socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn deregister(&self, peer_addr: SocketAddr) {
        trace!("deregistering UDP connection to {}", peer_addr);
        self.udp_connections.write().await
            .remove(&peer_addr);
    }
}

/// Forwards the requests of a single connection to the listener-wide request queue until the
///  connection is closed. If the listener is closed or dropped first, this closes the connection.
async fn dispatch_requests(conn: Arc<Connection>, requests: mpsc::Sender<IncomingRequest>, listener_closed: watch::Receiver<bool>) {
    loop {
        let result = select! {
            result = conn.read_request() => result,
            _ = closed_signal(listener_closed.clone()) => {
                close_orphaned(&conn).await;
                break;
            }
        };

        match result {
            Ok(request) => {
                trace!("dispatching {:?}", request);
                if requests.send(IncomingRequest { conn: conn.clone(), request }).await.is_err() {
                    close_orphaned(&conn).await;
                    break;
                }
            }
            Err(ConnError::Parse(e)) => {
                warn!("skipping unparsable message: {}", e);
            }
            Err(e) => {
                debug!("stopping dispatcher: {}", e);
                break;
            }
        }
    }
}

async fn close_orphaned(conn: &Connection) {
    debug!("listener is gone, closing {:?}", conn);
    if let Err(e) = conn.close().await {
        debug!("error closing {:?}: {}", conn, e);
    }
}

#[instrument(name = "udp_receive_loop", skip_all)]
async fn udp_receive_loop(listener: Weak<Listener>, socket: Arc<UdpSocket>, max_datagram_size: usize, closed: watch::Receiver<bool>) {
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        let (len, from) = select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    error!("error receiving from UDP socket: {}", e);
                    continue;
                }
            },
            _ = closed_signal(closed.clone()) => break,
        };
        trace!("received {} bytes from {}", len, from);

        let conn = match listener.upgrade() {
            Some(listener) => listener.udp_connection_for(from).await,
            None => break,
        };
        // a full queue drops the datagram rather than holding up the other peers
        conn.deliver_datagram(Bytes::copy_from_slice(&buf[..len])).await;
    }
    debug!("UDP receive loop stopped");
}

#[instrument(name = "tcp_accept_loop", skip_all)]
async fn tcp_accept_loop(listener: Weak<Listener>, tcp_listener: TcpListener, closed: watch::Receiver<bool>) {
    loop {
        let (stream, addr) = select! {
            result = tcp_listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("error accepting TCP connection: {}", e);
                    continue;
                }
            },
            _ = closed_signal(closed.clone()) => break,
        };

        let listener = match listener.upgrade() {
            Some(listener) => listener,
            None => break,
        };
        match Connection::new_tcp(stream, &listener.config.conn) {
            Ok(conn) => {
                debug!("accepted TCP connection from {}", addr);
                listener.add_tcp_connection(conn).await;
            }
            Err(e) => warn!("error setting up TCP connection from {}: {}", addr, e),
        }
    }
    debug!("TCP accept loop stopped");
}

#[instrument(name = "udp_idle_reaper", skip_all)]
async fn reap_idle_udp_connections(listener: Weak<Listener>, idle_timeout: Duration, closed: watch::Receiver<bool>) {
    loop {
        select! {
            _ = sleep(idle_timeout / 2) => {}
            _ = closed_signal(closed.clone()) => break,
        }

        let listener = match listener.upgrade() {
            Some(listener) => listener,
            None => break,
        };
        let idle = listener.udp_connections.read().await
            .values()
            .filter(|conn| conn.last_activity().elapsed() >= idle_timeout)
            .cloned()
            .collect::<Vec<_>>();

        for conn in idle {
            debug!("closing idle {:?}", conn);
            if let Err(e) = conn.close().await {
                debug!("error closing {:?}: {}", conn, e);
            }
        }
    }
}
