use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(TransportKind::Udp)
        }
        else if s.eq_ignore_ascii_case("tcp") {
            Ok(TransportKind::Tcp)
        }
        else {
            Err(anyhow!("unsupported transport: {}", s))
        }
    }
}

/// This trait decouples UDP connections from the owner of the shared UDP socket. A connection
///  holds it as a `Weak<dyn ...>` back reference: the registry owns the socket and the
///  address-to-connection map, connections only borrow them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramRegistry: Send + Sync + 'static {
    /// Sends a single datagram through the shared socket. This is called concurrently by
    ///  all connections of the registry.
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> std::io::Result<()>;

    /// Removes the connection for `peer_addr`. A connection calls this exactly once, when it
    ///  is closed.
    async fn deregister(&self, peer_addr: SocketAddr);
}
