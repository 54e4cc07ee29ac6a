use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Capacity of the queue of decoded messages between a connection's transport reader and
    ///  its consumer. A full queue suspends the reader, i.e. applies back pressure to the
    ///  transport (TCP) or lets the datagram queue fill up (UDP).
    pub inbound_queue_len: usize,

    /// Capacity of the queue of raw datagrams that the listener hands to a UDP connection.
    ///  Datagrams arriving while it is full are dropped, so that a connection nobody reads
    ///  does not hold up the listener's other peers.
    pub datagram_queue_len: usize,

    /// Minimum time a remembered branch is kept. The janitor removes it on the first run
    ///  after this has elapsed, so the effective lifetime is up to
    ///  `branch_ttl + branch_janitor_interval`.
    pub branch_ttl: Duration,
    pub branch_janitor_interval: Duration,

    /// Upper bound for the body of a single decoded message
    pub max_message_size: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            inbound_queue_len: 64,
            datagram_queue_len: 64,
            branch_ttl: Duration::from_secs(30),
            branch_janitor_interval: Duration::from_secs(10),
            max_message_size: 64*1024,
        }
    }
}

impl ConnConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.inbound_queue_len == 0 {
            bail!("inbound queue length must be positive");
        }
        if self.datagram_queue_len == 0 {
            bail!("datagram queue length must be positive");
        }
        if self.branch_janitor_interval.is_zero() {
            bail!("branch janitor interval must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// The address that both the shared UDP socket and the TCP listener are bound to. If the
    ///  port is 0, the UDP socket picks a port and TCP is bound to the same one.
    pub bind_addr: SocketAddr,

    pub conn: ConnConfig,

    pub max_datagram_size: usize,

    /// Capacity of the queue of requests from all connections, see
    ///  [crate::listener::Listener::accept_request]
    pub request_queue_len: usize,

    /// UDP has no notion of a peer going away. If this is set, UDP connections without inbound
    ///  traffic for this long are closed.
    pub udp_idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> ListenerConfig {
        ListenerConfig {
            bind_addr,
            conn: ConnConfig::default(),
            max_datagram_size: 65535,
            request_queue_len: 256,
            udp_idle_timeout: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.conn.validate()?;

        if self.max_datagram_size < 4 {
            bail!("max datagram size is too small");
        }
        if self.request_queue_len == 0 {
            bail!("request queue length must be positive");
        }
        if let Some(timeout) = self.udp_idle_timeout {
            if timeout.is_zero() {
                bail!("UDP idle timeout must be positive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        let config = ListenerConfig::new("127.0.0.1:5060".parse().unwrap());
        assert!(config.validate().is_ok());
        assert_eq!(config.conn.branch_ttl, Duration::from_secs(30));
        assert_eq!(config.conn.branch_janitor_interval, Duration::from_secs(10));
    }

    #[rstest]
    #[case::inbound_queue(|c: &mut ListenerConfig| c.conn.inbound_queue_len = 0)]
    #[case::datagram_queue(|c: &mut ListenerConfig| c.conn.datagram_queue_len = 0)]
    #[case::janitor_interval(|c: &mut ListenerConfig| c.conn.branch_janitor_interval = Duration::ZERO)]
    #[case::datagram_size(|c: &mut ListenerConfig| c.max_datagram_size = 3)]
    #[case::request_queue(|c: &mut ListenerConfig| c.request_queue_len = 0)]
    #[case::idle_timeout(|c: &mut ListenerConfig| c.udp_idle_timeout = Some(Duration::ZERO))]
    fn test_invalid(#[case] tweak: fn(&mut ListenerConfig)) {
        let mut config = ListenerConfig::new("127.0.0.1:5060".parse().unwrap());
        tweak(&mut config);
        assert!(config.validate().is_err());
    }
}
