use std::io::ErrorKind;
use std::sync::Weak;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::connection::{closed_signal, Connection};
use crate::message::{Framing, Inbound};

/// A UDP keep-alive probe. It is answered with a single CRLF and never decoded.
pub const KEEP_ALIVE_PING: &[u8] = b"\r\n\r\n";
pub const KEEP_ALIVE_PONG: &[u8] = b"\r\n";

/// Decodes datagrams that the registry delivered to a UDP connection, until the connection
///  is closed or dropped
pub(crate) async fn udp_reader(conn: Weak<Connection>, mut datagrams: mpsc::Receiver<Bytes>, inbound: mpsc::Sender<Inbound>, closed: watch::Receiver<bool>, max_message_size: usize) {
    loop {
        let datagram = select! {
            datagram = datagrams.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
            _ = closed_signal(closed.clone()) => break,
        };

        match conn.upgrade() {
            Some(conn) => {
                conn.touch();
                if datagram.as_ref() == KEEP_ALIVE_PING {
                    trace!("keep-alive ping");
                    if let Err(e) = answer_keep_alive(&conn).await {
                        debug!("error answering keep-alive ping: {}", e);
                    }
                    continue;
                }
            }
            None => break,
        }

        let mut source = datagram.as_ref();
        let unit = Inbound::decode(&datagram, &mut source, Framing::Datagram, max_message_size).await;
        trace!("received {}", unit);

        select! {
            result = inbound.send(unit) => if result.is_err() { break },
            _ = closed_signal(closed.clone()) => break,
        }
    }
    debug!("UDP reader stopped");
}

async fn answer_keep_alive(conn: &Connection) -> anyhow::Result<()> {
    conn.write(KEEP_ALIVE_PONG).await?;
    conn.flush().await?;
    Ok(())
}

/// Decodes the stream of a TCP connection message by message. A failure to read the start
///  of a message - including the peer closing the stream - closes the connection.
pub(crate) async fn tcp_reader(conn: Weak<Connection>, mut stream: BufReader<OwnedReadHalf>, inbound: mpsc::Sender<Inbound>, closed: watch::Receiver<bool>, max_message_size: usize) {
    loop {
        let unit = select! {
            unit = read_tcp_message(&mut stream, max_message_size) => unit,
            _ = closed_signal(closed.clone()) => break,
        };

        let unit = match unit {
            Ok(unit) => unit,
            Err(e) => {
                if e.kind() == ErrorKind::UnexpectedEof {
                    debug!("peer closed the stream");
                }
                else {
                    warn!("error reading from stream, closing connection: {}", e);
                }

                if let Some(conn) = conn.upgrade() {
                    if let Err(e) = conn.close().await {
                        debug!("error closing connection: {}", e);
                    }
                }
                break;
            }
        };
        trace!("received {}", unit);

        select! {
            result = inbound.send(unit) => if result.is_err() { break },
            _ = closed_signal(closed.clone()) => break,
        }
    }
    debug!("TCP reader stopped");
}

/// Sniffs the first three bytes to decide between request and response, and then decodes
///  from those bytes followed by the rest of the stream. Decode failures are returned as
///  [Inbound::ParseError], only a failure to read the three bytes is an error.
async fn read_tcp_message<R: AsyncBufRead + Unpin>(stream: &mut R, max_message_size: usize) -> std::io::Result<Inbound> {
    let mut prefix = [0u8; 3];
    stream.read_exact(&mut prefix).await?;

    let mut source = (&prefix[..]).chain(&mut *stream);
    Ok(Inbound::decode(&prefix, &mut source, Framing::Stream, max_message_size).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::request(b"INVITE sip:bob@example.com SIP/2.0\r\n\r\n", "request")]
    #[case::response(b"SIP/2.0 200 OK\r\n\r\n", "response")]
    #[case::garbage(b"SIP/2.0 INVITE\r\n\r\n", "error")]
    #[case::truncated(b"INV", "error")]
    #[tokio::test]
    async fn test_read_tcp_message(#[case] bytes: &[u8], #[case] expected: &str) {
        let mut stream = bytes;
        let unit = read_tcp_message(&mut stream, 1024).await.unwrap();
        let actual = match unit {
            Inbound::Request(_) => "request",
            Inbound::Response(_) => "response",
            Inbound::ParseError(_) => "error",
        };
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_read_tcp_message_eof() {
        let mut stream: &[u8] = b"SI";
        let e = read_tcp_message(&mut stream, 1024).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::UnexpectedEof);

        let mut stream: &[u8] = b"";
        let e = read_tcp_message(&mut stream, 1024).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_tcp_message_leaves_next_message_in_stream() {
        let mut stream: &[u8] = b"SIP/2.0 100 Trying\r\nContent-Length: 2\r\n\r\nokBYE sip:a@b SIP/2.0\r\n\r\n";

        match read_tcp_message(&mut stream, 1024).await.unwrap() {
            Inbound::Response(r) => assert_eq!(r.body.as_ref(), b"ok"),
            other => panic!("unexpected {}", other),
        }
        match read_tcp_message(&mut stream, 1024).await.unwrap() {
            Inbound::Request(r) => assert_eq!(r.method, "BYE"),
            other => panic!("unexpected {}", other),
        }
        assert!(stream.is_empty());
    }
}
