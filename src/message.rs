//! SIP message values and the byte-level decoder that turns a byte source into them.
//!
//! The decoder works on any [AsyncBufRead] and consumes exactly one message: start line,
//!  header lines up to the empty line, and then `Content-Length` bytes of body. It never reads
//!  past the end of the message, so the same source (e.g. a TCP stream) can be passed in again
//!  for the next message. The exception is a datagram without Content-Length, whose body is
//!  the rest of the datagram (see [Framing]).
//!
//! Status lines start with `SIP/`, request lines with the method. Which of the two is expected
//!  is decided by the caller; the decoder does not guess.

use std::fmt::{Debug, Display, Formatter};
use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// The first three bytes of every status line. Transport readers use this (and nothing else)
///  to decide whether to decode a response or a request.
pub const STATUS_LINE_PREFIX: &[u8; 3] = b"SIP";

const MAX_LINE_LEN: usize = 8*1024;
const MAX_NUM_HEADERS: usize = 256;

/// Single letter header names from RFC 3261 section 7.3.3 and their full form
const COMPACT_HEADER_NAMES: [(&str, &str); 10] = [
    ("c", "content-type"),
    ("e", "content-encoding"),
    ("f", "from"),
    ("i", "call-id"),
    ("k", "supported"),
    ("l", "content-length"),
    ("m", "contact"),
    ("s", "subject"),
    ("t", "to"),
    ("v", "via"),
];

fn full_header_name(name: &str) -> &str {
    COMPACT_HEADER_NAMES.iter()
        .find(|(compact, _)| compact.eq_ignore_ascii_case(name))
        .map(|(_, full)| *full)
        .unwrap_or(name)
}

fn is_same_header(a: &str, b: &str) -> bool {
    full_header_name(a).eq_ignore_ascii_case(full_header_name(b))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Header fields in the order they appear on the wire. Lookup is case insensitive and treats
///  compact and full header names as equivalent.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter()
            .find(|h| is_same_header(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.iter()
            .filter(move |h| is_same_header(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `None` if there is no Content-Length header
    pub fn content_length(&self) -> anyhow::Result<Option<usize>> {
        match self.get("content-length") {
            None => Ok(None),
            Some(s) => s.trim().parse()
                .map(Some)
                .map_err(|_| anyhow!("invalid Content-Length: {:?}", s)),
        }
    }

    /// The `branch` parameter of the top-most Via header
    pub fn branch(&self) -> Option<&str> {
        let top_via = self.get("via")?
            .split(',')
            .next()?;

        top_via.split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("branch"))
            .map(|(_, value)| value.trim())
    }

    fn encode(&self, buf: &mut BytesMut) {
        for header in &self.0 {
            buf.put_slice(header.name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(header.value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}
impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Request{{{} {} body:{}}}", self.method, self.uri, self.body.len())
    }
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.branch()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(format!("{} {} {}\r\n", self.method, self.uri, self.version).as_bytes());
        self.headers.encode(buf);
        buf.put_slice(&self.body);
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}
impl Debug for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Response{{{} {} body:{}}}", self.status, self.reason, self.body.len())
    }
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn branch(&self) -> Option<&str> {
        self.headers.branch()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes());
        self.headers.encode(buf);
        buf.put_slice(&self.body);
    }
}

/// How the end of a message without Content-Length is determined
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Framing {
    /// The body is empty, and the next message follows immediately
    Stream,
    /// The body runs to the end of the datagram
    Datagram,
}

/// A unit of the inbound queue. Transport readers decide on the kind once, consumers match
///  on it.
#[derive(Debug)]
pub enum Inbound {
    Request(Request),
    Response(Response),
    /// A message that could not be decoded. This is not fatal for the connection.
    ParseError(anyhow::Error),
}

impl Display for Inbound {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Inbound::Request(r) => write!(f, "request {} {}", r.method, r.uri),
            Inbound::Response(r) => write!(f, "response {} {}", r.status, r.reason),
            Inbound::ParseError(e) => write!(f, "parse error: {}", e),
        }
    }
}

impl Inbound {
    /// Decodes a response if `prefix` is the start of a status line, and a request otherwise
    pub async fn decode<R: AsyncBufRead + Unpin>(prefix: &[u8], source: &mut R, framing: Framing, max_body_len: usize) -> Inbound {
        if prefix.starts_with(STATUS_LINE_PREFIX) {
            match decode_response(source, framing, max_body_len).await {
                Ok(response) => Inbound::Response(response),
                Err(e) => Inbound::ParseError(e),
            }
        }
        else {
            match decode_request(source, framing, max_body_len).await {
                Ok(request) => Inbound::Request(request),
                Err(e) => Inbound::ParseError(e),
            }
        }
    }
}

pub async fn decode_request<R: AsyncBufRead + Unpin>(source: &mut R, framing: Framing, max_body_len: usize) -> anyhow::Result<Request> {
    let start_line = read_start_line(source).await?;

    let mut parts = start_line.splitn(3, ' ');
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(version)) => (method, uri, version),
        _ => bail!("malformed request line: {:?}", start_line),
    };
    if method.is_empty() || !method.bytes().all(is_token_char) {
        bail!("invalid method in request line: {:?}", start_line);
    }
    if uri.is_empty() {
        bail!("empty request URI: {:?}", start_line);
    }
    check_version(version)?;

    let headers = read_headers(source).await?;
    let body = read_body(source, &headers, framing, max_body_len).await?;

    Ok(Request {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
        body,
    })
}

pub async fn decode_response<R: AsyncBufRead + Unpin>(source: &mut R, framing: Framing, max_body_len: usize) -> anyhow::Result<Response> {
    let start_line = read_start_line(source).await?;

    let mut parts = start_line.splitn(3, ' ');
    let (version, status) = match (parts.next(), parts.next()) {
        (Some(version), Some(status)) => (version, status),
        _ => bail!("malformed status line: {:?}", start_line),
    };
    check_version(version)?;

    let status: u16 = match status.parse() {
        Ok(n) if status.len() == 3 && (100..700).contains(&n) => n,
        _ => bail!("invalid status code in status line: {:?}", start_line),
    };
    let reason = parts.next().unwrap_or("");

    let headers = read_headers(source).await?;
    let body = read_body(source, &headers, framing, max_body_len).await?;

    Ok(Response {
        version: version.to_string(),
        status,
        reason: reason.to_string(),
        headers,
        body,
    })
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b)
}

fn check_version(version: &str) -> anyhow::Result<()> {
    if !version.starts_with("SIP/") {
        bail!("unsupported protocol version {:?}", version);
    }
    Ok(())
}

/// Reads a line terminated by LF, returning it without the line terminator, or `None` at the
///  end of the source.
async fn read_line<R: AsyncBufRead + Unpin>(source: &mut R) -> anyhow::Result<Option<String>> {
    let mut buf = Vec::new();
    let num_read = (&mut *source)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut buf)
        .await?;

    if num_read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if num_read == MAX_LINE_LEN {
            bail!("line exceeds the maximum length of {} bytes", MAX_LINE_LEN);
        }
        bail!("unexpected end of stream inside a line");
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(String::from_utf8(buf)?))
}

async fn read_start_line<R: AsyncBufRead + Unpin>(source: &mut R) -> anyhow::Result<String> {
    // empty lines before a message are keep-alive noise, see RFC 3261 section 7.5
    loop {
        match read_line(source).await? {
            None => bail!("end of stream before start line"),
            Some(line) if line.is_empty() => continue,
            Some(line) => return Ok(line),
        }
    }
}

async fn read_headers<R: AsyncBufRead + Unpin>(source: &mut R) -> anyhow::Result<Headers> {
    let mut headers: Vec<Header> = Vec::new();

    loop {
        let line = match read_line(source).await? {
            None => bail!("end of stream inside header section"),
            Some(line) => line,
        };
        if line.is_empty() {
            return Ok(Headers(headers));
        }

        if line.starts_with(|c: char| c == ' ' || c == '\t') {
            // folded continuation of the previous header's value
            match headers.last_mut() {
                Some(prev) => {
                    prev.value.push(' ');
                    prev.value.push_str(line.trim());
                    continue;
                }
                None => bail!("continuation line without a header: {:?}", line),
            }
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => bail!("malformed header line: {:?}", line),
        };
        if name.is_empty() || !name.bytes().all(is_token_char) {
            bail!("invalid header name: {:?}", line);
        }

        if headers.len() == MAX_NUM_HEADERS {
            bail!("message has more than {} headers", MAX_NUM_HEADERS);
        }
        headers.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
}

async fn read_body<R: AsyncBufRead + Unpin>(source: &mut R, headers: &Headers, framing: Framing, max_body_len: usize) -> anyhow::Result<Bytes> {
    let content_length = match (headers.content_length()?, framing) {
        (Some(content_length), _) => content_length,
        (None, Framing::Stream) => 0,
        (None, Framing::Datagram) => return read_rest_of_datagram(source, max_body_len).await,
    };

    if content_length > max_body_len {
        bail!("message body of {} bytes exceeds the maximum of {} bytes", content_length, max_body_len);
    }
    if content_length == 0 {
        return Ok(Bytes::new());
    }

    let mut body = vec![0u8; content_length];
    source.read_exact(&mut body).await?;
    Ok(body.into())
}

/// RFC 3261 section 18.3: without Content-Length, the body of a datagram message runs to the
///  end of the datagram
async fn read_rest_of_datagram<R: AsyncBufRead + Unpin>(source: &mut R, max_body_len: usize) -> anyhow::Result<Bytes> {
    let mut body = Vec::new();
    (&mut *source)
        .take(max_body_len as u64 + 1)
        .read_to_end(&mut body)
        .await?;

    if body.len() > max_body_len {
        bail!("message body exceeds the maximum of {} bytes", max_body_len);
    }
    Ok(body.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MAX_BODY: usize = 1024;

    const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds\r\n\
        To: Bob <sip:bob@example.com>\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 314159 INVITE\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\n";

    #[tokio::test]
    async fn test_decode_request() {
        let mut source = INVITE;
        let request = decode_request(&mut source, Framing::Stream, MAX_BODY).await.unwrap();

        assert_eq!(request.method, "INVITE");
        assert_eq!(request.uri, "sip:bob@example.com");
        assert_eq!(request.version, "SIP/2.0");
        assert_eq!(request.headers.len(), 5);
        assert_eq!(request.header("call-id"), Some("a84b4c76e66710"));
        assert_eq!(request.header("CSEQ"), Some("314159 INVITE"));
        assert_eq!(request.branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(request.body.as_ref(), b"v=0\n");
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_decode_response() {
        let mut source: &[u8] = b"SIP/2.0 200 OK\r\nv: SIP/2.0/TCP a.example.com;received=1.2.3.4;branch=z9hG4bKabc\r\nl: 0\r\n\r\n";
        let response = decode_response(&mut source, Framing::Stream, MAX_BODY).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.header("via"), Some("SIP/2.0/TCP a.example.com;received=1.2.3.4;branch=z9hG4bKabc"));
        assert_eq!(response.branch(), Some("z9hG4bKabc"));
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_decode_consumes_exactly_one_message() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"\r\n\r\n");
        stream.extend_from_slice(INVITE);
        stream.extend_from_slice(b"BYE sip:bob@example.com SIP/2.0\r\nContent-Length: 0\r\n\r\n");
        stream.extend_from_slice(b"SIP/2.0 180 Ringing\r\n\r\n");

        let mut source = stream.as_slice();
        assert_eq!(decode_request(&mut source, Framing::Stream, MAX_BODY).await.unwrap().method, "INVITE");
        assert_eq!(decode_request(&mut source, Framing::Stream, MAX_BODY).await.unwrap().method, "BYE");
        assert_eq!(decode_response(&mut source, Framing::Stream, MAX_BODY).await.unwrap().status, 180);
        assert!(source.is_empty());
        assert!(decode_request(&mut source, Framing::Stream, MAX_BODY).await.is_err());
    }

    #[tokio::test]
    async fn test_folded_header() {
        let mut source: &[u8] = b"OPTIONS sip:a@b SIP/2.0\r\nSubject: I know you're there,\r\n  pick up the phone\r\n\r\n";
        let request = decode_request(&mut source, Framing::Stream, MAX_BODY).await.unwrap();
        assert_eq!(request.header("s"), Some("I know you're there, pick up the phone"));
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::only_blank_lines(b"\r\n\r\n")]
    #[case::two_parts(b"INVITE sip:bob@example.com\r\n\r\n")]
    #[case::bad_version(b"INVITE sip:bob@example.com HTTP/1.1\r\n\r\n")]
    #[case::bad_method(b"INV(TE sip:bob@example.com SIP/2.0\r\n\r\n")]
    #[case::status_line(b"SIP/2.0 200 OK\r\n\r\n")]
    #[case::no_header_end(b"INVITE sip:bob@example.com SIP/2.0\r\nTo: bob\r\n")]
    #[case::malformed_header(b"INVITE sip:bob@example.com SIP/2.0\r\nTo bob\r\n\r\n")]
    #[case::bad_content_length(b"INVITE sip:bob@example.com SIP/2.0\r\nContent-Length: x\r\n\r\n")]
    #[case::short_body(b"INVITE sip:bob@example.com SIP/2.0\r\nContent-Length: 10\r\n\r\nabc")]
    #[case::body_too_big(b"INVITE sip:bob@example.com SIP/2.0\r\nContent-Length: 1025\r\n\r\n")]
    #[case::leading_continuation(b"INVITE sip:bob@example.com SIP/2.0\r\n  x\r\n\r\n")]
    #[tokio::test]
    async fn test_decode_request_invalid(#[case] source: &[u8]) {
        let mut source = source;
        assert!(decode_request(&mut source, Framing::Stream, MAX_BODY).await.is_err());
    }

    #[rstest]
    #[case::request_line(b"INVITE sip:bob@example.com SIP/2.0\r\n\r\n")]
    #[case::non_numeric_status(b"SIP/2.0 OK\r\n\r\n")]
    #[case::status_out_of_range(b"SIP/2.0 700 Huh\r\n\r\n")]
    #[case::status_too_long(b"SIP/2.0 0200 OK\r\n\r\n")]
    #[case::missing_status(b"SIP/2.0\r\n\r\n")]
    #[tokio::test]
    async fn test_decode_response_invalid(#[case] source: &[u8]) {
        let mut source = source;
        assert!(decode_response(&mut source, Framing::Stream, MAX_BODY).await.is_err());
    }

    #[tokio::test]
    async fn test_response_without_reason() {
        let mut source: &[u8] = b"SIP/2.0 100\r\n\r\n";
        let response = decode_response(&mut source, Framing::Stream, MAX_BODY).await.unwrap();
        assert_eq!(response.status, 100);
        assert_eq!(response.reason, "");
    }

    #[rstest]
    #[case::response(b"SIP/2.0 200 OK\r\n\r\n", "response")]
    #[case::invite(b"INVITE sip:bob@example.com SIP/2.0\r\n\r\n", "request")]
    #[case::register(b"REGISTER sip:example.com SIP/2.0\r\n\r\n", "request")]
    #[case::garbage_as_request(b"xyz\r\n\r\n", "error")]
    #[case::status_line_without_sip_prefix(b"SIX/2.0 200 OK\r\n\r\n", "error")]
    #[tokio::test]
    async fn test_inbound_decode_dispatches_on_prefix(#[case] bytes: &[u8], #[case] expected: &str) {
        let mut source = bytes;
        let actual = match Inbound::decode(&bytes[..bytes.len().min(3)], &mut source, Framing::Stream, MAX_BODY).await {
            Inbound::Request(_) => "request",
            Inbound::Response(_) => "response",
            Inbound::ParseError(_) => "error",
        };
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::single("SIP/2.0/UDP h;branch=z9hG4bK1", Some("z9hG4bK1"))]
    #[case::first_of_list("SIP/2.0/UDP h;branch=z9hG4bK1, SIP/2.0/UDP g;branch=z9hG4bK2", Some("z9hG4bK1"))]
    #[case::case_insensitive("SIP/2.0/UDP h;rport;BRANCH = z9hG4bK3", Some("z9hG4bK3"))]
    #[case::none("SIP/2.0/UDP h;rport", None)]
    fn test_branch(#[case] via: &str, #[case] expected: Option<&str>) {
        let mut headers = Headers::new();
        headers.push("Via", via);
        assert_eq!(headers.branch(), expected);
    }

    #[tokio::test]
    async fn test_encode_decodes_to_same_request() {
        let mut source = INVITE;
        let request = decode_request(&mut source, Framing::Stream, MAX_BODY).await.unwrap();

        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        assert_eq!(buf.as_ref(), INVITE);
    }

    #[test]
    fn test_header_lookup_with_temporary_name() {
        let mut headers = Headers::new();
        headers.push("Call-ID", "a84b4c76e66710");
        headers.push("l", "12");

        let call_id = {
            let name = String::from("call-id");
            headers.get(&name)
        };
        assert_eq!(call_id, Some("a84b4c76e66710"));
        assert_eq!(headers.content_length().unwrap(), Some(12));
        assert_eq!(Headers::new().content_length().unwrap(), None);
    }

    #[rstest]
    #[case::datagram_runs_to_end(Framing::Datagram, b"MESSAGE sip:a@b SIP/2.0\r\n\r\nhello", Some(&b"hello"[..]))]
    #[case::stream_has_empty_body(Framing::Stream, b"MESSAGE sip:a@b SIP/2.0\r\n\r\nhello", Some(&b""[..]))]
    #[case::content_length_wins(Framing::Datagram, b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 3\r\n\r\nhello", Some(&b"hel"[..]))]
    #[case::datagram_too_big(Framing::Datagram, b"MESSAGE sip:a@b SIP/2.0\r\n\r\n01234567890", None)]
    #[tokio::test]
    async fn test_body_framing(#[case] framing: Framing, #[case] bytes: &[u8], #[case] expected: Option<&[u8]>) {
        let mut source = bytes;
        let body = decode_request(&mut source, framing, 10).await
            .ok()
            .map(|r| r.body);
        assert_eq!(body.as_deref(), expected);
    }
}
