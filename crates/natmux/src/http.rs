//! Minimal HTTP/1.x message handling for vhost routing
//!
//! Only request heads are parsed; bodies are relayed as opaque bytes with
//! just enough framing knowledge to find where one request ends.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Largest request head accepted
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest number of request headers accepted
pub const MAX_HEADERS: usize = 100;

/// Why a request head could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadError {
    /// Syntax error
    Malformed(String),
    /// Head larger than [`MAX_HEAD_SIZE`] or too many headers
    TooLarge,
}

impl fmt::Display for HeadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(reason) => write!(f, "malformed request head: {reason}"),
            Self::TooLarge => f.write_str("request head too large"),
        }
    }
}

impl std::error::Error for HeadError {}

/// How the body following a request head is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body
    Empty,
    /// Exactly this many bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Protocol switch; everything after the head is opaque
    Tunnel,
}

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    /// Request method
    pub method: String,
    /// Request target
    pub path: String,
    /// Minor version (`1` for HTTP/1.1)
    pub version: u8,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
}

impl HttpRequestHead {
    /// Parse a head from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the head is incomplete, otherwise the head
    /// and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError`] on syntax errors or oversized heads.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let head = Self {
                    method: req.method.unwrap_or_default().to_string(),
                    path: req.path.unwrap_or_default().to_string(),
                    version: req.version.unwrap_or(1),
                    headers: req
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect(),
                };
                Ok(Some((head, len)))
            }
            Ok(httparse::Status::Partial) if buf.len() >= MAX_HEAD_SIZE => {
                Err(HeadError::TooLarge)
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(httparse::Error::TooManyHeaders) => Err(HeadError::TooLarge),
            Err(e) => Err(HeadError::Malformed(e.to_string())),
        }
    }

    /// First value of a header, case-insensitive
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every value of a header with a single one
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    /// Append a header value
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    /// Remove every value of a header
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Routing key from the `Host` header: lowercased, port stripped
    #[must_use]
    pub fn host(&self) -> Option<String> {
        self.header("host").map(normalize_host).filter(|h| !h.is_empty())
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// How the request body is delimited
    #[must_use]
    pub fn body_kind(&self) -> BodyKind {
        if self.method.eq_ignore_ascii_case("CONNECT")
            || (self.header_has_token("connection", "upgrade") && self.header("upgrade").is_some())
        {
            return BodyKind::Tunnel;
        }
        if self.header_has_token("transfer-encoding", "chunked") {
            return BodyKind::Chunked;
        }
        match self
            .header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            Some(0) | None => BodyKind::Empty,
            Some(len) => BodyKind::Length(len),
        }
    }

    /// Re-encode the request line and headers
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.path.as_bytes());
        buf.put_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

/// Lowercase a host and strip any `:port` suffix.
///
/// Bracketed IPv6 literals keep their brackets. A value with more than one
/// colon is a bare IPv6 address and is kept whole.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        host.find(']').map_or(host, |end| &host[..=end])
    } else {
        match host.split_once(':') {
            Some((name, port))
                if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                name
            }
            _ => host,
        }
    };
    without_port.to_ascii_lowercase()
}

/// Response generated by the proxy itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Extra headers; `Content-Length` and `Connection` are added on encode
    pub headers: Vec<(String, String)>,
    /// Body
    pub body: Bytes,
}

impl HttpResponse {
    /// Plain text response
    #[must_use]
    pub fn new(status: u16, reason: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.into(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 400 Bad Request
    #[must_use]
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request", "bad request\n")
    }

    /// 404 for a vhost nobody registered
    #[must_use]
    pub fn not_found(host: &str) -> Self {
        Self::new(404, "Not Found", format!("no tunnel for host {host}\n"))
    }

    /// 401 basic auth challenge
    #[must_use]
    pub fn unauthorized(realm: &str) -> Self {
        Self::new(401, "Unauthorized", "unauthorized\n")
            .with_header("WWW-Authenticate", format!("Basic realm=\"{realm}\""))
    }

    /// 431 Request Header Fields Too Large
    #[must_use]
    pub fn head_too_large() -> Self {
        Self::new(431, "Request Header Fields Too Large", "request head too large\n")
    }

    /// Encode as an HTTP/1.1 response that closes the connection
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            buf.put_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        buf.put_slice(b"Connection: close\r\n\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

// =============================================================================
// Chunked body scanner
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Extension,
    SizeLf,
    Data(u64),
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
    FinalLf,
    Done,
}

/// Finds the end of a chunked body without decoding it
#[derive(Debug, Clone)]
pub struct ChunkedScanner {
    state: ChunkState,
    size: u64,
    digits: bool,
}

impl Default for ChunkedScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedScanner {
    /// Scanner positioned at the first chunk size line
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ChunkState::Size,
            size: 0,
            digits: false,
        }
    }

    /// Whether the terminating chunk and trailers were seen
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume body bytes; returns how many belong to this body.
    ///
    /// Stops early once the body is complete.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::Malformed`] on invalid chunk syntax.
    #[allow(clippy::cast_possible_truncation)]
    pub fn feed(&mut self, buf: &[u8]) -> Result<usize, HeadError> {
        let mut pos = 0;
        while pos < buf.len() && self.state != ChunkState::Done {
            if let ChunkState::Data(remaining) = self.state {
                let take = remaining.min((buf.len() - pos) as u64);
                pos += take as usize;
                self.state = if take == remaining {
                    ChunkState::DataCr
                } else {
                    ChunkState::Data(remaining - take)
                };
                continue;
            }

            let byte = buf[pos];
            pos += 1;
            self.state = self.step(byte)?;
        }
        Ok(pos)
    }

    fn step(&mut self, byte: u8) -> Result<ChunkState, HeadError> {
        let next = match (self.state, byte) {
            (ChunkState::Size, b) if b.is_ascii_hexdigit() => {
                let digit = u64::from(hex_value(b));
                self.size = self
                    .size
                    .checked_mul(16)
                    .and_then(|v| v.checked_add(digit))
                    .ok_or_else(|| HeadError::Malformed("chunk size overflow".into()))?;
                self.digits = true;
                ChunkState::Size
            }
            (ChunkState::Size, b';' | b' ' | b'\t') if self.digits => ChunkState::Extension,
            (ChunkState::Size, b'\r') if self.digits => ChunkState::SizeLf,
            (ChunkState::Extension, b'\r') => ChunkState::SizeLf,
            (ChunkState::Extension, _) => ChunkState::Extension,
            (ChunkState::SizeLf, b'\n') => {
                let size = std::mem::take(&mut self.size);
                self.digits = false;
                if size == 0 {
                    ChunkState::TrailerStart
                } else {
                    ChunkState::Data(size)
                }
            }
            (ChunkState::DataCr, b'\r') => ChunkState::DataLf,
            (ChunkState::DataLf, b'\n') => ChunkState::Size,
            (ChunkState::TrailerStart, b'\r') => ChunkState::FinalLf,
            (ChunkState::TrailerLine, b'\r') => ChunkState::TrailerLf,
            (ChunkState::TrailerStart | ChunkState::TrailerLine, _) => ChunkState::TrailerLine,
            (ChunkState::TrailerLf, b'\n') => ChunkState::TrailerStart,
            (ChunkState::FinalLf, b'\n') => ChunkState::Done,
            (state, b) => {
                return Err(HeadError::Malformed(format!(
                    "unexpected byte 0x{b:02x} in chunked body ({state:?})"
                )))
            }
        };
        Ok(next)
    }
}

const fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}
