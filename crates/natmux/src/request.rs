//! Tunnel request descriptor negotiated when a control connection opens
//!
//! Wire layout (big-endian):
//! ```text
//! +-------------+--------------+-----------------+-----------+----------------+---------+
//! | Protocol(1) | LocalPort(4) | LocalAddrLen(4) | LocalAddr | OptionsLen(4)  | Options |
//! +-------------+--------------+-----------------+-----------+----------------+---------+
//! ```
//!
//! Options are `key=value` pairs joined by `&`, form-urlencoded so arbitrary
//! strings survive the trip.

use crate::error::{Result, TunnelError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved option keys
pub mod options {
    /// Public TCP port to bind; `0` or absent asks the server to pick one
    pub const REMOTE_PORT: &str = "remotePort";
    /// Virtual host for HTTP/HTTPS tunnels
    pub const VHOST: &str = "vhost";
    /// Authentication token
    pub const TOKEN: &str = "token";
    /// `Name:Value` rules separated by `;` replacing request headers
    pub const PROXY_SET_HEADERS: &str = "proxySetHeaders";
    /// `Name:Value` rules separated by `;` appended to request headers
    pub const PROXY_ADD_HEADERS: &str = "proxyAddHeaders";
    /// Basic auth user name required on the vhost
    pub const BASIC_AUTH_USERNAME: &str = "basicAuthUsername";
    /// Basic auth password required on the vhost
    pub const BASIC_AUTH_PASSWORD: &str = "basicAuthPassword";
}

/// Kind of public endpoint a tunnel exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    /// Raw TCP on a dedicated public port
    #[default]
    Tcp,
    /// Plain HTTP on the shared HTTP listener, routed by vhost
    Http,
    /// HTTPS on the shared HTTPS listener, routed by vhost
    Https,
}

impl TunnelProtocol {
    /// Convert to wire format byte
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Tcp => 1,
            Self::Http => 2,
            Self::Https => 3,
        }
    }

    /// Parse from wire format byte
    ///
    /// # Errors
    ///
    /// Returns an error if the byte is not 1, 2 or 3.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Tcp),
            2 => Ok(Self::Http),
            3 => Ok(Self::Https),
            _ => Err(TunnelError::protocol(format!(
                "unknown tunnel protocol: {byte}"
            ))),
        }
    }

    /// Whether tunnels of this kind are routed by virtual host
    #[must_use]
    pub const fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "TCP",
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
        })
    }
}

/// Immutable description of what a client wants exposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Public endpoint kind
    pub protocol: TunnelProtocol,
    /// Address of the private service, as seen by the client
    pub local_addr: String,
    /// Port of the private service
    pub local_port: u16,
    /// Ordered open-ended options, see [`options`]
    pub options: IndexMap<String, String>,
}

impl TunnelRequest {
    /// Create a request with no options
    #[must_use]
    pub fn new(protocol: TunnelProtocol, local_addr: impl Into<String>, local_port: u16) -> Self {
        Self {
            protocol,
            local_addr: local_addr.into(),
            local_port,
            options: IndexMap::new(),
        }
    }

    /// Create a TCP request
    #[must_use]
    pub fn tcp(local_addr: impl Into<String>, local_port: u16) -> Self {
        Self::new(TunnelProtocol::Tcp, local_addr, local_port)
    }

    /// Create an HTTP request
    #[must_use]
    pub fn http(local_addr: impl Into<String>, local_port: u16) -> Self {
        Self::new(TunnelProtocol::Http, local_addr, local_port)
    }

    /// Set an option, replacing any previous value
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_option(key, value);
        self
    }

    /// Set the public port
    #[must_use]
    pub fn with_remote_port(self, port: u16) -> Self {
        self.with_option(options::REMOTE_PORT, port.to_string())
    }

    /// Set the virtual host
    #[must_use]
    pub fn with_vhost(self, vhost: impl Into<String>) -> Self {
        self.with_option(options::VHOST, vhost)
    }

    /// Set the authentication token
    #[must_use]
    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.with_option(options::TOKEN, token)
    }

    /// Set an option in place
    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }

    /// Look up an option
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Requested public port; `None` when absent or unparsable
    #[must_use]
    pub fn remote_port(&self) -> Option<u16> {
        self.option(options::REMOTE_PORT)
            .and_then(|p| p.trim().parse().ok())
    }

    /// Requested virtual host
    #[must_use]
    pub fn vhost(&self) -> Option<&str> {
        self.option(options::VHOST).filter(|v| !v.is_empty())
    }

    /// Authentication token
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.option(options::TOKEN)
    }

    /// `host:port` of the private service
    #[must_use]
    pub fn local_target(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }

    /// Serialize to the wire layout
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Bytes {
        let options = self.encode_options();
        let addr = self.local_addr.as_bytes();

        let mut buf = BytesMut::with_capacity(1 + 4 + 4 + addr.len() + 4 + options.len());
        buf.put_u8(self.protocol.to_byte());
        buf.put_u32(u32::from(self.local_port));
        buf.put_u32(addr.len() as u32);
        buf.put_slice(addr);
        buf.put_u32(options.len() as u32);
        buf.put_slice(options.as_bytes());
        buf.freeze()
    }

    fn encode_options(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.options {
            if !key.is_empty() {
                serializer.append_pair(key, value);
            }
        }
        serializer.finish()
    }

    /// Parse the wire layout
    ///
    /// # Errors
    ///
    /// Returns a protocol error on truncated input, an unknown protocol byte,
    /// a port above 65535 or a non UTF-8 address.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;

        if buf.remaining() < 9 {
            return Err(TunnelError::protocol("TunnelRequest: too short"));
        }
        let protocol = TunnelProtocol::from_byte(buf.get_u8())?;
        let raw_port = buf.get_u32();
        let local_port = u16::try_from(raw_port).map_err(|_| {
            TunnelError::protocol(format!("TunnelRequest: local port out of range: {raw_port}"))
        })?;

        let local_addr = take_string(&mut buf, "local address")?;
        if buf.remaining() < 4 {
            return Err(TunnelError::protocol(
                "TunnelRequest: missing options length",
            ));
        }
        let options_raw = take_bytes(&mut buf, "options")?;

        let options = url::form_urlencoded::parse(options_raw)
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        Ok(Self {
            protocol,
            local_addr,
            local_port,
            options,
        })
    }
}

fn take_bytes<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if buf.remaining() < 4 {
        return Err(TunnelError::protocol(format!(
            "TunnelRequest: missing {what} length"
        )));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(TunnelError::protocol(format!(
            "TunnelRequest: {what} truncated, need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    let (value, rest) = buf.split_at(len);
    *buf = rest;
    Ok(value)
}

fn take_string(buf: &mut &[u8], what: &str) -> Result<String> {
    let raw = take_bytes(buf, what)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| TunnelError::protocol(format!("TunnelRequest: {what} is not UTF-8")))
}

impl fmt::Display for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TunnelRequest{{protocol={}, local={}:{}, options={{",
            self.protocol, self.local_addr, self.local_port
        )?;
        for (i, (key, value)) in self.options.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}}")
    }
}
