//! Configuration types for tunnel server and client

use crate::channel::ChannelSettings;
use crate::conn::Watermarks;
use crate::request::{options, TunnelProtocol, TunnelRequest};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Default value functions for serde
// =============================================================================

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4900))
}

const fn default_public_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port_range() -> (u16, u16) {
    (30000, 31000)
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(180)
}

const fn default_max_tunnels() -> usize {
    1000
}

const fn default_auto_reconnect() -> bool {
    true
}

const fn default_reconnect_delay() -> Duration {
    Duration::from_secs(3)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

// =============================================================================
// TLS material
// =============================================================================

/// Certificate chain and key for a server-side TLS listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
}

/// Client-side TLS settings for the control connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTls {
    /// PEM bundle of CAs trusted for the server certificate
    pub ca_path: PathBuf,
    /// Name to verify; defaults to the host part of `server_addr`
    #[serde(default)]
    pub server_name: Option<String>,
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Policy fed into the default request interceptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted tokens; empty accepts any request
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Inclusive port ranges TCP tunnels may bind; empty allows any
    #[serde(default)]
    pub allowed_ports: Vec<(u16, u16)>,
}

/// Server-side tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelServerConfig {
    /// Control listener address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// TLS for the control listener
    #[serde(default)]
    pub tls: Option<TlsFiles>,

    /// Shared HTTP listener for vhost tunnels
    #[serde(default)]
    pub http_bind: Option<SocketAddr>,

    /// Shared HTTPS listener for vhost tunnels
    #[serde(default)]
    pub https_bind: Option<SocketAddr>,

    /// Certificate served on the HTTPS listener
    #[serde(default)]
    pub https_tls: Option<TlsFiles>,

    /// Address TCP tunnel ports are bound on
    #[serde(default = "default_public_host")]
    pub public_host: IpAddr,

    /// Port range for auto-assigned TCP tunnels (inclusive)
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),

    /// Writer idle period before a PING is sent
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Reader idle period before a client is declared dead
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Maximum concurrent tunnels
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,

    /// Outbound queue thresholds for every connection
    #[serde(default)]
    pub watermarks: Watermarks,

    /// Default interceptor policy
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for TunnelServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            tls: None,
            http_bind: None,
            https_bind: None,
            https_tls: None,
            public_host: default_public_host(),
            port_range: default_port_range(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            max_tunnels: default_max_tunnels(),
            watermarks: Watermarks::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl TunnelServerConfig {
    /// Create a new server config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Timing and buffering for control connections
    #[must_use]
    pub const fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            watermarks: self.watermarks,
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `port_range` start > end or start < 1024
    /// - `heartbeat_timeout` <= `heartbeat_interval`
    /// - `max_tunnels` is 0
    /// - the watermarks are inconsistent
    /// - `https_bind` is set without `https_tls`
    pub fn validate(&self) -> Result<(), String> {
        let (start, end) = self.port_range;
        if start > end {
            return Err(format!("port_range start ({start}) must be <= end ({end})"));
        }

        if start < 1024 {
            return Err(format!(
                "port_range start ({start}) should be >= 1024 (privileged ports)"
            ));
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(format!(
                "heartbeat_timeout ({:?}) must be > heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            ));
        }

        if self.max_tunnels == 0 {
            return Err("max_tunnels must be > 0".to_string());
        }

        self.watermarks.validate()?;

        if self.https_bind.is_some() && self.https_tls.is_none() {
            return Err("https_bind requires https_tls".to_string());
        }

        for (i, (lo, hi)) in self.auth.allowed_ports.iter().enumerate() {
            if lo > hi {
                return Err(format!("auth.allowed_ports[{i}]: {lo} > {hi}"));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Client-side tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelClientConfig {
    /// Server control address (`host:port`)
    pub server_addr: String,

    /// TLS for the control connection
    #[serde(default)]
    pub tls: Option<ClientTls>,

    /// Reconnect after transient failures
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Writer idle period before a PING is sent
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Reader idle period before the server is declared dead
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Dial timeout for the server and for local services
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Outbound queue thresholds for every connection
    #[serde(default)]
    pub watermarks: Watermarks,

    /// Tunnels to open, one control connection each
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl TunnelClientConfig {
    /// Create a new client config
    #[must_use]
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            tls: None,
            auto_reconnect: default_auto_reconnect(),
            reconnect_delay: default_reconnect_delay(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            connect_timeout: default_connect_timeout(),
            watermarks: Watermarks::default(),
            tunnels: Vec::new(),
        }
    }

    /// Add a tunnel to the configuration
    #[must_use]
    pub fn with_tunnel(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnels.push(tunnel);
        self
    }

    /// Timing and buffering for the control connection
    #[must_use]
    pub const fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            watermarks: self.watermarks,
        }
    }

    /// Host part of `server_addr`, used as the default TLS name
    #[must_use]
    pub fn server_host(&self) -> &str {
        let addr = self.server_addr.as_str();
        if let Some(rest) = addr.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        addr.rsplit_once(':').map_or(addr, |(host, _)| host)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `server_addr` is empty or has no port
    /// - `heartbeat_timeout` <= `heartbeat_interval`
    /// - the watermarks are inconsistent
    /// - Any tunnel configuration is invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.server_addr.is_empty() {
            return Err("server_addr cannot be empty".to_string());
        }

        if !self
            .server_addr
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
        {
            return Err(format!(
                "server_addr must be host:port, got {}",
                self.server_addr
            ));
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(format!(
                "heartbeat_timeout ({:?}) must be > heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            ));
        }

        self.watermarks.validate()?;

        for (i, tunnel) in self.tunnels.iter().enumerate() {
            tunnel
                .validate()
                .map_err(|e| format!("tunnels[{i}]: {e}"))?;
        }

        Ok(())
    }
}

// =============================================================================
// Tunnel Configuration
// =============================================================================

/// Credentials the server enforces on an HTTP tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

/// One tunnel to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Label used in logs
    #[serde(default)]
    pub name: Option<String>,

    /// Public endpoint kind
    #[serde(default)]
    pub protocol: TunnelProtocol,

    /// Local service address
    #[serde(default = "default_local_addr")]
    pub local_addr: String,

    /// Local service port
    pub local_port: u16,

    /// Public port for TCP tunnels (absent or 0 = auto-assign)
    #[serde(default)]
    pub remote_port: Option<u16>,

    /// Virtual host for HTTP/HTTPS tunnels
    #[serde(default)]
    pub vhost: Option<String>,

    /// Authentication token
    #[serde(default)]
    pub token: Option<String>,

    /// `Name:Value` headers replaced on every request
    #[serde(default)]
    pub proxy_set_headers: Vec<String>,

    /// `Name:Value` headers appended to every request
    #[serde(default)]
    pub proxy_add_headers: Vec<String>,

    /// Basic auth enforced by the server
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,

    /// Extra request options passed through verbatim
    #[serde(default)]
    pub options: IndexMap<String, String>,
}

impl TunnelConfig {
    fn base(protocol: TunnelProtocol, local_port: u16) -> Self {
        Self {
            name: None,
            protocol,
            local_addr: default_local_addr(),
            local_port,
            remote_port: None,
            vhost: None,
            token: None,
            proxy_set_headers: Vec::new(),
            proxy_add_headers: Vec::new(),
            basic_auth: None,
            options: IndexMap::new(),
        }
    }

    /// TCP tunnel to `127.0.0.1:local_port`
    #[must_use]
    pub fn tcp(local_port: u16) -> Self {
        Self::base(TunnelProtocol::Tcp, local_port)
    }

    /// HTTP tunnel to `127.0.0.1:local_port` under `vhost`
    #[must_use]
    pub fn http(local_port: u16, vhost: impl Into<String>) -> Self {
        Self {
            vhost: Some(vhost.into()),
            ..Self::base(TunnelProtocol::Http, local_port)
        }
    }

    /// Set the public port
    #[must_use]
    pub const fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    /// Set the token
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the local service address
    #[must_use]
    pub fn with_local_addr(mut self, addr: impl Into<String>) -> Self {
        self.local_addr = addr.into();
        self
    }

    /// Label for logs
    #[must_use]
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!(
                "{}->{}:{}",
                self.vhost
                    .clone()
                    .or_else(|| self.remote_port.map(|p| p.to_string()))
                    .unwrap_or_else(|| "auto".to_string()),
                self.local_addr,
                self.local_port
            )
        })
    }

    /// Build the request sent to the server
    #[must_use]
    pub fn to_request(&self) -> TunnelRequest {
        let mut request = TunnelRequest::new(self.protocol, self.local_addr.clone(), self.local_port);
        for (key, value) in &self.options {
            request.set_option(key.clone(), value.clone());
        }
        if let Some(port) = self.remote_port {
            request.set_option(options::REMOTE_PORT, port.to_string());
        }
        if let Some(vhost) = &self.vhost {
            request.set_option(options::VHOST, vhost.clone());
        }
        if let Some(token) = &self.token {
            request.set_option(options::TOKEN, token.clone());
        }
        if !self.proxy_set_headers.is_empty() {
            request.set_option(options::PROXY_SET_HEADERS, self.proxy_set_headers.join(";"));
        }
        if !self.proxy_add_headers.is_empty() {
            request.set_option(options::PROXY_ADD_HEADERS, self.proxy_add_headers.join(";"));
        }
        if let Some(auth) = &self.basic_auth {
            request.set_option(options::BASIC_AUTH_USERNAME, auth.username.clone());
            request.set_option(options::BASIC_AUTH_PASSWORD, auth.password.clone());
        }
        request
    }

    /// Validate the tunnel configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `local_port` is 0 or `local_addr` is empty
    /// - an HTTP/HTTPS tunnel has no `vhost`
    /// - a header rule is not `Name:Value`
    pub fn validate(&self) -> Result<(), String> {
        if self.local_port == 0 {
            return Err("local_port cannot be 0".to_string());
        }

        if self.local_addr.is_empty() {
            return Err("local_addr cannot be empty".to_string());
        }

        if self.protocol.is_http() && self.vhost.as_deref().map_or(true, str::is_empty) {
            return Err(format!("{} tunnels require a vhost", self.protocol));
        }

        for rule in self.proxy_set_headers.iter().chain(&self.proxy_add_headers) {
            if rule.contains(';') || !rule.split_once(':').is_some_and(|(n, _)| !n.trim().is_empty()) {
                return Err(format!("invalid header rule: {rule}"));
            }
        }

        Ok(())
    }
}

// =============================================================================
// humantime_serde module for Duration serialization
// =============================================================================

mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn number(s: &str) -> Result<u64, String> {
        s.trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {s}"))
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // plain seconds
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(n) = s.strip_suffix("ms") {
            return number(n).map(Duration::from_millis);
        }
        if let Some(n) = s.strip_suffix('s') {
            return number(n).map(Duration::from_secs);
        }
        if let Some(n) = s.strip_suffix('m') {
            return number(n).map(|n| Duration::from_secs(n * 60));
        }
        if let Some(n) = s.strip_suffix('h') {
            return number(n).map(|n| Duration::from_secs(n * 3600));
        }

        Err(format!("invalid duration format: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = TunnelServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:4900".parse().unwrap());
        assert_eq!(config.port_range, (30000, 31000));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(180));
        assert_eq!(config.max_tunnels, 1000);
        assert!(config.http_bind.is_none());
        assert!(config.auth.tokens.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_validation() {
        let bad = TunnelServerConfig {
            port_range: (31000, 30000),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = TunnelServerConfig {
            port_range: (80, 100),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = TunnelServerConfig {
            heartbeat_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = TunnelServerConfig {
            max_tunnels: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = TunnelServerConfig {
            https_bind: Some("0.0.0.0:443".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(bad.validate().unwrap_err(), "https_bind requires https_tls");

        let bad = TunnelServerConfig {
            watermarks: Watermarks {
                high: 1,
                low: 2,
                ..Watermarks::default()
            },
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_server_config_from_yaml() {
        let yaml = r#"
bind_addr: "127.0.0.1:7000"
http_bind: "0.0.0.0:8080"
heartbeat_interval: 30s
heartbeat_timeout: 2m
auth:
  tokens: ["tk1", "tk2"]
  allowed_ports: [[10000, 20000]]
"#;
        let config: TunnelServerConfig = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(config.bind_addr.port(), 7000);
        assert_eq!(config.http_bind.map(|a| a.port()), Some(8080));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(120));
        assert_eq!(config.auth.tokens, vec!["tk1", "tk2"]);
        assert_eq!(config.auth.allowed_ports, vec![(10000, 20000)]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_toml_roundtrip() {
        let config = TunnelServerConfig {
            heartbeat_interval: Duration::from_millis(1500),
            ..Default::default()
        };
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: TunnelServerConfig = toml::from_str(&toml_str).expect("deserialize");

        assert_eq!(parsed.bind_addr, config.bind_addr);
        assert_eq!(parsed.port_range, config.port_range);
        assert_eq!(parsed.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(parsed.heartbeat_timeout, config.heartbeat_timeout);
        assert_eq!(parsed.watermarks, config.watermarks);
    }

    #[test]
    fn test_client_config_new() {
        let config = TunnelClientConfig::new("tunnel.example.com:4900");
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.server_host(), "tunnel.example.com");
        assert!(config.validate().is_ok());

        assert_eq!(TunnelClientConfig::new("[::1]:4900").server_host(), "::1");
    }

    #[test]
    fn test_client_config_validation() {
        assert!(TunnelClientConfig::new("").validate().is_err());
        assert!(TunnelClientConfig::new("example.com").validate().is_err());

        let bad = TunnelClientConfig::new("example.com:4900").with_tunnel(TunnelConfig::tcp(0));
        assert!(bad.validate().unwrap_err().starts_with("tunnels[0]"));

        let mut http = TunnelConfig::http(80, "a.example.com");
        http.vhost = None;
        let bad = TunnelClientConfig::new("example.com:4900").with_tunnel(http);
        assert!(bad.validate().is_err());

        let mut rules = TunnelConfig::http(80, "a.example.com");
        rules.proxy_set_headers = vec!["no-colon".to_string()];
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_tunnel_config_to_request() {
        let mut tunnel = TunnelConfig::http(3000, "a.example.com").with_token("tk1");
        tunnel.proxy_set_headers = vec!["X-Real-IP:$remote_addr".to_string(), "X-A:1".to_string()];
        tunnel.basic_auth = Some(BasicAuth {
            username: "u".to_string(),
            password: "p".to_string(),
        });
        tunnel.options.insert("custom".to_string(), "v".to_string());

        let request = tunnel.to_request();
        assert_eq!(request.protocol, TunnelProtocol::Http);
        assert_eq!(request.local_target(), "127.0.0.1:3000");
        assert_eq!(request.vhost(), Some("a.example.com"));
        assert_eq!(request.token(), Some("tk1"));
        assert_eq!(
            request.option(options::PROXY_SET_HEADERS),
            Some("X-Real-IP:$remote_addr;X-A:1")
        );
        assert_eq!(request.option(options::BASIC_AUTH_USERNAME), Some("u"));
        assert_eq!(request.option("custom"), Some("v"));

        let request = TunnelConfig::tcp(8080).with_remote_port(10080).to_request();
        assert_eq!(request.remote_port(), Some(10080));
        assert_eq!(request.vhost(), None);
    }

    #[test]
    fn test_client_config_from_toml() {
        let toml_str = r#"
server_addr = "tunnel.example.com:4900"
reconnect_delay = "500ms"

[[tunnels]]
local_port = 22
remote_port = 2222
token = "tk1"

[[tunnels]]
protocol = "https"
local_port = 8443
vhost = "secure.example.com"
"#;
        let config: TunnelClientConfig = toml::from_str(toml_str).expect("deserialize");
        assert_eq!(config.reconnect_delay, Duration::from_millis(500));
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[0].protocol, TunnelProtocol::Tcp);
        assert_eq!(config.tunnels[0].local_addr, "127.0.0.1");
        assert_eq!(config.tunnels[1].protocol, TunnelProtocol::Https);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_parsing_variants() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("1d").is_err());
    }
}
