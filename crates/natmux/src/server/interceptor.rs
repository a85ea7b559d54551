//! Pluggable policy hooks run by the server
//!
//! A [`ProtoRequestInterceptor`] sees every tunnel request before it is
//! registered and may rewrite or reject it. An [`HttpRequestInterceptor`]
//! sees every HTTP request head routed to a vhost tunnel and may rewrite
//! it or answer on the tunnel's behalf.

use crate::config::AuthConfig;
use crate::error::{Result, TunnelError};
use crate::http::{HttpRequestHead, HttpResponse};
use crate::request::{options, TunnelProtocol, TunnelRequest};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Variable in header rules replaced with the public client's IP
pub const REMOTE_ADDR_VAR: &str = "$remote_addr";

/// Realm announced in basic auth challenges
pub const AUTH_REALM: &str = "natmux";

/// Inspects, rewrites or rejects a tunnel request
pub trait ProtoRequestInterceptor: Send + Sync {
    /// Return the request to register, or an error whose rejection reason is
    /// sent back to the client
    ///
    /// # Errors
    ///
    /// Any error rejects the request.
    fn handle(&self, request: TunnelRequest) -> Result<TunnelRequest>;
}

impl<F> ProtoRequestInterceptor for F
where
    F: Fn(TunnelRequest) -> Result<TunnelRequest> + Send + Sync,
{
    fn handle(&self, request: TunnelRequest) -> Result<TunnelRequest> {
        self(request)
    }
}

/// Inspects or rewrites an HTTP request head before it is forwarded.
///
/// Returning a response short-circuits the request: the response is
/// written to the public client and the connection is closed.
pub trait HttpRequestInterceptor: Send + Sync {
    /// Handle one request head
    fn handle(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        request: &TunnelRequest,
        head: &mut HttpRequestHead,
    ) -> Option<HttpResponse>;
}

impl<F> HttpRequestInterceptor for F
where
    F: Fn(SocketAddr, SocketAddr, &TunnelRequest, &mut HttpRequestHead) -> Option<HttpResponse>
        + Send
        + Sync,
{
    fn handle(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        request: &TunnelRequest,
        head: &mut HttpRequestHead,
    ) -> Option<HttpResponse> {
        self(local_addr, remote_addr, request, head)
    }
}

/// Hash a token using SHA256
///
/// Returns the hex-encoded hash of the token.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Default request policy
// =============================================================================

/// Token, port and vhost checks driven by [`AuthConfig`]
#[derive(Debug, Clone, Default)]
pub struct DefaultRequestInterceptor {
    token_hashes: HashSet<String>,
    allowed_ports: Vec<(u16, u16)>,
}

impl DefaultRequestInterceptor {
    /// Build from configuration; tokens are kept only as hashes
    #[must_use]
    pub fn new(auth: &AuthConfig) -> Self {
        Self {
            token_hashes: auth.tokens.iter().map(|t| hash_token(t)).collect(),
            allowed_ports: auth.allowed_ports.clone(),
        }
    }

    fn port_allowed(&self, port: u16) -> bool {
        port == 0
            || self.allowed_ports.is_empty()
            || self
                .allowed_ports
                .iter()
                .any(|(lo, hi)| (*lo..=*hi).contains(&port))
    }
}

impl ProtoRequestInterceptor for DefaultRequestInterceptor {
    fn handle(&self, mut request: TunnelRequest) -> Result<TunnelRequest> {
        if !self.token_hashes.is_empty() {
            let valid = request
                .token()
                .is_some_and(|t| self.token_hashes.contains(&hash_token(t)));
            if !valid {
                return Err(TunnelError::rejected("invalid token"));
            }
        }

        match request.protocol {
            TunnelProtocol::Tcp => {
                if let Some(port) = request.remote_port() {
                    if !self.port_allowed(port) {
                        return Err(TunnelError::rejected(format!("port {port} not allowed")));
                    }
                }
            }
            TunnelProtocol::Http | TunnelProtocol::Https => {
                let Some(vhost) = request.vhost() else {
                    return Err(TunnelError::rejected("vhost required"));
                };
                let vhost = vhost.trim().to_ascii_lowercase();
                request.set_option(options::VHOST, vhost);
            }
        }

        Ok(request)
    }
}

// =============================================================================
// Default HTTP policy
// =============================================================================

/// Basic auth and header rewriting driven by the tunnel's request options
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHttpInterceptor;

impl DefaultHttpInterceptor {
    fn authorized(request: &TunnelRequest, head: &HttpRequestHead) -> bool {
        let Some(username) = request.option(options::BASIC_AUTH_USERNAME) else {
            return true;
        };
        let password = request
            .option(options::BASIC_AUTH_PASSWORD)
            .unwrap_or_default();

        head.header("authorization")
            .and_then(|value| {
                let (scheme, encoded) = value.trim().split_once(' ')?;
                scheme
                    .eq_ignore_ascii_case("basic")
                    .then(|| BASE64.decode(encoded.trim()).ok())
                    .flatten()
            })
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|credentials| {
                credentials
                    .split_once(':')
                    .map(|(u, p)| u == username && p == password)
            })
            .unwrap_or(false)
    }
}

/// Parse `Name:Value;Name:Value` rules, skipping malformed entries
fn header_rules(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split(';').filter_map(|rule| {
        let (name, value) = rule.split_once(':')?;
        let name = name.trim();
        (!name.is_empty()).then(|| (name, value.trim()))
    })
}

impl HttpRequestInterceptor for DefaultHttpInterceptor {
    fn handle(
        &self,
        _local_addr: SocketAddr,
        remote_addr: SocketAddr,
        request: &TunnelRequest,
        head: &mut HttpRequestHead,
    ) -> Option<HttpResponse> {
        if !Self::authorized(request, head) {
            tracing::debug!(remote = %remote_addr, "Basic auth failed");
            return Some(HttpResponse::unauthorized(AUTH_REALM));
        }
        if request.option(options::BASIC_AUTH_USERNAME).is_some() {
            head.remove_header("authorization");
        }

        let client_ip = remote_addr.ip().to_string();
        if let Some(rules) = request.option(options::PROXY_SET_HEADERS) {
            for (name, value) in header_rules(rules) {
                head.set_header(name, value.replace(REMOTE_ADDR_VAR, &client_ip));
            }
        }
        if let Some(rules) = request.option(options::PROXY_ADD_HEADERS) {
            for (name, value) in header_rules(rules) {
                head.add_header(name, value.replace(REMOTE_ADDR_VAR, &client_ip));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "0.0.0.0:8080".parse().unwrap(),
            "203.0.113.9:51000".parse().unwrap(),
        )
    }

    fn head(raw: &[u8]) -> HttpRequestHead {
        HttpRequestHead::parse(raw).unwrap().unwrap().0
    }

    #[test]
    fn test_hash_token() {
        let hash = hash_token("test-token");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("test-token"));
        assert_ne!(hash, hash_token("other-token"));
    }

    #[test]
    fn test_open_policy_accepts_everything() {
        let policy = DefaultRequestInterceptor::default();
        let request = TunnelRequest::tcp("127.0.0.1", 22).with_remote_port(2222);
        assert_eq!(policy.handle(request.clone()).unwrap(), request);
    }

    #[test]
    fn test_token_check() {
        let policy = DefaultRequestInterceptor::new(&AuthConfig {
            tokens: vec!["tk1".to_string()],
            allowed_ports: Vec::new(),
        });

        let ok = TunnelRequest::tcp("127.0.0.1", 22).with_token("tk1");
        assert!(policy.handle(ok).is_ok());

        let err = policy
            .handle(TunnelRequest::tcp("127.0.0.1", 22).with_token("nope"))
            .unwrap_err();
        assert_eq!(err.rejection_reason(), Some("invalid token"));

        let err = policy
            .handle(TunnelRequest::tcp("127.0.0.1", 22))
            .unwrap_err();
        assert_eq!(err.rejection_reason(), Some("invalid token"));
    }

    #[test]
    fn test_port_ranges() {
        let policy = DefaultRequestInterceptor::new(&AuthConfig {
            tokens: Vec::new(),
            allowed_ports: vec![(10000, 10010), (2222, 2222)],
        });
        let tcp = |port| TunnelRequest::tcp("127.0.0.1", 22).with_remote_port(port);

        assert!(policy.handle(tcp(2222)).is_ok());
        assert!(policy.handle(tcp(10005)).is_ok());
        assert!(policy.handle(tcp(0)).is_ok());
        assert!(policy.handle(TunnelRequest::tcp("127.0.0.1", 22)).is_ok());
        assert_eq!(
            policy.handle(tcp(8080)).unwrap_err().rejection_reason(),
            Some("port 8080 not allowed")
        );
    }

    #[test]
    fn test_vhost_required_and_normalized() {
        let policy = DefaultRequestInterceptor::default();
        let err = policy
            .handle(TunnelRequest::http("127.0.0.1", 80))
            .unwrap_err();
        assert_eq!(err.rejection_reason(), Some("vhost required"));

        let accepted = policy
            .handle(TunnelRequest::http("127.0.0.1", 80).with_vhost(" A.Example.COM "))
            .unwrap();
        assert_eq!(accepted.vhost(), Some("a.example.com"));
    }

    #[test]
    fn test_closure_interceptors() {
        let rewrite =
            |request: TunnelRequest| -> Result<TunnelRequest> { Ok(request.with_option("seen", "1")) };
        let out = ProtoRequestInterceptor::handle(&rewrite, TunnelRequest::tcp("h", 1)).unwrap();
        assert_eq!(out.option("seen"), Some("1"));

        let teapot = |_: SocketAddr, _: SocketAddr, _: &TunnelRequest, _: &mut HttpRequestHead| {
            Some(HttpResponse::new(418, "I'm a teapot", ""))
        };
        let (local, remote) = addrs();
        let mut h = head(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let response = HttpRequestInterceptor::handle(
            &teapot,
            local,
            remote,
            &TunnelRequest::http("h", 1),
            &mut h,
        );
        assert_eq!(response.map(|r| r.status), Some(418));
    }

    #[test]
    fn test_header_rules_applied() {
        let (local, remote) = addrs();
        let request = TunnelRequest::http("127.0.0.1", 80)
            .with_vhost("a.example.com")
            .with_option(
                options::PROXY_SET_HEADERS,
                "X-Real-IP:$remote_addr; Accept : text/html;broken",
            )
            .with_option(options::PROXY_ADD_HEADERS, "X-Forwarded-For:$remote_addr");
        let mut h = head(b"GET / HTTP/1.1\r\nHost: a.example.com\r\nAccept: */*\r\nX-Real-IP: spoofed\r\n\r\n");

        assert!(DefaultHttpInterceptor
            .handle(local, remote, &request, &mut h)
            .is_none());
        assert_eq!(h.header("x-real-ip"), Some("203.0.113.9"));
        assert_eq!(h.header("accept"), Some("text/html"));
        assert_eq!(h.header("x-forwarded-for"), Some("203.0.113.9"));
        assert_eq!(
            h.headers.iter().filter(|(n, _)| n.eq_ignore_ascii_case("x-real-ip")).count(),
            1
        );
    }

    #[test]
    fn test_basic_auth() {
        let (local, remote) = addrs();
        let request = TunnelRequest::http("127.0.0.1", 80)
            .with_vhost("a.example.com")
            .with_option(options::BASIC_AUTH_USERNAME, "user")
            .with_option(options::BASIC_AUTH_PASSWORD, "secret");

        let mut missing = head(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n");
        let response = DefaultHttpInterceptor
            .handle(local, remote, &request, &mut missing)
            .unwrap();
        assert_eq!(response.status, 401);

        let raw = format!(
            "GET / HTTP/1.1\r\nHost: a.example.com\r\nAuthorization: Basic {}\r\n\r\n",
            BASE64.encode("user:wrong")
        );
        let mut wrong = head(raw.as_bytes());
        assert!(DefaultHttpInterceptor
            .handle(local, remote, &request, &mut wrong)
            .is_some());

        let raw = format!(
            "GET / HTTP/1.1\r\nHost: a.example.com\r\nAuthorization: basic {}\r\n\r\n",
            BASE64.encode("user:secret")
        );
        let mut good = head(raw.as_bytes());
        assert!(DefaultHttpInterceptor
            .handle(local, remote, &request, &mut good)
            .is_none());
        assert!(good.header("authorization").is_none());
    }
}
