//! Per-tunnel state owned by one control connection

use crate::channel::ControlHandle;
use crate::conn::ConnectionHandle;
use crate::protocol::Message;
use crate::request::{TunnelProtocol, TunnelRequest};
use crate::token::TokenProducer;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// A negotiated tunnel: its identity, request, control connection and the
/// public connections currently routed through it
#[derive(Debug)]
pub struct TunnelSession {
    tunnel_id: u64,
    request: TunnelRequest,
    control: ControlHandle,
    session_ids: TokenProducer,
    connections: DashMap<u64, ConnectionHandle>,
    destroyed: AtomicBool,
    peer: SocketAddr,
    connected_at: Instant,
}

impl TunnelSession {
    /// Create a session with an empty connection table
    #[must_use]
    pub fn new(
        tunnel_id: u64,
        request: TunnelRequest,
        control: ControlHandle,
        peer: SocketAddr,
    ) -> Self {
        Self {
            tunnel_id,
            request,
            control,
            session_ids: TokenProducer::new(),
            connections: DashMap::new(),
            destroyed: AtomicBool::new(false),
            peer,
            connected_at: Instant::now(),
        }
    }

    /// Server-assigned tunnel id
    #[must_use]
    pub const fn tunnel_id(&self) -> u64 {
        self.tunnel_id
    }

    /// Request as accepted
    #[must_use]
    pub const fn request(&self) -> &TunnelRequest {
        &self.request
    }

    /// Control connection of the owning client
    #[must_use]
    pub const fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Address of the owning client
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Allocate a session id, unique within this tunnel
    pub fn next_session_id(&self) -> u64 {
        self.session_ids.next()
    }

    /// Route `session_id` to `conn`.
    ///
    /// Returns `false`, leaving nothing routed, once the tunnel is destroyed.
    pub fn insert(&self, session_id: u64, conn: ConnectionHandle) -> bool {
        self.connections.insert(session_id, conn);
        if self.destroyed.load(Ordering::SeqCst) {
            self.connections.remove(&session_id);
            return false;
        }
        true
    }

    /// Whether [`destroy`](Self::destroy) has run
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Stop routing `session_id`; returns the connection if it was routed
    pub fn remove(&self, session_id: u64) -> Option<ConnectionHandle> {
        self.connections.remove(&session_id).map(|(_, conn)| conn)
    }

    /// Public connection for `session_id`
    #[must_use]
    pub fn connection(&self, session_id: u64) -> Option<ConnectionHandle> {
        self.connections.get(&session_id).map(|c| c.value().clone())
    }

    /// Number of routed public connections
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a message to the client; `false` if the control connection is gone
    pub fn send(&self, message: Message) -> bool {
        self.control.send(message)
    }

    /// Queue a message once the control connection drains; `false` if it is gone
    pub async fn send_gated(&self, message: Message) -> bool {
        self.control.send_gated(message).await
    }

    /// Close every routed public connection after its pending writes flush
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.connections.iter().map(|e| *e.key()).collect();
        let mut closed = 0usize;
        for id in ids {
            if let Some((_, conn)) = self.connections.remove(&id) {
                conn.close();
                closed += 1;
            }
        }
        tracing::debug!(
            tunnel_id = self.tunnel_id,
            connections_closed = closed,
            "Tunnel session destroyed"
        );
    }

    /// Snapshot for listing
    #[must_use]
    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            tunnel_id: self.tunnel_id,
            protocol: self.request.protocol,
            route: route_of(&self.request),
            session_count: self.session_count(),
            peer: self.peer,
            connected_at: self.connected_at,
        }
    }
}

fn route_of(request: &TunnelRequest) -> String {
    match request.protocol {
        TunnelProtocol::Tcp => request
            .remote_port()
            .map_or_else(String::new, |p| p.to_string()),
        TunnelProtocol::Http | TunnelProtocol::Https => {
            request.vhost().unwrap_or_default().to_string()
        }
    }
}

/// Summary information about a tunnel (for listing)
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Tunnel id
    pub tunnel_id: u64,
    /// Public endpoint kind
    pub protocol: TunnelProtocol,
    /// Routing key: public port or vhost
    pub route: String,
    /// Public connections currently routed
    pub session_count: usize,
    /// Client address
    pub peer: SocketAddr,
    /// When the tunnel was established
    pub connected_at: Instant,
}
