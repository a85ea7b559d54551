//! State shared by every server task

use crate::channel::ChannelSettings;
use crate::config::TunnelServerConfig;
use crate::request::TunnelProtocol;
use crate::server::interceptor::{HttpRequestInterceptor, ProtoRequestInterceptor};
use crate::server::registry::{TcpRegistry, VhostRegistry};
use crate::server::session::{TunnelInfo, TunnelSession};
use crate::token::TokenProducer;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Longest a closing TCP tunnel waits for its public port to be released
pub const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Registries, id producers and policy hooks of one running server
pub struct ServerContext {
    config: TunnelServerConfig,
    tunnel_ids: TokenProducer,
    tcp: TcpRegistry,
    http: Option<VhostRegistry>,
    https: Option<VhostRegistry>,
    tunnels: DashMap<u64, Arc<TunnelSession>>,
    /// Tunnel slots reserved against `max_tunnels`, including tunnels still
    /// being registered
    slots: AtomicUsize,
    request_interceptor: Arc<dyn ProtoRequestInterceptor>,
    http_interceptor: Arc<dyn HttpRequestInterceptor>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("bind_addr", &self.config.bind_addr)
            .field("tunnels", &self.tunnels.len())
            .field("http", &self.http.is_some())
            .field("https", &self.https.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Build the context; vhost registries exist only for enabled listeners
    #[must_use]
    pub fn new(
        config: TunnelServerConfig,
        request_interceptor: Arc<dyn ProtoRequestInterceptor>,
        http_interceptor: Arc<dyn HttpRequestInterceptor>,
    ) -> Self {
        Self {
            tcp: TcpRegistry::new(config.public_host, config.port_range),
            http: config.http_bind.map(|_| VhostRegistry::new()),
            https: config.https_bind.map(|_| VhostRegistry::new()),
            config,
            tunnel_ids: TokenProducer::new(),
            tunnels: DashMap::new(),
            slots: AtomicUsize::new(0),
            request_interceptor,
            http_interceptor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Server configuration
    #[must_use]
    pub const fn config(&self) -> &TunnelServerConfig {
        &self.config
    }

    /// Timing and buffering for control connections
    #[must_use]
    pub const fn channel_settings(&self) -> ChannelSettings {
        self.config.channel_settings()
    }

    /// Allocate a tunnel id, unique for the lifetime of the server
    pub fn next_tunnel_id(&self) -> u64 {
        self.tunnel_ids.next()
    }

    /// TCP tunnels by port
    #[must_use]
    pub const fn tcp(&self) -> &TcpRegistry {
        &self.tcp
    }

    /// Vhost registry for `protocol`, if its listener is enabled
    #[must_use]
    pub fn vhosts(&self, protocol: TunnelProtocol) -> Option<&VhostRegistry> {
        match protocol {
            TunnelProtocol::Tcp => None,
            TunnelProtocol::Http => self.http.as_ref(),
            TunnelProtocol::Https => self.https.as_ref(),
        }
    }

    /// Request policy
    #[must_use]
    pub fn request_interceptor(&self) -> &dyn ProtoRequestInterceptor {
        self.request_interceptor.as_ref()
    }

    /// HTTP policy
    #[must_use]
    pub fn http_interceptor(&self) -> &dyn HttpRequestInterceptor {
        self.http_interceptor.as_ref()
    }

    /// Cancelled when the server shuts down
    #[must_use]
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Reserve a tunnel slot, failing once `max_tunnels` are taken.
    ///
    /// A reservation is held by the tunnel once tracked and returned by
    /// [`ServerContext::close_tunnel`]; a failed open returns it through
    /// [`ServerContext::release_slot`].
    pub fn try_reserve_slot(&self) -> bool {
        let max = self.config.max_tunnels;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .is_ok()
    }

    /// Give back a slot from [`ServerContext::try_reserve_slot`]
    pub fn release_slot(&self) {
        let _ = self
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                taken.checked_sub(1)
            });
    }

    /// Slots currently reserved
    #[must_use]
    pub fn reserved_slots(&self) -> usize {
        self.slots.load(Ordering::Acquire)
    }

    /// Track an established tunnel; it must hold a reserved slot
    pub(crate) fn track(&self, session: Arc<TunnelSession>) {
        self.tunnels.insert(session.tunnel_id(), session);
    }

    /// Unregister a tunnel and close every public connection it carries.
    ///
    /// For a TCP tunnel this returns once its public port is free to bind
    /// again, or after [`PORT_RELEASE_TIMEOUT`]. Safe to call more than once.
    pub async fn close_tunnel(&self, session: &TunnelSession) {
        let tunnel_id = session.tunnel_id();
        let mut released_port = None;
        match session.request().protocol {
            TunnelProtocol::Tcp => {
                released_port = self.tcp.unregister_tunnel(tunnel_id);
            }
            protocol => {
                if let Some(registry) = self.vhosts(protocol) {
                    registry.unregister_tunnel(tunnel_id);
                }
            }
        }
        if self.tunnels.remove(&tunnel_id).is_some() {
            self.release_slot();
        }
        if !session.is_destroyed() {
            session.destroy();
        }

        if let Some(port) = released_port {
            if !self.tcp.wait_released(port, PORT_RELEASE_TIMEOUT).await {
                tracing::warn!(tunnel_id, port, "Public port still held after tunnel close");
            }
        }
    }

    /// Number of established tunnels
    #[must_use]
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Established tunnels ordered by id
    #[must_use]
    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self.tunnels.iter().map(|e| e.value().info()).collect();
        infos.sort_by_key(|info| info.tunnel_id);
        infos
    }

    /// Tunnel by id
    #[must_use]
    pub fn tunnel(&self, tunnel_id: u64) -> Option<Arc<TunnelSession>> {
        self.tunnels.get(&tunnel_id).map(|e| Arc::clone(e.value()))
    }
}
