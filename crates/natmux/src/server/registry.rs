//! Routing tables mapping public endpoints to tunnel sessions
//!
//! [`TcpRegistry`] keys tunnels by the public port they own and binds the
//! listening socket as part of registration, so a bind failure surfaces as a
//! rejected request. [`VhostRegistry`] keys tunnels by virtual host; all its
//! tunnels share one listener. Each registry guards its table with a single
//! lock so register/unregister/lookup are atomic against each other.

use crate::conn::ConnectionHandle;
use crate::error::{Result, TunnelError};
use crate::http::normalize_host;
use crate::server::session::TunnelSession;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Route table
// =============================================================================

#[derive(Debug)]
struct RouteEntry {
    session: Arc<TunnelSession>,
    shutdown: Option<CancellationToken>,
}

/// Key -> session map with a reverse index by tunnel id
#[derive(Debug)]
struct RouteTable<K> {
    entries: HashMap<K, RouteEntry>,
    by_tunnel: HashMap<u64, K>,
}

impl<K: Eq + Hash + Clone> RouteTable<K> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_tunnel: HashMap::new(),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn insert(&mut self, key: K, session: Arc<TunnelSession>, shutdown: Option<CancellationToken>) {
        self.by_tunnel.insert(session.tunnel_id(), key.clone());
        self.entries.insert(key, RouteEntry { session, shutdown });
    }

    fn remove(&mut self, key: &K) -> Option<Arc<TunnelSession>> {
        let entry = self.entries.remove(key)?;
        self.by_tunnel.remove(&entry.session.tunnel_id());
        if let Some(shutdown) = entry.shutdown {
            shutdown.cancel();
        }
        Some(entry.session)
    }

    fn key_of(&self, tunnel_id: u64) -> Option<K> {
        self.by_tunnel.get(&tunnel_id).cloned()
    }

    fn lookup(&self, key: &K) -> Option<Arc<TunnelSession>> {
        self.entries.get(key).map(|e| Arc::clone(&e.session))
    }

    fn session_connection(&self, tunnel_id: u64, session_id: u64) -> Option<ConnectionHandle> {
        let key = self.by_tunnel.get(&tunnel_id)?;
        self.entries.get(key)?.session.connection(session_id)
    }

    fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        self.entries.values().map(|e| Arc::clone(&e.session)).collect()
    }
}

// =============================================================================
// Port Pool
// =============================================================================

/// Port range used when a TCP tunnel asks the server to pick its port
#[derive(Debug)]
struct PortPool {
    /// Start of the port range (inclusive)
    range_start: u16,
    /// End of the port range (inclusive)
    range_end: u16,
    /// Next candidate, so freed ports are not reused immediately
    cursor: u16,
    /// Ports handed out and not yet released
    used_ports: HashSet<u16>,
}

impl PortPool {
    fn new(start: u16, end: u16) -> Self {
        Self {
            range_start: start,
            range_end: end,
            cursor: start,
            used_ports: HashSet::new(),
        }
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.range_start && port <= self.range_end
    }

    /// Walk the range once from the cursor, handing each free port to
    /// `try_take` until it accepts one
    fn allocate_with<T>(&mut self, mut try_take: impl FnMut(u16) -> Option<T>) -> Option<(u16, T)> {
        let total = usize::from(self.range_end - self.range_start) + 1;
        let mut port = self.cursor;
        for _ in 0..total {
            let candidate = port;
            port = if port >= self.range_end {
                self.range_start
            } else {
                port + 1
            };
            if self.used_ports.contains(&candidate) {
                continue;
            }
            if let Some(taken) = try_take(candidate) {
                self.used_ports.insert(candidate);
                self.cursor = port;
                return Some((candidate, taken));
            }
        }
        None
    }

    fn mark_used(&mut self, port: u16) {
        if self.contains(port) {
            self.used_ports.insert(port);
        }
    }

    fn release(&mut self, port: u16) {
        self.used_ports.remove(&port);
    }

    fn available_count(&self) -> usize {
        let total = usize::from(self.range_end - self.range_start) + 1;
        total.saturating_sub(self.used_ports.len())
    }
}

// =============================================================================
// TCP registry
// =============================================================================

/// A tunnel's bound public socket.
///
/// Dropping it closes the socket and then marks the port released, which is
/// what [`TcpRegistry::wait_released`] waits for.
#[derive(Debug)]
pub struct PublicListener {
    listener: Option<TcpListener>,
    released: CancellationToken,
}

impl PublicListener {
    fn new(listener: TcpListener) -> Self {
        Self {
            listener: Some(listener),
            released: CancellationToken::new(),
        }
    }

    /// Accept the next public connection
    ///
    /// # Errors
    ///
    /// Returns the socket's accept error.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        match &self.listener {
            Some(listener) => listener.accept().await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns the socket's error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Drop for PublicListener {
    fn drop(&mut self) {
        drop(self.listener.take());
        self.released.cancel();
    }
}

/// Result of a successful TCP registration
#[derive(Debug)]
pub struct TcpBinding {
    /// Port actually bound
    pub port: u16,
    /// Session registered under `port`
    pub session: Arc<TunnelSession>,
    /// Bound listener; the accept loop owns it
    pub listener: PublicListener,
    /// Cancelled when the tunnel is unregistered
    pub shutdown: CancellationToken,
}

#[derive(Debug)]
struct TcpState {
    table: RouteTable<u16>,
    pool: PortPool,
    /// Release markers of every listener bound and not yet dropped
    bound: HashMap<u16, CancellationToken>,
}

/// TCP tunnels by public port
#[derive(Debug)]
pub struct TcpRegistry {
    bind_host: IpAddr,
    state: Mutex<TcpState>,
}

impl TcpRegistry {
    /// Create a registry binding on `bind_host`, auto-assigning from `port_range`
    #[must_use]
    pub fn new(bind_host: IpAddr, port_range: (u16, u16)) -> Self {
        Self {
            bind_host,
            state: Mutex::new(TcpState {
                table: RouteTable::new(),
                pool: PortPool::new(port_range.0, port_range.1),
                bound: HashMap::new(),
            }),
        }
    }

    /// Bind a public port and register the session built for it.
    ///
    /// `requested` of `None` or `Some(0)` picks a free port from the range.
    /// `make` receives the final port and builds the session; it runs under
    /// the registry lock and must not block.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::BindConflict`] (`bindPort: <port>`) if the port
    /// is registered or cannot be bound, and a rejection if the range is
    /// exhausted.
    pub fn register(
        &self,
        requested: Option<u16>,
        make: impl FnOnce(u16) -> Arc<TunnelSession>,
    ) -> Result<TcpBinding> {
        let mut state = self.state.lock();

        let (port, listener) = match requested.filter(|p| *p != 0) {
            Some(port) => {
                if state.table.contains(&port) {
                    return Err(TunnelError::bind_conflict(format!("bindPort: {port}")));
                }
                let listener = bind(self.bind_host, port).map_err(|e| {
                    tracing::warn!(port, error = %e, "Failed to bind public port");
                    TunnelError::bind_conflict(format!("bindPort: {port}"))
                })?;
                state.pool.mark_used(port);
                (port, listener)
            }
            None => {
                let TcpState { table, pool, .. } = &mut *state;
                pool.allocate_with(|port| {
                    if table.contains(&port) {
                        return None;
                    }
                    bind(self.bind_host, port).ok()
                })
                .ok_or_else(|| TunnelError::rejected("no ports available"))?
            }
        };

        let listener = PublicListener::new(listener);
        state.bound.retain(|_, released| !released.is_cancelled());
        state.bound.insert(port, listener.released.clone());

        let session = make(port);
        let shutdown = CancellationToken::new();
        state
            .table
            .insert(port, Arc::clone(&session), Some(shutdown.clone()));

        tracing::info!(
            tunnel_id = session.tunnel_id(),
            port,
            "TCP tunnel registered"
        );

        Ok(TcpBinding {
            port,
            session,
            listener,
            shutdown,
        })
    }

    /// Remove the tunnel on `port` and stop its listener
    pub fn unregister(&self, port: u16) -> Option<Arc<TunnelSession>> {
        let mut state = self.state.lock();
        let session = state.table.remove(&port)?;
        state.pool.release(port);
        tracing::info!(tunnel_id = session.tunnel_id(), port, "TCP tunnel unregistered");
        Some(session)
    }

    /// Remove whatever port `tunnel_id` owns
    pub fn unregister_tunnel(&self, tunnel_id: u64) -> Option<u16> {
        let port = self.state.lock().table.key_of(tunnel_id)?;
        self.unregister(port).map(|_| port)
    }

    /// Wait until the listener of an unregistered tunnel on `port` has been
    /// dropped.
    ///
    /// Returns at once if the port is free or held by a registered tunnel,
    /// and `false` if the listener is still open after `timeout`.
    pub async fn wait_released(&self, port: u16, timeout: Duration) -> bool {
        let released = {
            let state = self.state.lock();
            if state.table.contains(&port) {
                return true;
            }
            state.bound.get(&port).cloned()
        };
        match released {
            Some(released) => tokio::time::timeout(timeout, released.cancelled())
                .await
                .is_ok(),
            None => true,
        }
    }

    /// Session registered on `port`
    #[must_use]
    pub fn lookup(&self, port: u16) -> Option<Arc<TunnelSession>> {
        self.state.lock().table.lookup(&port)
    }

    /// Public connection for `(tunnel_id, session_id)`
    #[must_use]
    pub fn session_connection(&self, tunnel_id: u64, session_id: u64) -> Option<ConnectionHandle> {
        self.state.lock().table.session_connection(tunnel_id, session_id)
    }

    /// Registered tunnels
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        self.state.lock().table.sessions()
    }

    /// Number of registered tunnels
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().table.entries.len()
    }

    /// Whether no tunnel is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ports left in the auto-assign range
    #[must_use]
    pub fn available_ports(&self) -> usize {
        self.state.lock().pool.available_count()
    }
}

fn bind(host: IpAddr, port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::new(host, port);
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(not(windows))]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

// =============================================================================
// Vhost registry
// =============================================================================

/// HTTP or HTTPS tunnels by virtual host
#[derive(Debug)]
pub struct VhostRegistry {
    table: Mutex<RouteTable<String>>,
}

impl Default for VhostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VhostRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RouteTable::new()),
        }
    }

    /// Register the session built by `make` under `vhost` (case-insensitive,
    /// port ignored).
    ///
    /// `make` runs under the registry lock, only once the vhost is known to
    /// be free, and must not block.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::BindConflict`] (`vhost(<host>) already used`)
    /// if another tunnel holds the vhost.
    pub fn register(
        &self,
        vhost: &str,
        make: impl FnOnce() -> Arc<TunnelSession>,
    ) -> Result<Arc<TunnelSession>> {
        let key = normalize_host(vhost);
        let mut table = self.table.lock();
        if table.contains(&key) {
            return Err(TunnelError::bind_conflict(format!(
                "vhost({key}) already used"
            )));
        }
        let session = make();
        tracing::info!(tunnel_id = session.tunnel_id(), vhost = %key, "Vhost registered");
        table.insert(key, Arc::clone(&session), None);
        Ok(session)
    }

    /// Remove the tunnel on `vhost`
    pub fn unregister(&self, vhost: &str) -> Option<Arc<TunnelSession>> {
        let key = normalize_host(vhost);
        let session = self.table.lock().remove(&key)?;
        tracing::info!(tunnel_id = session.tunnel_id(), vhost = %key, "Vhost unregistered");
        Some(session)
    }

    /// Remove whatever vhost `tunnel_id` owns
    pub fn unregister_tunnel(&self, tunnel_id: u64) -> Option<String> {
        let mut table = self.table.lock();
        let key = table.key_of(tunnel_id)?;
        table.remove(&key)?;
        drop(table);
        tracing::info!(tunnel_id, vhost = %key, "Vhost unregistered");
        Some(key)
    }

    /// Session registered on `vhost`
    #[must_use]
    pub fn lookup(&self, vhost: &str) -> Option<Arc<TunnelSession>> {
        self.table.lock().lookup(&normalize_host(vhost))
    }

    /// Public connection for `(tunnel_id, session_id)`
    #[must_use]
    pub fn session_connection(&self, tunnel_id: u64, session_id: u64) -> Option<ConnectionHandle> {
        self.table.lock().session_connection(tunnel_id, session_id)
    }

    /// Registered tunnels
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        self.table.lock().sessions()
    }

    /// Number of registered vhosts
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Whether no vhost is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
