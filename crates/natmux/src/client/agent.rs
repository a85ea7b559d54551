//! Client side of a tunnel: one control connection carrying one tunnel
//!
//! The client dials the server, sends its REQUEST and waits for the
//! RESPONSE. Once accepted it dials the local service for every session the
//! server announces and relays bytes both ways until the control connection
//! ends. Transient failures are retried after a fixed delay; a rejection is
//! final.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, ControlHandle, ControlReader};
use crate::client::cache::LocalConnectionCache;
use crate::config::{TunnelClientConfig, TunnelConfig};
use crate::conn::{ConnectionHandle, Watermarks};
use crate::error::{Result, TunnelError};
use crate::protocol::Message;
use crate::request::TunnelRequest;
use crate::tls;

/// Time allowed for queued frames to flush when the control connection closes
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Events queued per session; a session this far behind is dropped
const SESSION_QUEUE: usize = 256;

// =============================================================================
// Client State
// =============================================================================

/// Current state of a tunnel client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClientState {
    /// Dialing the server
    Connecting,
    /// REQUEST sent, waiting for the RESPONSE
    AwaitingResponse,
    /// Tunnel established
    Active {
        /// Server-assigned tunnel id
        tunnel_id: u64,
        /// Request as accepted by the server
        request: TunnelRequest,
    },
    /// Not connected
    #[default]
    Closed,
}

/// Lifecycle notifications for external listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The server accepted the tunnel
    Established {
        /// Server-assigned tunnel id
        tunnel_id: u64,
        /// Request as accepted, including the assigned port
        request: TunnelRequest,
    },
    /// The server refused the tunnel
    Rejected {
        /// Reason given by the server
        reason: String,
    },
    /// The control connection ended
    Disconnected {
        /// Why it ended
        reason: String,
    },
}

enum SessionEvent {
    Data(Bytes),
    Disconnect,
}

// =============================================================================
// Tunnel Client
// =============================================================================

/// Tunnel client for one configured tunnel
pub struct TunnelClient {
    config: TunnelClientConfig,
    tunnel: TunnelConfig,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    state: Arc<RwLock<ClientState>>,
    event_tx: Option<mpsc::Sender<TunnelEvent>>,
    shutdown: CancellationToken,
    active_sessions: Arc<AtomicUsize>,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("server_addr", &self.config.server_addr)
            .field("tunnel", &self.tunnel.label())
            .field("tls", &self.tls.is_some())
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    /// Client for `tunnel` using the connection settings of `config`,
    /// without TLS
    #[must_use]
    pub fn new(config: TunnelClientConfig, tunnel: TunnelConfig) -> Self {
        Self {
            config,
            tunnel,
            tls: None,
            state: Arc::new(RwLock::new(ClientState::Closed)),
            event_tx: None,
            shutdown: CancellationToken::new(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Client with TLS set up from `config.tls`
    ///
    /// # Errors
    ///
    /// Returns an error if the CA bundle cannot be loaded or the server name
    /// is invalid.
    pub fn from_config(config: TunnelClientConfig, tunnel: TunnelConfig) -> Result<Self> {
        let tls = match &config.tls {
            Some(settings) => {
                let connector = tls::connector_from_ca(&settings.ca_path)?;
                let name = settings
                    .server_name
                    .clone()
                    .unwrap_or_else(|| config.server_host().to_string());
                Some((connector, tls::server_name(&name)?))
            }
            None => None,
        };
        let mut client = Self::new(config, tunnel);
        client.tls = tls;
        Ok(client)
    }

    /// Dial the server over TLS
    #[must_use]
    pub fn with_tls(mut self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        self.tls = Some((connector, server_name));
        self
    }

    /// Set an event channel for lifecycle notifications
    #[must_use]
    pub fn with_event_channel(mut self, tx: mpsc::Sender<TunnelEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Stop when `token` is cancelled
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state.read().clone()
    }

    /// Tunnel id while active
    #[must_use]
    pub fn tunnel_id(&self) -> Option<u64> {
        match &*self.state.read() {
            ClientState::Active { tunnel_id, .. } => Some(*tunnel_id),
            _ => None,
        }
    }

    /// Sessions whose relay task is still running
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Ask a running client to close its tunnel and stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn set_state(&self, state: ClientState) {
        *self.state.write() = state;
    }

    async fn emit(&self, event: TunnelEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Run the tunnel, reconnecting after transient failures
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The server rejects the tunnel
    /// - The connection fails and `auto_reconnect` is off
    pub async fn run(&self) -> Result<()> {
        self.tunnel.validate().map_err(TunnelError::config)?;

        loop {
            let outcome = self.run_once().await;
            self.set_state(ClientState::Closed);

            let reason = match outcome {
                Ok(()) => "server closed the connection".to_string(),
                Err(TunnelError::Shutdown) => {
                    tracing::info!(tunnel = %self.tunnel.label(), "Tunnel client shutting down");
                    return Ok(());
                }
                Err(e) if e.is_rejection() => {
                    tracing::error!(tunnel = %self.tunnel.label(), error = %e, "Tunnel rejected");
                    return Err(e);
                }
                Err(e) if !self.config.auto_reconnect => return Err(e),
                Err(e) => e.to_string(),
            };

            if !self.config.auto_reconnect {
                return Ok(());
            }
            tracing::warn!(
                tunnel = %self.tunnel.label(),
                reason = %reason,
                delay_ms = self.config.reconnect_delay.as_millis(),
                "Tunnel disconnected, will reconnect"
            );

            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// Run a single connection attempt until the control connection ends
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The server cannot be reached
    /// - The server rejects the tunnel
    /// - The connection fails or the server breaks the protocol
    /// - Shutdown was requested ([`TunnelError::Shutdown`])
    pub async fn run_once(&self) -> Result<()> {
        self.set_state(ClientState::Connecting);
        tracing::debug!(server = %self.config.server_addr, "Connecting to tunnel server");

        let connect = TcpStream::connect(self.config.server_addr.as_str());
        let stream = tokio::select! {
            () = self.shutdown.cancelled() => return Err(TunnelError::Shutdown),
            dialed = tokio::time::timeout(self.config.connect_timeout, connect) => {
                dialed.map_err(|_| TunnelError::timeout())??
            }
        };
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some((connector, name)) => {
                let stream = tokio::time::timeout(
                    self.config.connect_timeout,
                    connector.connect(name.clone(), stream),
                )
                .await
                .map_err(|_| TunnelError::timeout())?
                .map_err(|e| TunnelError::tls(format!("handshake failed: {e}")))?;
                self.serve(stream).await
            }
            None => self.serve(stream).await,
        }
    }

    async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, control, writer) = channel::open(stream, self.config.channel_settings());
        let request = self.tunnel.to_request();
        tracing::debug!(request = %request, "Requesting tunnel");
        control.send(Message::Request(request));
        self.set_state(ClientState::AwaitingResponse);

        let (tunnel_id, accepted) = match self.await_response(&mut reader, &control).await {
            Ok(accepted) => accepted,
            Err(e) => {
                if let Some(reason) = e.rejection_reason() {
                    self.emit(TunnelEvent::Rejected {
                        reason: reason.to_string(),
                    })
                    .await;
                }
                channel::finish(&control, writer, CLOSE_GRACE).await;
                return Err(e);
            }
        };

        tracing::info!(
            tunnel_id,
            tunnel = %self.tunnel.label(),
            accepted = %accepted,
            "Tunnel established"
        );
        self.set_state(ClientState::Active {
            tunnel_id,
            request: accepted.clone(),
        });
        self.emit(TunnelEvent::Established {
            tunnel_id,
            request: accepted.clone(),
        })
        .await;

        let cache = Arc::new(LocalConnectionCache::new(
            self.config.connect_timeout,
            self.config.watermarks,
        ));
        let result = self
            .relay(tunnel_id, &accepted, &mut reader, &control, &cache)
            .await;

        let closed = cache.remove_tunnel(tunnel_id);
        tracing::debug!(tunnel_id, closed, "Closed local connections");
        channel::finish(&control, writer, CLOSE_GRACE).await;

        let reason = match &result {
            Ok(()) => "server closed the connection".to_string(),
            Err(e) => e.to_string(),
        };
        self.emit(TunnelEvent::Disconnected { reason }).await;
        result
    }

    async fn await_response<S: AsyncRead>(
        &self,
        reader: &mut ControlReader<S>,
        control: &ControlHandle,
    ) -> Result<(u64, TunnelRequest)> {
        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Err(TunnelError::Shutdown),
                next = reader.next() => next,
            };

            match next.transpose()? {
                None => {
                    return Err(TunnelError::connection_msg(
                        "server closed the connection before responding",
                    ))
                }
                Some(Message::HeartbeatPing) => {
                    control.send(Message::HeartbeatPong);
                }
                Some(Message::HeartbeatPong | Message::Unknown { .. }) => {}
                Some(Message::Accepted { tunnel_id, request }) => return Ok((tunnel_id, request)),
                Some(Message::Rejected { reason }) => return Err(TunnelError::rejected(reason)),
                Some(other) => {
                    return Err(TunnelError::protocol(format!(
                        "unexpected {:?} before RESPONSE",
                        other.message_type()
                    )))
                }
            }
        }
    }

    async fn relay<S: AsyncRead>(
        &self,
        tunnel_id: u64,
        accepted: &TunnelRequest,
        reader: &mut ControlReader<S>,
        control: &ControlHandle,
        cache: &Arc<LocalConnectionCache>,
    ) -> Result<()> {
        let target = accepted.local_target();
        let mut sessions: HashMap<u64, mpsc::Sender<SessionEvent>> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();

        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Err(TunnelError::Shutdown),
                Some(session_id) = done_rx.recv() => {
                    sessions.remove(&session_id);
                    continue;
                }
                next = reader.next() => next,
            };

            let Some(message) = next.transpose()? else {
                return Ok(());
            };

            match message {
                Message::HeartbeatPing => {
                    control.send(Message::HeartbeatPong);
                }
                Message::HeartbeatPong | Message::Unknown { .. } => {}
                Message::RemoteConnected {
                    tunnel_id: tid,
                    session_id,
                } => {
                    if tid != tunnel_id || sessions.contains_key(&session_id) {
                        continue;
                    }
                    tracing::debug!(tunnel_id, session_id, "Public connection opened");
                    let (tx, rx) = mpsc::channel(SESSION_QUEUE);
                    sessions.insert(session_id, tx);
                    self.active_sessions.fetch_add(1, Ordering::AcqRel);
                    let task = SessionTask {
                        cache: Arc::clone(cache),
                        target: target.clone(),
                        tunnel_id,
                        session_id,
                        control: control.clone(),
                        watermarks: self.config.watermarks,
                        active: Arc::clone(&self.active_sessions),
                        done: done_tx.clone(),
                    };
                    tokio::spawn(task.run(rx));
                }
                Message::Transfer {
                    tunnel_id: tid,
                    session_id,
                    data,
                } => {
                    if tid != tunnel_id {
                        tracing::trace!(tunnel_id = tid, session_id, "Dropping transfer for foreign tunnel");
                        continue;
                    }
                    // Sessions are announced by REMOTE_CONNECTED; anything
                    // else is left over from one that already ended.
                    let Some(tx) = sessions.get(&session_id) else {
                        tracing::trace!(tunnel_id, session_id, "Dropping transfer for closed session");
                        continue;
                    };
                    match tx.try_send(SessionEvent::Data(data)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            sessions.remove(&session_id);
                            tracing::warn!(tunnel_id, session_id, "Local connection not draining, dropping session");
                            cache.abort(tunnel_id, session_id);
                            control.send(Message::LocalDisconnect {
                                tunnel_id,
                                session_id,
                            });
                        }
                        Err(TrySendError::Closed(_)) => {
                            sessions.remove(&session_id);
                        }
                    }
                }
                Message::RemoteDisconnect {
                    tunnel_id: tid,
                    session_id,
                } => {
                    if tid != tunnel_id {
                        continue;
                    }
                    tracing::debug!(tunnel_id, session_id, "Public connection closed");
                    let delivered = sessions
                        .remove(&session_id)
                        .is_some_and(|tx| tx.try_send(SessionEvent::Disconnect).is_ok());
                    if !delivered {
                        cache.remove(tunnel_id, session_id);
                    }
                }
                other => {
                    return Err(TunnelError::protocol(format!(
                        "unexpected {:?} on an active tunnel",
                        other.message_type()
                    )));
                }
            }
        }
    }
}

/// Relay of one session to the local service.
///
/// Ends when the public side disconnects, the local connection closes, the
/// local connection stops draining, or the control connection goes away.
struct SessionTask {
    cache: Arc<LocalConnectionCache>,
    target: String,
    tunnel_id: u64,
    session_id: u64,
    control: ControlHandle,
    watermarks: Watermarks,
    active: Arc<AtomicUsize>,
    done: mpsc::UnboundedSender<u64>,
}

impl SessionTask {
    async fn run(self, mut events: mpsc::Receiver<SessionEvent>) {
        if let Some(conn) = self.connect().await {
            self.forward(&conn, &mut events).await;
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        let _ = self.done.send(self.session_id);
    }

    /// Dial the local service; a failure is logged and otherwise silent
    async fn connect(&self) -> Option<ConnectionHandle> {
        let (tunnel_id, session_id) = (self.tunnel_id, self.session_id);
        match self
            .cache
            .acquire(&self.target, tunnel_id, session_id, &self.control)
            .await
        {
            Ok((conn, fresh)) => {
                if fresh {
                    self.control.send(Message::LocalConnected {
                        tunnel_id,
                        session_id,
                    });
                }
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(tunnel_id, session_id, local = %self.target, error = %e, "Failed to reach local service");
                None
            }
        }
    }

    /// Feed the local connection in arrival order
    async fn forward(&self, conn: &ConnectionHandle, events: &mut mpsc::Receiver<SessionEvent>) {
        let (tunnel_id, session_id) = (self.tunnel_id, self.session_id);
        loop {
            let event = tokio::select! {
                biased;
                () = conn.closed() => return,
                event = events.recv() => event,
            };
            match event {
                None => return,
                Some(SessionEvent::Data(data)) => {
                    if self.watermarks.overflows(conn.queued(), data.len()) {
                        tracing::warn!(
                            tunnel_id,
                            session_id,
                            queued = conn.queued(),
                            "Local connection not draining, dropping session"
                        );
                        if self.cache.abort(tunnel_id, session_id) {
                            self.control.send(Message::LocalDisconnect {
                                tunnel_id,
                                session_id,
                            });
                        }
                        return;
                    }
                    if !conn.send(data) {
                        return;
                    }
                }
                Some(SessionEvent::Disconnect) => {
                    self.cache.remove(tunnel_id, session_id);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_client_is_closed() {
        let client = TunnelClient::new(
            TunnelClientConfig::new("127.0.0.1:4900"),
            TunnelConfig::tcp(22),
        );
        assert_eq!(client.state(), ClientState::Closed);
        assert!(client.tunnel_id().is_none());
    }

    #[tokio::test]
    async fn test_invalid_tunnel_fails_fast() {
        let client = TunnelClient::new(
            TunnelClientConfig::new("127.0.0.1:4900"),
            TunnelConfig::tcp(0),
        );
        assert!(matches!(client.run().await, Err(TunnelError::Config { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_server_without_reconnect() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut config = TunnelClientConfig::new(addr.to_string());
        config.auto_reconnect = false;
        let client = TunnelClient::new(config, TunnelConfig::tcp(22));
        assert!(matches!(
            client.run().await,
            Err(TunnelError::Connection { .. })
        ));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnect_loop() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut config = TunnelClientConfig::new(addr.to_string());
        config.reconnect_delay = Duration::from_secs(30);
        let client = Arc::new(TunnelClient::new(config, TunnelConfig::tcp(22)));

        let runner = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("client did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
