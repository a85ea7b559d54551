//! Tunnel server components
//!
//! [`TunnelServer`] binds the control listener and the optional shared
//! HTTP/HTTPS listeners. Each control connection negotiates one tunnel
//! ([`control`]); TCP tunnels get their own public listener ([`listener`]),
//! HTTP/HTTPS tunnels are routed by `Host` ([`vhost`]). Routing state lives
//! in the [`registry`] tables held by a shared [`ServerContext`].

pub mod context;
pub mod control;
pub mod interceptor;
pub mod listener;
pub mod registry;
pub mod session;
pub mod vhost;

pub use context::ServerContext;
pub use control::handle_connection;
pub use interceptor::{
    hash_token, DefaultHttpInterceptor, DefaultRequestInterceptor, HttpRequestInterceptor,
    ProtoRequestInterceptor,
};
pub use registry::{PublicListener, TcpBinding, TcpRegistry, VhostRegistry};
pub use session::{TunnelInfo, TunnelSession};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::TunnelServerConfig;
use crate::error::{Result, TunnelError};
use crate::request::TunnelProtocol;
use crate::tls;

/// Tunnel server builder
pub struct TunnelServer {
    config: TunnelServerConfig,
    request_interceptor: Arc<dyn ProtoRequestInterceptor>,
    http_interceptor: Arc<dyn HttpRequestInterceptor>,
    control_tls: Option<TlsAcceptor>,
    https_tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for TunnelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelServer")
            .field("config", &self.config)
            .field("control_tls", &self.control_tls.is_some())
            .field("https_tls", &self.https_tls.is_some())
            .finish_non_exhaustive()
    }
}

impl TunnelServer {
    /// Server with the default interceptors built from `config.auth` and no
    /// TLS material loaded
    #[must_use]
    pub fn new(config: TunnelServerConfig) -> Self {
        let request_interceptor = Arc::new(DefaultRequestInterceptor::new(&config.auth));
        Self {
            config,
            request_interceptor,
            http_interceptor: Arc::new(DefaultHttpInterceptor),
            control_tls: None,
            https_tls: None,
        }
    }

    /// Server with TLS material loaded from the files named in `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a certificate or
    /// key cannot be loaded.
    pub fn from_config(config: TunnelServerConfig) -> Result<Self> {
        config.validate().map_err(TunnelError::config)?;

        let control_tls = config
            .tls
            .as_ref()
            .map(|files| tls::acceptor_from_files(&files.cert_path, &files.key_path))
            .transpose()?;
        let https_tls = config
            .https_tls
            .as_ref()
            .map(|files| tls::acceptor_from_files(&files.cert_path, &files.key_path))
            .transpose()?;

        let mut server = Self::new(config);
        server.control_tls = control_tls;
        server.https_tls = https_tls;
        Ok(server)
    }

    /// Replace the request policy
    #[must_use]
    pub fn with_request_interceptor(
        mut self,
        interceptor: impl ProtoRequestInterceptor + 'static,
    ) -> Self {
        self.request_interceptor = Arc::new(interceptor);
        self
    }

    /// Replace the HTTP policy
    #[must_use]
    pub fn with_http_interceptor(mut self, interceptor: impl HttpRequestInterceptor + 'static) -> Self {
        self.http_interceptor = Arc::new(interceptor);
        self
    }

    /// Serve the control listener over TLS
    #[must_use]
    pub fn with_control_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.control_tls = Some(acceptor);
        self
    }

    /// Certificate for the HTTPS listener
    #[must_use]
    pub fn with_https_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.https_tls = Some(acceptor);
        self
    }

    /// Bind every configured listener and start accepting
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the HTTPS listener
    /// has no certificate, or a listener cannot be bound.
    pub async fn bind(self) -> Result<RunningServer> {
        self.config.validate().map_err(TunnelError::config)?;
        if self.config.https_bind.is_some() && self.https_tls.is_none() {
            return Err(TunnelError::config("https_bind requires a TLS certificate"));
        }

        let control = TcpListener::bind(self.config.bind_addr).await?;
        let control_addr = control.local_addr()?;

        let http = match self.config.http_bind {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let https = match self.config.https_bind {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let http_addr = http.as_ref().map(TcpListener::local_addr).transpose()?;
        let https_addr = https.as_ref().map(TcpListener::local_addr).transpose()?;

        let ctx = Arc::new(ServerContext::new(
            self.config,
            self.request_interceptor,
            self.http_interceptor,
        ));

        let mut tasks = vec![listener::spawn_control_listener(
            Arc::clone(&ctx),
            control,
            self.control_tls,
        )];
        if let Some(http) = http {
            tasks.push(vhost::spawn_vhost_listener(
                Arc::clone(&ctx),
                http,
                TunnelProtocol::Http,
                None,
            ));
        }
        if let Some(https) = https {
            tasks.push(vhost::spawn_vhost_listener(
                Arc::clone(&ctx),
                https,
                TunnelProtocol::Https,
                self.https_tls,
            ));
        }

        tracing::info!(
            control = %control_addr,
            http = ?http_addr,
            https = ?https_addr,
            tls = ctx.config().tls.is_some(),
            "Tunnel server listening"
        );

        Ok(RunningServer {
            ctx,
            control_addr,
            http_addr,
            https_addr,
            tasks,
        })
    }
}

/// Handle to a server whose listeners are accepting
#[derive(Debug)]
pub struct RunningServer {
    ctx: Arc<ServerContext>,
    control_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Bound control address
    #[must_use]
    pub const fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Bound HTTP address
    #[must_use]
    pub const fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Bound HTTPS address
    #[must_use]
    pub const fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// Shared state, for inspection
    #[must_use]
    pub const fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Number of established tunnels
    #[must_use]
    pub fn tunnel_count(&self) -> usize {
        self.ctx.tunnel_count()
    }

    /// Established tunnels ordered by id
    #[must_use]
    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        self.ctx.list_tunnels()
    }

    /// Stop accepting and tear down every tunnel
    pub fn shutdown(&self) {
        tracing::info!(tunnels = self.ctx.tunnel_count(), "Tunnel server shutting down");
        self.ctx.shutdown_token().cancel();
    }

    /// Wait for the listeners to stop
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
