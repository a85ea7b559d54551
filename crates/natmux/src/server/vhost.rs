//! Shared HTTP and HTTPS listeners routing requests by `Host`
//!
//! Each public connection is read one request at a time. A request head
//! picks the tunnel, gets its own session id and runs through the HTTP
//! interceptor; the head and its body are then relayed as TRANSFER frames.
//! When the next request on a keep-alive connection arrives, the previous
//! session is retired with REMOTE_DISCONNECT and a new one starts, possibly
//! on a different tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::conn::{outbox, spawn_stream_writer, ConnectionHandle, READ_CHUNK_SIZE};
use crate::http::{BodyKind, ChunkedScanner, HeadError, HttpRequestHead, HttpResponse};
use crate::protocol::Message;
use crate::request::TunnelProtocol;
use crate::server::context::ServerContext;
use crate::server::listener::TLS_HANDSHAKE_TIMEOUT;
use crate::server::session::TunnelSession;

/// How long unread input is drained before closing after a local response
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept public HTTP (or, with `tls`, HTTPS) connections until shutdown
pub fn spawn_vhost_listener(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    protocol: TunnelProtocol,
    tls: Option<TlsAcceptor>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = ctx.shutdown_token().clone();
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, %protocol, "Vhost listener has no local address");
                return;
            }
        };

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    tracing::info!(%protocol, "Vhost listener shutting down");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!(%protocol, error = %e, "Vhost accept error");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let ctx = Arc::clone(&ctx);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => {
                                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                                    Ok(Ok(stream)) => {
                                        serve_connection(ctx, stream, protocol, local_addr, remote).await;
                                    }
                                    Ok(Err(e)) => {
                                        tracing::debug!(remote = %remote, error = %e, "HTTPS handshake failed");
                                    }
                                    Err(_) => {
                                        tracing::debug!(remote = %remote, "HTTPS handshake timed out");
                                    }
                                }
                            }
                            None => serve_connection(ctx, stream, protocol, local_addr, remote).await,
                        }
                    });
                }
            }
        }
    })
}

/// Buffered read side of a public HTTP connection
struct PublicReader<S> {
    reader: ReadHalf<S>,
    buf: BytesMut,
    cancel: CancellationToken,
}

impl<S: AsyncRead> PublicReader<S> {
    /// Read more input; `false` on EOF, error or cancellation
    async fn fill(&mut self) -> bool {
        self.buf.reserve(READ_CHUNK_SIZE);
        let read = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            read = self.reader.read_buf(&mut self.buf) => read,
        };
        matches!(read, Ok(n) if n > 0)
    }

    /// Next request head; `Err` carries the response to send before closing
    async fn head(&mut self) -> Result<Option<HttpRequestHead>, HttpResponse> {
        loop {
            match HttpRequestHead::parse(&self.buf) {
                Ok(Some((head, len))) => {
                    self.buf.advance(len);
                    return Ok(Some(head));
                }
                Ok(None) => {}
                Err(HeadError::TooLarge) => return Err(HttpResponse::head_too_large()),
                Err(HeadError::Malformed(reason)) => {
                    tracing::debug!(reason = %reason, "Malformed request head");
                    return Err(HttpResponse::bad_request());
                }
            }
            if !self.fill().await {
                return Ok(None);
            }
        }
    }

    /// Take buffered input, reading first if none is buffered
    async fn chunk(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() && !self.fill().await {
            return None;
        }
        Some(self.buf.split().freeze())
    }

    /// Discard input for a short while so a response is not lost to a reset
    async fn drain(&mut self) {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            self.buf.clear();
            while self.fill().await {
                self.buf.clear();
            }
        })
        .await;
    }
}

/// Session currently carrying a public connection's request
struct Routed {
    session: Arc<TunnelSession>,
    session_id: u64,
}

impl Routed {
    async fn forward(&self, data: Bytes) -> bool {
        self.session
            .send_gated(Message::Transfer {
                tunnel_id: self.session.tunnel_id(),
                session_id: self.session_id,
                data,
            })
            .await
    }

    /// Stop routing; tells the client unless the local side already left
    fn retire(self) {
        if self.session.remove(self.session_id).is_some() {
            self.session.send(Message::RemoteDisconnect {
                tunnel_id: self.session.tunnel_id(),
                session_id: self.session_id,
            });
        }
    }
}

fn respond(conn: &ConnectionHandle, response: &HttpResponse) {
    conn.send(response.encode());
    conn.close();
}

/// Relay one public connection, request by request
pub async fn serve_connection<S>(
    ctx: Arc<ServerContext>,
    stream: S,
    protocol: TunnelProtocol,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some(registry) = ctx.vhosts(protocol) else {
        return;
    };

    let (read_half, write_half) = tokio::io::split(stream);
    let (conn, inbox) = outbox::<Bytes>(ctx.config().watermarks);
    let cancel = conn.cancel_token();
    let _writer = spawn_stream_writer(write_half, inbox, cancel.clone());
    let mut public = PublicReader {
        reader: read_half,
        buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
        cancel,
    };
    let mut current: Option<Routed> = None;

    loop {
        let mut head = match public.head().await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(response) => {
                respond(&conn, &response);
                break;
            }
        };

        let Some(host) = head.host() else {
            respond(&conn, &HttpResponse::bad_request());
            break;
        };
        let Some(session) = registry.lookup(&host) else {
            tracing::debug!(host = %host, remote = %remote_addr, "No tunnel for host");
            respond(&conn, &HttpResponse::not_found(&host));
            break;
        };

        if let Some(previous) = current.take() {
            previous.retire();
        }

        let session_id = session.next_session_id();
        if !session.insert(session_id, conn.clone()) {
            respond(&conn, &HttpResponse::not_found(&host));
            break;
        }
        let routed = Routed {
            session,
            session_id,
        };

        if let Some(response) = ctx.http_interceptor().handle(
            local_addr,
            remote_addr,
            routed.session.request(),
            &mut head,
        ) {
            routed.session.remove(session_id);
            respond(&conn, &response);
            public.drain().await;
            break;
        }

        let tunnel_id = routed.session.tunnel_id();
        tracing::debug!(
            tunnel_id,
            session_id,
            host = %host,
            method = %head.method,
            path = %head.path,
            "Routing request"
        );
        let body_kind = head.body_kind();
        let more = routed.session.send(Message::RemoteConnected {
            tunnel_id,
            session_id,
        }) && routed.forward(head.encode()).await
            && match body_kind {
                BodyKind::Empty => true,
                BodyKind::Length(len) => forward_length(&mut public, &routed, len).await,
                BodyKind::Chunked => forward_chunked(&mut public, &routed).await,
                BodyKind::Tunnel => {
                    forward_raw(&mut public, &routed).await;
                    false
                }
            };
        current = Some(routed);
        if !more {
            break;
        }
    }

    if let Some(routed) = current.take() {
        routed.retire();
    }
    conn.close();
}

async fn forward_length<S: AsyncRead>(
    public: &mut PublicReader<S>,
    routed: &Routed,
    mut remaining: u64,
) -> bool {
    while remaining > 0 {
        if public.buf.is_empty() && !public.fill().await {
            return false;
        }
        let take = usize::try_from(remaining)
            .map_or(public.buf.len(), |r| r.min(public.buf.len()));
        remaining -= take as u64;
        if !routed.forward(public.buf.split_to(take).freeze()).await {
            return false;
        }
    }
    true
}

async fn forward_chunked<S: AsyncRead>(public: &mut PublicReader<S>, routed: &Routed) -> bool {
    let mut scanner = ChunkedScanner::new();
    while !scanner.is_done() {
        if public.buf.is_empty() && !public.fill().await {
            return false;
        }
        let used = match scanner.feed(&public.buf) {
            Ok(used) => used,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed chunked body");
                return false;
            }
        };
        if !routed.forward(public.buf.split_to(used).freeze()).await {
            return false;
        }
    }
    true
}

async fn forward_raw<S: AsyncRead>(public: &mut PublicReader<S>, routed: &Routed) {
    while let Some(data) = public.chunk().await {
        if !routed.forward(data).await {
            return;
        }
    }
}
