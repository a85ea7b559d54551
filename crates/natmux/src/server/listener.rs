//! Accept loops for the control listener and per-tunnel TCP listeners

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::conn::{outbox, pump_reads, spawn_stream_writer};
use crate::protocol::Message;
use crate::server::context::ServerContext;
use crate::server::control::handle_connection;
use crate::server::registry::PublicListener;

/// Time allowed for a TLS handshake on an accepted connection
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept control connections until the server shuts down
pub fn spawn_control_listener(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = ctx.shutdown_token().clone();
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    tracing::info!("Control listener shutting down");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let ctx = Arc::clone(&ctx);
                            let tls = tls.clone();
                            tokio::spawn(async move {
                                match tls {
                                    Some(acceptor) => {
                                        let handshake = tokio::time::timeout(
                                            TLS_HANDSHAKE_TIMEOUT,
                                            acceptor.accept(stream),
                                        )
                                        .await;
                                        match handshake {
                                            Ok(Ok(stream)) => handle_connection(ctx, stream, peer).await,
                                            Ok(Err(e)) => {
                                                tracing::debug!(peer = %peer, error = %e, "Control TLS handshake failed");
                                            }
                                            Err(_) => {
                                                tracing::debug!(peer = %peer, "Control TLS handshake timed out");
                                            }
                                        }
                                    }
                                    None => handle_connection(ctx, stream, peer).await,
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Control accept error");
                        }
                    }
                }
            }
        }
    })
}

/// Accept public connections on a TCP tunnel's port until the tunnel is
/// unregistered or the server shuts down.
///
/// The listener is dropped as the task ends, releasing the port.
pub fn spawn_tcp_acceptor(
    ctx: Arc<ServerContext>,
    listener: PublicListener,
    port: u16,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let server_shutdown = ctx.shutdown_token().clone();
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    tracing::info!(port, "TCP listener shutting down");
                    break;
                }

                () = server_shutdown.cancelled() => break,

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            tokio::spawn(handle_tcp_connection(Arc::clone(&ctx), stream, remote, port));
                        }
                        Err(e) => {
                            tracing::error!(port, error = %e, "TCP accept error");
                        }
                    }
                }
            }
        }
    })
}

/// Relay one public TCP connection through the tunnel owning `port`
async fn handle_tcp_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    remote: SocketAddr,
    port: u16,
) {
    let Some(session) = ctx.tcp().lookup(port) else {
        tracing::debug!(port, remote = %remote, "No tunnel on port, dropping connection");
        return;
    };
    let _ = stream.set_nodelay(true);

    let tunnel_id = session.tunnel_id();
    let session_id = session.next_session_id();
    let (conn, inbox) = outbox::<Bytes>(ctx.config().watermarks);
    let cancel = conn.cancel_token();

    if !session.insert(session_id, conn.clone()) {
        return;
    }
    if !session.send(Message::RemoteConnected {
        tunnel_id,
        session_id,
    }) {
        session.remove(session_id);
        return;
    }
    tracing::debug!(tunnel_id, session_id, remote = %remote, "Public connection opened");

    let (read_half, write_half) = stream.into_split();
    let _writer = spawn_stream_writer(write_half, inbox, cancel.clone());

    pump_reads(read_half, &cancel, |data| {
        let session = Arc::clone(&session);
        async move {
            session
                .send_gated(Message::Transfer {
                    tunnel_id,
                    session_id,
                    data,
                })
                .await
        }
    })
    .await;

    // Still routed means the public side ended first
    if let Some(conn) = session.remove(session_id) {
        conn.close();
        session.send(Message::RemoteDisconnect {
            tunnel_id,
            session_id,
        });
    }
    tracing::debug!(tunnel_id, session_id, "Public connection closed");
}
