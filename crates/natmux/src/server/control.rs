//! Server side of a control connection
//!
//! A connection starts awaiting a REQUEST. The request runs through the
//! request interceptor and is registered; the RESPONSE goes out before any
//! public connection can be routed to the tunnel. The connection then
//! relays TRANSFER payloads to public connections and tracks disconnects
//! until either side goes away, at which point the tunnel is unregistered
//! and every public connection it carried is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::{self, ControlHandle, ControlReader};
use crate::error::{Result, TunnelError};
use crate::protocol::Message;
use crate::request::{TunnelProtocol, TunnelRequest};
use crate::server::context::{ServerContext, PORT_RELEASE_TIMEOUT};
use crate::server::listener::spawn_tcp_acceptor;
use crate::server::session::TunnelSession;

/// Time allowed for queued frames to flush when a control connection closes
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Drive one control connection to completion
pub async fn handle_connection<S>(ctx: Arc<ServerContext>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, control, writer) = channel::open(stream, ctx.channel_settings());
    tracing::debug!(peer = %peer, "Control connection opened");

    let session = match await_request(&ctx, &mut reader, &control, peer).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::debug!(peer = %peer, "Control connection closed before a request");
            channel::finish(&control, writer, CLOSE_GRACE).await;
            return;
        }
        Err(e) => {
            if let Some(reason) = e.rejection_reason() {
                tracing::info!(peer = %peer, reason, "Tunnel request rejected");
                control.send(Message::Rejected {
                    reason: reason.to_string(),
                });
            } else {
                tracing::warn!(peer = %peer, error = %e, "Control connection failed");
            }
            channel::finish(&control, writer, CLOSE_GRACE).await;
            return;
        }
    };

    let tunnel_id = session.tunnel_id();
    match run_active(&ctx, &session, &mut reader).await {
        Ok(()) => tracing::info!(tunnel_id, peer = %peer, "Tunnel closed"),
        Err(e) => tracing::warn!(tunnel_id, peer = %peer, error = %e, "Tunnel closed on error"),
    }

    ctx.close_tunnel(&session).await;
    channel::finish(&control, writer, CLOSE_GRACE).await;
}

/// Wait for the REQUEST, answering heartbeats meanwhile
async fn await_request<S: AsyncRead>(
    ctx: &Arc<ServerContext>,
    reader: &mut ControlReader<S>,
    control: &ControlHandle,
    peer: SocketAddr,
) -> Result<Option<Arc<TunnelSession>>> {
    loop {
        let next = tokio::select! {
            biased;
            () = ctx.shutdown_token().cancelled() => return Ok(None),
            next = reader.next() => next,
        };

        match next.transpose()? {
            None => return Ok(None),
            Some(Message::HeartbeatPing) => {
                control.send(Message::HeartbeatPong);
            }
            Some(Message::HeartbeatPong | Message::Unknown { .. }) => {}
            Some(Message::Request(request)) => {
                tracing::debug!(peer = %peer, request = %request, "Tunnel requested");
                return open_tunnel(ctx, request, control, peer).await.map(Some);
            }
            Some(other) => {
                return Err(TunnelError::protocol(format!(
                    "unexpected {:?} before REQUEST",
                    other.message_type()
                )));
            }
        }
    }
}

/// Apply policy, reserve a slot, then register the tunnel
async fn open_tunnel(
    ctx: &Arc<ServerContext>,
    request: TunnelRequest,
    control: &ControlHandle,
    peer: SocketAddr,
) -> Result<Arc<TunnelSession>> {
    let request = ctx.request_interceptor().handle(request)?;

    if !ctx.try_reserve_slot() {
        return Err(TunnelError::rejected("too many tunnels"));
    }
    match register_tunnel(ctx, request, control, peer).await {
        Ok(session) => {
            ctx.track(Arc::clone(&session));
            tracing::info!(
                tunnel_id = session.tunnel_id(),
                peer = %peer,
                protocol = %session.request().protocol,
                local = %session.request().local_target(),
                "Tunnel established"
            );
            Ok(session)
        }
        Err(e) => {
            ctx.release_slot();
            Err(e)
        }
    }
}

/// Register the tunnel and queue the successful RESPONSE
async fn register_tunnel(
    ctx: &Arc<ServerContext>,
    request: TunnelRequest,
    control: &ControlHandle,
    peer: SocketAddr,
) -> Result<Arc<TunnelSession>> {
    let tunnel_id = ctx.next_tunnel_id();
    // Runs under the registry lock: the RESPONSE is queued before any
    // lookup can find the session.
    let accept = |request: TunnelRequest| {
        control.send(Message::Accepted {
            tunnel_id,
            request: request.clone(),
        });
        Arc::new(TunnelSession::new(tunnel_id, request, control.clone(), peer))
    };

    match request.protocol {
        TunnelProtocol::Tcp => {
            let requested = request.remote_port().filter(|port| *port != 0);
            if let Some(port) = requested {
                // A tunnel closed just now may still be dropping this port
                ctx.tcp().wait_released(port, PORT_RELEASE_TIMEOUT).await;
            }
            let binding = ctx
                .tcp()
                .register(requested, |port| accept(request.with_remote_port(port)))?;
            spawn_tcp_acceptor(
                Arc::clone(ctx),
                binding.listener,
                binding.port,
                binding.shutdown,
            );
            Ok(binding.session)
        }
        protocol @ (TunnelProtocol::Http | TunnelProtocol::Https) => {
            let registry = ctx
                .vhosts(protocol)
                .ok_or_else(|| TunnelError::rejected(format!("{protocol} listener not enabled")))?;
            let vhost = request
                .vhost()
                .map(str::to_string)
                .ok_or_else(|| TunnelError::rejected("vhost required"))?;
            registry.register(&vhost, || accept(request))
        }
    }
}

/// Relay client messages until the connection ends
async fn run_active<S: AsyncRead>(
    ctx: &ServerContext,
    session: &TunnelSession,
    reader: &mut ControlReader<S>,
) -> Result<()> {
    let own_id = session.tunnel_id();
    loop {
        let next = tokio::select! {
            biased;
            () = ctx.shutdown_token().cancelled() => return Ok(()),
            next = reader.next() => next,
        };

        let Some(message) = next.transpose()? else {
            return Ok(());
        };

        match message {
            Message::HeartbeatPing => {
                session.send(Message::HeartbeatPong);
            }
            Message::HeartbeatPong | Message::Unknown { .. } => {}
            Message::Transfer {
                tunnel_id,
                session_id,
                data,
            } => {
                if tunnel_id != own_id {
                    tracing::trace!(tunnel_id, session_id, "Dropping transfer for foreign tunnel");
                    continue;
                }
                let Some(conn) = session.connection(session_id) else {
                    tracing::trace!(tunnel_id, session_id, "Dropping transfer for closed session");
                    continue;
                };
                // Never wait on one public socket here: every session of the
                // tunnel is read through this loop.
                if ctx.config().watermarks.overflows(conn.queued(), data.len()) {
                    if let Some(conn) = session.remove(session_id) {
                        tracing::warn!(
                            tunnel_id,
                            session_id,
                            queued = conn.queued(),
                            "Public connection not draining, dropping session"
                        );
                        conn.abort();
                        session.send(Message::RemoteDisconnect {
                            tunnel_id,
                            session_id,
                        });
                    }
                } else {
                    conn.send(data);
                }
            }
            Message::LocalConnected {
                tunnel_id,
                session_id,
            } => {
                tracing::debug!(tunnel_id, session_id, "Local service connected");
            }
            Message::LocalDisconnect {
                tunnel_id,
                session_id,
            } => {
                if tunnel_id != own_id {
                    continue;
                }
                if let Some(conn) = session.remove(session_id) {
                    tracing::debug!(tunnel_id, session_id, "Local service disconnected");
                    conn.close();
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
