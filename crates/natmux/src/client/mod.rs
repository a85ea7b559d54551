//! Tunnel client components
//!
//! A [`TunnelClient`] runs one tunnel over its own control connection and
//! dials local services through a [`LocalConnectionCache`].
//! [`run_tunnels`] runs every tunnel of a configuration side by side.

pub mod agent;
pub mod cache;

pub use agent::{ClientState, TunnelClient, TunnelEvent};
pub use cache::LocalConnectionCache;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelClientConfig;
use crate::error::{Result, TunnelError};

/// Run every configured tunnel until all of them stop or `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, TLS material cannot be
/// loaded, or any tunnel stops with an error (the first one is returned).
pub async fn run_tunnels(config: TunnelClientConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate().map_err(TunnelError::config)?;
    if config.tunnels.is_empty() {
        return Err(TunnelError::config("no tunnels configured"));
    }

    let mut clients = JoinSet::new();
    for tunnel in &config.tunnels {
        let label = tunnel.label();
        let client = TunnelClient::from_config(config.clone(), tunnel.clone())?
            .with_shutdown(shutdown.child_token());
        clients.spawn(async move { (label, client.run().await) });
    }

    let mut first_error = None;
    while let Some(joined) = clients.join_next().await {
        match joined {
            Ok((label, Ok(()))) => tracing::info!(tunnel = %label, "Tunnel stopped"),
            Ok((label, Err(e))) => {
                tracing::error!(tunnel = %label, error = %e, "Tunnel failed");
                first_error.get_or_insert(e);
            }
            Err(e) => tracing::error!(error = %e, "Tunnel task panicked"),
        }
    }

    first_error.map_or(Ok(()), Err)
}
