//! natmux -- command line front end for the tunnel server and client.

mod cli;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands, Role};
use natmux::{run_tunnels, TunnelClientConfig, TunnelServer, TunnelServerConfig};

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.log_format, cli.verbose);

    let runtime = match build_runtime(cli.worker_threads) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = worker_threads {
        builder.worker_threads(threads.max(1));
    }
    builder.build().context("Failed to start the async runtime")
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Server {
            config,
            bind,
            http_bind,
        } => run_server(config.as_deref(), bind, http_bind).await,
        Commands::Client { config, server } => run_client(&config, server).await,
        Commands::Validate { role, config } => validate(role, &config),
    }
}

async fn run_server(
    path: Option<&Path>,
    bind: Option<SocketAddr>,
    http_bind: Option<SocketAddr>,
) -> Result<()> {
    let mut config: TunnelServerConfig = match path {
        Some(path) => load_config(path)?,
        None => TunnelServerConfig::default(),
    };
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if http_bind.is_some() {
        config.http_bind = http_bind;
    }

    let server = TunnelServer::from_config(config)
        .context("Invalid server configuration")?
        .bind()
        .await
        .context("Failed to start the tunnel server")?;

    shutdown_signal().await;
    server.shutdown();
    server.wait().await;
    tracing::info!("Tunnel server stopped");
    Ok(())
}

async fn run_client(path: &Path, server: Option<String>) -> Result<()> {
    let mut config: TunnelClientConfig = load_config(path)?;
    if let Some(server) = server {
        config.server_addr = server;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    run_tunnels(config, shutdown).await?;
    Ok(())
}

fn validate(role: Role, path: &Path) -> Result<()> {
    let result = match role {
        Role::Server => load_config::<TunnelServerConfig>(path)?.validate(),
        Role::Client => load_config::<TunnelClientConfig>(path)?.validate(),
    };
    result.map_err(anyhow::Error::msg)?;
    println!("{}: ok", path.display());
    Ok(())
}

/// Parse a YAML or TOML file, picked by extension
fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&text).with_context(|| format!("Invalid TOML in {}", path.display()))
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("Invalid YAML in {}", path.display()))
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_path_for_tests(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("natmux-cli-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_load_config_by_extension() {
        let yaml = config_path_for_tests("server.yaml");
        std::fs::write(&yaml, "bind_addr: \"127.0.0.1:7000\"\nmax_tunnels: 5\n").unwrap();
        let config: TunnelServerConfig = load_config(&yaml).unwrap();
        assert_eq!(config.bind_addr.port(), 7000);
        assert_eq!(config.max_tunnels, 5);

        let toml_path = config_path_for_tests("client.toml");
        std::fs::write(
            &toml_path,
            "server_addr = \"example.com:4900\"\n[[tunnels]]\nlocal_port = 22\n",
        )
        .unwrap();
        let config: TunnelClientConfig = load_config(&toml_path).unwrap();
        assert_eq!(config.tunnels.len(), 1);
        assert!(validate(Role::Client, &toml_path).is_ok());

        let _ = std::fs::remove_file(yaml);
        let _ = std::fs::remove_file(toml_path);
    }

    #[test]
    fn test_load_config_errors() {
        assert!(load_config::<TunnelServerConfig>(Path::new("/nonexistent/natmux.yaml")).is_err());

        let bad = config_path_for_tests("bad.yaml");
        std::fs::write(&bad, "bind_addr: [not, an, address]\n").unwrap();
        assert!(load_config::<TunnelServerConfig>(&bad).is_err());
        let _ = std::fs::remove_file(bad);
    }
}
