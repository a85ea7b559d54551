use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Reverse tunnels through NAT
#[derive(Parser)]
#[command(name = "natmux")]
#[command(version, about = "Expose private TCP and HTTP(S) services through a public server")]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "pretty", env = "NATMUX_LOG_FORMAT")]
    pub(crate) log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace); `RUST_LOG` takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Tokio worker threads (defaults to the number of cores)
    #[arg(long, global = true, env = "NATMUX_WORKER_THREADS")]
    pub(crate) worker_threads: Option<usize>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the public tunnel server
    Server {
        /// Server configuration file (YAML or TOML)
        #[arg(short, long, env = "NATMUX_SERVER_CONFIG")]
        config: Option<PathBuf>,

        /// Control listener address, overriding the file
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Shared HTTP listener address, overriding the file
        #[arg(long)]
        http_bind: Option<SocketAddr>,
    },

    /// Run the tunnel client next to the private services
    Client {
        /// Client configuration file (YAML or TOML)
        #[arg(short, long, env = "NATMUX_CLIENT_CONFIG")]
        config: PathBuf,

        /// Server address, overriding the file
        #[arg(long)]
        server: Option<String>,
    },

    /// Check a configuration file and exit
    Validate {
        /// Which side the file configures
        #[arg(value_enum)]
        role: Role,

        /// Configuration file (YAML or TOML)
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    /// Human readable, multi-line
    Pretty,
    /// Single-line
    Compact,
    /// One JSON object per event
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Role {
    /// `natmux server` configuration
    Server,
    /// `natmux client` configuration
    Client,
}
