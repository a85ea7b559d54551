//! `natmux` - Reverse tunnels through NAT
//!
//! Exposes services on a private network through a public server. A client
//! behind NAT opens a control connection to the server and asks for a
//! tunnel; the server then accepts public connections on the client's
//! behalf and multiplexes them over that single control connection:
//!
//! - **TCP tunnels** - a public port per tunnel, chosen or auto-assigned
//! - **HTTP/HTTPS tunnels** - shared listeners routing by `Host` header
//! - **Policy hooks** - request and HTTP interceptors for tokens, port
//!   allow-lists, basic auth and header rewriting
//!
//! # Architecture
//!
//! - **Control connection**: one TCP (optionally TLS) stream per tunnel
//!   carrying framed messages, with heartbeats in both directions
//! - **Sessions**: every public connection gets a session id, unique within
//!   its tunnel; its bytes travel as TRANSFER frames tagged with
//!   `(tunnel_id, session_id)`
//! - **Registries**: map public ports and vhosts to tunnels, atomically
//!
//! # Protocol
//!
//! Every frame is length-prefixed, big-endian:
//!
//! ```text
//! +-------------+---------+-------------+----------+----------+
//! | FrameLen(4) | Type(1) | HeadLen(4)  | Head     | Data     |
//! +-------------+---------+-------------+----------+----------+
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use natmux::{TunnelClientConfig, TunnelConfig};
//!
//! let config = TunnelClientConfig::new("tunnel.example.com:4900")
//!     .with_tunnel(TunnelConfig::tcp(22).with_remote_port(2222).with_token("tk1"))
//!     .with_tunnel(TunnelConfig::http(3000, "app.example.com"));
//!
//! config.validate().expect("invalid config");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod protocol;
pub mod request;
pub mod server;
pub mod tls;
pub mod token;

// Re-export main types at crate root
pub use client::{run_tunnels, ClientState, LocalConnectionCache, TunnelClient, TunnelEvent};
pub use config::{
    AuthConfig, BasicAuth, ClientTls, TlsFiles, TunnelClientConfig, TunnelConfig,
    TunnelServerConfig,
};
pub use conn::Watermarks;
pub use error::{Result, TunnelError};
pub use http::{HttpRequestHead, HttpResponse};
pub use protocol::{Frame, Message, MessageCodec, MessageType, MAX_FRAME_LENGTH};
pub use request::{TunnelProtocol, TunnelRequest};
pub use server::{
    hash_token, DefaultHttpInterceptor, DefaultRequestInterceptor, HttpRequestInterceptor,
    ProtoRequestInterceptor, RunningServer, TunnelInfo, TunnelServer,
};
pub use token::TokenProducer;
