//! Shared fixtures: local services, a server and clients on loopback

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use natmux::{
    RunningServer, TunnelClient, TunnelClientConfig, TunnelConfig, TunnelEvent, TunnelRequest,
    TunnelServer, TunnelServerConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

/// Echo every byte back until the peer closes
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Answer every request head with `200` and `body`, keeping the connection
/// open for the next request
pub async fn http_backend(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else { return };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(end) = find_head_end(&buf) {
                        let head = String::from_utf8_lossy(&buf[..end]).to_string();
                        buf.drain(..end);
                        let seen = head
                            .lines()
                            .filter_map(|l| l.split_once(':'))
                            .filter(|(n, _)| n.eq_ignore_ascii_case("x-real-ip"))
                            .map(|(_, v)| v.trim().to_string())
                            .next()
                            .unwrap_or_default();
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Seen-Real-IP: {seen}\r\n\r\n{body}",
                            body.len()
                        );
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    addr
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

pub fn server_config() -> TunnelServerConfig {
    TunnelServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        public_host: "127.0.0.1".parse().unwrap(),
        port_range: (30000, 60000),
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(3),
        ..Default::default()
    }
}

pub fn http_server_config() -> TunnelServerConfig {
    TunnelServerConfig {
        http_bind: Some("127.0.0.1:0".parse().unwrap()),
        ..server_config()
    }
}

pub async fn start_server(config: TunnelServerConfig) -> RunningServer {
    TunnelServer::new(config).bind().await.unwrap()
}

pub fn client_config(server: &RunningServer) -> TunnelClientConfig {
    let mut config = TunnelClientConfig::new(server.control_addr().to_string());
    config.auto_reconnect = false;
    config.heartbeat_interval = Duration::from_secs(1);
    config.heartbeat_timeout = Duration::from_secs(3);
    config.connect_timeout = Duration::from_secs(2);
    config
}

pub struct RunningClient {
    pub client: Arc<TunnelClient>,
    pub task: JoinHandle<natmux::Result<()>>,
    pub events: mpsc::Receiver<TunnelEvent>,
}

impl RunningClient {
    /// Wait for the tunnel to be accepted
    pub async fn established(&mut self) -> (u64, TunnelRequest) {
        match tokio::time::timeout(WAIT, self.events.recv()).await {
            Ok(Some(TunnelEvent::Established { tunnel_id, request })) => (tunnel_id, request),
            other => panic!("expected an established tunnel, got {other:?}"),
        }
    }

    /// Wait for the client to stop and return how it ended
    pub async fn finished(self) -> natmux::Result<()> {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("client did not stop")
            .unwrap()
    }
}

pub fn start_client(server: &RunningServer, tunnel: TunnelConfig) -> RunningClient {
    start_client_with(client_config(server), tunnel)
}

pub fn start_client_with(config: TunnelClientConfig, tunnel: TunnelConfig) -> RunningClient {
    let (tx, events) = mpsc::channel(16);
    let client = Arc::new(TunnelClient::new(config, tunnel).with_event_channel(tx));
    let task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };
    RunningClient {
        client,
        task,
        events,
    }
}

/// Send `payload` and read the same number of bytes back
pub async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

/// Poll `check` until it holds or the wait expires
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
