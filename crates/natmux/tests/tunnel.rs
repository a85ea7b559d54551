//! End-to-end TCP tunnels over loopback

mod common;

use std::time::Duration;

use common::*;
use natmux::{AuthConfig, TunnelConfig, TunnelEvent, Watermarks};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

#[tokio::test]
async fn test_tcp_tunnel_relays_both_ways() {
    let echo = echo_server().await;
    let server = start_server(server_config()).await;
    let mut client = start_client(&server, TunnelConfig::tcp(echo.port()));

    let (_, request) = client.established().await;
    let port = request.remote_port().expect("assigned port");
    assert!((30000..=60000).contains(&port));

    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_eq!(roundtrip(&mut public, b"hello").await, b"hello");
    assert_eq!(roundtrip(&mut public, b"again").await, b"again");

    client.client.shutdown();
    client.finished().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let echo = echo_server().await;
    let server = start_server(server_config()).await;
    let mut client = start_client(&server, TunnelConfig::tcp(echo.port()));
    let (_, request) = client.established().await;
    let port = request.remote_port().unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        tasks.push(tokio::spawn(async move {
            let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let payload = vec![i; 64 * 1024];
            roundtrip(&mut public, &payload).await == payload
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap());
    }

    client.client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_requested_port_in_use_is_rejected() {
    let echo = echo_server().await;
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let server = start_server(server_config()).await;
    let mut client = start_client(&server, TunnelConfig::tcp(echo.port()).with_remote_port(port));

    match tokio::time::timeout(WAIT, client.events.recv()).await {
        Ok(Some(TunnelEvent::Rejected { reason })) => assert_eq!(reason, format!("bindPort: {port}")),
        other => panic!("expected rejection, got {other:?}"),
    }
    let err = client.finished().await.unwrap_err();
    assert!(err.is_rejection());
    assert_eq!(server.tunnel_count(), 0);
    server.shutdown();
}

#[tokio::test]
async fn test_only_one_tunnel_wins_a_port() {
    let echo = echo_server().await;
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let server = start_server(server_config()).await;

    let clients: Vec<_> = (0..4)
        .map(|_| start_client(&server, TunnelConfig::tcp(echo.port()).with_remote_port(port)))
        .collect();

    let mut established = 0;
    let mut rejected = 0;
    for mut client in clients {
        match tokio::time::timeout(WAIT, client.events.recv()).await {
            Ok(Some(TunnelEvent::Established { .. })) => established += 1,
            Ok(Some(TunnelEvent::Rejected { .. })) => rejected += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
        client.client.shutdown();
    }
    assert_eq!(established, 1);
    assert_eq!(rejected, 3);
    server.shutdown();
}

#[tokio::test]
async fn test_tunnel_ids_are_unique() {
    let echo = echo_server().await;
    let server = start_server(server_config()).await;

    let mut first = start_client(&server, TunnelConfig::tcp(echo.port()));
    let mut second = start_client(&server, TunnelConfig::tcp(echo.port()));
    let (id_a, req_a) = first.established().await;
    let (id_b, req_b) = second.established().await;

    assert_ne!(id_a, id_b);
    assert_ne!(req_a.remote_port(), req_b.remote_port());
    assert_eq!(server.tunnel_count(), 2);

    let ids: Vec<u64> = server.list_tunnels().iter().map(|t| t.tunnel_id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    first.client.shutdown();
    second.client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_teardown_closes_public_connections_and_frees_port() {
    let echo = echo_server().await;
    let server = start_server(server_config()).await;
    let mut client = start_client(&server, TunnelConfig::tcp(echo.port()));
    let (_, request) = client.established().await;
    let port = request.remote_port().unwrap();

    let mut publics = Vec::new();
    for _ in 0..3 {
        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert_eq!(roundtrip(&mut public, b"up").await, b"up");
        publics.push(public);
    }

    client.client.shutdown();
    client.finished().await.unwrap();

    for mut public in publics {
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(WAIT, public.read(&mut buf))
            .await
            .expect("public connection left open");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
    assert!(eventually(|| server.tunnel_count() == 0).await);

    // The same port can be claimed again as soon as the tunnel is gone
    let mut next = start_client(&server, TunnelConfig::tcp(echo.port()).with_remote_port(port));
    let (_, request) = next.established().await;
    assert_eq!(request.remote_port(), Some(port));
    next.client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_local_close_first_ends_every_session() {
    // Greets each connection and hangs up without reading
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = local.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = local.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(b"bye").await;
            });
        }
    });

    let server = start_server(server_config()).await;
    let mut client = start_client(&server, TunnelConfig::tcp(local_port));
    let (_, request) = client.established().await;
    let port = request.remote_port().unwrap();

    let mut tasks = Vec::new();
    for _ in 0..50 {
        tasks.push(tokio::spawn(async move {
            let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let mut seen = Vec::new();
            tokio::time::timeout(WAIT, public.read_to_end(&mut seen))
                .await
                .expect("public connection left open")
                .unwrap();
            seen
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), b"bye");
    }

    assert!(eventually(|| client.client.active_sessions() == 0).await);
    assert!(eventually(|| server.list_tunnels()[0].session_count == 0).await);
    assert_eq!(server.tunnel_count(), 1);

    client.client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_stalled_local_service_does_not_block_other_sessions() {
    // Accepts but never reads for the first connection, echoes the rest
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = local.local_addr().unwrap().port();
    let (first_tx, first_rx) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((_stalled, _)) = local.accept().await else { return };
        let _ = first_tx.send(());
        while let Ok((mut stream, _)) = local.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    let server = start_server(server_config()).await;
    let mut config = client_config(&server);
    config.watermarks = Watermarks {
        overflow: 1024 * 1024,
        ..Watermarks::default()
    };
    let mut client = start_client_with(config, TunnelConfig::tcp(local_port));
    let (_, request) = client.established().await;
    let port = request.remote_port().unwrap();

    let mut stalled = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tokio::time::timeout(WAIT, first_rx).await.unwrap().unwrap();
    let flood = tokio::spawn(async move {
        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..512 {
            if stalled.write_all(&chunk).await.is_err() {
                break;
            }
        }
        stalled
    });

    let mut live = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_eq!(roundtrip(&mut live, b"hi").await, b"hi");

    // The flooded session is dropped rather than left to stall the tunnel
    let mut stalled = tokio::time::timeout(WAIT * 2, flood)
        .await
        .expect("flooded session never dropped")
        .unwrap();
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(WAIT, stalled.read_to_end(&mut rest)).await;
    assert!(eventually(|| client.client.active_sessions() == 1).await);
    assert_eq!(roundtrip(&mut live, b"still").await, b"still");

    client.client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_local_service_down_closes_nothing_else() {
    let dead_port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let echo = echo_server().await;
    let server = start_server(server_config()).await;
    let mut broken = start_client(&server, TunnelConfig::tcp(dead_port));
    let mut working = start_client(&server, TunnelConfig::tcp(echo.port()));
    let (_, broken_req) = broken.established().await;
    let (_, working_req) = working.established().await;

    // Nothing answers behind the broken tunnel, but its control connection survives
    let mut public = TcpStream::connect(("127.0.0.1", broken_req.remote_port().unwrap()))
        .await
        .unwrap();
    let _ = tokio::io::AsyncWriteExt::write_all(&mut public, b"anyone?").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.tunnel_count(), 2);

    let mut other = TcpStream::connect(("127.0.0.1", working_req.remote_port().unwrap()))
        .await
        .unwrap();
    assert_eq!(roundtrip(&mut other, b"fine").await, b"fine");

    broken.client.shutdown();
    working.client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_invalid_token_is_rejected() {
    let echo = echo_server().await;
    let mut config = server_config();
    config.auth = AuthConfig {
        tokens: vec!["tk1".to_string()],
        allowed_ports: Vec::new(),
    };
    let server = start_server(config).await;

    let mut denied = start_client(&server, TunnelConfig::tcp(echo.port()).with_token("nope"));
    match tokio::time::timeout(WAIT, denied.events.recv()).await {
        Ok(Some(TunnelEvent::Rejected { reason })) => assert_eq!(reason, "invalid token"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(denied.finished().await.is_err());

    let mut allowed = start_client(&server, TunnelConfig::tcp(echo.port()).with_token("tk1"));
    allowed.established().await;
    allowed.client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_server_shutdown_ends_client() {
    let echo = echo_server().await;
    let server = start_server(server_config()).await;
    let mut client = start_client(&server, TunnelConfig::tcp(echo.port()));
    client.established().await;

    server.shutdown();
    match tokio::time::timeout(WAIT, client.events.recv()).await {
        Ok(Some(TunnelEvent::Disconnected { .. })) => {}
        other => panic!("expected disconnect, got {other:?}"),
    }
    // auto_reconnect is off, so the client stops
    let _ = client.finished().await;
    server.wait().await;
}
