//! Connections from the client to local services, keyed by session

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::TcpStream;

use crate::channel::ControlHandle;
use crate::conn::{outbox, pump_reads, spawn_stream_writer, ConnectionHandle, Watermarks};
use crate::error::{Result, TunnelError};
use crate::protocol::Message;

/// Local service connections by `(tunnel_id, session_id)`
#[derive(Debug)]
pub struct LocalConnectionCache {
    entries: DashMap<(u64, u64), ConnectionHandle>,
    connect_timeout: Duration,
    watermarks: Watermarks,
}

impl LocalConnectionCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(connect_timeout: Duration, watermarks: Watermarks) -> Self {
        Self {
            entries: DashMap::new(),
            connect_timeout,
            watermarks,
        }
    }

    /// Connection for a session, dialing `target` if there is none yet.
    ///
    /// Returns the connection and whether it was dialed by this call. A
    /// freshly dialed connection relays everything the local service sends
    /// back as TRANSFER frames on `control`, and reports LOCAL_DISCONNECT
    /// when the service closes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the local service cannot be reached within the
    /// connect timeout.
    pub async fn acquire(
        self: &Arc<Self>,
        target: &str,
        tunnel_id: u64,
        session_id: u64,
        control: &ControlHandle,
    ) -> Result<(ConnectionHandle, bool)> {
        let key = (tunnel_id, session_id);
        if let Some(existing) = self.entries.get(&key) {
            return Ok((existing.value().clone(), false));
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| TunnelError::timeout())??;
        let _ = stream.set_nodelay(true);

        let (conn, inbox) = outbox::<Bytes>(self.watermarks);
        match self.entries.entry(key) {
            // Raced with another dial for the same session; keep the first
            Entry::Occupied(existing) => return Ok((existing.get().clone(), false)),
            Entry::Vacant(slot) => {
                slot.insert(conn.clone());
            }
        }

        let cancel = conn.cancel_token();
        let (read_half, write_half) = stream.into_split();
        let _writer = spawn_stream_writer(write_half, inbox, cancel.clone());

        let cache = Arc::clone(self);
        let control = control.clone();
        let handle = conn.clone();
        tokio::spawn(async move {
            pump_reads(read_half, &cancel, |data| {
                let control = control.clone();
                async move {
                    control
                        .send_gated(Message::Transfer {
                            tunnel_id,
                            session_id,
                            data,
                        })
                        .await
                }
            })
            .await;

            // Still cached means the local service ended first
            if cache
                .entries
                .remove_if(&key, |_, cached| cached.same_stream(&handle))
                .is_some()
            {
                handle.close();
                control.send(Message::LocalDisconnect {
                    tunnel_id,
                    session_id,
                });
                tracing::debug!(tunnel_id, session_id, "Local service closed connection");
            }
        });

        tracing::debug!(tunnel_id, session_id, local = %target, "Local service connected");
        Ok((conn, true))
    }

    /// Close a session's connection once its queued data is flushed;
    /// `false` if there was none
    pub fn remove(&self, tunnel_id: u64, session_id: u64) -> bool {
        match self.entries.remove(&(tunnel_id, session_id)) {
            Some((_, conn)) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Drop a session's connection without flushing what is queued;
    /// `false` if there was none
    pub fn abort(&self, tunnel_id: u64, session_id: u64) -> bool {
        match self.entries.remove(&(tunnel_id, session_id)) {
            Some((_, conn)) => {
                conn.abort();
                true
            }
            None => false,
        }
    }

    /// Close every connection of a tunnel; returns how many were closed
    pub fn remove_tunnel(&self, tunnel_id: u64) -> usize {
        let keys: Vec<(u64, u64)> = self
            .entries
            .iter()
            .map(|e| *e.key())
            .filter(|(tid, _)| *tid == tunnel_id)
            .collect();
        keys.into_iter()
            .filter(|(tid, sid)| self.remove(*tid, *sid))
            .count()
    }

    /// Whether a session has a connection
    #[must_use]
    pub fn contains(&self, tunnel_id: u64, session_id: u64) -> bool {
        self.entries.contains_key(&(tunnel_id, session_id))
    }

    /// Number of cached connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Outbound;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn cache() -> Arc<LocalConnectionCache> {
        Arc::new(LocalConnectionCache::new(
            Duration::from_secs(2),
            Watermarks::default(),
        ))
    }

    #[tokio::test]
    async fn test_acquire_dials_once_and_relays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let (control, mut control_inbox) = outbox::<Message>(Watermarks::default());
        let cache = cache();

        let (conn, fresh) = cache.acquire(&target, 1, 1, &control).await.unwrap();
        assert!(fresh);
        let (again, fresh) = cache.acquire(&target, 1, 1, &control).await.unwrap();
        assert!(!fresh);
        assert!(again.same_stream(&conn));

        let (mut local, _) = listener.accept().await.unwrap();
        conn.send(Bytes::from_static(b"ping"));
        let mut buf = [0u8; 4];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        local.write_all(b"pong").await.unwrap();
        match control_inbox.recv().await {
            Some(Outbound::Item(Message::Transfer {
                tunnel_id,
                session_id,
                data,
            })) => {
                assert_eq!((tunnel_id, session_id), (1, 1));
                assert_eq!(&data[..], b"pong");
            }
            other => panic!("expected transfer, got {other:?}"),
        }

        drop(local);
        assert!(matches!(
            control_inbox.recv().await,
            Some(Outbound::Item(Message::LocalDisconnect {
                tunnel_id: 1,
                session_id: 1
            }))
        ));
        assert!(!cache.contains(1, 1));
    }

    #[tokio::test]
    async fn test_remove_does_not_report_local_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let (control, mut control_inbox) = outbox::<Message>(Watermarks::default());
        let cache = cache();

        cache.acquire(&target, 3, 7, &control).await.unwrap();
        let (mut local, _) = listener.accept().await.unwrap();
        assert!(cache.remove(3, 7));
        assert!(!cache.remove(3, 7));

        // local side sees EOF
        let mut buf = Vec::new();
        local.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        let quiet = tokio::time::timeout(Duration::from_millis(100), control_inbox.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_remove_tunnel_only_touches_that_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let (control, _control_inbox) = outbox::<Message>(Watermarks::default());
        let cache = cache();

        cache.acquire(&target, 1, 1, &control).await.unwrap();
        cache.acquire(&target, 1, 2, &control).await.unwrap();
        cache.acquire(&target, 2, 1, &control).await.unwrap();
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.remove_tunnel(1), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(2, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_acquire_keeps_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let (control, _control_inbox) = outbox::<Message>(Watermarks::default());
        let cache = cache();

        let (a, b) = tokio::join!(
            cache.acquire(&target, 4, 9, &control),
            cache.acquire(&target, 4, 9, &control),
        );
        let (a, a_fresh) = a.unwrap();
        let (b, b_fresh) = b.unwrap();
        assert!(a.same_stream(&b));
        assert_eq!(cache.len(), 1);

        // Both dials reached the service; the one that lost the insert is
        // closed and the kept one stays open.
        let accept = || async {
            tokio::time::timeout(Duration::from_secs(2), listener.accept())
                .await
                .expect("both dials reach the service")
                .unwrap()
                .0
        };
        let mut first = accept().await;
        let mut second = accept().await;
        let mut closed = 0;
        for local in [&mut first, &mut second] {
            let mut buf = [0u8; 1];
            if let Ok(read) =
                tokio::time::timeout(Duration::from_millis(300), local.read(&mut buf)).await
            {
                assert_eq!(read.unwrap(), 0);
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert!(a_fresh ^ b_fresh);

        a.send(Bytes::from_static(b"x"));
        assert!(cache.contains(4, 9));
    }

    #[tokio::test]
    async fn test_abort_drops_queued_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let (control, mut control_inbox) = outbox::<Message>(Watermarks::default());
        let cache = cache();

        let (conn, _) = cache.acquire(&target, 2, 2, &control).await.unwrap();
        let (mut local, _) = listener.accept().await.unwrap();
        assert!(cache.abort(2, 2));
        assert!(!cache.abort(2, 2));
        assert!(conn.is_closed());

        let mut buf = Vec::new();
        let _ = local.read_to_end(&mut buf).await;
        let quiet = tokio::time::timeout(Duration::from_millis(100), control_inbox.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let target = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (control, _control_inbox) = outbox::<Message>(Watermarks::default());
        let cache = cache();

        assert!(cache.acquire(&target, 1, 1, &control).await.is_err());
        assert!(cache.is_empty());
    }
}
