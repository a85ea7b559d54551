//! Outbound write queues with watermark backpressure
//!
//! Every connection the proxy owns (control, public, local) is written by a
//! dedicated writer task fed through an [`Outbox`]. The outbox tracks how
//! many bytes are queued but not yet flushed; producers that forward data
//! from a paired source connection call [`Outbox::send_gated`], which parks
//! while the queue sits above the high watermark and resumes once it drains
//! below the low watermark. Control traffic and close requests bypass the
//! gate.
//!
//! A reader shared by many sessions must not park on any one of them. It
//! queues with [`Outbox::send`] instead and drops a session once
//! [`Watermarks::overflows`] says its queue has grown too far.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Read buffer size for relayed connections
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

const fn default_high_watermark() -> usize {
    256 * 1024
}

const fn default_low_watermark() -> usize {
    64 * 1024
}

const fn default_overflow() -> usize {
    8 * 1024 * 1024
}

/// Queue thresholds in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Producers pause above this
    #[serde(default = "default_high_watermark")]
    pub high: usize,
    /// Producers resume below this
    #[serde(default = "default_low_watermark")]
    pub low: usize,
    /// A relayed session whose queue would grow past this is dropped
    /// instead of stalling the control connection it shares
    #[serde(default = "default_overflow")]
    pub overflow: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            high: default_high_watermark(),
            low: default_low_watermark(),
            overflow: default_overflow(),
        }
    }
}

impl Watermarks {
    /// Validate the thresholds
    ///
    /// # Errors
    ///
    /// Returns an error string if `low` exceeds `high`, `high` is 0 or
    /// `overflow` is below `high`.
    pub fn validate(&self) -> Result<(), String> {
        if self.high == 0 {
            return Err("high watermark must be > 0".to_string());
        }
        if self.low > self.high {
            return Err(format!(
                "low watermark ({}) must be <= high watermark ({})",
                self.low, self.high
            ));
        }
        if self.overflow < self.high {
            return Err(format!(
                "overflow ({}) must be >= high watermark ({})",
                self.overflow, self.high
            ));
        }
        Ok(())
    }

    /// Whether queueing `incoming` more bytes behind `queued` would overflow
    #[must_use]
    pub const fn overflows(&self, queued: usize, incoming: usize) -> bool {
        queued.saturating_add(incoming) > self.overflow
    }
}

// =============================================================================
// Write buffer accounting
// =============================================================================

#[derive(Debug)]
struct BufferState {
    queued: usize,
    writable: bool,
    closed: bool,
}

/// Byte accounting for one outbound queue
#[derive(Debug)]
pub struct WriteBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
    watermarks: Watermarks,
}

impl WriteBuffer {
    /// Create an empty, writable buffer
    #[must_use]
    pub fn new(watermarks: Watermarks) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queued: 0,
                writable: true,
                closed: false,
            }),
            notify: Notify::new(),
            watermarks,
        }
    }

    fn add(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.queued += bytes;
        if state.queued > self.watermarks.high {
            state.writable = false;
        }
    }

    /// Account for bytes handed to the socket
    pub fn release(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(bytes);
        if !state.writable && state.queued <= self.watermarks.low {
            state.writable = true;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Mark the queue dead and wake every waiter
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Bytes queued and not yet flushed
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queued
    }

    /// Whether producers may enqueue without waiting
    #[must_use]
    pub fn is_writable(&self) -> bool {
        let state = self.state.lock();
        state.writable && !state.closed
    }

    /// Whether the writer side has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until the queue drains below the low watermark.
    ///
    /// Returns `false` if the queue was closed instead.
    pub async fn wait_writable(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.closed {
                    return false;
                }
                if state.writable {
                    return true;
                }
            }
            notified.await;
        }
    }
}

// =============================================================================
// Outbox / Inbox
// =============================================================================

/// Queue item weight for watermark accounting
pub trait Weighted {
    /// Bytes this item will occupy on the wire
    fn weight(&self) -> usize;
}

impl Weighted for Bytes {
    fn weight(&self) -> usize {
        self.len()
    }
}

/// Item carried by an outbox
#[derive(Debug)]
pub enum Outbound<T> {
    /// Write this item
    Item(T),
    /// Flush everything queued before this, then shut the stream down
    Close,
}

impl<T: Weighted> Weighted for Outbound<T> {
    fn weight(&self) -> usize {
        match self {
            Self::Item(item) => item.weight(),
            Self::Close => 0,
        }
    }
}

/// Producer side of a writer task's queue
#[derive(Debug)]
pub struct Outbox<T> {
    tx: mpsc::UnboundedSender<Outbound<T>>,
    buffer: Arc<WriteBuffer>,
    cancel: CancellationToken,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            buffer: Arc::clone(&self.buffer),
            cancel: self.cancel.clone(),
        }
    }
}

/// Consumer side, owned by the writer task
#[derive(Debug)]
pub struct Inbox<T> {
    rx: mpsc::UnboundedReceiver<Outbound<T>>,
    buffer: Arc<WriteBuffer>,
}

/// Create a connected outbox/inbox pair
#[must_use]
pub fn outbox<T: Weighted>(watermarks: Watermarks) -> (Outbox<T>, Inbox<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffer = Arc::new(WriteBuffer::new(watermarks));
    (
        Outbox {
            tx,
            buffer: Arc::clone(&buffer),
            cancel: CancellationToken::new(),
        },
        Inbox { rx, buffer },
    )
}

impl<T: Weighted> Outbox<T> {
    /// Queue an item without waiting for writability.
    ///
    /// Returns `false` if the writer is gone.
    pub fn send(&self, item: T) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let weight = item.weight();
        self.buffer.add(weight);
        if self.tx.send(Outbound::Item(item)).is_err() {
            self.buffer.release(weight);
            return false;
        }
        true
    }

    /// Queue an item once the queue is writable.
    ///
    /// Returns `false` if the writer is gone.
    pub async fn send_gated(&self, item: T) -> bool {
        if !self.buffer.is_writable() {
            tokio::select! {
                writable = self.buffer.wait_writable() => {
                    if !writable {
                        return false;
                    }
                }
                () = self.cancel.cancelled() => return false,
            }
        }
        self.send(item)
    }

    /// Flush what is queued, then shut the stream down.
    ///
    /// Falls back to [`Outbox::abort`] if the writer is already gone.
    pub fn close(&self) {
        if self.tx.send(Outbound::Close).is_err() {
            self.abort();
        }
    }

    /// Drop the stream without flushing
    pub fn abort(&self) {
        self.cancel.cancel();
        self.buffer.close();
    }

    /// Resolves once the writer has finished or the stream was aborted
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether the writer has finished or the stream was aborted
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether producers may enqueue without waiting
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.buffer.is_writable()
    }

    /// Bytes queued and not yet flushed
    #[must_use]
    pub fn queued(&self) -> usize {
        self.buffer.queued()
    }

    /// Token cancelled when this stream goes away
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether two outboxes feed the same writer
    #[must_use]
    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl<T> Inbox<T> {
    /// Next queued item; `None` once every outbox is dropped
    pub async fn recv(&mut self) -> Option<Outbound<T>> {
        self.rx.recv().await
    }

    /// Next queued item if one is ready
    pub fn try_recv(&mut self) -> Option<Outbound<T>> {
        self.rx.try_recv().ok()
    }

    /// Account for bytes handed to the socket
    pub fn release(&self, bytes: usize) {
        self.buffer.release(bytes);
    }
}

impl<T> Drop for Inbox<T> {
    fn drop(&mut self) {
        self.buffer.close();
    }
}

/// Handle to a relayed byte stream (public or local connection)
pub type ConnectionHandle = Outbox<Bytes>;

// =============================================================================
// Byte stream writer / reader
// =============================================================================

/// Spawn the writer task for a relayed byte stream.
///
/// The task ends after a [`Outbound::Close`] has been flushed, when the
/// write fails, or when the stream is aborted. In every case the stream's
/// cancellation token is cancelled on exit so the paired reader stops too.
pub fn spawn_stream_writer<W>(
    writer: W,
    inbox: Inbox<Bytes>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        run_stream_writer(writer, inbox, &cancel).await;
        cancel.cancel();
    })
}

async fn run_stream_writer<W>(mut writer: W, mut inbox: Inbox<Bytes>, cancel: &CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            item = inbox.recv() => item,
        };

        match item {
            Some(Outbound::Item(data)) => {
                let len = data.len();
                let written = tokio::select! {
                    () = cancel.cancelled() => return,
                    res = writer.write_all(&data) => res,
                };
                if let Err(e) = written {
                    tracing::debug!(error = %e, "Stream write failed");
                    return;
                }
                if inbox.rx.is_empty() && writer.flush().await.is_err() {
                    return;
                }
                inbox.release(len);
            }
            Some(Outbound::Close) | None => {
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

/// Read a relayed stream chunk by chunk until EOF, error or cancellation.
///
/// `forward` returns `false` to stop reading (destination gone).
pub async fn pump_reads<R, F, Fut>(mut reader: R, cancel: &CancellationToken, mut forward: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(Bytes) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            res = reader.read_buf(&mut buf) => res,
        };
        match read {
            Ok(0) => return,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if !forward(chunk).await {
                    return;
                }
                buf.reserve(READ_CHUNK_SIZE);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stream read failed");
                return;
            }
        }
    }
}
