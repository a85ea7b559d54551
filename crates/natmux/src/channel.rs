//! Control connection plumbing shared by server and client
//!
//! A control stream is split into a framed reader, consumed by the
//! connection task, and a writer task fed through a [`ControlHandle`].
//! The writer emits a heartbeat PING whenever nothing was written for
//! `heartbeat_interval`; the reader reports [`TunnelError::Timeout`] when
//! nothing arrived for `heartbeat_timeout`.

use crate::conn::{outbox, Inbox, Outbound, Outbox, Watermarks, Weighted};
use crate::error::{Result, TunnelError};
use crate::protocol::{Message, MessageCodec};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

impl Weighted for Message {
    fn weight(&self) -> usize {
        self.wire_len()
    }
}

/// Handle used to queue messages on a control connection
pub type ControlHandle = Outbox<Message>;

/// Timing and buffering of one control connection
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    /// Writer idle period before a PING is sent
    pub heartbeat_interval: Duration,
    /// Reader idle period before the peer is declared dead
    pub heartbeat_timeout: Duration,
    /// Control queue thresholds
    pub watermarks: Watermarks,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(180),
            watermarks: Watermarks::default(),
        }
    }
}

/// Read side of a control connection
pub struct ControlReader<S> {
    frames: FramedRead<ReadHalf<S>, MessageCodec>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl<S: AsyncRead> ControlReader<S> {
    /// Next message.
    ///
    /// `None` on clean EOF or once the writer side has gone away.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            next = tokio::time::timeout(self.idle_timeout, self.frames.next()) => match next {
                Ok(item) => item,
                Err(_) => Some(Err(TunnelError::timeout())),
            },
        }
    }
}

/// Split a control stream and start its writer task
pub fn open<S>(stream: S, settings: ChannelSettings) -> (ControlReader<S>, ControlHandle, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (handle, inbox) = outbox::<Message>(settings.watermarks);
    let cancel = handle.cancel_token();

    let writer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let frames = FramedWrite::new(write_half, MessageCodec);
            if let Err(e) = run_writer(frames, inbox, settings.heartbeat_interval, &cancel).await {
                tracing::debug!(error = %e, "Control writer stopped");
            }
            cancel.cancel();
        })
    };

    let reader = ControlReader {
        frames: FramedRead::new(read_half, MessageCodec),
        idle_timeout: settings.heartbeat_timeout,
        cancel,
    };
    (reader, handle, writer)
}

async fn run_writer<S: AsyncWrite>(
    mut frames: FramedWrite<WriteHalf<S>, MessageCodec>,
    mut inbox: Inbox<Message>,
    heartbeat_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            next = tokio::time::timeout(heartbeat_interval, inbox.recv()) => next,
        };

        let first = match next {
            Ok(Some(Outbound::Item(message))) => message,
            Ok(Some(Outbound::Close) | None) => {
                frames.close().await?;
                return Ok(());
            }
            Err(_) => {
                tracing::trace!("Writer idle, sending heartbeat");
                Message::HeartbeatPing
            }
        };

        // Batch whatever is already queued into one flush
        let mut written = first.weight();
        let mut closing = false;
        let write = async {
            frames.feed(first).await?;
            while let Some(item) = inbox.try_recv() {
                match item {
                    Outbound::Item(message) => {
                        written += message.weight();
                        frames.feed(message).await?;
                    }
                    Outbound::Close => {
                        closing = true;
                        break;
                    }
                }
            }
            frames.flush().await
        };
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            res = write => res?,
        }
        inbox.release(written);

        if closing {
            frames.close().await?;
            return Ok(());
        }
    }
}

/// Close a control connection gracefully, aborting it if the flush takes
/// longer than `grace`
pub async fn finish(handle: &ControlHandle, writer: JoinHandle<()>, grace: Duration) {
    handle.close();
    if tokio::time::timeout(grace, writer).await.is_err() {
        handle.abort();
    }
}
