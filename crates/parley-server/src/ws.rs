//! WebSocket adapter for the [`Transport`] / [`Inbound`] contract.
//!
//! Each socket is split in two. The write half is owned by a writer task fed
//! from a bounded queue, so [`Transport::send`] only enqueues and never waits
//! on the peer. The read half becomes a [`WsInbound`] owned by the session.
//! Both halves share one cancellation token; cancelling it is `close()`.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::{ConnectionId, Inbound, MessagePayload, Transport, TransportError};

use crate::config::ServerConfig;
use crate::heartbeat::{run_heartbeat, HeartbeatResult, Liveness};
use crate::metrics::{WS_HEARTBEAT_TIMEOUTS_TOTAL, WS_MALFORMED_FRAMES_TOTAL};

/// Per-connection tuning.
#[derive(Clone, Copy, Debug)]
pub struct WsOptions {
    pub outbound_queue: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl From<&ServerConfig> for WsOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_queue: config.outbound_queue.max(1),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }
}

/// Outbound half of a WebSocket connection.
pub struct WsTransport {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl WsTransport {
    /// Split a socket into its transport halves and spawn the writer and
    /// heartbeat tasks.
    pub fn spawn<W, R, E>(
        id: ConnectionId,
        sink: W,
        stream: R,
        options: WsOptions,
    ) -> (Arc<Self>, WsInbound<R>)
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(options.outbound_queue);
        let closed = CancellationToken::new();
        let liveness = Arc::new(Liveness::new());

        let transport = Arc::new(Self {
            id: id.clone(),
            tx,
            closed: closed.clone(),
            dropped: AtomicU64::new(0),
        });

        let _writer = tokio::spawn(run_writer(
            id.clone(),
            sink,
            rx,
            options.heartbeat_interval,
            closed.clone(),
        ));

        let watched = closed.clone();
        let watch_liveness = liveness.clone();
        let watch_id = id.clone();
        let _heartbeat = tokio::spawn(async move {
            let result = run_heartbeat(
                watch_liveness,
                options.heartbeat_interval,
                options.heartbeat_timeout,
                watched.clone(),
            )
            .await;
            if result == HeartbeatResult::TimedOut {
                warn!(connection_id = %watch_id, timeout = ?options.heartbeat_timeout, "peer unresponsive, disconnecting");
                counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                watched.cancel();
            }
        });

        let inbound = WsInbound {
            id,
            stream,
            closed,
            liveness,
        };
        (transport, inbound)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Payloads refused because the outbound queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for WsTransport {
    fn send(&self, payload: &MessagePayload) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let json = payload
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.tx.try_send(json).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                TransportError::Backpressure
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// How long a closing writer waits to hand the peer a Close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Drain the outbound queue onto the socket, pinging on an interval.
///
/// Exits when the token is cancelled or the socket write fails, and cancels
/// the token on the way out so the read side observes the close. Every
/// write races the token, so a peer that stops reading cannot hold the task
/// past `close()`.
async fn run_writer<W>(
    id: ConnectionId,
    mut sink: W,
    mut rx: mpsc::Receiver<String>,
    ping_every: Duration,
    closed: CancellationToken,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
{
    let mut ping_interval =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);

    loop {
        let frame = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
            _ = ping_interval.tick() => Message::Ping(Vec::new().into()),
        };

        tokio::select! {
            biased;
            () = closed.cancelled() => {
                debug!(connection_id = %id, "write abandoned on close");
                break;
            }
            sent = sink.send(frame) => {
                if let Err(e) = sent {
                    debug!(connection_id = %id, error = %e, "socket write failed");
                    break;
                }
            }
        }
    }

    closed.cancel();
    let farewell = async {
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(CLOSE_GRACE, farewell).await.is_err() {
        debug!(connection_id = %id, "peer not reading, dropping socket without close frame");
    }
    debug!(connection_id = %id, "writer stopped");
}

/// Inbound half of a WebSocket connection.
pub struct WsInbound<R> {
    id: ConnectionId,
    stream: R,
    closed: CancellationToken,
    liveness: Arc<Liveness>,
}

#[async_trait]
impl<R, E> Inbound for WsInbound<R>
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    async fn receive(&mut self) -> Result<MessagePayload, TransportError> {
        loop {
            let frame = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(TransportError::Closed),
                frame = self.stream.next() => frame,
            };

            let text = match frame {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(TransportError::Socket(e.to_string())),
                Some(Ok(Message::Close(_))) => {
                    info!(connection_id = %self.id, "peer sent close frame");
                    return Err(TransportError::Closed);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    self.liveness.mark_alive();
                    continue;
                }
                Some(Ok(Message::Text(t))) => {
                    self.liveness.mark_alive();
                    t.as_str().to_owned()
                }
                Some(Ok(Message::Binary(data))) => {
                    self.liveness.mark_alive();
                    match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => {
                            warn!(connection_id = %self.id, len = data.len(), "non-UTF8 binary frame, skipping");
                            counter!(WS_MALFORMED_FRAMES_TOTAL).increment(1);
                            continue;
                        }
                    }
                }
            };

            match MessagePayload::from_json(&text) {
                Ok(payload) => return Ok(payload),
                Err(e) => {
                    warn!(connection_id = %self.id, error = %e, "malformed frame, skipping");
                    counter!(WS_MALFORMED_FRAMES_TOTAL).increment(1);
                }
            }
        }
    }
}
