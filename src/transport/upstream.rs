#![forbid(unsafe_code)]

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Event names of the analysis-service socket contract.
pub const IMAGE_ANALYSIS_EVENT: &str = "image-analysis";
pub const TEXT_ANALYSIS_EVENT: &str = "text-analysis";
pub const TEXT_RESULT_EVENT: &str = "text-analysis:result";
pub const PING_EVENT: &str = "ping";
pub const PONG_EVENT: &str = "pong";
pub const CONFIG_EVENT: &str = "config";

const PUSH_CHANNEL_CAPACITY: usize = 256;
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// A named event pushed by the service outside any request/response pair.
#[derive(Clone, Debug)]
pub struct PushEvent {
    pub event: String,
    pub data: JsonValue,
}

/// The worker context's view of the analysis-service socket: event-named,
/// not strictly request/response. `emit_with_ack` is for events the service
/// acknowledges per request; everything else arrives as push events.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn emit(&self, event: &str, data: JsonValue) -> Result<()>;
    async fn emit_with_ack(
        &self,
        event: &str,
        data: JsonValue,
        ack_timeout: Duration,
    ) -> Result<JsonValue>;
    fn subscribe(&self) -> broadcast::Receiver<PushEvent>;
}

/// One frame on the newline-delimited JSON wire. Outbound frames may carry
/// an `ackId`; the service echoes it back on a frame with `event: "ack"`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack_id: Option<u64>,
}

const ACK_EVENT: &str = "ack";

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonValue>>>>;

/// JSON-lines TCP implementation of [`UpstreamClient`].
pub struct TcpUpstream {
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingAcks,
    pushes: broadcast::Sender<PushEvent>,
    next_ack: AtomicU64,
    closed: CancellationToken,
}

impl TcpUpstream {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        tracing::info!(
            target: "veilhub::upstream",
            event = "connected",
            addr,
        );

        let (read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbox) = mpsc::unbounded_channel::<String>();
        let (pushes, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(line) = outbox.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
            writer_closed.cancel();
        });

        let reader_closed = closed.clone();
        let reader_pending = Arc::clone(&pending);
        let reader_pushes = pushes.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.len() > MAX_FRAME_BYTES {
                            tracing::warn!(
                                target: "veilhub::upstream",
                                event = "frame_oversized",
                                bytes = line.len(),
                            );
                            continue;
                        }
                        match serde_json::from_str::<WireFrame>(&line) {
                            Ok(frame) => {
                                dispatch_inbound(frame, &reader_pending, &reader_pushes);
                            }
                            Err(err) => {
                                tracing::warn!(
                                    target: "veilhub::upstream",
                                    event = "frame_invalid",
                                    error = %err,
                                );
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(
                            target: "veilhub::upstream",
                            event = "read_failed",
                            error = %err,
                        );
                        break;
                    }
                }
            }
            // Connection gone: settle nothing, just drop pending acks so
            // waiters observe the closure.
            reader_pending
                .lock()
                .expect("pending ack lock poisoned")
                .clear();
            reader_closed.cancel();
        });

        Ok(Self {
            outbound,
            pending,
            pushes,
            next_ack: AtomicU64::new(1),
            closed,
        })
    }

    /// Fires when either half of the connection has failed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn send_frame(&self, frame: &WireFrame) -> Result<()> {
        let line = serde_json::to_string(frame)?;
        self.outbound
            .send(line)
            .map_err(|_| crate::err!("upstream connection closed"))
    }
}

fn dispatch_inbound(frame: WireFrame, pending: &PendingAcks, pushes: &broadcast::Sender<PushEvent>) {
    if frame.event == ACK_EVENT {
        let Some(ack_id) = frame.ack_id else {
            tracing::warn!(
                target: "veilhub::upstream",
                event = "ack_without_id",
            );
            return;
        };
        let waiter = pending
            .lock()
            .expect("pending ack lock poisoned")
            .remove(&ack_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(frame.data);
            }
            None => {
                tracing::debug!(
                    target: "veilhub::upstream",
                    event = "ack_unmatched",
                    ack_id,
                    "late or duplicate acknowledgement"
                );
            }
        }
        return;
    }

    // Lagging subscribers lose pushes; nobody subscribed is normal at start.
    let _ = pushes.send(PushEvent {
        event: frame.event,
        data: frame.data,
    });
}

#[async_trait]
impl UpstreamClient for TcpUpstream {
    async fn emit(&self, event: &str, data: JsonValue) -> Result<()> {
        let result = self.send_frame(&WireFrame {
            event: event.to_string(),
            data,
            ack_id: None,
        });
        record_emit(event, result.is_ok());
        result
    }

    async fn emit_with_ack(
        &self,
        event: &str,
        data: JsonValue,
        ack_timeout: Duration,
    ) -> Result<JsonValue> {
        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending ack lock poisoned")
            .insert(ack_id, tx);

        if let Err(err) = self.send_frame(&WireFrame {
            event: event.to_string(),
            data,
            ack_id: Some(ack_id),
        }) {
            self.pending
                .lock()
                .expect("pending ack lock poisoned")
                .remove(&ack_id);
            record_emit(event, false);
            return Err(err);
        }
        record_emit(event, true);

        match timeout(ack_timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(crate::err!("upstream connection closed before ack")),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending ack lock poisoned")
                    .remove(&ack_id);
                Err(crate::err!(
                    "no ack for `{event}` within {}ms",
                    ack_timeout.as_millis()
                ))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.pushes.subscribe()
    }
}

fn record_emit(event: &str, ok: bool) {
    let status = if ok { "success" } else { "error" };
    metrics::counter!(
        "veilhub_upstream_emit_total",
        "event" => event.to_string(),
        "status" => status
    )
    .increment(1);
}
