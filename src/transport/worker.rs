#![forbid(unsafe_code)]

use crate::codec::chunk::{ChunkPlanner, EnrichedItem};
use crate::codec::framing::strip_transport_marker;
use crate::codec::normalize_analysis_ack;
use crate::config::RelayTuning;
use crate::domain::{AnalysisOutcome, Envelope, ImageBatch, ImageItem, TextBatch, Topic, UpstreamErrorInfo};
use crate::relay::{RequestOriginTracker, WorkerForwarder, WorkerSession};
use crate::settings::{
    CommitRequest, SETTINGS_ERROR_EVENT, SETTINGS_UPDATED_EVENTS,
};
use crate::telemetry::relay_counters;
use crate::transport::upstream::{
    PushEvent, UpstreamClient, CONFIG_EVENT, IMAGE_ANALYSIS_EVENT, PONG_EVENT, TEXT_ANALYSIS_EVENT,
    TEXT_RESULT_EVENT,
};
use crate::transport::fetch::PayloadFetcher;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// The single worker context: consumes worker-bound envelopes from its
/// channel, drives the upstream socket, and relays every response back as a
/// client-bound envelope tagged with the original correlation id.
pub struct WorkerRuntime {
    session: WorkerSession,
    upstream: Arc<dyn UpstreamClient>,
    fetcher: Arc<dyn PayloadFetcher>,
    origin: RequestOriginTracker,
    chunker: ChunkPlanner,
    ack_timeout: Duration,
    commit_window: Duration,
    shutdown: CancellationToken,
    // Subscribed at construction so no push emitted between construction
    // and the first poll of `run` can be missed.
    pushes: broadcast::Receiver<PushEvent>,
}

impl WorkerRuntime {
    pub fn new(
        session: WorkerSession,
        upstream: Arc<dyn UpstreamClient>,
        fetcher: Arc<dyn PayloadFetcher>,
        origin: RequestOriginTracker,
        tuning: &RelayTuning,
        ack_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let pushes = upstream.subscribe();
        Self {
            session,
            upstream,
            fetcher,
            origin,
            chunker: ChunkPlanner::new(tuning.chunk_size, tuning.min_payload_bytes),
            ack_timeout,
            commit_window: tuning.commit_timeout(),
            shutdown,
            pushes,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                maybe = self.session.recv() => match maybe {
                    Some(envelope) => self.handle_envelope(envelope),
                    None => break,
                },
                push = self.pushes.recv() => match push {
                    Ok(push) => self.handle_push(push),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "veilhub::worker",
                            event = "pushes_lagged",
                            skipped,
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!(
            target: "veilhub::worker",
            event = "worker_stopped",
        );
    }

    fn handle_envelope(&self, envelope: Envelope) {
        match &envelope.topic {
            Topic::TextBatch => self.relay_text_batch(envelope),
            Topic::ImageBatch => self.spawn_image_batch(envelope),
            Topic::SettingsCommit => self.spawn_settings_commit(envelope),
            other => {
                crate::relay_event!(
                    debug,
                    "veilhub::worker",
                    "envelope_ignored",
                    topic = other,
                );
            }
        }
    }

    fn relay_text_batch(&self, envelope: Envelope) {
        let Some(batch) = decode_payload::<TextBatch>(&envelope, "text batch") else {
            return;
        };
        tracing::debug!(
            target: "veilhub::worker",
            event = "text_batch",
            req_id = %batch.req_id,
            items = batch.items.len(),
        );
        let upstream = Arc::clone(&self.upstream);
        let data = envelope.data.unwrap_or(JsonValue::Null);
        tokio::spawn(async move {
            if let Err(err) = upstream.emit(TEXT_ANALYSIS_EVENT, data).await {
                tracing::warn!(
                    target: "veilhub::worker",
                    event = "text_emit_failed",
                    req_id = %batch.req_id,
                    error = %err,
                );
            }
        });
    }

    fn spawn_image_batch(&self, envelope: Envelope) {
        let Some(batch) = decode_payload::<ImageBatch>(&envelope, "image batch") else {
            return;
        };
        let task = ImageBatchTask {
            upstream: Arc::clone(&self.upstream),
            fetcher: Arc::clone(&self.fetcher),
            origin: self.origin.clone(),
            forwarder: self.session.forwarder(),
            chunker: self.chunker,
            ack_timeout: self.ack_timeout,
        };
        tokio::spawn(task.run(batch));
    }

    fn spawn_settings_commit(&self, envelope: Envelope) {
        let Some(request) = decode_payload::<CommitRequest>(&envelope, "commit request") else {
            return;
        };
        let upstream = Arc::clone(&self.upstream);
        let forwarder = self.session.forwarder();
        let window = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.commit_window);
        tokio::spawn(run_settings_commit(upstream, forwarder, request, window));
    }

    fn handle_push(&self, push: PushEvent) {
        match push.event.as_str() {
            TEXT_RESULT_EVENT => {
                let req_id = push
                    .data
                    .get("reqId")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                let mut envelope = Envelope::new(Topic::Decisions).with_data(push.data);
                if let Some(req_id) = req_id {
                    envelope = envelope.with_correlation(req_id);
                }
                self.session.forward(envelope);
            }
            PONG_EVENT => {
                self.session
                    .forward(Envelope::new(Topic::Pong).with_data(push.data));
            }
            CONFIG_EVENT => {
                self.session
                    .forward(Envelope::new(Topic::Config).with_data(push.data));
            }
            // Settings pushes are consumed by per-commit subscribers.
            other if SETTINGS_UPDATED_EVENTS.contains(&other) || other == SETTINGS_ERROR_EVENT => {}
            other => {
                tracing::trace!(
                    target: "veilhub::worker",
                    event = "push_ignored",
                    name = other,
                );
            }
        }
    }
}

/// Wire shape of one chunked image item: metadata plus normalized bytes plus
/// the shared request id.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundImageItem {
    #[serde(flatten)]
    item: ImageItem,
    req_id: String,
}

struct ImageBatchTask {
    upstream: Arc<dyn UpstreamClient>,
    fetcher: Arc<dyn PayloadFetcher>,
    origin: RequestOriginTracker,
    forwarder: WorkerForwarder,
    chunker: ChunkPlanner,
    ack_timeout: Duration,
}

impl ImageBatchTask {
    async fn run(self, batch: ImageBatch) {
        let req_id = batch.req_id.clone();
        let total_in = batch.images.len();

        let mut enriched = Vec::with_capacity(total_in);
        let mut unfetchable = 0usize;
        for item in batch.images {
            match self.enrich(item).await {
                Some(entry) => enriched.push(entry),
                None => unfetchable += 1,
            }
        }

        let plan = self.chunker.plan(enriched);
        let dropped = unfetchable + plan.dropped;
        if dropped > 0 {
            relay_counters().add_items_dropped(dropped as u64);
        }

        // Two-phase count update: the provisional 1 becomes the real chunk
        // total now that enrichment has settled what is actually usable.
        let chunk_total = plan.chunk_count().max(1) as u32;
        self.origin.set_expected(&req_id, chunk_total);

        tracing::info!(
            target: "veilhub::worker",
            event = "image_batch_ready",
            req_id = %req_id,
            total_in,
            usable = plan.item_count(),
            dropped,
            chunks = plan.chunk_count(),
        );

        for (chunk_no, chunk) in plan.chunks.into_iter().enumerate() {
            let upstream = Arc::clone(&self.upstream);
            let forwarder = self.forwarder.clone();
            let req_id = req_id.clone();
            let ack_timeout = self.ack_timeout;
            relay_counters().inc_chunks_emitted();
            tokio::spawn(async move {
                let outcome = emit_chunk(upstream, &req_id, chunk_no, chunk, ack_timeout).await;
                let mut envelope =
                    Envelope::new(Topic::ImageResults).with_correlation(req_id.clone());
                if let Ok(data) = serde_json::to_value(&outcome) {
                    envelope = envelope.with_data(data);
                }
                forwarder.forward(envelope);
            });
        }
    }

    async fn enrich(&self, mut item: ImageItem) -> Option<EnrichedItem> {
        let bytes = match item.image_data.take() {
            Some(bytes) if !bytes.is_empty() => Some(bytes),
            _ => match item.src.as_deref() {
                Some(src) => self.fetcher.fetch(src).await,
                None => None,
            },
        };
        match bytes {
            Some(bytes) if !bytes.is_empty() => Some(EnrichedItem { item, bytes }),
            _ => {
                tracing::warn!(
                    target: "veilhub::worker",
                    event = "payload_unfetchable",
                    element_id = %item.element_id,
                );
                None
            }
        }
    }
}

async fn emit_chunk(
    upstream: Arc<dyn UpstreamClient>,
    req_id: &str,
    chunk_no: usize,
    chunk: Vec<EnrichedItem>,
    ack_timeout: Duration,
) -> AnalysisOutcome {
    let payload: Vec<OutboundImageItem> = chunk
        .into_iter()
        .map(|entry| {
            let mut item = entry.item;
            item.image_data = Some(strip_transport_marker(entry.bytes));
            OutboundImageItem {
                item,
                req_id: req_id.to_string(),
            }
        })
        .collect();
    let count = payload.len();

    let data = match serde_json::to_value(&payload) {
        Ok(data) => data,
        Err(err) => {
            return emit_failure_outcome(req_id, &format!("chunk serialisation failed: {err}"));
        }
    };

    tracing::debug!(
        target: "veilhub::worker",
        event = "chunk_emit",
        req_id,
        chunk_no,
        count,
    );

    match upstream
        .emit_with_ack(IMAGE_ANALYSIS_EVENT, data, ack_timeout)
        .await
    {
        Ok(ack) => normalize_analysis_ack(Some(ack), req_id),
        Err(err) => {
            tracing::warn!(
                target: "veilhub::worker",
                event = "chunk_ack_missing",
                req_id,
                chunk_no,
                error = %err,
            );
            emit_failure_outcome(req_id, &err.to_string())
        }
    }
}

/// A chunk whose acknowledgement never arrived still yields a well-formed
/// outcome so the origin receives exactly one delivery per chunk.
fn emit_failure_outcome(req_id: &str, message: &str) -> AnalysisOutcome {
    AnalysisOutcome {
        results: Vec::new(),
        req_id: Some(req_id.to_string()),
        processing_time: None,
        processed_at: None,
        error: Some(UpstreamErrorInfo {
            message: message.to_string(),
            error_code: "NO_ACK".to_string(),
            category: None,
            original_response: None,
        }),
    }
}

/// Round-trips one settings document. The service does not acknowledge the
/// emit directly; success or failure arrives later as a named push event,
/// so the first of {success push, error push, window expiry} wins.
async fn run_settings_commit(
    upstream: Arc<dyn UpstreamClient>,
    forwarder: WorkerForwarder,
    request: CommitRequest,
    window: Duration,
) {
    // Subscribe before emitting so a fast push cannot slip past.
    let mut pushes = upstream.subscribe();
    let req_id = request.req_id.clone();

    if let Err(err) = upstream.emit(&request.event, request.data).await {
        forwarder.forward(settings_error_envelope(
            &req_id,
            serde_json::json!({
                "isError": true,
                "errorCode": "SO101",
                "message": format!("Socket emit failed: {err}"),
            }),
        ));
        return;
    }

    let deadline = sleep(window);
    tokio::pin!(deadline);

    let envelope = loop {
        tokio::select! {
            push = pushes.recv() => match push {
                Ok(push) if SETTINGS_UPDATED_EVENTS.contains(&push.event.as_str()) => {
                    break Envelope::new(Topic::SettingsAck)
                        .with_correlation(req_id.clone())
                        .with_data(push.data);
                }
                Ok(push) if push.event == SETTINGS_ERROR_EVENT => {
                    break settings_error_envelope(&req_id, push.data);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    break settings_error_envelope(
                        &req_id,
                        serde_json::json!({
                            "isError": true,
                            "errorCode": "SO102",
                            "message": "Socket closed before settings acknowledgement",
                        }),
                    );
                }
            },
            _ = &mut deadline => {
                break settings_error_envelope(
                    &req_id,
                    serde_json::json!({
                        "isError": true,
                        "errorCode": "CL108",
                        "message": "Timeout waiting for settings-updated",
                    }),
                );
            }
        }
    };

    forwarder.forward(envelope);
}

fn settings_error_envelope(req_id: &str, data: JsonValue) -> Envelope {
    Envelope::new(Topic::SettingsError)
        .with_correlation(req_id)
        .with_data(data)
}

fn decode_payload<T: serde::de::DeserializeOwned>(envelope: &Envelope, what: &str) -> Option<T> {
    match envelope.data.clone().map(serde_json::from_value).transpose() {
        Ok(Some(decoded)) => Some(decoded),
        Ok(None) | Err(_) => {
            crate::relay_event!(
                warn,
                "veilhub::worker",
                "payload_invalid",
                topic = envelope.topic,
                kind = what,
            );
            None
        }
    }
}
