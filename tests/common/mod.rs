#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use veilhub::config::RelayTuning;
use veilhub::domain::{ContextId, Envelope, ImageBatch, ImageItem, Topic};
use veilhub::error::Result;
use veilhub::relay::{Coordinator, RelayHandle, RelayHost, RequestOriginTracker};
use veilhub::transport::worker::WorkerRuntime;
use veilhub::transport::{PayloadFetcher, PushEvent, UpstreamClient};

pub const RECV_WINDOW: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct EmitRecord {
    pub event: String,
    pub data: JsonValue,
    pub with_ack: bool,
}

type AckResponder = Box<dyn Fn(&str, &JsonValue) -> std::result::Result<JsonValue, String> + Send>;

/// Upstream stand-in recording every emit and answering acks from a
/// test-scripted responder. Push events are injected with [`push`].
///
/// [`push`]: ScriptedUpstream::push
pub struct ScriptedUpstream {
    emits: Mutex<Vec<EmitRecord>>,
    responder: Mutex<Option<AckResponder>>,
    pushes: broadcast::Sender<PushEvent>,
}

impl ScriptedUpstream {
    pub fn new() -> Arc<Self> {
        let (pushes, _) = broadcast::channel(64);
        Arc::new(Self {
            emits: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            pushes,
        })
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &JsonValue) -> std::result::Result<JsonValue, String> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn push(&self, event: &str, data: JsonValue) {
        let _ = self.pushes.send(PushEvent {
            event: event.to_string(),
            data,
        });
    }

    pub fn emits(&self) -> Vec<EmitRecord> {
        self.emits.lock().unwrap().clone()
    }

    pub fn emits_named(&self, event: &str) -> Vec<EmitRecord> {
        self.emits()
            .into_iter()
            .filter(|record| record.event == event)
            .collect()
    }

    fn record(&self, event: &str, data: &JsonValue, with_ack: bool) {
        self.emits.lock().unwrap().push(EmitRecord {
            event: event.to_string(),
            data: data.clone(),
            with_ack,
        });
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn emit(&self, event: &str, data: JsonValue) -> Result<()> {
        self.record(event, &data, false);
        Ok(())
    }

    async fn emit_with_ack(
        &self,
        event: &str,
        data: JsonValue,
        _ack_timeout: Duration,
    ) -> Result<JsonValue> {
        self.record(event, &data, true);
        let responder = self.responder.lock().unwrap();
        match responder.as_ref() {
            Some(responder) => responder(event, &data).map_err(veilhub::error::Error::msg),
            None => Err(veilhub::error::Error::msg("no ack scripted")),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.pushes.subscribe()
    }
}

/// Fetcher answering from a fixed map of locator → bytes.
pub struct StaticFetcher {
    entries: Vec<(String, Vec<u8>)>,
}

impl StaticFetcher {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            entries: Vec::new(),
        })
    }

    pub fn with(entries: Vec<(&str, Vec<u8>)>) -> Arc<Self> {
        Arc::new(Self {
            entries: entries
                .into_iter()
                .map(|(locator, bytes)| (locator.to_string(), bytes))
                .collect(),
        })
    }
}

#[async_trait]
impl PayloadFetcher for StaticFetcher {
    async fn fetch(&self, locator: &str) -> Option<Vec<u8>> {
        self.entries
            .iter()
            .find(|(known, _)| known == locator)
            .map(|(_, bytes)| bytes.clone())
    }
}

/// Full-path harness: relay host actor plus a worker runtime driven by a
/// scripted upstream.
pub struct Harness {
    pub relay: RelayHandle,
    pub origin: RequestOriginTracker,
    pub upstream: Arc<ScriptedUpstream>,
    pub tuning: RelayTuning,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn spawn(tuning: RelayTuning) -> Self {
        let coordinator = Coordinator::from_tuning(&tuning).expect("tuning must parse");
        let origin = coordinator.origin_tracker();
        let (relay, _task) = RelayHost::spawn(coordinator);
        Self {
            relay,
            origin,
            upstream: ScriptedUpstream::new(),
            tuning,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn start_worker(&self) {
        self.start_worker_with_fetcher(StaticFetcher::empty()).await;
    }

    pub async fn start_worker_with_fetcher(&self, fetcher: Arc<StaticFetcher>) {
        let session = self.relay.attach_worker().await.expect("worker attach");
        let runtime = WorkerRuntime::new(
            session,
            self.upstream.clone(),
            fetcher,
            self.origin.clone(),
            &self.tuning,
            Duration::from_secs(5),
            self.shutdown.clone(),
        );
        tokio::spawn(runtime.run());
    }
}

pub async fn recv_within(inbound: &mut mpsc::UnboundedReceiver<Envelope>, what: &str) -> Envelope {
    timeout(RECV_WINDOW, inbound.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("channel closed waiting for {what}"))
}

pub fn drain_now(inbound: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
    let mut drained = Vec::new();
    while let Ok(envelope) = inbound.try_recv() {
        drained.push(envelope);
    }
    drained
}

pub fn image_item(element_id: &str, bytes: Option<Vec<u8>>) -> ImageItem {
    ImageItem {
        element_id: element_id.to_string(),
        mime_type: Some("image/jpeg".to_string()),
        filename: None,
        src: None,
        size: None,
        image_data: bytes,
    }
}

pub fn image_batch_envelope(req_id: &str, items: Vec<ImageItem>) -> Envelope {
    let batch = ImageBatch {
        req_id: req_id.to_string(),
        images: items,
    };
    Envelope::new(Topic::ImageBatch)
        .with_correlation(req_id)
        .with_data(serde_json::to_value(batch).expect("batch serialises"))
}

pub fn text_batch_envelope(req_id: &str, element_id: &str, text: &str) -> Envelope {
    Envelope::new(Topic::TextBatch)
        .with_correlation(req_id)
        .with_data(json!({
            "reqId": req_id,
            "items": [{ "elementId": element_id, "text": text }],
        }))
}

/// Well-formed analysis ack echoing per-item blur verdicts.
pub fn ack_for(data: &JsonValue) -> JsonValue {
    let results: Vec<JsonValue> = data
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    json!({
                        "elementId": item["elementId"],
                        "shouldBlur": true,
                        "primaryCategory": "test",
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({
        "processingTime": 3.5,
        "processedAt": "2025-03-01T00:00:00Z",
        "results": results,
    })
}

pub fn context(id: u64) -> ContextId {
    ContextId(id)
}
