#![forbid(unsafe_code)]

use crate::config::RelayTuning;
use crate::domain::{ContextId, Envelope, Topic};
use crate::error::Result;
use crate::relay::correlation::{CommitResolver, CorrelationTable};
use crate::relay::origin::{EvictionPolicy, RequestOriginTracker};
use crate::relay::queue::OutboundQueue;
use crate::relay::registry::{ChannelRegistry, ClientChannel};
use crate::settings::{CommitRequest, CommitResult};
use crate::telemetry::relay_counters;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Channel pair handed to an attaching client context.
#[derive(Debug)]
pub struct ClientAttachment {
    pub context: ContextId,
    pub channel_id: u64,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Channel pair handed to the attaching worker context.
#[derive(Debug)]
pub struct WorkerAttachment {
    pub channel_id: u64,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Routes every inbound envelope by topic to the correct subsystem.
///
/// All relay state lives here, owned: the channel registry, the outbound
/// queue, the correlation table and the request-origin tracker. The two
/// tables hand out cloneable handles for the pieces that settle or rewrite
/// entries from other tasks (timers, the worker's chunk-count rewrite), but
/// routing decisions are made only by this type.
pub struct Coordinator {
    registry: ChannelRegistry,
    queue: OutboundQueue,
    correlation: CorrelationTable,
    origin: RequestOriginTracker,
    commit_timeout: Duration,
    next_context: u64,
    next_channel: u64,
}

impl Coordinator {
    pub fn new(commit_timeout: Duration, eviction: EvictionPolicy) -> Self {
        Self {
            registry: ChannelRegistry::new(),
            queue: OutboundQueue::new(),
            correlation: CorrelationTable::new(),
            origin: RequestOriginTracker::new(eviction),
            commit_timeout,
            next_context: 0,
            next_channel: 0,
        }
    }

    pub fn from_tuning(tuning: &RelayTuning) -> Result<Self> {
        let eviction = match tuning.origin_max_age()? {
            Some(max_age) => EvictionPolicy::MaxAge(max_age),
            None => EvictionPolicy::Unbounded,
        };
        Ok(Self::new(tuning.commit_timeout(), eviction))
    }

    /// Handle for the worker runtime's two-phase expected-count rewrite.
    pub fn origin_tracker(&self) -> RequestOriginTracker {
        self.origin.clone()
    }

    pub fn correlation_table(&self) -> CorrelationTable {
        self.correlation.clone()
    }

    pub fn allocate_context(&mut self) -> ContextId {
        self.next_context += 1;
        ContextId(self.next_context)
    }

    pub fn client_count(&self) -> usize {
        self.registry.client_count()
    }

    pub fn has_worker(&self) -> bool {
        self.registry.has_worker()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn attach_client(&mut self, context: ContextId) -> ClientAttachment {
        self.next_channel += 1;
        let channel_id = self.next_channel;
        let (sender, inbound) = mpsc::unbounded_channel();
        self.registry
            .register_client(ClientChannel::new(context, channel_id, sender));
        tracing::info!(
            target: "veilhub::relay",
            event = "client_attached",
            context = %context,
            channel_id,
            clients = self.registry.client_count(),
        );
        ClientAttachment {
            context,
            channel_id,
            inbound,
        }
    }

    /// A client channel is removed exactly once, on its own disconnect
    /// notification; registry bookkeeping only, no correlation or tracker
    /// cleanup happens here.
    pub fn detach_client(&mut self, context: ContextId, channel_id: u64) {
        self.registry.unregister_client(context, channel_id);
        tracing::info!(
            target: "veilhub::relay",
            event = "client_detached",
            context = %context,
            channel_id,
            clients = self.registry.client_count(),
        );
    }

    /// Registers the singleton worker channel and flushes the outbound
    /// queue into it, synchronously and exactly once, in arrival order.
    pub fn attach_worker(&mut self) -> WorkerAttachment {
        self.next_channel += 1;
        let channel_id = self.next_channel;
        let (sender, inbound) = mpsc::unbounded_channel();
        self.registry.register_worker(channel_id, sender);

        let buffered = self.queue.flush();
        if !buffered.is_empty() {
            tracing::info!(
                target: "veilhub::relay",
                event = "queue_flushed",
                count = buffered.len(),
                "worker attached; draining buffered envelopes"
            );
            for envelope in buffered {
                self.registry.send_to_worker(envelope);
            }
        }

        WorkerAttachment {
            channel_id,
            inbound,
        }
    }

    pub fn detach_worker(&mut self, channel_id: u64) {
        self.registry.unregister_worker(channel_id);
        tracing::warn!(
            target: "veilhub::relay",
            event = "worker_detached",
            channel_id,
            "worker channel gone; worker-bound envelopes will buffer"
        );
    }

    /// Dispatches one envelope arriving from a client context.
    pub fn handle_client(&mut self, origin: ContextId, envelope: Envelope) {
        match &envelope.topic {
            Topic::TextBatch | Topic::ImageBatch => self.forward_batch(origin, envelope),
            Topic::SettingsCommit => self.handle_commit_envelope(origin, envelope),
            Topic::Unknown(_) => self.drop_unknown(&envelope, "client"),
            // Result topics never travel client → coordinator.
            _ => {
                crate::relay_event!(
                    debug,
                    "veilhub::relay",
                    "unexpected_direction",
                    topic = envelope.topic,
                    context = origin,
                );
            }
        }
    }

    /// Dispatches one envelope relayed back from the worker context.
    pub fn handle_worker(&mut self, envelope: Envelope) {
        match &envelope.topic {
            Topic::SettingsAck => {
                if let Some(id) = correlation_of(&envelope) {
                    if self.correlation.resolve(&id, CommitResult::acked(envelope.data)) {
                        relay_counters().inc_commits_acked();
                    }
                }
            }
            Topic::SettingsError => {
                if let Some(id) = correlation_of(&envelope) {
                    let message = envelope
                        .data
                        .as_ref()
                        .and_then(|data| data.get("message"))
                        .and_then(JsonValue::as_str)
                        .unwrap_or("settings update failed")
                        .to_string();
                    if self
                        .correlation
                        .resolve(&id, CommitResult::errored(message, envelope.data))
                    {
                        relay_counters().inc_commits_errored();
                    }
                }
            }
            Topic::Decisions | Topic::ImageResults => self.route_result(envelope),
            Topic::Pong | Topic::Config => self.registry.broadcast(envelope),
            Topic::Unknown(_) => self.drop_unknown(&envelope, "worker"),
            Topic::TextBatch | Topic::ImageBatch | Topic::SettingsCommit => {
                crate::relay_event!(
                    debug,
                    "veilhub::relay",
                    "unexpected_direction",
                    topic = envelope.topic,
                );
            }
        }
    }

    /// Direct commit entry point for in-process callers; the returned
    /// receiver settles with the first of ack, error or timeout.
    pub fn commit_settings(&mut self, request: CommitRequest) -> oneshot::Receiver<CommitResult> {
        let (tx, rx) = oneshot::channel();
        if !self.registry.has_worker() {
            let _ = tx.send(CommitResult::worker_not_ready());
            return rx;
        }
        let resolver: CommitResolver = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.start_commit(None, request, resolver);
        rx
    }

    fn forward_batch(&mut self, origin: ContextId, envelope: Envelope) {
        let correlation = correlation_of(&envelope);
        if let Some(id) = correlation.as_deref() {
            // Provisional count; chunking rewrites it once the real chunk
            // total is known.
            self.origin.track(id, origin, 1);
        }

        let mut outbound = envelope.with_origin(origin);
        if outbound.correlation_id.is_none() {
            outbound.correlation_id = correlation;
        }

        if self.registry.has_worker() {
            self.registry.send_to_worker(outbound);
        } else {
            self.queue.enqueue(outbound);
        }
    }

    fn handle_commit_envelope(&mut self, origin: ContextId, envelope: Envelope) {
        let request: CommitRequest = match envelope
            .data
            .clone()
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => {
                crate::relay_event!(
                    warn,
                    "veilhub::relay",
                    "commit_request_invalid",
                    topic = envelope.topic,
                    context = origin,
                );
                self.deliver_commit_result(
                    origin,
                    envelope.correlation_id.unwrap_or_default(),
                    CommitResult::errored("invalid commit request", None),
                );
                return;
            }
        };

        if !self.registry.has_worker() {
            tracing::warn!(
                target: "veilhub::relay",
                event = "commit_worker_not_ready",
                correlation_id = %request.req_id,
            );
            relay_counters().inc_commits_errored();
            self.deliver_commit_result(origin, request.req_id.clone(), CommitResult::worker_not_ready());
            return;
        }

        self.start_commit(Some(origin), request, {
            let channel = self.registry.client_channel(origin);
            let req_id = envelope.correlation_id.clone();
            Box::new(move |result: CommitResult| {
                if let Some(channel) = channel {
                    let topic = if result.ok {
                        Topic::SettingsAck
                    } else {
                        Topic::SettingsError
                    };
                    let mut reply = Envelope::new(topic);
                    if let Some(id) = req_id {
                        reply = reply.with_correlation(id);
                    }
                    if let Ok(data) = serde_json::to_value(&result) {
                        reply = reply.with_data(data);
                    }
                    channel.send(reply);
                }
            })
        });
    }

    fn start_commit(
        &mut self,
        origin: Option<ContextId>,
        request: CommitRequest,
        resolver: CommitResolver,
    ) {
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.commit_timeout);
        self.correlation.create(&request.req_id, timeout, resolver);

        let mut outbound = Envelope::new(Topic::SettingsCommit).with_correlation(request.req_id.clone());
        if let Some(origin) = origin {
            outbound = outbound.with_origin(origin);
        }
        match serde_json::to_value(&request) {
            Ok(data) => {
                outbound = outbound.with_data(data);
                tracing::info!(
                    target: "veilhub::relay",
                    event = "commit_forwarded",
                    correlation_id = %request.req_id,
                    timeout_ms = timeout.as_millis() as u64,
                );
                self.registry.send_to_worker(outbound);
            }
            Err(err) => {
                // Unserialisable request: settle immediately instead of
                // leaving the caller to the timeout.
                self.correlation.resolve(
                    &request.req_id,
                    CommitResult::errored(format!("invalid commit request: {err}"), None),
                );
            }
        }
    }

    fn deliver_commit_result(&self, origin: ContextId, req_id: String, result: CommitResult) {
        let topic = if result.ok {
            Topic::SettingsAck
        } else {
            Topic::SettingsError
        };
        let mut reply = Envelope::new(topic);
        if !req_id.is_empty() {
            reply = reply.with_correlation(req_id);
        }
        if let Ok(data) = serde_json::to_value(&result) {
            reply = reply.with_data(data);
        }
        self.registry.send_to(origin, reply);
    }

    fn route_result(&mut self, envelope: Envelope) {
        let destination = envelope
            .correlation_id
            .as_deref()
            .and_then(|id| self.origin.consume(id));

        match destination {
            Some(context) if self.registry.contains_client(context) => {
                self.registry.send_to(context, envelope);
            }
            _ => {
                relay_counters().inc_broadcast_fallbacks();
                crate::relay_event!(
                    debug,
                    "veilhub::relay",
                    "broadcast_fallback",
                    topic = envelope.topic,
                );
                self.registry.broadcast(envelope);
            }
        }
    }

    fn drop_unknown(&self, envelope: &Envelope, direction: &str) {
        relay_counters().inc_unknown_topics_dropped();
        crate::relay_event!(
            debug,
            "veilhub::relay",
            "unknown_topic_dropped",
            topic = envelope.topic,
            direction = direction,
        );
    }
}

/// Correlation id of an envelope, falling back to a `reqId` embedded in the
/// payload for producers that only tag the batch itself.
fn correlation_of(envelope: &Envelope) -> Option<String> {
    envelope.correlation_id.clone().or_else(|| {
        envelope
            .data
            .as_ref()
            .and_then(|data| data.get("reqId"))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    })
}
