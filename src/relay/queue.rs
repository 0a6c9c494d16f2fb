#![forbid(unsafe_code)]

use crate::domain::Envelope;
use crate::telemetry::relay_counters;
use std::collections::VecDeque;

/// Buffers worker-bound envelopes while no worker channel exists.
///
/// FIFO, no reordering or coalescing: envelopes from several client contexts
/// keep their relative arrival order across a flush. The queue is empty
/// whenever a worker channel is present, so flushing twice in a row delivers
/// only on the first call.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<Envelope>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, envelope: Envelope) {
        relay_counters().inc_envelopes_queued();
        tracing::debug!(
            target: "veilhub::relay",
            event = "envelope_queued",
            topic = %envelope.topic,
            depth = self.pending.len() + 1,
            "no worker channel attached; buffering"
        );
        self.pending.push_back(envelope);
    }

    /// Drains every buffered envelope in arrival order.
    pub fn flush(&mut self) -> Vec<Envelope> {
        let drained: Vec<Envelope> = self.pending.drain(..).collect();
        if !drained.is_empty() {
            relay_counters().record_flush(drained.len() as u64);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Topic;

    #[test]
    fn flush_preserves_arrival_order() {
        let mut queue = OutboundQueue::new();
        for i in 0..5 {
            queue.enqueue(Envelope::new(Topic::TextBatch).with_correlation(format!("req-{i}")));
        }
        let drained = queue.flush();
        let ids: Vec<_> = drained
            .iter()
            .map(|env| env.correlation_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["req-0", "req-1", "req-2", "req-3", "req-4"]);
    }

    #[test]
    fn second_flush_is_a_no_op() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(Envelope::new(Topic::ImageBatch));
        assert_eq!(queue.flush().len(), 1);
        assert!(queue.flush().is_empty());
        assert!(queue.is_empty());
    }
}
