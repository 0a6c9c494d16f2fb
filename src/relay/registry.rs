#![forbid(unsafe_code)]

use crate::domain::{ContextId, Envelope};
use crate::telemetry::relay_counters;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Sender half of one client channel, tagged with a channel id so that a
/// replaced channel's late disconnect cannot evict its successor.
#[derive(Clone, Debug)]
pub struct ClientChannel {
    pub context: ContextId,
    pub channel_id: u64,
    sender: mpsc::UnboundedSender<Envelope>,
}

impl ClientChannel {
    pub fn new(context: ContextId, channel_id: u64, sender: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            context,
            channel_id,
            sender,
        }
    }

    /// Sending on a closed transport is caught and logged, never propagated.
    pub fn send(&self, envelope: Envelope) -> bool {
        match self.sender.send(envelope) {
            Ok(()) => true,
            Err(err) => {
                relay_counters().inc_send_failures();
                crate::relay_event!(
                    warn,
                    "veilhub::relay",
                    "client_send_failed",
                    topic = err.0.topic,
                    context = self.context,
                );
                false
            }
        }
    }
}

/// Tracks open channels: one per attached client context plus at most one
/// worker channel.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    clients: HashMap<ContextId, ClientChannel>,
    worker: Option<(u64, mpsc::UnboundedSender<Envelope>)>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a context id already present replaces the prior mapping.
    /// The displaced channel is not force-closed; its own disconnect
    /// notification later is a no-op thanks to the channel-id guard.
    pub fn register_client(&mut self, channel: ClientChannel) {
        if let Some(previous) = self.clients.insert(channel.context, channel) {
            tracing::debug!(
                target: "veilhub::relay",
                event = "client_channel_replaced",
                context = %previous.context,
                previous_channel = previous.channel_id,
                "client re-registered; prior channel left to disconnect on its own"
            );
        }
    }

    /// Removes the client mapping, but only if it still belongs to the
    /// channel that is disconnecting. Idempotent.
    pub fn unregister_client(&mut self, context: ContextId, channel_id: u64) {
        let matches = self
            .clients
            .get(&context)
            .is_some_and(|channel| channel.channel_id == channel_id);
        if matches {
            self.clients.remove(&context);
        }
    }

    pub fn register_worker(&mut self, channel_id: u64, sender: mpsc::UnboundedSender<Envelope>) {
        self.worker = Some((channel_id, sender));
    }

    /// Removes the worker mapping, but only if it still belongs to the
    /// channel that is disconnecting. Idempotent.
    pub fn unregister_worker(&mut self, channel_id: u64) {
        if self
            .worker
            .as_ref()
            .is_some_and(|(current, _)| *current == channel_id)
        {
            self.worker = None;
        }
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn contains_client(&self, context: ContextId) -> bool {
        self.clients.contains_key(&context)
    }

    /// Cloned handle to one client channel, for resolvers that deliver
    /// outside the registry's borrow.
    pub fn client_channel(&self, context: ContextId) -> Option<ClientChannel> {
        self.clients.get(&context).cloned()
    }

    /// Delivers to one client context. Returns `false` when the context is
    /// unknown or its channel already closed.
    pub fn send_to(&self, context: ContextId, envelope: Envelope) -> bool {
        match self.clients.get(&context) {
            Some(channel) => channel.send(envelope),
            None => false,
        }
    }

    /// Fans the envelope out to every registered client channel. Used when
    /// the origin of a server-pushed result cannot be determined.
    pub fn broadcast(&self, envelope: Envelope) {
        for channel in self.clients.values() {
            channel.send(envelope.clone());
        }
    }

    pub fn send_to_worker(&self, envelope: Envelope) -> bool {
        match &self.worker {
            Some((_, sender)) => match sender.send(envelope) {
                Ok(()) => true,
                Err(err) => {
                    relay_counters().inc_send_failures();
                    crate::relay_event!(
                        warn,
                        "veilhub::relay",
                        "worker_send_failed",
                        topic = err.0.topic,
                    );
                    false
                }
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Topic;

    fn channel(context: u64, channel_id: u64) -> (ClientChannel, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientChannel::new(ContextId(context), channel_id, tx), rx)
    }

    #[test]
    fn reregistering_replaces_without_evicting_successor() {
        let mut registry = ChannelRegistry::new();
        let (old, _old_rx) = channel(1, 10);
        let (new, mut new_rx) = channel(1, 11);
        registry.register_client(old);
        registry.register_client(new);

        // The displaced channel's own disconnect must not remove the successor.
        registry.unregister_client(ContextId(1), 10);
        assert!(registry.contains_client(ContextId(1)));
        assert!(registry.send_to(ContextId(1), Envelope::new(Topic::Pong)));
        assert!(new_rx.try_recv().is_ok());

        registry.unregister_client(ContextId(1), 11);
        assert!(!registry.contains_client(ContextId(1)));
        registry.unregister_client(ContextId(1), 11);
    }

    #[test]
    fn send_on_closed_channel_is_swallowed() {
        let mut registry = ChannelRegistry::new();
        let (client, rx) = channel(2, 1);
        registry.register_client(client);
        drop(rx);
        assert!(!registry.send_to(ContextId(2), Envelope::new(Topic::Config)));
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let mut registry = ChannelRegistry::new();
        let (a, mut rx_a) = channel(1, 1);
        let (b, mut rx_b) = channel(2, 2);
        registry.register_client(a);
        registry.register_client(b);
        registry.broadcast(Envelope::new(Topic::Config));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
