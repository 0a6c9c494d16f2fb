#![forbid(unsafe_code)]

use crate::domain::{ContextId, Envelope};
use crate::error::Result;
use crate::relay::coordinator::{ClientAttachment, Coordinator, WorkerAttachment};
use crate::settings::{CommitRequest, CommitResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum HostCommand {
    AttachClient {
        reply: oneshot::Sender<ClientAttachment>,
    },
    DetachClient {
        context: ContextId,
        channel_id: u64,
    },
    AttachWorker {
        reply: oneshot::Sender<WorkerAttachment>,
    },
    DetachWorker {
        channel_id: u64,
    },
    FromClient {
        origin: ContextId,
        envelope: Envelope,
    },
    FromWorker {
        envelope: Envelope,
    },
    Commit {
        request: CommitRequest,
        reply: oneshot::Sender<oneshot::Receiver<CommitResult>>,
    },
}

/// Actor wrapper around [`Coordinator`]: one task owns all relay state and
/// processes commands in arrival order, which is what gives envelopes from a
/// single channel their ordering guarantee.
pub struct RelayHost;

impl RelayHost {
    pub fn spawn(mut coordinator: Coordinator) -> (RelayHandle, JoinHandle<()>) {
        let (commands, mut inbox) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(command) = inbox.recv().await {
                match command {
                    HostCommand::AttachClient { reply } => {
                        let context = coordinator.allocate_context();
                        let _ = reply.send(coordinator.attach_client(context));
                    }
                    HostCommand::DetachClient {
                        context,
                        channel_id,
                    } => coordinator.detach_client(context, channel_id),
                    HostCommand::AttachWorker { reply } => {
                        let _ = reply.send(coordinator.attach_worker());
                    }
                    HostCommand::DetachWorker { channel_id } => {
                        coordinator.detach_worker(channel_id);
                    }
                    HostCommand::FromClient { origin, envelope } => {
                        coordinator.handle_client(origin, envelope);
                    }
                    HostCommand::FromWorker { envelope } => coordinator.handle_worker(envelope),
                    HostCommand::Commit { request, reply } => {
                        let _ = reply.send(coordinator.commit_settings(request));
                    }
                }
            }
            tracing::debug!(
                target: "veilhub::relay",
                event = "host_stopped",
                "all relay handles dropped"
            );
        });
        (RelayHandle { commands }, task)
    }
}

#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl RelayHandle {
    pub async fn attach_client(&self) -> Result<ClientSession> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::AttachClient { reply })
            .map_err(|_| crate::err!("relay host stopped"))?;
        let attachment = rx.await.map_err(|_| crate::err!("relay host stopped"))?;
        Ok(ClientSession {
            context: attachment.context,
            channel_id: attachment.channel_id,
            inbound: attachment.inbound,
            commands: self.commands.clone(),
        })
    }

    pub async fn attach_worker(&self) -> Result<WorkerSession> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::AttachWorker { reply })
            .map_err(|_| crate::err!("relay host stopped"))?;
        let attachment = rx.await.map_err(|_| crate::err!("relay host stopped"))?;
        Ok(WorkerSession {
            channel_id: attachment.channel_id,
            inbound: attachment.inbound,
            commands: self.commands.clone(),
        })
    }

    /// Round-trips a settings document; resolves with the first of
    /// acknowledgement, error push, or timeout.
    pub async fn commit_settings(&self, request: CommitRequest) -> Result<CommitResult> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::Commit { request, reply })
            .map_err(|_| crate::err!("relay host stopped"))?;
        let waiter = rx.await.map_err(|_| crate::err!("relay host stopped"))?;
        waiter
            .await
            .map_err(|_| crate::err!("commit resolver dropped"))
    }
}

/// One attached client context: envelopes in, deliveries out. Dropping the
/// session is the disconnect notification.
pub struct ClientSession {
    context: ContextId,
    channel_id: u64,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl ClientSession {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn send(&self, envelope: Envelope) {
        let _ = self.commands.send(HostCommand::FromClient {
            origin: self.context,
            envelope,
        });
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let _ = self.commands.send(HostCommand::DetachClient {
            context: self.context,
            channel_id: self.channel_id,
        });
    }
}

/// The singleton worker context's end of its channel.
pub struct WorkerSession {
    channel_id: u64,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl WorkerSession {
    pub fn forward(&self, envelope: Envelope) {
        let _ = self.commands.send(HostCommand::FromWorker { envelope });
    }

    /// Cloneable sender half for tasks that relay results concurrently.
    pub fn forwarder(&self) -> WorkerForwarder {
        WorkerForwarder {
            commands: self.commands.clone(),
        }
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        let _ = self.commands.send(HostCommand::DetachWorker {
            channel_id: self.channel_id,
        });
    }
}

#[derive(Clone)]
pub struct WorkerForwarder {
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl WorkerForwarder {
    pub fn forward(&self, envelope: Envelope) {
        let _ = self.commands.send(HostCommand::FromWorker { envelope });
    }
}
