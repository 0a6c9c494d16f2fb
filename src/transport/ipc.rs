#![forbid(unsafe_code)]

use crate::domain::Envelope;
use crate::error::{Context, Result};
use crate::relay::{ClientSession, RelayHandle};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Unix-socket ingress for out-of-process client contexts.
///
/// Each accepted connection becomes one client channel: envelopes arrive as
/// JSON lines and deliveries are written back the same way. Closing the
/// connection is the context's disconnect notification.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    relay: RelayHandle,
    shutdown: CancellationToken,
}

impl IpcServer {
    pub fn bind(path: &Path, relay: RelayHandle, shutdown: CancellationToken) -> Result<Self> {
        // A stale socket file from a previous run blocks the bind.
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind client socket {}", path.display()))?;
        tracing::info!(
            target: "veilhub::ipc",
            event = "listening",
            path = %path.display(),
        );
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            relay,
            shutdown,
        })
    }

    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted.context("client socket accept failed")?;
                    let relay = self.relay.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, relay, shutdown).await;
                    });
                }
            }
        }
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}

async fn serve_connection(stream: UnixStream, relay: RelayHandle, shutdown: CancellationToken) {
    let mut session: ClientSession = match relay.attach_client().await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(
                target: "veilhub::ipc",
                event = "attach_failed",
                error = %err,
            );
            return;
        }
    };
    let context = session.context();

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = session.recv() => match delivery {
                Some(envelope) => {
                    let line = match serde_json::to_string(&envelope) {
                        Ok(line) => line,
                        Err(err) => {
                            tracing::warn!(
                                target: "veilhub::ipc",
                                event = "delivery_unserialisable",
                                context = %context,
                                error = %err,
                            );
                            continue;
                        }
                    };
                    if write_half.write_all(line.as_bytes()).await.is_err()
                        || write_half.write_all(b"\n").await.is_err()
                    {
                        break;
                    }
                }
                None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<Envelope>(&line) {
                    Ok(envelope) => session.send(envelope),
                    Err(err) => {
                        tracing::warn!(
                            target: "veilhub::ipc",
                            event = "envelope_invalid",
                            context = %context,
                            error = %err,
                        );
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(
                        target: "veilhub::ipc",
                        event = "connection_read_failed",
                        context = %context,
                        error = %err,
                    );
                    break;
                }
            },
        }
    }

    tracing::info!(
        target: "veilhub::ipc",
        event = "connection_closed",
        context = %context,
    );
    // Dropping the session is the disconnect notification.
}
