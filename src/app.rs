use crate::config::{RelayTuning, UpstreamConfig, VeilhubConfig};
use crate::error::{Context, Result};
use crate::relay::{Coordinator, RelayHandle, RelayHost, RequestOriginTracker};
use crate::transport::runtime::{sleep_with_shutdown, ReconnectBackoff};
use crate::transport::{HttpPayloadFetcher, IpcServer, PayloadFetcher, TcpUpstream, WorkerRuntime};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Composed application: the relay host actor, the client socket ingress,
/// and the upstream connection loop that owns the single worker context.
pub struct VeilhubApp {
    config: VeilhubConfig,
    relay: RelayHandle,
    origin: RequestOriginTracker,
    fetcher: Arc<dyn PayloadFetcher>,
    shutdown: CancellationToken,
}

impl VeilhubApp {
    pub fn initialise(config: VeilhubConfig) -> Result<Self> {
        let coordinator = Coordinator::from_tuning(&config.relay)?;
        let origin = coordinator.origin_tracker();
        let (relay, _host_task) = RelayHost::spawn(coordinator);
        let fetcher: Arc<dyn PayloadFetcher> = Arc::new(
            HttpPayloadFetcher::new().context("failed to construct payload fetcher")?,
        );

        Ok(Self {
            config,
            relay,
            origin,
            fetcher,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn relay(&self) -> RelayHandle {
        self.relay.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();

        let ipc = IpcServer::bind(
            Path::new(&self.config.ipc.socket_path),
            self.relay.clone(),
            self.shutdown.clone(),
        )?;
        tasks.spawn(ipc.run());

        tasks.spawn(upstream_loop(
            self.config.upstream.clone(),
            self.config.relay.clone(),
            self.relay.clone(),
            self.origin.clone(),
            Arc::clone(&self.fetcher),
            self.shutdown.clone(),
        ));

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                tracing::info!(
                    target: "veilhub::app",
                    event = "shutdown_requested",
                );
            }
            Some(finished) = tasks.join_next() => {
                self.shutdown.cancel();
                finished??;
            }
        }

        self.shutdown.cancel();
        while let Some(finished) = tasks.join_next().await {
            finished??;
        }
        Ok(())
    }
}

/// Maintains the single upstream connection. While it is down, worker-bound
/// envelopes buffer in the outbound queue; every successful attach drains
/// the queue through the fresh worker channel.
async fn upstream_loop(
    upstream_config: UpstreamConfig,
    tuning: RelayTuning,
    relay: RelayHandle,
    origin: RequestOriginTracker,
    fetcher: Arc<dyn PayloadFetcher>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (min_backoff, max_backoff) = upstream_config.reconnect_backoff();
    let mut backoff = ReconnectBackoff::new(min_backoff, max_backoff);

    while !shutdown.is_cancelled() {
        match TcpUpstream::connect(&upstream_config.addr).await {
            Ok(upstream) => {
                backoff.reset();
                let upstream = Arc::new(upstream);
                let connection_gone = upstream.closed();

                // One token per connection: the worker stops on either a
                // dead socket or an application shutdown.
                let connection_token = CancellationToken::new();
                {
                    let connection_token = connection_token.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = connection_gone.cancelled() => {}
                            _ = shutdown.cancelled() => {}
                        }
                        connection_token.cancel();
                    });
                }

                let session = relay.attach_worker().await?;
                let runtime = WorkerRuntime::new(
                    session,
                    upstream,
                    Arc::clone(&fetcher),
                    origin.clone(),
                    &tuning,
                    upstream_config.ack_timeout(),
                    connection_token,
                );
                runtime.run().await;

                if !shutdown.is_cancelled() {
                    tracing::warn!(
                        target: "veilhub::app",
                        event = "upstream_connection_lost",
                        addr = %upstream_config.addr,
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "veilhub::app",
                    event = "upstream_connect_failed",
                    addr = %upstream_config.addr,
                    error = %err,
                );
            }
        }

        if sleep_with_shutdown(backoff.next_delay(), &shutdown).await {
            break;
        }
    }
    Ok(())
}
