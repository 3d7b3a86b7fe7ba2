//! Lifecycle orchestration: start the discovery loop and the worker pool,
//! fan out shutdown on SIGINT/SIGTERM, and bound how long teardown waits.

use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::discovery::{DiscoveryConfig, DiscoveryLoop};
use crate::job_store::JobStore;
use crate::package_store::PackageStore;
use crate::registry::RegistryClient;
use crate::worker::{Worker, WorkerConfig};

const DEFAULT_NUM_WORKERS: usize = 10;

/// Upper bound on waiting for tasks after shutdown is signalled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the queue stats are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Owns the root cancellation token and the one-shot shutdown channel, and
/// supervises every long-running task.
///
/// The token cancels in-flight sleeps and I/O; the broadcast channel tells
/// workers to stop accepting new work. The channel is closed exactly once,
/// whether shutdown comes from a signal or from [`Supervisor::cancel_token`].
pub struct Supervisor {
    jobs: JobStore,
    packages: PackageStore,
    registry: RegistryClient,
    discovery_config: DiscoveryConfig,
    worker_config: WorkerConfig,
    num_workers: usize,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(pool: PgPool, registry: RegistryClient) -> Self {
        Self {
            jobs: JobStore::new(pool.clone()),
            packages: PackageStore::new(pool),
            registry,
            discovery_config: DiscoveryConfig::default(),
            worker_config: WorkerConfig::default(),
            num_workers: DEFAULT_NUM_WORKERS,
            cancel: CancellationToken::new(),
        }
    }

    /// Override the worker count.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Override the worker tunables.
    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Override the discovery tunables.
    pub fn discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery_config = config;
        self
    }

    /// Root token; cancelling it initiates the same shutdown a signal does.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until a shutdown signal, then drain within the shutdown bound.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let guard = Arc::new(ShutdownGuard {
            shutdown_tx: shutdown_tx.clone(),
            once: Once::new(),
        });

        spawn_signal_listener(self.cancel.clone(), Arc::clone(&guard));

        let mut handles = Vec::new();

        info!("starting package discovery loop");
        let discovery = DiscoveryLoop::new(
            self.discovery_config.clone(),
            self.registry.clone(),
            self.jobs.clone(),
            self.cancel.clone(),
        );
        handles.push(tokio::spawn(
            async move {
                if let Err(error) = discovery.run().await {
                    error!(%error, "discovery loop error");
                }
            }
            .instrument(info_span!("discovery")),
        ));

        info!(num_workers = self.num_workers, "starting package processor workers");
        for i in 0..self.num_workers {
            let worker = Worker::new(
                i,
                self.jobs.clone(),
                self.packages.clone(),
                self.registry.clone(),
                self.worker_config.clone(),
                self.cancel.clone(),
                shutdown_tx.subscribe(),
            );
            let span = info_span!("worker", worker.name = %worker.worker_id());
            handles.push(tokio::spawn(worker.run().instrument(span)));
        }

        spawn_stats_reporter(self.jobs.clone(), self.cancel.clone());

        self.cancel.cancelled().await;
        info!("shutting down");
        guard.close();

        match timeout(SHUTDOWN_TIMEOUT, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(error) = result {
                        warn!(%error, "task panicked during shutdown");
                    }
                }
                info!("all workers completed gracefully");
            }
            Err(_) => {
                warn!(
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "shutdown timed out, some workers may not have completed"
                );
            }
        }

        info!("shutdown complete");
        Ok(())
    }
}

/// Closes the shutdown channel exactly once, from whichever path gets
/// there first.
struct ShutdownGuard {
    shutdown_tx: broadcast::Sender<()>,
    once: Once,
}

impl ShutdownGuard {
    fn close(&self) {
        self.once.call_once(|| {
            let _ = self.shutdown_tx.send(());
        });
    }
}

/// Cancel the root token and close the shutdown channel on SIGINT/SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken, guard: Arc<ShutdownGuard>) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            () = terminate_signal() => {}
            () = cancel.cancelled() => {
                // Shutdown came from elsewhere; nothing left to listen for.
                return;
            }
        }

        info!("received shutdown signal, gracefully shutting down");
        cancel.cancel();
        guard.close();
    });
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(error) => {
            error!(%error, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// Log queue depth once a minute until cancelled.
fn spawn_stats_reporter(jobs: JobStore, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match jobs.stats().await {
                Ok(stats) => info!(
                    pending = stats.pending,
                    processing = stats.processing,
                    completed = stats.completed,
                    failed = stats.failed,
                    total = stats.total,
                    "queue stats"
                ),
                Err(error) => warn!(%error, "failed to read queue stats"),
            }
        }
    });
}
