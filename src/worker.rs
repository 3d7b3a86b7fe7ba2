//! Queue consumer: claim, fetch, extract, store, complete.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use rand::Rng;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::extractor;
use crate::job_store::JobStore;
use crate::package_store::PackageStore;
use crate::registry::RegistryClient;
use crate::schema::{FETCH_PACKAGE, Job};

/// Tunables shared by all workers of a pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty or a claim fails
    pub polling_delay: Duration,
    /// Maximum random addition to the polling delay, to spread out an
    /// otherwise synchronized pool
    pub jitter: Duration,
    /// Exit when the queue is drained instead of polling again. Off in
    /// production; used by tests to process a queue to completion.
    pub shutdown_when_queue_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            polling_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(100),
            shutdown_when_queue_empty: false,
        }
    }
}

/// One symmetric consumer of the job queue.
pub struct Worker {
    worker_id: String,
    jobs: JobStore,
    packages: PackageStore,
    registry: RegistryClient,
    config: WorkerConfig,
    cancel: CancellationToken,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    pub fn new(
        index: usize,
        jobs: JobStore,
        packages: PackageStore,
        registry: RegistryClient,
        config: WorkerConfig,
        cancel: CancellationToken,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            worker_id: format!("worker-{index}"),
            jobs,
            packages,
            registry,
            config,
            cancel,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.config.jitter.is_zero() {
            return self.config.polling_delay;
        }

        let jitter_millis = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.polling_delay + Duration::from_millis(random_jitter)
    }

    /// True once either shutdown signal has fired. A closed channel counts
    /// as a signal; both checks happen only between jobs, never mid-job.
    fn shutdown_requested(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Lagged(_)) => false,
        }
    }

    /// Claim and process jobs until shutdown (or, with
    /// `shutdown_when_queue_empty`, until the queue drains).
    ///
    /// A claimed job always runs to completion or failure; every pipeline
    /// error becomes a `fail` transition, never a worker exit.
    pub async fn run(mut self) {
        info!("starting package processor worker");

        loop {
            if self.shutdown_requested() {
                info!("shutting down");
                return;
            }

            let job = match self.jobs.claim(&self.worker_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if self.config.shutdown_when_queue_empty {
                        debug!("queue empty, shutting down");
                        return;
                    }
                    self.idle_sleep().await;
                    continue;
                }
                Err(error) => {
                    warn!(%error, "error claiming job");
                    self.idle_sleep().await;
                    continue;
                }
            };

            debug!(job.id = %job.id, job.job_type = %job.job_type, "processing job");

            match self.process_job(&job).await {
                Ok(()) => {
                    info!(job.id = %job.id, "completed job");
                    if let Err(error) = self.jobs.complete(job.id).await {
                        warn!(job.id = %job.id, %error, "error marking job as completed");
                    }
                }
                Err(error) => {
                    warn!(job.id = %job.id, "failed to process job: {error:#}");
                    if let Err(error) = self.jobs.fail(job.id, &format!("{error:#}")).await {
                        warn!(job.id = %job.id, %error, "error marking job as failed");
                    }
                }
            }
        }
    }

    async fn idle_sleep(&self) {
        let delay = self.sleep_duration_with_jitter();
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = sleep(delay) => {}
        }
    }

    /// Dispatch on job type. Unknown types fail the job (and consume an
    /// attempt) rather than wedging the queue.
    pub async fn process_job(&self, job: &Job) -> Result<()> {
        match job.job_type.as_str() {
            FETCH_PACKAGE => self.fetch_package(&job.payload).await,
            other => bail!("unknown job type: {other}"),
        }
    }

    /// The `fetch_package` pipeline.
    ///
    /// Download-count and script failures are non-fatal: stats fall back
    /// to zero and scripts are skipped with a warning. Everything else
    /// fails the job and leaves the retry to queue backoff.
    async fn fetch_package(&self, payload: &Value) -> Result<()> {
        let name = payload
            .get("package_name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .context("invalid package name in job payload")?;

        debug!(package = name, "fetching package");
        let doc = self
            .registry
            .get_package(name)
            .await
            .context("failed to fetch package data")?;

        let mut pkg = extractor::extract_package(name, &doc);

        let downloads = match self.registry.get_download_count(name).await {
            Ok(downloads) => downloads,
            Err(error) => {
                warn!(package = name, %error, "failed to fetch download count");
                0
            }
        };
        pkg.downloads = downloads;
        pkg.popularity_score = extractor::popularity_score(downloads);

        let package_id = self
            .packages
            .store_package(&pkg)
            .await
            .context("failed to store package")?;

        match extractor::extract_scripts(&doc, package_id, &pkg.version) {
            Ok(scripts) => {
                for script in scripts {
                    debug!(package = name, script = %script.script_type, "storing script");
                    if let Err(error) = self.packages.store_script(&script).await {
                        warn!(
                            package = name,
                            script = %script.script_type,
                            %error,
                            "failed to store script"
                        );
                    }
                }
            }
            Err(error) => {
                warn!(package = name, %error, "failed to extract scripts");
            }
        }

        Ok(())
    }
}
