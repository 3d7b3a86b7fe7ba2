//! Change-feed follower: the single producer of fetch jobs.
//!
//! Tails the npm `_changes` feed from the last durable checkpoint,
//! enqueues one `fetch_package` job per eligible entry, and advances the
//! checkpoint only after the batch's jobs are in the queue. On a crash at
//! most one batch is replayed; the name-keyed package upsert absorbs the
//! duplicates.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job_store::JobStore;
use crate::registry::RegistryClient;
use crate::schema::{NPM_CHANGES_STREAM, NewJob};

/// Tunables for the discovery loop.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Maximum changes requested per poll
    pub batch_size: u32,
    /// Delay between polls when the feed is flowing
    pub request_delay: Duration,
    /// Delay after an empty batch
    pub idle_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            request_delay: Duration::from_secs(2),
            idle_delay: Duration::from_secs(30),
        }
    }
}

/// The long-running feed follower.
///
/// Holds a private shadow of the checkpoint; the authoritative copy lives
/// in the store and is written after each advancing batch.
pub struct DiscoveryLoop {
    config: DiscoveryConfig,
    registry: RegistryClient,
    store: JobStore,
    cancel: CancellationToken,
    last_sequence: String,
    total_processed: i64,
}

impl DiscoveryLoop {
    pub fn new(
        config: DiscoveryConfig,
        registry: RegistryClient,
        store: JobStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            cancel,
            last_sequence: "0".to_string(),
            total_processed: 0,
        }
    }

    /// Run until cancelled. Upstream errors are logged and absorbed with a
    /// tripled delay; only a checkpoint read failure at startup is fatal.
    pub async fn run(mut self) -> Result<()> {
        let checkpoint = self
            .store
            .checkpoint(NPM_CHANGES_STREAM)
            .await
            .context("failed to read scrape progress")?;
        self.last_sequence = checkpoint.last_sequence;
        self.total_processed = checkpoint.total_processed;

        info!(
            since = %self.last_sequence,
            total_processed = self.total_processed,
            "discovery loop resuming"
        );

        loop {
            if self.cancel.is_cancelled() {
                info!("discovery loop stopping");
                return Ok(());
            }

            let delay = match self.process_batch().await {
                Ok(0) => {
                    debug!("no new changes, waiting longer before next poll");
                    self.config.idle_delay
                }
                Ok(_) => self.config.request_delay,
                Err(error) => {
                    warn!(%error, "error processing change batch");
                    self.config.request_delay * 3
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("discovery loop stopping");
                    return Ok(());
                }
                () = sleep(delay) => {}
            }
        }
    }

    /// Fetch and enqueue one batch of changes. Returns the number of feed
    /// entries seen (zero means the feed is idle).
    ///
    /// The checkpoint is written only after every job of the batch has
    /// been durably enqueued; an enqueue failure aborts the batch so the
    /// whole thing is replayed on the next poll.
    pub async fn process_batch(&mut self) -> Result<usize> {
        debug!(since = %self.last_sequence, "fetching changes");

        let page = self
            .registry
            .get_changes(&self.last_sequence, self.config.batch_size)
            .await
            .context("failed to fetch changes")?;

        if page.results.is_empty() {
            return Ok(0);
        }

        let mut enqueued = 0usize;
        for change in &page.results {
            if change.deleted {
                continue;
            }
            // Empty ids and design documents (leading underscore) are not
            // packages.
            if change.id.is_empty() || change.id.starts_with('_') {
                continue;
            }

            let job = NewJob::fetch_package(&change.id);
            self.store
                .enqueue(&job)
                .await
                .with_context(|| format!("failed to enqueue job for package {}", change.id))?;

            enqueued += 1;
            self.total_processed += 1;
        }

        info!(enqueued, "processed change batch");

        if let Some(last_seq) = page.last_seq {
            if last_seq != self.last_sequence {
                self.last_sequence = last_seq;
                if let Err(error) = self
                    .store
                    .put_checkpoint(NPM_CHANGES_STREAM, &self.last_sequence, self.total_processed)
                    .await
                {
                    warn!(%error, "failed to update scrape progress");
                }
            }
        }

        Ok(page.results.len())
    }

    /// Current in-memory feed position, for tests and introspection.
    pub fn position(&self) -> (&str, i64) {
        (&self.last_sequence, self.total_processed)
    }
}
