//! Durable job queue and stream checkpoints, backed by Postgres.
//!
//! All mutations go through this store; it is the only synchronization
//! point between the discovery loop and the worker pool. Transient errors
//! surface to callers unchanged; retry policy lives with them.

use sqlx::PgPool;
use uuid::Uuid;

use crate::schema::{Checkpoint, Job, NewJob, QueueStats};

/// Handle to the `job_queue` and `scrape_progress` tables.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new `pending` job and return its id.
    ///
    /// No deduplication happens here; the producer is responsible for not
    /// enqueueing duplicates it cannot tolerate downstream.
    pub async fn enqueue(&self, job: &NewJob) -> Result<Uuid, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            r"
            INSERT INTO job_queue (job_type, status, priority, payload, max_attempts)
            VALUES ($1, 'pending', $2, $3, $4)
            RETURNING id
            ",
        )
        .bind(&job.job_type)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(job.max_attempts)
        .fetch_one(&self.pool)
        .await
    }

    /// Atomically claim the next eligible job for `worker_id`.
    ///
    /// Picks the oldest highest-priority `pending` row whose
    /// `next_attempt_after` has passed, marks it `processing`, and bumps
    /// its attempt counter. `SKIP LOCKED` guarantees two concurrent claims
    /// never observe the same row. `Ok(None)` means the queue is idle.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r"
            UPDATE job_queue
            SET status = 'processing',
                started_at = NOW(),
                worker_id = $1,
                attempts = attempts + 1
            WHERE id = (
                SELECT id
                FROM job_queue
                WHERE status = 'pending'
                  AND next_attempt_after <= NOW()
                ORDER BY priority, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, job_type, status, priority, payload, created_at,
                      started_at, completed_at, attempts, max_attempts,
                      error_message, worker_id, next_attempt_after
            ",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Mark a job `completed`. Idempotent on repeat.
    pub async fn complete(&self, job_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            UPDATE job_queue
            SET status = 'completed',
                completed_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// With attempts left the job returns to `pending` with
    /// `next_attempt_after = now + 2^attempts minutes`; once the attempt
    /// budget is spent it becomes terminally `failed` and the retry time is
    /// cleared. The error message is recorded either way. Only `processing`
    /// rows transition: completed and failed are terminal.
    pub async fn fail(&self, job_id: Uuid, error_message: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            UPDATE job_queue
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                error_message = $2,
                next_attempt_after = CASE WHEN attempts >= max_attempts
                                     THEN NULL
                                     ELSE NOW() + (POWER(2, attempts) * INTERVAL '1 minute')
                                     END
            WHERE id = $1
              AND status = 'processing'
            ",
        )
        .bind(job_id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Return `processing` rows claimed longer ago than `older_than` to
    /// `pending`, so claims orphaned by a crashed worker get re-run.
    ///
    /// Returns the number of released rows.
    pub async fn release_stale(&self, older_than: chrono::Duration) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE job_queue
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                next_attempt_after = NOW()
            WHERE status = 'processing'
              AND started_at < NOW() - $1
            ",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Read the checkpoint for a stream. An absent row is a first run and
    /// yields `("0", 0)`, not an error.
    pub async fn checkpoint(&self, stream_id: &str) -> Result<Checkpoint, sqlx::Error> {
        let row = sqlx::query_as::<_, Checkpoint>(
            r"
            SELECT last_sequence, total_processed
            FROM scrape_progress
            WHERE id = $1
            ",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.unwrap_or(Checkpoint {
            last_sequence: "0".to_string(),
            total_processed: 0,
        }))
    }

    /// Upsert the checkpoint for a stream, overwriting token and counter.
    pub async fn put_checkpoint(
        &self,
        stream_id: &str,
        last_sequence: &str,
        total_processed: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            INSERT INTO scrape_progress (id, last_sequence, total_processed, last_updated)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE SET
                last_sequence = $2,
                total_processed = $3,
                last_updated = NOW()
            ",
        )
        .bind(stream_id)
        .bind(last_sequence)
        .bind(total_processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Aggregate job counts by status, in one query.
    pub async fn stats(&self) -> Result<QueueStats, sqlx::Error> {
        sqlx::query_as::<_, QueueStats>(
            r"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
            FROM job_queue
            ",
        )
        .fetch_one(&self.pool)
        .await
    }
}
