#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use claims::{assert_none, assert_some};
use futures_util::future::join_all;
use insta::assert_compact_json_snapshot;
use sqlx::PgPool;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

use npm_registry_scraper::JobStore;
use npm_registry_scraper::db;
use npm_registry_scraper::schema::NewJob;

mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Start a disposable Postgres and apply the crate's migrations.
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        db::run_migrations(&pool, Path::new("migrations")).await?;

        Ok((pool, container))
    }
}

async fn job_status(pool: &PgPool, id: Uuid) -> String {
    sqlx::query_scalar("SELECT status FROM job_queue WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn next_attempt_after(pool: &PgPool, id: Uuid) -> Option<DateTime<Utc>> {
    sqlx::query_scalar("SELECT next_attempt_after FROM job_queue WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Make a backed-off job immediately claimable again.
async fn clear_backoff(pool: &PgPool, id: Uuid) {
    sqlx::query("UPDATE job_queue SET next_attempt_after = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn enqueue_inserts_pending_job_with_payload() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    let id = store.enqueue(&NewJob::fetch_package("left-pad")).await?;

    let job = assert_some!(store.claim("worker-0").await?);
    assert_eq!(job.id, id);
    assert_eq!(job.priority, 5);
    assert_eq!(job.max_attempts, 3);
    assert_compact_json_snapshot!(
        (job.job_type.as_str(), &job.payload["package_name"]),
        @r#"["fetch_package", "left-pad"]"#
    );
    Ok(())
}

#[tokio::test]
async fn claim_marks_processing_and_counts_the_attempt() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    store.enqueue(&NewJob::fetch_package("left-pad")).await?;

    let job = assert_some!(store.claim("worker-3").await?);
    assert_eq!(job.status, "processing");
    assert_eq!(job.attempts, 1);
    assert_eq!(job.worker_id.as_deref(), Some("worker-3"));
    assert_some!(job.started_at);

    // The only row is locked away; a second claim finds nothing.
    assert_none!(store.claim("worker-4").await?);
    Ok(())
}

#[tokio::test]
async fn claim_returns_lowest_priority_oldest_first() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    for (name, priority) in [("low", 9), ("high", 1), ("mid", 5)] {
        let mut job = NewJob::fetch_package(name);
        job.priority = priority;
        store.enqueue(&job).await?;
    }

    let mut order = Vec::new();
    while let Some(job) = store.claim("worker-0").await? {
        order.push(job.payload["package_name"].as_str().unwrap().to_string());
    }
    assert_eq!(order, ["high", "mid", "low"]);
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    for i in 0..10 {
        store.enqueue(&NewJob::fetch_package(&format!("pkg-{i}"))).await?;
    }

    let claims = join_all((0..20).map(|i| {
        let store = store.clone();
        async move { store.claim(&format!("worker-{i}")).await }
    }))
    .await;

    let mut seen = HashSet::new();
    let mut claimed = 0;
    for result in claims {
        if let Some(job) = result? {
            claimed += 1;
            assert!(seen.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(claimed, 10);
    Ok(())
}

#[tokio::test]
async fn complete_is_terminal_and_idempotent() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    let id = store.enqueue(&NewJob::fetch_package("left-pad")).await?;
    assert_some!(store.claim("worker-0").await?);

    store.complete(id).await?;
    assert_eq!(job_status(&pool, id).await, "completed");

    store.complete(id).await?;
    assert_eq!(job_status(&pool, id).await, "completed");

    // A stray fail after completion must not resurrect the job.
    store.fail(id, "late failure").await?;
    assert_eq!(job_status(&pool, id).await, "completed");
    assert_none!(store.claim("worker-0").await?);
    Ok(())
}

#[tokio::test]
async fn fail_backs_off_exponentially_then_goes_terminal() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    let id = store.enqueue(&NewJob::fetch_package("flaky")).await?;

    for expected_attempt in 1..=2 {
        let job = assert_some!(store.claim("worker-0").await?);
        assert_eq!(job.attempts, expected_attempt);

        let before = Utc::now();
        store.fail(id, "upstream 500").await?;

        assert_eq!(job_status(&pool, id).await, "pending");
        let next = next_attempt_after(&pool, id).await.unwrap();
        let backoff = Duration::minutes(2i64.pow(expected_attempt as u32));
        let delta = next - before;
        assert!(
            delta > backoff - Duration::seconds(30) && delta < backoff + Duration::seconds(30),
            "attempt {expected_attempt}: expected ~{backoff} backoff, got {delta}"
        );

        // Backed off into the future, so not claimable yet.
        assert_none!(store.claim("worker-0").await?);
        clear_backoff(&pool, id).await;
    }

    let job = assert_some!(store.claim("worker-0").await?);
    assert_eq!(job.attempts, 3);
    store.fail(id, "upstream 500, again").await?;

    assert_eq!(job_status(&pool, id).await, "failed");
    assert_none!(next_attempt_after(&pool, id).await);
    let message: Option<String> =
        sqlx::query_scalar("SELECT error_message FROM job_queue WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(message.as_deref(), Some("upstream 500, again"));

    // Terminal: no further claims, and another fail changes nothing.
    assert_none!(store.claim("worker-0").await?);
    store.fail(id, "even later").await?;
    assert_eq!(job_status(&pool, id).await, "failed");
    Ok(())
}

#[tokio::test]
async fn checkpoint_defaults_then_upserts() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    let checkpoint = store.checkpoint("npm_changes").await?;
    assert_eq!(checkpoint.last_sequence, "0");
    assert_eq!(checkpoint.total_processed, 0);

    store.put_checkpoint("npm_changes", "42", 1).await?;
    let checkpoint = store.checkpoint("npm_changes").await?;
    assert_eq!(checkpoint.last_sequence, "42");
    assert_eq!(checkpoint.total_processed, 1);

    store.put_checkpoint("npm_changes", "58-abcdef", 7).await?;
    let checkpoint = store.checkpoint("npm_changes").await?;
    assert_eq!(checkpoint.last_sequence, "58-abcdef");
    assert_eq!(checkpoint.total_processed, 7);
    Ok(())
}

#[tokio::test]
async fn stats_aggregate_by_status() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    for i in 0..4 {
        store.enqueue(&NewJob::fetch_package(&format!("pkg-{i}"))).await?;
    }

    let done = assert_some!(store.claim("worker-0").await?);
    store.complete(done.id).await?;

    let mut doomed = NewJob::fetch_package("doomed");
    doomed.max_attempts = 1;
    let doomed_id = store.enqueue(&doomed).await?;
    assert_some!(store.claim("worker-0").await?); // claims pkg-1 (older)
    assert_some!(store.claim("worker-0").await?); // pkg-2
    assert_some!(store.claim("worker-0").await?); // pkg-3
    assert_some!(store.claim("worker-0").await?); // doomed
    store.fail(doomed_id, "no attempts left").await?;

    let stats = store.stats().await?;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total, 5);
    Ok(())
}

#[tokio::test]
async fn release_stale_returns_orphaned_claims_to_pending() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone());

    let id = store.enqueue(&NewJob::fetch_package("orphan")).await?;
    assert_some!(store.claim("worker-0").await?);

    // A fresh claim is not stale.
    assert_eq!(store.release_stale(Duration::minutes(15)).await?, 0);

    sqlx::query("UPDATE job_queue SET started_at = NOW() - INTERVAL '20 minutes' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await?;

    assert_eq!(store.release_stale(Duration::minutes(15)).await?, 1);
    assert_eq!(job_status(&pool, id).await, "pending");

    let job = assert_some!(store.claim("worker-1").await?);
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 2);
    Ok(())
}
