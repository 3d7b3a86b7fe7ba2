//! Pool construction and the SQL-file migration runner.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use crate::config::DbConfig;

/// Open a connection pool and verify the database answers.
pub async fn connect(config: &DbConfig) -> Result<PgPool, sqlx::Error> {
    let options = config.connect_options()?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

/// Apply every unapplied `*.sql` file from `dir`, in filename order.
///
/// Applied filenames are recorded in a `migrations` table that is created
/// on first run. Each file executes inside one transaction together with
/// the insert that records it, so a failed migration leaves no trace.
pub async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
    info!(dir = %dir.display(), "running migrations");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS migrations (
            id SERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create migrations table")?;

    let applied: Vec<String> = sqlx::query_scalar("SELECT name FROM migrations")
        .fetch_all(pool)
        .await
        .context("failed to query applied migrations")?;

    for filename in migration_files(dir)? {
        if applied.iter().any(|name| name == &filename) {
            debug!(migration = %filename, "already applied, skipping");
            continue;
        }

        info!(migration = %filename, "applying migration");

        let content = std::fs::read_to_string(dir.join(&filename))
            .with_context(|| format!("failed to read migration file {filename}"))?;

        let mut tx = pool.begin().await.context("failed to start transaction")?;

        sqlx::raw_sql(&content)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to execute migration {filename}"))?;

        sqlx::query("INSERT INTO migrations (name) VALUES ($1)")
            .bind(&filename)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to record migration {filename}"))?;

        tx.commit()
            .await
            .with_context(|| format!("failed to commit migration {filename}"))?;
    }

    Ok(())
}

fn migration_files(dir: &Path) -> Result<Vec<String>> {
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list migration files in {}", dir.display()))?
        .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
        .filter(|name| name.ends_with(".sql"))
        .collect();
    files.sort();
    Ok(files)
}
