use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use npm_registry_scraper::{Config, JobStore, RegistryClient, Supervisor, db};

/// Claims older than this are presumed orphaned by a dead worker.
const STALE_CLAIM_AGE_MINUTES: i64 = 15;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting npm registry scraper");

    let config = Config::from_env();

    let pool = db::connect(&config.db)
        .await
        .context("failed to connect to database")?;
    info!("successfully connected to database");

    let migrations_dir = std::env::current_dir()
        .context("failed to get working directory")?
        .join("migrations");
    db::run_migrations(&pool, &migrations_dir)
        .await
        .context("failed to run migrations")?;
    info!("migrations completed successfully");

    // Claims orphaned by a previous incarnation of this process would
    // otherwise sit in `processing` forever.
    let jobs = JobStore::new(pool.clone());
    let released = jobs
        .release_stale(chrono::Duration::minutes(STALE_CLAIM_AGE_MINUTES))
        .await
        .context("failed to release stale jobs")?;
    if released > 0 {
        warn!(released, "released stale processing jobs back to pending");
    }

    let registry = RegistryClient::new().context("failed to build registry client")?;

    let supervisor = Supervisor::new(pool.clone(), registry);
    supervisor.run().await?;

    pool.close().await;
    Ok(())
}
