//! Row and domain types shared across the stores.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// The one job type the worker pool knows how to dispatch.
pub const FETCH_PACKAGE: &str = "fetch_package";

/// Stream id of the npm change-feed checkpoint in `scrape_progress`.
pub const NPM_CHANGES_STREAM: &str = "npm_changes";

/// A row in the `job_queue` table.
///
/// Status is one of `pending`, `processing`, `completed` or `failed`;
/// the latter two are terminal.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: Uuid,
    /// Type identifier used for dispatch
    pub job_type: String,
    pub status: String,
    /// Lower sorts earlier
    pub priority: i32,
    /// JSON payload chosen by the producer
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of claim events so far
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    /// Earliest time a pending row may be claimed; cleared on terminal failure
    pub next_attempt_after: Option<DateTime<Utc>>,
}

/// A job to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub priority: i32,
    pub max_attempts: i32,
    pub payload: Value,
}

impl NewJob {
    /// Build a `fetch_package` job for the given package name.
    pub fn fetch_package(package_name: &str) -> Self {
        Self {
            job_type: FETCH_PACKAGE.to_string(),
            priority: 5,
            max_attempts: 3,
            payload: serde_json::json!({
                "package_name": package_name,
                "created_at": Utc::now(),
            }),
        }
    }
}

/// Durable position in a named upstream stream.
#[derive(Debug, Clone, FromRow)]
pub struct Checkpoint {
    /// Opaque sequence token; `"0"` means "from the beginning"
    pub last_sequence: String,
    /// Monotone count of packages enqueued so far
    pub total_processed: i64,
}

/// Aggregate job counts by status.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// A canonical package record, as extracted from the registry document.
///
/// Missing upstream fields are empty strings, never nulls. The surrogate id
/// is assigned by [`crate::PackageStore::store_package`].
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub homepage: String,
    pub repository: String,
    pub license: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monthly download count; zero when the stats endpoint has no data
    pub downloads: i64,
    /// In [0, 1], saturating at one million monthly downloads
    pub popularity_score: f64,
}

/// Recognized lifecycle-script hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    Install,
    Preinstall,
    Postinstall,
}

impl ScriptType {
    /// All recognized hooks, in extraction order.
    pub const ALL: [ScriptType; 3] = [
        ScriptType::Install,
        ScriptType::Preinstall,
        ScriptType::Postinstall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::Install => "install",
            ScriptType::Preinstall => "preinstall",
            ScriptType::Postinstall => "postinstall",
        }
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle-script body attached to a package.
#[derive(Debug, Clone)]
pub struct PackageScript {
    pub package_id: Uuid,
    pub script_type: ScriptType,
    /// Verbatim shell string; never empty
    pub content: String,
}
