//! Read-only HTTP client for the npm registry and its replication feed.
//!
//! The client does no retrying of its own; callers decide what a failure
//! means (the worker pool leans on queue backoff, the discovery loop on its
//! error delay).

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

const REGISTRY_URL: &str = "https://registry.npmjs.org";
const REPLICATE_URL: &str = "https://replicate.npmjs.com/registry";
const DOWNLOADS_API_URL: &str = "https://api.npmjs.org";

const USER_AGENT: &str = "npm-registry-scraper/1.0";

/// Opt-in header npm requires on replication endpoints.
const REPLICATION_OPT_IN: &str = "npm-replication-opt-in";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LIMIT: u32 = 1000;
const MAX_LIMIT: u32 = 10_000;

/// Errors from registry calls.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested document does not exist upstream.
    #[error("not found")]
    NotFound,
    /// Upstream answered with an unexpected status.
    #[error("registry returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    /// Connection, timeout or decode failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// One entry of a `_changes` batch.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    /// Package name; may be empty or a `_`-prefixed design document
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

/// A page of the change feed.
#[derive(Debug, Deserialize)]
pub struct ChangesPage {
    #[serde(default)]
    pub results: Vec<ChangeEvent>,
    /// Sequence token normalized to a string, whatever shape upstream sent
    #[serde(default, deserialize_with = "deserialize_seq")]
    pub last_seq: Option<String>,
}

/// Stateless accessor for the three npm endpoints.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    registry_url: String,
    replicate_url: String,
    downloads_url: String,
}

impl RegistryClient {
    /// Client against the public npm endpoints.
    pub fn new() -> Result<Self, RegistryError> {
        Self::with_base_urls(REGISTRY_URL, REPLICATE_URL, DOWNLOADS_API_URL)
    }

    /// Client against explicit base URLs. Exists so tests can point the
    /// client at a local mock server.
    pub fn with_base_urls(
        registry_url: &str,
        replicate_url: &str,
        downloads_url: &str,
    ) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http,
            registry_url: registry_url.trim_end_matches('/').to_string(),
            replicate_url: replicate_url.trim_end_matches('/').to_string(),
            downloads_url: downloads_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the full package document as an opaque JSON tree.
    pub async fn get_package(&self, name: &str) -> Result<Value, RegistryError> {
        let url = format!("{}/{name}", self.registry_url);
        let response = self.http.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(RegistryError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Fetch up to `limit` changes after the opaque token `since`.
    ///
    /// `limit` is clamped to [1, 10000]; zero falls back to 1000. An empty
    /// token or `"0"` reads from the beginning of the feed.
    pub async fn get_changes(&self, since: &str, limit: u32) -> Result<ChangesPage, RegistryError> {
        let url = format!(
            "{}/_changes?limit={}&since={since}",
            self.replicate_url,
            clamp_limit(limit),
        );
        let response = self
            .http
            .get(&url)
            .headers(replication_headers())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    /// Page through `_all_docs`, optionally descending from `start_key`.
    pub async fn get_all_docs(
        &self,
        start_key: &str,
        limit: u32,
        descending: bool,
    ) -> Result<Value, RegistryError> {
        let mut url = format!("{}/_all_docs?limit={}", self.replicate_url, clamp_limit(limit));
        if !start_key.is_empty() {
            url.push_str("&startkey=");
            url.push_str(start_key);
        }
        if descending {
            url.push_str("&descending=true");
        }

        let response = self
            .http
            .get(&url)
            .headers(replication_headers())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    /// Monthly download count for a package. Many packages have no stats;
    /// a 404 here means zero downloads, not an error.
    pub async fn get_download_count(&self, name: &str) -> Result<i64, RegistryError> {
        #[derive(Deserialize)]
        struct DownloadPoint {
            downloads: i64,
        }

        let url = format!("{}/downloads/point/last-month/{name}", self.downloads_url);
        let response = self.http.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(0),
            status if status.is_success() => {
                let point: DownloadPoint = response.json().await?;
                Ok(point.downloads)
            }
            status => Err(RegistryError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

fn replication_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(REPLICATION_OPT_IN, HeaderValue::from_static("true"));
    headers
}

fn clamp_limit(limit: u32) -> u32 {
    if limit > MAX_LIMIT {
        MAX_LIMIT
    } else if limit < 1 {
        DEFAULT_LIMIT
    } else {
        limit
    }
}

/// Accept `last_seq` as a string, an integer, or `{"seq": <either>}`, and
/// normalize to a string token. Anything else is treated as absent.
fn deserialize_seq<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_seq(&value))
}

fn normalize_seq(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i.to_string()),
            None => Some(n.to_string()),
        },
        Value::Object(map) => map.get("seq").and_then(normalize_seq),
        _ => None,
    }
}
