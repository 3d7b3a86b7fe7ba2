//! Pure extraction from registry documents to canonical records.
//!
//! Upstream JSON is heterogeneous: `author` and `repository` may be a
//! string or an object, `license` a string or a `licenses` array. The
//! functions here are total over that mess; missing fields become empty
//! strings and unparseable timestamps become "now", never nulls.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::schema::{Package, PackageScript, ScriptType};

/// Downloads at which the popularity score saturates.
const POPULARITY_SATURATION: f64 = 1_000_000.0;

/// Script extraction failures. Field-level oddities are absorbed; only a
/// structurally impossible document (the chosen version missing outright)
/// is an error.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("versions data not found or invalid")]
    MissingVersions,
    #[error("version {0} not found or invalid")]
    MissingVersion(String),
}

/// Build a canonical [`Package`] from a registry document.
///
/// `downloads` and `popularity_score` are left at zero; the worker fills
/// them in from the downloads endpoint.
pub fn extract_package(name: &str, doc: &Value) -> Package {
    let now = Utc::now();

    Package {
        name: name.to_string(),
        version: doc
            .pointer("/dist-tags/latest")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        description: string_field(doc, "description"),
        author: string_or_object_field(doc, "author", "name"),
        homepage: string_field(doc, "homepage"),
        repository: string_or_object_field(doc, "repository", "url"),
        license: extract_license(doc),
        created_at: parse_time(doc.pointer("/time/created"), now),
        updated_at: parse_time(doc.pointer("/time/modified"), now),
        downloads: 0,
        popularity_score: 0.0,
    }
}

/// Pull the recognized lifecycle scripts out of the chosen version.
///
/// Only install, preinstall and postinstall hooks are kept, and empty
/// bodies are skipped. A version without a `scripts` map yields an empty
/// list.
pub fn extract_scripts(
    doc: &Value,
    package_id: Uuid,
    version: &str,
) -> Result<Vec<PackageScript>, ExtractError> {
    let versions = doc
        .get("versions")
        .and_then(Value::as_object)
        .ok_or(ExtractError::MissingVersions)?;

    let version_doc = versions
        .get(version)
        .and_then(Value::as_object)
        .ok_or_else(|| ExtractError::MissingVersion(version.to_string()))?;

    let Some(scripts) = version_doc.get("scripts").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    Ok(ScriptType::ALL
        .into_iter()
        .filter_map(|script_type| {
            let content = scripts.get(script_type.as_str()).and_then(Value::as_str)?;
            if content.is_empty() {
                return None;
            }
            Some(PackageScript {
                package_id,
                script_type,
                content: content.to_string(),
            })
        })
        .collect())
}

/// Popularity in [0, 1], saturating at one million monthly downloads.
pub fn popularity_score(downloads: i64) -> f64 {
    (downloads as f64 / POPULARITY_SATURATION).min(1.0)
}

fn string_field(doc: &Value, key: &str) -> String {
    doc.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Fields like `author` and `repository` appear either as a bare string or
/// as an object carrying the interesting value under `inner_key`.
fn string_or_object_field(doc: &Value, key: &str, inner_key: &str) -> String {
    match doc.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => map
            .get(inner_key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn extract_license(doc: &Value) -> String {
    if let Some(license) = doc.get("license").and_then(Value::as_str) {
        return license.to_string();
    }
    doc.pointer("/licenses/0/type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_time(value: Option<&Value>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(fallback)
}
