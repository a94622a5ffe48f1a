//! Source registry and the contract between external scrapers and the merge
//! engine.
//!
//! Scrapers run out of process and drop JSON bundles into
//! `scrapes/<source_id>/`. This crate loads those bundles and normalizes each
//! scraped record into a [`FieldUpdate`]: placeholders and nulls are dropped,
//! and status is only forwarded by sources that are authoritative for it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipor_core::{FieldUpdate, FieldValue, GmpSnapshot, IpoStatus};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ipor-sources";

/// Field carrying a GMP history table; decoded into typed snapshots.
pub const GMP_TREND_FIELD: &str = "gmp_trend";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceProfile>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceProfile> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// Whether this source's status labels may overwrite an entity's status.
    #[serde(default)]
    pub status_authority: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeBundle {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub extractor_version: Option<String>,
    #[serde(default)]
    pub records: Vec<ScrapedRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, JsonValue>,
    #[serde(default)]
    pub sections: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("bundle is from source `{found}`, adapter handles `{expected}`")]
    SourceMismatch { expected: String, found: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub updates: Vec<FieldUpdate>,
    pub rejected: Vec<RejectedRecord>,
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn status_authority(&self) -> bool;
    fn normalize(&self, bundle: &ScrapeBundle) -> Result<NormalizedBatch, AdapterError>;
}

/// Registry-driven adapter. Sources differ only in their id and in whether
/// their status labels are trusted.
#[derive(Debug, Clone)]
pub struct ProfileAdapter {
    profile: SourceProfile,
}

impl ProfileAdapter {
    pub fn new(profile: SourceProfile) -> Self {
        Self { profile }
    }

    fn normalize_status(&self, name: &str, raw: Option<&str>) -> Option<IpoStatus> {
        let raw = raw?;
        if !self.profile.status_authority {
            debug!(
                source_id = self.profile.source_id.as_str(),
                name, raw, "ignoring status from non-authoritative source"
            );
            return None;
        }
        match raw.parse::<IpoStatus>() {
            // "unknown" means the scraper could not tell; that is not news.
            Ok(IpoStatus::Unknown) => None,
            Ok(status) => Some(status),
            Err(err) => {
                warn!(
                    source_id = self.profile.source_id.as_str(),
                    name, error = %err, "dropping unrecognized status"
                );
                None
            }
        }
    }

    fn normalize_field(key: &str, value: &JsonValue) -> Option<FieldValue> {
        if key == GMP_TREND_FIELD {
            if let Ok(snapshots) = serde_json::from_value::<Vec<GmpSnapshot>>(value.clone()) {
                return (!snapshots.is_empty()).then(|| FieldValue::gmp_trend(snapshots));
            }
        }
        let value = FieldValue::try_from(value.clone()).ok()?;
        (!value.is_placeholder()).then_some(value)
    }

    fn normalize_record(&self, record: &ScrapedRecord) -> Option<FieldUpdate> {
        let name = record.name.trim();
        if name.is_empty() {
            return None;
        }

        let mut update = FieldUpdate::new(self.profile.source_id.clone(), name);
        update.status = self.normalize_status(name, record.status.as_deref());

        for (key, value) in &record.fields {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            if let Some(value) = Self::normalize_field(key, value) {
                update.fields.insert(key.to_string(), value);
            }
        }
        if let Some(url) = record.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            update.fields.insert(
                format!("{}_url", self.profile.source_id),
                FieldValue::text(url),
            );
        }
        for (key, raw) in &record.sections {
            if let Some(raw) = raw.as_deref().filter(|r| !r.trim().is_empty()) {
                update.source_sections.insert(key.clone(), raw.to_string());
            }
        }
        Some(update)
    }
}

impl SourceAdapter for ProfileAdapter {
    fn source_id(&self) -> &str {
        &self.profile.source_id
    }

    fn status_authority(&self) -> bool {
        self.profile.status_authority
    }

    fn normalize(&self, bundle: &ScrapeBundle) -> Result<NormalizedBatch, AdapterError> {
        if bundle.source_id != self.profile.source_id {
            return Err(AdapterError::SourceMismatch {
                expected: self.profile.source_id.clone(),
                found: bundle.source_id.clone(),
            });
        }
        let mut batch = NormalizedBatch::default();
        for (index, record) in bundle.records.iter().enumerate() {
            match self.normalize_record(record) {
                Some(update) => batch.updates.push(update),
                None => batch.rejected.push(RejectedRecord {
                    index,
                    reason: "record has an empty name".to_string(),
                }),
            }
        }
        Ok(batch)
    }
}

pub fn adapter_for_source(profile: &SourceProfile) -> Box<dyn SourceAdapter> {
    Box::new(ProfileAdapter::new(profile.clone()))
}

/// Bundle files in `dir`, sorted by file name. A missing directory yields none.
pub fn bundle_paths(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

pub fn load_bundle(path: impl AsRef<Path>) -> Result<ScrapeBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Stable id for a bundle file, used to reference it from run reports.
pub fn deterministic_bundle_id(path: &Path, bundle: &ScrapeBundle) -> Uuid {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "<unnamed>".to_string());
    let source = format!(
        "{}:{}:{}",
        bundle.source_id,
        file_name,
        bundle.fetched_at.to_rfc3339()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}
