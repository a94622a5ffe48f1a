//! Per-run artifacts under `reports/<run_id>/`: a markdown brief, a JSON
//! delta, and parquet snapshots listed in a sha256 manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, TimestampMillisecondArray, UInt32Array, UInt8Array};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use ipor_core::{DuplicateCandidate, IpoEntity, IpoStatus};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::pipeline::IngestRunSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub run_dir: PathBuf,
    pub manifest: PathBuf,
}

pub async fn write_run_reports(
    reports_root: &Path,
    summary: &IngestRunSummary,
    entities: &[IpoEntity],
) -> Result<ReportPaths> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join("ingest_brief.md"), ingest_brief(summary, entities))
        .await
        .context("writing ingest_brief.md")?;

    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary,
        "entities": entities,
    }))
    .context("serializing entities delta")?;
    fs::write(run_dir.join("entities_delta.json"), delta_json)
        .await
        .context("writing entities_delta.json")?;

    let manifest = export_parquet_snapshots(&run_dir, entities, &summary.candidates).await?;
    Ok(ReportPaths { run_dir, manifest })
}

fn ingest_brief(summary: &IngestRunSummary, entities: &[IpoEntity]) -> String {
    let mut status_counts: BTreeMap<IpoStatus, usize> = BTreeMap::new();
    for entity in entities {
        *status_counts.entry(entity.status).or_default() += 1;
    }

    let sources = summary
        .sources
        .iter()
        .map(|s| {
            let mut line = format!(
                "- {}: {} bundles, {} records, {} upserted, {} rejected",
                s.source_id, s.bundles, s.records, s.upserted, s.rejected
            );
            if !s.failures.is_empty() {
                line.push_str(&format!(" ({} failures: {})", s.failures.len(), s.failures.join("; ")));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n");
    let statuses = IpoStatus::ALL
        .iter()
        .map(|status| format!("- {}: {}", status, status_counts.get(status).copied().unwrap_or(0)))
        .collect::<Vec<_>>()
        .join("\n");
    let duplicates = if summary.candidates.is_empty() {
        "None detected.".to_string()
    } else {
        summary
            .candidates
            .iter()
            .map(|c| format!("- {} vs {} (score {})", c.first_name, c.second_name, c.score))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# IPO Radar Ingest Brief\n\n- Run ID: `{}`\n- Run at: {}\n- Entities: {}\n- Upserted: {}\n- Entity failures: {}\n- Auto-merged: {}\n\n## Sources\n{}\n\n## Status\n{}\n\n## Duplicate Candidates\n{}\n",
        summary.run_id,
        summary.run_at,
        entities.len(),
        summary.upserted,
        summary.entity_failures,
        summary.auto_merged.len(),
        sources,
        statuses,
        duplicates,
    )
}

async fn export_parquet_snapshots(
    run_dir: &Path,
    entities: &[IpoEntity],
    candidates: &[DuplicateCandidate],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let run_dir = run_dir.to_path_buf();
    let entities_path = snapshot_dir.join("entities.parquet");
    let candidates_path = snapshot_dir.join("duplicate_candidates.parquet");
    let entities = entities.to_vec();
    let candidates = candidates.to_vec();
    let manifest = tokio::task::spawn_blocking(move || -> Result<SnapshotManifest> {
        write_entities_parquet(&entities_path, &entities)?;
        write_candidates_parquet(&candidates_path, &candidates)?;
        Ok(SnapshotManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("entities", &run_dir, &entities_path)?,
                manifest_entry("duplicate_candidates", &run_dir, &candidates_path)?,
            ],
        })
    })
    .await
    .context("parquet snapshot task")??;
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_entities_parquet(path: &Path, entities: &[IpoEntity]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("price_band", DataType::Utf8, true),
        ArrowField::new("gmp", DataType::Utf8, true),
        ArrowField::new("subscription", DataType::Utf8, true),
        ArrowField::new("field_count", DataType::UInt32, false),
        ArrowField::new(
            "updated_at",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
    ]));

    let text_column = |key: &str| {
        StringArray::from(entities.iter().map(|e| e.text(key)).collect::<Vec<_>>())
    };
    let ids = StringArray::from(entities.iter().map(|e| Some(e.id.to_string())).collect::<Vec<_>>());
    let names = StringArray::from(entities.iter().map(|e| Some(e.name.as_str())).collect::<Vec<_>>());
    let statuses = StringArray::from(entities.iter().map(|e| Some(e.status.as_str())).collect::<Vec<_>>());
    let field_counts = UInt32Array::from(
        entities
            .iter()
            .map(|e| u32::try_from(e.populated_fields()).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let updated_at = TimestampMillisecondArray::from(
        entities.iter().map(|e| e.updated_at.timestamp_millis()).collect::<Vec<_>>(),
    )
    .with_timezone("UTC");

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(names),
            Arc::new(statuses),
            Arc::new(text_column("price band")),
            Arc::new(text_column("gmp")),
            Arc::new(text_column("subscription")),
            Arc::new(field_counts),
            Arc::new(updated_at),
        ],
    )
    .context("building entities record batch")?;
    write_parquet(path, batch)
}

fn write_candidates_parquet(path: &Path, candidates: &[DuplicateCandidate]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("first_id", DataType::Utf8, false),
        ArrowField::new("first_name", DataType::Utf8, false),
        ArrowField::new("second_id", DataType::Utf8, false),
        ArrowField::new("second_name", DataType::Utf8, false),
        ArrowField::new("score", DataType::UInt8, false),
    ]));

    let first_ids = StringArray::from(candidates.iter().map(|c| Some(c.first_id.to_string())).collect::<Vec<_>>());
    let first_names = StringArray::from(candidates.iter().map(|c| Some(c.first_name.as_str())).collect::<Vec<_>>());
    let second_ids = StringArray::from(candidates.iter().map(|c| Some(c.second_id.to_string())).collect::<Vec<_>>());
    let second_names = StringArray::from(candidates.iter().map(|c| Some(c.second_name.as_str())).collect::<Vec<_>>());
    let scores = UInt8Array::from(candidates.iter().map(|c| c.score).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(first_ids),
            Arc::new(first_names),
            Arc::new(second_ids),
            Arc::new(second_names),
            Arc::new(scores),
        ],
    )
    .context("building duplicate_candidates record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Markdown index of the most recent runs, newest first.
pub fn recent_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = if reports_root.exists() {
        std::fs::read_dir(reports_root)
            .with_context(|| format!("reading {}", reports_root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# IPO Radar Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let delta_path = dir.path().join("entities_delta.json");
        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let entities = delta
            .get("entities")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let candidates = delta
            .pointer("/run/candidates")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!("- entities: {entities}"));
        lines.push(format!("- duplicate candidates: {candidates}"));
        lines.push(format!("- brief: `{}`", dir.path().join("ingest_brief.md").display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ipor_core::FieldValue;
    use uuid::Uuid;

    use crate::pipeline::SourceRunStats;

    fn summary(candidates: Vec<DuplicateCandidate>) -> IngestRunSummary {
        IngestRunSummary {
            run_id: Uuid::new_v4(),
            run_at: Utc.with_ymd_and_hms(2026, 1, 9, 3, 30, 0).unwrap(),
            sources: vec![SourceRunStats {
                source_id: "chittorgarh".into(),
                bundles: 1,
                records: 2,
                upserted: 2,
                rejected: 0,
                failures: vec![],
            }],
            upserted: 2,
            entity_failures: 0,
            candidates,
            auto_merged: vec![],
            total_entities: 2,
            reports_dir: None,
            parquet_manifest: None,
            admin_notified: false,
        }
    }

    #[tokio::test]
    async fn reports_and_manifest_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 9, 3, 30, 0).unwrap();
        let mut a = IpoEntity::new("Bharat Coking Coal", now).unwrap();
        a.status = IpoStatus::Open;
        a.fields.insert("gmp".into(), FieldValue::text("₹4"));
        let b = IpoEntity::new("Bharat Coking Coal Ltd", now).unwrap();
        let candidate = DuplicateCandidate {
            first_id: a.id,
            first_name: a.name.clone(),
            second_id: b.id,
            second_name: b.name.clone(),
            score: 90,
        };
        let summary = summary(vec![candidate]);

        let paths = write_run_reports(dir.path(), &summary, &[a, b]).await.unwrap();
        let brief = std::fs::read_to_string(paths.run_dir.join("ingest_brief.md")).unwrap();
        assert!(brief.contains("Bharat Coking Coal vs Bharat Coking Coal Ltd (score 90)"));
        assert!(brief.contains("- open: 1"));

        let manifest: SnapshotManifest =
            serde_json::from_slice(&std::fs::read(&paths.manifest).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(paths.run_dir.join(&file.path)).unwrap();
            assert_eq!(bytes.len() as u64, file.bytes);
            assert_eq!(file.sha256.len(), 64);
        }

        let index = recent_runs_markdown(dir.path(), 5).unwrap();
        assert!(index.contains(&summary.run_id.to_string()));
        assert!(index.contains("- entities: 2"));
        assert!(index.contains("- duplicate candidates: 1"));
    }
}
