//! One ingest run: scrape bundles in, reconciled entities, duplicate
//! candidates and run reports out.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipor_core::{DuplicateCandidate, IpoEntity};
use ipor_sources::{
    adapter_for_source, bundle_paths, deterministic_bundle_id, load_bundle, SourceProfile, SourceRegistry,
};
use ipor_storage::{IpoStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{load_field_aliases, SyncConfig};
use crate::dedup::DuplicateDetector;
use crate::digest::{build_admin_summary, AdminSummaryInput, SourceFailure};
use crate::merge::FieldMergeEngine;
use crate::reports::write_run_reports;
use crate::resolve::{AutoMergePolicy, EntityMergeResolver, MergeOutcome};
use crate::transport::Transport;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceRunStats {
    pub source_id: String,
    pub bundles: usize,
    pub records: usize,
    pub upserted: usize,
    pub rejected: usize,
    pub failures: Vec<String>,
}

impl SourceRunStats {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub sources: Vec<SourceRunStats>,
    pub upserted: usize,
    pub entity_failures: usize,
    pub candidates: Vec<DuplicateCandidate>,
    pub auto_merged: Vec<MergeOutcome>,
    pub total_entities: usize,
    #[serde(skip)]
    pub reports_dir: Option<PathBuf>,
    #[serde(skip)]
    pub parquet_manifest: Option<PathBuf>,
    #[serde(skip)]
    pub admin_notified: bool,
}

impl IngestRunSummary {
    pub fn source_failures(&self) -> Vec<SourceFailure> {
        self.sources
            .iter()
            .filter(|s| !s.succeeded())
            .map(|s| SourceFailure {
                source_id: s.source_id.clone(),
                reason: s.failures.join("; "),
            })
            .collect()
    }
}

/// Scrape bundles in, reconciled entities and duplicate candidates out.
pub struct IngestPipeline {
    config: SyncConfig,
    engine: FieldMergeEngine,
    detector: DuplicateDetector,
    resolver: EntityMergeResolver,
    auto_merge: AutoMergePolicy,
}

impl IngestPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let aliases = load_field_aliases(&config.workspace_root)?;
        Ok(Self {
            engine: FieldMergeEngine::new(aliases),
            detector: DuplicateDetector::with_threshold(config.dedup_threshold),
            resolver: EntityMergeResolver::new(),
            auto_merge: AutoMergePolicy::new(config.auto_merge_threshold),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn engine(&self) -> &FieldMergeEngine {
        &self.engine
    }

    pub fn detector(&self) -> &DuplicateDetector {
        &self.detector
    }

    pub fn resolver(&self) -> &EntityMergeResolver {
        &self.resolver
    }

    /// Duplicate sweep over the current store contents.
    pub async fn scan_duplicates(&self, store: &dyn IpoStore) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let index = store.name_index().await?;
        Ok(self.detector.detect(&index))
    }

    /// Fails only when the registry cannot be read, the store becomes
    /// unavailable, or reports cannot be written. Source, bundle, record and
    /// entity failures are recorded in the summary.
    pub async fn run_once(
        &self,
        store: &dyn IpoStore,
        transport: &dyn Transport,
        now: DateTime<Utc>,
    ) -> Result<IngestRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", run_id = %run_id);
        self.run_inner(run_id, store, transport, now).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        store: &dyn IpoStore,
        transport: &dyn Transport,
        now: DateTime<Utc>,
    ) -> Result<IngestRunSummary> {
        let registry = SourceRegistry::load(self.config.sources_path())?;
        let enabled: Vec<&SourceProfile> = registry.enabled().collect();
        info!(sources = enabled.len(), "starting ingest run");

        let mut sources = Vec::with_capacity(enabled.len());
        let mut entity_failures = 0usize;
        for profile in enabled {
            let stats = self
                .ingest_source(profile, store, now, &mut entity_failures)
                .await?;
            sources.push(stats);
        }
        let upserted = sources.iter().map(|s| s.upserted).sum();

        let mut candidates = self
            .scan_duplicates(store)
            .await
            .context("duplicate sweep")?;
        let mut auto_merged = Vec::new();
        if self.auto_merge.is_enabled() && !candidates.is_empty() {
            let report = self
                .auto_merge
                .apply(&self.resolver, store, &candidates, now)
                .await
                .context("automatic merge sweep")?;
            for skipped in &report.skipped {
                warn!(first = %skipped.first_id, second = %skipped.second_id, reason = %skipped.reason, "pair left for review");
            }
            if !report.merged.is_empty() {
                candidates = self
                    .scan_duplicates(store)
                    .await
                    .context("duplicate sweep after automatic merge")?;
            }
            auto_merged = report.merged;
        }

        let entities: Vec<IpoEntity> = store.list().await.context("listing entities")?;
        let mut summary = IngestRunSummary {
            run_id,
            run_at: now,
            sources,
            upserted,
            entity_failures,
            candidates,
            auto_merged,
            total_entities: entities.len(),
            reports_dir: None,
            parquet_manifest: None,
            admin_notified: false,
        };

        let paths = write_run_reports(&self.config.reports_dir(), &summary, &entities).await?;
        summary.reports_dir = Some(paths.run_dir);
        summary.parquet_manifest = Some(paths.manifest);

        if let Some(admin) = self.config.admin_email.as_deref() {
            summary.admin_notified = self.notify_admin(admin, &summary, &entities, transport, now).await;
        }

        info!(
            upserted = summary.upserted,
            entities = summary.total_entities,
            candidates = summary.candidates.len(),
            auto_merged = summary.auto_merged.len(),
            "ingest run finished"
        );
        Ok(summary)
    }

    async fn ingest_source(
        &self,
        profile: &SourceProfile,
        store: &dyn IpoStore,
        now: DateTime<Utc>,
        entity_failures: &mut usize,
    ) -> Result<SourceRunStats> {
        let mut stats = SourceRunStats::new(&profile.source_id);
        let inbox = self.config.scrapes_dir().join(&profile.source_id);
        let paths = match bundle_paths(&inbox) {
            Ok(paths) if paths.is_empty() => {
                warn!(source = %profile.source_id, inbox = %inbox.display(), "no scrape bundles");
                stats.failures.push(format!("no bundles in {}", inbox.display()));
                return Ok(stats);
            }
            Ok(paths) => paths,
            Err(err) => {
                warn!(source = %profile.source_id, error = %err, "scrape inbox unreadable");
                stats.failures.push(format!("{err:#}"));
                return Ok(stats);
            }
        };

        let adapter = adapter_for_source(profile);
        for path in paths {
            let batch = match load_bundle(&path).and_then(|bundle| {
                debug!(
                    source = %profile.source_id,
                    bundle_id = %deterministic_bundle_id(&path, &bundle),
                    records = bundle.records.len(),
                    "normalizing bundle"
                );
                adapter.normalize(&bundle).map_err(anyhow::Error::from)
            }) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(source = %profile.source_id, bundle = %path.display(), error = %err, "bundle skipped");
                    stats.failures.push(format!("{}: {err:#}", path.display()));
                    continue;
                }
            };
            stats.bundles += 1;
            stats.records += batch.updates.len() + batch.rejected.len();
            stats.rejected += batch.rejected.len();
            for rejected in &batch.rejected {
                warn!(source = %profile.source_id, record = rejected.index, reason = %rejected.reason, "record rejected");
            }

            for update in &batch.updates {
                match self.engine.apply(store, update, now).await {
                    Ok(_) => stats.upserted += 1,
                    Err(err) if err.is_unavailable() => {
                        return Err(err).context("store unavailable during ingest");
                    }
                    Err(err) => {
                        *entity_failures += 1;
                        warn!(source = %profile.source_id, name = %update.name, error = %err, "entity upsert failed");
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn notify_admin(
        &self,
        admin: &str,
        summary: &IngestRunSummary,
        entities: &[IpoEntity],
        transport: &dyn Transport,
        now: DateTime<Utc>,
    ) -> bool {
        let failures = summary.source_failures();
        let message = match build_admin_summary(AdminSummaryInput {
            recipient: admin,
            public_base_url: &self.config.public_base_url,
            now,
            sources_total: summary.sources.len(),
            source_failures: &failures,
            entities,
            candidates: &summary.candidates,
        }) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "admin summary could not be rendered");
                return false;
            }
        };
        match transport.deliver(&message).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "admin summary delivery failed");
                false
            }
        }
    }
}
