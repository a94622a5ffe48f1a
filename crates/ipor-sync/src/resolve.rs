//! Entity merge resolver: folds a duplicate into the record an operator (or
//! the automatic policy) chose to keep, then deletes the duplicate.

use chrono::{DateTime, Utc};
use ipor_core::{CoreError, DuplicateCandidate, IpoEntity};
use ipor_storage::{IpoStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("entity {0} not found")]
    NotFound(Uuid),
    #[error("cannot merge entity {0} into itself")]
    SelfMerge(Uuid),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ResolveError::NotFound(id),
            StoreError::Unavailable(reason) => ResolveError::StoreUnavailable(reason),
            StoreError::Invalid(CoreError::SelfMerge(id)) => ResolveError::SelfMerge(id),
            other => ResolveError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub kept: IpoEntity,
    pub merged_id: Uuid,
    pub merged_name: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntityMergeResolver;

impl EntityMergeResolver {
    pub fn new() -> Self {
        Self
    }

    /// Copies each field of `merge` that `keep` lacks, keeps `keep.status`,
    /// and deletes `merge`. A repeat call for the same pair fails with
    /// [`ResolveError::NotFound`].
    pub async fn resolve(
        &self,
        store: &dyn IpoStore,
        keep: Uuid,
        merge: Uuid,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, ResolveError> {
        if keep == merge {
            return Err(ResolveError::SelfMerge(keep));
        }
        let merged_name = store
            .get(merge)
            .await?
            .map(|entity| entity.name)
            .ok_or(ResolveError::NotFound(merge))?;
        let kept = store.absorb(keep, merge, now).await?;
        info!(
            keep = %keep,
            merge = %merge,
            kept_name = kept.name.as_str(),
            merged_name = merged_name.as_str(),
            "merged duplicate entity"
        );
        Ok(MergeOutcome {
            kept,
            merged_id: merge,
            merged_name,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedMerge {
    pub first_id: Uuid,
    pub second_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoMergeReport {
    pub merged: Vec<MergeOutcome>,
    pub skipped: Vec<SkippedMerge>,
}

/// Unattended merging of high-confidence pairs. Off unless a threshold is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoMergePolicy {
    pub threshold: Option<u8>,
}

impl AutoMergePolicy {
    pub fn new(threshold: Option<u8>) -> Self {
        Self { threshold }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold.is_some()
    }

    pub fn qualifies(&self, candidate: &DuplicateCandidate) -> bool {
        self.threshold.is_some_and(|t| candidate.score >= t)
    }

    /// The richer record survives; ties keep the first of the pair.
    pub fn choose_keep(first: &IpoEntity, second: &IpoEntity) -> (Uuid, Uuid) {
        if second.populated_fields() > first.populated_fields() {
            (second.id, first.id)
        } else {
            (first.id, second.id)
        }
    }

    /// Merges every qualifying candidate in order. Pairs that lost an entity to
    /// an earlier merge in the same sweep are skipped; only store
    /// unavailability aborts the sweep.
    pub async fn apply(
        &self,
        resolver: &EntityMergeResolver,
        store: &dyn IpoStore,
        candidates: &[DuplicateCandidate],
        now: DateTime<Utc>,
    ) -> Result<AutoMergeReport, ResolveError> {
        let mut report = AutoMergeReport::default();
        for candidate in candidates.iter().filter(|c| self.qualifies(c)) {
            let skip = |reason: String| SkippedMerge {
                first_id: candidate.first_id,
                second_id: candidate.second_id,
                reason,
            };
            let first = store.get(candidate.first_id).await.map_err(ResolveError::from)?;
            let second = store.get(candidate.second_id).await.map_err(ResolveError::from)?;
            let (Some(first), Some(second)) = (first, second) else {
                report.skipped.push(skip("entity already merged away".to_string()));
                continue;
            };
            let (keep, merge) = Self::choose_keep(&first, &second);
            match resolver.resolve(store, keep, merge, now).await {
                Ok(outcome) => report.merged.push(outcome),
                Err(ResolveError::StoreUnavailable(reason)) => {
                    return Err(ResolveError::StoreUnavailable(reason));
                }
                Err(err) => {
                    warn!(keep = %keep, merge = %merge, error = %err, "automatic merge skipped");
                    report.skipped.push(skip(err.to_string()));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ipor_core::{FieldUpdate, FieldValue, IpoStatus};
    use ipor_storage::InMemoryStore;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, 0, 0).unwrap()
    }

    async fn seed(store: &InMemoryStore, name: &str, status: IpoStatus, fields: &[(&str, &str)]) -> Uuid {
        let mut update = FieldUpdate::new("chittorgarh", name).with_status(status);
        for (k, v) in fields {
            update = update.with_field(*k, FieldValue::text(*v));
        }
        store.upsert(&update, ts(1)).await.unwrap().id
    }

    #[tokio::test]
    async fn keep_wins_on_conflicting_fields() {
        let store = InMemoryStore::new();
        let keep = seed(&store, "Alpha Corp", IpoStatus::Upcoming, &[("gmp", "₹50")]).await;
        let merge = seed(
            &store,
            "Alpha Corp Ltd",
            IpoStatus::Open,
            &[("gmp", "₹60"), ("subscription", "2x")],
        )
        .await;

        let outcome = EntityMergeResolver::new().resolve(&store, keep, merge, ts(2)).await.unwrap();
        assert_eq!(outcome.merged_name, "Alpha Corp Ltd");
        assert_eq!(outcome.kept.text("gmp"), Some("₹50"));
        assert_eq!(outcome.kept.text("subscription"), Some("2x"));
        assert_eq!(outcome.kept.fields.len(), 2);
        assert_eq!(outcome.kept.status, IpoStatus::Upcoming);
        assert!(store.get(merge).await.unwrap().is_none());
        assert!(store.find_by_name("Alpha Corp Ltd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_resolve_of_the_same_pair_is_not_found() {
        let store = InMemoryStore::new();
        let keep = seed(&store, "Alpha Corp", IpoStatus::Open, &[]).await;
        let merge = seed(&store, "Alpha Crop", IpoStatus::Open, &[]).await;
        let resolver = EntityMergeResolver::new();

        resolver.resolve(&store, keep, merge, ts(2)).await.unwrap();
        let err = resolver.resolve(&store, keep, merge, ts(3)).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(id) if id == merge));
    }

    #[tokio::test]
    async fn self_merge_and_unavailable_store_are_distinct_errors() {
        let store = InMemoryStore::new();
        let id = seed(&store, "Alpha Corp", IpoStatus::Open, &[]).await;
        let resolver = EntityMergeResolver::new();
        assert!(matches!(
            resolver.resolve(&store, id, id, ts(2)).await,
            Err(ResolveError::SelfMerge(_))
        ));

        store.set_unavailable(true);
        assert!(matches!(
            resolver.resolve(&store, id, Uuid::new_v4(), ts(2)).await,
            Err(ResolveError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn auto_merge_keeps_the_richer_record_and_skips_vanished_pairs() {
        let store = InMemoryStore::new();
        let a = seed(&store, "Alpha Corp", IpoStatus::Open, &[("gmp", "₹50")]).await;
        let b = seed(&store, "Alpha Crop", IpoStatus::Open, &[("gmp", "₹50"), ("lot size", "600")]).await;
        let c = seed(&store, "Alpha Corpp", IpoStatus::Open, &[]).await;
        let candidates = vec![
            DuplicateCandidate { first_id: a, first_name: "Alpha Corp".into(), second_id: b, second_name: "Alpha Crop".into(), score: 90 },
            DuplicateCandidate { first_id: a, first_name: "Alpha Corp".into(), second_id: c, second_name: "Alpha Corpp".into(), score: 95 },
            DuplicateCandidate { first_id: b, first_name: "Alpha Crop".into(), second_id: c, second_name: "Alpha Corpp".into(), score: 86 },
        ];

        let report = AutoMergePolicy::new(Some(90))
            .apply(&EntityMergeResolver::new(), &store, &candidates, ts(2))
            .await
            .unwrap();

        assert_eq!(report.merged.len(), 1);
        assert_eq!(report.merged[0].kept.id, b);
        assert_eq!(report.merged[0].merged_id, a);
        assert_eq!(report.skipped.len(), 1);
        assert!(store.get(c).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disabled_policy_merges_nothing() {
        let store = InMemoryStore::new();
        let a = seed(&store, "Alpha Corp", IpoStatus::Open, &[]).await;
        let b = seed(&store, "Alpha Crop", IpoStatus::Open, &[]).await;
        let candidates = vec![DuplicateCandidate {
            first_id: a,
            first_name: "Alpha Corp".into(),
            second_id: b,
            second_name: "Alpha Crop".into(),
            score: 100,
        }];
        let report = AutoMergePolicy::default()
            .apply(&EntityMergeResolver::new(), &store, &candidates, ts(2))
            .await
            .unwrap();
        assert!(report.merged.is_empty());
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
