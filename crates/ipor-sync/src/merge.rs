//! Field merge engine: the only writer of scraped facts into the store.

use chrono::{DateTime, Utc};
use ipor_core::{CoreError, FieldAliases, FieldUpdate, IpoEntity, IpoStatus};
use ipor_storage::{IpoStore, StoreError};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct FieldMergeEngine {
    aliases: FieldAliases,
}

impl FieldMergeEngine {
    pub fn new(aliases: FieldAliases) -> Self {
        Self { aliases }
    }

    pub fn aliases(&self) -> &FieldAliases {
        &self.aliases
    }

    /// Canonicalizes field keys. Every value present in the update is kept,
    /// empty strings included; sources omit what they did not observe. An
    /// `unknown` status carries no information and is dropped. The name is
    /// left exactly as reported: identity is a case-sensitive match.
    pub fn prepare(&self, update: &FieldUpdate) -> Result<FieldUpdate, CoreError> {
        if update.name.trim().is_empty() {
            return Err(CoreError::EmptyName);
        }
        let mut prepared = self.aliases.canonicalize(update);
        if prepared.status == Some(IpoStatus::Unknown) {
            debug!(
                source_id = update.source_id.as_str(),
                name = update.name.as_str(),
                "ignoring unknown status"
            );
            prepared.status = None;
        }
        Ok(prepared)
    }

    pub async fn apply(
        &self,
        store: &dyn IpoStore,
        update: &FieldUpdate,
        now: DateTime<Utc>,
    ) -> Result<IpoEntity, StoreError> {
        let prepared = self.prepare(update)?;
        store.upsert(&prepared, now).await
    }
}
