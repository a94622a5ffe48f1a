//! Persistence seams for IPO Radar: entity and subscriber stores plus the
//! on-disk message outbox.
//!
//! Every engine takes a store handle explicitly; there is no process-wide
//! connection. [`InMemoryStore`] backs tests, [`PgStore`] backs deployments.

pub mod memory;
pub mod outbox;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipor_core::{CoreError, FieldUpdate, IpoEntity, IpoStatus, Subscriber};
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryStore;
pub use outbox::{MessageOutbox, OutboxEntry};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "ipor-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Invalid(#[from] CoreError),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[async_trait]
pub trait IpoStore: Send + Sync {
    /// Partial-document upsert keyed by exact `name`. Atomic per entity: a
    /// concurrent update to the same name is applied wholly before or after.
    async fn upsert(&self, update: &FieldUpdate, now: DateTime<Utc>)
        -> Result<IpoEntity, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<IpoEntity>, StoreError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<IpoEntity>, StoreError>;

    /// Most recently updated first.
    async fn list(&self) -> Result<Vec<IpoEntity>, StoreError>;

    async fn list_by_status(&self, status: IpoStatus) -> Result<Vec<IpoEntity>, StoreError>;

    /// `(id, name)` pairs in a stable creation order.
    async fn name_index(&self) -> Result<Vec<(Uuid, String)>, StoreError>;

    /// Folds `merge` into `keep` (keep wins on conflicting keys) and deletes
    /// `merge`, in one atomic step. Fails with `NotFound` if either is gone.
    async fn absorb(
        &self,
        keep: Uuid,
        merge: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IpoEntity, StoreError>;
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn list_email_enabled(&self) -> Result<Vec<Subscriber>, StoreError>;

    /// Takes the per-subscriber delivery claim and returns a fresh copy of the
    /// record, or `None` when another cycle currently holds the claim.
    async fn claim_delivery(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscriber>, StoreError>;

    /// Drops the claim. With `sent_at` set, `lastNotificationSentAt` advances
    /// to it; the stored value never moves backwards.
    async fn release_delivery(
        &self,
        id: Uuid,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}
