//! In-process store used by tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipor_core::{absorb, apply_update, CoreError, FieldUpdate, IpoEntity, IpoStatus, Subscriber};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{IpoStore, StoreError, SubscriberStore};

#[derive(Debug, Default)]
struct IpoTable {
    by_id: HashMap<Uuid, IpoEntity>,
    by_name: HashMap<String, Uuid>,
    order: Vec<Uuid>,
}

#[derive(Debug, Default)]
struct SubscriberTable {
    by_id: BTreeMap<Uuid, Subscriber>,
    claimed: HashSet<Uuid>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    ipos: Mutex<IpoTable>,
    subscribers: Mutex<SubscriberTable>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a lost backend: every call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn insert_subscriber(&self, subscriber: Subscriber) {
        let mut table = self.subscribers.lock().await;
        table.by_id.insert(subscriber.id, subscriber);
    }

    pub async fn subscriber(&self, id: Uuid) -> Option<Subscriber> {
        self.subscribers.lock().await.by_id.get(&id).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IpoStore for InMemoryStore {
    async fn upsert(
        &self,
        update: &FieldUpdate,
        now: DateTime<Utc>,
    ) -> Result<IpoEntity, StoreError> {
        self.check_available()?;
        let mut table = self.ipos.lock().await;
        let existing = table
            .by_name
            .get(&update.name)
            .and_then(|id| table.by_id.get(id))
            .cloned();
        let is_new = existing.is_none();
        let entity = apply_update(existing, update, now)?;
        if is_new {
            table.by_name.insert(entity.name.clone(), entity.id);
            table.order.push(entity.id);
        }
        table.by_id.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn get(&self, id: Uuid) -> Result<Option<IpoEntity>, StoreError> {
        self.check_available()?;
        Ok(self.ipos.lock().await.by_id.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<IpoEntity>, StoreError> {
        self.check_available()?;
        let table = self.ipos.lock().await;
        Ok(table.by_name.get(name).and_then(|id| table.by_id.get(id)).cloned())
    }

    async fn list(&self) -> Result<Vec<IpoEntity>, StoreError> {
        self.check_available()?;
        let mut all = self.ipos.lock().await.by_id.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.name.cmp(&b.name)));
        Ok(all)
    }

    async fn list_by_status(&self, status: IpoStatus) -> Result<Vec<IpoEntity>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.status == status)
            .collect())
    }

    async fn name_index(&self) -> Result<Vec<(Uuid, String)>, StoreError> {
        self.check_available()?;
        let table = self.ipos.lock().await;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .map(|e| (e.id, e.name.clone()))
            .collect())
    }

    async fn absorb(
        &self,
        keep: Uuid,
        merge: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IpoEntity, StoreError> {
        self.check_available()?;
        if keep == merge {
            return Err(CoreError::SelfMerge(keep).into());
        }
        let mut table = self.ipos.lock().await;
        let keep_entity = table.by_id.get(&keep).cloned().ok_or(StoreError::NotFound(keep))?;
        let merge_entity = table.by_id.get(&merge).cloned().ok_or(StoreError::NotFound(merge))?;

        let merged = absorb(keep_entity, &merge_entity, now)?;
        table.by_id.insert(keep, merged.clone());
        table.by_id.remove(&merge);
        table.by_name.remove(&merge_entity.name);
        table.order.retain(|id| *id != merge);
        Ok(merged)
    }
}

#[async_trait]
impl SubscriberStore for InMemoryStore {
    async fn list_email_enabled(&self) -> Result<Vec<Subscriber>, StoreError> {
        self.check_available()?;
        Ok(self
            .subscribers
            .lock()
            .await
            .by_id
            .values()
            .filter(|s| s.preferences.email_enabled)
            .cloned()
            .collect())
    }

    async fn claim_delivery(
        &self,
        id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<Option<Subscriber>, StoreError> {
        self.check_available()?;
        let mut table = self.subscribers.lock().await;
        let subscriber = table.by_id.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        if !table.claimed.insert(id) {
            return Ok(None);
        }
        Ok(Some(subscriber))
    }

    async fn release_delivery(
        &self,
        id: Uuid,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut table = self.subscribers.lock().await;
        table.claimed.remove(&id);
        let subscriber = table.by_id.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(sent_at) = sent_at {
            let last = &mut subscriber.preferences.last_notification_sent_at;
            if last.map_or(true, |prev| sent_at > prev) {
                *last = Some(sent_at);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ipor_core::{FieldValue, NotificationPreferences};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_exact_name() {
        let store = InMemoryStore::new();
        let first = store
            .upsert(
                &FieldUpdate::new("chittorgarh", "Alpha Corp")
                    .with_field("gmp", FieldValue::text("₹50")),
                ts(1),
            )
            .await
            .unwrap();
        let second = store
            .upsert(
                &FieldUpdate::new("investorgain", "Alpha Corp")
                    .with_field("subscription", FieldValue::text("3.2x")),
                ts(2),
            )
            .await
            .unwrap();
        let other_case = store
            .upsert(&FieldUpdate::new("groww", "ALPHA CORP"), ts(3))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other_case.id);
        assert_eq!(second.fields.len(), 2);
        assert_eq!(store.name_index().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn absorb_deletes_the_duplicate_and_second_call_is_not_found() {
        let store = InMemoryStore::new();
        let keep = store.upsert(&FieldUpdate::new("a", "Alpha Corp"), ts(1)).await.unwrap();
        let merge = store
            .upsert(&FieldUpdate::new("b", "Alpha Corp Ltd"), ts(1))
            .await
            .unwrap();

        store.absorb(keep.id, merge.id, ts(2)).await.unwrap();
        assert!(store.get(merge.id).await.unwrap().is_none());
        assert!(store.find_by_name("Alpha Corp Ltd").await.unwrap().is_none());

        let err = store.absorb(keep.id, merge.id, ts(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == merge.id));
        assert_eq!(store.get(keep.id).await.unwrap().unwrap().updated_at, ts(2));
    }

    #[tokio::test]
    async fn delivery_claim_is_exclusive_and_stamp_is_monotonic() {
        let store = InMemoryStore::new();
        let sub = Subscriber {
            id: Uuid::new_v4(),
            email: Some("a@example.com".into()),
            preferences: NotificationPreferences {
                email_enabled: true,
                ..Default::default()
            },
        };
        store.insert_subscriber(sub.clone()).await;

        assert!(store.claim_delivery(sub.id, ts(1)).await.unwrap().is_some());
        assert!(store.claim_delivery(sub.id, ts(1)).await.unwrap().is_none());
        store.release_delivery(sub.id, Some(ts(5))).await.unwrap();

        assert!(store.claim_delivery(sub.id, ts(6)).await.unwrap().is_some());
        store.release_delivery(sub.id, Some(ts(3))).await.unwrap();
        let stored = store.subscriber(sub.id).await.unwrap();
        assert_eq!(stored.preferences.last_notification_sent_at, Some(ts(5)));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(store.list().await.unwrap_err().is_unavailable());
        assert!(store.list_email_enabled().await.unwrap_err().is_unavailable());
    }
}
