//! Postgres-backed stores.
//!
//! `fields` and `source_sections` live in `jsonb` columns so a source update
//! is a single `fields || patch` statement: keys the source did not report are
//! never rewritten, and the row lock taken by `ON CONFLICT DO UPDATE` keeps two
//! sources from interleaving on the same entity.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipor_core::{
    absorb, CoreError, FieldUpdate, FieldValue, IpoEntity, IpoStatus, NotificationPreferences,
    Subscriber, Topics,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{IpoStore, StoreError, SubscriberStore};

/// A delivery claim older than this is assumed to belong to a crashed cycle.
const DELIVERY_CLAIM_LEASE: Duration = Duration::from_secs(15 * 60);

const IPO_COLUMNS: &str = "id, name, status, fields, source_sections, created_at, updated_at";

const SUBSCRIBER_COLUMNS: &str = "id, email, email_enabled, notification_email, frequency, \
     topic_new_ipos, topic_listing_date, topic_closing_soon, last_notification_sent_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn ipo_from_row(row: &PgRow) -> Result<IpoEntity, StoreError> {
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    let status = status
        .parse::<IpoStatus>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let Json(fields): Json<BTreeMap<String, FieldValue>> =
        row.try_get("fields").map_err(map_sqlx)?;
    let Json(source_sections): Json<BTreeMap<String, String>> =
        row.try_get("source_sections").map_err(map_sqlx)?;
    Ok(IpoEntity {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        status,
        fields,
        source_sections,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber, StoreError> {
    Ok(Subscriber {
        id: row.try_get("id").map_err(map_sqlx)?,
        email: row.try_get("email").map_err(map_sqlx)?,
        preferences: NotificationPreferences {
            email_enabled: row.try_get("email_enabled").map_err(map_sqlx)?,
            notification_email: row.try_get("notification_email").map_err(map_sqlx)?,
            frequency: row.try_get("frequency").map_err(map_sqlx)?,
            topics: Topics {
                new_ipos: row.try_get("topic_new_ipos").map_err(map_sqlx)?,
                listing_date: row.try_get("topic_listing_date").map_err(map_sqlx)?,
                closing_soon: row.try_get("topic_closing_soon").map_err(map_sqlx)?,
            },
            last_notification_sent_at: row.try_get("last_notification_sent_at").map_err(map_sqlx)?,
        },
    })
}

#[async_trait]
impl IpoStore for PgStore {
    async fn upsert(
        &self,
        update: &FieldUpdate,
        now: DateTime<Utc>,
    ) -> Result<IpoEntity, StoreError> {
        if update.name.trim().is_empty() {
            return Err(CoreError::EmptyName.into());
        }
        let sql = format!(
            r#"
            INSERT INTO ipos (id, name, status, fields, source_sections, created_at, updated_at)
            VALUES ($1, $2, COALESCE($3, 'unknown'), $4, $5, $6, $6)
            ON CONFLICT (name) DO UPDATE
               SET status = COALESCE($3, ipos.status),
                   fields = ipos.fields || EXCLUDED.fields,
                   source_sections = ipos.source_sections || EXCLUDED.source_sections,
                   updated_at = EXCLUDED.updated_at
            RETURNING {IPO_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&update.name)
            .bind(update.status.map(|s| s.as_str()))
            .bind(Json(&update.fields))
            .bind(Json(&update.source_sections))
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        ipo_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<IpoEntity>, StoreError> {
        let sql = format!("SELECT {IPO_COLUMNS} FROM ipos WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(ipo_from_row).transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<IpoEntity>, StoreError> {
        let sql = format!("SELECT {IPO_COLUMNS} FROM ipos WHERE name = $1");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(ipo_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<IpoEntity>, StoreError> {
        let sql = format!("SELECT {IPO_COLUMNS} FROM ipos ORDER BY updated_at DESC, name");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(ipo_from_row).collect()
    }

    async fn list_by_status(&self, status: IpoStatus) -> Result<Vec<IpoEntity>, StoreError> {
        let sql = format!(
            "SELECT {IPO_COLUMNS} FROM ipos WHERE status = $1 ORDER BY updated_at DESC, name"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(ipo_from_row).collect()
    }

    async fn name_index(&self) -> Result<Vec<(Uuid, String)>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM ipos ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("id").map_err(map_sqlx)?,
                    row.try_get("name").map_err(map_sqlx)?,
                ))
            })
            .collect()
    }

    async fn absorb(
        &self,
        keep: Uuid,
        merge: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IpoEntity, StoreError> {
        if keep == merge {
            return Err(CoreError::SelfMerge(keep).into());
        }
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // Lock both rows in id order so two opposite merges cannot deadlock.
        let sql = format!(
            "SELECT {IPO_COLUMNS} FROM ipos WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(vec![keep, merge])
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let mut locked = rows
            .iter()
            .map(ipo_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let keep_idx = locked
            .iter()
            .position(|e| e.id == keep)
            .ok_or(StoreError::NotFound(keep))?;
        let keep_entity = locked.swap_remove(keep_idx);
        let merge_entity = locked
            .into_iter()
            .find(|e| e.id == merge)
            .ok_or(StoreError::NotFound(merge))?;

        let merged = absorb(keep_entity, &merge_entity, now)?;

        sqlx::query(
            r#"
            UPDATE ipos
               SET fields = $2,
                   source_sections = $3,
                   updated_at = $4
             WHERE id = $1
            "#,
        )
        .bind(keep)
        .bind(Json(&merged.fields))
        .bind(Json(&merged.source_sections))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query("DELETE FROM ipos WHERE id = $1")
            .bind(merge)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        debug!(%keep, %merge, "absorbed duplicate entity");
        Ok(merged)
    }
}

#[async_trait]
impl SubscriberStore for PgStore {
    async fn list_email_enabled(&self) -> Result<Vec<Subscriber>, StoreError> {
        let sql = format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE email_enabled ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(subscriber_from_row).collect()
    }

    async fn claim_delivery(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscriber>, StoreError> {
        let sql = format!(
            r#"
            UPDATE subscribers
               SET delivery_claimed_at = $2
             WHERE id = $1
               AND (delivery_claimed_at IS NULL
                    OR delivery_claimed_at < $2 - make_interval(secs => $3))
            RETURNING {SUBSCRIBER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .bind(DELIVERY_CLAIM_LEASE.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if let Some(row) = row {
            return subscriber_from_row(&row).map(Some);
        }

        let exists = sqlx::query("SELECT 1 FROM subscribers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match exists {
            Some(_) => Ok(None),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn release_delivery(
        &self,
        id: Uuid,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        // GREATEST ignores NULLs: no stamp keeps the old value, and an older
        // stamp never replaces a newer one.
        let result = sqlx::query(
            r#"
            UPDATE subscribers
               SET delivery_claimed_at = NULL,
                   last_notification_sent_at =
                       GREATEST(last_notification_sent_at, $2::timestamptz)
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_map_to_unavailable() {
        assert!(map_sqlx(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(!map_sqlx(sqlx::Error::RowNotFound).is_unavailable());
    }
}
