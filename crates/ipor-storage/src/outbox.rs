//! On-disk outbox for assembled messages.
//!
//! Every queued message gets its own id and lands as `<recipient>/<id>.json`
//! next to an `<id>.meta.json` record. Both go through a temp file and an
//! atomic rename, body first, so a relay that drains by metadata never sees a
//! partial body.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub recipient: String,
    pub queued_at: DateTime<Utc>,
    /// Lets the relay verify the body it picked up.
    pub sha256: String,
    pub byte_size: usize,
    /// Relative to the outbox root.
    pub body_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MessageOutbox {
    root: PathBuf,
}

impl MessageOutbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem-safe form of an address: `a.b@x.io` -> `a.b_x.io`.
    pub fn recipient_slug(recipient: &str) -> String {
        let slug = recipient
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect::<String>();
        let slug = slug.trim_matches(|c| c == '.' || c == '_').to_string();
        if slug.is_empty() {
            "unknown".to_string()
        } else {
            slug
        }
    }

    /// Queues one message. Sending the same body twice queues it twice.
    pub async fn enqueue(
        &self,
        queued_at: DateTime<Utc>,
        recipient: &str,
        body: &[u8],
    ) -> anyhow::Result<OutboxEntry> {
        let id = Uuid::new_v4();
        let dir = PathBuf::from(Self::recipient_slug(recipient));
        let entry = OutboxEntry {
            id,
            recipient: recipient.to_string(),
            queued_at,
            sha256: hex::encode(Sha256::digest(body)),
            byte_size: body.len(),
            body_path: dir.join(format!("{id}.json")),
        };

        let absolute_dir = self.root.join(&dir);
        fs::create_dir_all(&absolute_dir)
            .await
            .with_context(|| format!("creating outbox directory {}", absolute_dir.display()))?;

        write_atomically(&self.root.join(&entry.body_path), body).await?;
        let meta = serde_json::to_vec_pretty(&entry).context("encoding outbox metadata")?;
        write_atomically(&absolute_dir.join(format!("{id}{META_SUFFIX}")), &meta).await?;
        Ok(entry)
    }

    /// Every queued entry, oldest first.
    pub async fn pending(&self) -> anyhow::Result<Vec<OutboxEntry>> {
        let mut entries = Vec::new();
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(entries);
        }
        let mut dirs = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading outbox {}", self.root.display()))?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if !path.to_string_lossy().ends_with(META_SUFFIX) {
                    continue;
                }
                let bytes = fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let entry: OutboxEntry = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?;
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("outbox path {} has no parent", path.display()))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("moving {} into place", path.display()));
    }
    Ok(())
}
