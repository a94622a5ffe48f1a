//! Field-name alias resolution and the pure record merge rules.
//!
//! Sources disagree on field naming (`gmp` vs `gmp(₹)`, `subscription` vs
//! `overall subscription`). Keys are canonicalized through [`FieldAliases`]
//! before anything is written, so the merge rules below only ever compare
//! canonical keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{CoreError, FieldUpdate, FieldValue, IpoEntity};

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("gmp(₹)", "gmp"),
    ("gmp (₹)", "gmp"),
    ("gmp(rs)", "gmp"),
    ("gmp (rs)", "gmp"),
    ("grey market premium", "gmp"),
    ("overall subscription", "subscription"),
    ("subscription (times)", "subscription"),
    ("ipo dates", "ipo date"),
    ("listed on", "listing date"),
    ("listing on", "listing date"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAliases {
    map: BTreeMap<String, String>,
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FieldAliases {
    pub fn empty() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut aliases = Self::empty();
        aliases.extend(BUILTIN_ALIASES.iter().map(|(a, c)| (a.to_string(), c.to_string())));
        aliases
    }

    pub fn with_alias(mut self, alias: &str, canonical: &str) -> Self {
        self.insert(alias, canonical);
        self
    }

    pub fn insert(&mut self, alias: &str, canonical: &str) {
        let alias = Self::normalize_key(alias);
        let canonical = Self::normalize_key(canonical);
        if alias != canonical {
            self.map.insert(alias, canonical);
        }
    }

    pub fn extend<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (alias, canonical) in pairs {
            self.insert(&alias, &canonical);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Lower-cases, trims and collapses internal whitespace.
    pub fn normalize_key(raw: &str) -> String {
        raw.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn is_alias(&self, raw: &str) -> bool {
        self.map.contains_key(&Self::normalize_key(raw))
    }

    pub fn canonical(&self, raw: &str) -> String {
        let key = Self::normalize_key(raw);
        match self.map.get(&key) {
            Some(canonical) => canonical.clone(),
            None => key,
        }
    }

    /// Rewrites an update's field keys to canonical form. When an update
    /// carries both an alias and its canonical key, the canonical key wins.
    pub fn canonicalize(&self, update: &FieldUpdate) -> FieldUpdate {
        let mut fields = BTreeMap::new();
        let (aliased, direct): (Vec<_>, Vec<_>) =
            update.fields.iter().partition(|(k, _)| self.is_alias(k));
        for (key, value) in aliased.into_iter().chain(direct) {
            fields.insert(self.canonical(key), value.clone());
        }
        FieldUpdate {
            fields,
            ..update.clone()
        }
    }
}

/// Applies one source's update onto the entity stored under the same name.
///
/// Keys in the update overwrite; keys absent from the update are left alone.
/// Status is replaced only when the update carries one.
pub fn apply_update(
    existing: Option<IpoEntity>,
    update: &FieldUpdate,
    now: DateTime<Utc>,
) -> Result<IpoEntity, CoreError> {
    let mut entity = match existing {
        Some(entity) => entity,
        None => IpoEntity::new(update.name.clone(), now)?,
    };

    if let Some(status) = update.status {
        entity.status = status;
    }
    for (key, value) in &update.fields {
        entity.fields.insert(key.clone(), value.clone());
    }
    for (key, raw) in &update.source_sections {
        entity.source_sections.insert(key.clone(), raw.clone());
    }
    entity.updated_at = now;
    Ok(entity)
}

/// Folds `merge` into `keep`. Values already present on `keep` win; keys only
/// `merge` knows about are copied over. `keep.status` is not touched.
pub fn absorb(
    mut keep: IpoEntity,
    merge: &IpoEntity,
    now: DateTime<Utc>,
) -> Result<IpoEntity, CoreError> {
    if keep.id == merge.id {
        return Err(CoreError::SelfMerge(keep.id));
    }
    for (key, value) in &merge.fields {
        keep.fields
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    for (key, raw) in &merge.source_sections {
        keep.source_sections
            .entry(key.clone())
            .or_insert_with(|| raw.clone());
    }
    keep.updated_at = now;
    Ok(keep)
}
