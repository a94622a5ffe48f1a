//! Core domain model for IPO Radar: canonical IPO records, scraper updates,
//! duplicate candidates and subscribers.

pub mod fields;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use fields::{absorb, apply_update, FieldAliases};

pub const CRATE_NAME: &str = "ipor-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("entity name must not be empty")]
    EmptyName,
    #[error("unknown ipo status `{0}`")]
    UnknownStatus(String),
    #[error("field values must not be null")]
    NullValue,
    #[error("cannot merge entity {0} into itself")]
    SelfMerge(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpoStatus {
    Upcoming,
    Open,
    Closed,
    #[default]
    Unknown,
}

impl IpoStatus {
    pub const ALL: [IpoStatus; 4] = [
        IpoStatus::Open,
        IpoStatus::Upcoming,
        IpoStatus::Closed,
        IpoStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IpoStatus::Upcoming => "upcoming",
            IpoStatus::Open => "open",
            IpoStatus::Closed => "closed",
            IpoStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for IpoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpoStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upcoming" => Ok(IpoStatus::Upcoming),
            "open" => Ok(IpoStatus::Open),
            "closed" => Ok(IpoStatus::Closed),
            "unknown" => Ok(IpoStatus::Unknown),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// A reported field value. Never null: absence of a field is modelled by the
/// key being missing from the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub enum FieldValue {
    Text(String),
    Structured(JsonValue),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn gmp_trend(snapshots: Vec<GmpSnapshot>) -> Self {
        let items = snapshots
            .into_iter()
            .map(|s| serde_json::to_value(s).unwrap_or(JsonValue::Null))
            .filter(|v| !v.is_null())
            .collect();
        FieldValue::Structured(JsonValue::Array(items))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            FieldValue::Structured(_) => None,
        }
    }

    /// Decodes a structured value as an ordered GMP history, if it is one.
    pub fn as_gmp_trend(&self) -> Option<Vec<GmpSnapshot>> {
        match self {
            FieldValue::Structured(v @ JsonValue::Array(_)) => {
                serde_json::from_value(v.clone()).ok()
            }
            _ => None,
        }
    }

    /// Scrapers emit these when a cell could not be extracted.
    pub fn is_placeholder(&self) -> bool {
        match self {
            FieldValue::Text(s) => {
                let t = s.trim();
                t.is_empty()
                    || t == "-"
                    || t == "--"
                    || t.eq_ignore_ascii_case("n/a")
                    || t.eq_ignore_ascii_case("na")
            }
            FieldValue::Structured(_) => false,
        }
    }
}

impl TryFrom<JsonValue> for FieldValue {
    type Error = CoreError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        match value {
            JsonValue::Null => Err(CoreError::NullValue),
            JsonValue::String(s) => Ok(FieldValue::Text(s)),
            other => Ok(FieldValue::Structured(other)),
        }
    }
}

impl From<FieldValue> for JsonValue {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Text(s) => JsonValue::String(s),
            FieldValue::Structured(v) => v,
        }
    }
}

/// One row of a grey-market-premium history table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GmpSnapshot {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub gmp: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub estimated_listing_price: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Canonical persisted IPO record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpoEntity {
    pub id: Uuid,
    pub name: String,
    pub status: IpoStatus,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub source_sections: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IpoEntity {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::EmptyName);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            status: IpoStatus::Unknown,
            fields: BTreeMap::new(),
            source_sections: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(FieldValue::as_text)
    }

    pub fn populated_fields(&self) -> usize {
        self.fields.len()
    }
}

/// Handoff contract from a scraper source into the field merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub source_id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<IpoStatus>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub source_sections: BTreeMap<String, String>,
}

impl FieldUpdate {
    pub fn new(source_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            status: None,
            fields: BTreeMap::new(),
            source_sections: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: IpoStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Proposed near-duplicate pair. Transient until an operator acts on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub first_id: Uuid,
    pub first_name: String,
    pub second_id: Uuid,
    pub second_name: String,
    pub score: u8,
}

impl DuplicateCandidate {
    pub fn pair_key(&self) -> (Uuid, Uuid) {
        pair_key(self.first_id, self.second_id)
    }
}

pub fn pair_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: Uuid,
    /// Account-level address.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub preferences: NotificationPreferences,
}

impl Subscriber {
    /// Preference-level address, falling back to the account address.
    pub fn delivery_address(&self) -> Option<&str> {
        self.preferences
            .notification_email
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.email.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default)]
    pub notification_email: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default, flatten)]
    pub topics: Topics,
    #[serde(default, with = "lenient_utc")]
    pub last_notification_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topics {
    #[serde(default = "default_true", rename = "newIPOs")]
    pub new_ipos: bool,
    #[serde(default)]
    pub listing_date: bool,
    #[serde(default)]
    pub closing_soon: bool,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            new_ipos: true,
            listing_date: false,
            closing_soon: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Parses a stored timestamp into UTC. Offsets are honoured; naive values are
/// taken to already be UTC.
pub fn parse_utc_lenient(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Serde adapter for `Option<DateTime<Utc>>` that accepts naive timestamps.
/// Unparseable values deserialize as `None` (never sent).
pub mod lenient_utc {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_some(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(super::parse_utc_lenient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Open".parse::<IpoStatus>().unwrap(), IpoStatus::Open);
        assert_eq!(" upcoming ".parse::<IpoStatus>().unwrap(), IpoStatus::Upcoming);
        assert!("listed".parse::<IpoStatus>().is_err());
    }

    #[test]
    fn entity_rejects_blank_names() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        assert_eq!(IpoEntity::new("   ", now).unwrap_err(), CoreError::EmptyName);
        assert_eq!(IpoEntity::new("Tata Capital", now).unwrap().status, IpoStatus::Unknown);
    }

    #[test]
    fn null_field_values_are_rejected_on_decode() {
        let err = serde_json::from_str::<BTreeMap<String, FieldValue>>(r#"{"gmp": null}"#);
        assert!(err.is_err());

        let ok: BTreeMap<String, FieldValue> =
            serde_json::from_str(r#"{"gmp": "₹50", "gmp_trend": [{"gmp": "₹45"}]}"#).unwrap();
        assert_eq!(ok["gmp"].as_text(), Some("₹50"));
        let trend = ok["gmp_trend"].as_gmp_trend().unwrap();
        assert_eq!(trend[0].gmp.as_deref(), Some("₹45"));
    }

    #[test]
    fn placeholders_are_detected() {
        for raw in ["", " N/A ", "na", "--", "-"] {
            assert!(FieldValue::text(raw).is_placeholder(), "{raw:?}");
        }
        assert!(!FieldValue::text("0").is_placeholder());
    }

    #[test]
    fn delivery_address_prefers_preference_level_email() {
        let mut sub = Subscriber {
            id: Uuid::new_v4(),
            email: Some("account@example.com".into()),
            preferences: NotificationPreferences::default(),
        };
        assert_eq!(sub.delivery_address(), Some("account@example.com"));

        sub.preferences.notification_email = Some("  ".into());
        assert_eq!(sub.delivery_address(), Some("account@example.com"));

        sub.preferences.notification_email = Some("alerts@example.com".into());
        assert_eq!(sub.delivery_address(), Some("alerts@example.com"));
    }

    #[test]
    fn preferences_decode_with_defaults_and_naive_timestamps() {
        let prefs: NotificationPreferences = serde_json::from_str(
            r#"{"emailEnabled": true, "frequency": "2weeks",
                "lastNotificationSentAt": "2026-01-05 09:30:00"}"#,
        )
        .unwrap();
        assert!(prefs.email_enabled);
        assert!(prefs.topics.new_ipos);
        assert!(!prefs.topics.listing_date);
        assert_eq!(
            prefs.last_notification_sent_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap())
        );

        let explicit: NotificationPreferences =
            serde_json::from_str(r#"{"newIPOs": false, "closingSoon": true}"#).unwrap();
        assert!(!explicit.topics.new_ipos);
        assert!(explicit.topics.closing_soon);
        assert_eq!(explicit.last_notification_sent_at, None);
    }

    #[test]
    fn offset_timestamps_are_normalized_to_utc() {
        let ts = parse_utc_lenient("2026-01-05T15:00:00+05:30").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0).unwrap());
        assert_eq!(parse_utc_lenient("yesterday"), None);
    }

    #[test]
    fn pair_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_key(a, b), pair_key(b, a));
    }
}
