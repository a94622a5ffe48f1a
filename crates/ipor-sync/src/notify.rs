//! Notification eligibility: cadence throttling and topic filtering.
//!
//! Everything here is pure. The caller supplies `now` and the content set;
//! the delivery cycle owns the store and transport side effects.

use chrono::{DateTime, Duration, Utc};
use ipor_core::{IpoEntity, NotificationPreferences, Subscriber, Topics};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized notification frequency `{0}`")]
pub struct CadenceParseError(pub String);

/// Minimum spacing between two digests for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence(Duration);

impl Default for Cadence {
    fn default() -> Self {
        Cadence(Duration::days(1))
    }
}

impl Cadence {
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// `<n>day`, `<n>days`, `<n>week`, `<n>weeks`; anything ending in the
    /// singular `month` is 30 days.
    pub fn parse(raw: &str) -> Result<Cadence, CadenceParseError> {
        let value = raw.trim().to_ascii_lowercase();
        let parse_stem = |stem: &str| {
            stem.trim()
                .parse::<u32>()
                .map(i64::from)
                .map_err(|_| CadenceParseError(raw.to_string()))
        };

        if let Some(stem) = strip_any_suffix(&value, &["days", "day"]) {
            return Ok(Cadence(Duration::days(parse_stem(stem)?)));
        }
        if let Some(stem) = strip_any_suffix(&value, &["weeks", "week"]) {
            return Ok(Cadence(Duration::weeks(parse_stem(stem)?)));
        }
        if value.ends_with("month") {
            return Ok(Cadence(Duration::days(30)));
        }
        Err(CadenceParseError(raw.to_string()))
    }

    /// Cadence for a stored preference. Missing values fall back silently;
    /// unparseable ones fall back with a warning.
    pub fn from_preference(raw: Option<&str>) -> Cadence {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Cadence::default(),
            Some(raw) => Cadence::parse(raw).unwrap_or_else(|err| {
                warn!(error = %err, "falling back to daily cadence");
                Cadence::default()
            }),
        }
    }
}

fn strip_any_suffix<'a>(value: &'a str, suffixes: &[&str]) -> Option<&'a str> {
    suffixes.iter().find_map(|suffix| value.strip_suffix(suffix))
}

/// Whether the cadence window since the last send has fully elapsed.
pub fn is_due(preferences: &NotificationPreferences, now: DateTime<Utc>) -> bool {
    next_eligible_at(preferences).map_or(true, |due| now >= due)
}

pub fn next_eligible_at(preferences: &NotificationPreferences) -> Option<DateTime<Utc>> {
    let last = preferences.last_notification_sent_at?;
    let cadence = Cadence::from_preference(preferences.frequency.as_deref());
    Some(
        last.checked_add_signed(cadence.duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    OpenNow,
    Upcoming,
}

impl Section {
    pub fn heading(&self) -> &'static str {
        match self {
            Section::OpenNow => "Open Now",
            Section::Upcoming => "Upcoming & Listing Soon",
        }
    }
}

/// Entities a digest can draw from, fetched once per cycle.
#[derive(Debug, Clone, Default)]
pub struct DigestContent {
    pub open: Vec<IpoEntity>,
    pub upcoming: Vec<IpoEntity>,
}

impl DigestContent {
    pub fn entities(&self, section: Section) -> &[IpoEntity] {
        match section {
            Section::OpenNow => &self.open,
            Section::Upcoming => &self.upcoming,
        }
    }
}

pub fn select_sections(topics: &Topics, content: &DigestContent) -> Vec<Section> {
    let mut sections = Vec::new();
    if topics.new_ipos && !content.open.is_empty() {
        sections.push(Section::OpenNow);
    }
    if (topics.listing_date || topics.closing_soon) && !content.upcoming.is_empty() {
        sections.push(Section::Upcoming);
    }
    sections
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Disabled,
    NoRecipient,
    Throttled { next_eligible_at: DateTime<Utc> },
    NoContent,
    Send { recipient: String, sections: Vec<Section> },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Disabled => "disabled",
            Decision::NoRecipient => "no_recipient",
            Decision::Throttled { .. } => "throttled",
            Decision::NoContent => "no_content",
            Decision::Send { .. } => "send",
        }
    }
}

pub fn evaluate(subscriber: &Subscriber, now: DateTime<Utc>, content: &DigestContent) -> Decision {
    let prefs = &subscriber.preferences;
    if !prefs.email_enabled {
        return Decision::Disabled;
    }
    let Some(recipient) = subscriber.delivery_address() else {
        return Decision::NoRecipient;
    };
    if let Some(due) = next_eligible_at(prefs) {
        if now < due {
            return Decision::Throttled { next_eligible_at: due };
        }
    }
    let sections = select_sections(&prefs.topics, content);
    if sections.is_empty() {
        return Decision::NoContent;
    }
    Decision::Send {
        recipient: recipient.to_string(),
        sections,
    }
}
