//! Message assembly: the subscriber digest and the operator summary.

use std::fmt;

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, Utc};
use ipor_core::{DuplicateCandidate, IpoEntity, IpoStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notify::{DigestContent, Section};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub subject: String,
    pub html_body: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sentiment {
    Euphoric,
    Bullish,
    Neutral,
    Bearish,
}

impl Sentiment {
    pub fn from_mean_subscription(mean: f64) -> Self {
        if mean > 50.0 {
            Sentiment::Euphoric
        } else if mean > 10.0 {
            Sentiment::Bullish
        } else if mean > 2.0 {
            Sentiment::Neutral
        } else {
            Sentiment::Bearish
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sentiment::Euphoric => "Euphoric",
            Sentiment::Bullish => "Bullish",
            Sentiment::Neutral => "Neutral",
            Sentiment::Bearish => "Bearish",
        })
    }
}

/// `"12.5x"` -> 12.5, `"1,204.3x (Day 3)"` -> 1204.3.
pub fn parse_subscription_multiple(raw: &str) -> Option<f64> {
    let head = raw.split('x').next()?.replace(',', "");
    head.trim().parse().ok()
}

/// Mean subscription multiple across open IPOs. An IPO with no subscription
/// figure counts as zero; one with an unreadable figure is left out.
pub fn market_sentiment(open: &[IpoEntity]) -> Sentiment {
    let values = open
        .iter()
        .filter_map(|entity| match filled(entity, "subscription") {
            None => Some(0.0),
            Some(raw) => parse_subscription_multiple(raw),
        })
        .collect::<Vec<_>>();
    let mean = if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    };
    Sentiment::from_mean_subscription(mean)
}

/// Keys are canonical: the merge engine resolves aliases on write.
fn filled<'a>(entity: &'a IpoEntity, key: &str) -> Option<&'a str> {
    entity.text(key).filter(|v| !v.trim().is_empty())
}

/// Second half of an `"ipo date"` range such as `"Jan 9, 2026 to Jan 13, 2026"`.
pub fn closing_date(entity: &IpoEntity) -> Option<&str> {
    entity
        .text("ipo date")?
        .split(" to ")
        .nth(1)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn detail_url(base_url: &str, id: Uuid) -> String {
    format!("{base_url}/ipo/{id}")
}

pub fn merge_link(base_url: &str, keep: Uuid, merge: Uuid) -> String {
    format!("{base_url}/api/merge?keep={keep}&merge={merge}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpoCard {
    pub id: Uuid,
    pub name: String,
    pub price: String,
    pub gmp: String,
    pub gmp_positive: bool,
    pub subscription: String,
    pub closes_on: String,
    pub detail_url: String,
}

impl IpoCard {
    pub fn from_entity(entity: &IpoEntity, base_url: &str) -> Self {
        let gmp = filled(entity, "gmp").unwrap_or("N/A").to_string();
        Self {
            id: entity.id,
            name: entity.name.clone(),
            price: filled(entity, "price band")
                .or_else(|| filled(entity, "issue price"))
                .unwrap_or("TBA")
                .to_string(),
            gmp_positive: gmp.contains('₹'),
            gmp,
            subscription: filled(entity, "subscription").unwrap_or("N/A").to_string(),
            closes_on: closing_date(entity).unwrap_or("TBA").to_string(),
            detail_url: detail_url(base_url, entity.id),
        }
    }
}

struct SectionView {
    heading: &'static str,
    color: &'static str,
    cards: Vec<IpoCard>,
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestTemplate<'a> {
    sentiment: String,
    sections: Vec<SectionView>,
    manage_url: &'a str,
}

#[derive(Debug, Clone)]
pub struct DigestBuilder {
    public_base_url: String,
}

impl DigestBuilder {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn subject(now: DateTime<Utc>) -> String {
        format!("IPO Radar: Update ({})", now.format("%d %b"))
    }

    pub fn build(
        &self,
        recipient: &str,
        sections: &[Section],
        content: &DigestContent,
        now: DateTime<Utc>,
    ) -> Result<OutgoingMessage> {
        let views = sections
            .iter()
            .map(|section| SectionView {
                heading: section.heading(),
                color: match section {
                    Section::OpenNow => "#16a34a",
                    Section::Upcoming => "#2563eb",
                },
                cards: content
                    .entities(*section)
                    .iter()
                    .map(|e| IpoCard::from_entity(e, &self.public_base_url))
                    .collect(),
            })
            .collect();
        let html_body = DigestTemplate {
            sentiment: market_sentiment(&content.open).to_string(),
            sections: views,
            manage_url: &self.public_base_url,
        }
        .render()
        .context("rendering digest template")?;
        Ok(OutgoingMessage {
            subject: Self::subject(now),
            html_body,
            recipients: vec![recipient.to_string()],
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub reason: String,
}

struct StatusCountRow {
    label: &'static str,
    count: usize,
}

struct CandidateRow {
    first_name: String,
    second_name: String,
    score: u8,
    keep_first_url: String,
    keep_second_url: String,
}

#[derive(Template)]
#[template(path = "admin_summary.html")]
struct AdminSummaryTemplate<'a> {
    generated_at: String,
    sources_ok: usize,
    sources_total: usize,
    source_failures: &'a [SourceFailure],
    total: usize,
    status_counts: Vec<StatusCountRow>,
    candidates: Vec<CandidateRow>,
}

pub struct AdminSummaryInput<'a> {
    pub recipient: &'a str,
    pub public_base_url: &'a str,
    pub now: DateTime<Utc>,
    pub sources_total: usize,
    pub source_failures: &'a [SourceFailure],
    pub entities: &'a [IpoEntity],
    pub candidates: &'a [DuplicateCandidate],
}

/// Operator report: per-status counts and each duplicate pair with one-click
/// merge links in both directions.
pub fn build_admin_summary(input: AdminSummaryInput<'_>) -> Result<OutgoingMessage> {
    let base = input.public_base_url.trim_end_matches('/');
    let sources_ok = input.sources_total.saturating_sub(input.source_failures.len());
    let status_counts = IpoStatus::ALL
        .iter()
        .map(|status| StatusCountRow {
            label: status_label(*status),
            count: input.entities.iter().filter(|e| e.status == *status).count(),
        })
        .collect();
    let candidates = input
        .candidates
        .iter()
        .map(|c| CandidateRow {
            first_name: c.first_name.clone(),
            second_name: c.second_name.clone(),
            score: c.score,
            keep_first_url: merge_link(base, c.first_id, c.second_id),
            keep_second_url: merge_link(base, c.second_id, c.first_id),
        })
        .collect();

    let html_body = AdminSummaryTemplate {
        generated_at: input.now.format("%d %b %Y, %H:%M UTC").to_string(),
        sources_ok,
        sources_total: input.sources_total,
        source_failures: input.source_failures,
        total: input.entities.len(),
        status_counts,
        candidates,
    }
    .render()
    .context("rendering admin summary template")?;

    Ok(OutgoingMessage {
        subject: format!(
            "IPO Radar Status: {}/{} Success + {} Conflicts",
            sources_ok,
            input.sources_total,
            input.candidates.len()
        ),
        html_body,
        recipients: vec![input.recipient.to_string()],
    })
}

fn status_label(status: IpoStatus) -> &'static str {
    match status {
        IpoStatus::Open => "Open Now",
        IpoStatus::Upcoming => "Upcoming",
        IpoStatus::Closed => "Closed",
        IpoStatus::Unknown => "Unknown",
    }
}
