//! Near-duplicate detection over entity names.
//!
//! Two scrapers spelling the same company differently ("Bharat Coking Coal"
//! vs "Bharat Coking Coal Ltd") produce two entities. The detector proposes
//! such pairs; it never decides which name is canonical.

use std::collections::HashSet;

use ipor_core::{pair_key, DuplicateCandidate};
use rapidfuzz::fuzz;
use uuid::Uuid;

pub const DEFAULT_DUPLICATE_THRESHOLD: u8 = 85;

/// Indel ratio on a 0..=100 scale, `100 * (1 - indel / (len(a) + len(b)))`,
/// rounded half to even. Compares chars as given; callers normalize case.
pub fn similarity_ratio(a: &str, b: &str) -> u8 {
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    let score = fuzz::ratio(a.chars(), b.chars()) * 100.0;
    score.round_ties_even().clamp(0.0, 100.0) as u8
}

/// Lower-cased first alphanumeric token, used as an optional blocking key.
pub fn blocking_key(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .find(|token| !token.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Pairs scoring strictly above this are reported.
    pub threshold: u8,
    /// Only compare names sharing a [`blocking_key`]. Trades recall for speed.
    pub blocking: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DUPLICATE_THRESHOLD,
            blocking: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateDetector {
    config: DetectorConfig,
}

impl DuplicateDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn with_threshold(threshold: u8) -> Self {
        Self::new(DetectorConfig {
            threshold,
            ..DetectorConfig::default()
        })
    }

    pub fn config(&self) -> DetectorConfig {
        self.config
    }

    /// Scans every unordered pair once, in input order. Pairs whose names are
    /// blank or equal after lower-casing are skipped.
    pub fn detect(&self, index: &[(Uuid, String)]) -> Vec<DuplicateCandidate> {
        let normalized = index
            .iter()
            .map(|(id, name)| {
                let lowered = name.trim().to_lowercase();
                let block = self.config.blocking.then(|| blocking_key(&lowered));
                (*id, name.as_str(), lowered, block)
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for (i, (id_a, name_a, lower_a, block_a)) in normalized.iter().enumerate() {
            for (id_b, name_b, lower_b, block_b) in &normalized[i + 1..] {
                if lower_a.is_empty() || lower_b.is_empty() || lower_a == lower_b {
                    continue;
                }
                if id_a == id_b || block_a != block_b {
                    continue;
                }
                let score = similarity_ratio(lower_a, lower_b);
                if score <= self.config.threshold {
                    continue;
                }
                if seen.insert(pair_key(*id_a, *id_b)) {
                    candidates.push(DuplicateCandidate {
                        first_id: *id_a,
                        first_name: name_a.to_string(),
                        second_id: *id_b,
                        second_name: name_b.to_string(),
                        score,
                    });
                }
            }
        }
        candidates
    }
}
