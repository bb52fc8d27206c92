//! Serial lookup against a resolved ledger: exact first, fuzzy second.

use serde::Serialize;
use strsim::normalized_levenshtein;
use tracing::{debug, info};

use crate::ledger::{Ledger, LedgerRow};

/// Tunables for the fuzzy pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    /// Minimum similarity accepted as a fuzzy match.
    pub fuzzy_threshold: f64,
    /// Similarity granted when one serial fully contains the other.
    pub containment_score: f64,
    /// Candidates and ledger values shorter than this never take part in
    /// fuzzy matching, and a shorter string never earns the containment boost.
    pub min_fuzzy_len: usize,
    /// Containment only counts when the longer string is at least this long.
    pub min_containment_len: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            containment_score: 0.9,
            min_fuzzy_len: 6,
            min_containment_len: 8,
        }
    }
}

/// How a match was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Fuzzy { score: f64 },
}

/// Result of one lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MatchKind>,
    /// Ledger row index of the match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_index: Option<usize>,
    /// Best fuzzy similarity seen, even when it fell below the threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_score: Option<f64>,
}

impl MatchOutcome {
    fn not_found(best_score: Option<f64>) -> Self {
        Self {
            found: false,
            kind: None,
            row_index: None,
            best_score,
        }
    }
}

/// Strip all whitespace and uppercase.
pub fn normalize_serial(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// Similarity in [0, 1] with the containment boost applied.
pub fn similarity(candidate: &str, value: &str, config: &MatchConfig) -> f64 {
    let mut score = normalized_levenshtein(candidate, value);
    let (shorter, longer) = if candidate.len() <= value.len() {
        (candidate, value)
    } else {
        (value, candidate)
    };
    if shorter.chars().count() >= config.min_fuzzy_len
        && longer.chars().count() >= config.min_containment_len
        && longer.contains(shorter)
    {
        score = score.max(config.containment_score);
    }
    score
}

/// Matcher over one ledger snapshot. Ledger serials are normalized once on
/// construction and reused for both passes.
pub struct SerialMatcher<'a> {
    ledger: &'a Ledger,
    normalized: Vec<String>,
    config: MatchConfig,
}

impl<'a> SerialMatcher<'a> {
    pub fn new(ledger: &'a Ledger, config: MatchConfig) -> Self {
        let normalized = ledger.rows.iter().map(|r| normalize_serial(&r.serial)).collect();
        Self {
            ledger,
            normalized,
            config,
        }
    }

    pub fn row(&self, outcome: &MatchOutcome) -> Option<&'a LedgerRow> {
        outcome.row_index.and_then(|i| self.ledger.rows.get(i))
    }

    pub fn lookup(&self, candidate: &str) -> MatchOutcome {
        let candidate = normalize_serial(candidate);
        if candidate.is_empty() {
            return MatchOutcome::not_found(None);
        }

        if let Some(index) = self.normalized.iter().position(|v| *v == candidate) {
            info!("Exact match for {} at ledger row {}", candidate, index);
            return MatchOutcome {
                found: true,
                kind: Some(MatchKind::Exact),
                row_index: Some(index),
                best_score: Some(1.0),
            };
        }

        if candidate.chars().count() < self.config.min_fuzzy_len {
            debug!("No exact match for {} and too short for fuzzy matching", candidate);
            return MatchOutcome::not_found(None);
        }

        let mut best: Option<(usize, f64)> = None;
        for (index, value) in self.normalized.iter().enumerate() {
            if value.chars().count() < self.config.min_fuzzy_len {
                continue;
            }
            let score = similarity(&candidate, value, &self.config);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((index, score));
            }
        }

        match best {
            Some((index, score)) if score >= self.config.fuzzy_threshold => {
                info!(
                    "Fuzzy match for {}: {} (score {:.3})",
                    candidate, self.normalized[index], score
                );
                MatchOutcome {
                    found: true,
                    kind: Some(MatchKind::Fuzzy { score }),
                    row_index: Some(index),
                    best_score: Some(score),
                }
            }
            other => {
                debug!(
                    "No match for {} (best fuzzy score {:?})",
                    candidate,
                    other.map(|(_, s)| s)
                );
                MatchOutcome::not_found(other.map(|(_, s)| s))
            }
        }
    }
}
