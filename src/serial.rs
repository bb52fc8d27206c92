//! Serial-number candidate extraction from raw OCR text.
//!
//! Pure functions, no async. Turns one noisy reading into at most one
//! normalized candidate (`[A-Z0-9]+`) and scores it so readings from
//! different engines and variants can be ranked.

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ocr::RecognitionResult;

/// Plausible serial length band.
pub const MIN_SERIAL_LEN: usize = 8;
pub const MAX_SERIAL_LEN: usize = 15;

/// Candidates scoring below this are too weak to look up.
pub const MIN_CANDIDATE_CONFIDENCE: u8 = 30;

/// Shortest whitespace token accepted by the last-resort fallback.
const MIN_FALLBACK_TOKEN_LEN: usize = 6;

/// Shape patterns, most specific first.
const SHAPE_PATTERNS: &[(&str, &str)] = &[
    // 505KRWZ35633
    ("digit_letter_mix", r"[0-9]{3}[A-Z]{2}[0-9A-Z]{5,8}"),
    ("digit_prefixed", r"[0-9]{2,4}[A-Z0-9]{6,12}"),
    ("letter_prefixed", r"[A-Z]{2,3}[0-9A-Z]{5,12}"),
    ("lg_product_line", r"LG[0-9A-Z]{5,12}"),
    ("digit_run", r"[0-9]{8,15}"),
    ("alphanumeric_run", r"[A-Z0-9]{8,15}"),
];

/// Where a candidate came from.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Provenance {
    pub engine: String,
    pub variant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// A normalized serial proposed by extraction.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SerialCandidate {
    pub value: String,
    /// 0-100.
    pub confidence: u8,
    pub provenance: Provenance,
}

struct CompiledPattern {
    id: &'static str,
    regex: Regex,
}

/// Pre-compiled extraction and scoring patterns.
pub struct SerialExtractor {
    label_prefix: Option<Regex>,
    z_misread: Option<Regex>,
    shapes: Vec<CompiledPattern>,
    score_strong: Option<Regex>,
    score_digit_prefixed: Option<Regex>,
    score_generic: Option<Regex>,
}

fn compile(id: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!("Skipping invalid serial pattern '{}' ({}): {}", id, pattern, e);
            None
        }
    }
}

impl Default for SerialExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialExtractor {
    pub fn new() -> Self {
        let shapes = SHAPE_PATTERNS
            .iter()
            .filter_map(|(id, p)| compile(id, p).map(|regex| CompiledPattern { id, regex }))
            .collect::<Vec<_>>();
        debug!("Compiled {} serial shape patterns", shapes.len());

        Self {
            label_prefix: compile(
                "label_prefix",
                r"^\s*(?:SERIAL(?:\s*(?:NO|NUMBER|NUM))?|S\s*/\s*N|S\.\s*N\.?)\s*[:#.\-]?\s*",
            ),
            // 'Z' reads as '2' in this label font: KRW2xxxx -> KRWZxxxx.
            z_misread: compile("z_misread", r"([A-Z]{2,3})2([0-9]{4,})"),
            shapes,
            score_strong: compile("score_strong", r"^[0-9]{3}[A-Z]{2}[0-9A-Z]{5,8}"),
            score_digit_prefixed: compile("score_digit_prefixed", r"^[0-9]{2,4}[A-Z0-9]{6,12}"),
            score_generic: compile("score_generic", r"^[A-Z0-9]{8,15}"),
        }
    }

    /// Extract at most one candidate from one recognition result.
    pub fn extract(&self, result: &RecognitionResult) -> Option<SerialCandidate> {
        let value = self.extract_from_text(&result.text)?;
        let confidence = self.confidence(&value);
        Some(SerialCandidate {
            value,
            confidence,
            provenance: Provenance {
                engine: result.engine.clone(),
                variant: result.variant.clone(),
                config: result.config.clone(),
            },
        })
    }

    /// Extract a normalized serial string from raw text.
    pub fn extract_from_text(&self, text: &str) -> Option<String> {
        let upper = text.trim().to_uppercase();
        if upper.is_empty() {
            return None;
        }

        let unlabeled = match &self.label_prefix {
            Some(re) => re.replace(&upper, "").into_owned(),
            None => upper.clone(),
        };

        let corrected = self.correct(&clean(&unlabeled));
        debug!("Text after corrections: {}", corrected);

        if (MIN_SERIAL_LEN..=MAX_SERIAL_LEN).contains(&corrected.len()) {
            return Some(corrected);
        }

        for pattern in &self.shapes {
            let best = pattern
                .regex
                .find_iter(&corrected)
                .map(|m| m.as_str())
                .fold(None::<&str>, |best, m| match best {
                    Some(b) if b.len() >= m.len() => Some(b),
                    _ => Some(m),
                });
            if let Some(best) = best {
                debug!("Found serial with pattern {}: {}", pattern.id, best);
                return Some(best.to_string());
            }
        }

        // Last resort: the longest sufficiently long whitespace token.
        upper
            .split_whitespace()
            .map(|token| self.correct(&clean(token)))
            .filter(|token| token.len() >= MIN_FALLBACK_TOKEN_LEN)
            .fold(None::<String>, |best, token| match best {
                Some(b) if b.len() >= token.len() => Some(b),
                _ => Some(token),
            })
    }

    /// Narrow character-confusion fixes on an already cleaned string.
    fn correct(&self, cleaned: &str) -> String {
        let mut chars: Vec<char> = cleaned.chars().collect();

        if chars.len() > 1 && chars[0] == 'S' && chars[1].is_ascii_digit() {
            chars[0] = '5';
        }

        // Letters that look like digits, only when wedged between digits.
        for i in 1..chars.len().saturating_sub(1) {
            if chars[i - 1].is_ascii_digit() && chars[i + 1].is_ascii_digit() {
                chars[i] = match chars[i] {
                    'O' => '0',
                    'I' => '1',
                    'B' => '8',
                    'S' => '5',
                    c => c,
                };
            }
        }

        let fixed: String = chars.into_iter().collect();
        match &self.z_misread {
            Some(re) => re.replace_all(&fixed, "${1}Z${2}").into_owned(),
            None => fixed,
        }
    }

    /// Confidence score in 0-100 for a normalized serial.
    pub fn confidence(&self, serial: &str) -> u8 {
        if serial.is_empty() {
            return 0;
        }
        let matches = |re: &Option<Regex>| re.as_ref().map(|r| r.is_match(serial)).unwrap_or(false);

        let mut score: u32 = 0;
        let len = serial.len();
        if (MIN_SERIAL_LEN..=MAX_SERIAL_LEN).contains(&len) {
            score += 30;
        } else if (6..=17).contains(&len) {
            score += 20;
        }

        if matches(&self.score_strong) {
            score += 40;
        } else if matches(&self.score_digit_prefixed) {
            score += 30;
        } else if matches(&self.score_generic) {
            score += 20;
        }

        let has_letters = serial.chars().any(|c| c.is_ascii_uppercase());
        let has_digits = serial.chars().any(|c| c.is_ascii_digit());
        if has_letters && has_digits {
            score += 20;
        }

        if serial.contains("KRW") || serial.starts_with("LG") {
            score += 10;
        }
        if serial.starts_with(['1', '2', '3', '4', '5']) {
            score += 5;
        }

        score.min(100) as u8
    }
}

/// Uppercase ASCII letters and digits only.
pub fn clean(text: &str) -> String {
    text.chars()
        .flat_map(|c| c.to_uppercase())
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

/// Pick the best candidate: highest confidence, earliest on ties.
pub fn select_best(candidates: &[SerialCandidate]) -> Option<&SerialCandidate> {
    candidates.iter().fold(None, |best: Option<&SerialCandidate>, c| match best {
        Some(b) if b.confidence >= c.confidence => Some(b),
        _ => Some(c),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(engine: &str, variant: &str, text: &str) -> RecognitionResult {
        RecognitionResult {
            engine: engine.into(),
            variant: variant.into(),
            config: None,
            text: text.into(),
            weight: None,
        }
    }

    #[test]
    fn test_clean_input_is_untouched() {
        let ex = SerialExtractor::new();
        assert_eq!(ex.extract_from_text("LGQM3WQF9Z").as_deref(), Some("LGQM3WQF9Z"));
    }

    #[test]
    fn test_z_misread_as_two() {
        let ex = SerialExtractor::new();
        assert_eq!(ex.extract_from_text("505KRW235633").as_deref(), Some("505KRWZ35633"));
    }

    #[test]
    fn test_leading_s_and_wedged_letters() {
        let ex = SerialExtractor::new();
        assert_eq!(ex.extract_from_text("s05KRWZ3S633").as_deref(), Some("505KRWZ35633"));
        assert_eq!(ex.extract_from_text("1O2B3I4567").as_deref(), Some("1028314567"));
    }

    #[test]
    fn test_genuine_letters_survive() {
        let ex = SerialExtractor::new();
        // 'O' and 'B' are not between digits here.
        assert_eq!(ex.extract_from_text("BOX12345AB").as_deref(), Some("BOX12345AB"));
    }

    #[test]
    fn test_label_prefix_is_stripped() {
        let ex = SerialExtractor::new();
        assert_eq!(ex.extract_from_text("S/N: 505KRW235633").as_deref(), Some("505KRWZ35633"));
        assert_eq!(ex.extract_from_text("Serial No. LGQM3WQF9Z").as_deref(), Some("LGQM3WQF9Z"));
    }

    #[test]
    fn test_pattern_picks_serial_out_of_noise() {
        let ex = SerialExtractor::new();
        let text = "MADE IN KOREA MODEL 55UN7300 505KRWZ35633 220V";
        let got = ex.extract_from_text(text).unwrap();
        assert!(got.contains("505KRWZ35633"), "got {}", got);
    }

    #[test]
    fn test_short_text_falls_back_or_gives_up() {
        let ex = SerialExtractor::new();
        assert_eq!(ex.extract_from_text("AB 12"), None);
        assert_eq!(ex.extract_from_text(""), None);
        assert_eq!(ex.extract_from_text("  ,,  "), None);
    }

    #[test]
    fn test_confidence_scoring() {
        let ex = SerialExtractor::new();
        // 30 (len) + 40 (strong) + 20 (mixed) + 10 (KRW) + 5 (prefix)
        assert_eq!(ex.confidence("505KRWZ35633"), 100);
        // 30 (len) + 20 (generic) + 20 (mixed) + 10 (LG)
        assert_eq!(ex.confidence("LGQM3WQF9Z"), 80);
        // 20 (len 6) only, letters only
        assert_eq!(ex.confidence("ABCDEF"), 20);
        assert_eq!(ex.confidence(""), 0);
    }

    #[test]
    fn test_candidates_are_alphanumeric_uppercase() {
        let ex = SerialExtractor::new();
        for text in ["ab-12 cd/34 ef56gh", "  x1y2z3w4v5  ", "505 krw 235633"] {
            if let Some(c) = ex.extract_from_text(text) {
                assert!(c.chars().all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit()));
            }
        }
    }

    #[test]
    fn test_select_best_prefers_first_on_ties() {
        let ex = SerialExtractor::new();
        let a = ex.extract(&reading("model_reader", "otsu", "LGQM3WQF9Z")).unwrap();
        let b = ex.extract(&reading("tesseract", "mean", "LGQM3WQF9Y")).unwrap();
        let c = ex.extract(&reading("tesseract", "adaptive", "505KRW235633")).unwrap();

        let tied = vec![a.clone(), b.clone()];
        assert_eq!(select_best(&tied).unwrap().provenance.engine, "model_reader");

        let all = vec![a, b, c];
        assert_eq!(select_best(&all).unwrap().value, "505KRWZ35633");
        assert!(select_best(&[]).is_none());
    }
}
