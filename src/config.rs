//! Process configuration, read once from the environment at start-up.
//!
//! Every value has a default except the ledger URL. A malformed value is
//! logged and replaced by its default rather than aborting start-up; a
//! missing ledger URL is only reported when a request actually needs it.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::ledger::fetch::{DEFAULT_FETCH_TIMEOUT, DEFAULT_HEAD_TIMEOUT};
use crate::matcher::MatchConfig;
use crate::ocr::EngineKind;
use crate::preprocess::PreprocessOptions;
use crate::serial::MIN_CANDIDATE_CONFIDENCE;

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Shareable link to the ledger spreadsheet (`EXCEL_URL`).
    pub ledger_url: Option<String>,
    pub bind_addr: String,
    pub port: u16,
    pub fuzzy_threshold: f64,
    pub containment_score: f64,
    pub min_candidate_confidence: u8,
    pub head_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Base URL of the neural OCR sidecar (`OCR_MODEL_URL`).
    pub model_reader_url: Option<String>,
    pub ocr_languages: Vec<String>,
    pub tesseract_lang: String,
    /// Upper bound on recognition calls in flight for one request.
    pub ocr_concurrency: usize,
    /// `ENABLED_ENGINES`: when set, only these engines are used even if more are available.
    pub enabled_engines: Option<Vec<EngineKind>>,
    pub correct_orientation: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            ledger_url: None,
            bind_addr: "0.0.0.0".to_string(),
            port: 5000,
            fuzzy_threshold: 0.85,
            containment_score: 0.9,
            min_candidate_confidence: MIN_CANDIDATE_CONFIDENCE,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            model_reader_url: None,
            ocr_languages: vec!["en".to_string(), "ar".to_string()],
            tesseract_lang: "eng".to_string(),
            ocr_concurrency: 4,
            enabled_engines: None,
            correct_orientation: true,
        }
    }
}

impl VerifierConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let d = Self::default();

        let enabled_engines = get("ENABLED_ENGINES").map(|raw| {
            raw.split(',')
                .filter(|s| !s.trim().is_empty())
                .filter_map(|s| {
                    let kind = EngineKind::from_name(s);
                    if kind.is_none() {
                        warn!("Ignoring unknown engine '{}' in ENABLED_ENGINES", s.trim());
                    }
                    kind
                })
                .collect::<Vec<_>>()
        });

        Self {
            ledger_url: get("EXCEL_URL"),
            bind_addr: get("BIND_ADDR").unwrap_or(d.bind_addr),
            port: parse_or("PORT", get("PORT"), d.port),
            fuzzy_threshold: parse_unit("FUZZY_THRESHOLD", get("FUZZY_THRESHOLD"), d.fuzzy_threshold),
            containment_score: parse_unit(
                "CONTAINMENT_SCORE",
                get("CONTAINMENT_SCORE"),
                d.containment_score,
            ),
            min_candidate_confidence: parse_or::<u8>(
                "MIN_CANDIDATE_CONFIDENCE",
                get("MIN_CANDIDATE_CONFIDENCE"),
                d.min_candidate_confidence,
            )
            .min(100),
            head_timeout: parse_secs("HEAD_TIMEOUT_SECS", get("HEAD_TIMEOUT_SECS"), d.head_timeout),
            fetch_timeout: parse_secs("FETCH_TIMEOUT_SECS", get("FETCH_TIMEOUT_SECS"), d.fetch_timeout),
            model_reader_url: get("OCR_MODEL_URL").map(|u| u.trim_end_matches('/').to_string()),
            ocr_languages: get("OCR_LANGUAGES")
                .map(|raw| {
                    raw.split(',')
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty())
                        .collect()
                })
                .unwrap_or(d.ocr_languages),
            tesseract_lang: get("TESSERACT_LANG").unwrap_or(d.tesseract_lang),
            ocr_concurrency: parse_or("OCR_CONCURRENCY", get("OCR_CONCURRENCY"), d.ocr_concurrency)
                .max(1),
            enabled_engines,
            correct_orientation: parse_or(
                "CORRECT_ORIENTATION",
                get("CORRECT_ORIENTATION"),
                d.correct_orientation,
            ),
        }
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            fuzzy_threshold: self.fuzzy_threshold,
            containment_score: self.containment_score,
            ..MatchConfig::default()
        }
    }

    pub fn preprocess_options(&self) -> PreprocessOptions {
        PreprocessOptions {
            correct_orientation: self.correct_orientation,
            ..PreprocessOptions::default()
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Parse `raw` as `T`; `fallback` when unset or malformed.
fn parse_or<T: FromStr>(key: &str, raw: Option<String>, fallback: T) -> T {
    match raw {
        None => fallback,
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!("Invalid value '{}' for {}, using default", v, key);
            fallback
        }),
    }
}

fn parse_secs(key: &str, raw: Option<String>, fallback: Duration) -> Duration {
    match parse_or::<u64>(key, raw, 0) {
        0 => fallback,
        secs => Duration::from_secs(secs),
    }
}

/// Like [`parse_or`] for thresholds that must lie in [0, 1].
fn parse_unit(key: &str, raw: Option<String>, fallback: f64) -> f64 {
    let value = parse_or(key, raw, fallback);
    if (0.0..=1.0).contains(&value) {
        value
    } else {
        warn!("{} must be between 0 and 1, got {}; using default", key, value);
        fallback
    }
}
