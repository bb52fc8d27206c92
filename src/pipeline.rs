//! Per-request verification pipeline.
//!
//! Image entry: decode -> preprocess -> every engine on every variant ->
//! candidate extraction -> best candidate. Both entries then fetch, decode
//! and resolve the ledger once and hand the candidate to the matcher.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::VerifierConfig;
use crate::error::VerifyError;
use crate::ledger::{decode_sheet, ColumnMap, Ledger, LedgerFetcher, SourceType};
use crate::matcher::{normalize_serial, MatchKind, SerialMatcher};
use crate::ocr::{RecognitionEngine, RecognitionResult};
use crate::preprocess::{decode_image, preprocess, PreprocessOptions, PreprocessedVariant};
use crate::serial::{select_best, SerialCandidate, SerialExtractor};

/// Reason code for a ledger that was read fine but does not list the serial.
pub const NO_MATCH: &str = "no_match";

/// Everything observed while producing a verdict. Never the primary message.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub request_id: String,
    pub engines: Vec<String>,
    pub variants: Vec<String>,
    pub raw_texts: Vec<String>,
    pub candidates: Vec<SerialCandidate>,
    pub engine_errors: Vec<String>,
    pub ledger_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_source: Option<SourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<ColumnMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_score: Option<f64>,
    pub notes: Vec<String>,
}

impl Diagnostics {
    fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            engines: Vec::new(),
            variants: Vec::new(),
            raw_texts: Vec::new(),
            candidates: Vec::new(),
            engine_errors: Vec::new(),
            ledger_errors: Vec::new(),
            ledger_source: None,
            ledger_rows: None,
            columns: None,
            best_score: None,
            notes: Vec::new(),
        }
    }

    /// Raw readings followed by notes, as shown to the user on extraction failure.
    pub fn trace(&self) -> Vec<String> {
        self.raw_texts
            .iter()
            .chain(self.engine_errors.iter())
            .chain(self.notes.iter())
            .cloned()
            .collect()
    }
}

/// The answer to one verification request.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationVerdict {
    pub valid: bool,
    /// Normalized serial that was looked up.
    pub serial_number: String,
    /// Ledger serial exactly as stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_description: Option<String>,
    /// Reason code when not valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_kind: Option<MatchKind>,
    pub diagnostics: Diagnostics,
}

impl VerificationVerdict {
    fn not_found(serial_number: String, reason: &str, diagnostics: Diagnostics) -> Self {
        Self {
            valid: false,
            serial_number,
            matched_serial: None,
            product_name: None,
            product_description: None,
            reason: Some(reason.to_string()),
            match_kind: None,
            diagnostics,
        }
    }
}

/// A request that ended without a verdict.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct VerificationFailure {
    pub error: VerifyError,
    pub diagnostics: Diagnostics,
}

impl VerificationFailure {
    fn new(error: VerifyError, diagnostics: Diagnostics) -> Self {
        Self { error, diagnostics }
    }
}

pub struct Verifier {
    config: VerifierConfig,
    fetcher: LedgerFetcher,
    engines: Vec<Arc<dyn RecognitionEngine>>,
    extractor: SerialExtractor,
    preprocess: PreprocessOptions,
}

impl Verifier {
    pub fn new(
        config: VerifierConfig,
        engines: Vec<Arc<dyn RecognitionEngine>>,
        client: reqwest::Client,
    ) -> Self {
        let fetcher = LedgerFetcher::new(client, config.head_timeout, config.fetch_timeout);
        let preprocess = config.preprocess_options();
        Self {
            config,
            fetcher,
            engines,
            extractor: SerialExtractor::new(),
            preprocess,
        }
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    fn ledger_url(&self) -> Result<&str, VerifyError> {
        self.config.ledger_url.as_deref().ok_or(VerifyError::Configuration)
    }

    /// Verify a manually typed serial.
    pub async fn verify_by_serial(&self, serial: &str) -> Result<VerificationVerdict, VerificationFailure> {
        let diagnostics = Diagnostics::new();
        let url = self
            .ledger_url()
            .map_err(|e| VerificationFailure::new(e, diagnostics.clone()))?;

        let candidate = normalize_serial(serial);
        info!("[{}] Manual check for '{}'", diagnostics.request_id, candidate);
        if candidate.is_empty() {
            return Ok(VerificationVerdict::not_found(candidate, NO_MATCH, diagnostics));
        }

        Ok(self.lookup(url, candidate, diagnostics).await)
    }

    /// Verify the serial printed on a label photo.
    pub async fn verify_by_image(&self, image_bytes: &[u8]) -> Result<VerificationVerdict, VerificationFailure> {
        let mut diagnostics = Diagnostics::new();
        let url = self
            .ledger_url()
            .map_err(|e| VerificationFailure::new(e, diagnostics.clone()))?;
        diagnostics.engines = self.engine_names();

        let bytes = image_bytes.to_vec();
        let opts = self.preprocess.clone();
        let variants = tokio::task::spawn_blocking(move || -> Result<_, VerifyError> {
            let image = decode_image(&bytes)?;
            Ok(preprocess(&bytes, image, &opts))
        })
        .await
        .map_err(|e| VerifyError::ImageDecode(format!("image processing aborted: {}", e)))
        .and_then(|r| r)
        .map_err(|e| {
            warn!("[{}] {}", diagnostics.request_id, e);
            VerificationFailure::new(e, diagnostics.clone())
        })?;
        diagnostics.variants = variants.iter().map(|v| v.label.clone()).collect();

        let results = self.recognize_all(variants, &mut diagnostics).await;
        let mut candidates = Vec::new();
        for result in &results {
            debug!("[{}] {}", diagnostics.request_id, result.trace_line());
            diagnostics.raw_texts.push(result.trace_line());
            if let Some(candidate) = self.extractor.extract(result) {
                candidates.push(candidate);
            }
        }

        let min_confidence = self.config.min_candidate_confidence;
        let plausible: Vec<SerialCandidate> = candidates
            .iter()
            .filter(|c| c.confidence >= min_confidence)
            .cloned()
            .collect();
        let best = select_best(&plausible).cloned();
        diagnostics.candidates = candidates;

        let best = match best {
            Some(b) => b,
            None => {
                if diagnostics.raw_texts.is_empty() {
                    diagnostics.notes.push(format!(
                        "No text detected in {} variants by engines {:?}",
                        diagnostics.variants.len(),
                        diagnostics.engines
                    ));
                } else {
                    diagnostics.notes.push(format!(
                        "No candidate reached confidence {} ({} readings, {} candidates)",
                        min_confidence,
                        diagnostics.raw_texts.len(),
                        diagnostics.candidates.len()
                    ));
                }
                warn!("[{}] Serial extraction failed", diagnostics.request_id);
                return Err(VerificationFailure::new(VerifyError::Extraction, diagnostics));
            }
        };

        info!(
            "[{}] Selected candidate {} (confidence {}, from {} on {})",
            diagnostics.request_id,
            best.value,
            best.confidence,
            best.provenance.engine,
            best.provenance.variant
        );
        Ok(self.lookup(url, best.value, diagnostics).await)
    }

    /// Run every engine on every variant and return results in canonical
    /// order: engine first, then variant, then the engine's own order.
    async fn recognize_all(
        &self,
        variants: Vec<PreprocessedVariant>,
        diagnostics: &mut Diagnostics,
    ) -> Vec<RecognitionResult> {
        if self.engines.is_empty() {
            warn!("[{}] No recognition engines enabled", diagnostics.request_id);
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.config.ocr_concurrency.max(1)));
        let variants: Vec<Arc<PreprocessedVariant>> = variants.into_iter().map(Arc::new).collect();
        let mut tasks = JoinSet::new();

        for (engine_idx, engine) in self.engines.iter().enumerate() {
            for (variant_idx, variant) in variants.iter().enumerate() {
                let engine = Arc::clone(engine);
                let variant = Arc::clone(variant);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let outcome = engine.recognize(&variant).await;
                    (engine_idx, variant_idx, engine.name().to_string(), variant.label.clone(), outcome)
                });
            }
        }

        let mut collected = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((engine_idx, variant_idx, engine, variant, Ok(results))) => {
                    collected.push((engine_idx, variant_idx, results));
                    debug!("{} finished {}", engine, variant);
                }
                Ok((engine_idx, variant_idx, engine, variant, Err(e))) => {
                    warn!("{} failed on {}: {:#}", engine, variant, e);
                    diagnostics
                        .engine_errors
                        .push(format!("{} ({}): {:#}", engine, variant, e));
                    collected.push((engine_idx, variant_idx, Vec::new()));
                }
                Err(e) => {
                    error!("Recognition task aborted: {}", e);
                    diagnostics.engine_errors.push(format!("recognition task aborted: {}", e));
                }
            }
        }

        collected.sort_by_key(|(engine_idx, variant_idx, _)| (*engine_idx, *variant_idx));
        collected
            .into_iter()
            .flat_map(|(_, _, results)| results)
            .filter(|r| !r.text.trim().is_empty())
            .collect()
    }

    /// Fetch, decode and resolve the ledger for this request.
    async fn load_ledger(&self, url: &str, diagnostics: &mut Diagnostics) -> Result<Ledger, VerifyError> {
        let bytes = self.fetcher.fetch(url).await?;
        let sheet = decode_sheet(&bytes)?;
        diagnostics.ledger_source = Some(sheet.source_type);
        let ledger = Ledger::from_sheet(sheet)?;
        diagnostics.columns = Some(ledger.columns.clone());
        diagnostics.ledger_rows = Some(ledger.len());
        info!(
            "[{}] Ledger '{}' loaded with {} rows",
            diagnostics.request_id,
            ledger.sheet_name,
            ledger.len()
        );
        Ok(ledger)
    }

    async fn lookup(&self, url: &str, candidate: String, mut diagnostics: Diagnostics) -> VerificationVerdict {
        let ledger = match self.load_ledger(url, &mut diagnostics).await {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!("[{}] Ledger stage failed: {}", diagnostics.request_id, e);
                match &e {
                    VerifyError::UnparsableLedger(errors) => diagnostics.ledger_errors.extend(errors.iter().cloned()),
                    other => diagnostics.ledger_errors.push(other.to_string()),
                }
                return VerificationVerdict::not_found(candidate, e.reason(), diagnostics);
            }
        };

        let matcher = SerialMatcher::new(&ledger, self.config.match_config());
        let outcome = matcher.lookup(&candidate);
        diagnostics.best_score = outcome.best_score;

        match matcher.row(&outcome) {
            Some(row) if outcome.found => VerificationVerdict {
                valid: true,
                serial_number: candidate,
                matched_serial: Some(row.serial.clone()),
                product_name: row.name.clone(),
                product_description: row.description.clone(),
                reason: None,
                match_kind: outcome.kind,
                diagnostics,
            },
            _ => {
                info!("[{}] {} not found in ledger", diagnostics.request_id, candidate);
                VerificationVerdict::not_found(candidate, NO_MATCH, diagnostics)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    use axum::{routing::get, Router};
    use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma};

    /// Returns the same text for every variant.
    struct StubEngine {
        name: &'static str,
        text: &'static str,
    }

    #[async_trait::async_trait]
    impl RecognitionEngine for StubEngine {
        fn name(&self) -> &str {
            self.name
        }

        async fn recognize(&self, variant: &PreprocessedVariant) -> anyhow::Result<Vec<RecognitionResult>> {
            Ok(vec![RecognitionResult {
                engine: self.name.to_string(),
                variant: variant.label.clone(),
                config: None,
                text: self.text.to_string(),
                weight: None,
            }])
        }
    }

    struct BrokenEngine;

    #[async_trait::async_trait]
    impl RecognitionEngine for BrokenEngine {
        fn name(&self) -> &str {
            "broken"
        }

        async fn recognize(&self, _variant: &PreprocessedVariant) -> anyhow::Result<Vec<RecognitionResult>> {
            anyhow::bail!("sidecar unreachable")
        }
    }

    fn stub(name: &'static str, text: &'static str) -> Arc<dyn RecognitionEngine> {
        Arc::new(StubEngine { name, text })
    }

    async fn serve_ledger(body: &'static [u8]) -> String {
        let app = Router::new().route("/ledger", get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/ledger", addr)
    }

    async fn dead_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/ledger", addr)
    }

    fn verifier(url: Option<String>, engines: Vec<Arc<dyn RecognitionEngine>>) -> Verifier {
        let config = VerifierConfig {
            ledger_url: url,
            head_timeout: Duration::from_millis(300),
            fetch_timeout: Duration::from_secs(2),
            ..VerifierConfig::default()
        };
        Verifier::new(config, engines, reqwest::Client::new())
    }

    fn label_photo() -> Vec<u8> {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(320, 320, Luma([255])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
        buf.into_inner()
    }

    const LEDGER: &[u8] = b"SerialNumber,Name,Description\nLGQM3WQF9Z,TV,55-inch\n505KRWZ35633,Fridge,\n";

    #[tokio::test]
    async fn test_manual_exact_match() {
        let url = serve_ledger(LEDGER).await;
        let verdict = verifier(Some(url), vec![]).verify_by_serial("LGQM3WQF9Z").await.unwrap();
        assert!(verdict.valid);
        assert_eq!(verdict.product_name.as_deref(), Some("TV"));
        assert_eq!(verdict.product_description.as_deref(), Some("55-inch"));
        assert_eq!(verdict.match_kind, Some(MatchKind::Exact));
        assert_eq!(verdict.diagnostics.ledger_source, Some(SourceType::Csv));
        assert!(verdict.diagnostics.columns.is_some());
    }

    #[tokio::test]
    async fn test_manual_entry_is_normalized() {
        let url = serve_ledger(LEDGER).await;
        let verdict = verifier(Some(url), vec![]).verify_by_serial(" lgqm3 wqf9z ").await.unwrap();
        assert!(verdict.valid);
        assert_eq!(verdict.serial_number, "LGQM3WQF9Z");
    }

    #[tokio::test]
    async fn test_image_with_z_misread_matches_exactly() {
        let url = serve_ledger(LEDGER).await;
        let v = verifier(Some(url), vec![stub("model_reader", "MODEL GR-B22 S/N 505KRW235633")]);
        let verdict = v.verify_by_image(&label_photo()).await.unwrap();
        assert!(verdict.valid, "{:?}", verdict.diagnostics);
        assert_eq!(verdict.serial_number, "505KRWZ35633");
        assert_eq!(verdict.matched_serial.as_deref(), Some("505KRWZ35633"));
        assert_eq!(verdict.product_name.as_deref(), Some("Fridge"));
        assert_eq!(verdict.product_description, None);
        assert!(!verdict.diagnostics.raw_texts.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_ledger_is_not_found() {
        let app = Router::new().route(
            "/ledger",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let verdict = verifier(Some(format!("http://{}/ledger", addr)), vec![])
            .verify_by_serial("LGQM3WQF9Z")
            .await
            .unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason.as_deref(), Some("ledger_unavailable"));
        assert_eq!(verdict.diagnostics.ledger_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_garbage_ledger_is_not_found() {
        let url = serve_ledger(&[0x00, 0x9F, 0x92, 0x96, 0xFF, 0x00]).await;
        let verdict = verifier(Some(url), vec![]).verify_by_serial("LGQM3WQF9Z").await.unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason.as_deref(), Some("ledger_unparsable"));
        assert_eq!(verdict.diagnostics.ledger_errors.len(), 3);
    }

    #[tokio::test]
    async fn test_unresolved_schema_is_not_found() {
        let url = serve_ledger(b"Model,Price\n55UN,100\n").await;
        let verdict = verifier(Some(url), vec![]).verify_by_serial("55UN").await.unwrap();
        assert_eq!(verdict.reason.as_deref(), Some("schema_unresolved"));
    }

    #[tokio::test]
    async fn test_blank_image_is_extraction_failure() {
        let v = verifier(Some(dead_url().await), vec![stub("model_reader", "   ")]);
        let failure = v.verify_by_image(&label_photo()).await.unwrap_err();
        assert!(matches!(failure.error, VerifyError::Extraction));
        assert!(!failure.diagnostics.trace().is_empty());
        assert_eq!(failure.diagnostics.variants.first().map(String::as_str), Some("original"));
        // Never reached the ledger.
        assert!(failure.diagnostics.ledger_errors.is_empty());
    }

    #[tokio::test]
    async fn test_weak_candidates_are_extraction_failure() {
        // "ABCDEFG" extracts but scores below the plausibility bar.
        let v = verifier(Some(dead_url().await), vec![stub("tesseract", "ABCDEFG")]);
        let failure = v.verify_by_image(&label_photo()).await.unwrap_err();
        assert!(matches!(failure.error, VerifyError::Extraction));
        assert!(!failure.diagnostics.candidates.is_empty());
        assert!(failure.diagnostics.notes[0].contains("confidence 30"));
    }

    #[tokio::test]
    async fn test_arabic_serial_column() {
        let url = serve_ledger("الاسم,الرقم التسلسلي\nثلاجة,505KRWZ35633\n".as_bytes()).await;
        let verdict = verifier(Some(url), vec![]).verify_by_serial("505KRWZ35633").await.unwrap();
        assert!(verdict.valid);
        assert_eq!(verdict.product_name.as_deref(), Some("ثلاجة"));
    }

    #[tokio::test]
    async fn test_missing_config_runs_no_stage() {
        let v = verifier(None, vec![stub("model_reader", "LGQM3WQF9Z")]);
        let failure = v.verify_by_serial("LGQM3WQF9Z").await.unwrap_err();
        assert!(matches!(failure.error, VerifyError::Configuration));

        let failure = v.verify_by_image(&label_photo()).await.unwrap_err();
        assert!(matches!(failure.error, VerifyError::Configuration));
        assert!(failure.diagnostics.variants.is_empty());
    }

    #[tokio::test]
    async fn test_empty_manual_serial_skips_fetch() {
        let verdict = verifier(Some(dead_url().await), vec![]).verify_by_serial("  ").await.unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason.as_deref(), Some(NO_MATCH));
        assert!(verdict.diagnostics.ledger_errors.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_upload() {
        let v = verifier(Some(dead_url().await), vec![]);
        let failure = v.verify_by_image(b"not an image").await.unwrap_err();
        assert_eq!(failure.error.reason(), "image_unreadable");
    }

    #[tokio::test]
    async fn test_engine_failure_does_not_abort() {
        let url = serve_ledger(LEDGER).await;
        let v = verifier(Some(url), vec![Arc::new(BrokenEngine), stub("tesseract", "LGQM3WQF9Z")]);
        let verdict = v.verify_by_image(&label_photo()).await.unwrap();
        assert!(verdict.valid);
        assert_eq!(
            verdict.diagnostics.engine_errors.len(),
            verdict.diagnostics.variants.len()
        );
    }

    #[tokio::test]
    async fn test_confidence_ties_go_to_first_engine() {
        let url = serve_ledger(b"Serial,Name\nABCDEFGH12,first\nZYXWVUT987,second\n").await;
        let v = verifier(
            Some(url),
            vec![stub("model_reader", "ABCDEFGH12"), stub("tesseract", "ZYXWVUT987")],
        );
        let verdict = v.verify_by_image(&label_photo()).await.unwrap();
        assert_eq!(verdict.product_name.as_deref(), Some("first"));
        // Raw texts are in engine-major order.
        assert!(verdict.diagnostics.raw_texts[0].starts_with("model_reader (original)"));
    }

    #[tokio::test]
    async fn test_no_match_reason() {
        let url = serve_ledger(LEDGER).await;
        let verdict = verifier(Some(url), vec![]).verify_by_serial("QQQQQQQQQQ").await.unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason.as_deref(), Some(NO_MATCH));
        assert!(verdict.diagnostics.best_score.is_some());
    }
}
