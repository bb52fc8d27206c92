//! Pluggable text recognition engines.
//!
//! Defines the [`RecognitionEngine`] trait so different readers (a neural model
//! sidecar, Tesseract, a barcode decoder) can be enabled or disabled per
//! deployment. Which engines exist is decided once at start-up by
//! [`probe_engines`] and injected into the pipeline as an [`EngineSet`].

pub mod barcode;
pub mod model_reader;
pub mod tesseract;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::VerifierConfig;
use crate::preprocess::PreprocessedVariant;

/// One raw reading of one variant by one engine configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionResult {
    pub engine: String,
    pub variant: String,
    /// Engine-specific configuration (e.g. `psm7`), when the engine runs several.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    pub text: String,
    /// Engine-reported confidence in [0, 1], if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
}

impl RecognitionResult {
    /// Trace line used in diagnostics, e.g. `tesseract (otsu/psm7): 505KRWZ35633`.
    pub fn trace_line(&self) -> String {
        match &self.config {
            Some(cfg) => format!("{} ({}/{}): {}", self.engine, self.variant, cfg, self.text),
            None => format!("{} ({}): {}", self.engine, self.variant, self.text),
        }
    }
}

/// Async trait implemented by each recognition backend.
///
/// An engine returns every non-empty text it produced for the variant. Per
/// configuration failures are swallowed inside the engine; an `Err` means the
/// whole engine was unusable for this variant and the caller just moves on.
#[async_trait::async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &str;
    async fn recognize(&self, variant: &PreprocessedVariant) -> anyhow::Result<Vec<RecognitionResult>>;
}

/// Known engine identifiers, in canonical try order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    ModelReader,
    Tesseract,
    Barcode,
}

impl EngineKind {
    /// Parse a config string into an engine kind.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "model" | "model_reader" | "easyocr" => Some(Self::ModelReader),
            "tesseract" => Some(Self::Tesseract),
            "barcode" => Some(Self::Barcode),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelReader => "model_reader",
            Self::Tesseract => "tesseract",
            Self::Barcode => "barcode",
        }
    }
}

/// The engines enabled for this process, in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSet {
    kinds: Vec<EngineKind>,
}

impl EngineSet {
    pub fn new(kinds: impl IntoIterator<Item = EngineKind>) -> Self {
        let mut set = Self::default();
        for kind in kinds {
            set.enable(kind);
        }
        set
    }

    fn enable(&mut self, kind: EngineKind) {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
            self.kinds.sort_by_key(|k| *k as u8);
        }
    }

    pub fn kinds(&self) -> &[EngineKind] {
        &self.kinds
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Probe which engines are usable on this host. Runs once at start-up.
///
/// `ENABLED_ENGINES` (comma separated) restricts the probed set further.
pub fn probe_engines(config: &VerifierConfig) -> EngineSet {
    let mut probed = Vec::new();

    if config.model_reader_url.is_some() {
        probed.push(EngineKind::ModelReader);
        info!("Model reader enabled at {:?}", config.model_reader_url);
    } else {
        info!("OCR_MODEL_URL not set, model reader disabled");
    }

    match tesseract::probe_version() {
        Ok(version) => {
            probed.push(EngineKind::Tesseract);
            info!("Tesseract OCR available as backup (version {})", version);
        }
        Err(e) => warn!("Tesseract OCR not available: {}", e),
    }

    probed.push(EngineKind::Barcode);

    let set = restrict(EngineSet::new(probed), config.enabled_engines.as_deref());
    info!(
        "Recognition engines: {:?}",
        set.kinds().iter().map(|k| k.as_str()).collect::<Vec<_>>()
    );
    set
}

/// Keep only the engines named in `ENABLED_ENGINES`, when it is set.
fn restrict(set: EngineSet, allowed: Option<&[EngineKind]>) -> EngineSet {
    match allowed {
        Some(allowed) => EngineSet::new(set.kinds.into_iter().filter(|k| allowed.contains(k))),
        None => set,
    }
}

/// Instantiate the engines in `set`.
pub fn build_engines(
    set: &EngineSet,
    config: &VerifierConfig,
    client: reqwest::Client,
) -> Vec<Arc<dyn RecognitionEngine>> {
    let mut engines: Vec<Arc<dyn RecognitionEngine>> = Vec::new();
    for kind in set.kinds() {
        match kind {
            EngineKind::ModelReader => match &config.model_reader_url {
                Some(url) => engines.push(Arc::new(model_reader::ModelReader::new(
                    url.clone(),
                    config.ocr_languages.clone(),
                    client.clone(),
                ))),
                None => warn!("Model reader requested but OCR_MODEL_URL is not set"),
            },
            EngineKind::Tesseract => engines.push(Arc::new(tesseract::TesseractEngine::new(
                config.tesseract_lang.clone(),
            ))),
            EngineKind::Barcode => engines.push(Arc::new(barcode::BarcodeEngine)),
        }
    }
    engines
}
