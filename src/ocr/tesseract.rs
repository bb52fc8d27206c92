//! Tesseract backup engine, run with several page-segmentation modes.
//!
//! Each PSM gets its own attempt. A mode that errors or reads nothing is
//! skipped; every mode that reads something contributes a result.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use rusty_tesseract::{Args, Image};
use tracing::{debug, info};

use super::{RecognitionEngine, RecognitionResult};
use crate::preprocess::PreprocessedVariant;

/// Page segmentation modes tried per variant, in order:
/// uniform block, single line, single word, single character, raw line.
pub const PSM_MODES: &[i32] = &[6, 7, 8, 10, 13];

/// LSTM + legacy default engine mode.
const OEM: i32 = 3;

/// Check the tesseract binary is installed and callable.
pub fn probe_version() -> Result<String> {
    rusty_tesseract::get_tesseract_version().map_err(|e| anyhow!("{}", e))
}

pub struct TesseractEngine {
    lang: String,
}

impl TesseractEngine {
    pub fn new(lang: String) -> Self {
        Self { lang }
    }
}

#[async_trait::async_trait]
impl RecognitionEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, variant: &PreprocessedVariant) -> Result<Vec<RecognitionResult>> {
        let image = variant.image.clone();
        let label = variant.label.clone();
        let lang = self.lang.clone();

        // rusty-tesseract shells out and blocks.
        tokio::task::spawn_blocking(move || run_all_modes(&image, &label, &lang))
            .await
            .context("Tesseract task panicked")?
    }
}

fn run_all_modes(image: &image::DynamicImage, label: &str, lang: &str) -> Result<Vec<RecognitionResult>> {
    let tess_img = Image::from_dynamic_image(image)
        .map_err(|e| anyhow!("Failed to hand image to tesseract: {}", e))?;

    let mut results = Vec::new();
    for &psm in PSM_MODES {
        let args = Args {
            lang: lang.to_string(),
            config_variables: HashMap::new(),
            dpi: Some(300),
            psm: Some(psm),
            oem: Some(OEM),
        };
        match rusty_tesseract::image_to_string(&tess_img, &args) {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    debug!("Tesseract ({}/psm{}) read nothing", label, psm);
                    continue;
                }
                info!("Tesseract ({}/psm{}) extracted: {}", label, psm, text);
                results.push(RecognitionResult {
                    engine: "tesseract".to_string(),
                    variant: label.to_string(),
                    config: Some(format!("psm{}", psm)),
                    text: text.to_string(),
                    weight: None,
                });
            }
            Err(e) => debug!("Tesseract ({}/psm{}) failed: {}", label, psm, e),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psm_modes_cover_block_line_word_char() {
        for psm in [6, 7, 8, 10] {
            assert!(PSM_MODES.contains(&psm));
        }
    }
}
