//! Barcode reader. Product labels usually print the serial as a barcode too,
//! and a decoded payload is far more reliable than any OCR reading.

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::{RecognitionEngine, RecognitionResult};
use crate::preprocess::PreprocessedVariant;

pub struct BarcodeEngine;

#[async_trait::async_trait]
impl RecognitionEngine for BarcodeEngine {
    fn name(&self) -> &str {
        "barcode"
    }

    async fn recognize(&self, variant: &PreprocessedVariant) -> Result<Vec<RecognitionResult>> {
        let gray = variant.image.to_luma8();
        let label = variant.label.clone();

        tokio::task::spawn_blocking(move || {
            let (w, h) = gray.dimensions();
            decode_luma(gray.into_raw(), w, h, &label)
        })
        .await
        .context("Barcode task panicked")
    }
}

fn decode_luma(luma: Vec<u8>, width: u32, height: u32, label: &str) -> Vec<RecognitionResult> {
    match rxing::helpers::detect_in_luma(luma, width, height, None) {
        Ok(found) => {
            let text = found.getText().trim().to_string();
            if text.is_empty() {
                return Vec::new();
            }
            info!("Barcode ({}) decoded: {}", label, text);
            vec![RecognitionResult {
                engine: "barcode".to_string(),
                variant: label.to_string(),
                config: Some(format!("{:?}", found.getBarcodeFormat())),
                text,
                weight: Some(1.0),
            }]
        }
        Err(e) => {
            debug!("Barcode ({}) not found: {}", label, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma};

    #[tokio::test]
    async fn test_blank_image_has_no_barcode() {
        let variant = PreprocessedVariant {
            label: "original".into(),
            image: DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 64, Luma([255]))),
        };
        let results = BarcodeEngine.recognize(&variant).await.unwrap();
        assert!(results.is_empty());
    }
}
