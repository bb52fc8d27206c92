//! Neural text reader served by an HTTP sidecar (EasyOCR-style).
//!
//! The sidecar receives a base64 PNG plus the language list and answers with
//! the detected text fragments. Fragments are joined into one reading per
//! variant, the same way a detail-less `readtext` call would return them.

use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::ImageOutputFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{RecognitionEngine, RecognitionResult};
use crate::preprocess::PreprocessedVariant;

#[derive(Serialize)]
struct ReadTextRequest<'a> {
    image: String,
    languages: &'a [String],
    /// Return plain strings, no boxes.
    detail: u8,
}

#[derive(Debug, Deserialize)]
struct ReadTextResponse {
    #[serde(default)]
    results: Vec<ReadTextFragment>,
}

#[derive(Debug, Deserialize)]
struct ReadTextFragment {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct ModelReader {
    url: String,
    languages: Vec<String>,
    client: reqwest::Client,
}

impl ModelReader {
    pub fn new(url: String, languages: Vec<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            languages,
            client,
        }
    }
}

#[async_trait::async_trait]
impl RecognitionEngine for ModelReader {
    fn name(&self) -> &str {
        "model_reader"
    }

    async fn recognize(&self, variant: &PreprocessedVariant) -> Result<Vec<RecognitionResult>> {
        // The model expects three channels.
        let rgb = image::DynamicImage::ImageRgb8(variant.image.to_rgb8());
        let mut png = Cursor::new(Vec::new());
        rgb.write_to(&mut png, ImageOutputFormat::Png)
            .context("Failed to encode variant as PNG")?;

        let body = ReadTextRequest {
            image: BASE64.encode(png.into_inner()),
            languages: &self.languages,
            detail: 0,
        };

        debug!("ModelReader: reading variant '{}'", variant.label);
        let response = self
            .client
            .post(format!("{}/readtext", self.url))
            .json(&body)
            .send()
            .await
            .context("Failed to reach model reader")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Model reader error ({}): {}", status, error_text);
        }

        let parsed: ReadTextResponse = response
            .json()
            .await
            .context("Failed to parse model reader response")?;

        Ok(join_fragments(&variant.label, parsed).into_iter().collect())
    }
}

fn join_fragments(variant: &str, response: ReadTextResponse) -> Option<RecognitionResult> {
    let texts: Vec<&str> = response
        .results
        .iter()
        .map(|f| f.text.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        return None;
    }

    let confidences: Vec<f32> = response.results.iter().filter_map(|f| f.confidence).collect();
    let weight = if confidences.is_empty() {
        None
    } else {
        Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
    };

    let text = texts.join(" ");
    info!("ModelReader ({}) extracted: {}", variant, text);
    Some(RecognitionResult {
        engine: "model_reader".to_string(),
        variant: variant.to_string(),
        config: None,
        text,
        weight,
    })
}
