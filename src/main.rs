//! LG Syria serial verifier - checks a product serial (typed or photographed)
//! against the published ledger of genuine units.

mod config;
mod error;
mod ledger;
mod matcher;
mod ocr;
mod pipeline;
mod preprocess;
mod serial;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::VerifierConfig;
use error::VerifyError;
use pipeline::{VerificationFailure, VerificationVerdict, Verifier};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    verifier: Arc<Verifier>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "lg_serial_verifier=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = VerifierConfig::from_env();
    if config.ledger_url.is_none() {
        warn!("EXCEL_URL not set: every verification request will be rejected");
    }

    let client = reqwest::Client::builder().build()?;
    let engine_set = ocr::probe_engines(&config);
    if engine_set.is_empty() {
        warn!("No recognition engines available: image uploads will always fail extraction");
    }
    let engines = ocr::build_engines(&engine_set, &config, client.clone());
    let addr = config.listen_addr();

    let state = AppState {
        verifier: Arc::new(Verifier::new(config, engines, client)),
    };
    info!("Verifier ready with engines {:?}", state.verifier.engine_names());

    let app = Router::new()
        .route("/health", get(health))
        .route("/check_serial", post(check_serial))
        .route("/upload_image", post(upload_image))
        .route("/upload_barcode", post(upload_image))
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024)) // 20MB photos
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Lang {
    #[default]
    En,
    Ar,
}

#[derive(Debug, Default, Deserialize)]
struct LangQuery {
    #[serde(default)]
    lang: Lang,
}

fn verdict_message(valid: bool, lang: Lang) -> &'static str {
    match (valid, lang) {
        (true, Lang::En) => "This product is from LG Syria",
        (true, Lang::Ar) => "هذا المنتج من إل جي سوريا",
        (false, Lang::En) => "Product not found",
        (false, Lang::Ar) => "المنتج غير موجود",
    }
}

fn failure_message(error: &VerifyError, lang: Lang) -> &'static str {
    match (error, lang) {
        (VerifyError::Configuration, Lang::En) => "Excel URL not configured",
        (VerifyError::Configuration, Lang::Ar) => "لم يتم إعداد رابط ملف Excel",
        (VerifyError::ImageDecode(_), Lang::En) => "The uploaded file is not a readable image",
        (VerifyError::ImageDecode(_), Lang::Ar) => "الملف المرفوع ليس صورة صالحة",
        (_, Lang::En) => "Could not identify serial number. Please enter it manually.",
        (_, Lang::Ar) => "تعذر التعرف على الرقم التسلسلي. يرجى إدخاله يدوياً.",
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Serialize)]
struct VerdictResponse {
    message: &'static str,
    #[serde(flatten)]
    verdict: VerificationVerdict,
}

fn verdict_response(verdict: VerificationVerdict, lang: Lang) -> Response {
    Json(VerdictResponse {
        message: verdict_message(verdict.valid, lang),
        verdict,
    })
    .into_response()
}

fn failure_status(error: &VerifyError) -> StatusCode {
    match error {
        VerifyError::Extraction => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn failure_response(failure: VerificationFailure, lang: Lang) -> Response {
    if failure.error.is_fatal() {
        warn!("Request {} rejected: {}", failure.diagnostics.request_id, failure.error);
    }
    let status = failure_status(&failure.error);
    let body = json!({
        "valid": false,
        "error": failure_message(&failure.error, lang),
        "reason": failure.error.reason(),
        "detail": failure.error.to_string(),
        "diagnostic_trace": failure.diagnostics.trace(),
        "diagnostics": failure.diagnostics,
    });
    (status, Json(body)).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct SerialForm {
    #[serde(default)]
    serial_number: String,
}

/// Check a manually typed serial.
async fn check_serial(
    State(state): State<AppState>,
    Query(query): Query<LangQuery>,
    Form(form): Form<SerialForm>,
) -> Response {
    match state.verifier.verify_by_serial(&form.serial_number).await {
        Ok(verdict) => verdict_response(verdict, query.lang),
        Err(failure) => failure_response(failure, query.lang),
    }
}

/// Upload a label photo and verify the serial read from it.
async fn upload_image(
    State(state): State<AppState>,
    Query(query): Query<LangQuery>,
    mut multipart: Multipart,
) -> Response {
    let mut image = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(format!("Multipart error: {}", e)),
        };
        if matches!(field.name(), Some("image") | Some("barcode")) {
            image = match field.bytes().await {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => return bad_request(format!("Failed to read file: {}", e)),
            };
            break;
        }
    }

    if image.is_empty() {
        return bad_request("No file uploaded".to_string());
    }
    info!("Received image upload ({} bytes)", image.len());

    match state.verifier.verify_by_image(&image).await {
        Ok(verdict) => verdict_response(verdict, query.lang),
        Err(failure) => failure_response(failure, query.lang),
    }
}
