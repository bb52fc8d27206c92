//! Remote ledger retrieval.
//!
//! A HEAD request checks the ledger is reachable before the real download;
//! anything other than 200 aborts early instead of feeding an error page to
//! the decoders. No automatic retries: a failed fetch is reported to the
//! caller, who may simply submit again.

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use tracing::{debug, info, warn};

use crate::error::VerifyError;

/// Some hosts reject default client identifiers.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Turn a configured ledger link into the URL actually downloaded.
///
/// A Google Sheets viewing link (`/spreadsheets/d/<id>/edit...`) becomes its
/// xlsx export link, keeping the `gid` tab selector when present. That is the
/// only rewrite; other links only gain `https://` when they lack a scheme.
pub fn resolve_ledger_url(raw: &str) -> Result<String, VerifyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(VerifyError::Configuration);
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| VerifyError::UnreachableLedger(format!("invalid ledger URL '{}': {}", trimmed, e)))?;

    if let Some(export) = google_sheets_export(&url) {
        debug!("Rewrote spreadsheet link to export URL: {}", export);
        return Ok(export);
    }

    Ok(url.to_string())
}

fn google_sheets_export(url: &Url) -> Option<String> {
    if url.host_str()? != "docs.google.com" {
        return None;
    }

    let mut segments = url.path_segments()?;
    if segments.next()? != "spreadsheets" || segments.next()? != "d" {
        return None;
    }
    let doc_id = segments.next().filter(|id| !id.is_empty())?;
    if segments.next() == Some("export") {
        // Already an export link.
        return None;
    }

    let gid = url
        .query_pairs()
        .find(|(k, _)| k == "gid")
        .map(|(_, v)| v.into_owned())
        .or_else(|| {
            url.fragment()?
                .split('&')
                .find_map(|kv| kv.strip_prefix("gid=").map(|v| v.to_string()))
        })
        .filter(|g| !g.is_empty() && g.chars().all(|c| c.is_ascii_digit()));

    let mut export = format!(
        "https://docs.google.com/spreadsheets/d/{}/export?format=xlsx",
        doc_id
    );
    if let Some(gid) = gid {
        export.push_str(&format!("&gid={}", gid));
    }
    Some(export)
}

/// Downloads ledger bytes with an existence check first.
#[derive(Clone)]
pub struct LedgerFetcher {
    client: Client,
    head_timeout: Duration,
    fetch_timeout: Duration,
}

impl LedgerFetcher {
    pub fn new(client: Client, head_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self {
            client,
            head_timeout,
            fetch_timeout,
        }
    }

    /// Fetch the raw ledger bytes for a configured link.
    pub async fn fetch(&self, configured_url: &str) -> Result<Vec<u8>, VerifyError> {
        let url = resolve_ledger_url(configured_url)?;
        info!("Fetching ledger from {}", url);

        let head = self
            .client
            .head(&url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .timeout(self.head_timeout)
            .send()
            .await
            .map_err(|e| unavailable("existence check", &e))?;
        if head.status() != StatusCode::OK {
            warn!("Ledger existence check returned {}", head.status());
            return Err(VerifyError::UnreachableLedger(format!(
                "existence check returned {}",
                head.status()
            )));
        }

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| unavailable("download", &e))?;
        if response.status() != StatusCode::OK {
            warn!("Ledger download returned {}", response.status());
            return Err(VerifyError::UnreachableLedger(format!(
                "download returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| unavailable("download body", &e))?;
        info!("Fetched ledger ({} bytes)", bytes.len());
        Ok(bytes.to_vec())
    }
}

fn unavailable(stage: &str, e: &reqwest::Error) -> VerifyError {
    let detail = if e.is_timeout() {
        format!("{} timed out", stage)
    } else {
        format!("{} failed: {}", stage, e)
    };
    warn!("Ledger {}", detail);
    VerifyError::UnreachableLedger(detail)
}
