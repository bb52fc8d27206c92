//! Failure taxonomy for a single verification run.

use thiserror::Error;

/// Why a verification request could not produce a positive or negative answer
/// from the ledger itself.
#[derive(Debug, Clone, Error)]
pub enum VerifyError {
    #[error("ledger URL not configured (set EXCEL_URL)")]
    Configuration,

    #[error("ledger unavailable: {0}")]
    UnreachableLedger(String),

    #[error("ledger could not be decoded: {}", .0.join("; "))]
    UnparsableLedger(Vec<String>),

    #[error("no serial column found among headers {0:?}")]
    SchemaUnresolved(Vec<String>),

    #[error("no serial number could be extracted from the image")]
    Extraction,

    #[error("uploaded file is not a readable image: {0}")]
    ImageDecode(String),
}

impl VerifyError {
    /// Stable machine-readable code reported alongside not-found verdicts.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration_error",
            Self::UnreachableLedger(_) => "ledger_unavailable",
            Self::UnparsableLedger(_) => "ledger_unparsable",
            Self::SchemaUnresolved(_) => "schema_unresolved",
            Self::Extraction => "extraction_failed",
            Self::ImageDecode(_) => "image_unreadable",
        }
    }

    /// Fatal errors stop the request before any verdict is assembled.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(VerifyError::Configuration.reason(), "configuration_error");
        assert_eq!(
            VerifyError::UnreachableLedger("timeout".into()).reason(),
            "ledger_unavailable"
        );
        assert_eq!(
            VerifyError::SchemaUnresolved(vec!["a".into()]).reason(),
            "schema_unresolved"
        );
    }

    #[test]
    fn test_unparsable_message_joins_attempts() {
        let err = VerifyError::UnparsableLedger(vec!["xls: bad".into(), "xlsx: bad".into()]);
        assert_eq!(err.to_string(), "ledger could not be decoded: xls: bad; xlsx: bad");
    }

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(VerifyError::Configuration.is_fatal());
        assert!(!VerifyError::Extraction.is_fatal());
    }
}
