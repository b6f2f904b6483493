use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Decryption failed")]
    Decryption,
    #[error("Ingestion error ({}): {message}", code.as_str())]
    Ingestion { code: ErrorCode, message: String },
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Stable error code carried on the job row. Explicitly coded failures
    /// keep their code; everything else goes through the text classifier.
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Ingestion { code, .. } => *code,
            AppError::NotFound(_) => ErrorCode::FileCorrupted,
            AppError::Database(_) | AppError::Migration(_) => ErrorCode::Internal,
            other => ErrorCode::classify(&other.to_string()),
        }
    }

    pub fn ingestion(code: ErrorCode, message: impl Into<String>) -> Self {
        AppError::Ingestion {
            code,
            message: message.into(),
        }
    }
}

/// Closed set of failure causes surfaced on job rows. The UI maps these to
/// localized sentences; the dispatcher maps them to retry-or-fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ExtractionEmpty,
    ExtractionLowQuality,
    NeedsOcr,
    ParseFailed,
    ProviderRateLimited,
    Timeout,
    UnsupportedFormat,
    FileTooLarge,
    FileCorrupted,
    DocumentDeleted,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ExtractionEmpty => "extraction_empty",
            ErrorCode::ExtractionLowQuality => "extraction_low_quality",
            ErrorCode::NeedsOcr => "needs_ocr",
            ErrorCode::ParseFailed => "parse_failed",
            ErrorCode::ProviderRateLimited => "provider_rate_limited",
            ErrorCode::Timeout => "timeout",
            ErrorCode::UnsupportedFormat => "unsupported_format",
            ErrorCode::FileTooLarge => "file_too_large",
            ErrorCode::FileCorrupted => "file_corrupted",
            ErrorCode::DocumentDeleted => "document_deleted",
            ErrorCode::Internal => "internal",
        }
    }

    /// Translates raw error text into a code by substring match, first
    /// match wins. Total: unknown text falls through to `parse_failed`.
    pub fn classify(raw: &str) -> ErrorCode {
        let lowered = raw.to_lowercase();
        let contains_any = |needles: &[&str]| needles.iter().any(|n| lowered.contains(n));

        if contains_any(&["rate limit", "429", "too many"]) {
            ErrorCode::ProviderRateLimited
        } else if contains_any(&["timeout", "timed out", "aborted"]) {
            ErrorCode::Timeout
        } else if contains_any(&["invalid pdf", "corrupt", "bad xref"]) {
            ErrorCode::FileCorrupted
        } else if contains_any(&["unsupported", "unknown format", "not supported"]) {
            ErrorCode::UnsupportedFormat
        } else if contains_any(&["too large", "size limit", "memory"]) {
            ErrorCode::FileTooLarge
        } else {
            ErrorCode::ParseFailed
        }
    }

    /// Whether a job failing with this code may be retried. Quality and
    /// format failures are terminal; only transient provider conditions
    /// and unknown internals are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ProviderRateLimited | ErrorCode::Timeout | ErrorCode::Internal
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit_variants() {
        assert_eq!(
            ErrorCode::classify("429 Too Many Requests"),
            ErrorCode::ProviderRateLimited
        );
        assert_eq!(
            ErrorCode::classify("provider said: rate limit exceeded"),
            ErrorCode::ProviderRateLimited
        );
    }

    #[test]
    fn classify_timeout_variants() {
        assert_eq!(ErrorCode::classify("request timed out"), ErrorCode::Timeout);
        assert_eq!(
            ErrorCode::classify("operation was aborted"),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn classify_corruption() {
        assert_eq!(
            ErrorCode::classify("Invalid PDF header"),
            ErrorCode::FileCorrupted
        );
        assert_eq!(
            ErrorCode::classify("bad xref table at offset 812"),
            ErrorCode::FileCorrupted
        );
    }

    #[test]
    fn classify_order_prefers_earlier_rules() {
        // "timed out" and "too many" both match; the rate-limit rule runs first.
        assert_eq!(
            ErrorCode::classify("too many requests, retry timed out"),
            ErrorCode::ProviderRateLimited
        );
    }

    #[test]
    fn classify_default_is_parse_failed() {
        assert_eq!(ErrorCode::classify(""), ErrorCode::ParseFailed);
        assert_eq!(
            ErrorCode::classify("something completely unexpected"),
            ErrorCode::ParseFailed
        );
    }

    #[test]
    fn retryable_split() {
        assert!(ErrorCode::ProviderRateLimited.is_retryable());
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::Internal.is_retryable());
        for terminal in [
            ErrorCode::ExtractionEmpty,
            ErrorCode::ExtractionLowQuality,
            ErrorCode::NeedsOcr,
            ErrorCode::UnsupportedFormat,
            ErrorCode::FileTooLarge,
            ErrorCode::FileCorrupted,
            ErrorCode::DocumentDeleted,
        ] {
            assert!(!terminal.is_retryable(), "{terminal} should be terminal");
        }
    }

    #[test]
    fn explicit_codes_survive_wrapping() {
        let err = AppError::ingestion(ErrorCode::NeedsOcr, "5 pages, 12 chars");
        assert_eq!(err.code(), ErrorCode::NeedsOcr);
    }
}
