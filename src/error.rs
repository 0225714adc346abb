use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::datacloud::{sanitize_url_for_logs, LoggingMode};

/// Patterns (lowercase) that indicate sensitive data not safe for log output.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "access_token",
    "subject_token",
    "assertion",
    "private key",
    "authorization:",
];

const SIGNING_FAILED: &str = "Failed to sign JWT";
const BODY_WITHHELD: &str = "[response body withheld]";
const UNEXPECTED_ERROR: &str = "An unexpected error occurred";

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Reduces a URL to its path for log output.
fn sanitize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => sanitize_url_for_logs(&parsed, LoggingMode::PathOnly),
        Err(_) => "[url withheld]".to_string(),
    }
}

/// Sanitizes a message for log output.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ApiOperation
// ─────────────────────────────────────────────────────────────────────────────

/// The REST call an [`AppError::Api`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    /// JWT-bearer grant against the login host.
    GetAccessToken,
    /// Exchange of the core access token for a Data Cloud token.
    TokenExchange,
    StreamingUpsert,
    CreateJob,
    UploadFile,
    CloseJob,
    AbortJob,
    ListJobs,
    JobInfo,
    Query,
}

impl ApiOperation {
    /// Human-readable operation name used in error messages and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiOperation::GetAccessToken => "Get S2S Access Token",
            ApiOperation::TokenExchange => "Data Cloud Token Exchange",
            ApiOperation::StreamingUpsert => "Streaming UPSERT",
            ApiOperation::CreateJob => "Create Job",
            ApiOperation::UploadFile => "Upload File",
            ApiOperation::CloseJob => "Close Job",
            ApiOperation::AbortJob => "Abort Job",
            ApiOperation::ListJobs => "List Jobs",
            ApiOperation::JobInfo => "Job Info",
            ApiOperation::Query => "Query",
        }
    }
}

impl fmt::Display for ApiOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AppError
// ─────────────────────────────────────────────────────────────────────────────

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── API ───────────────────────────────────────────────────────────────────
    /// A REST call returned a status other than the one expected for it.
    /// `body` is the raw response body, unmodified.
    #[error("Data Cloud error during operation '{operation}' on URL '{url}' with status code {status}: {body}")]
    Api {
        operation: ApiOperation,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response for '{operation}': {message}")]
    InvalidResponse {
        operation: ApiOperation,
        message: String,
    },

    // ── Auth ──────────────────────────────────────────────────────────────────
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Failed to sign JWT assertion: {0}")]
    Signing(String),

    // ── Configuration ─────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    // ── File / CSV ────────────────────────────────────────────────────────────
    #[error("File is not valid UTF-8")]
    NotUtf8,

    #[error("CSV chunk error: {0}")]
    CsvChunkError(String),

    #[error("I/O error: {0}")]
    Io(String),

    // ── Network ───────────────────────────────────────────────────────────────
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Builds the structured API error from a non-success response.
    pub(crate) fn api(operation: ApiOperation, url: &Url, status: StatusCode, body: String) -> Self {
        AppError::Api {
            operation,
            url: url.to_string(),
            status: status.as_u16(),
            body,
        }
    }

    /// The operation tag, for errors raised by a REST call.
    pub fn operation(&self) -> Option<ApiOperation> {
        match self {
            AppError::Api { operation, .. } | AppError::InvalidResponse { operation, .. } => {
                Some(*operation)
            }
            _ => None,
        }
    }

    /// The HTTP status code, for [`AppError::Api`].
    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Renders the error for logs. Never leaks tokens, assertions or key
    /// material, and reduces URLs to their path.
    pub fn sanitized(&self) -> String {
        match self {
            AppError::Api {
                operation,
                url,
                status,
                body,
            } => format!(
                "'{}' on '{}' failed with status {}: {}",
                operation,
                sanitize_url(url),
                status,
                sanitize_message(body, BODY_WITHHELD)
            ),
            AppError::Signing(_) => SIGNING_FAILED.to_string(),
            other => sanitize_message(&other.to_string(), UNEXPECTED_ERROR),
        }
    }
}
