//! Salesforce Data Cloud REST API client.
//!
//! A single [`DataCloudClient`] owns the configuration, the HTTP transport and
//! the token state. Every operation takes `&mut self`: a token refresh may
//! replace the state before the request is built, and one session is never
//! driven from two tasks at once.

mod auth;
mod bulk_ingest;
mod client;
mod jobs;
mod query;
mod streaming_ingest;

pub use bulk_ingest::BulkOperation;
pub use client::{sanitize_url_for_logs, ApiResponse, DataCloudClient, LoggingMode};
pub use jobs::{JobInfo, JobList, JobState, ListJobsParams};
pub use query::QueryResult;

use url::Url;

use crate::error::AppError;

/// Byte limit for one streaming ingest request body.
pub const STREAMING_API_MAX_PAYLOAD_SIZE: usize = 200_000;

/// Byte limit for one bulk upload fragment.
pub const BULK_API_MAX_PAYLOAD_SIZE: u64 = 150_000_000;

/// A single row for streaming ingestion. Key order is preserved on the wire.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Parses a base URL, prepending `https://` when no scheme is given.
///
/// The token exchange reports the tenant endpoint as a bare host, while
/// configured URLs usually carry a scheme. Both forms are accepted.
///
/// # Errors
///
/// Returns `AppError::Config` if the value is empty or not a valid base URL.
pub fn normalize_base_url(raw: &str) -> Result<Url, AppError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AppError::Config("Empty base URL".to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| AppError::Config(format!("Invalid base URL '{}': {}", trimmed, e)))?;

    if url.cannot_be_a_base() {
        return Err(AppError::Config(format!("Invalid base URL '{}'", trimmed)));
    }

    Ok(url)
}

/// Appends path segments to `base`, percent-encoding each one.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, AppError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AppError::Internal(format!("Cannot build endpoint from {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// ─────────────────────────────────────────────────────────────────────────────
// Test Support
// ─────────────────────────────────────────────────────────────────────────────
