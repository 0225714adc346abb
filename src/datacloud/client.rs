//! Data Cloud HTTP client with secure token handling and safe logging.

use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use url::Url;

use crate::config::Config;
use crate::datacloud::endpoint;
use crate::error::{ApiOperation, AppError};
use crate::state::TokenState;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// User agent string for all Data Cloud API requests.
const CLIENT_USER_AGENT: &str = concat!("datacloud-client/", env!("CARGO_PKG_VERSION"));

/// Query parameter keys (case-insensitive) that should have their values redacted.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "access_token",
    "subject_token",
    "assertion",
    "token",
    "sid",
    "authorization",
];

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how URLs are sanitized for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// Log only the path component. Strips scheme, host, query, and fragment.
    /// Example: `/api/v1/ingest/jobs`
    #[default]
    PathOnly,

    /// Log path and query parameters, but redact sensitive values.
    /// Example: `/api/v1/ingest/jobs?limit=50&states=Open`
    PathAndQueryRedacted,
}

// ─────────────────────────────────────────────────────────────────────────────
// URL Sanitization
// ─────────────────────────────────────────────────────────────────────────────

/// Determines if a query parameter key is sensitive and should be redacted.
fn is_sensitive_param(key: &str) -> bool {
    let key_lower = key.to_ascii_lowercase();
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|&sensitive| key_lower == sensitive)
}

/// Sanitizes a URL for safe logging based on the specified mode.
///
/// # Arguments
///
/// * `url` - The URL to sanitize
/// * `mode` - The logging mode determining what parts to include
///
/// # Returns
///
/// A string safe for logging that never contains the scheme, host, or fragment.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    let path = url.path();

    match mode {
        LoggingMode::PathOnly => path.to_string(),
        LoggingMode::PathAndQueryRedacted => {
            let query_pairs: Vec<_> = url.query_pairs().collect();
            if query_pairs.is_empty() {
                return path.to_string();
            }

            let redacted_pairs: Vec<String> = query_pairs
                .into_iter()
                .map(|(key, value)| {
                    if is_sensitive_param(&key) {
                        format!("{}=***", key)
                    } else {
                        format!("{}={}", key, value)
                    }
                })
                .collect();

            format!("{}?{}", path, redacted_pairs.join("&"))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ApiResponse
// ─────────────────────────────────────────────────────────────────────────────

/// A response whose status matched the one expected for its operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

impl ApiResponse {
    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidResponse` tagged with `operation` if the body
    /// does not deserialize into `T`.
    pub fn json<T: DeserializeOwned>(&self, operation: ApiOperation) -> Result<T, AppError> {
        serde_json::from_str(&self.body).map_err(|e| AppError::InvalidResponse {
            operation,
            message: format!("Failed to parse response body: {}", e),
        })
    }
}

/// Request body variants sent by the operations.
pub(crate) enum Payload {
    None,
    Json(Vec<u8>),
    Csv(reqwest::Body),
}

// ─────────────────────────────────────────────────────────────────────────────
// DataCloudClient
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP client for one Data Cloud session.
///
/// Owns the immutable [`Config`] and the mutable [`TokenState`]. Requests are
/// issued one at a time and are never retried.
pub struct DataCloudClient {
    /// The underlying HTTP client.
    pub(crate) http: reqwest::Client,
    pub(crate) config: Config,
    pub(crate) tokens: TokenState,
    /// Controls URL sanitization for logging.
    logging_mode: LoggingMode,
}

impl std::fmt::Debug for DataCloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCloudClient")
            .field("config", &self.config)
            .field("tokens", &self.tokens)
            .field("logging_mode", &self.logging_mode)
            .finish()
    }
}

impl DataCloudClient {
    /// Creates an unauthenticated client. No network call is made until the
    /// first operation.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated client configuration
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the HTTP client fails to initialize.
    pub fn new(config: Config) -> Result<Self, AppError> {
        let http = build_http_client()?;
        Ok(Self {
            http,
            config,
            tokens: TokenState::default(),
            logging_mode: LoggingMode::default(),
        })
    }

    /// Updates the logging mode for URL sanitization.
    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current token state. Tokens stay wrapped in `SecretString`.
    pub fn token_state(&self) -> &TokenState {
        &self.tokens
    }

    /// Builds a URL under the tenant endpoint from the last token exchange.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotAuthenticated` if no exchange has succeeded.
    pub(crate) fn platform_endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        endpoint(self.tokens.platform_instance_url()?, segments)
    }

    /// Sends a request with the platform bearer token attached.
    ///
    /// # Errors
    ///
    /// - `AppError::NotAuthenticated` - No platform token held
    /// - `AppError::Api` - Status differs from `expected`
    /// - `AppError::ConnectionFailed` - Network error
    pub(crate) async fn send_authed(
        &self,
        operation: ApiOperation,
        method: Method,
        url: Url,
        payload: Payload,
        expected: StatusCode,
    ) -> Result<ApiResponse, AppError> {
        let token = self.tokens.platform_token()?;

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(token.expose_secret());

        request = match payload {
            Payload::None => request,
            Payload::Json(bytes) => request
                .header(CONTENT_TYPE, "application/json")
                .body(bytes),
            Payload::Csv(body) => request.header(CONTENT_TYPE, "text/csv").body(body),
        };

        self.dispatch(operation, &method, &url, request, expected)
            .await
    }

    /// Executes a request with timing, logging, and status checking.
    ///
    /// Never logs the Authorization header, request bodies or raw URLs.
    /// The full URL only travels inside the returned `AppError::Api`.
    pub(crate) async fn dispatch(
        &self,
        operation: ApiOperation,
        method: &Method,
        url: &Url,
        request: RequestBuilder,
        expected: StatusCode,
    ) -> Result<ApiResponse, AppError> {
        let start = Instant::now();
        let sanitized_url = sanitize_url_for_logs(url, self.logging_mode);

        let response = match request.send().await {
            Ok(response) => response,
            Err(_) => {
                // The reqwest error may embed the full URL, so it is not logged
                info!(
                    "[DATACLOUD] {} {} FAILED {}ms",
                    method,
                    sanitized_url,
                    start.elapsed().as_millis()
                );
                return Err(AppError::ConnectionFailed(format!(
                    "Connection to Data Cloud failed during '{}'",
                    operation
                )));
            }
        };

        let status = response.status();
        let x_request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();

        let body = response.text().await.map_err(|_| {
            AppError::ConnectionFailed(format!(
                "Failed to read response body during '{}'",
                operation
            ))
        })?;

        info!(
            "[DATACLOUD] {} {} {} {}ms {}",
            method,
            sanitized_url,
            status.as_u16(),
            start.elapsed().as_millis(),
            x_request_id
        );

        if status != expected {
            let err = AppError::api(operation, url, status, body);
            warn!("[DATACLOUD] {}", err.sanitized());
            return Err(err);
        }

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// Builds the configured HTTP client.
///
/// No request timeout is set; large fragment uploads may take a long time.
fn build_http_client() -> Result<reqwest::Client, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
