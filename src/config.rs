//! Client configuration.
//!
//! Values are layered with `figment`: an optional YAML file first, then
//! `DATACLOUD_*` environment variables, so the environment always wins.
//!
//! ```yaml
//! client_id: 3MVG9...
//! private_key_file: server.key
//! username: integration@example.com
//! login_url: login.salesforce.com
//! temp_dir: tempfiles
//! input_file_encoding: utf-8
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use jsonwebtoken::EncodingKey;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::datacloud::{normalize_base_url, BULK_API_MAX_PAYLOAD_SIZE, STREAMING_API_MAX_PAYLOAD_SIZE};
use crate::error::AppError;

/// Prefix for environment variable overrides (`DATACLOUD_CLIENT_ID`, ...).
pub const ENV_PREFIX: &str = "DATACLOUD_";

/// Default login host for the JWT-bearer grant.
pub const DEFAULT_LOGIN_URL: &str = "https://login.salesforce.com";

// ─────────────────────────────────────────────────────────────────────────────
// InputEncoding
// ─────────────────────────────────────────────────────────────────────────────

/// Character encoding of local CSV files handed to the bulk API.
///
/// Upload fragments are always written as UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1. Every byte maps to the code point of the same value.
    Latin1,
}

impl FromStr for InputEncoding {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "utf-8" | "utf8" | "utf-8-sig" => Ok(InputEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(InputEncoding::Latin1),
            other => Err(AppError::Config(format!(
                "Unsupported input file encoding: {}",
                other
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Raw configuration as read from the figment providers.
#[derive(Debug, Deserialize)]
struct RawConfig {
    client_id: String,
    private_key_file: PathBuf,
    username: String,
    #[serde(default = "default_login_url")]
    login_url: String,
    #[serde(default)]
    temp_dir: Option<PathBuf>,
    #[serde(default)]
    input_file_encoding: Option<String>,
    #[serde(default = "default_streaming_limit")]
    streaming_max_payload_bytes: usize,
    #[serde(default = "default_bulk_limit")]
    bulk_max_payload_bytes: u64,
}

fn default_login_url() -> String {
    DEFAULT_LOGIN_URL.to_string()
}

fn default_streaming_limit() -> usize {
    STREAMING_API_MAX_PAYLOAD_SIZE
}

fn default_bulk_limit() -> u64 {
    BULK_API_MAX_PAYLOAD_SIZE
}

/// Immutable client configuration.
///
/// The signing key is held as a `SecretString` and redacted from `Debug`.
#[derive(Clone)]
pub struct Config {
    /// Connected app consumer key, used as the JWT issuer.
    pub client_id: String,
    /// PEM-encoded RSA private key used to sign the JWT assertion.
    pub private_key: SecretString,
    /// Integration user, used as the JWT subject.
    pub username: String,
    /// Login endpoint base (e.g., `https://login.salesforce.com`).
    pub login_url: Url,
    /// Parent directory for bulk upload fragments.
    pub temp_dir: PathBuf,
    pub input_encoding: InputEncoding,
    /// Byte limit per streaming ingest request.
    pub streaming_max_payload_bytes: usize,
    /// Byte limit per bulk upload fragment.
    pub bulk_max_payload_bytes: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_id", &self.client_id)
            .field("private_key", &"[REDACTED]")
            .field("username", &self.username)
            .field("login_url", &self.login_url.as_str())
            .field("temp_dir", &self.temp_dir)
            .field("input_encoding", &self.input_encoding)
            .field("streaming_max_payload_bytes", &self.streaming_max_payload_bytes)
            .field("bulk_max_payload_bytes", &self.bulk_max_payload_bytes)
            .finish()
    }
}

impl Config {
    /// Creates a configuration with default limits, temp dir and encoding.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the login URL is invalid or the key is
    /// not a PEM-encoded RSA private key.
    pub fn new(
        client_id: impl Into<String>,
        private_key: SecretString,
        username: impl Into<String>,
        login_url: &str,
    ) -> Result<Self, AppError> {
        EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes())
            .map_err(|e| AppError::Config(format!("Invalid RSA private key: {}", e)))?;

        let login_url = normalize_base_url(login_url)
            .map_err(|_| AppError::Config(format!("Invalid login URL: {}", login_url)))?;

        Ok(Self {
            client_id: client_id.into(),
            private_key,
            username: username.into(),
            login_url,
            temp_dir: std::env::temp_dir(),
            input_encoding: InputEncoding::default(),
            streaming_max_payload_bytes: STREAMING_API_MAX_PAYLOAD_SIZE,
            bulk_max_payload_bytes: BULK_API_MAX_PAYLOAD_SIZE,
        })
    }

    /// Loads configuration from an optional YAML file and the environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for missing keys, an unreadable key file or
    /// an unsupported encoding.
    pub fn load(config_file: Option<&Path>) -> Result<Self, AppError> {
        let mut figment = Figment::new();
        if let Some(path) = config_file {
            if !path.exists() {
                return Err(AppError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        Self::from_figment(&figment)
    }

    /// Extracts configuration from an already assembled figment.
    pub fn from_figment(figment: &Figment) -> Result<Self, AppError> {
        let raw: RawConfig = figment
            .extract()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let private_key = std::fs::read_to_string(&raw.private_key_file).map_err(|e| {
            AppError::Config(format!(
                "Failed to read private key file {}: {}",
                raw.private_key_file.display(),
                e
            ))
        })?;

        let mut config = Self::new(
            raw.client_id,
            SecretString::from(private_key),
            raw.username,
            &raw.login_url,
        )?;

        if let Some(temp_dir) = raw.temp_dir {
            config.temp_dir = temp_dir;
        }
        if let Some(encoding) = raw.input_file_encoding {
            config.input_encoding = encoding.parse()?;
        }
        config.streaming_max_payload_bytes = raw.streaming_max_payload_bytes;
        config.bulk_max_payload_bytes = raw.bulk_max_payload_bytes;

        Ok(config)
    }

    /// Sets the parent directory for bulk upload fragments.
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_input_encoding(mut self, encoding: InputEncoding) -> Self {
        self.input_encoding = encoding;
        self
    }

    /// Sets the byte limit per streaming ingest request.
    pub fn with_streaming_limit(mut self, max_bytes: usize) -> Self {
        self.streaming_max_payload_bytes = max_bytes;
        self
    }

    /// Sets the byte limit per bulk upload fragment.
    pub fn with_bulk_limit(mut self, max_bytes: u64) -> Self {
        self.bulk_max_payload_bytes = max_bytes;
        self
    }
}
