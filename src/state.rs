//! Mutable token state owned by a `DataCloudClient`.
//!
//! Kept apart from the immutable `Config` so a refresh only ever replaces
//! this value, never the configuration.

use std::fmt;
use std::time::{Duration, Instant};

use secrecy::SecretString;
use url::Url;

use crate::error::AppError;

/// A platform token younger than this is reused without a network call.
pub const TOKEN_FRESHNESS_WINDOW: Duration = Duration::from_secs(115 * 60);

/// Bearer tokens and instance URLs from the last successful exchange.
///
/// Sensitive fields are wrapped in `SecretString` and redacted from `Debug`.
#[derive(Default)]
pub struct TokenState {
    /// Core access token from the JWT-bearer grant.
    pub(crate) core_token: Option<SecretString>,
    /// Core instance URL returned with the core token.
    pub(crate) core_instance_url: Option<Url>,
    /// Data Cloud scoped access token.
    pub(crate) platform_token: Option<SecretString>,
    /// Data Cloud tenant endpoint.
    pub(crate) platform_instance_url: Option<Url>,
    /// When the exchange that produced these tokens completed.
    pub(crate) refreshed_at: Option<Instant>,
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("core_token", &self.core_token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "core_instance_url",
                &self.core_instance_url.as_ref().map(Url::as_str),
            )
            .field(
                "platform_token",
                &self.platform_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "platform_instance_url",
                &self.platform_instance_url.as_ref().map(Url::as_str),
            )
            .field("refreshed_at", &self.refreshed_at)
            .finish()
    }
}

impl TokenState {
    /// Whether a platform token is currently held.
    pub fn is_authenticated(&self) -> bool {
        self.platform_token.is_some() && self.platform_instance_url.is_some()
    }

    /// Age of the held tokens at `now`, if any.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.refreshed_at
            .map(|refreshed| now.saturating_duration_since(refreshed))
    }

    /// Decides whether an exchange must run before the next request.
    pub fn needs_refresh(&self, now: Instant, force_refresh: bool) -> bool {
        if force_refresh || !self.is_authenticated() {
            return true;
        }
        match self.age(now) {
            Some(age) => age >= TOKEN_FRESHNESS_WINDOW,
            None => true,
        }
    }

    /// The Data Cloud bearer token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotAuthenticated` before the first successful exchange.
    pub fn platform_token(&self) -> Result<&SecretString, AppError> {
        self.platform_token.as_ref().ok_or(AppError::NotAuthenticated)
    }

    /// The Data Cloud tenant endpoint.
    pub fn platform_instance_url(&self) -> Result<&Url, AppError> {
        self.platform_instance_url
            .as_ref()
            .ok_or(AppError::NotAuthenticated)
    }

    /// The core instance URL from the first exchange stage.
    pub fn core_instance_url(&self) -> Option<&Url> {
        self.core_instance_url.as_ref()
    }

    /// Drops every token, leaving the session unauthenticated.
    pub fn clear(&mut self) {
        *self = TokenState::default();
    }
}
