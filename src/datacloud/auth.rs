//! Two-stage token acquisition for Data Cloud.
//!
//! A JWT-bearer grant against the login host yields a core access token,
//! which is then exchanged for a Data Cloud token scoped to the tenant
//! endpoint. The platform token is reused until it is older than
//! [`TOKEN_FRESHNESS_WINDOW`](crate::state::TOKEN_FRESHNESS_WINDOW).

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use url::Url;

use crate::config::Config;
use crate::datacloud::{endpoint, normalize_base_url, DataCloudClient};
use crate::error::{ApiOperation, AppError};
use crate::state::TokenState;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const CDP_EXCHANGE_GRANT: &str = "urn:salesforce:grant-type:external:cdp";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Lifetime of a signed assertion.
const ASSERTION_LIFETIME_SECS: u64 = 3 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Claims of the JWT-bearer assertion.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct AssertionClaims {
    /// Connected app consumer key.
    pub iss: String,
    /// Integration username.
    pub sub: String,
    /// Login URL without trailing slash.
    pub aud: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

/// Response from both token endpoints. Not `Debug`: it holds a raw token.
#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    instance_url: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Assertion
// ─────────────────────────────────────────────────────────────────────────────

/// Signs an RS256 assertion for the JWT-bearer grant.
///
/// # Arguments
///
/// * `config` - Supplies issuer, subject, audience and signing key
/// * `now_epoch` - Current time in seconds since the epoch
///
/// # Errors
///
/// Returns `AppError::Signing` if the key cannot be loaded or signing fails.
pub(crate) fn build_assertion(config: &Config, now_epoch: u64) -> Result<SecretString, AppError> {
    let claims = AssertionClaims {
        iss: config.client_id.clone(),
        sub: config.username.clone(),
        aud: config.login_url.as_str().trim_end_matches('/').to_string(),
        exp: now_epoch + ASSERTION_LIFETIME_SECS,
    };

    let key = EncodingKey::from_rsa_pem(config.private_key.expose_secret().as_bytes())
        .map_err(|e| AppError::Signing(e.to_string()))?;

    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map(SecretString::from)
        .map_err(|e| AppError::Signing(e.to_string()))
}

fn unix_now() -> Result<u64, AppError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| AppError::Internal(format!("System clock before epoch: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Token Manager
// ─────────────────────────────────────────────────────────────────────────────

impl DataCloudClient {
    /// Makes sure a platform token younger than the freshness window is held.
    ///
    /// Performs no network call while the held token is fresh, unless
    /// `force_refresh` is set. On failure the token state is cleared, leaving
    /// the session unauthenticated.
    ///
    /// # Errors
    ///
    /// - `AppError::Api` - Either token endpoint returned a non-200 status
    /// - `AppError::Signing` - The assertion could not be signed
    /// - `AppError::InvalidResponse` - A token response was malformed
    /// - `AppError::ConnectionFailed` - Network error
    pub async fn ensure_valid_token(&mut self, force_refresh: bool) -> Result<(), AppError> {
        if !self.tokens.needs_refresh(Instant::now(), force_refresh) {
            debug!("[AUTH] Reusing platform token");
            return Ok(());
        }

        info!(
            "[AUTH] Requesting Data Cloud token (forced: {})",
            force_refresh
        );

        match self.exchange_tokens().await {
            Ok(tokens) => {
                self.tokens = tokens;
                info!("[AUTH] Data Cloud token acquired");
                Ok(())
            }
            Err(e) => {
                self.tokens.clear();
                error!("[AUTH] Token exchange failed: {}", e.sanitized());
                Err(e)
            }
        }
    }

    /// Runs both grant stages and returns the resulting state.
    async fn exchange_tokens(&self) -> Result<TokenState, AppError> {
        let assertion = build_assertion(&self.config, unix_now()?)?;

        let token_url = endpoint(&self.config.login_url, &["services", "oauth2", "token"])?;
        let core = self
            .request_token(
                ApiOperation::GetAccessToken,
                token_url,
                &[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.expose_secret()),
                ],
            )
            .await?;
        let core_instance_url = parse_instance_url(ApiOperation::GetAccessToken, &core.instance_url)?;

        debug!("[AUTH] Core access token acquired, exchanging");

        let exchange_url = endpoint(&core_instance_url, &["services", "a360", "token"])?;
        let platform = self
            .request_token(
                ApiOperation::TokenExchange,
                exchange_url,
                &[
                    ("grant_type", CDP_EXCHANGE_GRANT),
                    ("subject_token", core.access_token.as_str()),
                    ("subject_token_type", ACCESS_TOKEN_TYPE),
                ],
            )
            .await?;
        let platform_instance_url =
            parse_instance_url(ApiOperation::TokenExchange, &platform.instance_url)?;

        Ok(TokenState {
            core_token: Some(SecretString::from(core.access_token)),
            core_instance_url: Some(core_instance_url),
            platform_token: Some(SecretString::from(platform.access_token)),
            platform_instance_url: Some(platform_instance_url),
            refreshed_at: Some(Instant::now()),
        })
    }

    /// Posts a token form and parses the `access_token`/`instance_url` pair.
    async fn request_token(
        &self,
        operation: ApiOperation,
        url: Url,
        form: &[(&str, &str)],
    ) -> Result<AccessTokenResponse, AppError> {
        let request = self.http.post(url.clone()).form(form);
        let response = self
            .dispatch(operation, &Method::POST, &url, request, StatusCode::OK)
            .await?;
        response.json(operation)
    }
}

fn parse_instance_url(operation: ApiOperation, raw: &str) -> Result<Url, AppError> {
    normalize_base_url(raw).map_err(|_| AppError::InvalidResponse {
        operation,
        message: "Token response carried an invalid instance_url".to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datacloud::test_support::{
        authed_client, mount_auth, test_config, CORE_TOKEN, PLATFORM_TOKEN,
    };
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_PUBLIC_KEY: &str = include_str!("../../tests/fixtures/test_public_key.pem");

    // ─────────────────────────────────────────────────────────────────────────
    // Assertion Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn assertion_carries_expected_claims() {
        let config = test_config("https://login.salesforce.com/");
        let now = 1_700_000_000;

        let assertion = build_assertion(&config, now).unwrap();

        let key = DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY.as_bytes()).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_audience(&["https://login.salesforce.com"]);

        let decoded = decode::<AssertionClaims>(assertion.expose_secret(), &key, &validation)
            .unwrap();

        assert_eq!(decoded.header.alg, Algorithm::RS256);
        assert_eq!(
            decoded.claims,
            AssertionClaims {
                iss: "test_client_id".to_string(),
                sub: "integration@example.com".to_string(),
                aud: "https://login.salesforce.com".to_string(),
                exp: now + 180,
            }
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Exchange Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn exchange_populates_token_state() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains(
                "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer",
            ))
            .and(body_string_contains("assertion=ey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": CORE_TOKEN,
                "instance_url": mock_server.uri()
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/services/a360/token"))
            .and(body_string_contains(
                "grant_type=urn%3Asalesforce%3Agrant-type%3Aexternal%3Acdp",
            ))
            .and(body_string_contains("subject_token=00Dxx0000000001%21core_token"))
            .and(body_string_contains(
                "subject_token_type=urn%3Aietf%3Aparams%3Aoauth%3Atoken-type%3Aaccess_token",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": PLATFORM_TOKEN,
                "instance_url": mock_server.uri()
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut client = DataCloudClient::new(test_config(&mock_server.uri())).unwrap();
        client.ensure_valid_token(false).await.unwrap();

        let state = client.token_state();
        assert!(state.is_authenticated());
        assert_eq!(state.platform_token().unwrap().expose_secret(), PLATFORM_TOKEN);
        assert_eq!(
            state.platform_instance_url().unwrap().as_str(),
            format!("{}/", mock_server.uri())
        );
        assert!(state.core_instance_url().is_some());
        assert!(state.age(Instant::now()).is_some());
    }

    #[tokio::test]
    async fn fresh_token_is_reused_without_network_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": CORE_TOKEN,
                "instance_url": mock_server.uri()
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/services/a360/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": PLATFORM_TOKEN,
                "instance_url": mock_server.uri()
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut client = DataCloudClient::new(test_config(&mock_server.uri())).unwrap();
        client.ensure_valid_token(false).await.unwrap();
        client.ensure_valid_token(false).await.unwrap();
    }

    #[tokio::test]
    async fn force_refresh_runs_a_new_exchange() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": CORE_TOKEN,
                "instance_url": mock_server.uri()
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/services/a360/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": PLATFORM_TOKEN,
                "instance_url": mock_server.uri()
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let mut client = DataCloudClient::new(test_config(&mock_server.uri())).unwrap();
        client.ensure_valid_token(false).await.unwrap();
        client.ensure_valid_token(true).await.unwrap();

        assert!(client.token_state().is_authenticated());
    }

    #[tokio::test]
    async fn first_stage_failure_is_structured() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":"invalid_grant","error_description":"user hasn't approved this consumer"}"#),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/services/a360/token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let mut client = DataCloudClient::new(test_config(&mock_server.uri())).unwrap();
        let err = client.ensure_valid_token(false).await.unwrap_err();

        match err {
            AppError::Api {
                operation,
                url,
                status,
                body,
            } => {
                assert_eq!(operation, ApiOperation::GetAccessToken);
                assert_eq!(url, format!("{}/services/oauth2/token", mock_server.uri()));
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("Expected Api error, got: {:?}", other),
        }
        assert!(!client.token_state().is_authenticated());
    }

    #[tokio::test]
    async fn second_stage_failure_clears_existing_session() {
        let mock_server = MockServer::start().await;
        let mut client = authed_client(&mock_server).await;
        assert!(client.token_state().is_authenticated());

        // Later mounts lose to the earlier auth mocks, so start from a clean server
        mock_server.reset().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": CORE_TOKEN,
                "instance_url": mock_server.uri()
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/services/a360/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad_OAuth_Token"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = client.ensure_valid_token(true).await.unwrap_err();

        assert_eq!(err.operation(), Some(ApiOperation::TokenExchange));
        assert_eq!(err.status(), Some(401));
        assert!(!client.token_state().is_authenticated());
        assert!(client.token_state().age(Instant::now()).is_none());
    }

    #[tokio::test]
    async fn failed_exchange_is_retried_on_next_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(500).set_body_string("unavailable"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;
        mount_auth(&mock_server).await;

        let mut client = DataCloudClient::new(test_config(&mock_server.uri())).unwrap();

        assert!(client.ensure_valid_token(false).await.is_err());
        client.ensure_valid_token(false).await.unwrap();
        assert!(client.token_state().is_authenticated());
    }

    #[tokio::test]
    async fn bare_host_instance_url_gets_https_scheme() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": CORE_TOKEN,
                "instance_url": mock_server.uri()
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/services/a360/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": PLATFORM_TOKEN,
                "instance_url": "acme.c360a.salesforce.com"
            })))
            .mount(&mock_server)
            .await;

        let mut client = DataCloudClient::new(test_config(&mock_server.uri())).unwrap();
        client.ensure_valid_token(false).await.unwrap();

        assert_eq!(
            client.token_state().platform_instance_url().unwrap().as_str(),
            "https://acme.c360a.salesforce.com/"
        );
    }

    #[tokio::test]
    async fn malformed_token_response_is_invalid_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&mock_server)
            .await;

        let mut client = DataCloudClient::new(test_config(&mock_server.uri())).unwrap();
        let err = client.ensure_valid_token(false).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::InvalidResponse {
                operation: ApiOperation::GetAccessToken,
                ..
            }
        ));
    }
}
