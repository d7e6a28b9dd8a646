//! Token endpoint client for the OAuth 2.0 authorization code flow with PKCE
//!
//! [`TokenEndpointClient`] performs the protocol calls against one identity
//! provider:
//!
//! - building the authorization URL the browser is redirected to,
//! - exchanging an authorization code (RFC 6749 section 4.1.3 + RFC 7636),
//! - refreshing an access token (RFC 6749 section 6),
//! - dynamic client registration (RFC 7591).
//!
//! This is a public client: no client secret is ever sent.  Every call is
//! bounded by the configured timeout, and a timeout or connection failure is
//! reported the same way as a non-2xx response.  Nothing is retried here.
//!
//! # References
//!
//! - RFC 6749 <https://www.rfc-editor.org/rfc/rfc6749>
//! - RFC 7636 PKCE <https://www.rfc-editor.org/rfc/rfc7636>
//! - RFC 7591 Dynamic Registration <https://www.rfc-editor.org/rfc/rfc7591>

use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::auth::pkce;
use crate::auth::token_store::TokenSet;
use crate::config::IdpConfig;
use crate::error::{HteAuthError, Result};

/// Upper bound applied to `expires_in` (ten years).
const MAX_EXPIRES_IN_SECS: u64 = 10 * 365 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Token endpoint response
// ---------------------------------------------------------------------------

/// Token endpoint response schema shared by the code and refresh grants.
///
/// `access_token` and `expires_in` are required; a body without them is
/// rejected before any [`TokenSet`] is built.
#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    /// Converts the response into a [`TokenSet`] whose expiry is measured
    /// from `issued_at`, the moment the request was sent.
    fn into_token_set(self, issued_at: DateTime<Utc>) -> TokenSet {
        let lifetime = chrono::Duration::seconds(self.expires_in.min(MAX_EXPIRES_IN_SECS) as i64);
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            id_token: self.id_token,
            expires_at: issued_at + lifetime,
            token_type: self
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Bearer".to_string()),
            scope: self.scope,
        }
    }
}

/// Dynamic Client Registration response (RFC 7591).
#[derive(Debug, serde::Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

/// The two token grants, used to pick the matching error variant.
#[derive(Debug, Clone, Copy)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

impl Grant {
    fn error(self, status: Option<u16>, body: String) -> HteAuthError {
        match self {
            Grant::AuthorizationCode => HteAuthError::TokenExchange { status, body },
            Grant::RefreshToken => HteAuthError::TokenRefresh { status, body },
        }
    }
}

// ---------------------------------------------------------------------------
// TokenEndpointClient
// ---------------------------------------------------------------------------

/// Performs token endpoint calls against one identity provider.
///
/// Cloning is cheap: the underlying `reqwest::Client` is reference counted.
///
/// # Examples
///
/// ```
/// use hte_auth::auth::flow::TokenEndpointClient;
/// use hte_auth::config::IdpConfig;
///
/// let client = TokenEndpointClient::new(IdpConfig::secondary_default()).unwrap();
/// let url = client
///     .build_authorization_url("client-123", "challenge", "state-xyz")
///     .unwrap();
/// assert!(url.as_str().starts_with("https://api.healthex1.io/oauth/authorize?"));
/// ```
#[derive(Debug, Clone)]
pub struct TokenEndpointClient {
    http: reqwest::Client,
    idp: IdpConfig,
}

impl TokenEndpointClient {
    /// Creates a client whose requests time out after
    /// `idp.request_timeout_secs`.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Config`] if the HTTP client cannot be built.
    pub fn new(idp: IdpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(idp.request_timeout_secs))
            .build()
            .map_err(|e| HteAuthError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(http, idp))
    }

    /// Creates a client around an existing `reqwest::Client`.
    pub fn with_http_client(http: reqwest::Client, idp: IdpConfig) -> Self {
        Self { http, idp }
    }

    /// Provider settings this client talks to.
    pub fn idp(&self) -> &IdpConfig {
        &self.idp
    }

    /// Builds the authorization URL with all required query parameters.
    ///
    /// Parameters: `response_type=code`, `client_id`, `redirect_uri`,
    /// `scope`, `code_challenge`, `code_challenge_method=S256`, `state`.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Config`] if the configured authorize endpoint
    /// cannot carry a query string.
    pub fn build_authorization_url(
        &self,
        client_id: &str,
        code_challenge: &str,
        state: &str,
    ) -> Result<Url> {
        let mut url = self.idp.authorize_endpoint.clone();
        if url.cannot_be_a_base() {
            return Err(HteAuthError::Config(format!(
                "invalid authorization endpoint URL: {url}"
            ))
            .into());
        }

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", self.idp.redirect_uri.as_str())
            .append_pair("scope", &self.idp.scope)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", pkce::CHALLENGE_METHOD)
            .append_pair("state", state);

        Ok(url)
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Arguments
    ///
    /// * `client_id` - Client the code was issued to.
    /// * `code` - Authorization code from the callback.
    /// * `code_verifier` - Verifier whose challenge was sent at authorize time.
    /// * `redirect_uri` - Redirect URI used at authorize time.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenExchange`] on a non-2xx response, a
    /// transport failure or timeout, or a response body missing required
    /// fields.
    pub async fn exchange_code(
        &self,
        client_id: &str,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id),
            ("code_verifier", code_verifier),
        ];

        tracing::debug!("Exchanging authorization code with {}", self.idp.name);
        let tokens = self.token_request(Grant::AuthorizationCode, &params).await?;
        tracing::info!("{} authorization code exchanged", self.idp.name);
        Ok(tokens)
    }

    /// Refreshes the access token in `current`.
    ///
    /// Fields the provider omits from the response are carried over from
    /// `current`: the refresh token (non-rotating providers), the ID token,
    /// and the scope.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::NotAuthenticated`] if `current` has no usable
    /// refresh token, or [`HteAuthError::TokenRefresh`] on a non-2xx
    /// response, a transport failure or timeout, or an invalid body.
    pub async fn refresh(&self, client_id: &str, current: &TokenSet) -> Result<TokenSet> {
        let refresh_token = current
            .usable_refresh_token()
            .ok_or(HteAuthError::NotAuthenticated)?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];

        tracing::debug!("Refreshing {} access token", self.idp.name);
        let mut tokens = self.token_request(Grant::RefreshToken, &params).await?;

        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        if tokens.id_token.is_none() {
            tokens.id_token = current.id_token.clone();
        }
        if tokens.scope.is_none() {
            tokens.scope = current.scope.clone();
        }

        tracing::info!("{} access token refreshed", self.idp.name);
        Ok(tokens)
    }

    /// Registers a public client with the provider and returns its
    /// `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::ClientRegistration`] if the provider has no
    /// registration endpoint, the request fails, or the response lacks a
    /// `client_id`.
    pub async fn register(&self, client_name: &str, redirect_uri: &str) -> Result<String> {
        let endpoint = self.idp.registration_endpoint.as_ref().ok_or_else(|| {
            HteAuthError::ClientRegistration(format!(
                "{} has no registration endpoint configured",
                self.idp.name
            ))
        })?;

        let body = serde_json::json!({
            "client_name": client_name,
            "redirect_uris": [redirect_uri],
            "token_endpoint_auth_method": "none",
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
        });

        let resp = self
            .http
            .post(endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| HteAuthError::ClientRegistration(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(HteAuthError::ClientRegistration(format!(
                "registration endpoint returned {status}: {text}"
            ))
            .into());
        }

        let registration: RegistrationResponse = resp.json().await.map_err(|e| {
            HteAuthError::ClientRegistration(format!("failed to parse registration response: {e}"))
        })?;

        if registration.client_id.is_empty() {
            return Err(HteAuthError::ClientRegistration(
                "registration response carried an empty client_id".to_string(),
            )
            .into());
        }

        tracing::info!("Registered new {} client", self.idp.name);
        Ok(registration.client_id)
    }

    /// POSTs a form-encoded grant to the token endpoint and validates the
    /// response.
    async fn token_request(&self, grant: Grant, params: &[(&str, &str)]) -> Result<TokenSet> {
        let issued_at = Utc::now();

        let resp = self
            .http
            .post(self.idp.token_endpoint.clone())
            .form(params)
            .send()
            .await
            .map_err(|e| grant.error(None, e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| grant.error(Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            return Err(grant.error(Some(status.as_u16()), body).into());
        }

        let raw: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            grant.error(
                Some(status.as_u16()),
                format!("invalid token response: {e}"),
            )
        })?;

        Ok(raw.into_token_set(issued_at))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
