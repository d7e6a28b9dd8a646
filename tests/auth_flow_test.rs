//! Token endpoint client integration tests using wiremock
//!
//! Verifies `src/auth/flow.rs` against a mock identity provider:
//!
//! - The code exchange sends the PKCE verifier and no client secret.
//! - `expires_at` is computed locally from `expires_in`.
//! - Refresh responses that omit fields keep the previous values.
//! - Non-2xx responses, invalid bodies and timeouts map to typed errors.
//! - Dynamic client registration requests a public client.

use std::time::Duration;

use chrono::Utc;
use url::Url;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hte_auth::auth::flow::TokenEndpointClient;
use hte_auth::auth::pkce;
use hte_auth::auth::token_store::TokenSet;
use hte_auth::config::IdpConfig;
use hte_auth::HteAuthError;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Provider settings whose endpoints point at `server`.
fn idp_for(server: &MockServer) -> IdpConfig {
    let base = server.uri();
    IdpConfig {
        name: "HealthEx".to_string(),
        authorize_endpoint: Url::parse(&format!("{base}/oauth/authorize")).unwrap(),
        token_endpoint: Url::parse(&format!("{base}/oauth/token")).unwrap(),
        registration_endpoint: Some(Url::parse(&format!("{base}/oauth/register")).unwrap()),
        client_id: None,
        client_name: "HTE Local Dev".to_string(),
        redirect_uri: Url::parse("http://localhost:4222/healthex/callback").unwrap(),
        scope: "patient/*.read offline_access".to_string(),
        verifier_bytes: 64,
        request_timeout_secs: 5,
    }
}

fn token_response_body() -> serde_json::Value {
    serde_json::json!({
        "access_token": "access-xyz",
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": "refresh-abc",
        "id_token": "id-123",
        "scope": "patient/*.read offline_access"
    })
}

fn current_tokens() -> TokenSet {
    TokenSet {
        access_token: "old-access".to_string(),
        refresh_token: Some("old-refresh".to_string()),
        id_token: Some("old-id".to_string()),
        expires_at: Utc::now(),
        token_type: "Bearer".to_string(),
        scope: Some("patient/*.read offline_access".to_string()),
    }
}

fn typed(err: &anyhow::Error) -> HteAuthError {
    err.downcast_ref::<HteAuthError>()
        .cloned()
        .expect("error should be an HteAuthError")
}

// ---------------------------------------------------------------------------
// Code exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_exchange_sends_verifier_and_parses_tokens() {
    let server = MockServer::start().await;
    let pair = pkce::generate_with_entropy(64).unwrap();

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code-1"))
        .and(body_string_contains(format!("code_verifier={}", pair.verifier)))
        .and(body_string_contains("client_id=client-1"))
        .and(body_string_contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A4222%2Fhealthex%2Fcallback",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let before = Utc::now();
    let tokens = client
        .exchange_code(
            "client-1",
            "auth-code-1",
            &pair.verifier,
            "http://localhost:4222/healthex/callback",
        )
        .await
        .expect("exchange succeeds");
    let after = Utc::now();

    assert_eq!(tokens.access_token, "access-xyz");
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-abc"));
    assert_eq!(tokens.id_token.as_deref(), Some("id-123"));
    assert_eq!(tokens.authorization_value(), "Bearer access-xyz");
    assert!(tokens.expires_at >= before + chrono::Duration::seconds(3600));
    assert!(tokens.expires_at <= after + chrono::Duration::seconds(3600));

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(!body.contains("client_secret"));
}

#[tokio::test]
async fn test_exchange_rejected_code_is_token_exchange_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#),
        )
        .mount(&server)
        .await;

    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let err = client
        .exchange_code("client-1", "bad", "verifier", "http://localhost/cb")
        .await
        .unwrap_err();

    match typed(&err) {
        HteAuthError::TokenExchange { status, body } => {
            assert_eq!(status, Some(400));
            assert!(body.contains("invalid_grant"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_exchange_response_without_expires_in_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "a",
            "token_type": "Bearer"
        })))
        .mount(&server)
        .await;

    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let err = client
        .exchange_code("client-1", "code", "verifier", "http://localhost/cb")
        .await
        .unwrap_err();

    assert!(matches!(
        typed(&err),
        HteAuthError::TokenExchange {
            status: Some(200),
            ..
        }
    ));
}

#[tokio::test]
async fn test_exchange_timeout_is_token_exchange_without_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_response_body())
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let mut idp = idp_for(&server);
    idp.request_timeout_secs = 1;
    let client = TokenEndpointClient::new(idp).unwrap();
    let err = client
        .exchange_code("client-1", "code", "verifier", "http://localhost/cb")
        .await
        .unwrap_err();

    assert!(matches!(
        typed(&err),
        HteAuthError::TokenExchange { status: None, .. }
    ));
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_refresh_without_rotation_retains_previous_values() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .and(body_string_contains("client_id=client-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new-access",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let refreshed = client.refresh("client-1", &current_tokens()).await.unwrap();

    assert_eq!(refreshed.access_token, "new-access");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("old-refresh"));
    assert_eq!(refreshed.id_token.as_deref(), Some("old-id"));
    assert_eq!(
        refreshed.scope.as_deref(),
        Some("patient/*.read offline_access")
    );
    assert_eq!(refreshed.token_type, "Bearer");
}

#[tokio::test]
async fn test_refresh_with_rotation_uses_new_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response_body()))
        .mount(&server)
        .await;

    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let refreshed = client.refresh("client-1", &current_tokens()).await.unwrap();
    assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-abc"));
    assert_eq!(refreshed.id_token.as_deref(), Some("id-123"));
}

#[tokio::test]
async fn test_refresh_rejected_is_token_refresh_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&server)
        .await;

    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let err = client
        .refresh("client-1", &current_tokens())
        .await
        .unwrap_err();
    assert_eq!(
        typed(&err),
        HteAuthError::TokenRefresh {
            status: Some(401),
            body: "expired".to_string()
        }
    );
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_requests_public_client() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/register"))
        .and(body_partial_json(serde_json::json!({
            "client_name": "HTE Local Dev",
            "redirect_uris": ["http://localhost:4222/healthex/callback"],
            "token_endpoint_auth_method": "none",
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"]
        })))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "registered-42",
                "client_name": "HTE Local Dev"
            })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let client_id = client
        .register("HTE Local Dev", "http://localhost:4222/healthex/callback")
        .await
        .unwrap();
    assert_eq!(client_id, "registered-42");
}

#[tokio::test]
async fn test_register_failure_is_client_registration_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/register"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let err = client
        .register("HTE Local Dev", "http://localhost/cb")
        .await
        .unwrap_err();
    assert!(matches!(typed(&err), HteAuthError::ClientRegistration(_)));
}

#[tokio::test]
async fn test_authorization_url_targets_configured_endpoint() {
    let server = MockServer::start().await;
    let client = TokenEndpointClient::new(idp_for(&server)).unwrap();
    let pair = pkce::generate().unwrap();

    let url = client
        .build_authorization_url("client-1", &pair.challenge, "state-1")
        .unwrap();

    assert_eq!(url.path(), "/oauth/authorize");
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert!(pairs.contains(&("code_challenge".to_string(), pair.challenge.clone())));
    assert!(pairs.contains(&("code_challenge_method".to_string(), "S256".to_string())));
    assert!(pairs.contains(&(
        "scope".to_string(),
        "patient/*.read offline_access".to_string()
    )));
}
