//! Local HTTP server that completes browser-based authorization
//!
//! The server owns at most one [`PendingAuthSession`].  `GET {prefix}/connect`
//! creates it and redirects the browser to the provider; the provider
//! redirects back to the callback path (the path of the configured redirect
//! URI) with `code` and `state`.  The callback is accepted only when `state`
//! matches the pending session, and the session is discarded on every
//! callback outcome.
//!
//! | Route                    | Response                                   |
//! |--------------------------|--------------------------------------------|
//! | `GET /`, `GET {prefix}`  | HTML connection status page                |
//! | `GET {prefix}/status`    | JSON `{connected, expiresAt, scope}`       |
//! | `GET {prefix}/connect`   | `302` to the authorization URL             |
//! | `GET {callback path}`    | code exchange, HTML result page            |
//! | anything else            | `404`                                      |

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::auth::pkce;
use crate::auth::strategy::OAuthStrategy;
use crate::config::Config;
use crate::error::{HteAuthError, Result};

/// Capacity of the token event channel.
const EVENT_CAPACITY: usize = 16;

/// An authorization started by `/connect` and not yet resolved.
#[derive(Debug, Clone)]
pub struct PendingAuthSession {
    /// PKCE verifier whose challenge was sent to the authorize endpoint
    pub code_verifier: String,
    /// One-time value the callback must echo back
    pub state: String,
    /// Client the authorization was requested for
    pub client_id: String,
}

/// Notifications published by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// A callback completed and new tokens were stored.
    Issued {
        /// Expiry of the new access token
        expires_at: DateTime<Utc>,
        /// Scope granted by the provider
        scope: Option<String>,
    },
}

/// Result of [`CallbackServer::start`].
#[derive(Debug)]
pub enum StartOutcome {
    /// The server is listening.
    Started(ServerHandle),
    /// Another process already listens on the configured port.
    AlreadyRunning,
}

/// Handle to a running server task.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for the server task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::error!("Callback server task failed: {}", e);
        }
    }
}

/// Query parameters the provider may send to the callback path.
#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// CallbackServer
// ---------------------------------------------------------------------------

/// Status page, connect route and OAuth callback for one provider.
///
/// Cloning is cheap; clones share the pending session and event channel.
#[derive(Clone)]
pub struct CallbackServer {
    inner: Arc<Inner>,
}

struct Inner {
    strategy: Arc<OAuthStrategy>,
    bind_addr: String,
    prefix: String,
    callback_path: String,
    pending: Mutex<Option<PendingAuthSession>>,
    events: broadcast::Sender<TokenEvent>,
}

impl CallbackServer {
    /// Creates a server for `strategy` using the routes and port in
    /// `config`.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Config`] when the callback path collides with
    /// one of the status or connect routes.
    pub fn new(strategy: Arc<OAuthStrategy>, config: &Config) -> Result<Self> {
        let prefix = config.server.route_prefix.trim_end_matches('/').to_string();
        let callback_path = strategy.client().idp().redirect_uri.path().to_string();

        let reserved = [
            "/".to_string(),
            prefix.clone(),
            format!("{prefix}/status"),
            format!("{prefix}/connect"),
        ];
        if reserved.contains(&callback_path) {
            return Err(HteAuthError::Config(format!(
                "redirect URI path {callback_path} collides with a status route"
            ))
            .into());
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                strategy,
                bind_addr: format!("{}:{}", config.server.bind_host, config.server_port()),
                prefix,
                callback_path,
                pending: Mutex::new(None),
                events,
            }),
        })
    }

    /// Builds the axum router.  All routers built from one server share its
    /// pending session.
    pub fn router(&self) -> Router {
        let prefix = &self.inner.prefix;
        let mut router = Router::new().route("/", get(status_page));
        if !prefix.is_empty() {
            router = router.route(prefix, get(status_page));
        }
        router
            .route(&format!("{prefix}/status"), get(status_json))
            .route(&format!("{prefix}/connect"), get(connect))
            .route(&self.inner.callback_path, get(callback))
            .fallback(not_found)
            .with_state(self.clone())
    }

    /// Binds the configured address and serves in a background task.
    ///
    /// A port that is already in use means another instance is serving, and
    /// yields [`StartOutcome::AlreadyRunning`].
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Server`] for any other bind failure.
    pub async fn start(&self) -> Result<StartOutcome> {
        let addr = &self.inner.bind_addr;
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::info!("Callback server already running on {}", addr);
                return Ok(StartOutcome::AlreadyRunning);
            }
            Err(e) => return Err(HteAuthError::Server(format!("bind {addr}: {e}")).into()),
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| HteAuthError::Server(format!("local address: {e}")))?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = self.router();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
                tracing::debug!("Callback server shutting down");
            });
            if let Err(e) = server.await {
                tracing::error!("Callback server error: {}", e);
            }
        });

        tracing::info!(
            "Callback server listening on http://{}{}",
            local_addr,
            self.inner.prefix
        );
        Ok(StartOutcome::Started(ServerHandle {
            local_addr,
            shutdown,
            task,
        }))
    }

    /// Receives a [`TokenEvent`] for every completed authorization.
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.inner.events.subscribe()
    }

    /// Path of the connect route.
    pub fn connect_path(&self) -> String {
        format!("{}/connect", self.inner.prefix)
    }

    /// Starts an authorization: resolves the client id, creates a PKCE pair
    /// and state, records them as the pending session (replacing any earlier
    /// one) and returns the authorization URL.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::ClientRegistration`] when no client id is
    /// known and registration fails, or [`HteAuthError::PkceGeneration`].
    pub async fn begin_authorization(&self) -> Result<Url> {
        let strategy = &self.inner.strategy;
        let idp = strategy.client().idp();

        let client_id = match strategy.client_id() {
            Some(id) => id,
            None => {
                tracing::info!("No {} client id known, registering", idp.name);
                strategy
                    .client()
                    .register(&idp.client_name, idp.redirect_uri.as_str())
                    .await?
            }
        };

        let pkce = pkce::generate_with_entropy(idp.verifier_bytes)?;
        let state = pkce::generate_state()?;
        let url = strategy
            .client()
            .build_authorization_url(&client_id, &pkce.challenge, &state)?;

        let session = PendingAuthSession {
            code_verifier: pkce.verifier,
            state,
            client_id,
        };
        tracing::debug!("Pending authorization, state={}", short(&session.state));
        if let Some(previous) = self.lock_pending().replace(session) {
            tracing::debug!(
                "Replaced pending authorization, state={}",
                short(&previous.state)
            );
        }

        Ok(url)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingAuthSession>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a callback.  The pending session is consumed whatever the
    /// outcome.
    async fn complete(&self, params: CallbackParams) -> Response {
        let session = self.lock_pending().take();
        let provider = &self.inner.strategy.client().idp().name;

        if let Some(error) = params.error {
            tracing::warn!("{} denied authorization: {}", provider, error);
            let detail = params.error_description.unwrap_or(error);
            return self.page(
                StatusCode::BAD_REQUEST,
                "Authorization denied",
                &format!("{provider} did not grant access: {detail}"),
            );
        }

        let (session, code) = match (session, params.code, params.state) {
            (Some(session), Some(code), Some(state)) if state == session.state => (session, code),
            (session, _, _) => {
                tracing::warn!(
                    "Rejected callback: {} (pending session: {})",
                    HteAuthError::StateMismatch,
                    session.is_some()
                );
                return self.page(
                    StatusCode::BAD_REQUEST,
                    "Invalid callback",
                    "This callback does not match a pending authorization. Start the connection again.",
                );
            }
        };

        let strategy = &self.inner.strategy;
        let redirect_uri = strategy.client().idp().redirect_uri.as_str();
        let tokens = match strategy
            .client()
            .exchange_code(&session.client_id, &code, &session.code_verifier, redirect_uri)
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("{} code exchange failed: {}", provider, e);
                return self.page(
                    StatusCode::BAD_GATEWAY,
                    "Connection failed",
                    &e.to_string(),
                );
            }
        };

        if let Err(e) = strategy.complete_authorization(&session.client_id, tokens.clone()) {
            tracing::error!("Failed to store {} tokens: {}", provider, e);
            return self.page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Connection failed",
                &e.to_string(),
            );
        }

        let _ = self.inner.events.send(TokenEvent::Issued {
            expires_at: tokens.expires_at,
            scope: tokens.scope.clone(),
        });

        self.page(
            StatusCode::OK,
            "Connected",
            &format!("{provider} is connected. You can close this window."),
        )
    }

    fn page(&self, status: StatusCode, title: &str, message: &str) -> Response {
        let home = if self.inner.prefix.is_empty() {
            "/"
        } else {
            self.inner.prefix.as_str()
        };
        (status, Html(render_page(title, message, home))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn status_page(State(server): State<CallbackServer>) -> Html<String> {
    let strategy = &server.inner.strategy;
    let provider = &strategy.client().idp().name;
    let connect = server.connect_path();

    let body = match strategy.store().get() {
        Some(tokens) if tokens.is_live_at(Utc::now()) => format!(
            "<p>{} is connected.</p><p>Access token expires {}.</p><p>Scope: {}</p>\
             <p><a href=\"{}\">Reconnect</a></p>",
            escape_html(provider),
            escape_html(&tokens.expires_at.to_rfc3339()),
            escape_html(tokens.scope.as_deref().unwrap_or("(none)")),
            escape_html(&connect),
        ),
        _ => format!(
            "<p>{} is not connected.</p><p><a href=\"{}\">Connect</a></p>",
            escape_html(provider),
            escape_html(&connect),
        ),
    };

    Html(wrap_html(&format!("{provider} connection"), &body))
}

async fn status_json(State(server): State<CallbackServer>) -> Json<serde_json::Value> {
    let tokens = server.inner.strategy.store().get();
    let connected = tokens
        .as_ref()
        .is_some_and(|t| t.is_live_at(Utc::now()));

    Json(serde_json::json!({
        "connected": connected,
        "expiresAt": tokens.as_ref().map(|t| t.expires_at.timestamp_millis()),
        "scope": tokens.and_then(|t| t.scope),
    }))
}

async fn connect(State(server): State<CallbackServer>) -> Response {
    match server.begin_authorization().await {
        Ok(url) => (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response(),
        Err(e) => {
            tracing::error!("Failed to start authorization: {}", e);
            server.page(StatusCode::BAD_GATEWAY, "Connection failed", &e.to_string())
        }
    }
}

async fn callback(
    State(server): State<CallbackServer>,
    Query(params): Query<CallbackParams>,
) -> Response {
    server.complete(params).await
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

// ---------------------------------------------------------------------------
// HTML
// ---------------------------------------------------------------------------

fn render_page(title: &str, message: &str, home: &str) -> String {
    let body = format!(
        "<p>{}</p><p><a href=\"{}\">Back</a></p>",
        escape_html(message),
        escape_html(home)
    );
    wrap_html(title, &body)
}

fn wrap_html(title: &str, body: &str) -> String {
    let title = escape_html(title);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif; max-width: 36rem; margin: 4rem auto; padding: 0 1rem; }}
        h1 {{ font-size: 1.4rem; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    {body}
</body>
</html>"#
    )
}

/// Escapes text for inclusion in HTML element content or attribute values.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// First 8 characters of a state value, for logs.
fn short(state: &str) -> &str {
    state.get(..8).unwrap_or(state)
}
