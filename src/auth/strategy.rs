//! Authentication strategies handed to API clients
//!
//! Collaborators depend only on the [`AuthStrategy`] trait: "give me headers
//! that authenticate this call" and "am I currently authenticated".
//!
//! [`OAuthStrategy`] implements it for one identity provider on top of a
//! [`TokenEndpointClient`] and a [`TokenStore`].  When the stored access
//! token is inside the expiry buffer, concurrent callers share a single
//! refresh request:
//!
//! ```text
//!            first expired caller
//!   Idle ───────────────────────────▶ Refreshing(shared future)
//!    ▲                                   │  later callers clone the
//!    │        refresh settles            │  handle and await it
//!    └───────────────────────────────────┘
//! ```
//!
//! The refresh runs on its own tokio task, so it completes and updates the
//! store even if the caller that started it is dropped.  A refresh the
//! provider rejects clears the store before its outcome is observed, so
//! every later call reports [`HteAuthError::NotAuthenticated`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::auth::flow::TokenEndpointClient;
use crate::auth::token_store::{FileTokenStore, MemoryTokenStore, TokenSet, TokenStore};
use crate::config::Config;
use crate::error::{HteAuthError, Result};

/// Request headers that authenticate a call.
///
/// Always exactly `{"Authorization": "<token_type> <access_token>"}`.
pub type AuthHeaders = HashMap<String, String>;

/// The contract API clients use to authenticate outbound requests.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Returns headers for the next request, refreshing the access token
    /// first if it is about to expire.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::NotAuthenticated`] when no usable token is
    /// available and [`HteAuthError::TokenRefresh`] when the provider
    /// rejects a refresh.
    async fn get_auth_headers(&self) -> Result<AuthHeaders>;

    /// `true` when a token set is stored, expired or not.
    fn is_authenticated(&self) -> bool;

    /// Adds the authentication headers to a `reqwest` request.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`AuthStrategy::get_auth_headers`].
    async fn apply_auth(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let headers = self.get_auth_headers().await?;
        Ok(headers
            .into_iter()
            .fold(request, |request, (name, value)| request.header(name, value)))
    }
}

type RefreshFuture = Shared<BoxFuture<'static, std::result::Result<TokenSet, HteAuthError>>>;

/// Refresh single-flight state.
enum RefreshState {
    Idle,
    Refreshing(RefreshFuture),
}

// ---------------------------------------------------------------------------
// OAuthStrategy
// ---------------------------------------------------------------------------

/// OAuth 2.0 strategy for one identity provider.
///
/// Construct one per provider and share it through an `Arc`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use hte_auth::auth::flow::TokenEndpointClient;
/// use hte_auth::auth::strategy::{AuthStrategy, OAuthStrategy};
/// use hte_auth::auth::token_store::MemoryTokenStore;
/// use hte_auth::config::IdpConfig;
///
/// let client = TokenEndpointClient::new(IdpConfig::primary_default()).unwrap();
/// let strategy = OAuthStrategy::new(client, Arc::new(MemoryTokenStore::new()));
/// assert!(!strategy.is_authenticated());
/// ```
pub struct OAuthStrategy {
    client: TokenEndpointClient,
    store: Arc<dyn TokenStore>,
    refresh: Arc<Mutex<RefreshState>>,
}

impl std::fmt::Debug for OAuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthStrategy")
            .field("idp", &self.client.idp().name)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl OAuthStrategy {
    /// Creates a strategy around an existing client and store.
    pub fn new(client: TokenEndpointClient, store: Arc<dyn TokenStore>) -> Self {
        Self {
            client,
            store,
            refresh: Arc::new(Mutex::new(RefreshState::Idle)),
        }
    }

    /// Strategy for the primary provider, with tokens held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Config`] when no primary client id is
    /// configured or the HTTP client cannot be built.
    pub fn primary(config: &Config) -> Result<Self> {
        if config.primary.static_client_id().is_none() {
            return Err(HteAuthError::Config(
                "primary client id is required (set HSID_CLIENT_ID)".to_string(),
            )
            .into());
        }
        let client = TokenEndpointClient::new(config.primary.clone())?;
        Ok(Self::new(client, Arc::new(MemoryTokenStore::new())))
    }

    /// Strategy for the secondary provider, with tokens persisted at
    /// [`Config::token_path`].
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Config`] when the token path cannot be
    /// resolved or the HTTP client cannot be built.
    pub fn secondary(config: &Config) -> Result<Self> {
        let path = config.token_path()?;
        let store = FileTokenStore::open(
            path,
            config.secondary.static_client_id().map(str::to_string),
        );
        let client = TokenEndpointClient::new(config.secondary.clone())?;
        Ok(Self::new(client, Arc::new(store)))
    }

    /// The token endpoint client bound to this provider.
    pub fn client(&self) -> &TokenEndpointClient {
        &self.client
    }

    /// The underlying token store.
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Client identifier for this provider: the configured one, else the
    /// one persisted with the tokens.
    pub fn client_id(&self) -> Option<String> {
        self.client
            .idp()
            .static_client_id()
            .map(str::to_string)
            .or_else(|| self.store.client_id())
    }

    /// Seeds the store with tokens obtained elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenStorage`] if the store cannot save them.
    pub fn set_tokens(&self, tokens: TokenSet) -> Result<()> {
        self.store.set(tokens)
    }

    /// Stores the tokens of a completed authorization together with the
    /// client identifier they were issued to.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenStorage`] if the store cannot save them.
    pub fn complete_authorization(&self, client_id: &str, tokens: TokenSet) -> Result<()> {
        self.store.set_with_client_id(client_id, tokens)?;
        tracing::info!("{} connection established", self.client.idp().name);
        Ok(())
    }

    /// Discards all local token state.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenStorage`] if persisted tokens cannot be
    /// removed.
    pub fn sign_out(&self) -> Result<()> {
        self.store.clear()?;
        tracing::info!("Signed out of {}", self.client.idp().name);
        Ok(())
    }

    /// Returns a token set that is outside the expiry buffer, joining or
    /// starting a refresh when needed.
    async fn current_tokens(&self) -> Result<TokenSet> {
        let tokens = self.store.get().ok_or(HteAuthError::NotAuthenticated)?;
        if !tokens.is_expired() {
            return Ok(tokens);
        }

        let pending = {
            let mut state = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
            let joined = match &*state {
                RefreshState::Refreshing(pending) => Some(pending.clone()),
                RefreshState::Idle => None,
            };
            match joined {
                Some(pending) => {
                    tracing::debug!("Joining in-flight {} refresh", self.client.idp().name);
                    pending
                }
                None => {
                    // A refresh may have settled since the store was read.
                    let current = self.store.get().ok_or(HteAuthError::NotAuthenticated)?;
                    if !current.is_expired() {
                        return Ok(current);
                    }
                    if current.usable_refresh_token().is_none() {
                        tracing::debug!(
                            "{} token expired and no refresh token is stored",
                            self.client.idp().name
                        );
                        return Err(HteAuthError::NotAuthenticated.into());
                    }
                    let pending = self.start_refresh(current);
                    *state = RefreshState::Refreshing(pending.clone());
                    pending
                }
            }
        };

        pending.await.map_err(Into::into)
    }

    /// Spawns the refresh onto the runtime and returns a shareable handle to
    /// its outcome.
    ///
    /// The task settles the store and resets the state to idle even when
    /// every caller awaiting the handle has been cancelled.
    fn start_refresh(&self, current: TokenSet) -> RefreshFuture {
        let client = self.client.clone();
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.refresh);
        let client_id = self.client_id();
        let idp = client.idp().name.clone();

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let outcome = run_refresh(&client, &*store, client_id, &current).await;
                *state.lock().unwrap_or_else(PoisonError::into_inner) = RefreshState::Idle;
                outcome
            })
        };

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    tracing::error!("{} refresh task failed: {}", idp, join_err);
                    *state.lock().unwrap_or_else(PoisonError::into_inner) = RefreshState::Idle;
                    Err(HteAuthError::TokenRefresh {
                        status: None,
                        body: format!("refresh task failed: {join_err}"),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[async_trait]
impl AuthStrategy for OAuthStrategy {
    async fn get_auth_headers(&self) -> Result<AuthHeaders> {
        let tokens = self.current_tokens().await?;
        Ok(HashMap::from([(
            "Authorization".to_string(),
            tokens.authorization_value(),
        )]))
    }

    fn is_authenticated(&self) -> bool {
        self.store.get().is_some()
    }
}

/// Performs one refresh and applies its outcome to the store.
async fn run_refresh(
    client: &TokenEndpointClient,
    store: &dyn TokenStore,
    client_id: Option<String>,
    current: &TokenSet,
) -> std::result::Result<TokenSet, HteAuthError> {
    let client_id = client_id.ok_or(HteAuthError::NotAuthenticated)?;

    match client.refresh(&client_id, current).await {
        Ok(tokens) => {
            store
                .set_with_client_id(&client_id, tokens.clone())
                .map_err(|e| into_auth_error(e, HteAuthError::TokenStorage))?;
            Ok(tokens)
        }
        Err(e) => {
            let err = into_auth_error(e, |body| HteAuthError::TokenRefresh { status: None, body });
            if matches!(err, HteAuthError::TokenRefresh { .. }) {
                tracing::warn!(
                    "{} refresh rejected, clearing stored tokens: {}",
                    client.idp().name,
                    err
                );
                if let Err(clear_err) = store.clear() {
                    tracing::warn!("Failed to clear tokens after rejected refresh: {}", clear_err);
                }
            }
            Err(err)
        }
    }
}

fn into_auth_error(err: anyhow::Error, fallback: impl FnOnce(String) -> HteAuthError) -> HteAuthError {
    match err.downcast::<HteAuthError>() {
        Ok(typed) => typed,
        Err(other) => fallback(other.to_string()),
    }
}
