//! Error types for hte-auth
//!
//! This module defines the error taxonomy of the authentication subsystem,
//! using `thiserror` for ergonomic error handling.
//!
//! Fallible functions return [`Result`], an `anyhow::Result`.  Callers that
//! need to branch on the failure kind recover the typed error with
//! `err.downcast_ref::<HteAuthError>()`.

use thiserror::Error;

/// Main error type for hte-auth operations
///
/// Every variant is cheap to clone so that the outcome of a single in-flight
/// token refresh can be handed to every caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HteAuthError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operating system random number generator was unavailable
    #[error("PKCE generation failed: {0}")]
    PkceGeneration(String),

    /// The identity provider rejected an authorization code exchange, or the
    /// exchange request did not complete.
    ///
    /// `status` is `None` when no HTTP response was received (connection
    /// failure or timeout).
    #[error("Token exchange failed ({}): {body}", status_label(.status))]
    TokenExchange {
        /// HTTP status returned by the token endpoint
        status: Option<u16>,
        /// Response body or transport error description
        body: String,
    },

    /// The identity provider rejected a refresh attempt, or the refresh
    /// request did not complete.
    #[error("Token refresh failed ({}): {body}", status_label(.status))]
    TokenRefresh {
        /// HTTP status returned by the token endpoint
        status: Option<u16>,
        /// Response body or transport error description
        body: String,
    },

    /// An OAuth callback could not be correlated with a pending session
    #[error("Invalid callback: state mismatch or no pending session")]
    StateMismatch,

    /// Dynamic client registration failed
    #[error("Client registration failed: {0}")]
    ClientRegistration(String),

    /// No usable token is available; the user must (re-)authenticate
    #[error("Not authenticated: no tokens available, authentication required")]
    NotAuthenticated,

    /// Token persistence errors (write, rename, remove)
    #[error("Token storage error: {0}")]
    TokenStorage(String),

    /// Callback server errors (bind, serve)
    #[error("Callback server error: {0}")]
    Server(String),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "no response".to_string(),
    }
}

/// Result type alias for hte-auth operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
