//! hte-auth - OAuth 2.0 connection manager library
//!
//! This library connects a local client application to two identity
//! providers using the authorization code flow with PKCE, and hands
//! authenticated request headers to API clients.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `auth`: PKCE, token storage, token endpoint client, auth strategy and
//!   the local callback server
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//! - `commands`: Handlers behind the CLI subcommands
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hte_auth::{AuthStrategy, Config, OAuthStrategy};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let healthex = Arc::new(OAuthStrategy::secondary(&config)?);
//!     let headers = healthex.get_auth_headers().await?;
//!     println!("{:?}", headers.keys());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use auth::callback_server::{CallbackServer, StartOutcome, TokenEvent};
pub use auth::strategy::{AuthHeaders, AuthStrategy, OAuthStrategy};
pub use auth::token_store::{TokenSet, TokenStore};
pub use config::Config;
pub use error::{HteAuthError, Result};
