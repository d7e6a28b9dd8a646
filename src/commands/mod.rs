/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

- `serve`   — Run the status page and OAuth callback server
- `login`   — One-shot browser login
- `status`  — Show the persisted connection
- `logout`  — Remove the persisted tokens
- `headers` — Print authenticated request headers

Every handler works on the secondary (HealthEx) connection; the primary
provider's tokens live only inside the process that obtained them.
*/

use crate::auth::callback_server::{CallbackServer, StartOutcome, TokenEvent};
use crate::auth::strategy::{AuthStrategy, OAuthStrategy};
use crate::auth::token_store::{FileTokenStore, PersistedTokenSet};
use crate::config::Config;
use crate::error::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use std::sync::Arc;

fn callback_server(config: &Config) -> Result<CallbackServer> {
    let strategy = Arc::new(OAuthStrategy::secondary(config)?);
    CallbackServer::new(strategy, config)
}

fn format_expiry(expires_at: DateTime<Utc>) -> String {
    expires_at
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S %Z")
        .to_string()
}

/// Attempts to open `url` in the user's default browser.
///
/// Returns `false` when no opener is available on this platform or it could
/// not be spawned; the caller then prints the URL instead.
pub fn try_open_browser(url: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn().is_ok()
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn().is_ok()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = url;
        false
    }
}

// Serve command handler
pub mod serve {
    //! Long-running callback server.

    use super::*;

    /// Serve the status page and callback routes until Ctrl-C.
    ///
    /// An instance already listening on the port is reported and treated as
    /// success.
    pub async fn run_serve(config: Config) -> Result<()> {
        let server = callback_server(&config)?;

        match server.start().await? {
            StartOutcome::Started(handle) => {
                println!(
                    "{} http://{}{}",
                    "Serving HealthEx connection page at".green(),
                    handle.local_addr(),
                    config.server.route_prefix
                );
                println!("Press Ctrl-C to stop.");

                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                handle.shutdown().await;
            }
            StartOutcome::AlreadyRunning => {
                println!(
                    "{}",
                    format!(
                        "A callback server is already listening on port {}.",
                        config.server_port()
                    )
                    .yellow()
                );
            }
        }

        Ok(())
    }
}

// Login command handler
pub mod login {
    //! One-shot browser login.
    //!
    //! Starts the callback server, sends the browser to the connect route and
    //! waits for the first [`TokenEvent::Issued`].

    use super::*;

    /// Connect the secondary provider through the browser.
    ///
    /// # Arguments
    ///
    /// * `config` - Global configuration (consumed)
    /// * `no_browser` - Print the connect URL instead of opening a browser
    pub async fn run_login(config: Config, no_browser: bool) -> Result<()> {
        let server = callback_server(&config)?;
        let connect_url = format!(
            "http://localhost:{}{}",
            config.server_port(),
            server.connect_path()
        );

        let mut events = server.subscribe();
        let handle = match server.start().await? {
            StartOutcome::Started(handle) => handle,
            StartOutcome::AlreadyRunning => {
                println!(
                    "{}",
                    "A callback server is already running; finish the login there:".yellow()
                );
                println!("  {}", connect_url);
                return Ok(());
            }
        };

        if no_browser || !try_open_browser(&connect_url) {
            println!("Open this URL in your browser to connect HealthEx:");
        } else {
            println!("Opening your browser to connect HealthEx. If it did not open, visit:");
        }
        println!("  {}", connect_url);

        let outcome = tokio::select! {
            event = events.recv() => event.ok(),
            _ = tokio::signal::ctrl_c() => None,
        };
        handle.shutdown().await;

        match outcome {
            Some(TokenEvent::Issued { expires_at, scope }) => {
                println!("{}", "HealthEx connected.".green().bold());
                println!("Scope:    {}", scope.as_deref().unwrap_or("(none)"));
                println!("Expires:  {}", format_expiry(expires_at));
            }
            None => println!("{}", "Login cancelled.".yellow()),
        }

        Ok(())
    }
}

// Status command handler
pub mod status {
    //! Persisted connection status.

    use super::*;

    /// Print the persisted connection status.
    pub fn run_status(config: Config, json: bool) -> Result<()> {
        let path = config.token_path()?;
        let record = FileTokenStore::read_file(&path);
        let connected = record
            .as_ref()
            .is_some_and(|r| r.tokens.is_live_at(Utc::now()));

        if json {
            let value = serde_json::json!({
                "connected": connected,
                "expiresAt": record.as_ref().map(|r| r.tokens.expires_at.timestamp_millis()),
                "scope": record.as_ref().and_then(|r| r.tokens.scope.clone()),
                "tokenPath": path.display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        print_status(&path, record.as_ref(), connected);
        Ok(())
    }

    fn print_status(path: &std::path::Path, record: Option<&PersistedTokenSet>, connected: bool) {
        println!("\nHealthEx Connection\n");
        println!("Token file:  {}", path.display());
        match record {
            None => println!("Status:      {}", "not connected".red()),
            Some(record) => {
                let status = if connected {
                    "connected".green()
                } else {
                    "expired".yellow()
                };
                println!("Status:      {}", status);
                println!("Expires:     {}", format_expiry(record.tokens.expires_at));
                println!(
                    "Scope:       {}",
                    record.tokens.scope.as_deref().unwrap_or("(none)")
                );
                println!(
                    "Refresh:     {}",
                    if record.tokens.usable_refresh_token().is_some() {
                        "available"
                    } else {
                        "none"
                    }
                );
            }
        }
        println!();
    }
}

// Logout command handler
pub mod logout {
    //! Removes the persisted connection.

    use super::*;

    /// Delete the persisted token file.
    pub fn run_logout(config: Config) -> Result<()> {
        let path = config.token_path()?;
        FileTokenStore::open(&path, None).remove()?;
        println!("{}", format!("Removed {}", path.display()).green());
        Ok(())
    }
}

// Headers command handler
pub mod headers {
    //! Authenticated request headers for scripting.

    use super::*;

    /// Print the headers for the secondary provider, refreshing if needed.
    ///
    /// This builds its own strategy, so a refresh is shared only with callers
    /// inside this process.  A running `serve` may refresh the same token
    /// concurrently; both read the token file on every lookup, so whichever
    /// write lands last is what the next caller sees.
    pub async fn run_headers(config: Config) -> Result<()> {
        let strategy = OAuthStrategy::secondary(&config)?;
        let mut headers: Vec<_> = strategy.get_auth_headers().await?.into_iter().collect();
        headers.sort();
        for (name, value) in headers {
            println!("{}: {}", name, value);
        }
        Ok(())
    }
}
