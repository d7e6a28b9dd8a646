//! Command-line interface definition for hte-auth
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to run the callback server, sign in, inspect and
//! clear the persisted connection.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// hte-auth - OAuth 2.0 PKCE connection manager
///
/// Connects the HTE assistant to its identity providers and keeps the
/// resulting tokens fresh.
#[derive(Parser, Debug, Clone)]
#[command(name = "hte-auth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/hte-auth.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the persisted token file location
    #[arg(long)]
    pub token_path: Option<PathBuf>,

    /// Override the callback server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for hte-auth
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the connection status page and OAuth callback server
    Serve,

    /// Connect to HealthEx through the browser and wait for tokens
    Login {
        /// Print the connect URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Show the persisted connection status
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove the persisted tokens
    Logout,

    /// Print the Authorization header for the HealthEx connection
    Headers,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
