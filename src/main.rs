//! hte-auth - OAuth 2.0 PKCE connection manager
//!
#![doc = "hte-auth - OAuth 2.0 PKCE connection manager"]
#![doc = "Main entry point for the hte-auth command-line tool."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hte_auth::cli::{Cli, Commands};
use hte_auth::commands;
use hte_auth::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/hte-auth.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting callback server");
            commands::serve::run_serve(config).await
        }
        Commands::Login { no_browser } => {
            tracing::info!("Starting browser login");
            commands::login::run_login(config, no_browser).await
        }
        Commands::Status { json } => commands::status::run_status(config, json),
        Commands::Logout => commands::logout::run_logout(config),
        Commands::Headers => commands::headers::run_headers(config).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "hte_auth=debug" } else { "hte_auth=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
