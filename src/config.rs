//! Configuration management for hte-auth
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//!
//! Two identity providers are configured side by side:
//!
//! - `primary`   -- the statically registered OpenID Connect provider (HSID).
//!   Tokens are kept in process memory only.
//! - `secondary` -- the dynamically registered OAuth provider (HealthEx).
//!   Tokens and the client identifier are persisted to disk.

use crate::error::{HteAuthError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Default HSID issuer used when `HSID_ISSUER_URL` is not set.
pub const DEFAULT_HSID_ISSUER: &str = "https://nonprod.identity.healthsafe-id.com";

/// Default HealthEx API origin.
pub const DEFAULT_HEALTHEX_BASE: &str = "https://api.healthex1.io";

/// Smallest accepted PKCE verifier entropy in bytes (43 encoded characters).
pub const MIN_VERIFIER_BYTES: usize = 32;

/// Largest accepted PKCE verifier entropy in bytes (128 encoded characters).
pub const MAX_VERIFIER_BYTES: usize = 96;

/// Main configuration structure for hte-auth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Statically registered OpenID Connect provider
    #[serde(default = "IdpConfig::primary_default")]
    pub primary: IdpConfig,

    /// Dynamically registered OAuth provider
    #[serde(default = "IdpConfig::secondary_default")]
    pub secondary: IdpConfig,

    /// Local callback server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Endpoints and client settings for one identity provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdpConfig {
    /// Human-readable provider name used in logs and pages
    pub name: String,

    /// Authorization endpoint the browser is redirected to
    pub authorize_endpoint: Url,

    /// Token endpoint for code exchange and refresh
    pub token_endpoint: Url,

    /// Dynamic client registration endpoint (RFC 7591), if supported
    #[serde(default)]
    pub registration_endpoint: Option<Url>,

    /// Statically configured client identifier
    #[serde(default)]
    pub client_id: Option<String>,

    /// Client name sent during dynamic registration
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Redirect URI registered with the provider
    pub redirect_uri: Url,

    /// Space-separated scopes requested at authorize time
    pub scope: String,

    /// Random bytes behind each PKCE verifier
    #[serde(default = "default_verifier_bytes")]
    pub verifier_bytes: usize,

    /// Timeout applied to every token endpoint call (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_client_name() -> String {
    "HTE Local Dev".to_string()
}

fn default_verifier_bytes() -> usize {
    MIN_VERIFIER_BYTES
}

fn default_request_timeout() -> u64 {
    30
}

impl IdpConfig {
    /// Default settings for the HSID OpenID Connect provider.
    pub fn primary_default() -> Self {
        Self::hsid(DEFAULT_HSID_ISSUER, "http://localhost:4111/auth/callback")
    }

    /// Default settings for the HealthEx OAuth provider.
    pub fn secondary_default() -> Self {
        Self::healthex(DEFAULT_HEALTHEX_BASE, "http://localhost:4222/healthex/callback")
    }

    /// Builds the HSID provider settings from an issuer URL.
    ///
    /// The authorize and token endpoints live under `<issuer>/oidc/`.
    ///
    /// # Panics
    ///
    /// Never panics for the compiled-in defaults; callers passing user input
    /// should use [`IdpConfig::hsid_from_issuer`] instead.
    fn hsid(issuer: &str, redirect_uri: &str) -> Self {
        Self::hsid_from_issuer(issuer, redirect_uri).expect("built-in HSID URLs are valid")
    }

    /// Builds the HSID provider settings from an issuer URL supplied at
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Config`] if the issuer or redirect URI does
    /// not parse.
    pub fn hsid_from_issuer(issuer: &str, redirect_uri: &str) -> Result<Self> {
        let issuer = issuer.trim_end_matches('/');
        Ok(Self {
            name: "HSID".to_string(),
            authorize_endpoint: parse_url(&format!("{issuer}/oidc/authorize"))?,
            token_endpoint: parse_url(&format!("{issuer}/oidc/token"))?,
            registration_endpoint: None,
            client_id: None,
            client_name: default_client_name(),
            redirect_uri: parse_url(redirect_uri)?,
            scope: "openid profile".to_string(),
            verifier_bytes: MIN_VERIFIER_BYTES,
            request_timeout_secs: default_request_timeout(),
        })
    }

    fn healthex(base: &str, redirect_uri: &str) -> Self {
        let base = base.trim_end_matches('/');
        let url = |s: String| Url::parse(&s).expect("built-in HealthEx URLs are valid");
        Self {
            name: "HealthEx".to_string(),
            authorize_endpoint: url(format!("{base}/oauth/authorize")),
            token_endpoint: url(format!("{base}/oauth/token")),
            registration_endpoint: Some(url(format!("{base}/oauth/register"))),
            client_id: None,
            client_name: default_client_name(),
            redirect_uri: url(redirect_uri.to_string()),
            scope: "patient/*.read offline_access".to_string(),
            verifier_bytes: 64,
            request_timeout_secs: default_request_timeout(),
        }
    }

    /// Returns the configured client identifier, ignoring blank values.
    pub fn static_client_id(&self) -> Option<&str> {
        self.client_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    fn validate(&self, field: &str) -> Result<()> {
        for (label, url) in [
            ("authorize_endpoint", Some(&self.authorize_endpoint)),
            ("token_endpoint", Some(&self.token_endpoint)),
            ("registration_endpoint", self.registration_endpoint.as_ref()),
            ("redirect_uri", Some(&self.redirect_uri)),
        ] {
            if let Some(url) = url {
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(HteAuthError::Config(format!(
                        "{field}.{label} must be an http(s) URL, got: {url}"
                    ))
                    .into());
                }
            }
        }

        if self.redirect_uri.path().is_empty() || self.redirect_uri.path() == "/" {
            return Err(HteAuthError::Config(format!(
                "{field}.redirect_uri must include a callback path"
            ))
            .into());
        }

        if self.scope.trim().is_empty() {
            return Err(HteAuthError::Config(format!("{field}.scope cannot be empty")).into());
        }

        if !(MIN_VERIFIER_BYTES..=MAX_VERIFIER_BYTES).contains(&self.verifier_bytes) {
            return Err(HteAuthError::Config(format!(
                "{field}.verifier_bytes must be between {MIN_VERIFIER_BYTES} and {MAX_VERIFIER_BYTES}"
            ))
            .into());
        }

        if self.request_timeout_secs == 0 {
            return Err(HteAuthError::Config(format!(
                "{field}.request_timeout_secs must be greater than 0"
            ))
            .into());
        }

        Ok(())
    }
}

/// Local callback server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Interface the callback server binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port override; defaults to the port of the secondary redirect URI
    #[serde(default)]
    pub port: Option<u16>,

    /// Prefix of the status and connect routes
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Location of the persisted secondary token file
    ///
    /// Defaults to `~/.hte/healthex-tokens.json`.
    #[serde(default)]
    pub token_path: Option<PathBuf>,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_route_prefix() -> String {
    "/healthex".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: None,
            route_prefix: default_route_prefix(),
            token_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed, or if
    /// an environment variable carries an unparsable URL.
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars()?;
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HteAuthError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&contents)
    }

    /// Parses a YAML document into a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Config`] when the document is not valid.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| HteAuthError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) -> Result<()> {
        // Primary (HSID) overrides
        let issuer = std::env::var("HSID_ISSUER_URL").ok();
        let hsid_redirect = std::env::var("HSID_REDIRECT_URI").ok();
        if issuer.is_some() || hsid_redirect.is_some() {
            let redirect = hsid_redirect.unwrap_or_else(|| self.primary.redirect_uri.to_string());
            let rebuilt = match issuer {
                Some(issuer) => IdpConfig::hsid_from_issuer(&issuer, &redirect)?,
                None => IdpConfig {
                    redirect_uri: parse_url(&redirect)?,
                    ..self.primary.clone()
                },
            };
            self.primary = IdpConfig {
                client_id: self.primary.client_id.take(),
                request_timeout_secs: self.primary.request_timeout_secs,
                ..rebuilt
            };
            tracing::debug!("Overrode primary IdP endpoints from HSID_* env vars");
        }
        if let Ok(client_id) = std::env::var("HSID_CLIENT_ID") {
            self.primary.client_id = Some(client_id);
        }

        // Secondary (HealthEx) overrides
        if let Ok(client_id) = std::env::var("HEALTHEX_CLIENT_ID") {
            self.secondary.client_id = Some(client_id);
        }
        if let Ok(redirect) = std::env::var("HEALTHEX_REDIRECT_URI") {
            self.secondary.redirect_uri = parse_url(&redirect)?;
        }

        if let Ok(path) = std::env::var("HTE_AUTH_TOKEN_PATH") {
            self.server.token_path = Some(PathBuf::from(path));
        }

        if let Ok(timeout) = std::env::var("HTE_AUTH_TIMEOUT_SECONDS") {
            match timeout.parse::<u64>() {
                Ok(secs) => {
                    self.primary.request_timeout_secs = secs;
                    self.secondary.request_timeout_secs = secs;
                }
                Err(_) => {
                    tracing::warn!("Ignoring invalid HTE_AUTH_TIMEOUT_SECONDS: {}", timeout)
                }
            }
        }

        Ok(())
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(path) = &cli.token_path {
            self.server.token_path = Some(path.clone());
        }
        if let Some(port) = cli.port {
            self.server.port = Some(port);
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        self.primary.validate("primary")?;
        self.secondary.validate("secondary")?;

        if !self.server.route_prefix.starts_with('/') {
            return Err(HteAuthError::Config(
                "server.route_prefix must start with '/'".to_string(),
            )
            .into());
        }

        if self.server.bind_host.trim().is_empty() {
            return Err(
                HteAuthError::Config("server.bind_host cannot be empty".to_string()).into(),
            );
        }

        Ok(())
    }

    /// Port the callback server listens on.
    ///
    /// Uses the explicit override, then the secondary redirect URI port,
    /// then `4222`.
    pub fn server_port(&self) -> u16 {
        self.server
            .port
            .or_else(|| self.secondary.redirect_uri.port_or_known_default())
            .unwrap_or(4222)
    }

    /// Path of the persisted secondary token file.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::Config`] when no override is set and the home
    /// directory cannot be determined.
    pub fn token_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.server.token_path {
            return Ok(path.clone());
        }
        let dirs = directories::BaseDirs::new().ok_or_else(|| {
            HteAuthError::Config("Could not determine home directory".to_string())
        })?;
        Ok(dirs.home_dir().join(".hte").join("healthex-tokens.json"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary: IdpConfig::primary_default(),
            secondary: IdpConfig::secondary_default(),
            server: ServerConfig::default(),
        }
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| HteAuthError::Config(format!("invalid URL '{raw}': {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "HSID_ISSUER_URL",
            "HSID_CLIENT_ID",
            "HSID_REDIRECT_URI",
            "HEALTHEX_CLIENT_ID",
            "HEALTHEX_REDIRECT_URI",
            "HTE_AUTH_TOKEN_PATH",
            "HTE_AUTH_TIMEOUT_SECONDS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.primary.token_endpoint.as_str(),
            "https://nonprod.identity.healthsafe-id.com/oidc/token"
        );
        assert_eq!(config.primary.scope, "openid profile");
        assert_eq!(config.primary.verifier_bytes, 32);
        assert_eq!(
            config.secondary.registration_endpoint.as_ref().map(Url::as_str),
            Some("https://api.healthex1.io/oauth/register")
        );
        assert_eq!(config.secondary.scope, "patient/*.read offline_access");
        assert_eq!(config.secondary.verifier_bytes, 64);
        assert_eq!(config.server_port(), 4222);
    }

    #[test]
    fn test_config_validation_success() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_rejects_small_verifier() {
        let mut config = Config::default();
        config.secondary.verifier_bytes = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_zero_timeout() {
        let mut config = Config::default();
        config.primary.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_redirect_without_path() {
        let mut config = Config::default();
        config.secondary.redirect_uri = Url::parse("http://localhost:4222/").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_relative_prefix() {
        let mut config = Config::default();
        config.server.route_prefix = "healthex".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_static_client_id_ignores_blank() {
        let mut idp = IdpConfig::secondary_default();
        idp.client_id = Some("  ".to_string());
        assert_eq!(idp.static_client_id(), None);
        idp.client_id = Some("abc".to_string());
        assert_eq!(idp.static_client_id(), Some("abc"));
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
primary:
  name: HSID
  authorize_endpoint: https://idp.example.com/oidc/authorize
  token_endpoint: https://idp.example.com/oidc/token
  client_id: primary-client
  redirect_uri: http://localhost:4111/auth/callback
  scope: openid profile
server:
  port: 5000
  token_path: /tmp/tokens.json
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.primary.static_client_id(), Some("primary-client"));
        assert_eq!(config.primary.request_timeout_secs, 30);
        assert_eq!(config.secondary, IdpConfig::secondary_default());
        assert_eq!(config.server_port(), 5000);
        assert_eq!(config.server.route_prefix, "/healthex");
        assert_eq!(
            config.token_path().unwrap(),
            PathBuf::from("/tmp/tokens.json")
        );
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let config = Config::from_yaml(include_str!("../config/hte-auth.example.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.primary, IdpConfig::primary_default());
        assert_eq!(config.secondary, IdpConfig::secondary_default());
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = Config::from_yaml("primary: [").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HteAuthError>(),
            Some(HteAuthError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("HSID_ISSUER_URL", "https://issuer.example.com/");
        std::env::set_var("HSID_CLIENT_ID", "hsid-client");
        std::env::set_var("HEALTHEX_CLIENT_ID", "hx-client");
        std::env::set_var("HEALTHEX_REDIRECT_URI", "http://localhost:4999/hx/cb");
        std::env::set_var("HTE_AUTH_TIMEOUT_SECONDS", "5");

        let mut config = Config::default();
        config.apply_env_vars().unwrap();
        clear_env();

        assert_eq!(
            config.primary.authorize_endpoint.as_str(),
            "https://issuer.example.com/oidc/authorize"
        );
        assert_eq!(config.primary.static_client_id(), Some("hsid-client"));
        assert_eq!(config.secondary.static_client_id(), Some("hx-client"));
        assert_eq!(config.server_port(), 4999);
        assert_eq!(config.primary.request_timeout_secs, 5);
        assert_eq!(config.secondary.request_timeout_secs, 5);
    }

    #[test]
    #[serial]
    fn test_env_invalid_redirect_is_error() {
        clear_env();
        std::env::set_var("HEALTHEX_REDIRECT_URI", "not a url");
        let mut config = Config::default();
        let result = config.apply_env_vars();
        clear_env();
        assert!(result.is_err());
    }
}
