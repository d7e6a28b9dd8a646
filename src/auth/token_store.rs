//! Token sets and their storage
//!
//! A [`TokenSet`] is the credential material issued by one identity
//! provider.  Storage is abstracted behind the [`TokenStore`] trait with two
//! implementations:
//!
//! - [`MemoryTokenStore`] keeps the token set in process memory only.
//! - [`FileTokenStore`] persists a [`PersistedTokenSet`] (token set plus the
//!   client identifier it was issued to) as a single JSON file.  Writes go to
//!   a temporary file in the same directory which is then renamed over the
//!   target, so a reader never observes a half-written file.
//!
//! The persisted JSON uses camelCase keys and stores `expiresAt` as epoch
//! milliseconds.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HteAuthError, Result};

/// Safety margin subtracted from `expires_at` when deciding expiry.
pub const EXPIRY_BUFFER_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// TokenSet
// ---------------------------------------------------------------------------

/// Tokens issued by an identity provider.
///
/// `expires_at` is always computed locally as the time the token request was
/// issued plus the `expires_in` seconds returned by the provider.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use hte_auth::auth::token_store::TokenSet;
///
/// let tokens = TokenSet::new("access", Utc::now() + Duration::hours(1));
/// assert_eq!(tokens.token_type, "Bearer");
/// assert!(!tokens.is_expired());
/// assert_eq!(tokens.authorization_value(), "Bearer access");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    /// The access token presented to resource servers.
    pub access_token: String,

    /// Refresh token used to obtain a new access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// OpenID Connect ID token, when the provider issues one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Absolute expiry of the access token.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,

    /// Token type used in the `Authorization` header.
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Space-separated scopes granted by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenSet {
    /// Creates a bearer token set with no refresh token, ID token or scope.
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            id_token: None,
            expires_at,
            token_type: default_token_type(),
            scope: None,
        }
    }

    /// Returns `true` when the token is expired or within the 60-second
    /// buffer before expiry.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry check against an explicit clock reading.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{Duration, Utc};
    /// use hte_auth::auth::token_store::TokenSet;
    ///
    /// let now = Utc::now();
    /// let tokens = TokenSet::new("a", now + Duration::seconds(120));
    /// assert!(!tokens.is_expired_at(now));
    /// assert!(tokens.is_expired_at(now + Duration::seconds(60)));
    /// ```
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::seconds(EXPIRY_BUFFER_SECS)
    }

    /// Returns `true` when `now` is strictly before the hard expiry, with no
    /// buffer applied.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// The usable refresh token, treating an empty string as absent.
    pub fn usable_refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }

    /// `"<token_type> <access_token>"`, the `Authorization` header value.
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// A [`TokenSet`] together with the client identifier it was issued to.
///
/// The secondary provider's client identity may have been registered
/// dynamically, so it has to survive process restarts alongside the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTokenSet {
    /// Client identifier used for the exchange and later refreshes.
    pub client_id: String,

    /// The token material.
    #[serde(flatten)]
    pub tokens: TokenSet,
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

/// Storage for the current token set of one identity provider.
pub trait TokenStore: Send + Sync {
    /// Replaces the stored token set.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenStorage`] if durable storage fails.
    fn set(&self, tokens: TokenSet) -> Result<()>;

    /// Returns the stored token set, if any.
    fn get(&self) -> Option<TokenSet>;

    /// Removes the stored token set.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenStorage`] if durable storage fails.
    fn clear(&self) -> Result<()>;

    /// Client identifier recorded with the tokens, if the store tracks one.
    fn client_id(&self) -> Option<String> {
        None
    }

    /// Replaces the stored token set and records the client identifier it
    /// was issued to.  Stores that do not track client identity ignore it.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenStorage`] if durable storage fails.
    fn set_with_client_id(&self, client_id: &str, tokens: TokenSet) -> Result<()> {
        let _ = client_id;
        self.set(tokens)
    }

    /// `true` when nothing is stored or the stored token is within the
    /// expiry buffer.
    fn is_expired(&self) -> bool {
        self.get().map_or(true, |t| t.is_expired())
    }

    /// `true` when the stored token set carries a usable refresh token.
    fn has_refresh_token(&self) -> bool {
        self.get()
            .is_some_and(|t| t.usable_refresh_token().is_some())
    }
}

// ---------------------------------------------------------------------------
// MemoryTokenStore
// ---------------------------------------------------------------------------

/// Process-memory token storage.  Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<Option<TokenSet>>,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn set(&self, tokens: TokenSet) -> Result<()> {
        let mut guard = self
            .tokens
            .write()
            .map_err(|_| HteAuthError::TokenStorage("token lock poisoned".to_string()))?;
        *guard = Some(tokens);
        Ok(())
    }

    fn get(&self) -> Option<TokenSet> {
        self.tokens.read().ok().and_then(|guard| guard.clone())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .tokens
            .write()
            .map_err(|_| HteAuthError::TokenStorage("token lock poisoned".to_string()))?;
        *guard = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileTokenStore
// ---------------------------------------------------------------------------

/// Disk-persisted token storage for the secondary provider.
///
/// Every read goes to the file, so tokens written or removed by another
/// process (`hte-auth logout`, `hte-auth headers`) are observed on the next
/// call.  Mutations rewrite the whole file atomically and are serialized
/// within the process.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    default_client_id: Option<String>,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    /// Opens the store at `path`.
    ///
    /// Nothing is read until the first lookup.  A missing or unparsable file
    /// is treated as "not authenticated".  `default_client_id` is recorded
    /// with tokens passed to [`TokenStore::set`] when no client identifier is
    /// known yet.
    pub fn open(path: impl Into<PathBuf>, default_client_id: Option<String>) -> Self {
        Self {
            path: path.into(),
            default_client_id,
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and parses a token file.
    ///
    /// Returns `None` when the file does not exist or cannot be parsed.
    pub fn read_file(path: &Path) -> Option<PersistedTokenSet> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read token file {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unparsable token file {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    /// Returns the record currently on disk, if any.
    pub fn load(&self) -> Option<PersistedTokenSet> {
        Self::read_file(&self.path)
    }

    /// Atomically overwrites the token file with `record`.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenStorage`] if the directory cannot be
    /// created or the file cannot be written or renamed into place.
    pub fn save(&self, record: &PersistedTokenSet) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| HteAuthError::TokenStorage(format!("serialize tokens: {e}")))?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_atomic(&self.path, &json)?;

        tracing::debug!("Persisted tokens to {}", self.path.display());
        Ok(())
    }

    /// Deletes the token file.  A file that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`HteAuthError::TokenStorage`] if the file exists but cannot
    /// be removed.
    pub fn remove(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(HteAuthError::TokenStorage(format!(
                    "remove {}: {e}",
                    self.path.display()
                ))
                .into())
            }
        }
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn set(&self, tokens: TokenSet) -> Result<()> {
        let client_id = self.client_id().ok_or_else(|| {
            HteAuthError::TokenStorage("no client id known for persisted tokens".to_string())
        })?;
        self.save(&PersistedTokenSet { client_id, tokens })
    }

    fn get(&self) -> Option<TokenSet> {
        self.load().map(|record| record.tokens)
    }

    fn clear(&self) -> Result<()> {
        self.remove()
    }

    fn client_id(&self) -> Option<String> {
        self.load()
            .map(|record| record.client_id)
            .filter(|id| !id.is_empty())
            .or_else(|| self.default_client_id.clone())
    }

    fn set_with_client_id(&self, client_id: &str, tokens: TokenSet) -> Result<()> {
        self.save(&PersistedTokenSet {
            client_id: client_id.to_string(),
            tokens,
        })
    }
}

/// Writes `bytes` to a temporary sibling of `path`, syncs it, and renames it
/// over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| HteAuthError::TokenStorage(format!("create {}: {e}", dir.display())))?;

    // NamedTempFile is created with owner-only permissions on unix.
    let mut tmp = tempfile::Builder::new()
        .prefix(".tokens-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| HteAuthError::TokenStorage(format!("create temp file: {e}")))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| HteAuthError::TokenStorage(format!("write temp file: {e}")))?;
    tmp.persist(path)
        .map_err(|e| HteAuthError::TokenStorage(format!("rename into {}: {e}", path.display())))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
