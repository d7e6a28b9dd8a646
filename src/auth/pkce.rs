//! PKCE S256 challenge generation and verification
//!
//! This module implements the Proof Key for Code Exchange (PKCE) extension
//! to OAuth 2.0 as defined in RFC 7636, using the `S256` challenge method
//! only.  It also produces the one-time `state` values that correlate a
//! browser callback with the session that started it.
//!
//! # How PKCE works
//!
//! 1. The client generates a high-entropy random string called the `code_verifier`.
//! 2. The client computes a SHA-256 hash of the verifier and base64url-encodes
//!    it to produce the `code_challenge`.
//! 3. The authorization request includes `code_challenge` and
//!    `code_challenge_method=S256`.
//! 4. The token exchange request includes the original `code_verifier`.
//! 5. The authorization server recomputes the challenge and compares it to
//!    the value sent in step 3, proving possession of the verifier.
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>

use base64::Engine as _;
use rand::TryRngCore as _;
use sha2::{Digest, Sha256};

use crate::config::{MAX_VERIFIER_BYTES, MIN_VERIFIER_BYTES};
use crate::error::{HteAuthError, Result};

/// The only challenge method this crate emits.
pub const CHALLENGE_METHOD: &str = "S256";

/// Random bytes behind each `state` value.
const STATE_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// PkceChallenge
// ---------------------------------------------------------------------------

/// A PKCE S256 challenge pair consisting of a verifier and its derived
/// challenge value.
///
/// # Examples
///
/// ```
/// use hte_auth::auth::pkce::generate;
///
/// let pkce = generate().expect("PKCE generation must not fail");
/// assert_eq!(pkce.method, "S256");
/// assert_eq!(pkce.verifier.len(), 43);
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The code verifier: random bytes encoded as base64url without padding.
    ///
    /// Sent to the token endpoint as `code_verifier` during the code
    /// exchange.  Never reused across authorization attempts.
    pub verifier: String,

    /// The base64url-encoded (no padding) SHA-256 digest of the verifier.
    ///
    /// Sent to the authorization endpoint as `code_challenge`.
    pub challenge: String,

    /// The challenge method.  Always `"S256"`.
    pub method: String,
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Generates a fresh PKCE S256 challenge from 32 random bytes.
///
/// # Errors
///
/// Returns [`HteAuthError::PkceGeneration`] if the operating system random
/// number generator is unavailable.
///
/// # Examples
///
/// ```
/// use hte_auth::auth::pkce::{generate, verify_challenge};
///
/// let pkce = generate().unwrap();
/// assert!(verify_challenge(&pkce.verifier, &pkce.challenge));
/// assert_ne!(pkce.verifier, pkce.challenge);
/// ```
pub fn generate() -> Result<PkceChallenge> {
    generate_with_entropy(MIN_VERIFIER_BYTES)
}

/// Generates a fresh PKCE S256 challenge from `bytes` random bytes.
///
/// `bytes` must be within 32..=96 so that the encoded verifier is between
/// 43 and 128 characters long, as RFC 7636 section 4.1 requires.
///
/// # Errors
///
/// Returns [`HteAuthError::PkceGeneration`] if `bytes` is out of range or
/// the random number generator fails.
///
/// # Examples
///
/// ```
/// use hte_auth::auth::pkce::generate_with_entropy;
///
/// let pkce = generate_with_entropy(64).unwrap();
/// assert_eq!(pkce.verifier.len(), 86);
/// ```
pub fn generate_with_entropy(bytes: usize) -> Result<PkceChallenge> {
    if !(MIN_VERIFIER_BYTES..=MAX_VERIFIER_BYTES).contains(&bytes) {
        return Err(HteAuthError::PkceGeneration(format!(
            "verifier entropy must be between {MIN_VERIFIER_BYTES} and {MAX_VERIFIER_BYTES} bytes, got {bytes}"
        ))
        .into());
    }

    let verifier = random_base64url(bytes)?;
    let challenge = challenge_for(&verifier);

    Ok(PkceChallenge {
        verifier,
        challenge,
        method: CHALLENGE_METHOD.to_string(),
    })
}

/// Generates an unguessable, single-use `state` value.
///
/// # Errors
///
/// Returns [`HteAuthError::PkceGeneration`] if the random number generator
/// fails.
pub fn generate_state() -> Result<String> {
    random_base64url(STATE_BYTES)
}

/// Computes `BASE64URL(SHA256(verifier))` without padding.
///
/// RFC 7636 section 4.2: the digest is taken over the ASCII bytes of the
/// encoded verifier string, not over the raw random bytes.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Returns `true` when `challenge` is the S256 challenge of `verifier`.
pub fn verify_challenge(verifier: &str, challenge: &str) -> bool {
    challenge_for(verifier) == challenge
}

fn random_base64url(len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| HteAuthError::PkceGeneration(e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&buf))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
