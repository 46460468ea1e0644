//! PKCE S256 challenge generation (RFC 7636)
//!
//! The authorization-code flow is hardened with Proof Key for Code
//! Exchange: the broker generates a high-entropy `code_verifier`, sends
//! its SHA-256 digest as the `code_challenge` on the authorization
//! request, and proves possession by sending the original verifier on
//! the token exchange.
//!
//! This module also produces the random `state` nonces used for CSRF
//! protection on the redirect dance; both values are 32 random bytes in
//! base64url without padding.

use base64::Engine as _;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// PkceChallenge
// ---------------------------------------------------------------------------

/// A PKCE S256 pair: the verifier and its derived challenge.
///
/// The verifier is kept in the pending authorization state until the
/// callback arrives; the challenge travels in the authorization URL.
///
/// # Examples
///
/// ```
/// use capbroker::auth::pkce::PkceChallenge;
///
/// let pkce = PkceChallenge::generate();
/// assert_eq!(pkce.verifier.len(), 43);
/// assert_ne!(pkce.verifier, pkce.challenge);
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Base64url-encoded (no padding) random string of exactly 43
    /// characters derived from 32 random bytes. Sent to the token
    /// endpoint as `code_verifier`.
    pub verifier: String,

    /// Base64url-encoded (no padding) SHA-256 digest of the verifier's
    /// UTF-8 bytes. Sent to the authorization endpoint as
    /// `code_challenge` with `code_challenge_method=S256`.
    pub challenge: String,
}

impl PkceChallenge {
    /// Generates a fresh S256 pair.
    ///
    /// RFC 7636 section 4.2:
    /// `challenge = BASE64URL(SHA256(ASCII(code_verifier)))`.
    pub fn generate() -> Self {
        let verifier = random_token();
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice());
        Self {
            verifier,
            challenge,
        }
    }
}

/// Generates a random `state` nonce for the authorization redirect.
///
/// Each authorization attempt gets an independent nonce, so concurrent
/// flows for different users against the same server never collide.
pub fn generate_state() -> String {
    random_token()
}

/// 32 cryptographically random bytes as unpadded base64url (43 chars).
fn random_token() -> String {
    use rand::RngCore as _;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
