//! Proof Key for Code Exchange (RFC 7636) helpers

use std::fmt;

use aliri_base64::Base64Url;
use rand::{distributions::Alphanumeric, Rng};
use ring::digest;

use crate::CodeChallenge;

const MIN_VERIFIER_LEN: usize = 43;
const MAX_VERIFIER_LEN: usize = 128;

/// Generates a random string of alphanumeric characters
///
/// Alphanumerics are a subset of the unreserved URL characters, so the
/// output never needs percent-encoding.
pub(crate) fn random_url_safe(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A PKCE code verifier
///
/// A verifier is scoped to a single authorization attempt. It is handed
/// out alongside the authorization URL and consumed by the code exchange,
/// so it never outlives the attempt that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// Generates a fresh verifier of the maximum permitted length
    pub fn generate() -> Self {
        Self(random_url_safe(MAX_VERIFIER_LEN))
    }

    /// Wraps an existing verifier
    ///
    /// Returns `None` if the value is not between 43 and 128 characters
    /// or contains characters outside of the unreserved URL set.
    pub fn new(verifier: impl Into<String>) -> Option<Self> {
        let verifier = verifier.into();
        let valid_len = (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len());
        let valid_chars = verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));

        if valid_len && valid_chars {
            Some(Self(verifier))
        } else {
            None
        }
    }

    /// The S256 code challenge for this verifier
    ///
    /// The SHA-256 digest of the verifier, base64url-encoded without padding.
    pub fn challenge(&self) -> CodeChallenge {
        let hash = digest::digest(&digest::SHA256, self.0.as_bytes());
        CodeChallenge::new(Base64Url::from_raw(hash.as_ref()).to_string())
    }

    /// The verifier as sent to the token endpoint
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***PKCE VERIFIER***")
    }
}
