//! Token state held by the fetch coordinator.

use sha2::{Digest, Sha256};

/// The current token and whether one has ever been fetched.
///
/// Only the coordinator writes it, and always under its lock; `value` is
/// replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenState {
    value: String,
    present: bool,
}

impl TokenState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current token, if any.
    pub fn current(&self) -> Option<&str> {
        self.present.then_some(self.value.as_str())
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Replace the token with a freshly fetched one.
    pub fn replace(&mut self, token: String) {
        *self = TokenState {
            value: token,
            present: true,
        };
    }
}

/// Short, log-safe fingerprint of a token (first 8 bytes of its SHA-256).
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}
