//! Remote attestation collaborator interface.
//!
//! The wire protocol with the attestation service lives outside this crate.
//! The coordinator only needs an asynchronous call that yields a token or an
//! error, which is what [`Attester`] describes.

use async_trait::async_trait;
use thiserror::Error;

/// Trait for the remote attestation service client.
///
/// Implementations perform the integrity measurement of the running app,
/// exchange it with the attestation service and return the issued token.
#[async_trait]
pub trait Attester: Send + Sync {
    /// Attest the running app and fetch a fresh token.
    ///
    /// Called at most once per in-flight fetch; the coordinator never retries
    /// on its own.
    async fn attest(&self) -> Result<String, AttestationError>;
}

/// Errors that can occur while attesting.
///
/// At the coordinator layer every variant collapses to a `Failed` fetch; the
/// message is carried verbatim in the completion event.
#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Integrity check rejected: {0}")]
    Rejected(String),

    #[error("Attestation service error: {0}")]
    Service(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAttester(&'static str);

    #[async_trait]
    impl Attester for FixedAttester {
        async fn attest(&self) -> Result<String, AttestationError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_attester_object_safety() {
        let attester: Box<dyn Attester> = Box::new(FixedAttester("tok"));
        assert_eq!(attester.attest().await.unwrap(), "tok");
    }

    #[test]
    fn test_error_messages() {
        let err = AttestationError::Rejected("tampered binary".to_string());
        assert_eq!(err.to_string(), "Integrity check rejected: tampered binary");
        let err = AttestationError::Network("timeout".to_string());
        assert_eq!(err.to_string(), "Network error: timeout");
    }
}
