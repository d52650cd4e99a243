//! Core types shared by the coordinator, event bus and bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name of the completion signal forwarded to generic consumers.
pub const TOKEN_FETCHED_SIGNAL: &str = "ApproovTokenFetched";

/// Outgoing request headers as seen by the header augmenter.
pub type Headers = BTreeMap<String, String>;

/// Identifier of a single fetch request (unique per process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FetchId(pub u64);

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch-{}", self.0)
    }
}

/// Identity of a web-content instance.
///
/// Derived from the address of the host's `Arc` allocation. The registry keeps
/// a `Weak` to every registered instance, which pins the allocation and keeps
/// the identity from being reused while the registration exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(usize);

impl InstanceId {
    /// Identity of the instance behind `instance`.
    pub fn of<T: ?Sized>(instance: &Arc<T>) -> Self {
        InstanceId(Arc::as_ptr(instance) as *const () as usize)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "webview-{:x}", self.0)
    }
}

/// Outcome of a token fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchResult {
    /// Attestation passed and a token was issued
    Successful,
    /// Attestation did not produce a token (network, rejection, service error)
    Failed,
}

impl fmt::Display for FetchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchResult::Successful => write!(f, "Successful"),
            FetchResult::Failed => write!(f, "Failed"),
        }
    }
}

/// Event produced exactly once per completed fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCompletionEvent {
    /// The fetch this event completes
    pub fetch_id: FetchId,
    /// Success or failure
    #[serde(rename = "ApproovTokenFetchResult")]
    pub result: FetchResult,
    /// The fetched token (present on success only)
    #[serde(rename = "ApproovToken", skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Attestation error text, reported verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// When the attestation call finished
    pub completed_at: DateTime<Utc>,
}

impl FetchCompletionEvent {
    pub fn successful(fetch_id: FetchId, token: String) -> Self {
        Self {
            fetch_id,
            result: FetchResult::Successful,
            token: Some(token),
            failure: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(fetch_id: FetchId, failure: impl Into<String>) -> Self {
        Self {
            fetch_id,
            result: FetchResult::Failed,
            token: None,
            failure: Some(failure.into()),
            completed_at: Utc::now(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.result == FetchResult::Successful
    }
}
