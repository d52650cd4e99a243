//! Token propagation on outgoing web-content requests.

use crate::bridge::{BridgeRegistry, WebContent};
use crate::config::{AgentConfig, HeaderPlacement, USER_AGENT_TOKEN_KEY};
use crate::coordinator::FetchCoordinator;
use crate::types::{FetchCompletionEvent, Headers, InstanceId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const USER_AGENT_HEADER: &str = "User-Agent";

pub struct HeaderAugmenter {
    coordinator: Arc<FetchCoordinator>,
    registry: Arc<BridgeRegistry>,
    default_enabled: AtomicBool,
    token_header: String,
    placement: HeaderPlacement,
}

impl HeaderAugmenter {
    /// Create an augmenter reading tokens from `coordinator` and per-instance
    /// flags from `registry`. Header key, placement and the initial process
    /// default come from `config`.
    pub fn new(
        coordinator: Arc<FetchCoordinator>,
        registry: Arc<BridgeRegistry>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            default_enabled: AtomicBool::new(config.append_token_header),
            token_header: config.token_header.clone(),
            placement: config.header_placement,
        }
    }

    /// Process-wide default, used by instances registered without an override
    /// and by unregistered instances.
    pub fn default_enabled(&self) -> bool {
        self.default_enabled.load(Ordering::Relaxed)
    }

    pub fn set_default_enabled(&self, enabled: bool) {
        self.default_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether requests from `instance` carry the token: its registration
    /// override if it has one, the process default otherwise.
    pub fn should_augment(&self, instance: &Arc<dyn WebContent>) -> bool {
        self.registry
            .append_header_override(InstanceId::of(instance))
            .flatten()
            .unwrap_or_else(|| self.default_enabled())
    }

    /// Put the current token on `headers` if `instance` is opted in.
    ///
    /// Returns whether the headers were changed. Without a token the headers
    /// are left untouched; this never triggers or waits for a fetch.
    pub fn augment(&self, headers: &mut Headers, instance: &Arc<dyn WebContent>) -> bool {
        if !self.should_augment(instance) {
            return false;
        }
        let Some(token) = self.coordinator.current_token() else {
            return false;
        };
        self.apply(headers, &token);
        true
    }

    fn apply(&self, headers: &mut Headers, token: &str) {
        match self.placement {
            HeaderPlacement::Dedicated => {
                headers.retain(|k, _| !k.eq_ignore_ascii_case(&self.token_header));
                headers.insert(self.token_header.clone(), token.to_string());
            }
            HeaderPlacement::UserAgent => {
                let key = headers
                    .keys()
                    .find(|k| k.eq_ignore_ascii_case(USER_AGENT_HEADER))
                    .cloned()
                    .unwrap_or_else(|| USER_AGENT_HEADER.to_string());
                let current = headers.get(&key).map(String::as_str).unwrap_or("");
                let value = with_user_agent_token(current, token);
                headers.insert(key, value);
            }
        }
    }

    /// Push a freshly fetched token to every opted-in registered instance.
    pub(crate) fn propagate(&self, event: &FetchCompletionEvent) {
        let Some(token) = event.token.as_deref().filter(|_| event.is_successful()) else {
            return;
        };
        let default = self.default_enabled();
        let targets = self.registry.instances_where(|flag| flag.unwrap_or(default));
        if targets.is_empty() {
            return;
        }

        match self.placement {
            HeaderPlacement::Dedicated => {
                for instance in &targets {
                    instance.add_outgoing_header(&self.token_header, token);
                }
            }
            HeaderPlacement::UserAgent => {
                for instance in &targets {
                    let user_agent = with_user_agent_token(&instance.user_agent(), token);
                    instance.set_user_agent(&user_agent);
                }
            }
        }
        tracing::debug!(
            fetch_id = %event.fetch_id,
            instances = targets.len(),
            placement = ?self.placement,
            "Propagated token"
        );
    }
}

impl fmt::Debug for HeaderAugmenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderAugmenter")
            .field("default_enabled", &self.default_enabled())
            .field("token_header", &self.token_header)
            .field("placement", &self.placement)
            .finish()
    }
}

fn user_agent_segment(token: &str) -> String {
    format!("{}/{}", USER_AGENT_TOKEN_KEY, token)
}

/// `user_agent` with any previous token segment replaced by one for `token`.
fn with_user_agent_token(user_agent: &str, token: &str) -> String {
    let prefix = format!("{}/", USER_AGENT_TOKEN_KEY);
    let segment = user_agent_segment(token);
    let mut parts: Vec<&str> = user_agent
        .split_whitespace()
        .filter(|part| !part.starts_with(&prefix))
        .collect();
    parts.push(&segment);
    parts.join(" ")
}
