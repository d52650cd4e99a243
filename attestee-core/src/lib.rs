//! # Attestee Core
//!
//! Client-side attestation token lifecycle for apps embedding web content.
//!
//! ## Key Features
//! - **Single-flight fetches**: concurrent requests share one attestation call
//! - **Completion bus**: every fetch produces exactly one ordered event
//! - **Script bridge**: page code fetches tokens through named callbacks,
//!   delivered only to the web content that asked
//! - **Header augmentation**: opted-in web content carries the current token

pub mod agent;
pub mod attestation;
pub mod bridge;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod event_bus;
pub mod headers;
pub mod token;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{install, shared, teardown, AgentBuilder, AgentError, AttestationAgent};
pub use attestation::{AttestationError, Attester};
pub use bridge::{
    render_script_call, BridgeRegistry, RegistrationOptions, ScriptSurface, WebContent,
    WebContentError, WebContentKind, SCRIPTED_FETCH_FUNCTION,
};
pub use config::{AgentConfig, ConfigError, HeaderPlacement};
pub use context::{InlineContext, QueueContext, QueueDriver, UiContext};
pub use coordinator::FetchCoordinator;
pub use event_bus::{EventBus, SubscriptionHandle};
pub use headers::HeaderAugmenter;
pub use token::TokenState;
pub use types::*;
