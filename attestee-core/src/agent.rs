//! The attestation agent: coordinator, event bus, bridge and header
//! augmentation wired together behind one handle.
//!
//! ## Process-wide instance
//! Hosts that want a single shared agent install it explicitly with
//! [`install`], look it up with [`shared`] and end its lifetime with
//! [`teardown`], which also unregisters every web-content instance.

use crate::attestation::Attester;
use crate::bridge::{BridgeRegistry, RegistrationOptions, WebContent};
use crate::config::{AgentConfig, ConfigError};
use crate::context::{InlineContext, UiContext};
use crate::coordinator::FetchCoordinator;
use crate::event_bus::{EventBus, SubscriptionHandle};
use crate::headers::HeaderAugmenter;
use crate::types::{FetchCompletionEvent, Headers};
use parking_lot::RwLock;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("No tokio runtime available; pass one with AgentBuilder::runtime")]
    NoRuntime,

    #[error("An attestation agent is already installed")]
    AlreadyInstalled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct AgentBuilder {
    attester: Arc<dyn Attester>,
    config: AgentConfig,
    context: Arc<dyn UiContext>,
    runtime: Option<Handle>,
}

impl AgentBuilder {
    /// Use `config` as is. Environment overrides are not applied.
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn config_file(self, path: &Path) -> Result<Self, AgentError> {
        let config = AgentConfig::load(path)?.with_env_overrides()?;
        Ok(self.config(config))
    }

    /// Context that event delivery and script callbacks are marshaled to.
    /// Defaults to [`InlineContext`].
    pub fn context<C: UiContext + 'static>(mut self, context: C) -> Self {
        self.context = Arc::new(context);
        self
    }

    /// Runtime that attestation calls run on. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Wire the coordinator, bus, bridge registry and header augmenter.
    ///
    /// # Errors
    /// [`AgentError::NoRuntime`] if no runtime was given and none is current.
    pub fn build(self) -> Result<Arc<AttestationAgent>, AgentError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| AgentError::NoRuntime)?,
        };

        let bus = Arc::new(EventBus::new());
        let coordinator = Arc::new(FetchCoordinator::new(
            self.attester,
            Arc::clone(&bus),
            self.context,
            runtime,
        ));
        let bridge = BridgeRegistry::new(Arc::clone(&coordinator), self.config.bridge_object_name.clone());
        let headers = Arc::new(HeaderAugmenter::new(
            Arc::clone(&coordinator),
            Arc::clone(&bridge),
            &self.config,
        ));

        // Script callbacks resolve before generic observers run.
        let weak_bridge = Arc::downgrade(&bridge);
        let resolver = bus.subscribe(move |event| {
            if let Some(bridge) = weak_bridge.upgrade() {
                bridge.resolve(event);
            }
        });
        let weak_headers = Arc::downgrade(&headers);
        let propagator = bus.subscribe(move |event| {
            if let Some(headers) = weak_headers.upgrade() {
                headers.propagate(event);
            }
        });

        tracing::info!(
            bridge_object = %self.config.bridge_object_name,
            append_token_header = self.config.append_token_header,
            "Attestation agent initialized"
        );

        Ok(Arc::new(AttestationAgent {
            config: self.config,
            bus,
            coordinator,
            bridge,
            headers,
            internal: [resolver, propagator],
        }))
    }
}

/// Facade over the fetch coordinator, event bus, bridge registry and header
/// augmenter. Built with [`AttestationAgent::builder`].
pub struct AttestationAgent {
    config: AgentConfig,
    bus: Arc<EventBus>,
    coordinator: Arc<FetchCoordinator>,
    bridge: Arc<BridgeRegistry>,
    headers: Arc<HeaderAugmenter>,
    internal: [SubscriptionHandle; 2],
}

impl AttestationAgent {
    /// Start building an agent that attests through `attester`.
    pub fn builder(attester: Arc<dyn Attester>) -> AgentBuilder {
        AgentBuilder {
            attester,
            config: AgentConfig::default(),
            context: Arc::new(InlineContext),
            runtime: None,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Start a token fetch, or join the one in flight.
    pub fn fetch(&self) {
        self.coordinator.fetch();
    }

    /// Start or join a fetch and run `callback` once with its outcome.
    pub fn fetch_with<F>(&self, callback: F)
    where
        F: FnOnce(&FetchCompletionEvent) + Send + 'static,
    {
        self.coordinator.fetch_with(callback);
    }

    /// The last successfully fetched token. Never blocks or fetches.
    pub fn current_token(&self) -> Option<String> {
        self.coordinator.current_token()
    }

    /// Observe every subsequent completion event.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionHandle
    where
        F: Fn(&FetchCompletionEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(observer)
    }

    /// Remove an observer. The agent's own bridge and header subscriptions
    /// cannot be removed this way.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        if self.internal.contains(&handle) {
            return false;
        }
        self.bus.unsubscribe(handle)
    }

    /// See [`BridgeRegistry::register`].
    pub fn register(&self, instance: &Arc<dyn WebContent>) -> bool {
        self.bridge.register(instance)
    }

    pub fn register_with(&self, instance: &Arc<dyn WebContent>, options: RegistrationOptions) -> bool {
        self.bridge.register_with(instance, options)
    }

    pub fn unregister(&self, instance: &Arc<dyn WebContent>) -> bool {
        self.bridge.unregister(instance)
    }

    pub fn is_registered(&self, instance: &Arc<dyn WebContent>) -> bool {
        self.bridge.is_registered(instance)
    }

    /// Host-side entry for a `fetchApproovToken` call that arrived outside
    /// the injected script object.
    pub fn on_scripted_fetch_requested(
        &self,
        instance: &Arc<dyn WebContent>,
        success: &str,
        failure: &str,
    ) -> bool {
        self.bridge.on_scripted_fetch_requested(instance, success, failure)
    }

    pub fn should_augment(&self, instance: &Arc<dyn WebContent>) -> bool {
        self.headers.should_augment(instance)
    }

    /// Put the current token on an outgoing request from `instance`.
    pub fn augment(&self, headers: &mut Headers, instance: &Arc<dyn WebContent>) -> bool {
        self.headers.augment(headers, instance)
    }

    /// Change the process-wide header augmentation default at runtime.
    pub fn set_append_token_header(&self, enabled: bool) {
        self.headers.set_default_enabled(enabled);
    }

    /// Unregister every web-content instance. In-flight fetches still
    /// complete and update the token; they are not cancellable.
    pub fn shutdown(&self) -> usize {
        let dropped = self.bridge.unregister_all();
        tracing::info!(unregistered = dropped, "Attestation agent shut down");
        dropped
    }
}

impl fmt::Debug for AttestationAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationAgent")
            .field("coordinator", &self.coordinator)
            .field("bridge", &self.bridge)
            .field("bus", &self.bus)
            .finish()
    }
}

static SHARED: RwLock<Option<Arc<AttestationAgent>>> = parking_lot::const_rwlock(None);

/// Make `agent` the process-wide agent.
pub fn install(agent: Arc<AttestationAgent>) -> Result<(), AgentError> {
    let mut shared = SHARED.write();
    if shared.is_some() {
        return Err(AgentError::AlreadyInstalled);
    }
    *shared = Some(agent);
    Ok(())
}

/// The process-wide agent, if one is installed.
pub fn shared() -> Option<Arc<AttestationAgent>> {
    SHARED.read().clone()
}

/// Remove the process-wide agent and unregister all of its web content.
pub fn teardown() -> Option<Arc<AttestationAgent>> {
    let agent = SHARED.write().take()?;
    agent.shutdown();
    Some(agent)
}
