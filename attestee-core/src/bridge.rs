//! Scripting bridge between embedded web content and the fetch coordinator.
//!
//! A registered web-content instance gets a script object (by default
//! `approov`) exposing `fetchApproovToken(successName, failureName)`. Page code
//! calls it with the names of two global functions; when the shared fetch
//! completes, exactly one of them is invoked in that same instance:
//!
//! ```text
//! approov.fetchApproovToken("onToken", "onTokenFailed");
//! // later: onToken("<token>")  or  onTokenFailed()
//! ```
//!
//! ## Correlation
//! Each pending request is a [`ScriptedWaiter`] stored in its instance's own
//! registration entry and tagged with the fetch it joined. On completion the
//! registry takes the waiters tagged with that fetch out of every entry and
//! invokes them through the waiter's own weak instance reference, so a
//! callback can never reach another instance. Unregistering drops the entry
//! and its waiters without invoking them.

use crate::coordinator::FetchCoordinator;
use crate::types::{FetchCompletionEvent, FetchId, InstanceId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Script-visible name of the fetch entry point.
pub const SCRIPTED_FETCH_FUNCTION: &str = "fetchApproovToken";

/// Host embedding flavour of a web-content instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebContentKind {
    /// Legacy embedding (in-process, synchronous script evaluation)
    Legacy,
    /// Modern embedding (out-of-process, message-handler based)
    Modern,
}

impl fmt::Display for WebContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebContentKind::Legacy => write!(f, "legacy"),
            WebContentKind::Modern => write!(f, "modern"),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebContentError {
    #[error("Script object injection failed: {0}")]
    Injection(String),

    #[error("Web content is no longer available")]
    Gone,
}

/// Capabilities the host UI layer provides for one web-content instance.
///
/// Implemented once per embedding type. All calls are made from the context
/// the agent delivers events on.
pub trait WebContent: Send + Sync {
    fn kind(&self) -> WebContentKind;

    /// Install `surface` as a global script object called `name`.
    fn inject_script_object(&self, name: &str, surface: ScriptSurface)
        -> Result<(), WebContentError>;

    /// Remove a previously injected script object. No-op if absent.
    fn remove_script_object(&self, name: &str);

    /// Call the global script function `function` with string arguments.
    fn invoke_script_function(&self, function: &str, args: &[String]);

    /// Attach a header to every subsequent request issued by this instance,
    /// replacing any earlier value for `key`.
    fn add_outgoing_header(&self, key: &str, value: &str);

    /// The user agent this instance currently sends.
    fn user_agent(&self) -> String;

    /// Replace the user agent sent on subsequent requests.
    fn set_user_agent(&self, user_agent: &str);
}

/// The object injected into page scripts.
///
/// Bound to one registration of one instance; once that registration ends the
/// surface rejects every call.
#[derive(Clone)]
pub struct ScriptSurface {
    registry: Weak<BridgeRegistry>,
    instance: InstanceId,
    generation: u64,
}

impl ScriptSurface {
    /// Name the entry point is exposed under on the script object.
    pub fn function_name(&self) -> &'static str {
        SCRIPTED_FETCH_FUNCTION
    }

    /// Entry point behind `fetchApproovToken(success, failure)`.
    ///
    /// Both names must be dotted identifier paths (see [`is_callback_name`]).
    /// Other script-valid names such as `cbs["x"]` or non-ASCII identifiers
    /// are rejected too, since hosts may splice the name into evaluated
    /// source.
    ///
    /// Returns false if the request was rejected (instance unregistered or
    /// invalid callback names).
    pub fn fetch_approov_token(&self, success: &str, failure: &str) -> bool {
        match self.registry.upgrade() {
            Some(registry) => {
                registry.request_for(self.instance, Some(self.generation), success, failure)
            }
            None => false,
        }
    }
}

impl fmt::Debug for ScriptSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptSurface")
            .field("instance", &self.instance)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Per-instance registration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationOptions {
    /// Inject the script bridge object
    pub inject_bridge: bool,
    /// Header augmentation override; `None` follows the process default
    pub append_header: Option<bool>,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            inject_bridge: true,
            append_header: None,
        }
    }
}

/// A script callback pair waiting on one fetch.
struct ScriptedWaiter {
    fetch: FetchId,
    seq: u64,
    instance: Weak<dyn WebContent>,
    success: String,
    failure: String,
    requested_at: DateTime<Utc>,
}

struct Registration {
    instance: Weak<dyn WebContent>,
    generation: u64,
    bridge_injected: bool,
    append_header: Option<bool>,
    pending: Vec<ScriptedWaiter>,
}

pub struct BridgeRegistry {
    coordinator: Arc<FetchCoordinator>,
    object_name: String,
    registrations: Mutex<HashMap<InstanceId, Registration>>,
    next_generation: AtomicU64,
    next_request: AtomicU64,
    me: Weak<BridgeRegistry>,
}

impl BridgeRegistry {
    /// Create a registry whose scripted fetches go through `coordinator`.
    /// Bridge objects are injected under `object_name`.
    pub fn new(coordinator: Arc<FetchCoordinator>, object_name: impl Into<String>) -> Arc<Self> {
        let object_name = object_name.into();
        Arc::new_cyclic(|me| Self {
            coordinator,
            object_name,
            registrations: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            next_request: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    /// Register `instance` with default options. Returns false if it is
    /// already registered or the bridge could not be injected.
    pub fn register(&self, instance: &Arc<dyn WebContent>) -> bool {
        self.register_with(instance, RegistrationOptions::default())
    }

    /// Register `instance` with explicit options.
    ///
    /// # Arguments
    /// * `instance` - Host web content; held weakly
    /// * `options` - Bridge injection and header override
    ///
    /// # Returns
    /// False if `instance` is already registered or injection failed, in
    /// which case nothing is recorded.
    pub fn register_with(&self, instance: &Arc<dyn WebContent>, options: RegistrationOptions) -> bool {
        let id = InstanceId::of(instance);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut registrations = self.registrations.lock();
            if registrations.contains_key(&id) {
                tracing::debug!(instance = %id, "Already registered");
                return false;
            }
            registrations.insert(
                id,
                Registration {
                    instance: Arc::downgrade(instance),
                    generation,
                    bridge_injected: false,
                    append_header: options.append_header,
                    pending: Vec::new(),
                },
            );
        }

        if options.inject_bridge {
            let surface = ScriptSurface {
                registry: self.me.clone(),
                instance: id,
                generation,
            };
            if let Err(e) = instance.inject_script_object(&self.object_name, surface) {
                tracing::warn!(instance = %id, error = %e, "Bridge injection failed");
                self.remove_generation(id, generation);
                return false;
            }

            let mut registrations = self.registrations.lock();
            match registrations.get_mut(&id) {
                Some(registration) if registration.generation == generation => {
                    registration.bridge_injected = true;
                }
                _ => {
                    // Unregistered while injecting; take the object back out.
                    drop(registrations);
                    instance.remove_script_object(&self.object_name);
                }
            }
        }

        tracing::info!(
            instance = %id,
            kind = %instance.kind(),
            bridge = options.inject_bridge,
            "Web content registered"
        );
        true
    }

    /// Unregister `instance`, removing its bridge object and silently dropping
    /// its pending script callbacks. Returns false if it was not registered.
    pub fn unregister(&self, instance: &Arc<dyn WebContent>) -> bool {
        let id = InstanceId::of(instance);
        let Some(registration) = self.registrations.lock().remove(&id) else {
            return false;
        };
        if registration.bridge_injected {
            instance.remove_script_object(&self.object_name);
        }
        tracing::info!(
            instance = %id,
            dropped_callbacks = registration.pending.len(),
            "Web content unregistered"
        );
        true
    }

    /// Unregister every instance. Returns how many were registered.
    pub fn unregister_all(&self) -> usize {
        let drained: Vec<Registration> = self
            .registrations
            .lock()
            .drain()
            .map(|(_, registration)| registration)
            .collect();
        for registration in &drained {
            if !registration.bridge_injected {
                continue;
            }
            if let Some(instance) = registration.instance.upgrade() {
                instance.remove_script_object(&self.object_name);
            }
        }
        drained.len()
    }

    /// Record a script request from `instance` and start or join the fetch.
    pub fn on_scripted_fetch_requested(
        &self,
        instance: &Arc<dyn WebContent>,
        success: &str,
        failure: &str,
    ) -> bool {
        self.request_for(InstanceId::of(instance), None, success, failure)
    }

    fn request_for(
        &self,
        id: InstanceId,
        generation: Option<u64>,
        success: &str,
        failure: &str,
    ) -> bool {
        if !is_callback_name(success) || !is_callback_name(failure) {
            tracing::warn!(
                instance = %id,
                success,
                failure,
                "Rejected scripted fetch with invalid callback names"
            );
            return false;
        }

        let mut registrations = self.registrations.lock();
        let registration = match registrations.get_mut(&id) {
            Some(r) if generation.map_or(true, |g| g == r.generation) => r,
            _ => {
                tracing::debug!(instance = %id, "Scripted fetch from unregistered web content");
                return false;
            }
        };

        // Joined under the registry lock: the completion cannot be resolved
        // before this waiter is recorded.
        let fetch = self.coordinator.begin(None);
        registration.pending.push(ScriptedWaiter {
            fetch,
            seq: self.next_request.fetch_add(1, Ordering::Relaxed),
            instance: registration.instance.clone(),
            success: success.to_string(),
            failure: failure.to_string(),
            requested_at: Utc::now(),
        });
        tracing::debug!(
            instance = %id,
            fetch_id = %fetch,
            pending = registration.pending.len(),
            "Scripted fetch requested"
        );
        true
    }

    /// Invoke the script callbacks waiting on `event`'s fetch, in request
    /// order across all instances.
    pub(crate) fn resolve(&self, event: &FetchCompletionEvent) {
        let mut ready: Vec<(InstanceId, u64, ScriptedWaiter)> = {
            let mut registrations = self.registrations.lock();
            let mut ready = Vec::new();
            for (id, registration) in registrations.iter_mut() {
                let (matched, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut registration.pending)
                    .into_iter()
                    .partition(|w| w.fetch == event.fetch_id);
                registration.pending = keep;
                ready.extend(matched.into_iter().map(|w| (*id, registration.generation, w)));
            }
            ready
        };
        ready.sort_by_key(|(_, _, waiter)| waiter.seq);

        for (id, generation, waiter) in ready {
            // Re-checked right before the host call; unregistration may have
            // happened while earlier callbacks ran.
            if !self.is_current(id, generation) {
                tracing::debug!(instance = %id, "Dropped callback for unregistered web content");
                continue;
            }
            let Some(instance) = waiter.instance.upgrade() else {
                tracing::debug!(instance = %id, "Dropped callback for released web content");
                continue;
            };

            let waited_ms = (event.completed_at - waiter.requested_at).num_milliseconds();
            match (&event.token, event.is_successful()) {
                (Some(token), true) => {
                    tracing::debug!(instance = %id, callback = %waiter.success, waited_ms, "Invoking success callback");
                    instance.invoke_script_function(&waiter.success, std::slice::from_ref(token));
                }
                _ => {
                    tracing::debug!(instance = %id, callback = %waiter.failure, waited_ms, "Invoking failure callback");
                    instance.invoke_script_function(&waiter.failure, &[]);
                }
            }
        }
    }

    /// Whether `instance` is currently registered.
    pub fn is_registered(&self, instance: &Arc<dyn WebContent>) -> bool {
        self.registrations.lock().contains_key(&InstanceId::of(instance))
    }

    /// Number of registered instances, live or already released by the host.
    pub fn registered_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Number of script callbacks still waiting for `instance`.
    pub fn pending_count(&self, instance: &Arc<dyn WebContent>) -> usize {
        self.registrations
            .lock()
            .get(&InstanceId::of(instance))
            .map_or(0, |r| r.pending.len())
    }

    /// Header override recorded at registration. Outer `None` means the
    /// instance is not registered.
    pub(crate) fn append_header_override(&self, id: InstanceId) -> Option<Option<bool>> {
        self.registrations.lock().get(&id).map(|r| r.append_header)
    }

    /// Live registered instances whose header override passes `enabled`.
    pub(crate) fn instances_where<F>(&self, enabled: F) -> Vec<Arc<dyn WebContent>>
    where
        F: Fn(Option<bool>) -> bool,
    {
        self.registrations
            .lock()
            .values()
            .filter(|r| enabled(r.append_header))
            .filter_map(|r| r.instance.upgrade())
            .collect()
    }

    fn is_current(&self, id: InstanceId, generation: u64) -> bool {
        self.registrations
            .lock()
            .get(&id)
            .is_some_and(|r| r.generation == generation)
    }

    fn remove_generation(&self, id: InstanceId, generation: u64) {
        let mut registrations = self.registrations.lock();
        if registrations.get(&id).is_some_and(|r| r.generation == generation) {
            registrations.remove(&id);
        }
    }
}

impl fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("object_name", &self.object_name)
            .field("registered", &self.registered_count())
            .finish()
    }
}

/// Whether `name` is a dotted script identifier path (`onToken`, `app.auth.done`).
pub fn is_callback_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
                }
                _ => false,
            }
        })
}

/// Render a script call with JSON-escaped string arguments, for hosts whose
/// only primitive is evaluating script source.
pub fn render_script_call(function: &str, args: &[String]) -> String {
    let args: Vec<String> = args
        .iter()
        .map(|a| serde_json::Value::String(a.clone()).to_string())
        .collect();
    format!("{}({});", function, args.join(", "))
}
