//! Single-flight token fetch coordinator.
//!
//! At most one attestation call is outstanding at any time. Every `fetch()`
//! issued while a request is in flight joins that request and is satisfied by
//! its single completion event.
//!
//! ## Completion
//! 1. Replace the token (on success only; a failed fetch keeps the stale token)
//! 2. Queue the completion event on the bus and release the in-flight slot,
//!    both under the coordinator lock so events queue in fetch order
//! 3. Post the bus drain to the host UI context
//!
//! A panicking attester, or an attestation task dropped by a shutting-down
//! runtime, completes the fetch as failed.

use crate::attestation::{AttestationError, Attester};
use crate::context::UiContext;
use crate::event_bus::{Callback, EventBus};
use crate::token::{token_fingerprint, TokenState};
use crate::types::{FetchCompletionEvent, FetchId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

/// An in-flight attestation attempt.
struct FetchRequest {
    id: FetchId,
    callbacks: Vec<Callback>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct CoordinatorState {
    token: TokenState,
    in_flight: Option<FetchRequest>,
}

pub struct FetchCoordinator {
    attester: Arc<dyn Attester>,
    bus: Arc<EventBus>,
    context: Arc<dyn UiContext>,
    runtime: Handle,
    state: Mutex<CoordinatorState>,
    next_id: AtomicU64,
}

impl FetchCoordinator {
    /// Create a coordinator.
    ///
    /// # Arguments
    /// * `attester` - Remote attestation client
    /// * `bus` - Bus completion events are queued on
    /// * `context` - Host context the bus drain is posted to
    /// * `runtime` - Runtime the attestation tasks are spawned on
    pub fn new(
        attester: Arc<dyn Attester>,
        bus: Arc<EventBus>,
        context: Arc<dyn UiContext>,
        runtime: Handle,
    ) -> Self {
        Self {
            attester,
            bus,
            context,
            runtime,
            state: Mutex::new(CoordinatorState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a fetch, or join the one already in flight. Never blocks.
    pub fn fetch(self: &Arc<Self>) {
        self.begin(None);
    }

    /// Like [`fetch`](Self::fetch), additionally running `callback` once with
    /// the completion event of the fetch this call joined.
    pub fn fetch_with<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(&FetchCompletionEvent) + Send + 'static,
    {
        self.begin(Some(Box::new(callback)));
    }

    /// The last successfully fetched token.
    pub fn current_token(&self) -> Option<String> {
        self.state.lock().token.current().map(str::to_owned)
    }

    /// Identifier of the fetch currently in flight, if any.
    pub fn in_flight(&self) -> Option<FetchId> {
        self.state.lock().in_flight.as_ref().map(|r| r.id)
    }

    pub(crate) fn begin(self: &Arc<Self>, callback: Option<Callback>) -> FetchId {
        let mut state = self.state.lock();

        if let Some(request) = state.in_flight.as_mut() {
            request.callbacks.extend(callback);
            tracing::debug!(fetch_id = %request.id, "Joined in-flight fetch");
            return request.id;
        }

        let id = FetchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.in_flight = Some(FetchRequest {
            id,
            callbacks: callback.into_iter().collect(),
            created_at: Utc::now(),
        });
        drop(state);

        tracing::info!(fetch_id = %id, "Starting attestation");
        let this = Arc::clone(self);
        self.runtime.spawn(async move { this.run(id).await });
        id
    }

    async fn run(self: Arc<Self>, id: FetchId) {
        let mut guard = CancelGuard {
            coordinator: &*self,
            id,
            armed: true,
        };
        let attester = Arc::clone(&self.attester);
        // A panicking attester must still release the in-flight slot.
        let outcome = match self.runtime.spawn(async move { attester.attest().await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(AttestationError::Internal(format!(
                "attestation task aborted: {}",
                e
            ))),
        };
        guard.armed = false;
        self.complete(id, outcome);
    }

    fn complete(&self, id: FetchId, outcome: Result<String, AttestationError>) {
        {
            let mut state = self.state.lock();
            let request = match state.in_flight.take() {
                Some(request) if request.id == id => request,
                other => {
                    state.in_flight = other;
                    tracing::warn!(fetch_id = %id, "Completion for unknown fetch ignored");
                    return;
                }
            };

            let elapsed_ms = (Utc::now() - request.created_at).num_milliseconds();
            let event = match outcome {
                Ok(token) => {
                    tracing::info!(
                        fetch_id = %id,
                        elapsed_ms,
                        token = %token_fingerprint(&token),
                        "Attestation succeeded"
                    );
                    state.token.replace(token.clone());
                    FetchCompletionEvent::successful(id, token)
                }
                Err(e) => {
                    tracing::warn!(fetch_id = %id, elapsed_ms, error = %e, "Attestation failed");
                    FetchCompletionEvent::failed(id, e.to_string())
                }
            };
            self.bus.enqueue(event, request.callbacks);
        }

        let bus = Arc::clone(&self.bus);
        self.context.post(Box::new(move || bus.drain()));
    }
}

/// Fails the fetch if its task is dropped before completing, e.g. when the
/// runtime shuts down mid-attestation.
struct CancelGuard<'a> {
    coordinator: &'a FetchCoordinator,
    id: FetchId,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.complete(
                self.id,
                Err(AttestationError::Internal("attestation task cancelled".to_string())),
            );
        }
    }
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FetchCoordinator")
            .field("token_present", &state.token.is_present())
            .field("in_flight", &state.in_flight.as_ref().map(|r| r.id))
            .finish()
    }
}
