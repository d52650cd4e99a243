//! Test doubles shared by the unit tests.

use crate::attestation::{AttestationError, Attester};
use crate::bridge::{ScriptSurface, WebContent, WebContentError, WebContentKind};
use crate::event_bus::EventBus;
use crate::types::FetchCompletionEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

type Outcome = Result<String, AttestationError>;

/// Attester whose calls stay pending until the test completes them.
#[derive(Default)]
pub(crate) struct ManualAttester {
    calls: AtomicUsize,
    pending: Mutex<VecDeque<oneshot::Sender<Outcome>>>,
}

impl ManualAttester {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_pending(&self, n: usize) {
        tokio::time::timeout(WAIT_LIMIT, async {
            while self.pending.lock().len() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("attester was not called");
    }

    pub(crate) fn succeed(&self, token: &str) {
        self.complete(Ok(token.to_string()));
    }

    pub(crate) fn fail(&self, error: AttestationError) {
        self.complete(Err(error));
    }

    fn complete(&self, outcome: Outcome) {
        let sender = self.pending.lock().pop_front().expect("no pending attestation");
        let _ = sender.send(outcome);
    }
}

#[async_trait]
impl Attester for ManualAttester {
    async fn attest(&self) -> Result<String, AttestationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(tx);
        rx.await
            .unwrap_or_else(|_| Err(AttestationError::Internal("test dropped".to_string())))
    }
}

pub(crate) struct PanickingAttester;

#[async_trait]
impl Attester for PanickingAttester {
    async fn attest(&self) -> Result<String, AttestationError> {
        panic!("attester blew up");
    }
}

/// Web view double recording every host call.
pub(crate) struct RecordingWebView {
    kind: WebContentKind,
    reject_injection: bool,
    objects: Mutex<Vec<(String, ScriptSurface)>>,
    invocations: Mutex<Vec<(String, Vec<String>)>>,
    headers: Mutex<Vec<(String, String)>>,
    user_agent: Mutex<String>,
    on_invoke: Mutex<Option<InvokeHook>>,
}

type InvokeHook = Arc<dyn Fn(&str) + Send + Sync>;

impl RecordingWebView {
    pub(crate) fn new(kind: WebContentKind) -> Arc<Self> {
        Self::build(kind, false)
    }

    /// A view whose page refuses the bridge object.
    pub(crate) fn rejecting() -> Arc<Self> {
        Self::build(WebContentKind::Modern, true)
    }

    fn build(kind: WebContentKind, reject_injection: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            reject_injection,
            objects: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            headers: Mutex::new(Vec::new()),
            user_agent: Mutex::new("Mozilla/5.0".to_string()),
            on_invoke: Mutex::new(None),
        })
    }

    /// Run `hook` with the function name after every recorded invocation,
    /// standing in for page code that reacts to a callback.
    pub(crate) fn on_invoke<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_invoke.lock() = Some(Arc::new(hook));
    }

    pub(crate) fn surface(&self, name: &str) -> Option<ScriptSurface> {
        self.objects
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
    }

    pub(crate) fn invocations(&self) -> Vec<(String, Vec<String>)> {
        self.invocations.lock().clone()
    }

    pub(crate) fn headers(&self) -> Vec<(String, String)> {
        self.headers.lock().clone()
    }
}

impl WebContent for RecordingWebView {
    fn kind(&self) -> WebContentKind {
        self.kind
    }

    fn inject_script_object(&self, name: &str, surface: ScriptSurface) -> Result<(), WebContentError> {
        if self.reject_injection {
            return Err(WebContentError::Injection("page not loaded".to_string()));
        }
        self.objects.lock().push((name.to_string(), surface));
        Ok(())
    }

    fn remove_script_object(&self, name: &str) {
        self.objects.lock().retain(|(n, _)| n != name);
    }

    fn invoke_script_function(&self, function: &str, args: &[String]) {
        self.invocations
            .lock()
            .push((function.to_string(), args.to_vec()));
        let hook = self.on_invoke.lock().clone();
        if let Some(hook) = hook {
            hook(function);
        }
    }

    fn add_outgoing_header(&self, key: &str, value: &str) {
        self.headers.lock().push((key.to_string(), value.to_string()));
    }

    fn user_agent(&self) -> String {
        self.user_agent.lock().clone()
    }

    fn set_user_agent(&self, user_agent: &str) {
        *self.user_agent.lock() = user_agent.to_string();
    }
}

/// Coerce a recording view into the host capability type.
pub(crate) fn as_content(view: &Arc<RecordingWebView>) -> Arc<dyn WebContent> {
    view.clone()
}

pub(crate) fn event_channel(bus: &EventBus) -> mpsc::UnboundedReceiver<FetchCompletionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(move |e| {
        let _ = tx.send(e.clone());
    });
    rx
}

pub(crate) async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<FetchCompletionEvent>,
) -> FetchCompletionEvent {
    tokio::time::timeout(WAIT_LIMIT, rx.recv())
        .await
        .expect("no completion event")
        .expect("event bus closed")
}

/// Let spawned tasks run to quiescence.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}
