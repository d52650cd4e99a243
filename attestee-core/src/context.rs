//! Host execution contexts for event delivery.
//!
//! Attestation completes on a runtime worker, but script callbacks must run
//! where the host confines its web-content operations (usually the UI thread).
//! The coordinator hands every delivery to a [`UiContext`] instead of running
//! it in place.

use tokio::sync::mpsc;

/// A unit of delivery work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where deliveries run.
pub trait UiContext: Send + Sync {
    /// Schedule `job`. Jobs posted from one thread must run in posting order.
    fn post(&self, job: Job);
}

/// Runs jobs immediately on the posting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineContext;

impl UiContext for InlineContext {
    fn post(&self, job: Job) {
        job();
    }
}

/// FIFO queue drained by the host on its UI thread.
#[derive(Debug, Clone)]
pub struct QueueContext {
    sender: mpsc::UnboundedSender<Job>,
}

/// Receiving half of a [`QueueContext`], owned by the UI thread.
pub struct QueueDriver {
    receiver: mpsc::UnboundedReceiver<Job>,
}

impl QueueContext {
    /// Create a context and the driver the UI thread runs its jobs with.
    pub fn new() -> (Self, QueueDriver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (QueueContext { sender }, QueueDriver { receiver })
    }
}

impl UiContext for QueueContext {
    fn post(&self, job: Job) {
        if self.sender.send(job).is_err() {
            tracing::warn!("UI context driver dropped; delivery discarded");
        }
    }
}

impl QueueDriver {
    /// Run jobs until every [`QueueContext`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.receiver.recv().await {
            job();
        }
        tracing::debug!("UI context closed");
    }

    /// Run the jobs queued so far without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            ran += 1;
        }
        ran
    }
}

impl std::fmt::Debug for QueueDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDriver").finish_non_exhaustive()
    }
}
