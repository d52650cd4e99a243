//! Multicast delivery of fetch-completion events.
//!
//! Observers are snapshotted when an event is published, so late subscribers
//! never see it retroactively. Delivery is serialized by a drain loop: whichever
//! thread finds the bus idle delivers queued events one at a time, so the
//! observers of one event all run before the next event starts, even when
//! several worker threads publish concurrently. Observers may subscribe,
//! unsubscribe or publish from inside a callback; nothing runs under a lock.

use crate::types::{FetchCompletionEvent, TOKEN_FETCHED_SIGNAL};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One-shot completion callback attached to a single fetch.
pub type Callback = Box<dyn FnOnce(&FetchCompletionEvent) + Send + 'static>;

type Observer = Arc<dyn Fn(&FetchCompletionEvent) + Send + Sync + 'static>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Delivery {
    event: FetchCompletionEvent,
    observers: Vec<(SubscriptionHandle, Observer)>,
    callbacks: Vec<Callback>,
}

#[derive(Default)]
struct DeliveryQueue {
    pending: VecDeque<Delivery>,
    draining: bool,
}

/// Process-wide completion event bus.
///
/// Outside the crate the bus can only be observed; completion events come
/// from the coordinator.
///
/// ```compile_fail
/// use attestee_core::{EventBus, FetchCompletionEvent, FetchId};
///
/// let bus = EventBus::new();
/// bus.publish(FetchCompletionEvent::successful(FetchId(1), "forged".to_string()));
/// ```
pub struct EventBus {
    observers: Mutex<Vec<(SubscriptionHandle, Observer)>>,
    queue: Mutex<DeliveryQueue>,
    next_handle: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            queue: Mutex::new(DeliveryQueue::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Register an observer for every subsequent completion event.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionHandle
    where
        F: Fn(&FetchCompletionEvent) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((handle, Arc::new(observer)));
        tracing::debug!(?handle, "Observer subscribed");
        handle
    }

    /// Remove an observer. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(h, _)| *h != handle);
        let removed = observers.len() != before;
        if removed {
            tracing::debug!(?handle, "Observer unsubscribed");
        }
        removed
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Deliver `event` to every observer registered now, in registration order.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn publish(&self, event: FetchCompletionEvent) {
        self.enqueue(event, Vec::new());
        self.drain();
    }

    /// Queue `event` for the current observers plus one-shot `callbacks`
    /// without delivering it yet.
    pub(crate) fn enqueue(&self, event: FetchCompletionEvent, callbacks: Vec<Callback>) {
        let observers = self.observers.lock().clone();
        tracing::debug!(
            signal = TOKEN_FETCHED_SIGNAL,
            fetch_id = %event.fetch_id,
            observers = observers.len(),
            callbacks = callbacks.len(),
            "Queueing completion event"
        );
        self.queue.lock().pending.push_back(Delivery {
            event,
            observers,
            callbacks,
        });
    }

    /// Deliver queued events until the queue is empty. Returns immediately if
    /// another caller is already draining; that caller picks up our events.
    pub(crate) fn drain(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        let mut guard = DrainGuard {
            queue: &self.queue,
            armed: true,
        };
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        queue.draining = false;
                        guard.armed = false;
                        break;
                    }
                }
            };
            self.deliver(next);
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let Delivery {
            event,
            observers,
            callbacks,
        } = delivery;

        for (handle, observer) in observers {
            // Unsubscribed since the snapshot (possibly by an earlier observer).
            if !self.is_subscribed(handle) {
                continue;
            }
            observer(&event);
        }
        for callback in callbacks {
            callback(&event);
        }
    }

    fn is_subscribed(&self, handle: SubscriptionHandle) -> bool {
        self.observers.lock().iter().any(|(h, _)| *h == handle)
    }
}

/// Clears the draining flag if an observer panics mid-delivery.
struct DrainGuard<'a> {
    queue: &'a Mutex<DeliveryQueue>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.lock().draining = false;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
