//! Event dispatcher
//!
//! Receives every `event` frame from the connection's receive loop, keeps
//! the entity snapshot current, and fans events out to subscribers.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use hass_api::{Event, StateRecord};
use hass_stream::FrameHandler;
use parking_lot::Mutex;
use state_store::StateStore;
use tokio::sync::oneshot;

use crate::error::{CallbackError, EventManagerError, Result};
use crate::subscription::{
    Delivery, EventCallback, EventFilter, StateCondition, Subscription, SubscriptionId,
};

/// Routes server events to subscribers
///
/// # Ordering
///
/// For each event the snapshot is updated first, then matching callbacks
/// are spawned. Events are processed one at a time in arrival order, so the
/// callbacks for one event are always scheduled before those of the next.
/// Callbacks run concurrently on their own tasks; a slow or failing callback
/// never delays dispatch.
///
/// # Re-entrancy
///
/// Filters, waiter conditions and the synchronous part of callbacks run
/// after the subscription list has been released, so any of them may
/// subscribe, unsubscribe or inspect the dispatcher. Subscriptions added or
/// removed while an event is being dispatched take effect from the next
/// event on, except that a removed one-shot subscription never fires.
///
/// # Example
///
/// ```rust,ignore
/// let dispatcher = Arc::new(EventDispatcher::new(Arc::new(StateStore::new())));
/// let connection = Connection::open(config, dispatcher.clone()).await?;
///
/// dispatcher.subscribe(EventFilter::state_changes_of("binary_sensor.door"), |event| async move {
///     tracing::info!(?event, "door changed");
///     Ok(())
/// });
/// ```
pub struct EventDispatcher {
    store: Arc<StateStore>,
    subscriptions: Mutex<BTreeMap<SubscriptionId, Arc<Subscription>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventDispatcher {
    /// Create a dispatcher writing into `store`
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            subscriptions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// The snapshot this dispatcher keeps up to date
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register a persistent subscription
    ///
    /// The callback is invoked on a fresh task for every matching event until
    /// [`unsubscribe`](Self::unsubscribe) is called. Errors and panics are
    /// logged, never propagated.
    pub fn subscribe<F, Fut>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), CallbackError>> + Send + 'static,
    {
        self.register(filter, erase(callback), false)
    }

    /// Register a subscription that removes itself after the first match
    pub fn subscribe_once<F, Fut>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), CallbackError>> + Send + 'static,
    {
        self.register(filter, erase(callback), true)
    }

    fn register(&self, filter: EventFilter, callback: EventCallback, once: bool) -> SubscriptionId {
        let id = self.allocate_id();
        tracing::debug!(subscription = %id, ?filter, once, "Registering subscription");
        self.subscriptions.lock().insert(
            id,
            Arc::new(Subscription {
                filter,
                delivery: Delivery::Callback { callback, once },
            }),
        );
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.lock().remove(&id).is_some();
        if removed {
            tracing::debug!(subscription = %id, "Unsubscribed");
        }
        removed
    }

    /// Number of live subscriptions, condition waiters included
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Process one event
    pub fn dispatch(&self, event: Event) {
        let change = event.state_change();
        if let Some(change) = &change {
            let update = self.store.apply_change_at(change, event.time_fired);
            tracing::trace!(entity_id = %change.entity_id, ?update, "Snapshot updated");
        }
        let new_state = change.and_then(|change| change.new_state);

        let current: Vec<(SubscriptionId, Arc<Subscription>)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(id, subscription)| (*id, Arc::clone(subscription)))
            .collect();

        for (id, subscription) in current {
            if !subscription.filter.matches(&event) {
                continue;
            }

            match &subscription.delivery {
                Delivery::Callback { callback, once } => {
                    // a one-shot already consumed or unsubscribed stays silent
                    if *once && self.subscriptions.lock().remove(&id).is_none() {
                        continue;
                    }
                    spawn_callback(id, callback, event.clone());
                }
                Delivery::Waiter {
                    condition,
                    completion,
                } => {
                    let Some(record) = &new_state else { continue };
                    if condition(record) {
                        if let Some(completion) = completion.lock().take() {
                            let _ = completion.send(record.clone());
                        }
                        self.subscriptions.lock().remove(&id);
                    }
                }
            }
        }
    }

    /// Drop every subscription; pending waiters observe `ConnectionClosed`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped = {
            let mut subscriptions = self.subscriptions.lock();
            std::mem::take(&mut *subscriptions)
        };
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Discarded subscriptions on close");
        }
    }

    // ========================================================================
    // Condition waiter
    // ========================================================================

    /// Wait until `entity_id`'s state satisfies `condition`
    ///
    /// Returns immediately, without subscribing, if the snapshot already
    /// satisfies it. Otherwise a one-shot waiter is registered and the
    /// snapshot checked once more, so a transition dispatched around the
    /// registration cannot be missed. On timeout the waiter is removed and
    /// [`EventManagerError::ConditionTimeout`] returned.
    ///
    /// `condition` never runs under a dispatcher lock and may itself read
    /// the dispatcher.
    pub async fn wait_until<C>(
        &self,
        entity_id: &str,
        condition: C,
        timeout: Duration,
    ) -> Result<StateRecord>
    where
        C: Fn(&StateRecord) -> bool + Send + Sync + 'static,
    {
        let condition: StateCondition = Arc::new(condition);
        if let Some(current) = self.satisfied(entity_id, &condition) {
            return Ok(current);
        }

        let (tx, completion) = oneshot::channel();
        let id = self.allocate_id();
        {
            let mut subscriptions = self.subscriptions.lock();
            if self.is_closed() {
                return Err(EventManagerError::ConnectionClosed {
                    entity_id: entity_id.to_string(),
                });
            }
            subscriptions.insert(
                id,
                Arc::new(Subscription {
                    filter: EventFilter::state_changes_of(entity_id),
                    delivery: Delivery::Waiter {
                        condition: Arc::clone(&condition),
                        completion: Mutex::new(Some(tx)),
                    },
                }),
            );
        }
        tracing::debug!(subscription = %id, entity_id, ?timeout, "Waiting for condition");

        // removes the waiter on timeout and when this future is dropped
        let _waiter = WaiterGuard {
            dispatcher: self,
            id,
        };

        // an event applied before the waiter was visible only shows in the snapshot
        if let Some(current) = self.satisfied(entity_id, &condition) {
            return Ok(current);
        }

        match tokio::time::timeout(timeout, completion).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(_)) => Err(EventManagerError::ConnectionClosed {
                entity_id: entity_id.to_string(),
            }),
            Err(_) => Err(EventManagerError::ConditionTimeout {
                entity_id: entity_id.to_string(),
                timeout,
            }),
        }
    }

    fn satisfied(&self, entity_id: &str, condition: &StateCondition) -> Option<StateRecord> {
        self.store.get(entity_id).filter(|current| condition(current))
    }

    /// Wait until `entity_id` reports exactly `state`
    pub async fn wait_for_state(
        &self,
        entity_id: &str,
        state: &str,
        timeout: Duration,
    ) -> Result<StateRecord> {
        let expected = state.to_string();
        self.wait_until(entity_id, move |record| record.state == expected, timeout)
            .await
    }
}

/// Unregisters a condition waiter when the wait ends
struct WaiterGuard<'a> {
    dispatcher: &'a EventDispatcher,
    id: SubscriptionId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        // already gone when the condition was met or the connection closed
        self.dispatcher.subscriptions.lock().remove(&self.id);
    }
}

impl FrameHandler for EventDispatcher {
    fn on_event(&self, event: Event) {
        self.dispatch(event);
    }

    fn on_closed(&self) {
        self.close();
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &self.subscription_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn erase<F, Fut>(callback: F) -> EventCallback
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), CallbackError>> + Send + 'static,
{
    Arc::new(move |event| callback(event).boxed())
}

/// Run one callback invocation on its own task, catching errors and panics
fn spawn_callback(id: SubscriptionId, callback: &EventCallback, event: Event) {
    let future = callback(event);
    tokio::spawn(async move {
        let failure = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        let error = EventManagerError::SubscriptionCallback {
            subscription: id.as_u64(),
            message: failure,
        };
        tracing::warn!(error = %error, "Subscription callback failed");
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
