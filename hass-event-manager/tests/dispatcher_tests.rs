//! Integration tests for the event dispatcher and the condition waiter

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hass_api::{Event, StateRecord};
use hass_event_manager::{EventDispatcher, EventFilter, EventManagerError};
use hass_stream::FrameHandler;
use serde_json::json;
use state_store::StateStore;
use tokio::sync::mpsc;
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

fn dispatcher() -> Arc<EventDispatcher> {
    Arc::new(EventDispatcher::new(Arc::new(StateStore::new())))
}

fn changed(entity_id: &str, state: &str) -> Event {
    Event::state_changed(entity_id, None, Some(StateRecord::new(entity_id, state)))
}

fn removed(entity_id: &str) -> Event {
    Event::state_changed(entity_id, Some(StateRecord::new(entity_id, "on")), None)
}

async fn wait_for_subscriptions(dispatcher: &EventDispatcher, expected: usize) {
    timeout(Duration::from_secs(1), async {
        while dispatcher.subscription_count() != expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("subscription count never reached expected value");
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_snapshot_updated_before_callbacks() {
    let dispatcher = dispatcher();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let store = Arc::clone(dispatcher.store());
    dispatcher.subscribe(EventFilter::state_changes_of("light.desk"), move |event| {
        let seen = store.get_state("light.desk").map(|record| record.state);
        let tx = tx.clone();
        async move {
            let announced = event.state_change().and_then(|c| c.new_state).map(|s| s.state);
            tx.send((seen.ok(), announced)).unwrap();
            Ok(())
        }
    });

    dispatcher.dispatch(changed("light.desk", "on"));

    let (seen, announced) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen.as_deref(), Some("on"));
    assert_eq!(announced.as_deref(), Some("on"));
}

#[tokio::test]
async fn test_callbacks_scheduled_in_event_order() {
    let dispatcher = dispatcher();
    let (tx, mut rx) = mpsc::unbounded_channel();

    dispatcher.subscribe(EventFilter::event_type("tick"), move |event| {
        // recorded synchronously, at scheduling time
        tx.send(event.data["n"].as_u64().unwrap()).unwrap();
        async { Ok(()) }
    });

    for n in 0..10u64 {
        dispatcher.dispatch(Event::new("tick", json!({"n": n})));
    }

    let mut order = Vec::new();
    for _ in 0..10 {
        order.push(rx.recv().await.unwrap());
    }
    assert_eq!(order, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_filters_route_events() {
    let dispatcher = dispatcher();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let desk_tx = tx.clone();
    dispatcher.subscribe(EventFilter::state_changes_of("light.desk"), move |_| {
        desk_tx.send("desk").unwrap();
        async { Ok(()) }
    });
    dispatcher.subscribe(EventFilter::event_type("call_service"), move |_| {
        tx.send("service").unwrap();
        async { Ok(()) }
    });

    dispatcher.dispatch(changed("light.porch", "on"));
    dispatcher.dispatch(changed("light.desk", "on"));
    dispatcher.dispatch(Event::new("call_service", json!({"domain": "light"})));

    assert_eq!(rx.recv().await, Some("desk"));
    assert_eq!(rx.recv().await, Some("service"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_and_once() {
    let dispatcher = dispatcher();
    let persistent = Arc::new(AtomicUsize::new(0));
    let single = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&persistent);
    let id = dispatcher.subscribe(EventFilter::all(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });
    let counter = Arc::clone(&single);
    dispatcher.subscribe_once(EventFilter::all(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });
    assert_eq!(dispatcher.subscription_count(), 2);

    dispatcher.dispatch(Event::new("a", json!({})));
    assert_eq!(dispatcher.subscription_count(), 1);
    dispatcher.dispatch(Event::new("b", json!({})));

    assert!(dispatcher.unsubscribe(id));
    assert!(!dispatcher.unsubscribe(id));
    dispatcher.dispatch(Event::new("c", json!({})));

    assert_eq!(persistent.load(Ordering::SeqCst), 2);
    assert_eq!(single.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_callbacks_are_isolated() {
    let dispatcher = dispatcher();
    let (tx, mut rx) = mpsc::unbounded_channel();

    dispatcher.subscribe(EventFilter::all(), |_| async { Err("boom".into()) });
    dispatcher.subscribe(EventFilter::all(), |event: Event| async move {
        assert!(event.event_type.is_empty(), "callback exploded");
        Ok(())
    });
    dispatcher.subscribe(EventFilter::all(), move |event| {
        let tx = tx.clone();
        async move {
            tx.send(event.event_type).unwrap();
            Ok(())
        }
    });

    dispatcher.dispatch(Event::new("first", json!({})));
    dispatcher.dispatch(Event::new("second", json!({})));

    let mut received = vec![
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(),
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(),
    ];
    received.sort();
    assert_eq!(received, vec!["first", "second"]);
    assert_eq!(dispatcher.subscription_count(), 3);
}

#[tokio::test]
async fn test_subscribers_may_reenter_dispatcher() {
    let dispatcher = dispatcher();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let reentrant = Arc::clone(&dispatcher);
    let first = dispatcher.subscribe(EventFilter::state_changes_of("light.desk"), move |_| {
        // synchronous part, runs while the event is being dispatched
        let count = reentrant.subscription_count();
        reentrant.subscribe_once(EventFilter::event_type("never"), |_| async { Ok(()) });
        tx.send(count).unwrap();
        async { Ok(()) }
    });
    let inspecting = Arc::clone(&dispatcher);
    dispatcher.subscribe(
        EventFilter::all().with_predicate(move |_| inspecting.subscription_count() > 0),
        |_| async { Ok(()) },
    );
    let waiter = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let inner = Arc::clone(&dispatcher);
            dispatcher
                .wait_until(
                    "light.desk",
                    move |record| inner.subscription_count() > 0 && record.state == "on",
                    Duration::from_secs(5),
                )
                .await
        }
    });
    wait_for_subscriptions(&dispatcher, 3).await;

    // a blocked dispatch must not take the test runtime down with it
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let runtime = tokio::runtime::Handle::current();
    let worker = Arc::clone(&dispatcher);
    std::thread::spawn(move || {
        let _context = runtime.enter();
        worker.dispatch(changed("light.desk", "on"));
        let _ = done_tx.send(());
    });
    timeout(Duration::from_secs(2), done_rx)
        .await
        .expect("dispatch blocked on a re-entrant subscriber")
        .unwrap();

    assert_eq!(rx.recv().await, Some(3));
    assert_eq!(waiter.await.unwrap().unwrap().state, "on");
    assert!(dispatcher.unsubscribe(first));
    assert_eq!(dispatcher.subscription_count(), 2);
}

#[tokio::test]
async fn test_removal_event_drops_entity() {
    let dispatcher = dispatcher();
    dispatcher.dispatch(changed("switch.pump", "on"));
    assert!(dispatcher.store().contains("switch.pump"));

    dispatcher.dispatch(removed("switch.pump"));
    assert!(!dispatcher.store().contains("switch.pump"));
}

// ============================================================================
// Condition waiter
// ============================================================================

#[tokio::test]
async fn test_wait_until_returns_immediately_when_true() {
    let dispatcher = dispatcher();
    dispatcher.dispatch(changed("light.desk", "on"));

    let record = dispatcher
        .wait_until("light.desk", |r| r.state == "on", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.state, "on");
    assert_eq!(dispatcher.subscription_count(), 0);
}

#[tokio::test]
async fn test_wait_until_zero_timeout_cleans_up() {
    let dispatcher = dispatcher();
    dispatcher.subscribe(EventFilter::all(), |_| async { Ok(()) });
    let baseline = dispatcher.subscription_count();

    let result = dispatcher
        .wait_until("light.desk", |r| r.state == "on", Duration::ZERO)
        .await;

    assert!(matches!(
        result,
        Err(EventManagerError::ConditionTimeout { ref entity_id, .. }) if entity_id == "light.desk"
    ));
    assert_eq!(dispatcher.subscription_count(), baseline);
}

#[tokio::test]
async fn test_wait_until_resolves_on_transition() {
    let dispatcher = dispatcher();
    dispatcher.dispatch(changed("cover.garage", "closed"));

    let waiter = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            dispatcher
                .wait_for_state("cover.garage", "open", Duration::from_secs(5))
                .await
        }
    });
    wait_for_subscriptions(&dispatcher, 1).await;

    dispatcher.dispatch(changed("cover.garage", "opening"));
    assert_eq!(dispatcher.subscription_count(), 1);
    dispatcher.dispatch(changed("cover.garage", "open"));

    let record = waiter.await.unwrap().unwrap();
    assert_eq!(record.state, "open");
    assert_eq!(dispatcher.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_times_out_without_match() {
    let dispatcher = dispatcher();

    let waiter = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            dispatcher
                .wait_for_state("lock.front", "locked", Duration::from_secs(30))
                .await
        }
    });
    wait_for_subscriptions(&dispatcher, 1).await;
    dispatcher.dispatch(changed("lock.front", "unlocked"));
    dispatcher.dispatch(removed("lock.front"));

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(EventManagerError::ConditionTimeout { .. })));
    assert_eq!(dispatcher.subscription_count(), 0);
}

#[tokio::test]
async fn test_abandoned_wait_removes_waiter() {
    let dispatcher = dispatcher();

    let waiter = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            dispatcher
                .wait_for_state("cover.garage", "open", Duration::from_secs(60))
                .await
        }
    });
    wait_for_subscriptions(&dispatcher, 1).await;

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    assert_eq!(dispatcher.subscription_count(), 0);
}

#[tokio::test]
async fn test_close_fails_waiters() {
    let dispatcher = dispatcher();
    dispatcher.subscribe(EventFilter::all(), |_| async { Ok(()) });

    let waiter = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            dispatcher
                .wait_for_state("light.desk", "on", Duration::from_secs(5))
                .await
        }
    });
    wait_for_subscriptions(&dispatcher, 2).await;

    dispatcher.on_closed();

    assert!(matches!(
        waiter.await.unwrap(),
        Err(EventManagerError::ConnectionClosed { .. })
    ));
    assert_eq!(dispatcher.subscription_count(), 0);

    let late = dispatcher
        .wait_for_state("light.desk", "on", Duration::from_secs(5))
        .await;
    assert!(matches!(late, Err(EventManagerError::ConnectionClosed { .. })));
}
