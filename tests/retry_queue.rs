use chrono::Duration;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use servi_market::notify::{Notification, NotificationDispatcher};
use servi_market::retry::{RetryConfig, RetryQueue};
use servi_market::store::{MemStore, Store};

mod support;
use support::ScriptedSender;

struct Rig {
    store: Arc<MemStore>,
    email: Arc<ScriptedSender>,
    whatsapp: Arc<ScriptedSender>,
    dispatcher: Arc<NotificationDispatcher>,
    queue: RetryQueue,
}

fn rig(email_failures: usize, whatsapp_failures: usize) -> Rig {
    let store = Arc::new(MemStore::new());
    let email = Arc::new(ScriptedSender::failing(email_failures));
    let whatsapp = Arc::new(ScriptedSender::failing(whatsapp_failures));
    let store_dyn: Arc<dyn Store> = store.clone();
    let config = RetryConfig::default();
    let dispatcher = Arc::new(NotificationDispatcher::new(
        store_dyn.clone(),
        email.clone(),
        whatsapp.clone(),
        config.clone(),
    ));
    let queue = RetryQueue::new(store_dyn, dispatcher.clone(), config);
    Rig {
        store,
        email,
        whatsapp,
        dispatcher,
        queue,
    }
}

#[tokio::test]
async fn successful_delivery_never_registers_a_retry() {
    let rig = rig(0, 0);
    rig.dispatcher
        .send(Notification::email("ana@example.com", "hi", "body"))
        .await;
    assert_eq!(rig.email.attempts.load(Ordering::SeqCst), 1);
    assert!(rig.store.retry_operations_snapshot().is_empty());
}

#[tokio::test]
async fn delivers_on_third_attempt_with_growing_delays() {
    // fails twice, succeeds on the third attempt
    let rig = rig(0, 2);
    rig.dispatcher
        .send(Notification::whatsapp("+5511999990001", "your visit is confirmed"))
        .await;

    let ops = rig.store.retry_operations_snapshot();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].retries, 0);
    let first_delay = ops[0].next_retry_at - ops[0].created_at;
    assert_eq!(first_delay, Duration::seconds(30));

    // second attempt, still failing
    let t1 = ops[0].next_retry_at;
    assert_eq!(rig.queue.sweep(t1).await.unwrap(), 1);
    let ops = rig.store.retry_operations_snapshot();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].retries, 1);
    let second_delay = ops[0].next_retry_at - t1;
    assert_eq!(second_delay, Duration::seconds(60));
    assert!(second_delay > first_delay, "delays must strictly increase");

    // not due yet: nothing happens
    assert_eq!(rig.queue.sweep(t1).await.unwrap(), 0);
    assert_eq!(rig.whatsapp.attempts.load(Ordering::SeqCst), 2);

    // third attempt succeeds and the operation is gone
    let t2 = ops[0].next_retry_at;
    assert_eq!(rig.queue.sweep(t2).await.unwrap(), 1);
    assert!(rig.store.retry_operations_snapshot().is_empty());
    assert_eq!(rig.whatsapp.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(rig.whatsapp.sent.lock().len(), 1);
}

#[tokio::test]
async fn dropped_at_the_cap_and_never_retried_again() {
    // email caps at 3 retries; this sender never recovers
    let rig = rig(usize::MAX, 0);
    rig.dispatcher
        .send(Notification::email("ana@example.com", "hi", "body"))
        .await;

    let mut at = rig.store.retry_operations_snapshot()[0].next_retry_at;
    for _ in 0..2 {
        assert_eq!(rig.queue.sweep(at).await.unwrap(), 1);
        let ops = rig.store.retry_operations_snapshot();
        assert_eq!(ops.len(), 1, "still below the cap");
        at = ops[0].next_retry_at;
    }

    // third failed retry hits max_retries and drops the operation
    assert_eq!(rig.queue.sweep(at).await.unwrap(), 1);
    assert!(rig.store.retry_operations_snapshot().is_empty());
    assert_eq!(rig.email.attempts.load(Ordering::SeqCst), 4); // 1 send + 3 retries

    // a later sweep finds nothing: no retry number max_retries + 1
    assert_eq!(
        rig.queue.sweep(at + Duration::hours(24)).await.unwrap(),
        0
    );
    assert_eq!(rig.email.attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn channels_retry_independently() {
    let rig = rig(usize::MAX, usize::MAX);
    rig.dispatcher
        .send(Notification::email("ana@example.com", "hi", "body"))
        .await;
    rig.dispatcher
        .send(Notification::whatsapp("+5511999990001", "hello"))
        .await;

    let ops = rig.store.retry_operations_snapshot();
    assert_eq!(ops.len(), 2);
    // per-channel caps: email 3, whatsapp 5
    let email_op = ops.iter().find(|o| o.key.starts_with("email-")).unwrap();
    let whatsapp_op = ops.iter().find(|o| o.key.starts_with("whatsapp-")).unwrap();
    assert_eq!(email_op.max_retries, 3);
    assert_eq!(whatsapp_op.max_retries, 5);
}
