//! Integration tests for the queue protocol over the memory store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use docqueue::clock::ManualClock;
use docqueue::model::{INT32_MAX, MessageRecord, fields};
use docqueue::query::{Condition, FieldPath, Filter, Update};
use docqueue::store::DocumentStore;
use docqueue::store::memory::MemoryStore;
use docqueue::{Error, GetOptions, Message, NewMessage, Queue, Release};
use serde_json::{Value, json};

/// Claim duration that never lapses during a test.
const MAX_TIMEOUT: i64 = i64::MAX;

fn test_queue() -> (Queue<MemoryStore>, Arc<ManualClock>) {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let queue = Queue::new(MemoryStore::new("testing", "messages")).with_clock(clock.clone());
    (queue, clock)
}

fn now_secs(clock: &ManualClock) -> i64 {
    use docqueue::clock::Clock;
    clock.now().timestamp()
}

async fn only_record(queue: &Queue<MemoryStore>) -> MessageRecord {
    let records = queue.store().records().await.unwrap();
    assert_eq!(records.len(), 1, "expected exactly one record");
    records.into_iter().next().unwrap()
}

async fn get_now(queue: &Queue<MemoryStore>, query: Value) -> Option<Message> {
    queue.get(&query, GetOptions::new(MAX_TIMEOUT)).await.unwrap()
}

/// The handle document `{"id": ..., ...payload}` for comparisons.
fn handle_doc(message: &Message) -> Value {
    Value::Object(message.to_document())
}

fn with_id(message: &Message, payload: Value) -> Value {
    let mut expected = payload.as_object().cloned().unwrap();
    expected.insert("id".to_string(), json!(message.id().to_string()));
    Value::Object(expected)
}

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_stores_idle_record() {
    let (queue, clock) = test_queue();
    let payload = json!({"key1": 0, "key2": true});

    let id = queue
        .send(NewMessage::new(payload.clone()).earliest_get(34).priority(0.8))
        .await
        .unwrap();

    let record = only_record(&queue).await;
    assert_eq!(record.id, id);
    assert_eq!(Value::Object(record.payload), payload);
    assert!(!record.running);
    assert_eq!(record.reset_timestamp, INT32_MAX);
    assert_eq!(record.earliest_get, 34);
    assert_eq!(record.priority, 0.8);
    assert_eq!(record.created, now_secs(&clock));
}

#[tokio::test]
async fn send_clamps_high_earliest_get() {
    let (queue, _) = test_queue();
    queue
        .send(NewMessage::new(json!({})).earliest_get(i64::MAX))
        .await
        .unwrap();
    assert_eq!(only_record(&queue).await.earliest_get, INT32_MAX);
}

#[tokio::test]
async fn send_clamps_low_earliest_get() {
    let (queue, _) = test_queue();
    queue
        .send(NewMessage::new(json!({})).earliest_get(-1))
        .await
        .unwrap();
    assert_eq!(only_record(&queue).await.earliest_get, 0);
}

#[tokio::test]
async fn send_defaults_priority_to_send_time() {
    let (queue, clock) = test_queue();
    queue.send(NewMessage::new(json!({}))).await.unwrap();
    assert_eq!(only_record(&queue).await.priority, now_secs(&clock) as f64);
}

#[tokio::test]
async fn send_rejects_non_finite_priority_and_non_document_payload() {
    let (queue, _) = test_queue();

    for priority in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let result = queue.send(NewMessage::new(json!({})).priority(priority)).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
    let result = queue.send(NewMessage::new(json!([1, 2]))).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    assert_eq!(queue.count(&json!({}), None).await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Get
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_by_bad_query_returns_none() {
    let (queue, _) = test_queue();
    queue
        .send(NewMessage::new(json!({"key1": 0, "key2": true})))
        .await
        .unwrap();

    assert!(get_now(&queue, json!({"key3": 0})).await.is_none());
    assert_eq!(queue.count(&json!({}), None).await.unwrap(), 1);
}

#[tokio::test]
async fn get_by_full_query_replaces_payload_id() {
    let (queue, _) = test_queue();
    let message_one = json!({"id": "SHOULD BE REMOVED", "key1": 0, "key2": true});
    queue.send(NewMessage::new(message_one.clone())).await.unwrap();
    queue
        .send(NewMessage::new(json!({"key": "value"})))
        .await
        .unwrap();

    let result = get_now(&queue, message_one.clone()).await.unwrap();
    let doc = handle_doc(&result);
    assert_ne!(doc["id"], json!("SHOULD BE REMOVED"));
    assert_eq!(doc, with_id(&result, message_one.clone()));
    // the handle still carries the payload as stored
    assert_eq!(Value::Object(result.payload().clone()), message_one);
}

#[tokio::test]
async fn get_by_subdocument_query() {
    let (queue, _) = test_queue();
    let message_two = json!({
        "one": {"two": {"three": 5, "notused": "notused"}, "notused": "notused"},
        "notused": "notused"
    });
    queue
        .send(NewMessage::new(json!({"key1": 0, "key2": true})))
        .await
        .unwrap();
    queue.send(NewMessage::new(message_two.clone())).await.unwrap();

    let result = get_now(&queue, json!({"one.two.three": {"$gt": 4}}))
        .await
        .unwrap();
    assert_eq!(handle_doc(&result), with_id(&result, message_two));
}

#[tokio::test]
async fn get_before_ack_returns_none() {
    let (queue, _) = test_queue();
    let message_one = json!({"key1": 0, "key2": true});
    queue.send(NewMessage::new(message_one.clone())).await.unwrap();
    queue
        .send(NewMessage::new(json!({"key": "value"})))
        .await
        .unwrap();

    assert!(get_now(&queue, message_one.clone()).await.is_some());
    assert!(get_now(&queue, message_one).await.is_none());
}

#[tokio::test]
async fn get_single_claim_scenario() {
    let (queue, _) = test_queue();
    queue.send(NewMessage::new(json!({"k": 0}))).await.unwrap();

    assert!(get_now(&queue, json!({"k": 0})).await.is_some());
    assert!(get_now(&queue, json!({"k": 0})).await.is_none());
}

#[tokio::test]
async fn get_with_custom_priority() {
    let (queue, _) = test_queue();
    queue
        .send(NewMessage::new(json!({"k": 0})).priority(0.5))
        .await
        .unwrap();
    queue
        .send(NewMessage::new(json!({"k": 1})).priority(0.4))
        .await
        .unwrap();
    queue
        .send(NewMessage::new(json!({"k": 2})).priority(0.3))
        .await
        .unwrap();

    for expected in [json!({"k": 2}), json!({"k": 1}), json!({"k": 0})] {
        let result = get_now(&queue, json!({})).await.unwrap();
        assert_eq!(Value::Object(result.into_payload()), expected);
    }
}

#[tokio::test]
async fn get_with_time_based_priority() {
    let (queue, clock) = test_queue();
    for k in 0..3 {
        queue.send(NewMessage::new(json!({"key": k}))).await.unwrap();
        clock.advance(Duration::milliseconds(1));
    }

    for k in 0..3 {
        let result = get_now(&queue, json!({})).await.unwrap();
        assert_eq!(Value::Object(result.into_payload()), json!({"key": k}));
    }
}

#[tokio::test]
async fn equal_priority_and_created_keeps_send_order() {
    let (queue, _) = test_queue();
    for k in 0..3 {
        queue
            .send(NewMessage::new(json!({"key": k})).priority(1.0))
            .await
            .unwrap();
    }

    for k in 0..3 {
        let result = get_now(&queue, json!({})).await.unwrap();
        assert_eq!(Value::Object(result.into_payload()), json!({"key": k}));
    }
}

#[tokio::test]
async fn requeue_with_old_timestamp_keeps_send_order() {
    let (queue, clock) = test_queue();
    for k in 0..3 {
        queue.send(NewMessage::new(json!({"key": k}))).await.unwrap();
        clock.advance(Duration::milliseconds(1));
    }

    let first = get_now(&queue, json!({})).await.unwrap();
    queue
        .requeue(&first, Release::default().refresh_created(false))
        .await
        .unwrap();

    for k in 0..3 {
        let result = get_now(&queue, json!({})).await.unwrap();
        assert_eq!(Value::Object(result.into_payload()), json!({"key": k}));
    }
}

#[tokio::test(start_paused = true)]
async fn get_waits_for_the_full_duration() {
    let (queue, _) = test_queue();
    let start = tokio::time::Instant::now();

    let result = queue
        .get(&json!({}), GetOptions::new(MAX_TIMEOUT).wait_ms(200))
        .await
        .unwrap();

    let elapsed = start.elapsed();
    assert!(result.is_none());
    assert!(elapsed >= std::time::Duration::from_millis(200));
    assert!(elapsed < std::time::Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn get_picks_up_message_sent_while_waiting() {
    let (queue, _) = test_queue();
    let sender = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        sender
            .send(NewMessage::new(json!({"late": true})))
            .await
            .unwrap();
    });

    let result = queue
        .get(
            &json!({}),
            GetOptions::new(MAX_TIMEOUT).wait_ms(1_000).poll_ms(10),
        )
        .await
        .unwrap();
    assert!(result.is_some());
}

#[tokio::test(start_paused = true)]
async fn get_with_zero_poll_still_sleeps_between_attempts() {
    let (queue, _) = test_queue();
    let start = tokio::time::Instant::now();

    let result = queue
        .get(&json!({}), GetOptions::new(MAX_TIMEOUT).wait_ms(20).poll_ms(0))
        .await
        .unwrap();

    assert!(result.is_none());
    assert!(start.elapsed() >= std::time::Duration::from_millis(20));
}

#[tokio::test]
async fn get_with_negative_poll_uses_default() {
    let (queue, _) = test_queue();
    queue.send(NewMessage::new(json!({"key1": 0}))).await.unwrap();

    let result = queue
        .get(&json!({}), GetOptions::new(0).poll_ms(-1))
        .await
        .unwrap();
    assert!(result.is_some());
}

#[tokio::test]
async fn get_rejects_bad_arguments_before_touching_store() {
    let (queue, _) = test_queue();
    queue.send(NewMessage::new(json!({"k": 1}))).await.unwrap();

    let negative_wait = queue
        .get(&json!({}), GetOptions::new(0).wait_ms(-1))
        .await;
    assert!(matches!(negative_wait, Err(Error::InvalidArgument(_))));

    let empty_key = queue.get(&json!({"": "a value"}), GetOptions::new(0)).await;
    assert!(matches!(empty_key, Err(Error::InvalidArgument(_))));

    let not_a_document = queue.get(&json!("k"), GetOptions::new(0)).await;
    assert!(matches!(not_a_document, Err(Error::InvalidArgument(_))));

    assert_eq!(queue.count(&json!({}), Some(true)).await.unwrap(), 0);
}

#[tokio::test]
async fn earliest_get_defers_claim() {
    let (queue, clock) = test_queue();
    let message_one = json!({"key1": 0, "key2": true});
    queue
        .send(NewMessage::new(message_one.clone()).earliest_get(now_secs(&clock) + 1))
        .await
        .unwrap();

    assert!(get_now(&queue, message_one.clone()).await.is_none());

    clock.advance(Duration::seconds(1));
    assert!(get_now(&queue, message_one).await.is_some());
}

#[tokio::test]
async fn expired_claim_is_reclaimed_with_fresh_deadline() {
    let (queue, clock) = test_queue();
    queue.send(NewMessage::new(json!({"key": 0}))).await.unwrap();
    queue.send(NewMessage::new(json!({"key": 1}))).await.unwrap();

    // mark both as running with a deadline of now
    let now = now_secs(&clock);
    let stuck = Update::new()
        .set(fields::RUNNING, true)
        .set(fields::RESET_TIMESTAMP, now);
    let marked = queue.store().update_many(&Filter::new(), &stuck).await.unwrap();
    assert_eq!(marked, 2);
    assert_eq!(queue.count(&json!({}), Some(true)).await.unwrap(), 2);

    // a zero-length claim leaves the message immediately reclaimable
    let first = queue
        .get(&json!({"key": 0}), GetOptions::new(0))
        .await
        .unwrap()
        .unwrap();
    let second = queue
        .get(&json!({"key": 0}), GetOptions::new(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id(), second.id());

    let records = queue.store().records().await.unwrap();
    let reclaimed = records.iter().find(|r| r.id == second.id()).unwrap();
    assert!(reclaimed.running);
    assert_eq!(reclaimed.reset_timestamp, now + 30);

    // still claimed, so no third delivery
    assert!(
        queue
            .get(&json!({"key": 0}), GetOptions::new(30))
            .await
            .unwrap()
            .is_none()
    );
    clock.advance(Duration::seconds(30));
    assert!(get_now(&queue, json!({"key": 0})).await.is_some());
}

#[tokio::test]
async fn concurrent_gets_never_share_a_claim() {
    let (queue, _) = test_queue();
    for k in 0..5 {
        queue.send(NewMessage::new(json!({"k": k}))).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue
                .get(&json!({}), GetOptions::new(MAX_TIMEOUT))
                .await
                .unwrap()
        }));
    }

    let mut claimed = HashSet::new();
    for task in tasks {
        if let Some(message) = task.await.unwrap() {
            assert!(claimed.insert(message.id()), "message claimed twice");
        }
    }
    assert_eq!(claimed.len(), 5);
}

// ---------------------------------------------------------------------------
// Count
// ---------------------------------------------------------------------------

#[tokio::test]
async fn count_by_running_state() {
    let (queue, _) = test_queue();
    let message = json!({"boo": "scary"});

    assert_eq!(queue.count(&message, Some(true)).await.unwrap(), 0);
    assert_eq!(queue.count(&message, Some(false)).await.unwrap(), 0);
    assert_eq!(queue.count(&message, None).await.unwrap(), 0);

    queue.send(NewMessage::new(message.clone())).await.unwrap();
    assert_eq!(queue.count(&message, Some(false)).await.unwrap(), 1);
    assert_eq!(queue.count(&message, Some(true)).await.unwrap(), 0);
    assert_eq!(queue.count(&message, None).await.unwrap(), 1);

    get_now(&queue, message.clone()).await.unwrap();
    assert_eq!(queue.count(&message, Some(false)).await.unwrap(), 0);
    assert_eq!(queue.count(&message, Some(true)).await.unwrap(), 1);
    assert_eq!(queue.count(&message, None).await.unwrap(), 1);
}

#[tokio::test]
async fn count_rejects_malformed_query() {
    let (queue, _) = test_queue();
    let result = queue.count(&json!({"": "a value"}), None).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

// ---------------------------------------------------------------------------
// Ack / AckSend / Requeue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ack_deletes_message() {
    let (queue, _) = test_queue();
    let message_one = json!({"key1": 0, "key2": true});
    queue.send(NewMessage::new(message_one.clone())).await.unwrap();
    queue
        .send(NewMessage::new(json!({"key": "value"})))
        .await
        .unwrap();

    let result = get_now(&queue, message_one).await.unwrap();
    assert_eq!(queue.count(&json!({}), None).await.unwrap(), 2);

    queue.ack(&result).await.unwrap();
    assert_eq!(queue.count(&json!({}), None).await.unwrap(), 1);

    // second ack of the same handle is accepted
    queue.ack(&result).await.unwrap();
    assert_eq!(queue.count(&json!({}), None).await.unwrap(), 1);
}

#[tokio::test]
async fn ack_send_replaces_in_place() {
    let (queue, _) = test_queue();
    let message_one = json!({"key1": 0, "key2": true});
    let message_three = json!({"hi": "there", "rawr": 2});
    queue.send(NewMessage::new(message_one.clone())).await.unwrap();
    queue
        .send(NewMessage::new(json!({"key": "value"})))
        .await
        .unwrap();

    let result_one = get_now(&queue, message_one).await.unwrap();
    assert_eq!(queue.count(&json!({}), None).await.unwrap(), 2);

    queue
        .ack_send(&result_one, message_three.clone(), Release::default())
        .await
        .unwrap();
    assert_eq!(queue.count(&json!({}), None).await.unwrap(), 2);
    assert_eq!(queue.count(&json!({}), Some(true)).await.unwrap(), 0);

    let actual = get_now(&queue, json!({"hi": "there"})).await.unwrap();
    assert_eq!(actual.id(), result_one.id());
    assert_eq!(handle_doc(&actual), with_id(&result_one, message_three));
}

#[tokio::test]
async fn ack_send_with_high_earliest_get() {
    let (queue, clock) = test_queue();
    queue.send(NewMessage::new(json!({}))).await.unwrap();
    let message = get_now(&queue, json!({})).await.unwrap();

    clock.advance(Duration::seconds(5));
    queue
        .ack_send(&message, json!({}), Release::default().earliest_get(i64::MAX))
        .await
        .unwrap();

    let record = only_record(&queue).await;
    assert!(!record.running);
    assert_eq!(record.reset_timestamp, INT32_MAX);
    assert_eq!(record.earliest_get, INT32_MAX);
    assert_eq!(record.priority, 0.0);
    assert_eq!(record.created, now_secs(&clock));
}

#[tokio::test]
async fn ack_send_with_low_earliest_get() {
    let (queue, _) = test_queue();
    queue.send(NewMessage::new(json!({}))).await.unwrap();
    let message = get_now(&queue, json!({})).await.unwrap();

    queue
        .ack_send(&message, json!({}), Release::default().earliest_get(-1))
        .await
        .unwrap();

    let record = only_record(&queue).await;
    assert_eq!(record.earliest_get, 0);
    assert_eq!(record.reset_timestamp, INT32_MAX);
}

#[tokio::test]
async fn ack_send_can_keep_created() {
    let (queue, clock) = test_queue();
    queue.send(NewMessage::new(json!({}))).await.unwrap();
    let sent_at = now_secs(&clock);
    let message = get_now(&queue, json!({})).await.unwrap();

    clock.advance(Duration::seconds(60));
    queue
        .ack_send(
            &message,
            json!({"next": 1}),
            Release::default().priority(2.5).refresh_created(false),
        )
        .await
        .unwrap();

    let record = only_record(&queue).await;
    assert_eq!(record.created, sent_at);
    assert_eq!(record.priority, 2.5);
}

#[tokio::test]
async fn ack_send_rejects_bad_arguments_without_side_effects() {
    let (queue, _) = test_queue();
    queue.send(NewMessage::new(json!({"k": 1}))).await.unwrap();
    let message = get_now(&queue, json!({})).await.unwrap();

    let nan = queue
        .ack_send(&message, json!({}), Release::default().priority(f64::NAN))
        .await;
    assert!(matches!(nan, Err(Error::InvalidArgument(_))));

    let not_a_document = queue
        .ack_send(&message, json!(5), Release::default())
        .await;
    assert!(matches!(not_a_document, Err(Error::InvalidArgument(_))));

    let record = only_record(&queue).await;
    assert!(record.running);
    assert_eq!(Value::Object(record.payload), json!({"k": 1}));
}

#[tokio::test]
async fn ack_send_after_lapsed_claim_was_acked_keeps_new_payload() {
    let (queue, clock) = test_queue();
    queue.send(NewMessage::new(json!({"step": 1}))).await.unwrap();

    let first = queue
        .get(&json!({}), GetOptions::new(10))
        .await
        .unwrap()
        .unwrap();
    clock.advance(Duration::seconds(11));
    let second = get_now(&queue, json!({})).await.unwrap();
    assert_eq!(second.id(), first.id());
    queue.ack(&second).await.unwrap();

    queue
        .ack_send(&first, json!({"step": 2}), Release::default().priority(0.5))
        .await
        .unwrap();

    let record = only_record(&queue).await;
    assert_eq!(record.id, first.id());
    assert_eq!(Value::Object(record.payload), json!({"step": 2}));
    assert!(!record.running);
    assert_eq!(record.reset_timestamp, INT32_MAX);
    assert_eq!(record.priority, 0.5);
    assert_eq!(record.created, now_secs(&clock));

    let next = get_now(&queue, json!({"step": 2})).await.unwrap();
    assert_eq!(next.id(), first.id());
}

#[tokio::test]
async fn requeue_after_ack_stores_message_again() {
    let (queue, clock) = test_queue();
    queue.send(NewMessage::new(json!({"k": 1}))).await.unwrap();
    let message = get_now(&queue, json!({})).await.unwrap();
    queue.ack(&message).await.unwrap();

    queue
        .requeue(&message, Release::default().refresh_created(false))
        .await
        .unwrap();

    let record = only_record(&queue).await;
    assert_eq!(Value::Object(record.payload), json!({"k": 1}));
    assert_eq!(record.created, now_secs(&clock));
    assert_eq!(queue.count(&json!({}), Some(false)).await.unwrap(), 1);
}

#[tokio::test]
async fn requeue_releases_unchanged_payload() {
    let (queue, _) = test_queue();
    let message_one = json!({"key1": 0, "key2": true});
    queue.send(NewMessage::new(message_one.clone())).await.unwrap();
    queue
        .send(NewMessage::new(json!({"key": "value"})))
        .await
        .unwrap();

    let before = get_now(&queue, message_one.clone()).await.unwrap();
    queue.requeue(&before, Release::default()).await.unwrap();
    assert_eq!(queue.count(&json!({}), None).await.unwrap(), 2);

    let after = queue
        .get(&message_one, GetOptions::new(0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.id(), before.id());
    assert_eq!(handle_doc(&after), with_id(&after, message_one));
}

#[tokio::test]
async fn requeue_keeps_payload_id_field() {
    let (queue, _) = test_queue();
    let payload = json!({"id": "mine", "n": 1});
    queue.send(NewMessage::new(payload.clone())).await.unwrap();

    let message = get_now(&queue, json!({})).await.unwrap();
    queue.requeue(&message, Release::default()).await.unwrap();

    assert_eq!(Value::Object(only_record(&queue).await.payload), payload);
}

#[tokio::test]
async fn requeue_accepts_handle_parsed_from_document() {
    let (queue, _) = test_queue();
    queue.send(NewMessage::new(json!({"n": 1}))).await.unwrap();
    let message = get_now(&queue, json!({})).await.unwrap();

    let wire = serde_json::to_value(&message).unwrap();
    let parsed = Message::from_document(wire).unwrap();
    queue.requeue(&parsed, Release::default()).await.unwrap();

    assert_eq!(queue.count(&json!({}), Some(false)).await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Reset stuck
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_stuck_releases_only_expired_claims() {
    let (queue, clock) = test_queue();
    for k in 0..3 {
        queue.send(NewMessage::new(json!({"key": k}))).await.unwrap();
    }
    queue
        .get(&json!({"key": 0}), GetOptions::new(10))
        .await
        .unwrap()
        .unwrap();
    queue
        .get(&json!({"key": 1}), GetOptions::new(100))
        .await
        .unwrap()
        .unwrap();

    clock.advance(Duration::seconds(10));
    assert_eq!(queue.reset_stuck().await.unwrap(), 1);

    assert_eq!(queue.count(&json!({}), Some(false)).await.unwrap(), 2);
    let still_running = Filter::new()
        .and(FieldPath::field(fields::RUNNING), Condition::Eq(json!(true)))
        .and(FieldPath::payload("key").unwrap(), Condition::Eq(json!(1)));
    assert_eq!(queue.store().count(&still_running).await.unwrap(), 1);

    let record = queue
        .store()
        .records()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.payload["key"] == json!(0))
        .unwrap();
    assert_eq!(record.reset_timestamp, INT32_MAX);
}
