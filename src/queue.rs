//! The queue protocol. The public API for sending and consuming messages.
//!
//! All state lives in the store; a `Queue` is just a store handle, a clock
//! and a default poll interval, so any number of queues (in any number of
//! processes) can work the same collection concurrently. Every state change
//! is a single-document store operation:
//!
//! - `send` inserts an idle record.
//! - `get` claims with one find-and-modify per poll.
//! - `ack` deletes by id.
//! - `ack_send` / `requeue` replace-and-release by id in one update, so no
//!   crash can land between "remove old" and "insert new".
//!
//! Delivery is at-least-once: a claim whose deadline lapses before `ack`
//! can be claimed again by anyone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::{Value, json};
use tracing::Instrument as _;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::index;
use crate::model::*;
use crate::query::{Condition, FieldPath, Filter, SortKey, Update};
use crate::store::DocumentStore;
use crate::telemetry::{metrics, spans};

/// Poll interval used when `get` is given a negative `poll_ms`.
pub const DEFAULT_POLL_MS: u64 = 200;

/// Shortest sleep between claim attempts; a zero poll interval is raised to this.
const MIN_POLL: Duration = Duration::from_millis(1);

/// A priority queue over one store collection.
#[derive(Clone)]
pub struct Queue<S> {
    store: S,
    clock: Arc<dyn Clock>,
    default_poll: Duration,
}

impl<S: DocumentStore> Queue<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            default_poll: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }

    /// Use a different clock for timestamps and eligibility.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Interval used by `get` when `poll_ms` is negative.
    pub fn with_default_poll_ms(mut self, ms: u64) -> Self {
        self.default_poll = Duration::from_millis(ms);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Insert a new idle message. Returns its id.
    pub async fn send(&self, new: NewMessage) -> Result<MessageId> {
        let payload = payload_document(new.payload)?;
        let now = self.now();
        let priority = new
            .priority
            .unwrap_or_else(|| now.timestamp_micros() as f64 / 1_000_000.0);
        require_finite(priority)?;

        let record = MessageRecord {
            id: MessageId::new(),
            payload,
            running: false,
            priority,
            created: now.timestamp(),
            earliest_get: clamp_timestamp(new.earliest_get),
            reset_timestamp: INT32_MAX,
        };
        self.store.insert(&record).await?;

        count_operation("send");
        tracing::debug!(message_id = %record.id, priority, "sent message");
        Ok(record.id)
    }

    // -----------------------------------------------------------------------
    // Get
    // -----------------------------------------------------------------------

    /// Claim the best eligible message matching `query`.
    ///
    /// Polls until a message is claimed or `wait_ms` has elapsed. Returns
    /// `None` when nothing could be claimed in time.
    pub async fn get(&self, query: &Value, options: GetOptions) -> Result<Option<Message>> {
        if options.wait_ms < 0 {
            return Err(Error::invalid(format!(
                "wait_ms must be >= 0, got {}",
                options.wait_ms
            )));
        }
        let filter = Filter::payload_query(query)?;
        let poll = if options.poll_ms < 0 {
            self.default_poll
        } else {
            Duration::from_millis(options.poll_ms as u64)
        };
        let wait = Duration::from_millis(options.wait_ms as u64);

        let span = spans::start_get_span(options.running_reset_seconds, options.wait_ms);
        self.poll_claim(filter, options.running_reset_seconds, wait, poll, &span)
            .instrument(span.clone())
            .await
    }

    async fn poll_claim(
        &self,
        filter: Filter,
        running_reset_seconds: i64,
        wait: Duration,
        poll: Duration,
        span: &tracing::Span,
    ) -> Result<Option<Message>> {
        let sort = claim_sort();
        let started = tokio::time::Instant::now();
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            let now = self.now().timestamp();
            let eligible = filter.clone().extend(eligibility(now));
            let update = Update::new()
                .set(fields::RUNNING, true)
                .set(
                    fields::RESET_TIMESTAMP,
                    clamp_timestamp(now.saturating_add(running_reset_seconds)),
                );

            if let Some(prior) = self.store.claim_one(&eligible, &sort, &update).await? {
                spans::record_claim(span, prior.id, attempts);
                finish_get("get", attempts, started.elapsed());
                return Ok(Some(prior.into()));
            }

            let elapsed = started.elapsed();
            if elapsed >= wait {
                spans::record_empty(span, attempts);
                finish_get("get_empty", attempts, elapsed);
                return Ok(None);
            }
            tracing::trace!(attempts, "nothing to claim, sleeping");
            tokio::time::sleep(poll.max(MIN_POLL).min(wait - elapsed)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Ack / AckSend / Requeue
    // -----------------------------------------------------------------------

    /// Delete a claimed message. Acking a message that is already gone is
    /// accepted.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        let deleted = self.store.delete_by_id(message.id()).await?;
        if !deleted {
            tracing::debug!(message_id = %message.id(), "ack of message that no longer exists");
        }
        count_operation("ack");
        Ok(())
    }

    /// Replace the message's payload and release it back to the queue, in
    /// one atomic update.
    pub async fn ack_send(&self, message: &Message, payload: Value, release: Release) -> Result<()> {
        let payload = payload_document(payload)?;
        self.release(message, payload, release, "ack_send").await
    }

    /// Release the message back to the queue with its payload unchanged.
    pub async fn requeue(&self, message: &Message, release: Release) -> Result<()> {
        self.release(message, message.payload().clone(), release, "requeue")
            .await
    }

    async fn release(
        &self,
        message: &Message,
        payload: serde_json::Map<String, Value>,
        release: Release,
        operation: &'static str,
    ) -> Result<()> {
        require_finite(release.priority)?;

        let now = self.now().timestamp();
        let earliest_get = clamp_timestamp(release.earliest_get);
        let mut update = Update::new()
            .set(fields::PAYLOAD, payload.clone())
            .set(fields::RUNNING, false)
            .set(fields::RESET_TIMESTAMP, INT32_MAX)
            .set(fields::EARLIEST_GET, earliest_get)
            .set(fields::PRIORITY, release.priority);
        if release.refresh_created {
            update = update.set(fields::CREATED, now);
        }

        // written whole when another consumer already acked the message
        let record = MessageRecord {
            id: message.id(),
            payload,
            running: false,
            priority: release.priority,
            created: now,
            earliest_get,
            reset_timestamp: INT32_MAX,
        };
        let existed = self.store.upsert_by_id(&record, &update).await?;
        if !existed {
            tracing::warn!(
                message_id = %message.id(),
                operation,
                "released message was already gone; stored it again"
            );
        }
        count_operation(operation);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Count / maintenance
    // -----------------------------------------------------------------------

    /// Count messages matching `query`. `running` narrows to claimed
    /// (`Some(true)`) or idle (`Some(false)`) messages.
    ///
    /// Not atomic with respect to concurrent claims; for monitoring only.
    pub async fn count(&self, query: &Value, running: Option<bool>) -> Result<u64> {
        let payload = Filter::payload_query(query)?;
        let mut filter = Filter::new();
        if let Some(running) = running {
            filter = filter.and(FieldPath::field(fields::RUNNING), Condition::Eq(json!(running)));
        }
        let count = self.store.count(&filter.extend(payload)).await?;
        count_operation("count");
        Ok(count)
    }

    /// Release every claim whose deadline has passed. Returns how many
    /// messages went back to idle.
    ///
    /// `get` reclaims expired messages on its own; this only tidies up the
    /// `running` flag for `count` and other observers.
    pub async fn reset_stuck(&self) -> Result<u64> {
        let now = self.now().timestamp();
        let filter = Filter::new()
            .and(FieldPath::field(fields::RUNNING), Condition::Eq(json!(true)))
            .and(
                FieldPath::field(fields::RESET_TIMESTAMP),
                Condition::Lte(json!(now)),
            );
        let update = Update::new()
            .set(fields::RUNNING, false)
            .set(fields::RESET_TIMESTAMP, INT32_MAX);
        let released = self.store.update_many(&filter, &update).await?;
        if released > 0 {
            tracing::info!(released, "released expired claims");
        }
        count_operation("reset_stuck");
        Ok(released)
    }

    // -----------------------------------------------------------------------
    // Indexes
    // -----------------------------------------------------------------------

    /// Ensure indexes for `get` queries that filter on the `before` payload
    /// keys and sort on the `after` ones. Keys are `(field, 1 | -1)`.
    pub async fn ensure_get_index(&self, before: &[(&str, i32)], after: &[(&str, i32)]) -> Result<()> {
        let claim_keys = index::get_index_keys(before, after)?;
        index::ensure_indexes(&self.store, vec![claim_keys, index::reset_index_keys()]).await?;
        Ok(())
    }

    /// Ensure an index for `count` queries on `keys`, optionally led by
    /// `running`.
    pub async fn ensure_count_index(&self, keys: &[(&str, i32)], include_running: bool) -> Result<()> {
        let keys = index::count_index_keys(keys, include_running)?;
        index::ensure_index(&self.store, keys).await?;
        Ok(())
    }
}

/// `earliestGet <= now AND (running = false OR resetTimestamp <= now)`.
fn eligibility(now: i64) -> Filter {
    Filter::new()
        .and(
            FieldPath::field(fields::EARLIEST_GET),
            Condition::Lte(json!(now)),
        )
        .or(vec![
            Filter::new().and(FieldPath::field(fields::RUNNING), Condition::Eq(json!(false))),
            Filter::new().and(
                FieldPath::field(fields::RESET_TIMESTAMP),
                Condition::Lte(json!(now)),
            ),
        ])
}

fn claim_sort() -> [SortKey; 2] {
    [
        SortKey::ascending(FieldPath::field(fields::PRIORITY)),
        SortKey::ascending(FieldPath::field(fields::CREATED)),
    ]
}

fn require_finite(priority: f64) -> Result<()> {
    if priority.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "priority must be a finite number, got {priority}"
        )))
    }
}

fn count_operation(operation: &'static str) {
    metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
}

fn finish_get(operation: &'static str, attempts: u64, elapsed: Duration) {
    count_operation(operation);
    metrics::get_poll_attempts().record(attempts, &[]);
    metrics::operation_duration_ms().record(
        elapsed.as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", "get")],
    );
}
