//! Queue span helpers.
//!
//! Provides span creation and claim recording for `get` calls.

use tracing::Span;

use crate::model::MessageId;

/// Start a span for a `get` call.
///
/// The `message.id` and `get.attempts` fields are declared empty and filled
/// in by [`record_claim`] / [`record_empty`].
pub fn start_get_span(running_reset_seconds: i64, wait_ms: i64) -> Span {
    tracing::info_span!(
        "queue.get",
        "get.running_reset_seconds" = running_reset_seconds,
        "get.wait_ms" = wait_ms,
        "message.id" = tracing::field::Empty,
        "get.attempts" = tracing::field::Empty,
    )
}

/// Record a successful claim on the span.
pub fn record_claim(span: &Span, id: MessageId, attempts: u64) {
    span.record("message.id", tracing::field::display(id));
    span.record("get.attempts", attempts);
    span.in_scope(|| {
        tracing::debug!(message_id = %id, attempts, "claimed message");
    });
}

/// Record a `get` that gave up without a message.
pub fn record_empty(span: &Span, attempts: u64) {
    span.record("get.attempts", attempts);
}
