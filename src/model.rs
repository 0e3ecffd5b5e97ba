//! Core data model.
//!
//! A message record is the persisted unit of work: an opaque payload plus the
//! queue metadata that drives claiming (priority, timestamps, claim flag).
//! A message handle is what `get` hands back to callers and what they give
//! back to `ack`, `ack_send` and `requeue`.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Largest timestamp the store keeps. Doubles as the "never" sentinel for
/// `resetTimestamp` on idle records.
pub const INT32_MAX: i64 = i32::MAX as i64;

/// Clamp a seconds timestamp into `[0, INT32_MAX]`.
pub fn clamp_timestamp(secs: i64) -> i64 {
    secs.clamp(0, INT32_MAX)
}

/// Record field names as they appear in stored documents.
pub mod fields {
    pub const ID: &str = "id";
    pub const PAYLOAD: &str = "payload";
    pub const RUNNING: &str = "running";
    pub const PRIORITY: &str = "priority";
    pub const CREATED: &str = "created";
    pub const EARLIEST_GET: &str = "earliestGet";
    pub const RESET_TIMESTAMP: &str = "resetTimestamp";
}

// ---------------------------------------------------------------------------
// Message Record
// ---------------------------------------------------------------------------

/// A message as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Assigned at creation, never changes.
    pub id: MessageId,

    /// Caller data. The queue never looks inside.
    pub payload: Map<String, Value>,

    /// Claim flag.
    pub running: bool,

    /// Lower dequeues first.
    pub priority: f64,

    /// Seconds since the epoch. FIFO tie-break among equal priorities.
    pub created: i64,

    /// Not claimable before this many seconds since the epoch.
    pub earliest_get: i64,

    /// Claim deadline while running; `INT32_MAX` while idle.
    pub reset_timestamp: i64,
}

impl MessageRecord {
    /// Is this record claimable at `now` (seconds)?
    pub fn is_eligible(&self, now: i64) -> bool {
        self.earliest_get <= now && (!self.running || self.reset_timestamp <= now)
    }
}

/// Newtype for message IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(MessageId)
            .map_err(|e| Error::invalid(format!("message id {s:?} is not a valid id: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Message handle
// ---------------------------------------------------------------------------

/// A claimed message, as returned by `get`.
///
/// The document form is `{"id": ..., ...payload}`. A payload key named `id`
/// is shadowed there, but the handle keeps the payload intact so a requeue
/// sends back exactly what was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    payload: Map<String, Value>,
}

impl Message {
    pub fn new(id: MessageId, payload: Map<String, Value>) -> Self {
        Self { id, payload }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn into_payload(self) -> Map<String, Value> {
        self.payload
    }

    /// `{"id": ..., ...payload}`.
    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc = Map::with_capacity(self.payload.len() + 1);
        doc.insert(fields::ID.to_string(), Value::String(self.id.to_string()));
        for (key, value) in &self.payload {
            if key != fields::ID {
                doc.insert(key.clone(), value.clone());
            }
        }
        doc
    }

    /// Parse a handle from its document form.
    ///
    /// The `id` field must be present and hold a message id; every other
    /// field becomes the payload.
    pub fn from_document(doc: Value) -> Result<Self> {
        let Value::Object(mut doc) = doc else {
            return Err(Error::invalid("message handle must be a JSON object"));
        };
        let id = match doc.remove(fields::ID) {
            Some(Value::String(s)) => s.parse()?,
            Some(other) => {
                return Err(Error::invalid(format!(
                    "message handle id must be a string, got {other}"
                )));
            }
            None => return Err(Error::invalid("message handle has no id")),
        };
        Ok(Self { id, payload: doc })
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            payload: record.payload,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

/// Require a payload to be a structured document.
pub(crate) fn payload_document(payload: Value) -> Result<Map<String, Value>> {
    match payload {
        Value::Object(map) => Ok(map),
        other => Err(Error::invalid(format!(
            "payload must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Builder for `send`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub(crate) payload: Value,
    pub(crate) earliest_get: i64,
    pub(crate) priority: Option<f64>,
}

impl NewMessage {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            earliest_get: 0,
            priority: None,
        }
    }

    /// Seconds since the epoch before which the message cannot be claimed.
    pub fn earliest_get(mut self, secs: i64) -> Self {
        self.earliest_get = secs;
        self
    }

    /// Explicit priority. Without one, the send time (fractional seconds)
    /// is used, which yields FIFO order.
    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// How `ack_send` and `requeue` put a message back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Release {
    pub(crate) earliest_get: i64,
    pub(crate) priority: f64,
    pub(crate) refresh_created: bool,
}

impl Default for Release {
    fn default() -> Self {
        Self {
            earliest_get: 0,
            priority: 0.0,
            refresh_created: true,
        }
    }
}

impl Release {
    pub fn earliest_get(mut self, secs: i64) -> Self {
        self.earliest_get = secs;
        self
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Keep the original `created` instead of stamping the release time.
    pub fn refresh_created(mut self, refresh: bool) -> Self {
        self.refresh_created = refresh;
        self
    }
}

/// Parameters for `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    pub(crate) running_reset_seconds: i64,
    pub(crate) wait_ms: i64,
    pub(crate) poll_ms: i64,
}

impl GetOptions {
    /// `running_reset_seconds` is how long a successful claim lasts before
    /// the message becomes claimable again.
    pub fn new(running_reset_seconds: i64) -> Self {
        Self {
            running_reset_seconds,
            wait_ms: 0,
            poll_ms: -1,
        }
    }

    /// Total time to keep polling before giving up. Must be >= 0.
    pub fn wait_ms(mut self, ms: i64) -> Self {
        self.wait_ms = ms;
        self
    }

    /// Sleep between polls. Negative selects the queue's default interval;
    /// zero is raised to one millisecond.
    pub fn poll_ms(mut self, ms: i64) -> Self {
        self.poll_ms = ms;
        self
    }
}
