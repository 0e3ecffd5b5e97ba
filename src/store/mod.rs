//! Storage collaborator contract.
//!
//! The queue needs exactly one concurrency primitive from its store:
//! atomically find one document matching a filter, apply an update, and
//! return the document as it was before the update. Everything else is
//! plain single-document writes, counts, and index management.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{MessageId, MessageRecord};
use crate::query::{Direction, Filter, SortKey, Update};

/// A compound index: its name and ordered `(field, direction)` keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexModel {
    pub name: String,
    pub keys: Vec<IndexKey>,
}

/// One key of a compound index, addressed by dotted record path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub direction: Direction,
}

impl IndexKey {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self::new(field, Direction::Ascending)
    }
}

/// A document store holding one collection of message records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, record: &MessageRecord) -> Result<()>;

    /// Atomically pick the first record matching `filter` under `sort`,
    /// apply `update` to it, and return it as it was before the update.
    ///
    /// Two concurrent calls never return the same pre-update record.
    async fn claim_one(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        update: &Update,
    ) -> Result<Option<MessageRecord>>;

    /// Apply `update` to the record with `record.id`, or insert `record`
    /// when there is none. Returns whether the record already existed.
    async fn upsert_by_id(&self, record: &MessageRecord, update: &Update) -> Result<bool>;

    /// Apply `update` to every matching record, each atomically on its own.
    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64>;

    /// Remove the record with `id`. Returns whether it existed.
    async fn delete_by_id(&self, id: MessageId) -> Result<bool>;

    async fn count(&self, filter: &Filter) -> Result<u64>;

    async fn list_indexes(&self) -> Result<Vec<IndexModel>>;

    /// Create an index. Creating an index whose name and keys both match an
    /// existing one is a no-op.
    async fn create_index(&self, index: &IndexModel) -> Result<()>;

    /// Prefix the store puts in front of index names when checking length.
    fn index_namespace(&self) -> &str;

    /// Longest namespace-qualified index name the store accepts.
    fn index_name_limit(&self) -> usize;
}
