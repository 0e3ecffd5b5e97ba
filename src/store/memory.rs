//! In-process document store.
//!
//! Holds one collection as a vector of JSON documents behind a mutex. Every
//! trait method takes the lock once, so each call is atomic with respect to
//! every other call on the same store (and its clones).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{DocumentStore, IndexKey, IndexModel};
use crate::error::{Error, Result};
use crate::model::{MessageId, MessageRecord, fields};
use crate::query::{Filter, SortKey, Update, compare_by};

/// Longest `<db>.<collection>.$<index>` namespace accepted, matching the
/// limit of common networked document stores.
pub const NAMESPACE_LIMIT: usize = 127;

/// Name of the index every collection starts with.
pub const ID_INDEX: &str = "_id_";

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Value>,
    indexes: Vec<IndexModel>,
}

/// Memory-backed store. Clones share the same collection.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    namespace: String,
    inner: Arc<Mutex<Collection>>,
}

impl MemoryStore {
    /// An empty collection `<db>.<collection>`.
    pub fn new(db: &str, collection: &str) -> Self {
        let id_index = IndexModel {
            name: ID_INDEX.to_string(),
            keys: vec![IndexKey::ascending(fields::ID)],
        };
        Self {
            namespace: format!("{db}.{collection}.$"),
            inner: Arc::new(Mutex::new(Collection {
                docs: Vec::new(),
                indexes: vec![id_index],
            })),
        }
    }

    /// Snapshot of every stored record, in insertion order.
    pub async fn records(&self) -> Result<Vec<MessageRecord>> {
        let collection = self.inner.lock().await;
        collection
            .docs
            .iter()
            .map(|doc| Ok(serde_json::from_value(doc.clone())?))
            .collect()
    }
}

fn id_matches(doc: &Value, id: &str) -> bool {
    doc.get(fields::ID).and_then(Value::as_str) == Some(id)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, record: &MessageRecord) -> Result<()> {
        let doc = serde_json::to_value(record)?;
        let id = record.id.to_string();
        let mut collection = self.inner.lock().await;
        if collection.docs.iter().any(|d| id_matches(d, &id)) {
            return Err(Error::Rejected(format!("duplicate message id {id}")));
        }
        collection.docs.push(doc);
        Ok(())
    }

    async fn claim_one(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        update: &Update,
    ) -> Result<Option<MessageRecord>> {
        let mut collection = self.inner.lock().await;

        let mut best: Option<usize> = None;
        for (i, doc) in collection.docs.iter().enumerate() {
            if !filter.matches(doc) {
                continue;
            }
            // strict comparison keeps the earliest-inserted among ties
            match best {
                Some(b) if compare_by(doc, &collection.docs[b], sort).is_lt() => best = Some(i),
                None => best = Some(i),
                _ => {}
            }
        }

        let Some(i) = best else {
            return Ok(None);
        };
        let prior = collection.docs[i].clone();
        update.apply(&mut collection.docs[i]);
        Ok(Some(serde_json::from_value(prior)?))
    }

    async fn upsert_by_id(&self, record: &MessageRecord, update: &Update) -> Result<bool> {
        let id = record.id.to_string();
        let mut collection = self.inner.lock().await;
        match collection.docs.iter_mut().find(|d| id_matches(d, &id)) {
            Some(doc) => {
                update.apply(doc);
                Ok(true)
            }
            None => {
                collection.docs.push(serde_json::to_value(record)?);
                Ok(false)
            }
        }
    }

    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64> {
        let mut collection = self.inner.lock().await;
        let mut updated = 0;
        for doc in collection.docs.iter_mut().filter(|d| filter.matches(d)) {
            update.apply(doc);
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_by_id(&self, id: MessageId) -> Result<bool> {
        let id = id.to_string();
        let mut collection = self.inner.lock().await;
        let before = collection.docs.len();
        collection.docs.retain(|d| !id_matches(d, &id));
        Ok(collection.docs.len() != before)
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let collection = self.inner.lock().await;
        Ok(collection.docs.iter().filter(|d| filter.matches(d)).count() as u64)
    }

    async fn list_indexes(&self) -> Result<Vec<IndexModel>> {
        Ok(self.inner.lock().await.indexes.clone())
    }

    async fn create_index(&self, index: &IndexModel) -> Result<()> {
        if self.namespace.len() + index.name.len() > NAMESPACE_LIMIT {
            return Err(Error::Rejected(format!(
                "namespace {}{} is longer than {NAMESPACE_LIMIT} bytes",
                self.namespace, index.name
            )));
        }

        let mut collection = self.inner.lock().await;
        if let Some(existing) = collection.indexes.iter().find(|i| i.name == index.name) {
            if existing.keys == index.keys {
                return Ok(());
            }
            return Err(Error::Rejected(format!(
                "index name {} already exists with different keys",
                index.name
            )));
        }
        if collection.indexes.iter().any(|i| i.keys == index.keys) {
            return Ok(());
        }
        collection.indexes.push(index.clone());
        Ok(())
    }

    fn index_namespace(&self) -> &str {
        &self.namespace
    }

    fn index_name_limit(&self) -> usize {
        NAMESPACE_LIMIT
    }
}
