//! Index policy.
//!
//! Builds the compound key sequences that match the query shapes `get` and
//! `count` issue, and creates them without piling up redundant indexes.
//!
//! De-duplication rule: a new key sequence that equals, or is a prefix of,
//! an existing index is already served and is skipped. An existing index
//! that is a strict prefix of the new sequence does not serve the extra
//! keys, so the longer index is created and the shorter one is left alone.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::fields;
use crate::query::{Direction, FieldPath};
use crate::store::{DocumentStore, IndexKey, IndexModel};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Fewest characters a generated index name may have.
const MIN_NAME_LEN: usize = 4;

/// Salted names tried before giving up on a crowded name space.
const MAX_NAME_ATTEMPTS: u32 = 64;

/// Keys for the claim query: `running`, `before`, `priority`, `created`,
/// `after`, `earliestGet`. Caller keys address payload fields.
pub fn get_index_keys(before: &[(&str, i32)], after: &[(&str, i32)]) -> Result<Vec<IndexKey>> {
    let before = payload_keys(before)?;
    let after = payload_keys(after)?;

    let mut keys = Vec::with_capacity(before.len() + after.len() + 4);
    keys.push(IndexKey::ascending(fields::RUNNING));
    keys.extend(before);
    keys.push(IndexKey::ascending(fields::PRIORITY));
    keys.push(IndexKey::ascending(fields::CREATED));
    keys.extend(after);
    keys.push(IndexKey::ascending(fields::EARLIEST_GET));
    Ok(keys)
}

/// Keys for the expired-claim lookup: `running`, `resetTimestamp`.
pub fn reset_index_keys() -> Vec<IndexKey> {
    vec![
        IndexKey::ascending(fields::RUNNING),
        IndexKey::ascending(fields::RESET_TIMESTAMP),
    ]
}

/// Keys for `count`: optionally `running`, then the payload keys.
pub fn count_index_keys(keys: &[(&str, i32)], include_running: bool) -> Result<Vec<IndexKey>> {
    let payload = payload_keys(keys)?;
    let mut keys = Vec::with_capacity(payload.len() + 1);
    if include_running {
        keys.push(IndexKey::ascending(fields::RUNNING));
    }
    keys.extend(payload);
    Ok(keys)
}

fn payload_keys(keys: &[(&str, i32)]) -> Result<Vec<IndexKey>> {
    keys.iter()
        .map(|&(field, direction)| {
            let path = FieldPath::payload(field)?;
            Ok(IndexKey::new(path.dotted(), Direction::try_from(direction)?))
        })
        .collect()
}

/// Is `short` a (non-strict) prefix of `long`?
pub fn is_prefix(short: &[IndexKey], long: &[IndexKey]) -> bool {
    short.len() <= long.len() && long[..short.len()] == *short
}

/// Pick an index name that fits in `budget` characters.
///
/// Prefers the descriptive `field_dir_field_dir` form; falls back to `ix_`
/// plus a digest of the keys, truncated to fit.
pub fn index_name(keys: &[IndexKey], budget: usize) -> Result<String> {
    candidate_name(keys, budget, 0)
}

/// Name to try on the `attempt`-th try. Later attempts salt the digest so a
/// truncated name taken by other keys can be stepped around.
fn candidate_name(keys: &[IndexKey], budget: usize, attempt: u32) -> Result<String> {
    let descriptive = keys
        .iter()
        .map(|k| format!("{}_{}", k.field, k.direction.as_i32()))
        .collect::<Vec<_>>()
        .join("_");
    if attempt == 0 && descriptive.len() <= budget {
        return Ok(descriptive);
    }
    if budget < MIN_NAME_LEN {
        return Err(Error::invalid(format!(
            "index namespace too long: only {budget} characters left for an index name"
        )));
    }
    let seed = match attempt {
        0 => descriptive,
        n => format!("{descriptive}#{n}"),
    };
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes())
        .simple()
        .to_string();
    let mut name = format!("ix_{digest}");
    name.truncate(budget);
    Ok(name)
}

/// First candidate name for `keys` not already used by another index.
fn free_name(existing: &[IndexModel], keys: &[IndexKey], budget: usize) -> Result<String> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = candidate_name(keys, budget, attempt)?;
        if !existing.iter().any(|i| i.name == name) {
            return Ok(name);
        }
        tracing::debug!(%name, attempt, "index name taken by other keys");
    }
    Err(Error::invalid(format!(
        "no free index name within {budget} characters"
    )))
}

/// Characters left for an index name once the store's namespace is counted.
pub fn name_budget<S>(store: &S) -> usize
where
    S: DocumentStore + ?Sized,
{
    store
        .index_name_limit()
        .saturating_sub(store.index_namespace().len())
}

/// Make sure an index over `keys` (or one it is a prefix of) exists.
///
/// Returns whether a new index was created. Name validation happens before
/// any store call.
pub async fn ensure_index<S>(store: &S, keys: Vec<IndexKey>) -> Result<bool>
where
    S: DocumentStore + ?Sized,
{
    let budget = name_budget(store);
    index_name(&keys, budget)?;

    let existing = store.list_indexes().await?;
    if let Some(covering) = existing.iter().find(|i| is_prefix(&keys, &i.keys)) {
        tracing::debug!(index = %covering.name, "existing index covers requested keys");
        return Ok(false);
    }
    if let Some(shorter) = existing.iter().find(|i| is_prefix(&i.keys, &keys)) {
        tracing::debug!(index = %shorter.name, "extending prefix index with a longer one");
    }

    let name = free_name(&existing, &keys, budget)?;
    let index = IndexModel { name, keys };
    store.create_index(&index).await?;
    metrics::indexes_created().add(1, &[KeyValue::new("index", index.name.clone())]);
    tracing::info!(index = %index.name, keys = index.keys.len(), "created index");
    Ok(true)
}

/// [`ensure_index`] for several key sets. Every name is validated before
/// the first index is created. Returns how many indexes were created.
pub async fn ensure_indexes<S>(store: &S, key_sets: Vec<Vec<IndexKey>>) -> Result<usize>
where
    S: DocumentStore + ?Sized,
{
    let budget = name_budget(store);
    for keys in &key_sets {
        index_name(keys, budget)?;
    }

    let mut created = 0;
    for keys in key_sets {
        if ensure_index(store, keys).await? {
            created += 1;
        }
    }
    Ok(created)
}
