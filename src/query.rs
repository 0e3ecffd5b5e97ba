//! Document query language shared by the queue and the stores.
//!
//! A [`Filter`] is a conjunction of per-field conditions (plus `$or` groups)
//! over dotted field paths. Callers write payload queries as JSON in the
//! familiar document-store shape:
//!
//! ```json
//! {"type": "email", "attempt": {"$lt": 3}, "one.two.three": {"$gt": 4}}
//! ```
//!
//! The queue scopes those under `payload.` and adds its own clauses on the
//! record metadata. Stores either evaluate a filter directly
//! ([`Filter::matches`], used by the memory store) or translate it into
//! their native query language (the postgres store).
//!
//! Comparison semantics: numbers compare numerically regardless of integer
//! or float representation; range operators only match values of the same
//! JSON type as the operand; a missing field equals `null`; arrays and
//! objects compare as whole values.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{fields, json_type_name};

// ---------------------------------------------------------------------------
// Field paths
// ---------------------------------------------------------------------------

/// A dotted path into a document, e.g. `payload.one.two`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse a dotted path. Empty paths and empty segments are rejected.
    pub fn parse(dotted: &str) -> Result<Self> {
        if dotted.is_empty() {
            return Err(Error::invalid("field names must be non-empty strings"));
        }
        let segments: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(Error::invalid(format!(
                "field name {dotted:?} has an empty path segment"
            )));
        }
        Ok(Self(segments))
    }

    /// A top-level record field. Only used with the constants in
    /// [`crate::model::fields`].
    pub fn field(name: &str) -> Self {
        Self(vec![name.to_string()])
    }

    /// A path inside the payload: `payload.<dotted>`.
    pub fn payload(dotted: &str) -> Result<Self> {
        let mut path = Self::parse(dotted)?;
        path.0.insert(0, fields::PAYLOAD.to_string());
        Ok(path)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn dotted(&self) -> String {
        self.0.join(".")
    }

    /// Resolve the path inside `doc`. `None` if any segment is missing or
    /// traverses a non-object.
    pub fn lookup<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.0
            .iter()
            .try_fold(doc, |current, segment| current.as_object()?.get(segment))
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dotted())
    }
}

// ---------------------------------------------------------------------------
// Conditions and filters
// ---------------------------------------------------------------------------

/// A predicate on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

impl Condition {
    /// Parse one `$op: operand` pair.
    fn parse_operator(op: &str, operand: Value) -> Result<Self> {
        let condition = match op {
            "$eq" => Condition::Eq(operand),
            "$ne" => Condition::Ne(operand),
            "$gt" => Condition::Gt(operand),
            "$gte" => Condition::Gte(operand),
            "$lt" => Condition::Lt(operand),
            "$lte" => Condition::Lte(operand),
            "$in" | "$nin" => {
                let Value::Array(items) = operand else {
                    return Err(Error::invalid(format!("{op} needs an array operand")));
                };
                if op == "$in" {
                    Condition::In(items)
                } else {
                    Condition::Nin(items)
                }
            }
            "$exists" => match operand {
                Value::Bool(b) => Condition::Exists(b),
                other => {
                    return Err(Error::invalid(format!(
                        "$exists needs a boolean operand, got {}",
                        json_type_name(&other)
                    )));
                }
            },
            other => return Err(Error::invalid(format!("unsupported operator {other}"))),
        };
        Ok(condition)
    }

    /// Does the (possibly missing) field value satisfy this condition?
    pub fn matches(&self, found: Option<&Value>) -> bool {
        let found_or_null = found.unwrap_or(&Value::Null);
        match self {
            Condition::Eq(v) => values_equal(found_or_null, v),
            Condition::Ne(v) => !values_equal(found_or_null, v),
            Condition::Gt(v) => ordered(found, v, Ordering::is_gt),
            Condition::Gte(v) => ordered(found, v, Ordering::is_ge),
            Condition::Lt(v) => ordered(found, v, Ordering::is_lt),
            Condition::Lte(v) => ordered(found, v, Ordering::is_le),
            Condition::In(items) => items.iter().any(|v| values_equal(found_or_null, v)),
            Condition::Nin(items) => !items.iter().any(|v| values_equal(found_or_null, v)),
            Condition::Exists(expected) => found.is_some() == *expected,
        }
    }
}

fn ordered(found: Option<&Value>, operand: &Value, pred: fn(Ordering) -> bool) -> bool {
    found
        .and_then(|v| compare_values(v, operand))
        .is_some_and(pred)
}

/// One conjunct of a [`Filter`].
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { path: FieldPath, condition: Condition },
    /// Matches if any alternative matches.
    Or(Vec<Filter>),
}

/// A conjunction of clauses. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a caller's payload query and scope every key under `payload.`.
    ///
    /// Keys are dotted paths. Values are either literals (equality) or
    /// operator documents such as `{"$gte": 1, "$lt": 5}`.
    pub fn payload_query(query: &Value) -> Result<Self> {
        let Value::Object(query) = query else {
            return Err(Error::invalid(format!(
                "query must be a JSON object, got {}",
                json_type_name(query)
            )));
        };
        let mut filter = Self::new();
        for (key, value) in query {
            if key.starts_with('$') {
                return Err(Error::invalid(format!(
                    "top-level operator {key} is not supported in queries"
                )));
            }
            let path = FieldPath::payload(key)?;
            match operator_document(value)? {
                Some(ops) => {
                    for (op, operand) in ops {
                        let condition = Condition::parse_operator(op, operand.clone())?;
                        filter = filter.and(path.clone(), condition);
                    }
                }
                None => filter = filter.and(path, Condition::Eq(value.clone())),
            }
        }
        Ok(filter)
    }

    pub fn and(mut self, path: FieldPath, condition: Condition) -> Self {
        self.clauses.push(Clause::Field { path, condition });
        self
    }

    pub fn or(mut self, alternatives: Vec<Filter>) -> Self {
        self.clauses.push(Clause::Or(alternatives));
        self
    }

    /// Append every clause of `other`.
    pub fn extend(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Field { path, condition } => condition.matches(path.lookup(doc)),
            Clause::Or(alternatives) => alternatives.iter().any(|f| f.matches(doc)),
        })
    }
}

/// `Some(ops)` if `value` is an operator document, `None` for a literal.
fn operator_document(value: &Value) -> Result<Option<&Map<String, Value>>> {
    let Value::Object(map) = value else {
        return Ok(None);
    };
    let operators = map.keys().filter(|k| k.starts_with('$')).count();
    match operators {
        0 => Ok(None),
        n if n == map.len() => Ok(Some(map)),
        _ => Err(Error::invalid(
            "operator documents cannot mix $-operators with field names",
        )),
    }
}

// ---------------------------------------------------------------------------
// Value comparison
// ---------------------------------------------------------------------------

/// Equality with numeric normalization (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Order two values of the same scalar type. `None` across types.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

/// Index and sort direction. Serialized as `1` / `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }
}

impl TryFrom<i32> for Direction {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Direction::Ascending),
            -1 => Ok(Direction::Descending),
            other => Err(Error::invalid(format!(
                "sort direction must be 1 or -1, got {other}"
            ))),
        }
    }
}

impl From<Direction> for i32 {
    fn from(direction: Direction) -> i32 {
        direction.as_i32()
    }
}

/// One key of a sort order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: FieldPath,
    pub direction: Direction,
}

impl SortKey {
    pub fn ascending(path: FieldPath) -> Self {
        Self {
            path,
            direction: Direction::Ascending,
        }
    }
}

/// Compare two documents by a sort order. Missing or incomparable values
/// tie, so a stable sort falls back to insertion order.
pub fn compare_by(a: &Value, b: &Value, sort: &[SortKey]) -> Ordering {
    for key in sort {
        let ord = match (key.path.lookup(a), key.path.lookup(b)) {
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        };
        let ord = match key.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        };
        if ord.is_ne() {
            return ord;
        }
    }
    Ordering::Equal
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// A `$set` of top-level record fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Map<String, Value>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    /// The fields to overwrite, as a document.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.set
    }

    /// Overwrite the fields in `doc`. Non-object documents are left alone.
    pub fn apply(&self, doc: &mut Value) {
        if let Value::Object(map) = doc {
            for (k, v) in &self.set {
                map.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(payload: Value) -> Value {
        json!({"payload": payload, "running": false, "priority": 1.0})
    }

    #[test]
    fn payload_query_scopes_keys_under_payload() {
        let filter = Filter::payload_query(&json!({"type": "email"})).unwrap();
        match &filter.clauses()[0] {
            Clause::Field { path, condition } => {
                assert_eq!(path.dotted(), "payload.type");
                assert_eq!(condition, &Condition::Eq(json!("email")));
            }
            other => panic!("expected field clause, got {other:?}"),
        }
    }

    #[test]
    fn subdocument_range_query_matches_nested_field() {
        let filter = Filter::payload_query(&json!({"one.two.three": {"$gt": 4}})).unwrap();
        let hit = record(json!({"one": {"two": {"three": 5, "notused": "x"}}}));
        let miss = record(json!({"key1": 0, "key2": true}));
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
    }

    #[test]
    fn equality_normalizes_numbers() {
        let filter = Filter::payload_query(&json!({"k": 1})).unwrap();
        assert!(filter.matches(&record(json!({"k": 1.0}))));
        assert!(!filter.matches(&record(json!({"k": "1"}))));
    }

    #[test]
    fn literal_subdocument_is_whole_value_equality() {
        let filter = Filter::payload_query(&json!({"a": {"b": 1}})).unwrap();
        assert!(filter.matches(&record(json!({"a": {"b": 1}}))));
        assert!(!filter.matches(&record(json!({"a": {"b": 1, "c": 2}}))));
    }

    #[test]
    fn range_operators_do_not_cross_types() {
        let filter = Filter::payload_query(&json!({"k": {"$gte": 0}})).unwrap();
        assert!(!filter.matches(&record(json!({"k": "zero"}))));
        assert!(!filter.matches(&record(json!({}))));
        assert!(filter.matches(&record(json!({"k": 0}))));
    }

    #[test]
    fn missing_field_equals_null() {
        let eq_null = Filter::payload_query(&json!({"gone": null})).unwrap();
        assert!(eq_null.matches(&record(json!({}))));

        let exists = Filter::payload_query(&json!({"gone": {"$exists": false}})).unwrap();
        assert!(exists.matches(&record(json!({}))));
        assert!(!exists.matches(&record(json!({"gone": 1}))));
    }

    #[test]
    fn in_and_nin() {
        let filter = Filter::payload_query(&json!({"k": {"$in": [1, 2]}})).unwrap();
        assert!(filter.matches(&record(json!({"k": 2}))));
        assert!(!filter.matches(&record(json!({"k": 3}))));

        let filter = Filter::payload_query(&json!({"k": {"$nin": [1, 2]}})).unwrap();
        assert!(filter.matches(&record(json!({"k": 3}))));
    }

    #[test]
    fn or_clause_matches_any_alternative() {
        let filter = Filter::new().or(vec![
            Filter::new().and(FieldPath::field("running"), Condition::Eq(json!(false))),
            Filter::new().and(FieldPath::field("priority"), Condition::Lte(json!(0))),
        ]);
        assert!(filter.matches(&record(json!({}))));
        assert!(!filter.matches(&json!({"running": true, "priority": 2})));
    }

    #[test]
    fn malformed_queries_are_rejected() {
        for query in [
            json!({"": 1}),
            json!({"a..b": 1}),
            json!({"k": {"$regex": "x"}}),
            json!({"k": {"$in": 3}}),
            json!({"k": {"$gt": 1, "plain": 2}}),
            json!({"$or": []}),
            json!([1, 2]),
        ] {
            assert!(
                matches!(Filter::payload_query(&query), Err(Error::InvalidArgument(_))),
                "expected {query} to be rejected"
            );
        }
    }

    #[test]
    fn direction_accepts_only_unit_values() {
        assert_eq!(Direction::try_from(1).unwrap(), Direction::Ascending);
        assert_eq!(Direction::try_from(-1).unwrap(), Direction::Descending);
        assert!(Direction::try_from(0).is_err());
        assert!(Direction::try_from(2).is_err());
    }

    #[test]
    fn compare_by_uses_keys_in_order() {
        let sort = [
            SortKey::ascending(FieldPath::field("priority")),
            SortKey::ascending(FieldPath::field("created")),
        ];
        let a = json!({"priority": 0.3, "created": 9});
        let b = json!({"priority": 0.3, "created": 10});
        let c = json!({"priority": 0.1, "created": 50});
        assert_eq!(compare_by(&a, &b, &sort), Ordering::Less);
        assert_eq!(compare_by(&a, &c, &sort), Ordering::Greater);
    }

    #[test]
    fn update_overwrites_top_level_fields() {
        let mut doc = json!({"running": false, "payload": {"k": 1}});
        Update::new()
            .set("running", true)
            .set("payload", json!({"k": 2}))
            .apply(&mut doc);
        assert_eq!(doc, json!({"running": true, "payload": {"k": 2}}));
    }
}
