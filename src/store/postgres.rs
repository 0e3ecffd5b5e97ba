//! PostgreSQL document store via direct SQLx.
//!
//! Each collection is a table `(id uuid, seq bigserial, doc jsonb)`. Filters
//! are translated to predicates over `doc #> '{path}'` expressions, and
//! indexes are expression indexes over the same expressions so the planner
//! can match them. An index's key sequence is kept as a JSON comment on the
//! index so it can be read back.
//!
//! The claim primitive is one statement: a `FOR UPDATE SKIP LOCKED` CTE
//! picks the row, the outer `UPDATE` merges the `$set` fields, and
//! `RETURNING` hands back the CTE's (pre-update) document.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};

use super::{DocumentStore, IndexKey, IndexModel};
use crate::error::{Error, Result};
use crate::model::{MessageId, MessageRecord, fields, json_type_name};
use crate::query::{Clause, Condition, Direction, FieldPath, Filter, SortKey, Update};

/// Postgres truncates identifiers beyond this many bytes.
pub const IDENTIFIER_LIMIT: usize = 63;

/// Postgres-backed store for one collection (table).
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    table: String,
    namespace: String,
}

impl PostgresStore {
    /// Connect and make sure the collection table exists.
    pub async fn connect(url: &str, table: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Self::with_pool(pool, table).await
    }

    /// Use an existing pool. Creates the collection table if needed.
    pub async fn with_pool(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let store = Self {
            pool,
            table: table.to_string(),
            namespace: format!("{table}_"),
        };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id   UUID PRIMARY KEY,
                seq  BIGSERIAL NOT NULL,
                doc  JSONB NOT NULL
            )",
            quote_ident(&self.table)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Drop the collection table and its indexes. Used by tests.
    pub async fn drop_collection(&self) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&self.table));
        sqlx::query(&sql).execute(&self.pool).await?;
        self.ensure_collection().await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table_ident(&self) -> String {
        quote_ident(&self.table)
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn insert(&self, record: &MessageRecord) -> Result<()> {
        let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2)", self.table_ident());
        sqlx::query(&sql)
            .bind(record.id.0)
            .bind(Json(record))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_one(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        update: &Update,
    ) -> Result<Option<MessageRecord>> {
        let table = self.table_ident();
        let mut qb = QueryBuilder::<Postgres>::new("WITH target AS (SELECT id, doc FROM ");
        qb.push(&table).push(" WHERE ");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY ");
        for key in sort {
            qb.push(path_expr(&key.path)).push(match key.direction {
                Direction::Ascending => " ASC, ",
                Direction::Descending => " DESC, ",
            });
        }
        qb.push("seq ASC LIMIT 1 FOR UPDATE SKIP LOCKED) UPDATE ");
        qb.push(&table).push(" SET doc = ").push(&table).push(".doc || ");
        qb.push_bind(Json(Value::Object(update.fields().clone())));
        qb.push(" FROM target WHERE ")
            .push(&table)
            .push(".id = target.id RETURNING target.doc");

        let prior: Option<Json<MessageRecord>> = qb
            .build_query_scalar()
            .fetch_optional(&self.pool)
            .await?;
        Ok(prior.map(|Json(record)| record))
    }

    async fn upsert_by_id(&self, record: &MessageRecord, update: &Update) -> Result<bool> {
        // xmax is zero only on a freshly inserted row version
        let sql = format!(
            "INSERT INTO {} AS existing (id, doc) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET doc = existing.doc || $3 \
             RETURNING (xmax = 0) AS inserted",
            self.table_ident()
        );
        let inserted: bool = sqlx::query_scalar(&sql)
            .bind(record.id.0)
            .bind(Json(record))
            .bind(Json(Value::Object(update.fields().clone())))
            .fetch_one(&self.pool)
            .await?;
        Ok(!inserted)
    }

    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ");
        qb.push(self.table_ident()).push(" SET doc = doc || ");
        qb.push_bind(Json(Value::Object(update.fields().clone())));
        qb.push(" WHERE ");
        push_filter(&mut qb, filter);
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn delete_by_id(&self, id: MessageId) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table_ident());
        let rows = sqlx::query(&sql)
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ");
        qb.push(self.table_ident()).push(" WHERE ");
        push_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn list_indexes(&self) -> Result<Vec<IndexModel>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT ic.relname, obj_description(ic.oid, 'pg_class')
             FROM pg_index i
             JOIN pg_class ic ON ic.oid = i.indexrelid
             JOIN pg_class tc ON tc.oid = i.indrelid
             WHERE tc.relname = $1 AND pg_table_is_visible(tc.oid)
             ORDER BY ic.oid",
        )
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await?;

        let primary_key = format!("{}_pkey", self.table);
        let mut indexes = Vec::with_capacity(rows.len());
        for (name, comment) in rows {
            if name == primary_key {
                indexes.push(IndexModel {
                    name,
                    keys: vec![IndexKey::ascending(fields::ID)],
                });
                continue;
            }
            let keys = comment.and_then(|c| serde_json::from_str::<Vec<IndexKey>>(&c).ok());
            match keys {
                Some(keys) => indexes.push(IndexModel {
                    name: name
                        .strip_prefix(&self.namespace)
                        .unwrap_or(&name)
                        .to_string(),
                    keys,
                }),
                None => tracing::debug!(index = %name, "skipping index without a key comment"),
            }
        }
        Ok(indexes)
    }

    async fn create_index(&self, index: &IndexModel) -> Result<()> {
        let full_name = format!("{}{}", self.namespace, index.name);
        if full_name.len() > IDENTIFIER_LIMIT {
            return Err(Error::Rejected(format!(
                "index name {full_name} is longer than {IDENTIFIER_LIMIT} bytes"
            )));
        }

        let existing = self.list_indexes().await?;
        if let Some(same_name) = existing.iter().find(|i| i.name == index.name) {
            if same_name.keys == index.keys {
                return Ok(());
            }
            return Err(Error::Rejected(format!(
                "index name {} already exists with different keys",
                index.name
            )));
        }
        if existing.iter().any(|i| i.keys == index.keys) {
            return Ok(());
        }

        let columns = index
            .keys
            .iter()
            .map(|key| {
                let path = FieldPath::parse(&key.field)?;
                let dir = match key.direction {
                    Direction::Ascending => "ASC",
                    Direction::Descending => "DESC",
                };
                Ok(format!("{} {dir}", path_expr(&path)))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let comment = serde_json::to_string(&index.keys)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({columns})",
            quote_ident(&full_name),
            self.table_ident()
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "COMMENT ON INDEX {} IS {}",
            quote_ident(&full_name),
            quote_literal(&comment)
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    fn index_namespace(&self) -> &str {
        &self.namespace
    }

    fn index_name_limit(&self) -> usize {
        IDENTIFIER_LIMIT
    }
}

// ---------------------------------------------------------------------------
// SQL rendering
// ---------------------------------------------------------------------------

fn validate_table_name(table: &str) -> Result<()> {
    if table.is_empty() || table.len() > IDENTIFIER_LIMIT {
        return Err(Error::invalid(format!(
            "collection name must be 1..={IDENTIFIER_LIMIT} bytes, got {:?}",
            table
        )));
    }
    if !table
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::invalid(format!(
            "collection name {table:?} may only contain ASCII letters, digits and _"
        )));
    }
    Ok(())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// `(doc #> '{"a","b"}')`. Paths are inlined, not bound, so the expression
/// text matches the expression indexes.
fn path_expr(path: &FieldPath) -> String {
    let elements = path
        .segments()
        .iter()
        .map(|s| format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("(doc #> {})", quote_literal(&format!("{{{elements}}}")))
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    if filter.is_empty() {
        qb.push("TRUE");
        return;
    }
    for (i, clause) in filter.clauses().iter().enumerate() {
        if i > 0 {
            qb.push(" AND ");
        }
        match clause {
            Clause::Field { path, condition } => push_condition(qb, &path_expr(path), condition),
            Clause::Or(alternatives) => {
                if alternatives.is_empty() {
                    qb.push("FALSE");
                    continue;
                }
                qb.push("(");
                for (j, alternative) in alternatives.iter().enumerate() {
                    if j > 0 {
                        qb.push(" OR ");
                    }
                    qb.push("(");
                    push_filter(qb, alternative);
                    qb.push(")");
                }
                qb.push(")");
            }
        }
    }
}

fn push_condition(qb: &mut QueryBuilder<'_, Postgres>, expr: &str, condition: &Condition) {
    match condition {
        Condition::Eq(v) => push_eq(qb, expr, v),
        Condition::Ne(v) => push_ne(qb, expr, v),
        Condition::Gt(v) => push_range(qb, expr, ">", v),
        Condition::Gte(v) => push_range(qb, expr, ">=", v),
        Condition::Lt(v) => push_range(qb, expr, "<", v),
        Condition::Lte(v) => push_range(qb, expr, "<=", v),
        Condition::In(items) => {
            if items.is_empty() {
                qb.push("FALSE");
                return;
            }
            qb.push("(");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                push_eq(qb, expr, item);
            }
            qb.push(")");
        }
        Condition::Nin(items) => {
            if items.is_empty() {
                qb.push("TRUE");
                return;
            }
            qb.push("(");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    qb.push(" AND ");
                }
                push_ne(qb, expr, item);
            }
            qb.push(")");
        }
        Condition::Exists(true) => {
            qb.push(format!("{expr} IS NOT NULL"));
        }
        Condition::Exists(false) => {
            qb.push(format!("{expr} IS NULL"));
        }
    }
}

fn push_eq(qb: &mut QueryBuilder<'_, Postgres>, expr: &str, value: &Value) {
    if value.is_null() {
        qb.push(format!("({expr} IS NULL OR {expr} = 'null'::jsonb)"));
    } else {
        qb.push(format!("{expr} = "));
        qb.push_bind(Json(value.clone()));
    }
}

fn push_ne(qb: &mut QueryBuilder<'_, Postgres>, expr: &str, value: &Value) {
    if value.is_null() {
        qb.push(format!("({expr} IS NOT NULL AND {expr} <> 'null'::jsonb)"));
    } else {
        qb.push(format!("({expr} IS NULL OR {expr} <> "));
        qb.push_bind(Json(value.clone()));
        qb.push(")");
    }
}

/// Range comparison restricted to operands of the same JSON type.
fn push_range(qb: &mut QueryBuilder<'_, Postgres>, expr: &str, op: &str, value: &Value) {
    if value.is_array() || value.is_object() {
        qb.push("FALSE");
        return;
    }
    qb.push(format!(
        "(jsonb_typeof({expr}) = '{}' AND {expr} {op} ",
        json_type_name(value)
    ));
    qb.push_bind(Json(value.clone()));
    qb.push(")");
}
