//! Postgres-backed record store.
//!
//! Each model lives in its own table of `(id TEXT PRIMARY KEY, data JSONB)`
//! rows; the document is the source of truth and `id` mirrors `data->>'id'`.
//! Schema: `migrations/0001_records.sql`, applied by [`PostgresRecordStore::migrate`].
//!
//! ## Filters
//!
//! | Condition | SQL |
//! |-----------|-----|
//! | `Eq(scalar)` | `data @> {"field": value}` (GIN-indexable) |
//! | `Eq(null)` | missing key or JSON `null` |
//! | `Eq(array/object)` | `data -> field = value` |
//! | `In(values)` | OR of equalities, empty list matches nothing |
//! | `Range` on numbers | `(data ->> field)::float8` comparisons |
//! | `Range` on strings | `COLLATE "C"` byte comparison; timestamps are normalized to the persisted width first |
//!
//! Field names are always bound as parameters, never interpolated.
//!
//! ## Error Mapping
//!
//! | SQLx Error | Code | StoreError |
//! |------------|------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation { model, field }` |
//! | Database (other) | any | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use genflow_core::{SortDirection, timestamp};

use super::{Condition, Document, Filter, Operation, OrderBy, Outcome, RecordStore, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_records.sql");

/// Postgres-backed record store. Cheap to clone; shares the pool.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", "", e))?;
        Ok(())
    }

    async fn find(
        &self,
        model: &str,
        table: &'static str,
        filter: &Filter,
        order: Option<&OrderBy>,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<Document>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT data FROM ");
        qb.push(table);
        push_where(&mut qb, filter)?;
        push_order(&mut qb, order);
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }
        if let Some(offset) = offset {
            qb.push(" OFFSET ").push_bind(i64::from(offset));
        }

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", model, e))?;
        rows.iter().map(decode_row).collect()
    }

    async fn insert<'c, E>(&self, executor: E, model: &str, table: &'static str, data: Document) -> Result<Document, StoreError>
    where
        E: sqlx::PgExecutor<'c>,
    {
        let id = document_id(model, &data)?;
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO ");
        qb.push(table)
            .push(" (id, data) VALUES (")
            .push_bind(id)
            .push(", ")
            .push_bind(Json(data))
            .push(") RETURNING data");

        let row = qb
            .build()
            .fetch_one(executor)
            .await
            .map_err(|e| map_sqlx_error("insert", model, e))?;
        decode_row(&row)
    }

    async fn update_first<'c, E>(
        &self,
        executor: E,
        model: &str,
        table: &'static str,
        filter: &Filter,
        data: Document,
    ) -> Result<Option<Document>, StoreError>
    where
        E: sqlx::PgExecutor<'c>,
    {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ");
        qb.push(table)
            .push(" SET data = data || ")
            .push_bind(Json(without_id(data)))
            .push(" WHERE id = (SELECT id FROM ")
            .push(table);
        push_where(&mut qb, filter)?;
        qb.push(" LIMIT 1) RETURNING data");

        let row = qb
            .build()
            .fetch_optional(executor)
            .await
            .map_err(|e| map_sqlx_error("update", model, e))?;
        row.as_ref().map(decode_row).transpose()
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self, op), fields(op = op.kind().as_str()), err)]
    async fn execute(&self, model: &str, op: Operation) -> Result<Outcome, StoreError> {
        let table = table_for(model)?;

        match op {
            Operation::FindMany {
                filter,
                order,
                pagination,
            } => {
                let docs = self
                    .find(
                        model,
                        table,
                        &filter,
                        order.as_ref(),
                        pagination.map(|p| p.limit),
                        pagination.map(|p| p.offset),
                    )
                    .await?;
                Ok(Outcome::Many(docs))
            }
            Operation::FindFirst { filter, order } => {
                let docs = self
                    .find(model, table, &filter, order.as_ref(), Some(1), None)
                    .await?;
                Ok(Outcome::One(docs.into_iter().next()))
            }
            Operation::FindUnique { filter } => {
                let docs = self.find(model, table, &filter, None, Some(1), None).await?;
                Ok(Outcome::One(docs.into_iter().next()))
            }
            Operation::Count { filter } => {
                let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM ");
                qb.push(table);
                push_where(&mut qb, &filter)?;
                let row = qb
                    .build()
                    .fetch_one(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("count", model, e))?;
                let total: i64 = row
                    .try_get("total")
                    .map_err(|e| StoreError::Backend(format!("failed to read count: {e}")))?;
                Ok(Outcome::Count(total.max(0) as u64))
            }
            Operation::Create { data } => {
                let doc = self.insert(&*self.pool, model, table, data).await?;
                Ok(Outcome::One(Some(doc)))
            }
            Operation::CreateMany { data } => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| map_sqlx_error("begin", model, e))?;
                let n = data.len() as u64;
                for doc in data {
                    self.insert(&mut *tx, model, table, doc).await?;
                }
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit", model, e))?;
                Ok(Outcome::Count(n))
            }
            Operation::Update { filter, data } => {
                let doc = self
                    .update_first(&*self.pool, model, table, &filter, data)
                    .await?;
                Ok(Outcome::One(doc))
            }
            Operation::UpdateMany { filter, data } => {
                let mut qb = QueryBuilder::<Postgres>::new("UPDATE ");
                qb.push(table)
                    .push(" SET data = data || ")
                    .push_bind(Json(without_id(data)));
                push_where(&mut qb, &filter)?;
                let result = qb
                    .build()
                    .execute(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("update_many", model, e))?;
                Ok(Outcome::Count(result.rows_affected()))
            }
            Operation::Upsert {
                filter,
                create,
                update,
            } => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| map_sqlx_error("begin", model, e))?;
                let doc = match self
                    .update_first(&mut *tx, model, table, &filter, update)
                    .await?
                {
                    Some(doc) => doc,
                    None => self.insert(&mut *tx, model, table, create).await?,
                };
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit", model, e))?;
                Ok(Outcome::One(Some(doc)))
            }
            Operation::Delete { filter } => {
                let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM ");
                qb.push(table).push(" WHERE id = (SELECT id FROM ").push(table);
                push_where(&mut qb, &filter)?;
                qb.push(" LIMIT 1) RETURNING data");
                let row = qb
                    .build()
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("delete", model, e))?;
                Ok(Outcome::One(row.as_ref().map(decode_row).transpose()?))
            }
            Operation::DeleteMany { filter } => {
                let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM ");
                qb.push(table);
                push_where(&mut qb, &filter)?;
                let result = qb
                    .build()
                    .execute(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("delete_many", model, e))?;
                Ok(Outcome::Count(result.rows_affected()))
            }
        }
    }
}

/// Table holding a model's documents.
pub fn table_for(model: &str) -> Result<&'static str, StoreError> {
    match model {
        "Job" => Ok("jobs"),
        "PipelineExecution" => Ok("pipeline_executions"),
        "Dataset" => Ok("datasets"),
        "Influencer" => Ok("influencers"),
        "User" => Ok("users"),
        "LoraConfig" => Ok("lora_configs"),
        "Tenant" => Ok("tenants"),
        other => Err(StoreError::InvalidOperation(format!("unknown model: {other}"))),
    }
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> Result<(), StoreError> {
    qb.push(" WHERE TRUE");
    for (field, condition) in filter.iter() {
        match condition {
            Condition::Eq(JsonValue::Null) => {
                qb.push(" AND COALESCE(data -> ")
                    .push_bind(field.to_string())
                    .push(", 'null'::jsonb) = 'null'::jsonb");
            }
            Condition::Eq(value @ (JsonValue::Array(_) | JsonValue::Object(_))) => {
                qb.push(" AND data -> ")
                    .push_bind(field.to_string())
                    .push(" = ")
                    .push_bind(Json(value.clone()));
            }
            Condition::Eq(value) => {
                let mut contains = Document::new();
                contains.insert(field.to_string(), value.clone());
                qb.push(" AND data @> ").push_bind(Json(contains));
            }
            Condition::In(values) if values.is_empty() => {
                qb.push(" AND FALSE");
            }
            Condition::In(values) => {
                qb.push(" AND (");
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        qb.push(" OR ");
                    }
                    qb.push("data -> ")
                        .push_bind(field.to_string())
                        .push(" = ")
                        .push_bind(Json(value.clone()));
                }
                qb.push(")");
            }
            Condition::Range { gte, lt } => {
                if let Some(bound) = gte {
                    push_bound(qb, field, ">=", bound)?;
                }
                if let Some(bound) = lt {
                    push_bound(qb, field, "<", bound)?;
                }
            }
        }
    }
    Ok(())
}

fn push_bound(
    qb: &mut QueryBuilder<'_, Postgres>,
    field: &str,
    op: &'static str,
    bound: &JsonValue,
) -> Result<(), StoreError> {
    match bound {
        JsonValue::Number(n) => {
            let n = n
                .as_f64()
                .ok_or_else(|| StoreError::InvalidOperation(format!("unrepresentable bound on {field}")))?;
            qb.push(" AND (data ->> ")
                .push_bind(field.to_string())
                .push(")::float8 ")
                .push(op)
                .push(" ")
                .push_bind(n);
        }
        JsonValue::String(s) => {
            let s = timestamp::parse(s)
                .map(|ts| timestamp::format(&ts))
                .unwrap_or_else(|| s.clone());
            qb.push(" AND (data ->> ")
                .push_bind(field.to_string())
                .push(") COLLATE \"C\" ")
                .push(op)
                .push(" ")
                .push_bind(s);
        }
        other => {
            return Err(StoreError::InvalidOperation(format!(
                "range bound on {field} must be a number or string, got {other}"
            )));
        }
    }
    Ok(())
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, order: Option<&OrderBy>) {
    let Some(order) = order else {
        qb.push(" ORDER BY id");
        return;
    };
    qb.push(" ORDER BY data -> ").push_bind(order.field.clone());
    match order.direction {
        SortDirection::Asc => qb.push(" ASC NULLS FIRST, id ASC"),
        SortDirection::Desc => qb.push(" DESC NULLS LAST, id DESC"),
    };
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Document, StoreError> {
    let Json(doc): Json<Document> = row
        .try_get("data")
        .map_err(|e| StoreError::Serialization(format!("failed to decode document: {e}")))?;
    Ok(doc)
}

fn document_id(model: &str, data: &Document) -> Result<String, StoreError> {
    match data.get("id") {
        Some(JsonValue::String(id)) => Ok(id.clone()),
        _ => Err(StoreError::InvalidOperation(format!(
            "{model} document must carry a string id"
        ))),
    }
}

fn without_id(mut data: Document) -> Document {
    data.remove("id");
    data
}

fn map_sqlx_error(operation: &str, model: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                let field = match db_err.constraint() {
                    Some(c) if c.ends_with("_pkey") => "id".to_string(),
                    Some(c) if c.contains("execution_id") => "executionId".to_string(),
                    Some(c) => c.to_string(),
                    None => "unknown".to_string(),
                };
                return StoreError::UniqueViolation {
                    model: model.to_string(),
                    field,
                };
            }
            StoreError::Backend(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_known_model_has_a_table() {
        for model in ["Job", "PipelineExecution", "Dataset", "Influencer", "User", "LoraConfig", "Tenant"] {
            assert!(table_for(model).is_ok(), "{model}");
        }
        assert!(matches!(table_for("Nope"), Err(StoreError::InvalidOperation(_))));
    }

    #[test]
    fn filters_bind_field_names_and_values() {
        let filter = Filter::new()
            .eq("tenantId", "t1")
            .is_in("status", ["succeeded", "completed"])
            .range("createdAt", Some(json!("2026-01-01T00:00:00Z")), Some(json!(5)));
        let mut qb = QueryBuilder::<Postgres>::new("SELECT data FROM jobs");
        push_where(&mut qb, &filter).unwrap();
        let sql = qb.sql();

        assert!(sql.contains("(data ->> $1) COLLATE \"C\" >= $2"));
        assert!(sql.contains("(data ->> $3)::float8 < $4"));
        assert!(sql.contains("data -> $5 = $6 OR data -> $7 = $8"));
        assert!(sql.contains("data @> $9"));
        assert!(!sql.contains("tenantId"));
    }

    #[test]
    fn empty_in_matches_nothing() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT data FROM jobs");
        push_where(&mut qb, &Filter::new().is_in("status", Vec::<String>::new())).unwrap();
        assert!(qb.sql().ends_with("AND FALSE"));
    }

    #[test]
    fn update_payload_never_rewrites_id() {
        let doc = json!({"id": "x", "status": "running"}).as_object().cloned().unwrap();
        assert!(!without_id(doc).contains_key("id"));
    }
}
