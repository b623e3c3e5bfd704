use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use genflow_core::{Model, PipelineExecution, SortDirection};

use super::{Document, Filter, Operation, OrderBy, Outcome, RecordStore, StoreError};

/// In-memory record store.
///
/// Intended for tests/dev. Not optimized for performance: every operation
/// scans the model's documents.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    tables: RwLock<HashMap<String, Vec<Document>>>,
    /// Unique fields per model in addition to `id`.
    unique: HashMap<String, Vec<String>>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    /// Store with the same unique constraints as the Postgres schema.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            unique: HashMap::new(),
        }
        .with_unique(PipelineExecution::MODEL, "executionId")
    }

    pub fn with_unique(mut self, model: impl Into<String>, field: impl Into<String>) -> Self {
        self.unique
            .entry(model.into())
            .or_default()
            .push(field.into());
        self
    }

    /// Number of stored documents for a model, regardless of tenant.
    pub fn len(&self, model: &str) -> usize {
        self.tables
            .read()
            .map(|t| t.get(model).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn unique_fields<'a>(&'a self, model: &str) -> impl Iterator<Item = &'a str> + 'a {
        std::iter::once("id").chain(
            self.unique
                .get(model)
                .into_iter()
                .flatten()
                .map(String::as_str),
        )
    }

    /// Reject `doc` if it collides with any document other than `skip`.
    fn check_unique(
        &self,
        model: &str,
        docs: &[Document],
        doc: &Document,
        skip: Option<usize>,
    ) -> Result<(), StoreError> {
        for field in self.unique_fields(model) {
            let Some(value) = doc.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = docs
                .iter()
                .enumerate()
                .any(|(idx, other)| Some(idx) != skip && other.get(field) == Some(value));
            if clash {
                return Err(StoreError::UniqueViolation {
                    model: model.to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    fn insert(&self, model: &str, docs: &mut Vec<Document>, doc: Document) -> Result<Document, StoreError> {
        if !matches!(doc.get("id"), Some(JsonValue::String(_))) {
            return Err(StoreError::InvalidOperation(format!(
                "{model} document must carry a string id"
            )));
        }
        self.check_unique(model, docs, &doc, None)?;
        docs.push(doc.clone());
        Ok(doc)
    }

    fn update_at(
        &self,
        model: &str,
        docs: &mut [Document],
        idx: usize,
        data: &Document,
    ) -> Result<Document, StoreError> {
        let mut merged = docs[idx].clone();
        merge(&mut merged, data);
        self.check_unique(model, docs, &merged, Some(idx))?;
        docs[idx] = merged.clone();
        Ok(merged)
    }

    fn apply(&self, model: &str, docs: &mut Vec<Document>, op: Operation) -> Result<Outcome, StoreError> {
        match op {
            Operation::FindMany {
                filter,
                order,
                pagination,
            } => {
                let mut found = select(docs, &filter, order.as_ref());
                if let Some(p) = pagination {
                    found = found
                        .into_iter()
                        .skip(p.offset as usize)
                        .take(p.limit as usize)
                        .collect();
                }
                Ok(Outcome::Many(found))
            }
            Operation::FindFirst { filter, order } => Ok(Outcome::One(
                select(docs, &filter, order.as_ref()).into_iter().next(),
            )),
            Operation::FindUnique { filter } => Ok(Outcome::One(
                docs.iter().find(|d| filter.matches(d)).cloned(),
            )),
            Operation::Count { filter } => Ok(Outcome::Count(
                docs.iter().filter(|d| filter.matches(d)).count() as u64,
            )),
            Operation::Create { data } => Ok(Outcome::One(Some(self.insert(model, docs, data)?))),
            Operation::CreateMany { data } => {
                // All-or-nothing: validate against a scratch copy first.
                let mut scratch = docs.clone();
                let n = data.len() as u64;
                for doc in data {
                    self.insert(model, &mut scratch, doc)?;
                }
                *docs = scratch;
                Ok(Outcome::Count(n))
            }
            Operation::Update { filter, data } => {
                match docs.iter().position(|d| filter.matches(d)) {
                    Some(idx) => Ok(Outcome::One(Some(self.update_at(model, docs, idx, &data)?))),
                    None => Ok(Outcome::One(None)),
                }
            }
            Operation::UpdateMany { filter, data } => {
                let targets: Vec<usize> = positions(docs, &filter);
                for &idx in &targets {
                    self.update_at(model, docs, idx, &data)?;
                }
                Ok(Outcome::Count(targets.len() as u64))
            }
            Operation::Upsert {
                filter,
                create,
                update,
            } => match docs.iter().position(|d| filter.matches(d)) {
                Some(idx) => Ok(Outcome::One(Some(self.update_at(model, docs, idx, &update)?))),
                None => Ok(Outcome::One(Some(self.insert(model, docs, create)?))),
            },
            Operation::Delete { filter } => match docs.iter().position(|d| filter.matches(d)) {
                Some(idx) => Ok(Outcome::One(Some(docs.remove(idx)))),
                None => Ok(Outcome::One(None)),
            },
            Operation::DeleteMany { filter } => {
                let before = docs.len();
                docs.retain(|d| !filter.matches(d));
                Ok(Outcome::Count((before - docs.len()) as u64))
            }
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn execute(&self, model: &str, op: Operation) -> Result<Outcome, StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        let docs = tables.entry(model.to_string()).or_default();
        self.apply(model, docs, op)
    }
}

fn positions(docs: &[Document], filter: &Filter) -> Vec<usize> {
    docs.iter()
        .enumerate()
        .filter(|(_, d)| filter.matches(d))
        .map(|(idx, _)| idx)
        .collect()
}

static NULL: JsonValue = JsonValue::Null;

/// A missing field sorts as null.
fn field<'a>(doc: &'a Document, name: &str) -> &'a JsonValue {
    doc.get(name).unwrap_or(&NULL)
}

fn select(docs: &[Document], filter: &Filter, order: Option<&OrderBy>) -> Vec<Document> {
    let mut found: Vec<Document> = docs.iter().filter(|d| filter.matches(d)).cloned().collect();
    if let Some(order) = order {
        found.sort_by(|a, b| {
            // Ties break on id in the same direction, as the SQL backend does.
            let ord = sort_order(field(a, &order.field), field(b, &order.field))
                .then_with(|| sort_order(field(a, "id"), field(b, "id")));
            match order.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });
    }
    found
}

/// Total order used for sorting: null < bool < number < string < other.
fn sort_order(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Null => 0,
            JsonValue::Bool(_) => 1,
            JsonValue::Number(_) => 2,
            JsonValue::String(_) => 3,
            JsonValue::Array(_) | JsonValue::Object(_) => 4,
        }
    }
    match (a, b) {
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        (JsonValue::Number(x), JsonValue::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&y.as_f64().unwrap_or(0.0)),
        // Timestamps are fixed-width, so byte order is chronological order.
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Shallow merge of `patch` into `doc`; `id` is immutable.
fn merge(doc: &mut Document, patch: &Document) {
    for (key, value) in patch {
        if key == "id" {
            continue;
        }
        doc.insert(key.clone(), value.clone());
    }
}
