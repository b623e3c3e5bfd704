//! Typed helpers over [`RecordStore`] for [`Model`] types.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use genflow_core::{Model, Pagination};

use super::{Document, Filter, Operation, OrderBy, RecordStore, StoreError};

pub fn to_document<T: Serialize + ?Sized>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Serialization(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(e) => Err(StoreError::Serialization(e.to_string())),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    serde_json::from_value(JsonValue::Object(doc)).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_one<M: Model>(doc: Option<Document>) -> Result<Option<M>, StoreError> {
    doc.map(from_document).transpose()
}

pub async fn create<M, S>(store: &S, record: &M) -> Result<M, StoreError>
where
    M: Model,
    S: RecordStore + ?Sized,
{
    let data = to_document(record)?;
    let stored = store.execute(M::MODEL, Operation::Create { data }).await?.into_one()?;
    decode_one(stored)?.ok_or_else(|| StoreError::Backend(format!("{} create returned no record", M::MODEL)))
}

pub async fn find_unique<M, S>(store: &S, filter: Filter) -> Result<Option<M>, StoreError>
where
    M: Model,
    S: RecordStore + ?Sized,
{
    let doc = store.execute(M::MODEL, Operation::FindUnique { filter }).await?.into_one()?;
    decode_one(doc)
}

pub async fn find_first<M, S>(store: &S, filter: Filter, order: Option<OrderBy>) -> Result<Option<M>, StoreError>
where
    M: Model,
    S: RecordStore + ?Sized,
{
    let doc = store
        .execute(M::MODEL, Operation::FindFirst { filter, order })
        .await?
        .into_one()?;
    decode_one(doc)
}

pub async fn find_many<M, S>(
    store: &S,
    filter: Filter,
    order: Option<OrderBy>,
    pagination: Option<Pagination>,
) -> Result<Vec<M>, StoreError>
where
    M: Model,
    S: RecordStore + ?Sized,
{
    store
        .execute(
            M::MODEL,
            Operation::FindMany {
                filter,
                order,
                pagination,
            },
        )
        .await?
        .into_many()?
        .into_iter()
        .map(from_document)
        .collect()
}

pub async fn count<M, S>(store: &S, filter: Filter) -> Result<u64, StoreError>
where
    M: Model,
    S: RecordStore + ?Sized,
{
    store.execute(M::MODEL, Operation::Count { filter }).await?.into_count()
}

/// Partially update the first record matching `filter` with the serialized
/// fields of `patch`. `None` when nothing matched.
pub async fn update<M, S, P>(store: &S, filter: Filter, patch: &P) -> Result<Option<M>, StoreError>
where
    M: Model,
    S: RecordStore + ?Sized,
    P: Serialize + ?Sized,
{
    let data = to_document(patch)?;
    let doc = store
        .execute(M::MODEL, Operation::Update { filter, data })
        .await?
        .into_one()?;
    decode_one(doc)
}
