//! Local document collections.

use super::VaultContext;
use crate::backend::{
    DeleteResult, FindOptions, InsertManyResult, InsertOneResult, UpdateResult, VaultDatabase,
};
use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use uuid::Uuid;

const ID_FIELD: &str = "_id";

pub(super) struct LocalDatabase {
    context: VaultContext,
}

impl LocalDatabase {
    pub(super) fn new(context: VaultContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl VaultDatabase for LocalDatabase {
    async fn create_collection(&self, name: &str) -> BackendResult<bool> {
        let name = name.to_string();
        self.context
            .run(move |conn, owner| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO collections (owner_did, name) VALUES (?1, ?2)",
                    params![owner, name],
                )?;
                if changed == 0 {
                    return Err(BackendError::other(format!(
                        "collection already exists: {name}"
                    )));
                }
                Ok(true)
            })
            .await
    }

    async fn delete_collection(&self, name: &str) -> BackendResult<bool> {
        let name = name.to_string();
        self.context
            .run(move |conn, owner| {
                require_collection(conn, owner, &name)?;
                conn.execute(
                    "DELETE FROM collections WHERE owner_did = ?1 AND name = ?2",
                    params![owner, name],
                )?;
                Ok(true)
            })
            .await
    }

    async fn insert_one(&self, collection: &str, document: Value) -> BackendResult<InsertOneResult> {
        let collection = collection.to_string();
        self.context
            .run(move |conn, owner| {
                require_collection(conn, owner, &collection)?;
                let inserted_id = insert_document(conn, owner, &collection, document)?;
                Ok(InsertOneResult { inserted_id })
            })
            .await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Value>,
    ) -> BackendResult<InsertManyResult> {
        let collection = collection.to_string();
        self.context
            .run(move |conn, owner| {
                require_collection(conn, owner, &collection)?;
                let inserted_ids = documents
                    .into_iter()
                    .map(|document| insert_document(conn, owner, &collection, document))
                    .collect::<BackendResult<Vec<_>>>()?;
                Ok(InsertManyResult { inserted_ids })
            })
            .await
    }

    async fn count_documents(&self, collection: &str, filter: Value) -> BackendResult<u64> {
        let collection = collection.to_string();
        self.context
            .run(move |conn, owner| {
                let documents = matching_documents(conn, owner, &collection, &filter)?;
                Ok(documents.len() as u64)
            })
            .await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Value,
        options: FindOptions,
    ) -> BackendResult<Option<Value>> {
        let options = FindOptions {
            limit: Some(1),
            ..options
        };
        let found = self.find_many(collection, filter, options).await?;
        Ok(found.into_iter().next())
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: Value,
        options: FindOptions,
    ) -> BackendResult<Vec<Value>> {
        let collection = collection.to_string();
        self.context
            .run(move |conn, owner| {
                let mut documents = matching_documents(conn, owner, &collection, &filter)?
                    .into_iter()
                    .map(|(_, document)| document)
                    .collect::<Vec<_>>();
                if let Some(sort) = options.sort.as_ref().and_then(Value::as_object) {
                    documents.sort_by(|left, right| compare_by_sort(left, right, sort));
                }
                let skip = options.skip.unwrap_or(0) as usize;
                let limit = options.limit.map_or(usize::MAX, |limit| limit as usize);
                Ok(documents
                    .into_iter()
                    .skip(skip)
                    .take(limit)
                    .map(|document| project(document, options.projection.as_ref()))
                    .collect())
            })
            .await
    }

    async fn update(
        &self,
        collection: &str,
        filter: Value,
        update: Value,
        only_one: bool,
    ) -> BackendResult<UpdateResult> {
        let collection = collection.to_string();
        self.context
            .run(move |conn, owner| {
                let mut matched = matching_documents(conn, owner, &collection, &filter)?;
                if only_one {
                    matched.truncate(1);
                }

                let mut modified_count = 0;
                for (id, document) in &matched {
                    let updated = apply_update(document, &update)?;
                    if &updated != document {
                        conn.execute(
                            "UPDATE documents SET body = ?1 WHERE id = ?2",
                            params![serde_json::to_string(&updated)?, id],
                        )?;
                        modified_count += 1;
                    }
                }

                Ok(UpdateResult {
                    matched_count: matched.len() as u64,
                    modified_count,
                    upserted_count: 0,
                    upserted_id: None,
                })
            })
            .await
    }

    async fn delete(
        &self,
        collection: &str,
        filter: Value,
        only_one: bool,
    ) -> BackendResult<DeleteResult> {
        let collection = collection.to_string();
        self.context
            .run(move |conn, owner| {
                let mut matched = matching_documents(conn, owner, &collection, &filter)?;
                if only_one {
                    matched.truncate(1);
                }
                for (id, _) in &matched {
                    conn.execute("DELETE FROM documents WHERE id = ?1", [id])?;
                }
                Ok(DeleteResult {
                    deleted_count: matched.len() as u64,
                })
            })
            .await
    }
}

fn require_collection(conn: &Connection, owner: &str, collection: &str) -> BackendResult<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM collections WHERE owner_did = ?1 AND name = ?2",
            params![owner, collection],
            |_| Ok(()),
        )
        .optional()?;
    match exists {
        Some(()) => Ok(()),
        None => Err(BackendError::other(format!(
            "collection not exist: {collection}"
        ))),
    }
}

pub(super) fn insert_document(
    conn: &Connection,
    owner: &str,
    collection: &str,
    document: Value,
) -> BackendResult<String> {
    let Value::Object(mut fields) = document else {
        return Err(BackendError::other("document must be a JSON object"));
    };
    let id = match fields.get(ID_FIELD).and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };
    fields.insert(ID_FIELD.to_string(), Value::String(id.clone()));

    conn.execute(
        "INSERT INTO documents (id, owner_did, collection, body) VALUES (?1, ?2, ?3, ?4)",
        params![id, owner, collection, serde_json::to_string(&Value::Object(fields))?],
    )?;
    Ok(id)
}

/// Returns `(id, document)` pairs in insertion order.
pub(super) fn matching_documents(
    conn: &Connection,
    owner: &str,
    collection: &str,
    filter: &Value,
) -> BackendResult<Vec<(String, Value)>> {
    require_collection(conn, owner, collection)?;
    let mut stmt = conn.prepare(
        "SELECT id, body FROM documents WHERE owner_did = ?1 AND collection = ?2 ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map(params![owner, collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut matched = Vec::new();
    for (id, body) in rows {
        let document: Value = serde_json::from_str(&body)?;
        if matches_filter(&document, filter) {
            matched.push((id, document));
        }
    }
    Ok(matched)
}

/// Top-level field equality; `null`/empty filters match everything.
fn matches_filter(document: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(key, expected)| document.get(key) == Some(expected)),
        None => filter.is_null(),
    }
}

fn apply_update(document: &Value, update: &Value) -> BackendResult<Value> {
    let Some(update_fields) = update.as_object() else {
        return Err(BackendError::other("update must be a JSON object"));
    };
    let Some(current) = document.as_object() else {
        return Err(BackendError::other("stored document is not a JSON object"));
    };

    let uses_operators = update_fields.keys().any(|key| key.starts_with('$'));
    if !uses_operators {
        // Replacement keeps the original id.
        let mut replaced = update_fields.clone();
        if let Some(id) = current.get(ID_FIELD) {
            replaced.insert(ID_FIELD.to_string(), id.clone());
        }
        return Ok(Value::Object(replaced));
    }

    let mut next = current.clone();
    for (operator, fields) in update_fields {
        let fields = fields
            .as_object()
            .ok_or_else(|| BackendError::other(format!("{operator} expects an object")))?;
        match operator.as_str() {
            "$set" => {
                for (key, value) in fields {
                    next.insert(key.clone(), value.clone());
                }
            }
            "$unset" => {
                for key in fields.keys() {
                    next.remove(key);
                }
            }
            other => {
                return Err(BackendError::other(format!(
                    "unsupported update operator: {other}"
                )))
            }
        }
    }
    Ok(Value::Object(next))
}

fn compare_by_sort(left: &Value, right: &Value, sort: &Map<String, Value>) -> Ordering {
    for (field, direction) in sort {
        let ordering = compare_values(left.get(field), right.get(field));
        let ordering = if direction.as_i64() == Some(-1) {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

fn project(document: Value, projection: Option<&Value>) -> Value {
    let Some(projection) = projection.and_then(Value::as_object) else {
        return document;
    };
    let Value::Object(fields) = document else {
        return document;
    };
    let included = projection
        .iter()
        .filter(|(_, flag)| flag.as_i64() == Some(1) || flag.as_bool() == Some(true))
        .map(|(key, _)| key.as_str())
        .collect::<Vec<_>>();
    if included.is_empty() {
        let excluded = projection.keys().map(String::as_str).collect::<Vec<_>>();
        return Value::Object(
            fields
                .into_iter()
                .filter(|(key, _)| !excluded.contains(&key.as_str()))
                .collect(),
        );
    }
    Value::Object(
        fields
            .into_iter()
            .filter(|(key, _)| key == ID_FIELD || included.contains(&key.as_str()))
            .collect(),
    )
}
