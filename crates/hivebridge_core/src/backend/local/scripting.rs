//! Local scripting: named executables over the vault's own collections and
//! files.
//!
//! Supported executable types are `find`, `insert`, `fileDownload`,
//! `fileUpload` and `aggregated`. String values of the form `$params.<key>`
//! are replaced with the caller's parameters before execution.

use super::database::{insert_document, matching_documents};
use super::files::{normalize_path, read_file, FileWriter};
use super::VaultContext;
use crate::backend::{ReadStream, VaultScripting, WriteStream};
use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::io::Cursor;
use uuid::Uuid;

const PARAMS_PREFIX: &str = "$params.";

pub(super) struct LocalScripting {
    context: VaultContext,
}

impl LocalScripting {
    pub(super) fn new(context: VaultContext) -> Self {
        Self { context }
    }

    /// Consumes a transfer transaction and returns `(owner_did, path)`.
    async fn take_transaction(
        &self,
        transaction_id: &str,
        direction: &'static str,
    ) -> BackendResult<(String, String)> {
        let transaction_id = transaction_id.trim().to_string();
        self.context
            .run(move |conn, _owner| {
                let found = conn
                    .query_row(
                        "SELECT owner_did, path FROM script_transactions
                         WHERE transaction_id = ?1 AND direction = ?2",
                        params![transaction_id, direction],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;
                let Some(found) = found else {
                    return Err(BackendError::other(format!(
                        "unknown {direction} transaction: {transaction_id}"
                    )));
                };
                conn.execute(
                    "DELETE FROM script_transactions WHERE transaction_id = ?1",
                    [transaction_id.as_str()],
                )?;
                Ok(found)
            })
            .await
    }
}

#[async_trait]
impl VaultScripting for LocalScripting {
    async fn set_script(
        &self,
        name: &str,
        executable: Value,
        condition: Option<Value>,
        allow_anonymous_user: bool,
        allow_anonymous_app: bool,
    ) -> BackendResult<bool> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(BackendError::other("script name must not be empty"));
        }
        validate_executable(&executable)?;
        self.context
            .run(move |conn, owner| {
                let condition = match condition {
                    Some(condition) if !condition.is_null() => {
                        Some(serde_json::to_string(&condition)?)
                    }
                    _ => None,
                };
                conn.execute(
                    "INSERT INTO scripts
                        (owner_did, name, executable, condition, allow_anonymous_user, allow_anonymous_app)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (owner_did, name) DO UPDATE SET
                        executable = excluded.executable,
                        condition = excluded.condition,
                        allow_anonymous_user = excluded.allow_anonymous_user,
                        allow_anonymous_app = excluded.allow_anonymous_app",
                    params![
                        owner,
                        name,
                        serde_json::to_string(&executable)?,
                        condition,
                        allow_anonymous_user,
                        allow_anonymous_app
                    ],
                )?;
                Ok(true)
            })
            .await
    }

    async fn call_script(
        &self,
        name: &str,
        params: Option<Value>,
        target_did: Option<&str>,
        _target_app_did: Option<&str>,
    ) -> BackendResult<Value> {
        let name = name.trim().to_string();
        let target_did = target_did.map(str::to_string);
        let params = params.unwrap_or(Value::Null);
        self.context
            .run(move |conn, owner| {
                let script_owner = target_did.as_deref().unwrap_or(owner);
                let (executable, condition) = load_script(conn, script_owner, &name)?;

                if let Some(condition) = condition {
                    let condition = substitute_params(&condition, &params);
                    if !condition_holds(conn, script_owner, &condition)? {
                        return Err(BackendError::other(format!(
                            "condition of script `{name}` is not satisfied"
                        )));
                    }
                }

                let executable = substitute_params(&executable, &params);
                let mut output = Map::new();
                run_executable(conn, script_owner, &executable, &mut output)?;
                Ok(Value::Object(output))
            })
            .await
    }

    async fn download_file(&self, transaction_id: &str) -> BackendResult<ReadStream> {
        let (owner, path) = self.take_transaction(transaction_id, "download").await?;
        let content = self
            .context
            .run(move |conn, _caller| read_file(conn, &owner, &path))
            .await?;
        Ok(Box::new(Cursor::new(content)))
    }

    async fn upload_file(&self, transaction_id: &str) -> BackendResult<WriteStream> {
        let (owner, path) = self.take_transaction(transaction_id, "upload").await?;
        Ok(Box::new(FileWriter::new(
            self.context.conn.clone(),
            owner,
            path,
        )))
    }
}

fn validate_executable(executable: &Value) -> BackendResult<()> {
    let kind = executable_type(executable)?;
    match kind {
        "find" | "insert" | "fileDownload" | "fileUpload" => Ok(()),
        "aggregated" => executable
            .get("body")
            .and_then(Value::as_array)
            .ok_or_else(|| BackendError::other("aggregated executable needs an array body"))?
            .iter()
            .try_for_each(validate_executable),
        other => Err(BackendError::other(format!(
            "unsupported executable type: {other}"
        ))),
    }
}

fn executable_type(executable: &Value) -> BackendResult<&str> {
    executable
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::other("executable has no `type`"))
}

fn load_script(
    conn: &Connection,
    owner: &str,
    name: &str,
) -> BackendResult<(Value, Option<Value>)> {
    let row = conn
        .query_row(
            "SELECT executable, condition FROM scripts WHERE owner_did = ?1 AND name = ?2",
            params![owner, name],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;
    let Some((executable, condition)) = row else {
        return Err(BackendError::other(format!("script not found: {name}")));
    };
    let executable = serde_json::from_str(&executable)?;
    let condition = condition
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()?;
    Ok((executable, condition))
}

/// Conditions are `queryHasResults` checks against one collection.
fn condition_holds(conn: &Connection, owner: &str, condition: &Value) -> BackendResult<bool> {
    let body = condition.get("body").unwrap_or(&Value::Null);
    let collection = body_str(body, "collection")?;
    let filter = body.get("filter").cloned().unwrap_or(Value::Null);
    Ok(!matching_documents(conn, owner, collection, &filter)?.is_empty())
}

fn run_executable(
    conn: &Connection,
    owner: &str,
    executable: &Value,
    output: &mut Map<String, Value>,
) -> BackendResult<()> {
    let kind = executable_type(executable)?;
    let name = executable
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(kind)
        .to_string();
    let body = executable.get("body").unwrap_or(&Value::Null);

    let result = match kind {
        "find" => {
            let collection = body_str(body, "collection")?;
            let filter = body.get("filter").cloned().unwrap_or(Value::Null);
            let limit = body
                .pointer("/options/limit")
                .and_then(Value::as_u64)
                .map_or(usize::MAX, |limit| limit as usize);
            let items = matching_documents(conn, owner, collection, &filter)?
                .into_iter()
                .map(|(_, document)| document)
                .take(limit)
                .collect::<Vec<_>>();
            json!({ "items": items })
        }
        "insert" => {
            let collection = body_str(body, "collection")?;
            let document = body.get("document").cloned().unwrap_or(Value::Null);
            let inserted_id = insert_document(conn, owner, collection, document)?;
            json!({ "inserted_id": inserted_id })
        }
        "fileDownload" | "fileUpload" => {
            let path = normalize_path(body_str(body, "path")?)?;
            let direction = if kind == "fileDownload" {
                "download"
            } else {
                "upload"
            };
            let transaction_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO script_transactions (transaction_id, owner_did, path, direction)
                 VALUES (?1, ?2, ?3, ?4)",
                params![transaction_id, owner, path, direction],
            )?;
            json!({ "transaction_id": transaction_id })
        }
        "aggregated" => {
            let steps = body
                .as_array()
                .ok_or_else(|| BackendError::other("aggregated executable needs an array body"))?;
            for step in steps {
                run_executable(conn, owner, step, output)?;
            }
            return Ok(());
        }
        other => {
            return Err(BackendError::other(format!(
                "unsupported executable type: {other}"
            )))
        }
    };

    output.insert(name, result);
    Ok(())
}

fn body_str<'a>(body: &'a Value, field: &str) -> BackendResult<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::other(format!("executable body has no `{field}`")))
}

/// Replaces `$params.<key>` strings with the matching parameter value.
fn substitute_params(value: &Value, params: &Value) -> Value {
    match value {
        Value::String(text) => match text.strip_prefix(PARAMS_PREFIX) {
            Some(key) => params.get(key).cloned().unwrap_or(Value::Null),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_params(item, params))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), substitute_params(item, params)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::{substitute_params, validate_executable};
    use serde_json::json;

    #[test]
    fn params_are_substituted_recursively() {
        let executable = json!({
            "type": "find",
            "body": { "collection": "notes", "filter": { "author": "$params.author", "tags": ["$params.tag"] } }
        });
        let resolved = substitute_params(&executable, &json!({ "author": "alice" }));
        assert_eq!(resolved["body"]["filter"]["author"], "alice");
        assert_eq!(resolved["body"]["filter"]["tags"], json!([null]));
        assert_eq!(resolved["body"]["collection"], "notes");
    }

    #[test]
    fn unknown_executable_types_are_rejected() {
        assert!(validate_executable(&json!({ "type": "find", "body": {} })).is_ok());
        assert!(validate_executable(&json!({ "type": "delete" })).is_err());
        assert!(validate_executable(&json!({ "body": {} })).is_err());
        assert!(validate_executable(&json!({
            "type": "aggregated",
            "body": [{ "type": "insert" }, { "type": "bogus" }]
        }))
        .is_err());
    }
}
