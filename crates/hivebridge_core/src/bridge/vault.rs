//! Vault-scoped entry points: node info, database, files, scripting and
//! payment.

use super::{registered, required, HiveBridge};
use crate::backend::{FindOptions, Vault};
use crate::completion::{Reply, ReplySink};
use crate::error::{normalize, BackendResult, ErrorCode, StructuredError};
use crate::handle::{Handle, OwnerReleased};
use crate::stream::StreamSessions;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

type RegisterStream<S> = fn(&StreamSessions, S, Option<Handle>) -> Result<Handle, OwnerReleased>;

fn to_json(value: impl serde::Serialize) -> Reply {
    match serde_json::to_value(value) {
        Ok(value) => Reply::Success(value),
        Err(err) => Reply::Failure(StructuredError::new(
            ErrorCode::Unspecified,
            format!("reply encoding failed: {err}"),
        )),
    }
}

/// Lenient options parsing: malformed options fall back to defaults.
fn find_options(options: Option<Value>) -> FindOptions {
    options
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

fn filter_or_all(filter: Option<Value>) -> Value {
    filter.unwrap_or_else(|| json!({}))
}

impl HiveBridge {
    pub fn vault_get_node_version(&self, vault_id: &str, reply: ReplySink) {
        self.vault_call(
            "vault_getNodeVersion",
            vault_id,
            reply,
            |_, vault| async move { vault.node_version().await },
            Value::String,
        );
    }

    pub fn vault_revoke_access_token(&self, vault_id: &str, reply: ReplySink) {
        self.vault_call(
            "vault_revokeAccessToken",
            vault_id,
            reply,
            |_, vault| async move { vault.revoke_access_token().await },
            |()| Value::Null,
        );
    }

    pub fn database_create_collection(&self, vault_id: &str, name: String, reply: ReplySink) {
        self.vault_call(
            "database_createCollection",
            vault_id,
            reply,
            |_, vault| async move { vault.database().create_collection(&name).await },
            |created| json!({ "created": created }),
        );
    }

    pub fn database_delete_collection(&self, vault_id: &str, name: String, reply: ReplySink) {
        self.vault_call(
            "database_deleteCollection",
            vault_id,
            reply,
            |_, vault| async move { vault.database().delete_collection(&name).await },
            |deleted| json!({ "deleted": deleted }),
        );
    }

    pub fn database_insert_one(
        &self,
        vault_id: &str,
        collection: String,
        document: Option<Value>,
        reply: ReplySink,
    ) {
        const ACTION: &str = "database_insertOne";
        let document = match required(document, "document") {
            Ok(document) => document,
            Err(err) => return self.completion.reject(ACTION, err, reply),
        };
        self.vault_call_with(
            ACTION,
            vault_id,
            reply,
            |_, vault| async move { vault.database().insert_one(&collection, document).await },
            to_json,
        );
    }

    pub fn database_insert_many(
        &self,
        vault_id: &str,
        collection: String,
        documents: Option<Vec<Value>>,
        reply: ReplySink,
    ) {
        const ACTION: &str = "database_insertMany";
        let documents = match required(documents, "documents") {
            Ok(documents) => documents,
            Err(err) => return self.completion.reject(ACTION, err, reply),
        };
        self.vault_call_with(
            ACTION,
            vault_id,
            reply,
            |_, vault| async move { vault.database().insert_many(&collection, documents).await },
            to_json,
        );
    }

    pub fn database_count_documents(
        &self,
        vault_id: &str,
        collection: String,
        filter: Option<Value>,
        reply: ReplySink,
    ) {
        let filter = filter_or_all(filter);
        self.vault_call(
            "database_countDocuments",
            vault_id,
            reply,
            |_, vault| async move { vault.database().count_documents(&collection, filter).await },
            |count| json!({ "count": count }),
        );
    }

    /// Replies the first matching document, or `null`.
    pub fn database_find_one(
        &self,
        vault_id: &str,
        collection: String,
        filter: Option<Value>,
        options: Option<Value>,
        reply: ReplySink,
    ) {
        let filter = filter_or_all(filter);
        let options = find_options(options);
        self.vault_call(
            "database_findOne",
            vault_id,
            reply,
            |_, vault| async move {
                vault
                    .database()
                    .find_one(&collection, filter, options)
                    .await
            },
            |found| found.unwrap_or(Value::Null),
        );
    }

    pub fn database_find_many(
        &self,
        vault_id: &str,
        collection: String,
        filter: Option<Value>,
        options: Option<Value>,
        reply: ReplySink,
    ) {
        let filter = filter_or_all(filter);
        let options = find_options(options);
        self.vault_call(
            "database_findMany",
            vault_id,
            reply,
            |_, vault| async move {
                vault
                    .database()
                    .find_many(&collection, filter, options)
                    .await
            },
            Value::Array,
        );
    }

    pub fn database_update(
        &self,
        vault_id: &str,
        collection: String,
        filter: Option<Value>,
        update: Option<Value>,
        only_one: bool,
        reply: ReplySink,
    ) {
        let action = if only_one {
            "database_updateOne"
        } else {
            "database_updateMany"
        };
        let update = match required(update, "update query") {
            Ok(update) => update,
            Err(err) => return self.completion.reject(action, err, reply),
        };
        let filter = filter_or_all(filter);
        self.vault_call_with(
            action,
            vault_id,
            reply,
            |_, vault| async move {
                vault
                    .database()
                    .update(&collection, filter, update, only_one)
                    .await
            },
            to_json,
        );
    }

    pub fn database_delete(
        &self,
        vault_id: &str,
        collection: String,
        filter: Option<Value>,
        only_one: bool,
        reply: ReplySink,
    ) {
        let action = if only_one {
            "database_deleteOne"
        } else {
            "database_deleteMany"
        };
        let filter = filter_or_all(filter);
        self.vault_call_with(
            action,
            vault_id,
            reply,
            |_, vault| async move { vault.database().delete(&collection, filter, only_one).await },
            to_json,
        );
    }

    /// Opens a writer for `path`; replies `{"objectId": <writer handle>}`.
    pub fn files_upload(&self, vault_id: &str, path: String, reply: ReplySink) {
        self.open_stream(
            "files_upload",
            vault_id,
            reply,
            |vault| async move { vault.files().upload(&path).await },
            StreamSessions::open_writer,
        );
    }

    /// Opens a reader for `path`; replies `{"objectId": <reader handle>}`.
    pub fn files_download(&self, vault_id: &str, path: String, reply: ReplySink) {
        self.open_stream(
            "files_download",
            vault_id,
            reply,
            |vault| async move { vault.files().download(&path).await },
            StreamSessions::open_reader,
        );
    }

    /// Replies `{"success": false}` instead of an error when the file is absent.
    pub fn files_delete(&self, vault_id: &str, path: String, reply: ReplySink) {
        self.vault_call(
            "files_delete",
            vault_id,
            reply,
            |_, vault| async move {
                match vault.files().delete(&path).await {
                    Err(err) if normalize(&err).code == ErrorCode::FileNotFound => Ok(false),
                    other => other,
                }
            },
            |success| json!({ "success": success }),
        );
    }

    pub fn files_move(&self, vault_id: &str, src: String, dst: String, reply: ReplySink) {
        self.vault_call(
            "files_move",
            vault_id,
            reply,
            |_, vault| async move { vault.files().move_file(&src, &dst).await },
            |success| json!({ "success": success }),
        );
    }

    pub fn files_copy(&self, vault_id: &str, src: String, dst: String, reply: ReplySink) {
        self.vault_call(
            "files_copy",
            vault_id,
            reply,
            |_, vault| async move { vault.files().copy_file(&src, &dst).await },
            |success| json!({ "success": success }),
        );
    }

    pub fn files_hash(&self, vault_id: &str, path: String, reply: ReplySink) {
        self.vault_call(
            "files_hash",
            vault_id,
            reply,
            |_, vault| async move { vault.files().hash(&path).await },
            Value::String,
        );
    }

    pub fn files_list(&self, vault_id: &str, folder: String, reply: ReplySink) {
        self.vault_call_with(
            "files_list",
            vault_id,
            reply,
            |_, vault| async move { vault.files().list(&folder).await },
            to_json,
        );
    }

    pub fn files_stat(&self, vault_id: &str, path: String, reply: ReplySink) {
        self.vault_call_with(
            "files_stat",
            vault_id,
            reply,
            |_, vault| async move { vault.files().stat(&path).await },
            to_json,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn scripting_set_script(
        &self,
        vault_id: &str,
        name: String,
        executable: Option<Value>,
        condition: Option<Value>,
        allow_anonymous_user: bool,
        allow_anonymous_app: bool,
        reply: ReplySink,
    ) {
        const ACTION: &str = "scripting_setScript";
        let executable = match required(executable, "execution sequence") {
            Ok(executable) => executable,
            Err(err) => return self.completion.reject(ACTION, err, reply),
        };
        self.vault_call(
            ACTION,
            vault_id,
            reply,
            |_, vault| async move {
                vault
                    .scripting()
                    .set_script(
                        &name,
                        executable,
                        condition,
                        allow_anonymous_user,
                        allow_anonymous_app,
                    )
                    .await
            },
            |success| json!({ "success": success }),
        );
    }

    pub fn scripting_call(
        &self,
        vault_id: &str,
        name: String,
        params: Option<Value>,
        target_did: Option<String>,
        target_app_did: Option<String>,
        reply: ReplySink,
    ) {
        self.vault_call(
            "scripting_call",
            vault_id,
            reply,
            |_, vault| async move {
                vault
                    .scripting()
                    .call_script(
                        &name,
                        params,
                        target_did.as_deref(),
                        target_app_did.as_deref(),
                    )
                    .await
            },
            |result| result,
        );
    }

    pub fn scripting_download_file(&self, vault_id: &str, transaction_id: String, reply: ReplySink) {
        self.open_stream(
            "scripting_downloadFile",
            vault_id,
            reply,
            |vault| async move { vault.scripting().download_file(&transaction_id).await },
            StreamSessions::open_reader,
        );
    }

    pub fn scripting_upload_file(&self, vault_id: &str, transaction_id: String, reply: ReplySink) {
        self.open_stream(
            "scripting_uploadFile",
            vault_id,
            reply,
            |vault| async move { vault.scripting().upload_file(&transaction_id).await },
            StreamSessions::open_writer,
        );
    }

    pub fn payment_get_pricing_info(&self, vault_id: &str, reply: ReplySink) {
        self.vault_call(
            "payment_getPricingInfo",
            vault_id,
            reply,
            |_, vault| async move { vault.payment().pricing_info().await },
            |info| info,
        );
    }

    pub fn payment_get_pricing_plan(&self, vault_id: &str, plan_name: String, reply: ReplySink) {
        self.vault_call(
            "payment_getPricingPlan",
            vault_id,
            reply,
            |_, vault| async move { vault.payment().pricing_plan(&plan_name).await },
            |plan| plan,
        );
    }

    /// Replies the new order id as a string.
    pub fn payment_place_order(&self, vault_id: &str, plan_name: String, reply: ReplySink) {
        self.vault_call(
            "payment_placeOrder",
            vault_id,
            reply,
            |_, vault| async move { vault.payment().place_order(&plan_name).await },
            Value::String,
        );
    }

    pub fn payment_pay_order(
        &self,
        vault_id: &str,
        order_id: String,
        transaction_ids: Vec<String>,
        reply: ReplySink,
    ) {
        self.vault_call(
            "payment_payOrder",
            vault_id,
            reply,
            |_, vault| async move { vault.payment().pay_order(&order_id, transaction_ids).await },
            |success| json!({ "success": success }),
        );
    }

    pub fn payment_get_order(&self, vault_id: &str, order_id: String, reply: ReplySink) {
        self.vault_call(
            "payment_getOrder",
            vault_id,
            reply,
            |_, vault| async move { vault.payment().get_order(&order_id).await },
            |order| order,
        );
    }

    pub fn payment_get_all_orders(&self, vault_id: &str, reply: ReplySink) {
        self.vault_call(
            "payment_getAllOrders",
            vault_id,
            reply,
            |_, vault| async move { vault.payment().all_orders().await },
            Value::Array,
        );
    }

    pub fn payment_get_active_pricing_plan(&self, vault_id: &str, reply: ReplySink) {
        self.vault_call(
            "payment_getActivePricingPlan",
            vault_id,
            reply,
            |_, vault| async move { vault.payment().active_pricing_plan().await },
            |plan| plan,
        );
    }

    pub fn payment_get_payment_version(&self, vault_id: &str, reply: ReplySink) {
        self.vault_call(
            "payment_getPaymentVersion",
            vault_id,
            reply,
            |_, vault| async move { vault.payment().payment_version().await },
            Value::String,
        );
    }

    /// Opens a stream on the vault and registers it under the vault handle.
    fn open_stream<S, Fut>(
        &self,
        action: &'static str,
        vault_id: &str,
        reply: ReplySink,
        open: impl FnOnce(Arc<dyn Vault>) -> Fut,
        register: RegisterStream<S>,
    ) where
        S: Send + 'static,
        Fut: Future<Output = BackendResult<S>> + Send + 'static,
    {
        let streams = self.streams.clone();
        let runtime = self.completion.runtime().clone();
        self.vault_call_with(
            action,
            vault_id,
            reply,
            |owner, vault| {
                let opening = open(vault);
                async move { opening.await.map(|stream| (owner, stream)) }
            },
            move |(owner, stream)| {
                registered(&runtime, register(&streams, stream, Some(owner)), |handle| {
                    json!({ "objectId": handle.to_string() })
                })
            },
        );
    }
}
