use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_lock::Mutex as AsyncMutex;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value as JsonValue};

use crate::database::EmulatorDatabase;
use crate::error::{invalid_argument, FirestoreResult};
use crate::model::Timestamp;
use crate::query::{run_aggregation, run_query, QueryDefinition, QueryResult};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::structured_query::{decode_aggregation_query, decode_structured_query};
use crate::store::{
    set_value_at_field_path, CommitMode, DocumentStore, MetaDocument, Transaction,
    TransactionMode, TransactionOptions, WriteOperation,
};
use crate::value::{FirestoreValue, MapValue};
use crate::watch::{
    DocumentChangeKind, ListenSession, ListenerEvent, TargetScope,
};

/// The GAPIC-shaped operations the emulator exposes. Request and response
/// bodies are proto-JSON trees, the same shapes a real backend speaks.
#[async_trait]
pub trait FirestoreRpc: Send + Sync {
    async fn commit(&self, request: JsonValue) -> FirestoreResult<JsonValue>;
    async fn batch_write(&self, request: JsonValue) -> FirestoreResult<JsonValue>;
    async fn batch_get_documents(&self, request: JsonValue) -> FirestoreResult<Vec<JsonValue>>;
    async fn begin_transaction(&self, request: JsonValue) -> FirestoreResult<JsonValue>;
    async fn rollback(&self, request: JsonValue) -> FirestoreResult<JsonValue>;
    async fn run_query(&self, request: JsonValue) -> FirestoreResult<Vec<JsonValue>>;
    async fn run_aggregation_query(&self, request: JsonValue) -> FirestoreResult<Vec<JsonValue>>;
    async fn listen(&self) -> FirestoreResult<ListenStream>;
}

/// Consistency selector shared by the read operations. At most one variant
/// may be present on a request.
enum Consistency {
    Default,
    Transaction(Bytes),
    NewTransaction(TransactionOptions),
    ReadTime(Timestamp),
}

fn decode_consistency(
    serializer: &JsonProtoSerializer,
    request: &JsonValue,
) -> FirestoreResult<Consistency> {
    let transaction = request.get("transaction");
    let new_transaction = request.get("newTransaction");
    let read_time = request.get("readTime");

    let present =
        [transaction.is_some(), new_transaction.is_some(), read_time.is_some()]
            .iter()
            .filter(|p| **p)
            .count();
    if present > 1 {
        return Err(invalid_argument(
            "transaction, newTransaction and readTime are mutually exclusive",
        ));
    }

    if let Some(transaction) = transaction {
        return Ok(Consistency::Transaction(
            serializer.decode_transaction_id(transaction)?,
        ));
    }
    if let Some(options) = new_transaction {
        return Ok(Consistency::NewTransaction(decode_transaction_options(
            serializer, options,
        )?));
    }
    if let Some(read_time) = read_time {
        let raw = read_time
            .as_str()
            .ok_or_else(|| invalid_argument("readTime must be a timestamp string"))?;
        return Ok(Consistency::ReadTime(serializer.decode_timestamp_string(raw)?));
    }
    Ok(Consistency::Default)
}

fn decode_transaction_options(
    serializer: &JsonProtoSerializer,
    options: &JsonValue,
) -> FirestoreResult<TransactionOptions> {
    let read_only = options.get("readOnly");
    let read_write = options.get("readWrite");
    match (read_only, read_write) {
        (Some(read_only), None) => {
            let read_time = read_only
                .get("readTime")
                .and_then(JsonValue::as_str)
                .map(|raw| serializer.decode_timestamp_string(raw))
                .transpose()?;
            Ok(TransactionOptions::ReadOnly { read_time })
        }
        (None, Some(read_write)) => {
            let retry_transaction = read_write
                .get("retryTransaction")
                .map(|token| serializer.decode_transaction_id(token))
                .transpose()?;
            Ok(TransactionOptions::ReadWrite { retry_transaction })
        }
        (None, None) => Ok(TransactionOptions::ReadWrite {
            retry_transaction: None,
        }),
        (Some(_), Some(_)) => Err(invalid_argument(
            "Transaction options must be readOnly or readWrite, not both",
        )),
    }
}

/// Read-only transactions pin every read at their snapshot time.
fn transaction_snapshot(transaction: &Transaction) -> Option<Timestamp> {
    match transaction.mode() {
        TransactionMode::ReadOnly(at) => Some(at),
        TransactionMode::ReadWrite => None,
    }
}

fn decode_writes(
    serializer: &JsonProtoSerializer,
    request: &JsonValue,
) -> FirestoreResult<Vec<WriteOperation>> {
    match request.get("writes") {
        Some(JsonValue::Array(entries)) => entries
            .iter()
            .map(|entry| serializer.decode_write(entry))
            .collect(),
        Some(_) => Err(invalid_argument("writes must be an array")),
        None => Ok(Vec::new()),
    }
}

impl EmulatorDatabase {
    fn read_time_for(&self, consistency: &Consistency) -> Timestamp {
        match consistency {
            Consistency::ReadTime(at) => *at,
            _ => self.store().last_commit_time(),
        }
    }

    /// Evaluates a decoded query under the requested consistency, returning
    /// the results, the read time and the transaction opened for a
    /// `newTransaction` selector.
    fn evaluate_query(
        &self,
        definition: &QueryDefinition,
        consistency: &Consistency,
    ) -> FirestoreResult<(Vec<QueryResult>, Timestamp, Option<Arc<Transaction>>)> {
        let (snapshot_time, transaction) = match consistency {
            Consistency::Default => (None, None),
            Consistency::ReadTime(at) => (Some(*at), None),
            Consistency::Transaction(id) => {
                let transaction = self.transactions().fetch(id)?;
                (transaction_snapshot(&transaction), Some(transaction))
            }
            Consistency::NewTransaction(options) => {
                let transaction = self.transactions().begin(options.clone())?;
                (transaction_snapshot(&transaction), Some(transaction))
            }
        };

        let documents = self.store().existing_documents(snapshot_time);
        let results = run_query(documents, definition)?;
        if let Some(transaction) = transaction.as_ref() {
            let docs: Vec<Arc<MetaDocument>> = results
                .iter()
                .map(|result| Arc::clone(&result.document))
                .collect();
            self.transactions().record_query_reads(transaction, &docs);
        }
        let read_time = snapshot_time.unwrap_or_else(|| self.store().last_commit_time());
        Ok((results, read_time, transaction))
    }

    /// Applies projection and the synthesized distance field before a result
    /// document goes on the wire.
    fn encode_result_document(
        &self,
        definition: &QueryDefinition,
        result: &QueryResult,
    ) -> FirestoreResult<JsonValue> {
        let document = &result.document;
        let mut fields: Option<MapValue> = None;

        if let Some(projection) = definition.projection() {
            let mut projected = BTreeMap::new();
            for path in projection {
                if path.is_document_id() {
                    continue;
                }
                if let Some(value) = document.field(path) {
                    set_value_at_field_path(&mut projected, path, value.clone());
                }
            }
            fields = Some(MapValue::new(projected));
        }

        if let Some(stage) = definition.find_nearest() {
            if let (Some(distance_field), Some(distance)) =
                (stage.distance_result_field.as_ref(), result.distance)
            {
                let mut augmented = fields
                    .map(MapValue::into_fields)
                    .or_else(|| document.data().map(|data| data.fields().clone()))
                    .unwrap_or_default();
                set_value_at_field_path(
                    &mut augmented,
                    distance_field,
                    FirestoreValue::from_double(distance),
                );
                fields = Some(MapValue::new(augmented));
            }
        }

        self.serializer()
            .encode_document_with_fields(document, fields.as_ref())
    }
}

#[async_trait]
impl FirestoreRpc for EmulatorDatabase {
    async fn commit(&self, request: JsonValue) -> FirestoreResult<JsonValue> {
        let serializer = self.serializer();
        let writes = decode_writes(serializer, &request)?;

        let response = match request.get("transaction") {
            Some(transaction) => {
                let id = serializer.decode_transaction_id(transaction)?;
                let transaction = self.transactions().fetch(&id)?;
                self.transactions().commit(&transaction, &writes)?
            }
            None => self.store().commit(&writes, CommitMode::Atomic)?,
        };

        let write_results = response
            .write_results
            .iter()
            .map(|result| serializer.encode_write_result(result))
            .collect::<FirestoreResult<Vec<_>>>()?;
        Ok(json!({
            "commitTime": serializer.encode_timestamp(response.commit_time),
            "writeResults": write_results,
        }))
    }

    async fn batch_write(&self, request: JsonValue) -> FirestoreResult<JsonValue> {
        let serializer = self.serializer();
        let writes = decode_writes(serializer, &request)?;
        let response = self.store().commit(&writes, CommitMode::BatchWrite)?;

        let mut write_results = Vec::with_capacity(response.write_results.len());
        let mut statuses = Vec::with_capacity(response.write_results.len());
        for result in &response.write_results {
            write_results.push(serializer.encode_write_result(result)?);
            statuses.push(match &result.status {
                None => json!({ "code": 0 }),
                Some(err) => json!({
                    "code": err.code.grpc_code(),
                    "message": err.message(),
                }),
            });
        }
        Ok(json!({
            "writeResults": write_results,
            "status": statuses,
        }))
    }

    async fn batch_get_documents(&self, request: JsonValue) -> FirestoreResult<Vec<JsonValue>> {
        let serializer = self.serializer();
        let consistency = decode_consistency(serializer, &request)?;
        let names = request
            .get("documents")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("BatchGetDocuments requires documents"))?;

        let transaction = match &consistency {
            Consistency::Transaction(id) => Some(self.transactions().fetch(id)?),
            Consistency::NewTransaction(options) => {
                Some(self.transactions().begin(options.clone())?)
            }
            _ => None,
        };
        let read_time = self.read_time_for(&consistency);
        let encoded_read_time = serializer.encode_timestamp(read_time);

        let mut responses = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let name = name
                .as_str()
                .ok_or_else(|| invalid_argument("documents entries must be names"))?;
            let key = serializer.document_key_from_name(name)?;

            let doc = match (&transaction, &consistency) {
                (Some(transaction), _) => self.transactions().get_doc(transaction, &key)?,
                (None, Consistency::ReadTime(at)) => self.store().get_doc(&key, Some(*at)),
                (None, _) => self.store().get_doc(&key, None),
            };

            let mut item = serde_json::Map::new();
            if doc.exists() {
                item.insert("found".to_string(), serializer.encode_document(&doc)?);
            } else {
                item.insert("missing".to_string(), json!(name));
            }
            item.insert("readTime".to_string(), json!(encoded_read_time));
            if index == 0 {
                if let (Some(transaction), Consistency::NewTransaction(_)) =
                    (&transaction, &consistency)
                {
                    item.insert(
                        "transaction".to_string(),
                        json!(serializer.encode_transaction_id(transaction.id())),
                    );
                }
            }
            responses.push(JsonValue::Object(item));
        }
        Ok(responses)
    }

    async fn begin_transaction(&self, request: JsonValue) -> FirestoreResult<JsonValue> {
        let serializer = self.serializer();
        let options = match request.get("options") {
            Some(options) => decode_transaction_options(serializer, options)?,
            None => TransactionOptions::ReadWrite {
                retry_transaction: None,
            },
        };
        let transaction = self.transactions().begin(options)?;
        Ok(json!({
            "transaction": serializer.encode_transaction_id(transaction.id()),
        }))
    }

    async fn rollback(&self, request: JsonValue) -> FirestoreResult<JsonValue> {
        let serializer = self.serializer();
        let id = request
            .get("transaction")
            .ok_or_else(|| invalid_argument("Rollback requires transaction"))?;
        let id = serializer.decode_transaction_id(id)?;
        let transaction = self.transactions().fetch(&id)?;
        self.transactions().rollback(&transaction)?;
        Ok(json!({}))
    }

    async fn run_query(&self, request: JsonValue) -> FirestoreResult<Vec<JsonValue>> {
        let serializer = self.serializer();
        let parent = request
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("RunQuery requires parent"))?;
        let parent = serializer.relative_path_from_name(parent)?;
        let structured = request
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("RunQuery requires structuredQuery"))?;
        let definition = decode_structured_query(serializer, parent, structured)?;

        let consistency = decode_consistency(serializer, &request)?;
        let (results, read_time, transaction) = self.evaluate_query(&definition, &consistency)?;
        let encoded_read_time = serializer.encode_timestamp(read_time);
        let new_transaction = match (&transaction, &consistency) {
            (Some(transaction), Consistency::NewTransaction(_)) => {
                Some(serializer.encode_transaction_id(transaction.id()))
            }
            _ => None,
        };

        let mut responses = Vec::new();
        if results.is_empty() {
            let mut item = serde_json::Map::new();
            item.insert("readTime".to_string(), json!(encoded_read_time));
            if let Some(token) = &new_transaction {
                item.insert("transaction".to_string(), json!(token));
            }
            responses.push(JsonValue::Object(item));
            return Ok(responses);
        }

        for (index, result) in results.iter().enumerate() {
            let mut item = serde_json::Map::new();
            item.insert(
                "document".to_string(),
                self.encode_result_document(&definition, result)?,
            );
            item.insert("readTime".to_string(), json!(encoded_read_time));
            if index == 0 {
                if let Some(token) = &new_transaction {
                    item.insert("transaction".to_string(), json!(token));
                }
            }
            responses.push(JsonValue::Object(item));
        }
        Ok(responses)
    }

    async fn run_aggregation_query(&self, request: JsonValue) -> FirestoreResult<Vec<JsonValue>> {
        let serializer = self.serializer();
        let parent = request
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("RunAggregationQuery requires parent"))?;
        let parent = serializer.relative_path_from_name(parent)?;
        let structured = request
            .get("structuredAggregationQuery")
            .ok_or_else(|| {
                invalid_argument("RunAggregationQuery requires structuredAggregationQuery")
            })?;
        let (definition, aggregates) =
            decode_aggregation_query(serializer, parent, structured)?;

        let consistency = decode_consistency(serializer, &request)?;
        let (results, read_time, _) = self.evaluate_query(&definition, &consistency)?;
        let aggregated = run_aggregation(&results, &aggregates)?;

        let mut aggregate_fields = serde_json::Map::new();
        for (alias, value) in aggregated {
            aggregate_fields.insert(alias, serializer.encode_value(&value)?);
        }
        Ok(vec![json!({
            "result": { "aggregateFields": aggregate_fields },
            "readTime": serializer.encode_timestamp(read_time),
        })])
    }

    async fn listen(&self) -> FirestoreResult<ListenStream> {
        Ok(ListenStream::new(
            self.broadcaster().subscribe(),
            self.serializer().clone(),
            Arc::clone(self.store()),
        ))
    }
}

/// One bidirectional `Listen` stream: requests add or remove targets, and
/// responses arrive as `targetChange`/`documentChange`/`documentDelete`
/// frames in delivery order.
pub struct ListenStream {
    session: ListenSession,
    serializer: JsonProtoSerializer,
    store: Arc<DocumentStore>,
    buffered: AsyncMutex<VecDeque<JsonValue>>,
}

impl ListenStream {
    pub(crate) fn new(
        session: ListenSession,
        serializer: JsonProtoSerializer,
        store: Arc<DocumentStore>,
    ) -> Self {
        Self {
            session,
            serializer,
            store,
            buffered: AsyncMutex::new(VecDeque::new()),
        }
    }

    /// The underlying session, for callers that want typed events with
    /// change indices instead of wire frames.
    pub fn session(&self) -> &ListenSession {
        &self.session
    }

    /// Handles one client message: `addTarget` or `removeTarget`.
    pub fn request(&self, message: &JsonValue) -> FirestoreResult<()> {
        if let Some(add_target) = message.get("addTarget") {
            let target_id = add_target
                .get("targetId")
                .and_then(JsonValue::as_i64)
                .unwrap_or(0) as i32;
            let scope = self.decode_target_scope(add_target)?;
            self.session.add_target(target_id, scope);
            return Ok(());
        }
        if let Some(remove_target) = message.get("removeTarget") {
            let target_id = remove_target
                .as_i64()
                .ok_or_else(|| invalid_argument("removeTarget must be a target id"))?;
            self.session.remove_target(target_id as i32);
            return Ok(());
        }
        Err(invalid_argument(
            "Listen request must contain addTarget or removeTarget",
        ))
    }

    fn decode_target_scope(&self, add_target: &JsonValue) -> FirestoreResult<TargetScope> {
        if let Some(documents) = add_target.get("documents") {
            let names = documents
                .get("documents")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| invalid_argument("documents target requires document names"))?;
            let keys = names
                .iter()
                .map(|name| {
                    name.as_str()
                        .ok_or_else(|| invalid_argument("document names must be strings"))
                        .and_then(|name| self.serializer.document_key_from_name(name))
                })
                .collect::<FirestoreResult<Vec<_>>>()?;
            return Ok(TargetScope::Documents(keys));
        }
        if let Some(query) = add_target.get("query") {
            let parent = query
                .get("parent")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("query target requires parent"))?;
            let parent = self.serializer.relative_path_from_name(parent)?;
            let structured = query
                .get("structuredQuery")
                .ok_or_else(|| invalid_argument("query target requires structuredQuery"))?;
            let definition = decode_structured_query(&self.serializer, parent, structured)?;
            return Ok(TargetScope::Query(definition));
        }
        Err(invalid_argument(
            "addTarget must contain documents or query",
        ))
    }

    /// The next wire frame, or `None` once the stream is exhausted.
    pub async fn next_response(&self) -> Option<JsonValue> {
        let mut buffered = self.buffered.lock().await;
        loop {
            if let Some(frame) = buffered.pop_front() {
                return Some(frame);
            }
            let event = self.session.next_event().await?;
            for frame in self.encode_event(event) {
                buffered.push_back(frame);
            }
        }
    }

    /// Synchronous convenience for callers without an async runtime.
    pub fn next_response_blocking(&self) -> Option<JsonValue> {
        futures::executor::block_on(self.next_response())
    }

    /// Drains every frame already delivered, without waiting for more.
    pub fn drain_responses(&self) -> Vec<JsonValue> {
        self.session
            .drain_events()
            .into_iter()
            .flat_map(|event| self.encode_event(event))
            .collect()
    }

    fn encode_event(&self, event: ListenerEvent) -> Vec<JsonValue> {
        match event {
            ListenerEvent::TargetAdded { target_id } => vec![json!({
                "targetChange": {
                    "targetChangeType": "ADD",
                    "targetIds": [target_id],
                }
            })],
            ListenerEvent::Changes {
                target_id,
                changes,
                read_time,
            } => {
                let read_time = self.serializer.encode_timestamp(read_time);
                changes
                    .into_iter()
                    .filter_map(|change| match change.kind {
                        DocumentChangeKind::Added | DocumentChangeKind::Modified => {
                            let document =
                                self.serializer.encode_document(&change.document).ok()?;
                            Some(json!({
                                "documentChange": {
                                    "document": document,
                                    "targetIds": [target_id],
                                }
                            }))
                        }
                        DocumentChangeKind::Removed => {
                            let name = self.serializer.document_name(change.document.key());
                            let still_exists =
                                self.store.get_doc(change.document.key(), None).exists();
                            let frame = if still_exists {
                                // Evicted from the target without being
                                // deleted from the store.
                                json!({
                                    "documentRemove": {
                                        "document": name,
                                        "removedTargetIds": [target_id],
                                        "readTime": read_time,
                                    }
                                })
                            } else {
                                json!({
                                    "documentDelete": {
                                        "document": name,
                                        "removedTargetIds": [target_id],
                                        "readTime": read_time,
                                    }
                                })
                            };
                            Some(frame)
                        }
                    })
                    .collect()
            }
            ListenerEvent::Current {
                target_id,
                read_time,
            } => vec![json!({
                "targetChange": {
                    "targetChangeType": "CURRENT",
                    "targetIds": [target_id],
                    "readTime": self.serializer.encode_timestamp(read_time),
                }
            })],
            ListenerEvent::GlobalSnapshot { read_time } => vec![json!({
                "targetChange": {
                    "targetChangeType": "NO_CHANGE",
                    "targetIds": [],
                    "readTime": self.serializer.encode_timestamp(read_time),
                }
            })],
            ListenerEvent::TargetRemoved { target_id, cause } => {
                let mut change = serde_json::Map::new();
                change.insert("targetChangeType".to_string(), json!("REMOVE"));
                change.insert("targetIds".to_string(), json!([target_id]));
                if let Some(cause) = cause {
                    change.insert(
                        "cause".to_string(),
                        json!({
                            "code": cause.code.grpc_code(),
                            "message": cause.message(),
                        }),
                    );
                }
                vec![json!({ "targetChange": change })]
            }
        }
    }
}
