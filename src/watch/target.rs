use std::collections::HashMap;
use std::sync::Arc;

use crate::error::FirestoreResult;
use crate::model::{DocumentKey, Timestamp};
use crate::query::{run_query, QueryDefinition};
use crate::store::{CommitRecord, DocumentStore, MetaDocument};
use crate::watch::change::{DocumentChange, DocumentChangeKind};

/// What a listen target watches: a fixed set of document paths, or a query
/// whose membership is recomputed on every commit.
#[derive(Clone, Debug)]
pub enum TargetScope {
    Documents(Vec<DocumentKey>),
    Query(QueryDefinition),
}

/// The batch a target emits for one commit.
#[derive(Clone, Debug)]
pub struct TargetUpdate {
    pub changes: Vec<DocumentChange>,
    pub read_time: Timestamp,
}

/// Per-target listener state: the last ordered result, the version each
/// document was last emitted at, and the consistency counter.
pub struct ListenTarget {
    target_id: i32,
    scope: TargetScope,
    last_versions: HashMap<String, u64>,
    current_order: Vec<Arc<MetaDocument>>,
    consistency_counter: u64,
    last_read_time: Timestamp,
}

impl ListenTarget {
    pub fn new(target_id: i32, scope: TargetScope) -> Self {
        Self {
            target_id,
            scope,
            last_versions: HashMap::new(),
            current_order: Vec::new(),
            consistency_counter: 0,
            last_read_time: Timestamp::new(0, 0),
        }
    }

    pub fn target_id(&self) -> i32 {
        self.target_id
    }

    pub fn scope(&self) -> &TargetScope {
        &self.scope
    }

    pub fn consistency_counter(&self) -> u64 {
        self.consistency_counter
    }

    pub fn last_read_time(&self) -> Timestamp {
        self.last_read_time
    }

    /// First evaluation after subscribe: everything currently matching is
    /// emitted as `added`. Query validation happens here, so a broken query
    /// surfaces as a stream error instead of a registration failure.
    pub fn initialize(
        &mut self,
        store: &DocumentStore,
        read_time: Timestamp,
    ) -> FirestoreResult<TargetUpdate> {
        let new_order = self.evaluate(store, read_time)?;
        Ok(self.reconcile(new_order, read_time))
    }

    /// Folds one commit into this target, returning the change batch to emit,
    /// or `None` when nothing this target cares about moved. Redundant
    /// delivery of an already-seen commit yields `None`, which makes delivery
    /// idempotent per target.
    pub fn apply_commit(
        &mut self,
        store: &DocumentStore,
        record: &CommitRecord,
    ) -> FirestoreResult<Option<TargetUpdate>> {
        let relevant = match &self.scope {
            TargetScope::Documents(keys) => record
                .changes
                .iter()
                .any(|change| keys.iter().any(|key| key == change.key())),
            TargetScope::Query(definition) => record
                .changes
                .iter()
                .any(|change| definition.matches_collection(change.key())),
        };
        if !relevant {
            return Ok(None);
        }

        let new_order = self.evaluate(store, record.server_time)?;
        let update = self.reconcile(new_order, record.server_time);
        if update.changes.is_empty() {
            return Ok(None);
        }
        Ok(Some(update))
    }

    /// Drops all state, as after a store reset: the next evaluation starts
    /// from an empty snapshot.
    pub fn reset(&mut self) -> TargetUpdate {
        self.reconcile(Vec::new(), Timestamp::new(0, 0))
    }

    fn evaluate(
        &self,
        store: &DocumentStore,
        read_time: Timestamp,
    ) -> FirestoreResult<Vec<Arc<MetaDocument>>> {
        match &self.scope {
            TargetScope::Documents(keys) => Ok(keys
                .iter()
                .map(|key| store.get_doc(key, Some(read_time)))
                .filter(|doc| doc.exists())
                .collect()),
            TargetScope::Query(definition) => {
                let snapshot = store.existing_documents(Some(read_time));
                let results = run_query(snapshot, definition)?;
                Ok(results.into_iter().map(|result| result.document).collect())
            }
        }
    }

    fn reconcile(&mut self, new_order: Vec<Arc<MetaDocument>>, read_time: Timestamp) -> TargetUpdate {
        let changes = diff_ordered_results(&self.current_order, &new_order, &self.last_versions);

        self.last_versions = new_order
            .iter()
            .map(|doc| (doc.path(), doc.version()))
            .collect();
        self.current_order = new_order;
        if !changes.is_empty() {
            self.consistency_counter += 1;
            self.last_read_time = read_time;
        }

        TargetUpdate { changes, read_time }
    }
}

/// Pure reconciliation between two ordered result sets. A document present in
/// both orders is re-emitted only when its version strictly exceeds the
/// version in `last_versions`, so replaying the same state produces no
/// changes. Removals are listed first in old-order positions, then additions
/// and modifications in new-order positions.
pub fn diff_ordered_results(
    old_order: &[Arc<MetaDocument>],
    new_order: &[Arc<MetaDocument>],
    last_versions: &HashMap<String, u64>,
) -> Vec<DocumentChange> {
    let old_positions: HashMap<String, i32> = old_order
        .iter()
        .enumerate()
        .map(|(index, doc)| (doc.path(), index as i32))
        .collect();
    let new_positions: HashMap<String, i32> = new_order
        .iter()
        .enumerate()
        .map(|(index, doc)| (doc.path(), index as i32))
        .collect();

    let mut changes = Vec::new();

    for (old_index, doc) in old_order.iter().enumerate() {
        if !new_positions.contains_key(&doc.path()) {
            changes.push(DocumentChange {
                kind: DocumentChangeKind::Removed,
                document: Arc::clone(doc),
                old_index: old_index as i32,
                new_index: -1,
            });
        }
    }

    for (new_index, doc) in new_order.iter().enumerate() {
        let path = doc.path();
        match old_positions.get(&path) {
            None => changes.push(DocumentChange {
                kind: DocumentChangeKind::Added,
                document: Arc::clone(doc),
                old_index: -1,
                new_index: new_index as i32,
            }),
            Some(old_index) => {
                let last_version = last_versions.get(&path).copied().unwrap_or(0);
                if doc.version() > last_version {
                    changes.push(DocumentChange {
                        kind: DocumentChangeKind::Modified,
                        document: Arc::clone(doc),
                        old_index: *old_index,
                        new_index: new_index as i32,
                    });
                }
            }
        }
    }

    changes
}
