use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{DocumentKey, Timestamp};
use crate::store::write::{apply_write, WriteOperation};
use crate::store::MetaDocument;
use crate::value::{validate_document, FirestoreValue};

/// How precondition failures inside one batch are reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitMode {
    /// Transactional commit: the first failure rejects the whole batch and
    /// the store stays untouched.
    Atomic,
    /// Batch-write mode: failures are recorded per write and the remaining
    /// writes still apply.
    BatchWrite,
}

/// Per-write outcome of a commit.
#[derive(Clone, Debug)]
pub struct WriteResult {
    pub update_time: Option<Timestamp>,
    pub transform_results: Vec<FirestoreValue>,
    /// `None` for a successful write; batch-write mode records the failure
    /// here instead of rejecting the batch.
    pub status: Option<FirestoreError>,
}

#[derive(Clone, Debug)]
pub struct CommitResponse {
    pub commit_time: Timestamp,
    pub write_results: Vec<WriteResult>,
}

/// Everything a change watcher learns about one commit: the commit's server
/// time and the final state of every document the batch touched.
#[derive(Clone, Debug)]
pub struct CommitRecord {
    pub server_time: Timestamp,
    pub changes: Vec<Arc<MetaDocument>>,
}

pub type ChangeWatcher = Arc<dyn Fn(&CommitRecord) + Send + Sync>;
pub type ResetListener = Arc<dyn Fn() + Send + Sync>;

struct StoreState {
    documents: BTreeMap<String, Arc<MetaDocument>>,
    next_version: u64,
    last_commit_time: Timestamp,
}

impl StoreState {
    fn new() -> Self {
        Self {
            documents: BTreeMap::new(),
            next_version: 1,
            last_commit_time: Timestamp::new(0, 0),
        }
    }
}

/// The authoritative versioned document store.
///
/// Commits apply one at a time under the state lock; watcher notification
/// happens in commit order under a dedicated notify lock that is acquired
/// before the state lock is released, so no two commits can swap their
/// delivery order. Reads never block commits for longer than the state
/// mutation itself.
pub struct DocumentStore {
    state: Mutex<StoreState>,
    notify: Mutex<()>,
    watchers: Mutex<Vec<(u64, ChangeWatcher)>>,
    reset_listeners: Mutex<Vec<(u64, ResetListener)>>,
    subscription_counter: AtomicU64,
}

impl DocumentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StoreState::new()),
            notify: Mutex::new(()),
            watchers: Mutex::new(Vec::new()),
            reset_listeners: Mutex::new(Vec::new()),
            subscription_counter: AtomicU64::new(1),
        })
    }

    /// Point read. With `at_time` the read is served from the document's
    /// version chain as of that commit boundary; otherwise the latest state
    /// is returned. Never blocks behind user logic.
    pub fn get_doc(&self, key: &DocumentKey, at_time: Option<Timestamp>) -> Arc<MetaDocument> {
        let state = self.state.lock().unwrap();
        let latest = state.documents.get(&key.path().canonical_string()).cloned();
        drop(state);

        match (latest, at_time) {
            (Some(doc), None) => doc,
            (Some(doc), Some(at)) => doc
                .state_as_of(at)
                .filter(|state| state.exists())
                .unwrap_or_else(|| Arc::new(MetaDocument::missing(key.clone()))),
            (None, _) => Arc::new(MetaDocument::missing(key.clone())),
        }
    }

    /// All documents that exist at the given snapshot (latest when `None`).
    pub fn existing_documents(&self, at_time: Option<Timestamp>) -> Vec<Arc<MetaDocument>> {
        let state = self.state.lock().unwrap();
        let latest: Vec<Arc<MetaDocument>> = state.documents.values().cloned().collect();
        drop(state);

        latest
            .into_iter()
            .filter_map(|doc| match at_time {
                None => Some(doc).filter(|d| d.exists()),
                Some(at) => doc.state_as_of(at).filter(|state| state.exists()),
            })
            .collect()
    }

    pub fn last_commit_time(&self) -> Timestamp {
        self.state.lock().unwrap().last_commit_time
    }

    /// Applies a batch of writes. All writes share one commit time; each
    /// write's precondition is checked against the state the batch has built
    /// up so far (identical to the pre-batch state unless the batch repeats a
    /// path).
    pub fn commit(
        &self,
        writes: &[WriteOperation],
        mode: CommitMode,
    ) -> FirestoreResult<CommitResponse> {
        // One commit at a time, held through watcher notification, so every
        // watcher observes commits in exactly the order they applied.
        let notify_guard = self.notify.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        let commit_time = next_commit_time(state.last_commit_time);
        let mut scratch: BTreeMap<String, Arc<MetaDocument>> = BTreeMap::new();
        let mut scratch_version = state.next_version;
        let mut write_results = Vec::with_capacity(writes.len());
        let mut touched_paths = Vec::new();

        for write in writes {
            let path = write.key().path().canonical_string();
            let current = scratch
                .get(&path)
                .cloned()
                .or_else(|| state.documents.get(&path).cloned())
                .unwrap_or_else(|| Arc::new(MetaDocument::missing(write.key().clone())));

            let applied = write
                .precondition()
                .check(&current)
                .and_then(|()| apply_write(write, &current, commit_time));

            match applied {
                Ok((data, transform_results)) => {
                    if data.is_none() && !current.exists() {
                        // Deleting a document that does not exist is a no-op
                        // and must not advance its version.
                        write_results.push(WriteResult {
                            update_time: None,
                            transform_results,
                            status: None,
                        });
                        continue;
                    }

                    if let Some(fields) = data.as_ref() {
                        if let Err(err) = validate_document(fields) {
                            match mode {
                                CommitMode::Atomic => return Err(err),
                                CommitMode::BatchWrite => {
                                    write_results.push(WriteResult {
                                        update_time: None,
                                        transform_results: Vec::new(),
                                        status: Some(err),
                                    });
                                    continue;
                                }
                            }
                        }
                    }

                    let exists_after = data.is_some();
                    let create_time = if exists_after {
                        if current.exists() {
                            current.create_time()
                        } else {
                            Some(commit_time)
                        }
                    } else {
                        None
                    };
                    let previous = if current.version() > 0 {
                        Some(Arc::clone(&current))
                    } else {
                        None
                    };
                    let next = Arc::new(MetaDocument::new_state(
                        write.key().clone(),
                        data,
                        scratch_version,
                        create_time,
                        commit_time,
                        previous,
                    ));
                    scratch_version += 1;
                    touched_paths.push(path.clone());
                    scratch.insert(path, next);

                    write_results.push(WriteResult {
                        update_time: exists_after.then_some(commit_time),
                        transform_results,
                        status: None,
                    });
                }
                Err(err) => match mode {
                    CommitMode::Atomic => return Err(err),
                    CommitMode::BatchWrite => {
                        write_results.push(WriteResult {
                            update_time: None,
                            transform_results: Vec::new(),
                            status: Some(err),
                        });
                    }
                },
            }
        }

        // Deduplicate while keeping first-touch order; each path reports its
        // final state for this commit.
        let mut changes = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for path in &touched_paths {
            if seen.insert(path.clone()) {
                changes.push(Arc::clone(&scratch[path]));
            }
        }

        for (path, doc) in scratch {
            state.documents.insert(path, doc);
        }
        state.next_version = scratch_version;
        if !changes.is_empty() {
            state.last_commit_time = commit_time;
        }

        let record = CommitRecord {
            server_time: commit_time,
            changes,
        };
        drop(state);

        if !record.changes.is_empty() {
            log::debug!(
                "commit applied at {}.{:06}: {} document(s) changed",
                record.server_time.seconds,
                record.server_time.nanos / 1_000,
                record.changes.len()
            );
            let watchers: Vec<ChangeWatcher> = self
                .watchers
                .lock()
                .unwrap()
                .iter()
                .map(|(_, watcher)| Arc::clone(watcher))
                .collect();
            for watcher in watchers {
                watcher(&record);
            }
        }
        drop(notify_guard);

        Ok(CommitResponse {
            commit_time,
            write_results,
        })
    }

    /// Registers a callback invoked once per commit with the commit's full
    /// change set. Returns an id for [`DocumentStore::unregister_change_watcher`].
    pub fn register_change_watcher(&self, watcher: ChangeWatcher) -> u64 {
        let id = self.subscription_counter.fetch_add(1, Ordering::SeqCst);
        self.watchers.lock().unwrap().push((id, watcher));
        id
    }

    pub fn unregister_change_watcher(&self, id: u64) {
        self.watchers.lock().unwrap().retain(|(i, _)| *i != id);
    }

    /// Registers a callback invoked when the store is cleared.
    pub fn register_reset_listener(&self, listener: ResetListener) -> u64 {
        let id = self.subscription_counter.fetch_add(1, Ordering::SeqCst);
        self.reset_listeners.lock().unwrap().push((id, listener));
        id
    }

    pub fn unregister_reset_listener(&self, id: u64) {
        self.reset_listeners.lock().unwrap().retain(|(i, _)| *i != id);
    }

    /// Drops all documents and rewinds the logical clock, then informs reset
    /// listeners so dependent state can re-initialize.
    pub fn clear(&self) {
        let notify_guard = self.notify.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        *state = StoreState::new();
        drop(state);

        log::debug!("document store cleared");
        let listeners: Vec<ResetListener> = self
            .reset_listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener();
        }
        drop(notify_guard);
    }
}

/// Commit times carry microsecond granularity and must be strictly
/// increasing even when the wall clock stalls or steps backwards.
fn next_commit_time(last: Timestamp) -> Timestamp {
    let now = Timestamp::now().truncated_to_micros();
    if now > last {
        now
    } else {
        last.next_micro()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write::{Precondition, SetOptions};
    use crate::store::{encode_set_data, encode_update_data};
    use crate::value::MapValue;
    use std::collections::BTreeMap;

    fn set_write(path: &str, fields: BTreeMap<String, FirestoreValue>) -> WriteOperation {
        WriteOperation::Set {
            key: DocumentKey::from_string(path).unwrap(),
            data: MapValue::new(fields),
            mask: None,
            transforms: Vec::new(),
            precondition: Precondition::None,
        }
    }

    fn int_fields(entries: &[(&str, i64)]) -> BTreeMap<String, FirestoreValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), FirestoreValue::from_integer(*v)))
            .collect()
    }

    #[test]
    fn versions_increase_strictly_per_document() {
        let store = DocumentStore::new();
        store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 1)]))], CommitMode::Atomic)
            .unwrap();
        let v1 = store
            .get_doc(&DocumentKey::from_string("cities/sf").unwrap(), None)
            .version();
        store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 2)]))], CommitMode::Atomic)
            .unwrap();
        let v2 = store
            .get_doc(&DocumentKey::from_string("cities/sf").unwrap(), None)
            .version();
        assert!(v2 > v1);
    }

    #[test]
    fn update_time_equals_commit_time() {
        let store = DocumentStore::new();
        let response = store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 1)]))], CommitMode::Atomic)
            .unwrap();
        let doc = store.get_doc(&DocumentKey::from_string("cities/sf").unwrap(), None);
        assert_eq!(doc.update_time(), Some(response.commit_time));
        assert_eq!(doc.server_time(), response.commit_time);
    }

    #[test]
    fn deleting_missing_document_is_idempotent() {
        let store = DocumentStore::new();
        let key = DocumentKey::from_string("cities/sf").unwrap();
        let delete = WriteOperation::Delete {
            key: key.clone(),
            precondition: Precondition::None,
        };
        let response = store.commit(&[delete.clone()], CommitMode::Atomic).unwrap();
        assert!(response.write_results[0].status.is_none());
        assert_eq!(store.get_doc(&key, None).version(), 0);

        store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 1)]))], CommitMode::Atomic)
            .unwrap();
        store.commit(&[delete.clone()], CommitMode::Atomic).unwrap();
        let tombstone_version = store.get_doc(&key, None).version();
        store.commit(&[delete], CommitMode::Atomic).unwrap();
        assert_eq!(store.get_doc(&key, None).version(), tombstone_version);
    }

    #[test]
    fn atomic_precondition_failure_leaves_store_untouched() {
        let store = DocumentStore::new();
        store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 1)]))], CommitMode::Atomic)
            .unwrap();
        let before = store.get_doc(&DocumentKey::from_string("cities/sf").unwrap(), None);

        let failing = WriteOperation::Update {
            key: DocumentKey::from_string("cities/la").unwrap(),
            data: MapValue::empty(),
            field_paths: Vec::new(),
            transforms: Vec::new(),
            precondition: Precondition::Exists(true),
        };
        let err = store
            .commit(
                &[set_write("cities/sf", int_fields(&[("n", 99)])), failing],
                CommitMode::Atomic,
            )
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/not-found");

        let after = store.get_doc(&DocumentKey::from_string("cities/sf").unwrap(), None);
        assert_eq!(after.version(), before.version());
        assert_eq!(after.data(), before.data());
    }

    #[test]
    fn batch_write_records_per_write_status() {
        let store = DocumentStore::new();
        let failing = WriteOperation::Update {
            key: DocumentKey::from_string("cities/la").unwrap(),
            data: MapValue::empty(),
            field_paths: Vec::new(),
            transforms: Vec::new(),
            precondition: Precondition::Exists(true),
        };
        let response = store
            .commit(
                &[failing, set_write("cities/sf", int_fields(&[("n", 1)]))],
                CommitMode::BatchWrite,
            )
            .unwrap();
        assert_eq!(
            response.write_results[0].status.as_ref().unwrap().code_str(),
            "firestore/not-found"
        );
        assert!(response.write_results[1].status.is_none());
        assert!(store
            .get_doc(&DocumentKey::from_string("cities/sf").unwrap(), None)
            .exists());
    }

    #[test]
    fn duplicate_paths_apply_last_write_wins() {
        let store = DocumentStore::new();
        store
            .commit(
                &[
                    set_write("cities/sf", int_fields(&[("n", 1)])),
                    set_write("cities/sf", int_fields(&[("n", 2)])),
                ],
                CommitMode::BatchWrite,
            )
            .unwrap();
        let doc = store.get_doc(&DocumentKey::from_string("cities/sf").unwrap(), None);
        assert_eq!(
            doc.data().unwrap().fields().get("n"),
            Some(&FirestoreValue::from_integer(2))
        );
    }

    #[test]
    fn point_reads_at_time_see_historic_state() {
        let store = DocumentStore::new();
        let key = DocumentKey::from_string("cities/sf").unwrap();
        let first = store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 1)]))], CommitMode::Atomic)
            .unwrap();
        store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 2)]))], CommitMode::Atomic)
            .unwrap();

        let historic = store.get_doc(&key, Some(first.commit_time));
        assert_eq!(
            historic.data().unwrap().fields().get("n"),
            Some(&FirestoreValue::from_integer(1))
        );
        let latest = store.get_doc(&key, None);
        assert_eq!(
            latest.data().unwrap().fields().get("n"),
            Some(&FirestoreValue::from_integer(2))
        );
    }

    #[test]
    fn watcher_sees_commit_record_once() {
        let store = DocumentStore::new();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let id = store.register_change_watcher(Arc::new(move |record: &CommitRecord| {
            seen_clone.lock().unwrap().push(record.changes.len());
        }));

        store
            .commit(
                &[
                    set_write("cities/sf", int_fields(&[("n", 1)])),
                    set_write("cities/la", int_fields(&[("n", 2)])),
                ],
                CommitMode::Atomic,
            )
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[2]);

        store.unregister_change_watcher(id);
        store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 3)]))], CommitMode::Atomic)
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn reset_listener_fires_on_clear() {
        let store = DocumentStore::new();
        let fired = Arc::new(Mutex::new(0));
        let fired_clone = Arc::clone(&fired);
        store.register_reset_listener(Arc::new(move || {
            *fired_clone.lock().unwrap() += 1;
        }));
        store
            .commit(&[set_write("cities/sf", int_fields(&[("n", 1)]))], CommitMode::Atomic)
            .unwrap();
        store.clear();
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(!store
            .get_doc(&DocumentKey::from_string("cities/sf").unwrap(), None)
            .exists());
    }

    #[test]
    fn set_then_update_then_merge_pipeline() {
        let store = DocumentStore::new();
        let key = DocumentKey::from_string("users/ada").unwrap();

        let mut first = BTreeMap::new();
        first.insert("name".to_string(), FirestoreValue::from_string("Ada"));
        first.insert("age".to_string(), FirestoreValue::from_integer(36));
        store
            .commit(&[set_write("users/ada", first)], CommitMode::Atomic)
            .unwrap();

        let mut update = BTreeMap::new();
        update.insert("age".to_string(), FirestoreValue::from_integer(37));
        let encoded = encode_update_data(update).unwrap();
        store
            .commit(
                &[WriteOperation::Update {
                    key: key.clone(),
                    data: encoded.map,
                    field_paths: encoded.field_paths,
                    transforms: encoded.transforms,
                    precondition: Precondition::Exists(true),
                }],
                CommitMode::Atomic,
            )
            .unwrap();

        let mut merge = BTreeMap::new();
        merge.insert("city".to_string(), FirestoreValue::from_string("London"));
        let encoded = encode_set_data(merge, &SetOptions::merge_all()).unwrap();
        store
            .commit(
                &[WriteOperation::Set {
                    key: key.clone(),
                    data: encoded.map,
                    mask: encoded.mask,
                    transforms: encoded.transforms,
                    precondition: Precondition::None,
                }],
                CommitMode::Atomic,
            )
            .unwrap();

        let doc = store.get_doc(&key, None);
        let fields = doc.data().unwrap().fields();
        assert_eq!(fields.get("name"), Some(&FirestoreValue::from_string("Ada")));
        assert_eq!(fields.get("age"), Some(&FirestoreValue::from_integer(37)));
        assert_eq!(
            fields.get("city"),
            Some(&FirestoreValue::from_string("London"))
        );
    }
}
