use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::RngCore;

use crate::error::{aborted, failed_precondition, invalid_argument, not_found, FirestoreResult};
use crate::model::{DocumentKey, Timestamp};
use crate::store::accessor::{CommitMode, CommitResponse, DocumentStore};
use crate::store::write::WriteOperation;
use crate::store::MetaDocument;

/// Options accepted by `BeginTransaction`. Exactly one of the two modes must
/// be chosen; a `retry_transaction` token, when present, must be non-empty.
#[derive(Clone, Debug)]
pub enum TransactionOptions {
    ReadOnly { read_time: Option<Timestamp> },
    ReadWrite { retry_transaction: Option<Bytes> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    /// Reads are pinned at the given snapshot time for the whole attempt.
    ReadOnly(Timestamp),
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// One transaction attempt. Read-write attempts record the version of every
/// document they observe; the conflict check replays those versions at commit
/// time.
#[derive(Debug)]
pub struct Transaction {
    id: Bytes,
    mode: TransactionMode,
    reads: Mutex<HashMap<String, u64>>,
    status: Mutex<TransactionStatus>,
}

impl Transaction {
    fn new(id: Bytes, mode: TransactionMode) -> Self {
        Self {
            id,
            mode,
            reads: Mutex::new(HashMap::new()),
            status: Mutex::new(TransactionStatus::Active),
        }
    }

    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.mode, TransactionMode::ReadOnly(_))
    }

    fn record_read(&self, doc: &MetaDocument) {
        self.reads
            .lock()
            .unwrap()
            .insert(doc.path(), doc.version());
    }

    fn ensure_active(&self) -> FirestoreResult<()> {
        match self.status() {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Committed => Err(failed_precondition(
                "Transaction has already been committed",
            )),
            TransactionStatus::Aborted => {
                Err(failed_precondition("Transaction has already been aborted"))
            }
        }
    }
}

/// Hands out transaction handles and performs the optimistic conflict check
/// at commit time. Transactions hold no locks; arbitrarily long user logic
/// between reads and commit never blocks other writers.
pub struct TransactionManager {
    store: Arc<DocumentStore>,
    active: Mutex<HashMap<Bytes, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, options: TransactionOptions) -> FirestoreResult<Arc<Transaction>> {
        let mode = match options {
            TransactionOptions::ReadOnly { read_time } => {
                TransactionMode::ReadOnly(read_time.unwrap_or_else(|| self.store.last_commit_time()))
            }
            TransactionOptions::ReadWrite { retry_transaction } => {
                if let Some(token) = retry_transaction {
                    if token.is_empty() {
                        return Err(invalid_argument(
                            "retry_transaction must not be empty when present",
                        ));
                    }
                    // The retried attempt starts from scratch; the stale token
                    // only proves the caller is re-running a failed body.
                    self.active.lock().unwrap().remove(&token);
                }
                TransactionMode::ReadWrite
            }
        };

        let id = new_transaction_id();
        let transaction = Arc::new(Transaction::new(id.clone(), mode));
        self.active
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&transaction));
        Ok(transaction)
    }

    pub fn fetch(&self, id: &Bytes) -> FirestoreResult<Arc<Transaction>> {
        self.active
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("Transaction not found or already terminated"))
    }

    /// Reads a document inside a transaction, registering it in the read set
    /// of read-write attempts.
    pub fn get_doc(
        &self,
        transaction: &Transaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Arc<MetaDocument>> {
        transaction.ensure_active()?;
        match transaction.mode() {
            TransactionMode::ReadOnly(read_time) => Ok(self.store.get_doc(key, Some(read_time))),
            TransactionMode::ReadWrite => {
                let doc = self.store.get_doc(key, None);
                transaction.record_read(&doc);
                Ok(doc)
            }
        }
    }

    /// Registers query results in the transaction's read set so a conflicting
    /// write to any returned document aborts the commit.
    pub fn record_query_reads(&self, transaction: &Transaction, docs: &[Arc<MetaDocument>]) {
        if transaction.is_read_only() {
            return;
        }
        for doc in docs {
            transaction.record_read(doc);
        }
    }

    pub fn commit(
        &self,
        transaction: &Transaction,
        writes: &[WriteOperation],
    ) -> FirestoreResult<CommitResponse> {
        transaction.ensure_active()?;
        if transaction.is_read_only() && !writes.is_empty() {
            return Err(invalid_argument(
                "Read-only transactions cannot contain writes",
            ));
        }

        {
            let reads = transaction.reads.lock().unwrap();
            for (path, observed_version) in reads.iter() {
                let key = DocumentKey::from_string(path)?;
                let current = self.store.get_doc(&key, None);
                if current.version() != *observed_version {
                    *transaction.status.lock().unwrap() = TransactionStatus::Aborted;
                    self.active.lock().unwrap().remove(&transaction.id);
                    log::debug!(
                        "transaction aborted: {path} moved from version {observed_version} to {}",
                        current.version()
                    );
                    return Err(aborted(format!(
                        "Transaction aborted due to a concurrent modification of {path}"
                    )));
                }
            }
        }

        let response = self.store.commit(writes, CommitMode::Atomic)?;
        *transaction.status.lock().unwrap() = TransactionStatus::Committed;
        self.active.lock().unwrap().remove(&transaction.id);
        Ok(response)
    }

    pub fn rollback(&self, transaction: &Transaction) -> FirestoreResult<()> {
        *transaction.status.lock().unwrap() = TransactionStatus::Aborted;
        self.active.lock().unwrap().remove(&transaction.id);
        Ok(())
    }
}

fn new_transaction_id() -> Bytes {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    Bytes::copy_from_slice(&id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write::Precondition;
    use crate::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn set_write(path: &str, n: i64) -> WriteOperation {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(n));
        WriteOperation::Set {
            key: DocumentKey::from_string(path).unwrap(),
            data: MapValue::new(fields),
            mask: None,
            transforms: Vec::new(),
            precondition: Precondition::None,
        }
    }

    fn doc_value(store: &DocumentStore, path: &str) -> i64 {
        let doc = store.get_doc(&DocumentKey::from_string(path).unwrap(), None);
        match doc.data().unwrap().fields().get("n").unwrap().kind() {
            crate::value::ValueKind::Integer(n) => *n,
            _ => panic!("expected integer"),
        }
    }

    #[test]
    fn read_write_commit_succeeds_without_conflict() {
        let store = DocumentStore::new();
        store
            .commit(&[set_write("counters/c", 1)], CommitMode::Atomic)
            .unwrap();
        let manager = TransactionManager::new(Arc::clone(&store));

        let txn = manager
            .begin(TransactionOptions::ReadWrite {
                retry_transaction: None,
            })
            .unwrap();
        let key = DocumentKey::from_string("counters/c").unwrap();
        manager.get_doc(&txn, &key).unwrap();
        manager.commit(&txn, &[set_write("counters/c", 2)]).unwrap();
        assert_eq!(doc_value(&store, "counters/c"), 2);
        assert_eq!(txn.status(), TransactionStatus::Committed);
    }

    #[test]
    fn concurrent_modification_aborts_commit() {
        let store = DocumentStore::new();
        store
            .commit(&[set_write("counters/c", 1)], CommitMode::Atomic)
            .unwrap();
        let manager = TransactionManager::new(Arc::clone(&store));

        let txn = manager
            .begin(TransactionOptions::ReadWrite {
                retry_transaction: None,
            })
            .unwrap();
        let key = DocumentKey::from_string("counters/c").unwrap();
        manager.get_doc(&txn, &key).unwrap();

        // An external writer lands between the read and the commit.
        store
            .commit(&[set_write("counters/c", 100)], CommitMode::Atomic)
            .unwrap();

        let err = manager
            .commit(&txn, &[set_write("counters/c", 2)])
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/aborted");
        assert_eq!(doc_value(&store, "counters/c"), 100);
    }

    #[test]
    fn retry_loop_applies_on_fresh_attempt() {
        let store = DocumentStore::new();
        store
            .commit(&[set_write("counters/c", 5)], CommitMode::Atomic)
            .unwrap();
        let manager = TransactionManager::new(Arc::clone(&store));
        let key = DocumentKey::from_string("counters/c").unwrap();

        // Attempt 1 reads, an external actor increments by 100, commit aborts.
        let attempt1 = manager
            .begin(TransactionOptions::ReadWrite {
                retry_transaction: None,
            })
            .unwrap();
        let read = manager.get_doc(&attempt1, &key).unwrap();
        let base = match read.data().unwrap().fields().get("n").unwrap().kind() {
            crate::value::ValueKind::Integer(n) => *n,
            _ => panic!("expected integer"),
        };
        store
            .commit(&[set_write("counters/c", base + 100)], CommitMode::Atomic)
            .unwrap();
        let err = manager
            .commit(&attempt1, &[set_write("counters/c", base + 1)])
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/aborted");

        // Attempt 2 re-runs the body against fresh state and succeeds.
        let attempt2 = manager
            .begin(TransactionOptions::ReadWrite {
                retry_transaction: Some(attempt1.id().clone()),
            })
            .unwrap();
        let read = manager.get_doc(&attempt2, &key).unwrap();
        let base = match read.data().unwrap().fields().get("n").unwrap().kind() {
            crate::value::ValueKind::Integer(n) => *n,
            _ => panic!("expected integer"),
        };
        manager
            .commit(&attempt2, &[set_write("counters/c", base + 1)])
            .unwrap();

        assert_eq!(doc_value(&store, "counters/c"), 5 + 100 + 1);
    }

    #[test]
    fn read_only_transactions_pin_their_snapshot() {
        let store = DocumentStore::new();
        store
            .commit(&[set_write("counters/c", 1)], CommitMode::Atomic)
            .unwrap();
        let manager = TransactionManager::new(Arc::clone(&store));

        let txn = manager
            .begin(TransactionOptions::ReadOnly { read_time: None })
            .unwrap();
        store
            .commit(&[set_write("counters/c", 2)], CommitMode::Atomic)
            .unwrap();

        let key = DocumentKey::from_string("counters/c").unwrap();
        let doc = manager.get_doc(&txn, &key).unwrap();
        match doc.data().unwrap().fields().get("n").unwrap().kind() {
            crate::value::ValueKind::Integer(n) => assert_eq!(*n, 1),
            _ => panic!("expected integer"),
        }
    }

    #[test]
    fn read_only_transactions_reject_writes() {
        let store = DocumentStore::new();
        let manager = TransactionManager::new(Arc::clone(&store));
        let txn = manager
            .begin(TransactionOptions::ReadOnly { read_time: None })
            .unwrap();
        let err = manager
            .commit(&txn, &[set_write("counters/c", 1)])
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn empty_retry_token_is_rejected() {
        let store = DocumentStore::new();
        let manager = TransactionManager::new(store);
        let err = manager
            .begin(TransactionOptions::ReadWrite {
                retry_transaction: Some(Bytes::new()),
            })
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn fetch_unknown_transaction_is_not_found() {
        let store = DocumentStore::new();
        let manager = TransactionManager::new(store);
        let err = manager.fetch(&Bytes::from_static(b"nope")).unwrap_err();
        assert_eq!(err.code_str(), "firestore/not-found");
    }
}
