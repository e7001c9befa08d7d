use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rand::Rng;

use crate::error::{already_exists, not_found, FirestoreResult};
use crate::model::DatabaseId;
use crate::remote::JsonProtoSerializer;
use crate::store::{DocumentStore, TransactionManager};
use crate::watch::ListenerBroadcaster;

/// Alphabet the backend draws auto-generated document ids from.
const AUTO_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const AUTO_ID_LENGTH: usize = 20;

/// Generates a 20-character document id for `add`-style writes.
pub fn auto_id() -> String {
    let mut rng = rand::thread_rng();
    (0..AUTO_ID_LENGTH)
        .map(|_| AUTO_ID_ALPHABET[rng.gen_range(0..AUTO_ID_ALPHABET.len())] as char)
        .collect()
}

/// One emulated database: the versioned store, its transaction manager, the
/// listener broadcaster and the wire serializer, glued together under a
/// single database id.
pub struct EmulatorDatabase {
    database_id: DatabaseId,
    store: Arc<DocumentStore>,
    transactions: TransactionManager,
    broadcaster: Arc<ListenerBroadcaster>,
    serializer: JsonProtoSerializer,
}

impl std::fmt::Debug for EmulatorDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorDatabase")
            .field("database_id", &self.database_id)
            .finish_non_exhaustive()
    }
}

impl EmulatorDatabase {
    pub fn new(database_id: DatabaseId) -> Arc<Self> {
        let store = DocumentStore::new();
        let broadcaster = ListenerBroadcaster::new(Arc::clone(&store));
        Arc::new(Self {
            serializer: JsonProtoSerializer::new(database_id.clone()),
            transactions: TransactionManager::new(Arc::clone(&store)),
            database_id,
            store,
            broadcaster,
        })
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn broadcaster(&self) -> &Arc<ListenerBroadcaster> {
        &self.broadcaster
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    /// Drops every document and notifies reset listeners. Active listen
    /// streams observe their targets emptying out.
    pub fn reset(&self) {
        log::debug!("resetting database {}", self.database_id.name());
        self.store.clear();
    }
}

static GLOBAL_POOL: Lazy<DatabasePool> = Lazy::new(DatabasePool::new);

/// Process-wide registry of emulator databases keyed by
/// `projects/{project}/databases/{database}`.
pub struct DatabasePool {
    databases: Mutex<HashMap<DatabaseId, Arc<EmulatorDatabase>>>,
}

impl DatabasePool {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static DatabasePool {
        &GLOBAL_POOL
    }

    /// Creates and registers a database, failing when the id is taken.
    pub fn create(&self, database_id: DatabaseId) -> FirestoreResult<Arc<EmulatorDatabase>> {
        let mut databases = self.databases.lock().unwrap();
        if databases.contains_key(&database_id) {
            return Err(already_exists(format!(
                "Database {} is already registered",
                database_id.name()
            )));
        }
        let database = EmulatorDatabase::new(database_id.clone());
        databases.insert(database_id, Arc::clone(&database));
        Ok(database)
    }

    pub fn get(&self, database_id: &DatabaseId) -> FirestoreResult<Arc<EmulatorDatabase>> {
        self.databases
            .lock()
            .unwrap()
            .get(database_id)
            .cloned()
            .ok_or_else(|| not_found(format!("Database {} does not exist", database_id.name())))
    }

    pub fn get_or_create(&self, database_id: &DatabaseId) -> Arc<EmulatorDatabase> {
        let mut databases = self.databases.lock().unwrap();
        databases
            .entry(database_id.clone())
            .or_insert_with(|| EmulatorDatabase::new(database_id.clone()))
            .clone()
    }

    /// Clears the named database's contents in place; handles stay valid.
    pub fn reset(&self, database_id: &DatabaseId) -> FirestoreResult<()> {
        self.get(database_id)?.reset();
        Ok(())
    }

    pub fn remove(&self, database_id: &DatabaseId) {
        self.databases.lock().unwrap().remove(database_id);
    }
}

impl Default for DatabasePool {
    fn default() -> Self {
        Self::new()
    }
}
