use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::FirestoreResult;
use crate::model::ResourcePath;

static GLOBAL_CACHE: Lazy<PathCache> = Lazy::new(PathCache::new);

/// Interns parsed paths so repeated lookups of the same raw string (and
/// repeated `parent()` calls) hand out the same shared entry.
pub struct PathCache {
    entries: Mutex<HashMap<String, Arc<ResourcePath>>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide cache used by the emulator engine.
    pub fn global() -> &'static PathCache {
        &GLOBAL_CACHE
    }

    /// Parses `raw`, returning the cached entry when one exists. Entries are
    /// immutable and shared; two calls with the same raw string return the
    /// same `Arc`.
    pub fn resolve(&self, raw: &str) -> FirestoreResult<Arc<ResourcePath>> {
        if let Some(entry) = self.entries.lock().unwrap().get(raw) {
            return Ok(Arc::clone(entry));
        }
        let parsed = ResourcePath::from_string(raw)?;
        Ok(self.intern(parsed))
    }

    /// Returns the cached parent of `path`. The root's parent is the root
    /// itself, so walking up terminates at a stable fixed point.
    pub fn parent(&self, path: &ResourcePath) -> Arc<ResourcePath> {
        self.intern(path.parent())
    }

    pub fn intern(&self, path: ResourcePath) -> Arc<ResourcePath> {
        let mut entries = self.entries.lock().unwrap();
        let canonical = path.canonical_string();
        if let Some(entry) = entries.get(&canonical) {
            return Arc::clone(entry);
        }
        let entry = Arc::new(path);
        entries.insert(canonical, Arc::clone(&entry));
        entry
    }
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new()
    }
}
