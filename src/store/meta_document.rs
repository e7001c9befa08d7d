use std::sync::Arc;

use crate::model::{DocumentKey, FieldPath, Timestamp};
use crate::value::{FirestoreValue, MapValue, ValueKind};

/// One versioned state of a document. Every mutation produces a fresh
/// `MetaDocument` whose `previous` link points at the state it replaced, so
/// listeners can diff against what they last observed.
#[derive(Clone, Debug)]
pub struct MetaDocument {
    key: DocumentKey,
    data: Option<MapValue>,
    version: u64,
    create_time: Option<Timestamp>,
    update_time: Option<Timestamp>,
    server_time: Timestamp,
    previous: Option<Arc<MetaDocument>>,
}

impl MetaDocument {
    /// Placeholder for a document that has never been written.
    pub fn missing(key: DocumentKey) -> Self {
        Self {
            key,
            data: None,
            version: 0,
            create_time: None,
            update_time: None,
            server_time: Timestamp::new(0, 0),
            previous: None,
        }
    }

    pub(crate) fn new_state(
        key: DocumentKey,
        data: Option<MapValue>,
        version: u64,
        create_time: Option<Timestamp>,
        server_time: Timestamp,
        previous: Option<Arc<MetaDocument>>,
    ) -> Self {
        let update_time = data.as_ref().map(|_| server_time);
        Self {
            key,
            data,
            version,
            create_time,
            update_time,
            server_time,
            previous,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn path(&self) -> String {
        self.key.path().canonical_string()
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&MapValue> {
        self.data.as_ref()
    }

    /// Monotonic per-document version; bumps on every state change including
    /// deletion.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn create_time(&self) -> Option<Timestamp> {
        self.create_time
    }

    pub fn update_time(&self) -> Option<Timestamp> {
        self.update_time
    }

    /// Commit time of the batch that produced this state.
    pub fn server_time(&self) -> Timestamp {
        self.server_time
    }

    pub fn previous(&self) -> Option<&Arc<MetaDocument>> {
        self.previous.as_ref()
    }

    /// Resolves the value stored at `field`, or `None` when any segment is
    /// missing or traverses a non-map.
    pub fn field(&self, field: &FieldPath) -> Option<&FirestoreValue> {
        let mut fields = self.data.as_ref()?.fields();
        let (last, parents) = field.segments().split_last()?;
        for segment in parents {
            match fields.get(segment)?.kind() {
                ValueKind::Map(map) => fields = map.fields(),
                _ => return None,
            }
        }
        fields.get(last)
    }

    /// The newest state in this document's history with a server time at or
    /// before `at`, if any.
    pub fn state_as_of(self: &Arc<Self>, at: Timestamp) -> Option<Arc<MetaDocument>> {
        let mut cursor = Some(self);
        while let Some(state) = cursor {
            if state.version > 0 && state.server_time <= at {
                return Some(Arc::clone(state));
            }
            cursor = state.previous.as_ref();
        }
        None
    }
}
