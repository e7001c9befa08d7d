use std::sync::Arc;

use crate::error::FirestoreError;
use crate::model::Timestamp;
use crate::store::MetaDocument;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

/// One reconciling step between a target's previous ordered result and the
/// new one. `old_index`/`new_index` are positions in the respective
/// orderings; the absent side is `-1`.
#[derive(Clone, Debug)]
pub struct DocumentChange {
    pub kind: DocumentChangeKind,
    pub document: Arc<MetaDocument>,
    pub old_index: i32,
    pub new_index: i32,
}

/// Events a listener stream observes, in delivery order.
#[derive(Clone, Debug)]
pub enum ListenerEvent {
    /// The target was accepted and will start receiving diffs.
    TargetAdded { target_id: i32 },
    /// The minimal change list reconciling the target's previous snapshot
    /// into the new one.
    Changes {
        target_id: i32,
        changes: Vec<DocumentChange>,
        read_time: Timestamp,
    },
    /// The target is consistent as of `read_time`.
    Current { target_id: i32, read_time: Timestamp },
    /// Every active target has caught up; nothing further will arrive below
    /// `read_time`.
    GlobalSnapshot { read_time: Timestamp },
    /// The target stopped receiving diffs, either on request (`cause` is
    /// `None`) or because evaluation failed.
    TargetRemoved {
        target_id: i32,
        cause: Option<FirestoreError>,
    },
}
