mod broadcaster;
mod change;
mod target;

pub use broadcaster::{ListenSession, ListenerBroadcaster};
pub use change::{DocumentChange, DocumentChangeKind, ListenerEvent};
pub use target::{diff_ordered_results, ListenTarget, TargetScope, TargetUpdate};
