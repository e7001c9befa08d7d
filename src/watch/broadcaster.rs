use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{already_exists, invalid_argument};
use crate::model::Timestamp;
use crate::store::{CommitRecord, DocumentStore};
use crate::watch::change::ListenerEvent;
use crate::watch::target::{ListenTarget, TargetScope, TargetUpdate};

/// Whether a stream assigns its own target ids or lets the server pick them.
/// The first `add_target` on a stream fixes the convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IdMode {
    ServerAssigned,
    ClientProvided,
}

struct SessionState {
    sender: async_channel::Sender<ListenerEvent>,
    targets: Vec<ListenTarget>,
    id_mode: Option<IdMode>,
    next_server_id: i32,
}

impl SessionState {
    fn send(&self, event: ListenerEvent) {
        // The channel is unbounded; a send only fails once the receiving
        // session is gone, in which case the event is moot anyway.
        let _ = self.sender.try_send(event);
    }
}

/// Fans every store commit out to the active listen targets, translating raw
/// change sets into per-target diffs, consistency signals and the global
/// watermark.
pub struct ListenerBroadcaster {
    store: Arc<DocumentStore>,
    sessions: Mutex<HashMap<u64, SessionState>>,
    session_counter: AtomicU64,
}

impl ListenerBroadcaster {
    pub fn new(store: Arc<DocumentStore>) -> Arc<Self> {
        let broadcaster = Arc::new(Self {
            store: Arc::clone(&store),
            sessions: Mutex::new(HashMap::new()),
            session_counter: AtomicU64::new(1),
        });

        let weak: Weak<ListenerBroadcaster> = Arc::downgrade(&broadcaster);
        store.register_change_watcher(Arc::new(move |record: &CommitRecord| {
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.on_commit(record);
            }
        }));
        let weak: Weak<ListenerBroadcaster> = Arc::downgrade(&broadcaster);
        store.register_reset_listener(Arc::new(move || {
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.on_reset();
            }
        }));

        broadcaster
    }

    /// Opens a new listen stream. Targets added to the returned session share
    /// one event channel and one target-id convention.
    pub fn subscribe(self: &Arc<Self>) -> ListenSession {
        let (sender, receiver) = async_channel::unbounded();
        let session_id = self.session_counter.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().insert(
            session_id,
            SessionState {
                sender,
                targets: Vec::new(),
                id_mode: None,
                next_server_id: 2,
            },
        );
        ListenSession {
            broadcaster: Arc::clone(self),
            session_id,
            receiver,
        }
    }

    fn on_commit(&self, record: &CommitRecord) {
        let mut sessions = self.sessions.lock().unwrap();
        let mut any_changes = false;
        let mut max_read_time = Timestamp::new(0, 0);

        for session in sessions.values_mut() {
            let mut updates = Vec::new();
            let mut removals = Vec::new();
            for target in session.targets.iter_mut() {
                match target.apply_commit(&self.store, record) {
                    Ok(Some(update)) => {
                        any_changes = true;
                        updates.push((target.target_id(), update));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!(
                            "listen target {} failed evaluation: {err}",
                            target.target_id()
                        );
                        removals.push((target.target_id(), err));
                    }
                }
                if target.last_read_time() > max_read_time {
                    max_read_time = target.last_read_time();
                }
            }
            for (target_id, update) in updates {
                send_target_update(session, target_id, update);
            }
            for (target_id, err) in removals {
                session.targets.retain(|t| t.target_id() != target_id);
                session.send(ListenerEvent::TargetRemoved {
                    target_id,
                    cause: Some(err),
                });
            }
        }

        if any_changes {
            if record.server_time > max_read_time {
                max_read_time = record.server_time;
            }
            for session in sessions.values() {
                if !session.targets.is_empty() {
                    session.send(ListenerEvent::GlobalSnapshot {
                        read_time: max_read_time,
                    });
                }
            }
        }
    }

    fn on_reset(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            let updates: Vec<(i32, TargetUpdate)> = session
                .targets
                .iter_mut()
                .map(|target| (target.target_id(), target.reset()))
                .collect();
            for (target_id, update) in updates {
                if !update.changes.is_empty() {
                    send_target_update(session, target_id, update);
                }
            }
        }
    }

    fn add_target(&self, session_id: u64, requested_id: i32, scope: TargetScope) -> i32 {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(&session_id) else {
            return requested_id;
        };

        let requested_mode = if requested_id == 0 {
            IdMode::ServerAssigned
        } else {
            IdMode::ClientProvided
        };
        match session.id_mode {
            None => session.id_mode = Some(requested_mode),
            Some(mode) if mode != requested_mode => {
                // Mixing conventions on one stream drops the offending target
                // rather than the stream.
                session.send(ListenerEvent::TargetRemoved {
                    target_id: requested_id,
                    cause: Some(invalid_argument(
                        "Target ids must be either all server-assigned or all client-provided \
                         within one listen stream",
                    )),
                });
                return requested_id;
            }
            Some(_) => {}
        }

        let target_id = if requested_id == 0 {
            let id = session.next_server_id;
            session.next_server_id += 2;
            id
        } else {
            requested_id
        };

        if session.targets.iter().any(|t| t.target_id() == target_id) {
            session.send(ListenerEvent::TargetRemoved {
                target_id,
                cause: Some(already_exists(format!(
                    "Target id {target_id} is already active on this stream"
                ))),
            });
            return target_id;
        }

        let mut target = ListenTarget::new(target_id, scope);
        let read_time = self.store.last_commit_time();
        match target.initialize(&self.store, read_time) {
            Ok(update) => {
                session.send(ListenerEvent::TargetAdded { target_id });
                send_target_update(session, target_id, update);
                session.targets.push(target);
            }
            Err(err) => {
                // Deferred query validation: the failure travels down the
                // stream instead of failing the subscribe call.
                session.send(ListenerEvent::TargetRemoved {
                    target_id,
                    cause: Some(err),
                });
            }
        }
        target_id
    }

    fn remove_target(&self, session_id: u64, target_id: i32) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(&session_id) {
            let before = session.targets.len();
            session.targets.retain(|t| t.target_id() != target_id);
            if session.targets.len() != before {
                session.send(ListenerEvent::TargetRemoved {
                    target_id,
                    cause: None,
                });
            }
        }
    }

    fn drop_session(&self, session_id: u64) {
        self.sessions.lock().unwrap().remove(&session_id);
    }

    #[cfg(test)]
    fn active_target_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|session| session.targets.len())
            .sum()
    }
}

fn send_target_update(session: &SessionState, target_id: i32, update: TargetUpdate) {
    if update.changes.is_empty() {
        return;
    }
    let read_time = update.read_time;
    session.send(ListenerEvent::Changes {
        target_id,
        changes: update.changes,
        read_time,
    });
    session.send(ListenerEvent::Current {
        target_id,
        read_time,
    });
}

/// One listen stream: a target registry plus the ordered event channel.
/// Unsubscribing (dropping) stops all future deliveries; an event already in
/// the channel stays readable.
pub struct ListenSession {
    broadcaster: Arc<ListenerBroadcaster>,
    session_id: u64,
    receiver: async_channel::Receiver<ListenerEvent>,
}

impl ListenSession {
    /// Registers a target. `requested_id` of `0` asks the server to assign
    /// one; the assigned id is returned.
    pub fn add_target(&self, requested_id: i32, scope: TargetScope) -> i32 {
        self.broadcaster
            .add_target(self.session_id, requested_id, scope)
    }

    pub fn remove_target(&self, target_id: i32) {
        self.broadcaster.remove_target(self.session_id, target_id)
    }

    pub fn events(&self) -> &async_channel::Receiver<ListenerEvent> {
        &self.receiver
    }

    pub async fn next_event(&self) -> Option<ListenerEvent> {
        self.receiver.recv().await.ok()
    }

    /// Synchronous convenience for callers without an async runtime.
    pub fn next_event_blocking(&self) -> Option<ListenerEvent> {
        futures::executor::block_on(self.next_event())
    }

    /// Drains whatever has been delivered so far without waiting.
    pub fn drain_events(&self) -> Vec<ListenerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Drop for ListenSession {
    fn drop(&mut self) {
        self.broadcaster.drop_session(self.session_id);
    }
}
