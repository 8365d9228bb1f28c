use std::collections::BTreeMap;

use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::core::{OnlineState, Query};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::util::PartialObserver;

pub type ListenerId = u64;

/// How a listener wants snapshots raised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots whose only change is `from_cache` or pending-write
    /// state.
    pub include_metadata_changes: bool,
    /// Hold back a from-cache initial snapshot while the client may still
    /// reach the backend.
    pub wait_for_sync_when_online: bool,
}

/// One registration against a query. Applies the [`ListenOptions`] to the
/// stream of view snapshots before they reach the observer.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: PartialObserver<ViewSnapshot>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: PartialObserver<ViewSnapshot>) -> Self {
        Self {
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            without_metadata_changes(snapshot)
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.observer.notify_next(&snapshot);
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: &FirestoreError) {
        self.observer.notify_error(error);
    }

    /// A held-back initial snapshot may become raisable once the client is
    /// known to be offline.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty from-cache result is only worth raising once the backend is
        // known to be out of reach.
        !snapshot.documents.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.observer.notify_next(&initial);
    }
}

fn without_metadata_changes(mut snapshot: ViewSnapshot) -> ViewSnapshot {
    snapshot
        .document_changes
        .retain(|change| change.change_type != ChangeType::Metadata);
    snapshot.excludes_metadata_changes = true;
    snapshot
}

struct QueryListeners {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<(ListenerId, QueryListener)>,
}

/// Fans view snapshots out to every listener of the same query.
///
/// Only the first listener of a query reaches the sync engine; later ones are
/// served from the last snapshot.
#[derive(Default)]
pub struct EventManager {
    queries: BTreeMap<String, QueryListeners>,
    online_state: OnlineState,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self) -> usize {
        self.queries.values().map(|info| info.listeners.len()).sum()
    }

    /// Registers `listener`. `start_query` is called when this is the first
    /// listener of its query and must return the initial snapshot. If it
    /// fails the listener receives the error and is dropped.
    pub fn listen<F>(&mut self, listener_id: ListenerId, mut listener: QueryListener, start_query: F)
    where
        F: FnOnce(&Query) -> FirestoreResult<ViewSnapshot>,
    {
        let canonical_id = listener.query().canonical_id();
        if !self.queries.contains_key(&canonical_id) {
            match start_query(listener.query()) {
                Ok(snapshot) => {
                    self.queries.insert(
                        canonical_id.clone(),
                        QueryListeners {
                            query: listener.query().clone(),
                            view_snapshot: Some(snapshot),
                            listeners: Vec::new(),
                        },
                    );
                }
                Err(error) => {
                    log::warn!(
                        "failed to start listening to {}: {error}",
                        listener.query().canonical_id()
                    );
                    listener.on_error(&error);
                    return;
                }
            }
        }
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return;
        };
        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = &info.view_snapshot {
            listener.on_view_snapshot(snapshot.clone());
        }
        info.listeners.push((listener_id, listener));
    }

    /// Removes a listener. Returns the query when it was the last listener, so
    /// the caller can stop listening to it.
    pub fn unlisten(&mut self, listener_id: ListenerId) -> Option<Query> {
        let canonical_id = self.queries.iter().find_map(|(canonical_id, info)| {
            info.listeners
                .iter()
                .any(|(id, _)| *id == listener_id)
                .then(|| canonical_id.clone())
        })?;
        let info = self.queries.get_mut(&canonical_id)?;
        info.listeners.retain(|(id, _)| *id != listener_id);
        if info.listeners.is_empty() {
            return self.queries.remove(&canonical_id).map(|info| info.query);
        }
        None
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for (_, listener) in &mut info.listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
            info.view_snapshot = Some(snapshot);
        }
    }

    /// The query failed for good: every listener hears about it once and is
    /// dropped.
    pub fn on_watch_error(&mut self, query: &Query, error: &FirestoreError) {
        if let Some(info) = self.queries.remove(&query.canonical_id()) {
            for (_, listener) in &info.listeners {
                listener.on_error(error);
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for (_, listener) in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }

    /// Drops every registration without notifying anyone.
    pub fn clear(&mut self) {
        self.queries.clear();
    }
}
