use std::collections::{BTreeMap, BTreeSet, VecDeque};

use futures::channel::oneshot;

use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::{OnlineState, Query, TargetIdGenerator, User, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::{
    BundleMetadata, DocumentMap, LocalStore, LocalViewChanges, NamedQuery, ReferenceSet, TargetData,
    TargetId, TargetPurpose, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion,
};
use crate::firestore::remote::{RemoteEvent, RemoteSyncer, TargetChange};
use crate::util::hard_assert;

/// Resolves once the server acknowledged or rejected a write.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Work for the remote store that the sync engine cannot do itself, since
/// the remote store is what calls into it.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCommand {
    Listen(TargetData),
    Unlisten(TargetId),
    FillWritePipeline,
}

/// Something listeners need to hear about.
#[derive(Clone, Debug)]
pub enum SyncEngineEvent {
    Snapshots(Vec<ViewSnapshot>),
    QueryError(Query, FirestoreError),
    OnlineStateChanged(OnlineState),
}

/// Documents and queries of one bundle, already decoded.
#[derive(Clone, Debug)]
pub struct LoadedBundle {
    pub metadata: BundleMetadata,
    pub documents: Vec<MutableDocument>,
    /// Each named query with the keys of the bundled documents it matched.
    pub named_queries: Vec<(NamedQuery, BTreeSet<DocumentKey>)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleLoadResult {
    pub documents_loaded: usize,
    /// The same or a newer bundle was loaded before.
    pub skipped: bool,
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A document whose presence in a view the backend has not confirmed.
#[derive(Clone, Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has delivered the document yet. Used to
    /// answer which keys the target believes match.
    received_document: bool,
}

/// Ties queries to targets and views, and keeps both up to date as local
/// writes and remote events arrive.
pub struct SyncEngine {
    local_store: LocalStore,
    current_user: User,
    online_state: OnlineState,
    max_concurrent_limbo_resolutions: usize,

    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,

    /// Limbo keys waiting for a free resolution slot, in arrival order.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views hold each limbo key.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,

    write_callbacks: BTreeMap<User, BTreeMap<BatchId, WriteCallback>>,

    remote_commands: Vec<RemoteCommand>,
    events: Vec<SyncEngineEvent>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, user: User, max_concurrent_limbo_resolutions: usize) -> Self {
        Self {
            local_store,
            current_user: user,
            online_state: OnlineState::Unknown,
            max_concurrent_limbo_resolutions,
            query_views: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            write_callbacks: BTreeMap::new(),
            remote_commands: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn local_store_mut(&mut self) -> &mut LocalStore {
        &mut self.local_store
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn take_remote_commands(&mut self) -> Vec<RemoteCommand> {
        std::mem::take(&mut self.remote_commands)
    }

    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Keys currently being resolved through a limbo target.
    pub fn active_limbo_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_resolutions(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Starts tracking `query` and returns its first snapshot, computed from
    /// the cache.
    pub fn listen(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        hard_assert(
            !self.query_views.contains_key(&canonical_id),
            format!("already listening to {canonical_id}"),
        );

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let shares_target = self.queries_by_target.contains_key(&target_id);
        // A query joining a synced target starts out current.
        let current = shares_target
            && self
                .query_views
                .values()
                .any(|existing| existing.target_id == target_id && existing.view.is_synced());
        let snapshot = self.initialize_view_and_compute_snapshot(
            query.clone(),
            target_id,
            current,
            target_data.resume_token.clone(),
        )?;
        if !shares_target {
            self.remote_commands.push(RemoteCommand::Listen(target_data));
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys.clone());
        let doc_changes = view.compute_doc_changes(query_result.documents.values(), None);
        let synthesized = TargetChange::synthesized_for_current_change(
            current && self.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, view_change.limbo_changes);
        let snapshot = view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot());

        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query,
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    /// Stops tracking `query`. The target is released once no other query
    /// shares it.
    pub fn stop_listening(&mut self, query: &Query) -> FirestoreResult<()> {
        let Some(query_view) = self.query_views.remove(&query.canonical_id()) else {
            log::debug!("stop listening to unknown query {}", query.canonical_id());
            return Ok(());
        };
        let target_id = query_view.target_id;
        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            queries.retain(|other| other.canonical_id() != query.canonical_id());
            if !queries.is_empty() {
                return Ok(());
            }
        }

        let released = self.local_store.release_target(target_id, false);
        self.remote_commands.push(RemoteCommand::Unlisten(target_id));
        self.remove_and_cleanup_target(target_id, None);
        released
    }

    /// Applies `mutations` locally and queues them for the backend.
    /// `callback` resolves when the backend accepts or rejects the batch.
    pub fn write(&mut self, mutations: Vec<Mutation>, callback: WriteCallback) {
        let result = match self.local_store.local_write(mutations) {
            Ok(result) => result,
            Err(error) => {
                log::warn!("dropped user write: {error}");
                let _ = callback.send(Err(error));
                return;
            }
        };
        self.write_callbacks
            .entry(self.current_user.clone())
            .or_default()
            .insert(result.batch_id, callback);
        if let Err(error) = self.emit_new_snapshots_and_notify_local_store(result.changes, None) {
            log::warn!("failed to raise snapshots for local write: {error}");
        }
        self.remote_commands.push(RemoteCommand::FillWritePipeline);
    }

    /// Loads bundled documents and queries into the cache and refreshes
    /// affected views.
    pub fn load_bundle(&mut self, bundle: LoadedBundle) -> FirestoreResult<BundleLoadResult> {
        if self.local_store.has_newer_bundle(&bundle.metadata)? {
            log::debug!("skipping bundle {}: already loaded", bundle.metadata.id);
            return Ok(BundleLoadResult {
                documents_loaded: 0,
                skipped: true,
            });
        }
        let documents_loaded = bundle.documents.len();
        let changes = self
            .local_store
            .apply_bundle_documents(&bundle.metadata.id, bundle.documents)?;
        self.emit_new_snapshots_and_notify_local_store(changes, None)?;
        for (named_query, keys) in &bundle.named_queries {
            self.local_store.save_named_query(named_query, keys)?;
        }
        self.local_store.save_bundle(&bundle.metadata)?;
        Ok(BundleLoadResult {
            documents_loaded,
            skipped: false,
        })
    }

    fn emit_new_snapshots_and_notify_local_store(
        &mut self,
        changes: DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = self.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some((target_id, snapshot)) =
                self.apply_doc_changes_to_view(&canonical_id, &changes, remote_event)?
            else {
                continue;
            };
            view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
            snapshots.push(snapshot);
        }
        self.events.push(SyncEngineEvent::Snapshots(snapshots));
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn apply_doc_changes_to_view(
        &mut self,
        canonical_id: &str,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<Option<(TargetId, ViewSnapshot)>> {
        let Some(query_view) = self.query_views.get_mut(canonical_id) else {
            return Ok(None);
        };
        let mut doc_changes = query_view.view.compute_doc_changes(changes.values(), None);
        if doc_changes.needs_refill {
            // A limit query lost documents; the cache may hold the ones that
            // move up to replace them.
            let query_result = self.local_store.execute_query(&query_view.query, false)?;
            doc_changes = query_view
                .view
                .compute_doc_changes(query_result.documents.values(), Some(doc_changes));
        }
        let target_id = query_view.target_id;
        let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
        let target_is_pending_reset =
            remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
        let view_change =
            query_view
                .view
                .apply_changes(doc_changes, true, target_change, target_is_pending_reset);
        self.update_tracked_limbos(target_id, view_change.limbo_changes);
        Ok(view_change.snapshot.map(|snapshot| (target_id, snapshot)))
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, limbo_changes: Vec<(LimboDocumentChange, DocumentKey)>) {
        for (change, key) in limbo_changes {
            match change {
                LimboDocumentChange::Added => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed => {
                    log::debug!("document {key} no longer in limbo");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        log::debug!("new document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Starts limbo resolutions while there are free slots.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next();
            log::debug!("resolving limbo document {key} with target {limbo_target_id}");
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            let target = Query::at_path(key.path().clone()).to_target();
            self.remote_commands.push(RemoteCommand::Listen(TargetData::new(
                target,
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) {
            self.remote_commands
                .push(RemoteCommand::Unlisten(limbo_target_id));
            self.active_limbo_resolutions_by_target
                .remove(&limbo_target_id);
            self.pump_enqueued_limbo_resolutions();
        }
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<FirestoreError>) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.events
                    .push(SyncEngineEvent::QueryError(query, error.clone()));
            }
        }
        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    fn resolve_write_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        let callback = self
            .write_callbacks
            .get_mut(&self.current_user)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        match callback {
            // The writer may have stopped waiting.
            Some(callback) => {
                let _ = callback.send(result);
            }
            None => log::debug!("no write callback for batch {batch_id}"),
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(limbo) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            hard_assert(
                change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len() <= 1,
                "limbo resolution for a single document contains multiple changes",
            );
            if !change.added_documents.is_empty() {
                limbo.received_document = true;
            } else if !change.modified_documents.is_empty() {
                hard_assert(limbo.received_document, "received change for limbo target document without add");
            } else if !change.removed_documents.is_empty() {
                hard_assert(limbo.received_document, "received remove for limbo target document without add");
                limbo.received_document = false;
            }
        }
        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snapshots_and_notify_local_store(changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        if let Some(limbo) = self.active_limbo_resolutions_by_target.remove(&target_id) {
            // The backend cannot serve the document, so treat it as missing.
            let key = limbo.key;
            log::debug!("limbo resolution for {key} rejected: {error}");
            self.active_limbo_targets_by_key.remove(&key);
            self.pump_enqueued_limbo_resolutions();

            let document = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                target_changes: BTreeMap::new(),
                target_mismatches: BTreeMap::new(),
                document_updates: BTreeMap::from([(key.clone(), document)]),
                resolved_limbo_documents: BTreeSet::from([key]),
            };
            return self.apply_remote_event(event);
        }

        log::warn!("listen for target {target_id} rejected: {error}");
        if let Err(release_error) = self.local_store.release_target(target_id, false) {
            log::debug!("failed to release rejected target {target_id}: {release_error}");
        }
        self.remove_and_cleanup_target(target_id, Some(error));
        Ok(())
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.resolve_write_callback(batch_id, Ok(()));
        self.emit_new_snapshots_and_notify_local_store(changes, None)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        log::warn!("write batch {batch_id} rejected: {error}");
        let changes = self.local_store.reject_batch(batch_id)?;
        self.resolve_write_callback(batch_id, Err(error));
        self.emit_new_snapshots_and_notify_local_store(changes, None)
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(limbo) = self.active_limbo_resolutions_by_target.get(&target_id) {
            return if limbo.received_document {
                BTreeSet::from([limbo.key.clone()])
            } else {
                BTreeSet::new()
            };
        }
        let mut keys = BTreeSet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.local_store.next_mutation_batch(after_batch_id)
    }

    fn get_last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        self.local_store.get_last_remote_snapshot_version()
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        let mut snapshots = Vec::new();
        for query_view in self.query_views.values_mut() {
            let change = query_view.view.apply_online_state_change(online_state);
            hard_assert(
                change.limbo_changes.is_empty(),
                "online state should not affect limbo documents",
            );
            if let Some(snapshot) = change.snapshot {
                snapshots.push(snapshot);
            }
        }
        self.events.push(SyncEngineEvent::Snapshots(snapshots));
        self.events
            .push(SyncEngineEvent::OnlineStateChanged(online_state));
    }

    fn handle_credential_change(&mut self, user: &User) -> FirestoreResult<()> {
        if *user == self.current_user {
            return Ok(());
        }
        log::debug!("user changed from {} to {user}", self.current_user);
        let result = self.local_store.handle_user_change(user)?;
        self.current_user = user.clone();
        self.emit_new_snapshots_and_notify_local_store(result.affected_documents, None)
    }

    fn get_last_stream_token(&mut self) -> FirestoreResult<Vec<u8>> {
        self.local_store.get_last_stream_token()
    }

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.local_store.set_last_stream_token(stream_token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::target::{FieldFilter, FilterOperator, OrderBy, OrderDirection};
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{
        GarbageCollectionPolicy, IndexAutoCreationSettings, MemoryKvStore, Persistence,
    };
    use crate::firestore::model::{FieldPath, MutationResult, ObjectValue, Timestamp};
    use crate::firestore::core::ChangeType;
    use crate::firestore::value::FirestoreValue;

    fn sync_engine(max_limbo: usize) -> SyncEngine {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()));
        let local_store = LocalStore::new(
            persistence,
            &User::unauthenticated(),
            GarbageCollectionPolicy::Eager,
            IndexAutoCreationSettings::default(),
        );
        SyncEngine::new(local_store, User::unauthenticated(), max_limbo)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(score: i64) -> ObjectValue {
        let mut value = ObjectValue::empty();
        value.set(&FieldPath::from_dot_separated("score").unwrap(), FirestoreValue::from_integer(score));
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn found(path: &str, seconds: i64, score: i64) -> MutableDocument {
        MutableDocument::new_found(key(path), version(seconds), data(score))
    }

    fn listen_target(engine: &mut SyncEngine) -> TargetData {
        let commands = engine.take_remote_commands();
        match commands.as_slice() {
            [RemoteCommand::Listen(target_data)] => target_data.clone(),
            other => panic!("expected one listen, got {other:?}"),
        }
    }

    fn last_snapshots(engine: &mut SyncEngine) -> Vec<ViewSnapshot> {
        engine
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEngineEvent::Snapshots(snapshots) => Some(snapshots),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Event where `documents` are added to `target_id` and it becomes
    /// current.
    fn current_event(target_id: TargetId, documents: &[MutableDocument], at: i64) -> RemoteEvent {
        let mut change = TargetChange::synthesized_for_current_change(true, b"token".to_vec());
        change.added_documents = documents.iter().map(|doc| doc.key().clone()).collect();
        RemoteEvent {
            snapshot_version: version(at),
            target_changes: BTreeMap::from([(target_id, change)]),
            target_mismatches: BTreeMap::new(),
            document_updates: documents
                .iter()
                .map(|doc| (doc.key().clone(), doc.clone()))
                .collect(),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    #[test]
    fn listen_allocates_a_target_and_raises_from_cache_snapshot() {
        let mut engine = sync_engine(100);
        let query = Query::collection("rooms").unwrap();
        let snapshot = engine.listen(&query).unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.documents.is_empty());
        let target_data = listen_target(&mut engine);
        assert_eq!(target_data.purpose, TargetPurpose::Listen);

        engine
            .apply_remote_event(current_event(target_data.target_id, &[found("rooms/a", 1, 1)], 1))
            .unwrap();
        let snapshots = last_snapshots(&mut engine);
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].from_cache);
        assert_eq!(snapshots[0].documents.len(), 1);
    }

    #[test]
    fn query_joining_a_current_target_starts_synced() {
        let mut engine = sync_engine(100);
        let score = || FieldPath::from_dot_separated("score").unwrap();
        let top = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::new(score(), OrderDirection::Descending))
            .with_limit_to_first(5);
        let bottom = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::new(score(), OrderDirection::Ascending))
            .with_limit_to_last(5);
        assert_eq!(top.to_target(), bottom.to_target());

        engine.listen(&top).unwrap();
        let target_id = listen_target(&mut engine).target_id;
        engine
            .apply_remote_event(current_event(target_id, &[found("rooms/a", 1, 1), found("rooms/b", 1, 2)], 1))
            .unwrap();
        last_snapshots(&mut engine);

        let snapshot = engine.listen(&bottom).unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.documents.len(), 2);
        assert!(engine.take_remote_commands().is_empty());
    }

    #[test]
    fn query_joining_an_unsynced_target_starts_from_cache() {
        let mut engine = sync_engine(100);
        let score = || FieldPath::from_dot_separated("score").unwrap();
        let top = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::new(score(), OrderDirection::Descending))
            .with_limit_to_first(5);
        let bottom = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::new(score(), OrderDirection::Ascending))
            .with_limit_to_last(5);

        engine.listen(&top).unwrap();
        listen_target(&mut engine);
        let snapshot = engine.listen(&bottom).unwrap();
        assert!(snapshot.from_cache);
        assert!(engine.take_remote_commands().is_empty());
    }

    #[test]
    fn local_write_raises_pending_snapshot_and_ack_clears_it() {
        let mut engine = sync_engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        engine.take_remote_commands();

        let (tx, mut rx) = oneshot::channel();
        engine.write(vec![Mutation::set(key("rooms/a"), data(1))], tx);
        assert_eq!(engine.take_remote_commands(), vec![RemoteCommand::FillWritePipeline]);
        let snapshots = last_snapshots(&mut engine);
        assert!(snapshots[0].has_pending_writes());

        let batch = engine.next_mutation_batch(None).unwrap().unwrap();
        let result = MutationBatchResult::from(batch, version(2), vec![MutationResult::new(version(2))], Vec::new())
            .unwrap();
        engine.apply_successful_write(result).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(Ok(())));
        let snapshots = last_snapshots(&mut engine);
        assert!(!snapshots[0].has_pending_writes());
    }

    #[test]
    fn rejected_write_reverts_and_reports() {
        let mut engine = sync_engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        let (tx, mut rx) = oneshot::channel();
        engine.write(vec![Mutation::set(key("rooms/a"), data(1))], tx);
        last_snapshots(&mut engine);

        let batch = engine.next_mutation_batch(None).unwrap().unwrap();
        engine
            .reject_failed_write(batch.batch_id, permission_denied("no"))
            .unwrap();
        let outcome = rx.try_recv().unwrap().unwrap();
        assert_eq!(outcome.unwrap_err().code, FirestoreErrorCode::PermissionDenied);
        let snapshots = last_snapshots(&mut engine);
        assert!(snapshots[0].documents.is_empty());
        assert_eq!(snapshots[0].document_changes[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn documents_removed_from_target_go_to_limbo_and_resolve() {
        let mut engine = sync_engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        let target_id = listen_target(&mut engine).target_id;
        engine
            .apply_remote_event(current_event(target_id, &[found("rooms/a", 1, 1)], 1))
            .unwrap();
        last_snapshots(&mut engine);

        // A local patch keeps the document in the view while the server stops
        // reporting it.
        let (tx, _rx) = oneshot::channel();
        engine.write(vec![Mutation::set(key("rooms/a"), data(2))], tx);
        engine.take_remote_commands();
        let batch = engine.next_mutation_batch(None).unwrap().unwrap();

        let mut change = TargetChange::synthesized_for_current_change(true, Vec::new());
        change.removed_documents.insert(key("rooms/a"));
        engine
            .apply_remote_event(RemoteEvent {
                snapshot_version: version(2),
                target_changes: BTreeMap::from([(target_id, change)]),
                target_mismatches: BTreeMap::new(),
                document_updates: BTreeMap::new(),
                resolved_limbo_documents: BTreeSet::new(),
            })
            .unwrap();
        assert!(engine.active_limbo_resolutions().is_empty());

        // Once the write is acknowledged nothing explains the document.
        let result = MutationBatchResult::from(batch, version(3), vec![MutationResult::new(version(3))], Vec::new())
            .unwrap();
        engine.apply_successful_write(result).unwrap();
        let active = engine.active_limbo_resolutions();
        let limbo_target = active[&key("rooms/a")];
        assert_eq!(limbo_target % 2, 1);
        let commands = engine.take_remote_commands();
        assert!(matches!(
            commands.as_slice(),
            [RemoteCommand::Listen(data)] if data.purpose == TargetPurpose::LimboResolution
        ));

        // The limbo target reports the document as gone.
        let limbo_change = TargetChange::synthesized_for_current_change(true, Vec::new());
        engine
            .apply_remote_event(RemoteEvent {
                snapshot_version: version(4),
                target_changes: BTreeMap::from([(limbo_target, limbo_change)]),
                target_mismatches: BTreeMap::new(),
                document_updates: BTreeMap::from([(
                    key("rooms/a"),
                    MutableDocument::new_no_document(key("rooms/a"), version(4)),
                )]),
                resolved_limbo_documents: BTreeSet::from([key("rooms/a")]),
            })
            .unwrap();
        assert!(engine.active_limbo_resolutions().is_empty());
        assert_eq!(engine.take_remote_commands(), vec![RemoteCommand::Unlisten(limbo_target)]);
        let snapshots = last_snapshots(&mut engine);
        assert!(snapshots.last().unwrap().documents.is_empty());
    }

    #[test]
    fn limbo_resolutions_are_capped() {
        let mut engine = sync_engine(1);
        for path in ["rooms/a", "rooms/b"] {
            engine.track_limbo_change(key(path));
        }
        assert_eq!(engine.active_limbo_resolutions().len(), 1);
        assert_eq!(engine.enqueued_limbo_resolutions(), vec![key("rooms/b")]);

        let active_target = engine.active_limbo_resolutions()[&key("rooms/a")];
        engine
            .reject_listen(active_target, permission_denied("gone"))
            .unwrap();
        assert!(engine.active_limbo_resolutions().contains_key(&key("rooms/b")));
        assert!(engine.enqueued_limbo_resolutions().is_empty());
    }

    #[test]
    fn rejected_listen_reports_query_error() {
        let mut engine = sync_engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        let target_id = listen_target(&mut engine).target_id;
        engine.take_events();

        engine
            .reject_listen(target_id, permission_denied("denied"))
            .unwrap();
        let events = engine.take_events();
        assert!(matches!(
            events.as_slice(),
            [SyncEngineEvent::QueryError(failed, error)]
                if failed == &query && error.code == FirestoreErrorCode::PermissionDenied
        ));
        assert!(engine.get_remote_keys_for_target(target_id).is_empty());
    }

    #[test]
    fn limit_query_refills_from_cache() {
        let mut engine = sync_engine(100);
        let query = Query::collection("rooms")
            .unwrap()
            .with_filter(FieldFilter::new(
                FieldPath::from_dot_separated("score").unwrap(),
                FilterOperator::GreaterThan,
                FirestoreValue::from_integer(0),
            ))
            .with_order_by(OrderBy::new(FieldPath::from_dot_separated("score").unwrap(), OrderDirection::Descending))
            .with_limit_to_first(2);
        engine.listen(&query).unwrap();
        let target_id = listen_target(&mut engine).target_id;
        engine
            .apply_remote_event(current_event(
                target_id,
                &[found("rooms/a", 1, 10), found("rooms/b", 1, 7), found("rooms/c", 1, 5)],
                1,
            ))
            .unwrap();
        last_snapshots(&mut engine);

        // Score 5 becomes 12: it enters at the top and pushes out score 7.
        let mut change = TargetChange::synthesized_for_current_change(true, Vec::new());
        change.modified_documents.insert(key("rooms/c"));
        engine
            .apply_remote_event(RemoteEvent {
                snapshot_version: version(2),
                target_changes: BTreeMap::from([(target_id, change)]),
                target_mismatches: BTreeMap::new(),
                document_updates: BTreeMap::from([(key("rooms/c"), found("rooms/c", 2, 12))]),
                resolved_limbo_documents: BTreeSet::new(),
            })
            .unwrap();
        let snapshot = last_snapshots(&mut engine).pop().unwrap();
        let keys: Vec<_> = snapshot.documents.iter().map(|doc| doc.key().clone()).collect();
        assert_eq!(keys, vec![key("rooms/c"), key("rooms/a")]);
        let changes: Vec<_> = snapshot
            .document_changes
            .iter()
            .map(|change| (change.change_type, change.document.key().clone()))
            .collect();
        assert_eq!(
            changes,
            vec![(ChangeType::Removed, key("rooms/b")), (ChangeType::Added, key("rooms/c"))]
        );
    }

    #[test]
    fn going_offline_marks_views_from_cache() {
        let mut engine = sync_engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        let target_id = listen_target(&mut engine).target_id;
        engine
            .apply_remote_event(current_event(target_id, &[found("rooms/a", 1, 1)], 1))
            .unwrap();
        last_snapshots(&mut engine);

        engine.apply_online_state_change(OnlineState::Offline);
        let events = engine.take_events();
        match events.as_slice() {
            [SyncEngineEvent::Snapshots(snapshots), SyncEngineEvent::OnlineStateChanged(OnlineState::Offline)] => {
                assert!(snapshots[0].from_cache);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn stop_listening_releases_the_target() {
        let mut engine = sync_engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        let target_id = listen_target(&mut engine).target_id;
        engine.stop_listening(&query).unwrap();
        assert_eq!(engine.take_remote_commands(), vec![RemoteCommand::Unlisten(target_id)]);
        assert!(engine.local_store().get_target_data(target_id).is_none());
    }
}
