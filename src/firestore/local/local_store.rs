use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{ChangeType, Query, Target, User, ViewSnapshot};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::bundle_cache::{BundleCache, BundleMetadata, NamedQuery};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::{DocumentMap, LocalDocumentsView, NextDocumentsResult};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::{IndexAutoCreationSettings, QueryEngine};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::{RemoteDocumentCache, RemoteDocumentChangeBuffer};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::{QueryResult, TargetData, TargetId, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, IndexOffset, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, OverlayedDocument, ResourcePath, SnapshotVersion, Timestamp,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};
use crate::util::{hard_assert, hard_fail};

/// Resume tokens older than this are persisted even when a target saw no
/// document changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// What happens to a target's cached state once no listener needs it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GarbageCollectionPolicy {
    /// Drop target data and every document nothing references anymore.
    #[default]
    Eager,
    /// Keep released targets and documents; only sequence numbers move.
    Lru,
}

/// Result of a local write: the batch id assigned and the documents as they
/// look with the write applied.
#[derive(Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

/// Documents whose local view may differ after a user change, together with
/// the batches that disappeared and appeared.
#[derive(Debug)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Keys a view started or stopped showing for one target.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = BTreeSet::new();
        let mut removed_keys = BTreeSet::new();
        for change in &snapshot.document_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.document.key().clone());
                }
                _ => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

/// Result of applying remote documents to the cache.
struct DocumentChangeResult {
    changed_documents: DocumentMap,
    existence_changed_keys: BTreeSet<DocumentKey>,
}

/// The local half of the client: owns the persisted caches of the current
/// user and answers every read and write against them, one transaction per
/// call.
pub struct LocalStore {
    persistence: Persistence,
    gc_policy: GarbageCollectionPolicy,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    bundle_cache: BundleCache,
    index_manager: IndexManager,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
    /// Keys currently shown by a view, keyed by the view's target.
    local_view_references: ReferenceSet,
    /// Active targets. Entries may be newer than their persisted copies.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
}

impl LocalStore {
    pub fn new(
        persistence: Persistence,
        user: &User,
        gc_policy: GarbageCollectionPolicy,
        index_auto_creation: IndexAutoCreationSettings,
    ) -> Self {
        let index_manager = IndexManager::new();
        let remote_documents = RemoteDocumentCache::new(index_manager.clone());
        let mutation_queue = MutationQueue::for_user(user);
        let overlays = DocumentOverlayCache::for_user(user);
        let local_documents = LocalDocumentsView::new(
            remote_documents.clone(),
            mutation_queue.clone(),
            overlays.clone(),
            index_manager.clone(),
        );
        let query_engine = QueryEngine::new(local_documents.clone(), index_manager.clone(), index_auto_creation);
        Self {
            persistence,
            gc_policy,
            mutation_queue,
            overlays,
            remote_documents,
            target_cache: TargetCache::new(),
            bundle_cache: BundleCache::new(),
            index_manager,
            local_documents,
            query_engine,
            local_view_references: ReferenceSet::new(),
            target_data_by_target: BTreeMap::new(),
        }
    }

    fn initialize_user_components(&mut self, user: &User) {
        self.mutation_queue = MutationQueue::for_user(user);
        self.overlays = DocumentOverlayCache::for_user(user);
        self.local_documents = LocalDocumentsView::new(
            self.remote_documents.clone(),
            self.mutation_queue.clone(),
            self.overlays.clone(),
            self.index_manager.clone(),
        );
        self.query_engine
            .initialize(self.local_documents.clone(), self.index_manager.clone());
    }

    /// Switches to `user`'s mutation queue and overlays.
    pub fn handle_user_change(&mut self, user: &User) -> FirestoreResult<UserChangeResult> {
        let old_batches = self
            .persistence
            .run_transaction("Get old mutation batches", TransactionMode::ReadOnly, |txn| {
                self.mutation_queue.get_all_mutation_batches(txn)
            })?;
        self.initialize_user_components(user);

        let local_documents = self.local_documents.clone();
        let mutation_queue = self.mutation_queue.clone();
        self.persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let new_batches = mutation_queue.get_all_mutation_batches(txn)?;
                let mut changed_keys = BTreeSet::new();
                let removed_batch_ids = collect_batch_keys(&old_batches, &mut changed_keys);
                let added_batch_ids = collect_batch_keys(&new_batches, &mut changed_keys);
                let affected_documents = local_documents.get_documents(txn, &changed_keys)?;
                log::debug!(
                    "user change to {user}: {} batches removed, {} added",
                    removed_batch_ids.len(),
                    added_batch_ids.len()
                );
                Ok(UserChangeResult {
                    affected_documents,
                    removed_batch_ids,
                    added_batch_ids,
                })
            })
    }

    /// Queues `mutations` as one batch and returns the documents with the
    /// batch applied.
    pub fn local_write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|mutation| mutation.key().clone()).collect();
        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let remote_documents = self.remote_documents.get_entries(txn, &keys)?;
                let documents_without_remote_version: BTreeSet<DocumentKey> = remote_documents
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = self.local_documents.get_overlayed_documents(txn, remote_documents)?;

                // Non-idempotent transforms record the value they started
                // from so a later remote update cannot make the result flicker.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(current) = overlayed.get(mutation.key()) else {
                        continue;
                    };
                    if let Some(base_value) = mutation.extract_transform_base_value(&current.document) {
                        let mask = base_value.field_mask();
                        base_mutations.push(Mutation::patch(mutation.key().clone(), base_value, mask));
                    }
                }

                for key in &keys {
                    self.index_manager
                        .add_to_collection_parent_index(txn, &key.collection_path())?;
                }

                let batch = self
                    .mutation_queue
                    .add_mutation_batch(txn, local_write_time, base_mutations, mutations)?;
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
                self.overlays.save_overlays(txn, batch.batch_id, overlays)?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: into_document_map(overlayed),
                })
            })
    }

    /// Folds the server's results for an acknowledged batch into the remote
    /// cache and returns the affected documents.
    pub fn acknowledge_batch(&mut self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let affected = batch_result.batch.keys();
        let documents = self
            .persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let mut buffer = RemoteDocumentChangeBuffer::new(&self.remote_documents);
                self.apply_write_to_remote_documents(txn, batch_result, &mut buffer)?;
                buffer.apply(txn)?;
                self.mutation_queue.perform_consistency_check(txn)?;
                self.overlays
                    .remove_overlays_for_batch_id(txn, &affected, batch_result.batch.batch_id)?;
                self.local_documents
                    .recalculate_overlays_for_keys(txn, &keys_with_transform_results(batch_result))?;
                let documents = self.local_documents.get_documents(txn, &affected)?;
                self.collect_garbage(txn, affected.clone())?;
                Ok(documents)
            })?;
        Ok(documents)
    }

    fn apply_write_to_remote_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_result: &MutationBatchResult,
        buffer: &mut RemoteDocumentChangeBuffer<'_>,
    ) -> FirestoreResult<()> {
        let batch = &batch_result.batch;
        for key in batch.keys() {
            let mut document = buffer.get_entry(txn, &key)?;
            let ack_version = batch_result.doc_versions.get(&key).copied();
            let Some(ack_version) = ack_version else {
                hard_fail("ack versions must cover every document in the write");
            };
            if document.version() < ack_version {
                batch.apply_to_remote_document(&mut document, batch_result);
                if document.is_valid_document() {
                    // The commit version is the read time; the update time
                    // does not advance for writes that change nothing.
                    document.set_read_time(batch_result.commit_version);
                    buffer.add_entry(document);
                }
            }
        }
        self.mutation_queue
            .acknowledge_batch(txn, batch, batch_result.stream_token.clone())?;
        self.mutation_queue.remove_mutation_batch(txn, batch)
    }

    /// Removes a batch the server refused and returns the affected documents
    /// without its effect.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = self.mutation_queue.lookup_mutation_batch(txn, batch_id)?;
                let Some(batch) = batch else {
                    hard_fail("attempted to reject a batch that is not queued");
                };
                let affected = batch.keys();
                self.mutation_queue.remove_mutation_batch(txn, &batch)?;
                self.mutation_queue.perform_consistency_check(txn)?;
                self.overlays.remove_overlays_for_batch_id(txn, &affected, batch_id)?;
                self.local_documents.recalculate_overlays_for_keys(txn, &affected)?;
                let documents = self.local_documents.get_documents(txn, &affected)?;
                self.collect_garbage(txn, affected.clone())?;
                Ok(documents)
            })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                self.mutation_queue.get_highest_unacknowledged_batch_id(txn)
            })
    }

    /// First queued batch after `after_batch_id`, or the first batch overall.
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                self.mutation_queue
                    .get_next_mutation_batch_after_batch_id(txn, after_batch_id.unwrap_or(BATCH_ID_UNKNOWN))
            })
    }

    pub fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                self.mutation_queue.get_last_stream_token(txn)
            })
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                self.mutation_queue.set_last_stream_token(txn, stream_token)
            })
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_last_remote_snapshot_version(txn)
            })
    }

    /// Applies a remote event to the caches and returns the local view of
    /// every document it changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let mut updated_targets = self.target_data_by_target.clone();
        let documents = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                let sequence_number = self.target_cache.next_sequence_number(txn)?;
                let mut buffer = RemoteDocumentChangeBuffer::new(&self.remote_documents);
                let mut orphan_candidates = BTreeSet::new();

                for (target_id, change) in &event.target_changes {
                    let Some(old) = updated_targets.get(target_id).cloned() else {
                        continue;
                    };
                    // Matching keys are only tracked for active targets so the
                    // assignment persists together with the target data.
                    self.target_cache
                        .remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    self.target_cache
                        .add_matching_keys(txn, &change.added_documents, *target_id)?;
                    orphan_candidates.extend(change.removed_documents.iter().cloned());

                    let mut updated = old.with_sequence_number(sequence_number);
                    if event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if should_persist_target_data(&old, &updated, Some(change)) {
                        self.target_cache.update_target_data(txn, &updated)?;
                    }
                    updated_targets.insert(*target_id, updated);
                }

                let result = populate_document_change_buffer(txn, &mut buffer, &event.document_updates)?;

                if !remote_version.is_min() {
                    let last_remote_version = self.target_cache.get_last_remote_snapshot_version(txn)?;
                    hard_assert(
                        remote_version >= last_remote_version,
                        "watch stream reverted to a previous snapshot",
                    );
                    self.target_cache
                        .set_last_remote_snapshot_version(txn, remote_version)?;
                }

                buffer.apply(txn)?;
                let views = self.local_documents.get_local_view_of_documents(
                    txn,
                    result.changed_documents,
                    &result.existence_changed_keys,
                )?;
                orphan_candidates.extend(event.resolved_limbo_documents.iter().cloned());
                self.collect_garbage(txn, orphan_candidates)?;
                Ok(into_document_map(views))
            })?;
        self.target_data_by_target = updated_targets;
        Ok(documents)
    }

    /// Records which keys views now show and advances each synced target's
    /// last limbo-free snapshot.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let mut released = BTreeSet::new();
        for change in view_changes {
            self.local_view_references
                .add_references(&change.added_keys, change.target_id);
            self.local_view_references
                .remove_references(&change.removed_keys, change.target_id);
            released.extend(change.removed_keys.iter().cloned());

            if !change.from_cache {
                if let Some(data) = self.target_data_by_target.get(&change.target_id) {
                    let updated = data.with_last_limbo_free_snapshot_version(data.snapshot_version);
                    self.target_data_by_target.insert(change.target_id, updated);
                }
            }
        }
        if self.gc_policy == GarbageCollectionPolicy::Eager && !released.is_empty() {
            self.persistence
                .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                    self.collect_garbage(txn, released)
                })?;
        }
        Ok(())
    }

    /// Returns the target data for `target`, registering the target first if
    /// it is not cached.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = self.target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = self.target_cache.allocate_target_id(txn)?;
                let sequence_number = self.target_cache.next_sequence_number(txn)?;
                let data = TargetData::new(target.clone(), target_id, TargetPurpose::Listen, sequence_number);
                self.target_cache.add_target_data(txn, &data)?;
                Ok(data)
            })?;

        let is_newer = self
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if is_newer {
            self.target_data_by_target
                .insert(target_data.target_id, target_data.clone());
        }
        log::debug!(
            "allocated target {} for {}",
            target_data.target_id,
            target_data.target.canonical_id()
        );
        Ok(target_data)
    }

    /// Active target data, if `target_id` is allocated.
    pub fn get_target_data(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_target.get(&target_id)
    }

    /// Stops tracking `target_id`. Under eager collection the persisted target
    /// and every document only it referenced are dropped.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let target_data = self.target_data_by_target.get(&target_id).cloned();
        let Some(target_data) = target_data else {
            hard_fail("tried to release a target that is not active");
        };

        let released: BTreeSet<DocumentKey> = self
            .local_view_references
            .remove_references_for_id(target_id)
            .into_iter()
            .collect();

        if !keep_persisted_target_data {
            let result = self
                .persistence
                .run_transaction("Release target", TransactionMode::ReadWritePrimary, |txn| {
                    match self.gc_policy {
                        GarbageCollectionPolicy::Eager => {
                            let mut candidates = self
                                .target_cache
                                .get_matching_keys_for_target_id(txn, target_id)?;
                            candidates.extend(released);
                            self.target_cache.remove_target_data(txn, &target_data)?;
                            self.collect_garbage(txn, candidates)
                        }
                        GarbageCollectionPolicy::Lru => {
                            let sequence_number = self.target_cache.next_sequence_number(txn)?;
                            self.target_cache
                                .update_target_data(txn, &target_data.with_sequence_number(sequence_number))
                        }
                    }
                });
            if let Err(err) = result {
                if !err.is_primary_lease_lost() {
                    return Err(err);
                }
                log::debug!("failed to release target {target_id}: {err}");
            }
        }

        self.target_data_by_target.remove(&target_id);
        log::debug!("released target {target_id}");
        Ok(())
    }

    /// Removes the documents in `candidates` that no target, view or queued
    /// mutation references anymore.
    fn collect_garbage(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        candidates: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        if self.gc_policy != GarbageCollectionPolicy::Eager {
            return Ok(());
        }
        for key in candidates {
            let referenced = self.local_view_references.contains_key(&key)
                || self.target_cache.contains_key(txn, &key)?
                || self.mutation_queue.contains_key(txn, &key)?;
            if !referenced {
                log::trace!("collecting unreferenced document {}", key.path().canonical_string());
                self.remote_documents.remove_entry(txn, &key)?;
            }
        }
        Ok(())
    }

    /// Runs `query` against the cache. With `use_previous_results` the last
    /// limbo-free result of the query's target seeds the execution.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, |txn| {
                let target = query.to_target();
                let mut last_limbo_free = SnapshotVersion::min();
                let mut remote_keys = BTreeSet::new();
                if let Some(data) = self.find_target_data(txn, &target)? {
                    last_limbo_free = data.last_limbo_free_snapshot_version;
                    remote_keys = self
                        .target_cache
                        .get_matching_keys_for_target_id(txn, data.target_id)?;
                }
                let documents = if use_previous_results {
                    self.query_engine
                        .get_documents_matching_query(txn, query, last_limbo_free, &remote_keys)?
                } else {
                    self.query_engine.get_documents_matching_query(
                        txn,
                        query,
                        SnapshotVersion::min(),
                        &BTreeSet::new(),
                    )?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
    }

    fn find_target_data(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        if let Some(active) = self
            .target_data_by_target
            .values()
            .find(|data| data.target == *target)
        {
            return Ok(Some(active.clone()));
        }
        self.target_cache.get_target_data(txn, target)
    }

    /// Local view of every document matching `query` changed after `offset`.
    pub fn get_documents_matching_query(&self, query: &Query, offset: &IndexOffset) -> FirestoreResult<DocumentMap> {
        self.persistence
            .run_transaction("Get documents matching query", TransactionMode::ReadOnly, |txn| {
                self.local_documents
                    .get_documents_matching_query(txn, query, offset, None)
            })
    }

    pub fn get_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| {
                self.local_documents.get_document(txn, key)
            })
    }

    pub fn get_documents(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<DocumentMap> {
        self.persistence
            .run_transaction("Read documents", TransactionMode::ReadOnly, |txn| {
                self.local_documents.get_documents(txn, keys)
            })
    }

    /// Keys the server last reported as matching `target_id`.
    pub fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Get remote document keys", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_matching_keys_for_target_id(txn, target_id)
            })
    }

    /// Replaces the configured field indexes with `indexes`.
    pub fn configure_field_indexes(&self, indexes: &[FieldIndex]) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, |txn| {
                let existing = self.index_manager.get_field_indexes(txn, None)?;
                for old in &existing {
                    if !indexes.iter().any(|index| index.same_definition(old)) {
                        self.index_manager.delete_field_index(txn, old)?;
                    }
                }
                for index in indexes {
                    if !existing.iter().any(|old| old.same_definition(index)) {
                        self.index_manager.add_field_index(txn, index)?;
                    }
                }
                Ok(())
            })
    }

    pub fn get_field_indexes(&self) -> FirestoreResult<Vec<FieldIndex>> {
        self.persistence
            .run_transaction("Get field indexes", TransactionMode::ReadOnly, |txn| {
                self.index_manager.get_field_indexes(txn, None)
            })
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.query_engine.set_index_auto_creation_enabled(enabled);
    }

    /// Writes index entries for up to `max_documents` documents, visiting the
    /// least recently updated collection groups first. Returns the number of
    /// documents processed.
    pub fn backfill_indexes(&self, max_documents: usize) -> FirestoreResult<usize> {
        self.persistence
            .run_transaction("Backfill indexes", TransactionMode::ReadWritePrimary, |txn| {
                let mut processed_groups = BTreeSet::new();
                let mut remaining = max_documents;
                while remaining > 0 {
                    let Some(group) = self.index_manager.get_next_collection_group_to_update(txn)? else {
                        break;
                    };
                    if !processed_groups.insert(group.clone()) {
                        break;
                    }
                    let processed = self.write_entries_for_collection_group(txn, &group, remaining)?;
                    log::debug!("backfilled {processed} documents of collection group '{group}'");
                    remaining -= processed.min(remaining);
                }
                Ok(max_documents - remaining)
            })
    }

    fn write_entries_for_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        limit: usize,
    ) -> FirestoreResult<usize> {
        let existing_offset = self
            .index_manager
            .get_min_offset_for_collection_group(txn, collection_group)?;
        let next = self
            .local_documents
            .get_next_documents(txn, collection_group, &existing_offset, limit)?;
        self.index_manager.update_index_entries(txn, &next.documents)?;
        let new_offset = new_index_offset(&existing_offset, &next);
        self.index_manager
            .update_collection_group(txn, collection_group, new_offset)?;
        Ok(next.documents.len())
    }

    /// Whether a bundle with the same id and an equal or newer create time
    /// has already been loaded.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.persistence
            .run_transaction("Has newer bundle", TransactionMode::ReadOnly, |txn| {
                Ok(self
                    .bundle_cache
                    .get_bundle_metadata(txn, &metadata.id)?
                    .is_some_and(|cached| cached.create_time >= metadata.create_time))
            })
    }

    pub fn save_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save bundle", TransactionMode::ReadWrite, |txn| {
                self.bundle_cache.save_bundle_metadata(txn, metadata)
            })
    }

    pub fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.persistence
            .run_transaction("Get named query", TransactionMode::ReadOnly, |txn| {
                self.bundle_cache.get_named_query(txn, name)
            })
    }

    /// Saves `query` and, when the bundle is at least as new as what the
    /// query's target has seen, records `documents` as its results.
    pub fn save_named_query(&mut self, query: &NamedQuery, documents: &BTreeSet<DocumentKey>) -> FirestoreResult<()> {
        let allocated = self.allocate_target(query.query.to_target())?;
        let target_id = allocated.target_id;
        let mut updated = None;
        self.persistence
            .run_transaction("Save named query", TransactionMode::ReadWrite, |txn| {
                if query.read_time > allocated.snapshot_version {
                    let data = allocated.with_resume_token(Vec::new(), query.read_time);
                    self.target_cache.update_target_data(txn, &data)?;
                    self.target_cache.remove_matching_keys_for_target_id(txn, target_id)?;
                    self.target_cache.add_matching_keys(txn, documents, target_id)?;
                    updated = Some(data);
                }
                self.bundle_cache.save_named_query(txn, query)
            })?;
        if let Some(data) = updated {
            self.target_data_by_target.insert(target_id, data);
        }
        Ok(())
    }

    /// Writes bundled documents into the remote cache, keeping newer cached
    /// versions. The documents are pinned under an umbrella target for the
    /// bundle so they survive collection.
    pub fn apply_bundle_documents(
        &mut self,
        bundle_id: &str,
        documents: Vec<MutableDocument>,
    ) -> FirestoreResult<DocumentMap> {
        let found_keys: BTreeSet<DocumentKey> = documents
            .iter()
            .filter(|document| document.is_found_document())
            .map(|document| document.key().clone())
            .collect();
        let updates: BTreeMap<DocumentKey, MutableDocument> = documents
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();

        let umbrella = Query::at_path(ResourcePath::from_segments(["__bundle__", "docs", bundle_id])).to_target();
        let umbrella_data = self.allocate_target(umbrella)?;

        self.persistence
            .run_transaction("Apply bundle documents", TransactionMode::ReadWrite, |txn| {
                let mut buffer = RemoteDocumentChangeBuffer::new(&self.remote_documents);
                let result = populate_document_change_buffer(txn, &mut buffer, &updates)?;
                buffer.apply(txn)?;
                self.target_cache
                    .remove_matching_keys_for_target_id(txn, umbrella_data.target_id)?;
                self.target_cache
                    .add_matching_keys(txn, &found_keys, umbrella_data.target_id)?;
                let views = self.local_documents.get_local_view_of_documents(
                    txn,
                    result.changed_documents,
                    &result.existence_changed_keys,
                )?;
                Ok(into_document_map(views))
            })
    }
}

fn collect_batch_keys(batches: &[MutationBatch], keys: &mut BTreeSet<DocumentKey>) -> Vec<BatchId> {
    batches
        .iter()
        .map(|batch| {
            keys.extend(batch.mutations.iter().map(|mutation| mutation.key().clone()));
            batch.batch_id
        })
        .collect()
}

fn into_document_map(documents: BTreeMap<DocumentKey, OverlayedDocument>) -> DocumentMap {
    documents
        .into_iter()
        .map(|(key, overlayed)| (key, overlayed.document))
        .collect()
}

fn keys_with_transform_results(batch_result: &MutationBatchResult) -> BTreeSet<DocumentKey> {
    batch_result
        .batch
        .mutations
        .iter()
        .zip(&batch_result.mutation_results)
        .filter(|(_, result)| !result.transform_results.is_empty())
        .map(|(mutation, _)| mutation.key().clone())
        .collect()
}

/// Applies `updates` to the buffer, keeping cached documents that are newer.
/// Tombstones at the minimum version come from rejected limbo resolutions and
/// evict the cached entry instead of being stored.
fn populate_document_change_buffer(
    txn: &PersistenceTransaction<'_>,
    buffer: &mut RemoteDocumentChangeBuffer<'_>,
    updates: &BTreeMap<DocumentKey, MutableDocument>,
) -> FirestoreResult<DocumentChangeResult> {
    let existing = buffer.get_entries(txn, updates.keys())?;
    let mut changed_documents = DocumentMap::new();
    let mut existence_changed_keys = BTreeSet::new();
    for (key, document) in updates {
        let Some(current) = existing.get(key) else {
            continue;
        };
        if document.is_found_document() != current.is_found_document() {
            existence_changed_keys.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            buffer.remove_entry(key.clone());
            changed_documents.insert(key.clone(), document.clone());
        } else if !current.is_valid_document()
            || document.version() > current.version()
            || (document.version() == current.version() && current.has_pending_writes())
        {
            hard_assert(
                !document.read_time().is_min(),
                "cannot add a document when the remote version is zero",
            );
            buffer.add_entry(document.clone());
            changed_documents.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "ignoring outdated watch update for {}: current version {:?}, watch version {:?}",
                key.path().canonical_string(),
                current.version(),
                document.version()
            );
        }
    }
    Ok(DocumentChangeResult {
        changed_documents,
        existence_changed_keys,
    })
}

/// Whether an update to a target must be written through. Resume tokens are
/// persisted when first seen, when the cached one is stale, or alongside
/// document changes.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: Option<&TargetChange>) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let delta = new.snapshot_version.timestamp().to_micros() - old.snapshot_version.timestamp().to_micros();
    if delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.is_some_and(|change| {
        !change.added_documents.is_empty()
            || !change.modified_documents.is_empty()
            || !change.removed_documents.is_empty()
    })
}

fn new_index_offset(existing: &IndexOffset, next: &NextDocumentsResult) -> IndexOffset {
    let mut max_offset = existing.clone();
    for document in next.documents.values() {
        let offset = IndexOffset::from_document(document);
        if offset > max_offset {
            max_offset = offset;
        }
    }
    IndexOffset::new(
        max_offset.read_time,
        max_offset.document_key,
        next.largest_batch_id.max(existing.largest_batch_id),
    )
}
