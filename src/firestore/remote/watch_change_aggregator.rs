use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::{TargetData, TargetId, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchTargetChange,
};
use crate::util::hard_assert;

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local store currently associates with the target.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for targets the remote store is actively listening to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Debug)]
struct TargetState {
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
    resume_token: Vec<u8>,
    current: bool,
    // A new target has to be reported even before anything changed.
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..Default::default()
        };
        for (key, kind) in &self.document_changes {
            let bucket = match kind {
                DocumentChangeKind::Added => &mut change.added_documents,
                DocumentChangeKind::Modified => &mut change.modified_documents,
                DocumentChangeKind::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(
            self.pending_responses >= 0,
            "watch acknowledged a target more often than it was requested",
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes between global snapshots and turns them into a
/// [`RemoteEvent`].
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_updates_by_target: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(
        &mut self,
        change: &DocumentChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        let document = &change.document;
        for &target_id in &change.updated_target_ids {
            if document.is_found_document() {
                self.add_document_to_target(target_id, document.clone(), provider);
            } else {
                self.remove_document_from_target(
                    target_id,
                    document.key(),
                    Some(document.clone()),
                    provider,
                );
            }
        }
        for &target_id in &change.removed_target_ids {
            self.remove_document_from_target(target_id, document.key(), Some(document.clone()), provider);
        }
    }

    pub fn handle_document_delete(
        &mut self,
        delete: &DocumentDelete,
        provider: &dyn TargetMetadataProvider,
    ) {
        let tombstone = MutableDocument::new_no_document(delete.key.clone(), delete.read_time);
        for &target_id in &delete.removed_target_ids {
            self.remove_document_from_target(target_id, &delete.key, Some(tombstone.clone()), provider);
        }
    }

    pub fn handle_document_remove(
        &mut self,
        remove: &DocumentRemove,
        provider: &dyn TargetMetadataProvider,
    ) {
        for &target_id in &remove.removed_target_ids {
            self.remove_document_from_target(target_id, &remove.key, None, provider);
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.targets_for_change(change, provider) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, provider) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // Freshly added target: forget whatever an earlier
                        // incarnation accumulated.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        "target errors are handled before reaching the aggregator",
                    );
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, provider) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, provider) {
                        // The server re-sends every document that still matches
                        // before the next global snapshot.
                        self.reset_target(target_id, provider);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn targets_for_change(
        &self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|&target_id| self.is_active_target(target_id, provider))
            .collect()
    }

    /// Compares the server's document count with what the client believes and
    /// repairs or resets the target on a mismatch.
    pub fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        let target_id = change.target_id;
        let expected_count = change.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document does not exist. Record a deletion so other
                // queries stop surfacing it before limbo resolution finishes.
                let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) else {
                    return;
                };
                let tombstone = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(target_id, &key, Some(tombstone), provider);
            } else {
                hard_assert(
                    expected_count == 1,
                    "single document existence filter with a count other than 0 or 1",
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, provider);
        if current_count == i64::from(expected_count) {
            return;
        }

        let status = match parse_bloom_filter(change) {
            Some(filter) => self.apply_bloom_filter(&filter, change, current_count, provider),
            None => BloomFilterApplication::Skipped,
        };
        log::debug!(
            "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}, bloom filter {status:?}"
        );
        if status != BloomFilterApplication::Success {
            self.reset_target(target_id, provider);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        filter: &BloomFilter,
        change: &ExistenceFilterChange,
        current_count: i64,
        provider: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplication {
        let removed = self.filter_removed_documents(filter, change.target_id, provider);
        if i64::from(change.count) == current_count - removed {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every known document the filter proves is gone. Returns how many
    /// were removed.
    fn filter_removed_documents(
        &mut self,
        filter: &BloomFilter,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> i64 {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            let name = self.database_id.document_name(&key);
            if !filter.might_contain(&name) {
                self.remove_document_from_target(target_id, &key, None, provider);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything seen since the last snapshot and resets
    /// the pending document state.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        provider: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            let document_key = if current && target_data.target.is_document_target() {
                DocumentKey::from_path(target_data.target.path.clone()).ok()
            } else {
                None
            };
            if let Some(key) = document_key {
                // A current document target that never saw its document means
                // the document does not exist; synthesize the delete so limbo
                // resolution can finish.
                let updated_by_target = self
                    .pending_document_updates_by_target
                    .get(&key)
                    .is_some_and(|targets| targets.contains(&target_id));
                if !updated_by_target && !self.target_contains_document(target_id, &key, provider) {
                    let tombstone = MutableDocument::new_no_document(key.clone(), snapshot_version);
                    self.remove_document_from_target(target_id, &key, Some(tombstone), provider);
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        // Documents referenced only by limbo targets are not kept alive by any
        // query, which garbage collection needs to know.
        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|&target_id| {
                match self.target_data_for_active_target(target_id, provider) {
                    Some(data) => data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Every listen or unlisten request expects one acknowledgement.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MutableDocument,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let key = document.key().clone();
        let kind = if self.target_contains_document(target_id, &key, provider) {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), kind);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, provider);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // Entered and left again before a snapshot was raised.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn current_document_count_for_target(
        &mut self,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.get_remote_keys_for_target(target_id).len() as i64
            + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId, provider: &dyn TargetMetadataProvider) -> bool {
        let active = self.target_data_for_active_target(target_id, provider).is_some();
        if !active {
            log::debug!("detected inactive target {target_id}");
        }
        active
    }

    /// Target data for a target that has no outstanding acknowledgements.
    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.get_target_data_for_target(target_id),
        }
    }

    /// Starts the target over and synthesizes removals for what it held. The
    /// server re-adds whatever still matches.
    fn reset_target(&mut self, target_id: TargetId, provider: &dyn TargetMetadataProvider) {
        hard_assert(
            !self
                .target_states
                .get(&target_id)
                .is_some_and(TargetState::is_pending),
            "only active targets can be reset",
        );
        self.target_states.insert(target_id, TargetState::default());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, provider);
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        provider: &dyn TargetMetadataProvider,
    ) -> bool {
        provider.get_remote_keys_for_target(target_id).contains(key)
    }
}

fn parse_bloom_filter(change: &ExistenceFilterChange) -> Option<BloomFilter> {
    let params = change.unchanged_names.as_ref()?;
    match BloomFilter::from_params(params) {
        Ok(filter) if filter.bit_count() > 0 => Some(filter),
        Ok(_) => None,
        Err(err) => {
            log::warn!("ignoring bloom filter and falling back to a full re-query: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::model::{ObjectValue, Timestamp};
    use crate::firestore::remote::watch_change::BloomFilterParams;

    #[derive(Default)]
    struct FakeMetadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl FakeMetadata {
        fn with_query_target(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            let target = Query::collection("rooms").unwrap().to_target();
            self.targets
                .insert(target_id, TargetData::new(target, target_id, TargetPurpose::Listen, 1));
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_target(mut self, target_id: TargetId, target: Target, purpose: TargetPurpose) -> Self {
            self.targets
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
            self
        }
    }

    impl TargetMetadataProvider for FakeMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn found(path: &str) -> MutableDocument {
        MutableDocument::new_found(key(path), version(1), ObjectValue::empty())
    }

    fn db() -> DatabaseId {
        DatabaseId::default("p")
    }

    fn doc_change(path: &str, updated: Vec<TargetId>) -> DocumentChange {
        DocumentChange {
            updated_target_ids: updated,
            removed_target_ids: Vec::new(),
            document: found(path),
        }
    }

    #[test]
    fn pending_targets_ignore_changes_until_acknowledged() {
        let metadata = FakeMetadata::default().with_query_target(1, &[]);
        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.record_pending_target_request(1);

        aggregator.handle_document_change(&doc_change("rooms/a", vec![1]), &metadata);
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());

        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Add, vec![1]), &metadata);
        aggregator.handle_document_change(&doc_change("rooms/a", vec![1]), &metadata);
        aggregator.handle_target_change(
            &WatchTargetChange::new(TargetChangeState::Current, vec![1]).with_resume_token(b"r1".to_vec()),
            &metadata,
        );
        let event = aggregator.create_remote_event(version(3), &metadata);
        let change = &event.target_changes[&1];
        assert!(change.current);
        assert_eq!(change.resume_token, b"r1".to_vec());
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(3));
    }

    #[test]
    fn known_documents_are_reported_as_modified_or_removed() {
        let metadata = FakeMetadata::default().with_query_target(1, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(db());

        aggregator.handle_document_change(&doc_change("rooms/a", vec![1]), &metadata);
        aggregator.handle_document_delete(
            &DocumentDelete {
                key: key("rooms/b"),
                read_time: version(4),
                removed_target_ids: vec![1],
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(5), &metadata);
        let change = &event.target_changes[&1];
        assert!(change.modified_documents.contains(&key("rooms/a")));
        assert!(change.removed_documents.contains(&key("rooms/b")));
        assert!(event.document_updates[&key("rooms/b")].is_no_document());
    }

    #[test]
    fn document_entering_and_leaving_is_dropped() {
        let metadata = FakeMetadata::default().with_query_target(1, &[]);
        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.handle_document_change(&doc_change("rooms/a", vec![1]), &metadata);
        aggregator.handle_document_remove(
            &DocumentRemove {
                key: key("rooms/a"),
                removed_target_ids: vec![1],
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        let change = &event.target_changes[&1];
        assert!(change.added_documents.is_empty());
        assert!(change.removed_documents.is_empty());
    }

    #[test]
    fn reset_removes_existing_documents() {
        let metadata = FakeMetadata::default().with_query_target(1, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Reset, vec![1]), &metadata);
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.target_changes[&1].removed_documents.contains(&key("rooms/a")));
        assert!(!event.target_changes[&1].current);
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let limbo_key = key("rooms/ghost");
        let metadata = FakeMetadata::default().with_target(
            7,
            Target::for_document(&limbo_key),
            TargetPurpose::LimboResolution,
        );
        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![7]), &metadata);
        let event = aggregator.create_remote_event(version(9), &metadata);

        let tombstone = &event.document_updates[&limbo_key];
        assert!(tombstone.is_no_document());
        assert_eq!(tombstone.version(), version(9));
        assert!(event.resolved_limbo_documents.contains(&limbo_key));
    }

    #[test]
    fn matching_existence_filter_changes_nothing() {
        let metadata = FakeMetadata::default().with_query_target(1, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: None,
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn mismatch_without_bloom_filter_resets_target() {
        let metadata = FakeMetadata::default().with_query_target(1, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: None,
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert_eq!(
            event.target_mismatches.get(&1),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(event.target_changes[&1].removed_documents.len(), 2);
    }

    #[test]
    fn bloom_filter_removes_only_missing_documents() {
        let metadata = FakeMetadata::default().with_query_target(1, &["rooms/a", "rooms/b", "rooms/c"]);
        let kept: Vec<String> = ["rooms/a", "rooms/c"]
            .iter()
            .map(|path| db().document_name(&key(path)))
            .collect();
        let filter = BloomFilter::create(512, 5, kept.iter().map(String::as_str)).unwrap();

        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 1,
                count: 2,
                unchanged_names: Some(filter.to_params()),
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.target_mismatches.is_empty());
        let removed = &event.target_changes[&1].removed_documents;
        assert_eq!(removed.iter().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
    }

    #[test]
    fn bloom_filter_false_positive_falls_back_to_reset() {
        let metadata = FakeMetadata::default().with_query_target(1, &["rooms/a", "rooms/b"]);
        // Every bit set: nothing can be proven missing.
        let saturated = BloomFilterParams {
            bitmap: BASE64_FULL.to_string(),
            padding: 0,
            hash_count: 1,
        };
        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: Some(saturated),
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert_eq!(
            event.target_mismatches.get(&1),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn undecodable_bloom_filter_is_skipped() {
        let metadata = FakeMetadata::default().with_query_target(1, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(db());
        aggregator.handle_existence_filter(
            &ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: Some(BloomFilterParams {
                    bitmap: "%%%".to_string(),
                    padding: 0,
                    hash_count: 1,
                }),
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert_eq!(
            event.target_mismatches.get(&1),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
    }

    // Two bytes of 0xff.
    const BASE64_FULL: &str = "//8=";
}
