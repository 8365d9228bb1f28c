use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::core::{DocumentSet, LimitType, OnlineState, Query};
use crate::firestore::local::QueryResult;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::TargetChange;
use crate::util::hard_assert;

/// Result of [`View::compute_doc_changes`], fed back into
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// Set when a limit query lost documents and must be recomputed from the
    /// local store to find replacements.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added,
    Removed,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<(LimboDocumentChange, DocumentKey)>,
}

/// Incrementally maintained result set of one query.
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    has_cached_results: bool,
    /// Whether the backend reported the target as current.
    current: bool,
    document_set: DocumentSet,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    /// Keys the backend says match the target.
    synced_documents: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::for_query(&query);
        Self {
            query,
            sync_state: None,
            has_cached_results: false,
            current: false,
            document_set,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            synced_documents,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Whether the last applied change left the view current and limbo free.
    pub fn is_synced(&self) -> bool {
        self.sync_state == Some(SyncState::Synced)
    }

    pub fn set_has_cached_results(&mut self, has_cached_results: bool) {
        self.has_cached_results = has_cached_results;
    }

    /// Computes the effect of `changes` on the view without applying it.
    ///
    /// Passing `previous` continues from an earlier computation, which is how a
    /// limit query is refilled after [`ViewDocumentChanges::needs_refill`].
    pub fn compute_doc_changes<'a, I>(
        &self,
        changes: I,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges
    where
        I: IntoIterator<Item = &'a MutableDocument>,
    {
        let refilling = previous.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(old_document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for entry in changes {
            let key = entry.key();
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations =
                old_doc.map(|doc| self.mutated_keys.contains(doc.key())).unwrap_or(false);
            let new_doc_has_pending_mutations = new_doc
                .map(|doc| {
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new_doc.clone(),
                            });
                            change_applied = true;

                            let past_last = last_doc_in_limit.as_ref().is_some_and(|last| {
                                self.query.compare(new_doc, last) == Ordering::Greater
                            });
                            let before_first = first_doc_in_limit.as_ref().is_some_and(|first| {
                                self.query.compare(new_doc, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                // The document moved out of the limit window; a
                                // document we have not loaded might take its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set.insert(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key.clone());
                        } else {
                            new_mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_document_set.remove(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_document_set.last().cloned(),
                    LimitType::Last => new_document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                new_document_set.remove(evicted.key());
                new_mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        hard_assert(
            !needs_refill || !refilling,
            "View was refilled using docs that themselves needed refilling",
        );

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    /// Applies computed changes and returns the snapshot to raise, if any.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        hard_assert(
            !doc_changes.needs_refill,
            "Cannot apply changes that need a refill",
        );
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .rank()
                .cmp(&right.change_type.rank())
                .then_with(|| self.query.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            document_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change
                .map(|change| !change.resume_token.is_empty())
                .unwrap_or(false),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline drops the view back to "not current" so that listeners see
    /// cached results flagged as such.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    /// Resets the view to persisted query results, e.g. after a user change.
    pub fn synchronize_with_persisted_state(&mut self, query_result: &QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys.clone();
        self.limbo_documents.clear();
        let changes = self.compute_doc_changes(query_result.documents.values(), None);
        self.apply_changes(changes, true, None, false)
    }

    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
            self.has_cached_results,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            hard_assert(
                self.synced_documents.contains(key),
                format!("Modified document {key} not found in view"),
            );
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes explain why the document is in the view.
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<(LimboDocumentChange, DocumentKey)> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .map(|document| document.key())
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes = Vec::new();
        for key in old_limbo.difference(&new_limbo) {
            changes.push((LimboDocumentChange::Removed, key.clone()));
        }
        for key in new_limbo.difference(&old_limbo) {
            changes.push((LimboDocumentChange::Added, key.clone()));
        }
        self.limbo_documents = new_limbo;
        changes
    }
}

// Avoid flickering a locally written value back to its committed-but-not-yet-
// synced server version.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::OrderBy;
    use crate::firestore::model::{FieldPath, ObjectValue, SnapshotVersion, Timestamp};
    use crate::firestore::value::FirestoreValue;

    fn score_field() -> FieldPath {
        FieldPath::from_dot_separated("score").unwrap()
    }

    fn scored(id: &str, score: i64, version: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&score_field(), FirestoreValue::from_integer(score));
        MutableDocument::new_found(
            DocumentKey::from_string(&format!("players/{id}")).unwrap(),
            SnapshotVersion::new(Timestamp::new(version, 0)),
            data,
        )
    }

    fn ids(set: &DocumentSet) -> Vec<String> {
        set.iter().map(|doc| doc.key().id().to_string()).collect()
    }

    fn top_two() -> Query {
        Query::collection("players")
            .unwrap()
            .with_order_by(OrderBy::descending(score_field()))
            .with_limit_to_first(2)
    }

    #[test]
    fn limit_query_swaps_documents_when_scores_change() {
        let mut view = View::new(top_two(), BTreeSet::new());
        let initial = [scored("a", 10, 1), scored("b", 7, 1), scored("c", 5, 1)];
        let changes = view.compute_doc_changes(initial.iter(), None);
        assert!(!changes.needs_refill);
        view.apply_changes(changes, false, None, false);

        let update = [scored("c", 12, 2)];
        let changes = view.compute_doc_changes(update.iter(), None);
        assert!(!changes.needs_refill);
        let snapshot = view
            .apply_changes(changes, false, None, false)
            .snapshot
            .expect("snapshot");

        assert_eq!(ids(&snapshot.documents), vec!["c", "a"]);
        let kinds: Vec<(ChangeType, String)> = snapshot
            .document_changes
            .iter()
            .map(|change| (change.change_type, change.document.key().id().to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeType::Removed, "b".to_string()),
                (ChangeType::Added, "c".to_string()),
            ]
        );
    }

    #[test]
    fn removing_from_full_limit_needs_refill() {
        let mut view = View::new(top_two(), BTreeSet::new());
        let initial = [scored("a", 10, 1), scored("b", 7, 1)];
        let changes = view.compute_doc_changes(initial.iter(), None);
        view.apply_changes(changes, false, None, false);

        let deleted = [MutableDocument::new_no_document(
            DocumentKey::from_string("players/a").unwrap(),
            SnapshotVersion::new(Timestamp::new(2, 0)),
        )];
        let changes = view.compute_doc_changes(deleted.iter(), None);
        assert!(changes.needs_refill);
    }

    #[test]
    fn limit_holds_highest_documents_after_many_changes() {
        let mut view = View::new(top_two(), BTreeSet::new());
        let mut store = std::collections::BTreeMap::new();
        let mut version = 1;
        for (id, score) in [("a", 1), ("b", 9), ("c", 4), ("d", 7), ("b", 2), ("e", 8)] {
            version += 1;
            let update = scored(id, score, version);
            store.insert(update.key().clone(), update.clone());
            let mut changes = view.compute_doc_changes([&update], None);
            if changes.needs_refill {
                changes = view.compute_doc_changes(store.values(), Some(changes));
            }
            view.apply_changes(changes, false, None, false);
        }
        let snapshot = view.compute_initial_snapshot();
        assert_eq!(ids(&snapshot.documents), vec!["e", "d"]);
    }

    #[test]
    fn limbo_tracks_unsynced_documents_once_current() {
        let query = Query::collection("players").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let docs = [scored("a", 1, 1)];
        let changes = view.compute_doc_changes(docs.iter(), None);
        let target_change = TargetChange {
            current: true,
            ..Default::default()
        };
        let result = view.apply_changes(changes, true, Some(&target_change), false);
        assert_eq!(
            result.limbo_changes,
            vec![(
                LimboDocumentChange::Added,
                DocumentKey::from_string("players/a").unwrap()
            )]
        );
        let snapshot = result.snapshot.expect("snapshot");
        assert!(snapshot.from_cache);
    }

    #[test]
    fn going_offline_marks_snapshot_from_cache() {
        let query = Query::collection("players").unwrap();
        let mut view = View::new(query, BTreeSet::new());
        let target_change = TargetChange {
            current: true,
            ..Default::default()
        };
        let changes = view.compute_doc_changes(std::iter::empty(), None);
        let first = view.apply_changes(changes, true, Some(&target_change), false);
        assert!(!first.snapshot.expect("snapshot").from_cache);

        let offline = view.apply_online_state_change(OnlineState::Offline);
        assert!(offline.snapshot.expect("snapshot").from_cache);
    }
}
