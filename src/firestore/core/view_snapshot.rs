use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{DocumentSet, Query};
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::util::hard_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Order in which changes are reported: removals first, then additions, then
    /// modifications.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

/// Collapses successive changes to the same document into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                hard_assert(
                    false,
                    format!("unsupported change {new_type:?} after {old_type:?} for {key}"),
                );
                None
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// Query results at one point in time, plus the changes since the previous
/// snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    /// Set when a listener dropped metadata-only changes from this snapshot.
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot that reports every document as newly added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_documents = DocumentSet::new(documents.comparator().clone());
        Self {
            query,
            documents,
            old_documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;

    fn change(change_type: ChangeType, path: &str) -> DocumentViewChange {
        DocumentViewChange {
            change_type,
            document: MutableDocument::new_no_document(
                DocumentKey::from_string(path).unwrap(),
                SnapshotVersion::min(),
            ),
        }
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "rooms/a"));
        set.track(change(ChangeType::Removed, "rooms/a"));
        assert!(set.changes().is_empty());
    }

    #[test]
    fn removed_then_added_is_modified() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, "rooms/a"));
        set.track(change(ChangeType::Added, "rooms/a"));
        assert_eq!(set.changes()[0].change_type, ChangeType::Modified);
    }

    #[test]
    fn metadata_keeps_earlier_change_type() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "rooms/a"));
        set.track(change(ChangeType::Metadata, "rooms/a"));
        assert_eq!(set.changes()[0].change_type, ChangeType::Added);
    }
}
