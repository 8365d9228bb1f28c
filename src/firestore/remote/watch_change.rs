use crate::firestore::error::{map_rpc_code, FirestoreError};
use crate::firestore::local::TargetId;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// One message from the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// Global snapshot version carried by the change.
    ///
    /// Only a target change that names no targets marks a consistent snapshot
    /// across every target; all other changes report the minimum version.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change) if change.target_ids.is_empty() => {
                change.read_time.unwrap_or_else(SnapshotVersion::min)
            }
            _ => SnapshotVersion::min(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "every active target".
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: None,
            cause: None,
        }
    }

    /// Global "everything is consistent at `version`" marker.
    pub fn global_snapshot(version: SnapshotVersion, resume_token: impl Into<Vec<u8>>) -> Self {
        Self {
            state: TargetChangeState::NoChange,
            target_ids: Vec::new(),
            resume_token: resume_token.into(),
            read_time: Some(version),
            cause: None,
        }
    }

    /// Server-side removal of targets because of an RPC status.
    pub fn removed_with_status(
        target_ids: Vec<TargetId>,
        code: i32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            cause: Some(FirestoreError::new(map_rpc_code(code), message)),
            ..Self::new(TargetChangeState::Remove, target_ids)
        }
    }

    pub fn with_resume_token(mut self, resume_token: impl Into<Vec<u8>>) -> Self {
        self.resume_token = resume_token.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A document that now matches `updated_target_ids` and no longer matches
/// `removed_target_ids`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub document: MutableDocument,
}

/// The document was deleted at `read_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

/// The document left the targets without a known new state.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParams>,
}

/// Bloom filter over the names of the documents that still match a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterParams {
    /// Base64 text of the bit array.
    pub bitmap: String,
    pub padding: i32,
    pub hash_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::Timestamp;

    #[test]
    fn only_global_target_changes_carry_a_snapshot_version() {
        let version = SnapshotVersion::new(Timestamp::new(5, 0));
        let global = WatchChange::TargetChange(WatchTargetChange::global_snapshot(version, b"t".to_vec()));
        assert_eq!(global.snapshot_version(), version);

        let mut targeted = WatchTargetChange::new(TargetChangeState::Current, vec![1]);
        targeted.read_time = Some(version);
        assert!(WatchChange::TargetChange(targeted).snapshot_version().is_min());
    }

    #[test]
    fn removal_status_maps_to_error_code() {
        let change = WatchTargetChange::removed_with_status(vec![2], 7, "denied");
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }
}
