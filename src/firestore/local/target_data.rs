use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::Target;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch.
    ExistenceFilterMismatch,
    /// Re-listen after a mismatch the bloom filter could not repair.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

/// Everything the client tracks about one active target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Latest version at which the target was known to be consistent.
    pub snapshot_version: SnapshotVersion,
    /// Version at which the view for this target last had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Documents the server is expected to report on resume, sent with the
    /// listen request when resuming with a token.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// Copy with a new resume token; clears the expected count.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}

/// Documents matching a query plus the keys the server considers part of it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    pub remote_keys: BTreeSet<DocumentKey>,
}
