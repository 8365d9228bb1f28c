use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{BatchId, DocumentKey, FieldPath, MutableDocument, SnapshotVersion};
use crate::firestore::model::mutation_batch::BATCH_ID_UNKNOWN;

/// Index id used for indexes that were not persisted yet.
pub const UNKNOWN_INDEX_ID: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// Position in the remote document cache up to which an index is complete.
///
/// Offsets order by read time, then document key, then batch id. A missing key
/// sorts before every document read at the same time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: Option<DocumentKey>,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    pub fn none() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            document_key: None,
            largest_batch_id: BATCH_ID_UNKNOWN,
        }
    }

    pub fn new(read_time: SnapshotVersion, document_key: Option<DocumentKey>, largest_batch_id: BatchId) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    /// Offset that points just past `document`.
    pub fn from_document(document: &MutableDocument) -> Self {
        Self::new(
            document.read_time(),
            Some(document.key().clone()),
            BATCH_ID_UNKNOWN,
        )
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub sequence_number: i64,
    pub offset: IndexOffset,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            sequence_number: 0,
            offset: IndexOffset::none(),
        }
    }
}

/// Index over one collection group, made of ordered field segments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub index_state: IndexState,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: UNKNOWN_INDEX_ID,
            collection_group: collection_group.into(),
            segments,
            index_state: IndexState::default(),
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::Contains)
    }

    /// Indexes are equal in shape when they cover the same group and segments.
    pub fn same_definition(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    #[test]
    fn offsets_order_by_read_time_then_key() {
        let early = IndexOffset::new(SnapshotVersion::new(Timestamp::new(1, 0)), None, -1);
        let keyed = IndexOffset::new(
            SnapshotVersion::new(Timestamp::new(1, 0)),
            Some(DocumentKey::from_string("rooms/a").unwrap()),
            -1,
        );
        let late = IndexOffset::new(SnapshotVersion::new(Timestamp::new(2, 0)), None, -1);
        assert!(IndexOffset::none() < early);
        assert!(early < keyed);
        assert!(keyed < late);
    }
}
