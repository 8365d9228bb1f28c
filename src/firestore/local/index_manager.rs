use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::{FilterOperator, OrderDirection, Target};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{keys, stores, KeyRange, PersistenceTransaction};
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldPath, IndexKind, IndexOffset, IndexSegment, IndexState,
    MutableDocument, ObjectValue, ResourcePath, SnapshotVersion,
};
use crate::firestore::value::FirestoreValue;

const SEQUENCE_NUMBER_KEY: &str = "sequence_number";

/// How well the configured indexes serve a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No index covers the target.
    None,
    /// An index covers every filter and order-by field of the target.
    Full,
}

/// Indexed field values of one document.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexEntry {
    values: Vec<(FieldPath, FirestoreValue)>,
}

/// Collection-parent index plus configurable field indexes used to serve
/// queries without scanning whole collections.
#[derive(Clone, Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    pub fn new() -> Self {
        Self
    }

    /// Records that `collection_path` holds documents, so collection group
    /// queries can find it.
    pub fn add_to_collection_parent_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let parent = collection_path.without_last();
        txn.put_marker(
            stores::COLLECTION_PARENTS,
            keys::compose(&[collection_id, &keys::path(&parent)]),
        )
    }

    /// Every parent path that contains a collection named `collection_id`.
    pub fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        Ok(txn
            .scan_keys(stores::COLLECTION_PARENTS, &KeyRange::Prefix(keys::prefix(&[collection_id])))?
            .iter()
            .map(|entry| keys::decode_path(keys::last_part(entry)))
            .collect())
    }

    /// Stores `index` under a fresh id and returns it.
    pub fn add_field_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        index: &FieldIndex,
    ) -> FirestoreResult<FieldIndex> {
        let existing = self.get_field_indexes(txn, None)?;
        if let Some(found) = existing.iter().find(|candidate| candidate.same_definition(index)) {
            return Ok(found.clone());
        }
        let index_id = existing.iter().map(|index| index.index_id).max().unwrap_or(0) + 1;
        let mut stored = index.clone();
        stored.index_id = index_id;
        stored.index_state = IndexState::default();
        txn.put_json(stores::INDEX_CONFIGURATION, keys::id(index_id), &stored)?;
        log::debug!(
            "added field index {index_id} on '{}' ({} segments)",
            stored.collection_group,
            stored.segments.len()
        );
        Ok(stored)
    }

    pub fn delete_field_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        index: &FieldIndex,
    ) -> FirestoreResult<()> {
        txn.delete(stores::INDEX_CONFIGURATION, &keys::id(index.index_id))?;
        txn.delete_range(
            stores::INDEX_ENTRIES,
            &KeyRange::Prefix(keys::prefix(&[&keys::id(index.index_id)])),
        )
    }

    /// Configured indexes, optionally restricted to one collection group.
    pub fn get_field_indexes(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: Option<&str>,
    ) -> FirestoreResult<Vec<FieldIndex>> {
        Ok(txn
            .scan_json::<FieldIndex>(stores::INDEX_CONFIGURATION, &KeyRange::All)?
            .into_iter()
            .map(|(_, index)| index)
            .filter(|index| collection_group.map_or(true, |group| index.collection_group == group))
            .collect())
    }

    /// Index that fully serves `target`, preferring the one with most segments.
    pub fn get_field_index(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<FieldIndex>> {
        if target.is_document_target() {
            return Ok(None);
        }
        let Some(group) = target.collection_group_id() else {
            return Ok(None);
        };
        Ok(self
            .get_field_indexes(txn, Some(group))?
            .into_iter()
            .filter(|index| index_covers(index, target))
            .max_by_key(|index| index.segments.len()))
    }

    pub fn get_index_type(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> FirestoreResult<IndexType> {
        Ok(match self.get_field_index(txn, target)? {
            Some(_) => IndexType::Full,
            None => IndexType::None,
        })
    }

    /// Creates an index serving `target` unless one already exists.
    pub fn create_target_indexes(&self, txn: &mut PersistenceTransaction<'_>, target: &Target) -> FirestoreResult<()> {
        if target.is_document_target() || self.get_index_type(txn, target)? == IndexType::Full {
            return Ok(());
        }
        let Some(group) = target.collection_group_id() else {
            return Ok(());
        };
        let segments = build_target_segments(target);
        if segments.is_empty() {
            return Ok(());
        }
        let index = FieldIndex::new(group, segments);
        log::debug!("creating index for target '{}'", target.canonical_id());
        self.add_field_index(txn, &index)?;
        Ok(())
    }

    /// Keys whose index entries satisfy the target's filters, or `None` when no
    /// index serves the target. The result may include documents the target's
    /// bounds or limit later exclude.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<Vec<DocumentKey>>> {
        let Some(index) = self.get_field_index(txn, target)? else {
            return Ok(None);
        };
        let prefix = keys::prefix(&[&keys::id(index.index_id)]);
        let mut result = Vec::new();
        for (entry_key, entry) in txn.scan_json::<IndexEntry>(stores::INDEX_ENTRIES, &KeyRange::Prefix(prefix))? {
            let Some(key) = keys::decode_document(keys::last_part(&entry_key)) else {
                continue;
            };
            if !collection_matches(target, &key) {
                continue;
            }
            let mut data = ObjectValue::empty();
            for (field, value) in entry.values {
                data.set(&field, value);
            }
            let partial = MutableDocument::new_found(key.clone(), SnapshotVersion::min(), data);
            if target.filters.iter().all(|filter| filter.matches(&partial)) {
                result.push(key);
            }
        }
        Ok(Some(result))
    }

    /// Offset up to which the index serving `target` is complete.
    pub fn get_min_offset(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> FirestoreResult<IndexOffset> {
        Ok(self
            .get_field_index(txn, target)?
            .map(|index| index.index_state.offset)
            .unwrap_or_else(IndexOffset::none))
    }

    /// Smallest offset over the indexes of `collection_group`.
    pub fn get_min_offset_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
    ) -> FirestoreResult<IndexOffset> {
        Ok(self
            .get_field_indexes(txn, Some(collection_group))?
            .into_iter()
            .map(|index| index.index_state.offset)
            .min()
            .unwrap_or_else(IndexOffset::none))
    }

    /// Collection group whose indexes were updated least recently.
    pub fn get_next_collection_group_to_update(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<Option<String>> {
        Ok(self
            .get_field_indexes(txn, None)?
            .into_iter()
            .min_by_key(|index| (index.index_state.sequence_number, index.index_id))
            .map(|index| index.collection_group))
    }

    /// Rewrites the index entries of `documents` for every index on their
    /// collection group.
    pub fn update_index_entries(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<()> {
        let mut indexes_by_group: BTreeMap<String, Vec<FieldIndex>> = BTreeMap::new();
        for (key, document) in documents {
            let group = key.collection_group().to_string();
            if !indexes_by_group.contains_key(&group) {
                let indexes = self.get_field_indexes(txn, Some(&group))?;
                indexes_by_group.insert(group.clone(), indexes);
            }
            for index in indexes_by_group.get(&group).into_iter().flatten() {
                let entry_key = keys::compose(&[&keys::id(index.index_id), &keys::document(key)]);
                match index_entry_for(index, document) {
                    Some(entry) => txn.put_json(stores::INDEX_ENTRIES, entry_key, &entry)?,
                    None => txn.delete(stores::INDEX_ENTRIES, &entry_key)?,
                }
            }
        }
        Ok(())
    }

    /// Advances every index of `collection_group` to `offset`.
    pub fn update_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: IndexOffset,
    ) -> FirestoreResult<()> {
        let sequence_number: i64 = txn
            .get_json(stores::INDEX_GLOBALS, SEQUENCE_NUMBER_KEY)?
            .unwrap_or(0)
            + 1;
        txn.put_json(stores::INDEX_GLOBALS, SEQUENCE_NUMBER_KEY.to_string(), &sequence_number)?;
        for mut index in self.get_field_indexes(txn, Some(collection_group))? {
            index.index_state = IndexState {
                sequence_number,
                offset: offset.clone(),
            };
            txn.put_json(stores::INDEX_CONFIGURATION, keys::id(index.index_id), &index)?;
        }
        Ok(())
    }
}

fn collection_matches(target: &Target, key: &DocumentKey) -> bool {
    match &target.collection_group {
        Some(group) => key.has_collection_id(group) && target.path.is_prefix_of(key.path()),
        None => target.path.is_immediate_parent_of(key.path()),
    }
}

fn segment_for(index: &FieldIndex, field: &FieldPath, kind: Option<IndexKind>) -> bool {
    index.segments.iter().any(|segment| {
        segment.field_path == *field
            && match kind {
                Some(IndexKind::Contains) => segment.kind == IndexKind::Contains,
                _ => segment.kind != IndexKind::Contains,
            }
    })
}

fn index_covers(index: &FieldIndex, target: &Target) -> bool {
    let filters_covered = target.filters.iter().all(|filter| {
        let field = filter.field();
        if field.is_key_field() {
            return true;
        }
        match filter.operator() {
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny => {
                segment_for(index, field, Some(IndexKind::Contains))
            }
            _ => segment_for(index, field, None),
        }
    });
    let orders_covered = target
        .order_by
        .iter()
        .all(|order| order.field().is_key_field() || segment_for(index, order.field(), None));
    filters_covered && orders_covered
}

fn build_target_segments(target: &Target) -> Vec<IndexSegment> {
    let mut seen = BTreeSet::new();
    let mut segments = Vec::new();
    let mut push = |segments: &mut Vec<IndexSegment>, field: &FieldPath, kind: IndexKind| {
        if field.is_key_field() || !seen.insert((field.canonical_string(), kind == IndexKind::Contains)) {
            return;
        }
        segments.push(IndexSegment::new(field.clone(), kind));
    };

    let mut has_array_segment = false;
    for filter in &target.filters {
        match filter.operator() {
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny => {
                if !has_array_segment {
                    push(&mut segments, filter.field(), IndexKind::Contains);
                    has_array_segment = true;
                }
            }
            _ if !filter.is_inequality() => push(&mut segments, filter.field(), IndexKind::Ascending),
            _ => {}
        }
    }
    for filter in target.filters.iter().filter(|filter| filter.is_inequality()) {
        push(&mut segments, filter.field(), IndexKind::Ascending);
    }
    for order in &target.order_by {
        let kind = match order.direction() {
            OrderDirection::Ascending => IndexKind::Ascending,
            OrderDirection::Descending => IndexKind::Descending,
        };
        push(&mut segments, order.field(), kind);
    }
    segments
}

/// Entry for `document`, or `None` when it lacks a field the index needs.
fn index_entry_for(index: &FieldIndex, document: &MutableDocument) -> Option<IndexEntry> {
    if !document.is_found_document() {
        return None;
    }
    let mut values = Vec::with_capacity(index.segments.len());
    for segment in &index.segments {
        let value = document.field(&segment.field_path)?;
        if segment.kind == IndexKind::Contains && value.as_array().is_none() {
            return None;
        }
        values.push((segment.field_path.clone(), value.clone()));
    }
    Some(IndexEntry { values })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::{FieldFilter, OrderBy, Query};
    use crate::firestore::local::persistence::{MemoryKvStore, Persistence, TransactionMode};

    fn doc(path: &str, score: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(
            &FieldPath::from_dot_separated("score").unwrap(),
            FirestoreValue::from_integer(score),
        );
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn score_query(min: i64) -> Query {
        let score = FieldPath::from_dot_separated("score").unwrap();
        Query::collection("games")
            .unwrap()
            .with_filter(FieldFilter::new(
                score.clone(),
                FilterOperator::GreaterThan,
                FirestoreValue::from_integer(min),
            ))
            .with_order_by(OrderBy::descending(score))
    }

    #[test]
    fn tracks_collection_parents() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()));
        let manager = IndexManager::new();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                manager.add_to_collection_parent_index(txn, &ResourcePath::from_string("rooms/a/messages")?)?;
                manager.add_to_collection_parent_index(txn, &ResourcePath::from_string("rooms/b/messages")?)?;
                manager.add_to_collection_parent_index(txn, &ResourcePath::from_string("messages")?)?;
                let parents = manager.get_collection_parents(txn, "messages")?;
                assert_eq!(parents.len(), 3);
                assert!(parents.contains(&ResourcePath::root()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn auto_created_index_serves_matching_target() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()));
        let manager = IndexManager::new();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                let target = score_query(5).to_target();
                assert_eq!(manager.get_index_type(txn, &target)?, IndexType::None);
                manager.create_target_indexes(txn, &target)?;
                assert_eq!(manager.get_index_type(txn, &target)?, IndexType::Full);
                // A second call finds the existing index.
                manager.create_target_indexes(txn, &target)?;
                assert_eq!(manager.get_field_indexes(txn, Some("games"))?.len(), 1);

                let documents: BTreeMap<_, _> = [doc("games/a", 3), doc("games/b", 8), doc("games/c", 9)]
                    .into_iter()
                    .map(|doc| (doc.key().clone(), doc))
                    .collect();
                manager.update_index_entries(txn, &documents)?;
                let matched = manager.get_documents_matching_target(txn, &target)?.unwrap();
                let ids: Vec<_> = matched.iter().map(|key| key.id().to_string()).collect();
                assert_eq!(ids, vec!["b", "c"]);

                let offset = IndexOffset::from_document(&doc("games/c", 9));
                manager.update_collection_group(txn, "games", offset.clone())?;
                assert_eq!(manager.get_min_offset(txn, &target)?, offset);
                Ok(())
            })
            .unwrap();
    }
}
