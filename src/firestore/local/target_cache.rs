use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::{Target, TargetIdGenerator};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{keys, stores, KeyRange, PersistenceTransaction};
use crate::firestore::local::{ListenSequenceNumber, TargetData, TargetId};
use crate::firestore::model::{DocumentKey, SnapshotVersion};
use crate::util::hard_assert;

const GLOBALS_KEY: &str = "globals";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TargetGlobals {
    highest_target_id: TargetId,
    highest_listen_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
    target_count: u64,
}

/// Persisted targets, their resume state and the documents each target matches.
#[derive(Clone, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    fn globals(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<TargetGlobals> {
        Ok(txn.get_json(stores::TARGET_GLOBALS, GLOBALS_KEY)?.unwrap_or_default())
    }

    fn save_globals(&self, txn: &mut PersistenceTransaction<'_>, globals: &TargetGlobals) -> FirestoreResult<()> {
        txn.put_json(stores::TARGET_GLOBALS, GLOBALS_KEY.to_string(), globals)
    }

    pub fn get_last_remote_snapshot_version(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<SnapshotVersion> {
        Ok(self.globals(txn)?.last_remote_snapshot_version)
    }

    pub fn set_last_remote_snapshot_version(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let mut globals = self.globals(txn)?;
        globals.last_remote_snapshot_version = version;
        self.save_globals(txn, &globals)
    }

    pub fn get_highest_sequence_number(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.globals(txn)?.highest_listen_sequence_number)
    }

    /// Returns the next listen sequence number and records it as the highest.
    pub fn next_sequence_number(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<ListenSequenceNumber> {
        let mut globals = self.globals(txn)?;
        globals.highest_listen_sequence_number += 1;
        self.save_globals(txn, &globals)?;
        Ok(globals.highest_listen_sequence_number)
    }

    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<TargetId> {
        let mut globals = self.globals(txn)?;
        let target_id = TargetIdGenerator::for_target_cache(globals.highest_target_id).next();
        globals.highest_target_id = target_id;
        self.save_globals(txn, &globals)?;
        Ok(target_id)
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<u64> {
        Ok(self.globals(txn)?.target_count)
    }

    pub fn add_target_data(&self, txn: &mut PersistenceTransaction<'_>, data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, data)?;
        let mut globals = self.globals(txn)?;
        globals.target_count += 1;
        self.update_globals_for(&mut globals, data);
        self.save_globals(txn, &globals)
    }

    pub fn update_target_data(&self, txn: &mut PersistenceTransaction<'_>, data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, data)?;
        let mut globals = self.globals(txn)?;
        if self.update_globals_for(&mut globals, data) {
            self.save_globals(txn, &globals)?;
        }
        Ok(())
    }

    /// Deletes `data` and every matching key recorded for it.
    pub fn remove_target_data(&self, txn: &mut PersistenceTransaction<'_>, data: &TargetData) -> FirestoreResult<()> {
        let target_key = keys::id(data.target_id);
        hard_assert(
            txn.contains(stores::TARGETS, &target_key)?,
            "attempted to remove a target that is not cached",
        );
        self.remove_matching_keys_for_target_id(txn, data.target_id)?;
        txn.delete(stores::TARGETS, &target_key)?;
        txn.delete(
            stores::TARGET_IDS_BY_CANONICAL_ID,
            &keys::compose(&[&data.target.canonical_id(), &target_key]),
        )?;
        let mut globals = self.globals(txn)?;
        globals.target_count = globals.target_count.saturating_sub(1);
        self.save_globals(txn, &globals)
    }

    fn save_target_data(&self, txn: &mut PersistenceTransaction<'_>, data: &TargetData) -> FirestoreResult<()> {
        let target_key = keys::id(data.target_id);
        txn.put_json(stores::TARGETS, target_key.clone(), data)?;
        txn.put_marker(
            stores::TARGET_IDS_BY_CANONICAL_ID,
            keys::compose(&[&data.target.canonical_id(), &target_key]),
        )
    }

    fn update_globals_for(&self, globals: &mut TargetGlobals, data: &TargetData) -> bool {
        let mut updated = false;
        if data.target_id > globals.highest_target_id {
            globals.highest_target_id = data.target_id;
            updated = true;
        }
        if data.sequence_number > globals.highest_listen_sequence_number {
            globals.highest_listen_sequence_number = data.sequence_number;
            updated = true;
        }
        updated
    }

    /// Cached data for a target equal to `target`. Targets sharing a canonical
    /// id are told apart by full comparison.
    pub fn get_target_data(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let prefix = keys::prefix(&[&target.canonical_id()]);
        for index_key in txn.scan_keys(stores::TARGET_IDS_BY_CANONICAL_ID, &KeyRange::Prefix(prefix))? {
            let target_key = keys::last_part(&index_key);
            if let Some(data) = txn.get_json::<TargetData>(stores::TARGETS, target_key)? {
                if data.target == *target {
                    return Ok(Some(data));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_by_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        txn.get_json(stores::TARGETS, &keys::id(target_id))
    }

    pub fn add_matching_keys<'k, I>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        document_keys: I,
        target_id: TargetId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let target_key = keys::id(target_id);
        for key in document_keys {
            let document = keys::document(key);
            txn.put_marker(stores::TARGET_DOCUMENTS, keys::compose(&[&target_key, &document]))?;
            txn.put_marker(stores::DOCUMENT_TARGETS, keys::compose(&[&document, &target_key]))?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k, I>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        document_keys: I,
        target_id: TargetId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let target_key = keys::id(target_id);
        for key in document_keys {
            let document = keys::document(key);
            txn.delete(stores::TARGET_DOCUMENTS, &keys::compose(&[&target_key, &document]))?;
            txn.delete(stores::DOCUMENT_TARGETS, &keys::compose(&[&document, &target_key]))?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let matching = self.get_matching_keys_for_target_id(txn, target_id)?;
        self.remove_matching_keys(txn, &matching, target_id)
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let prefix = keys::prefix(&[&keys::id(target_id)]);
        Ok(txn
            .scan_keys(stores::TARGET_DOCUMENTS, &KeyRange::Prefix(prefix))?
            .iter()
            .filter_map(|entry| keys::decode_document(keys::last_part(entry)))
            .collect())
    }

    /// Whether any cached target matches `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        let prefix = keys::prefix(&[&keys::document(key)]);
        Ok(!txn
            .scan_keys(stores::DOCUMENT_TARGETS, &KeyRange::Prefix(prefix))?
            .is_empty())
    }
}
