use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::User;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::{keys, stores, KeyRange, PersistenceTransaction};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::util::hard_assert;

const NEXT_BATCH_ID_KEY: &str = "next_batch_id";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct QueueMetadata {
    last_stream_token: Vec<u8>,
    last_acknowledged_batch_id: BatchId,
}

/// Ordered queue of mutation batches not yet acknowledged by the backend, one
/// queue per user.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_key: String,
}

impl MutationQueue {
    pub fn for_user(user: &User) -> Self {
        Self {
            user_key: user.storage_key().to_string(),
        }
    }

    fn meta_key(&self) -> String {
        keys::compose(&["user", &self.user_key])
    }

    fn batch_key(&self, batch_id: BatchId) -> String {
        keys::compose(&[&self.user_key, &keys::id(batch_id)])
    }

    fn document_prefix(&self, key: &DocumentKey) -> String {
        keys::prefix(&[&self.user_key, &keys::document(key)])
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<QueueMetadata> {
        Ok(txn
            .get_json(stores::MUTATION_META, &self.meta_key())?
            .unwrap_or(QueueMetadata {
                last_stream_token: Vec::new(),
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            }))
    }

    pub fn check_empty(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        Ok(self.get_all_mutation_batches(txn)?.is_empty())
    }

    /// Creates a batch with the next batch id and indexes it by document.
    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        hard_assert(!mutations.is_empty(), "mutation batches must not be empty");
        let batch_id: BatchId = txn
            .get_json(stores::MUTATION_META, NEXT_BATCH_ID_KEY)?
            .unwrap_or(1);
        txn.put_json(stores::MUTATION_META, NEXT_BATCH_ID_KEY.to_string(), &(batch_id + 1))?;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        txn.put_json(stores::MUTATIONS, self.batch_key(batch_id), &batch)?;
        for key in batch.keys() {
            let index_key = keys::compose(&[&self.user_key, &keys::document(&key), &keys::id(batch_id)]);
            txn.put_marker(stores::DOCUMENT_MUTATIONS, index_key)?;
        }
        log::debug!("queued mutation batch {batch_id} for '{}'", self.user_key);
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        txn.get_json(stores::MUTATIONS, &self.batch_key(batch_id))
    }

    /// First batch with an id greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let start = self.batch_key(batch_id.max(BATCH_ID_UNKNOWN) + 1);
        let end = keys::prefix(&[&self.user_key, "\u{7f}"]);
        let range = KeyRange::Between(start, end);
        Ok(txn
            .scan_json::<MutationBatch>(stores::MUTATIONS, &range)?
            .into_iter()
            .map(|(_, batch)| batch)
            .next())
    }

    pub fn get_highest_unacknowledged_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<BatchId> {
        Ok(self
            .get_all_mutation_batches(txn)?
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn get_all_mutation_batches(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(txn
            .scan_json::<MutationBatch>(stores::MUTATIONS, &KeyRange::Prefix(keys::prefix(&[&self.user_key])))?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut keys = BTreeSet::new();
        keys.insert(key.clone());
        self.get_all_mutation_batches_affecting_document_keys(txn, &keys)
    }

    /// Batches touching any of `document_keys`, in batch id order.
    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction<'_>,
        document_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batch_ids = BTreeSet::new();
        for key in document_keys {
            for index_key in txn.scan_keys(stores::DOCUMENT_MUTATIONS, &KeyRange::Prefix(self.document_prefix(key)))? {
                let batch_id = keys::last_part(&index_key)
                    .parse::<BatchId>()
                    .map_err(|_| internal_error(format!("corrupt mutation index key {index_key:?}")))?;
                batch_ids.insert(batch_id);
            }
        }
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => {
                    return Err(internal_error(format!(
                        "document mutation index refers to missing batch {batch_id}"
                    )))
                }
            }
        }
        Ok(batches)
    }

    /// Whether any queued batch touches `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(!txn
            .scan_keys(stores::DOCUMENT_MUTATIONS, &KeyRange::Prefix(self.document_prefix(key)))?
            .is_empty())
    }

    /// Removes `batch`, which must be the head of the queue, together with its
    /// document index entries.
    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let key = self.batch_key(batch.batch_id);
        hard_assert(
            txn.contains(stores::MUTATIONS, &key)?,
            "attempted to remove a mutation batch that is not queued",
        );
        let head = self.get_next_mutation_batch_after_batch_id(txn, BATCH_ID_UNKNOWN)?;
        hard_assert(
            head.map(|head| head.batch_id) == Some(batch.batch_id),
            "can only remove the first entry of the mutation queue",
        );
        txn.delete(stores::MUTATIONS, &key)?;
        for document in batch.keys() {
            let index_key =
                keys::compose(&[&self.user_key, &keys::document(&document), &keys::id(batch.batch_id)]);
            txn.delete(stores::DOCUMENT_MUTATIONS, &index_key)?;
        }
        Ok(())
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        hard_assert(
            batch.batch_id > metadata.last_acknowledged_batch_id,
            "mutation batches must be acknowledged in order",
        );
        metadata.last_acknowledged_batch_id = batch.batch_id;
        metadata.last_stream_token = stream_token;
        txn.put_json(stores::MUTATION_META, self.meta_key(), &metadata)
    }

    pub fn get_last_stream_token(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<Vec<u8>> {
        Ok(self.metadata(txn)?.last_stream_token)
    }

    pub fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = stream_token;
        txn.put_json(stores::MUTATION_META, self.meta_key(), &metadata)
    }

    /// Verifies the document index only refers to queued batches.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let mut known: BTreeMap<BatchId, ()> = BTreeMap::new();
        for batch in self.get_all_mutation_batches(txn)? {
            known.insert(batch.batch_id, ());
        }
        for index_key in txn.scan_keys(stores::DOCUMENT_MUTATIONS, &KeyRange::Prefix(keys::prefix(&[&self.user_key])))? {
            let batch_id = keys::last_part(&index_key).parse::<BatchId>().unwrap_or(BATCH_ID_UNKNOWN);
            hard_assert(
                known.contains_key(&batch_id),
                "document mutation index refers to a removed batch",
            );
        }
        Ok(())
    }
}
