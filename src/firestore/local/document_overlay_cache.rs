use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::User;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{keys, stores, KeyRange, PersistenceTransaction};
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Per-user cache of the mutation that turns each remote document into its
/// local view.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_key: String,
}

impl DocumentOverlayCache {
    pub fn for_user(user: &User) -> Self {
        Self {
            user_key: user.storage_key().to_string(),
        }
    }

    fn overlay_key(&self, key: &DocumentKey) -> String {
        keys::compose(&[&self.user_key, &keys::document(key)])
    }

    fn batch_index_key(&self, batch_id: BatchId, key: &DocumentKey) -> String {
        keys::compose(&[&self.user_key, &keys::id(batch_id), &keys::document(key)])
    }

    pub fn get_overlay(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Overlay>> {
        txn.get_json(stores::DOCUMENT_OVERLAYS, &self.overlay_key(key))
    }

    pub fn get_overlays<'k, I>(
        &self,
        txn: &PersistenceTransaction<'_>,
        document_keys: I,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut result = BTreeMap::new();
        for key in document_keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                result.insert(key.clone(), overlay);
            }
        }
        Ok(result)
    }

    /// Stores `overlays`, all produced by batches up to `largest_batch_id`,
    /// replacing earlier overlays for the same documents.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for (key, mutation) in overlays {
            if let Some(existing) = self.get_overlay(txn, &key)? {
                txn.delete(
                    stores::OVERLAYS_BY_BATCH,
                    &self.batch_index_key(existing.largest_batch_id, &key),
                )?;
            }
            let overlay = Overlay::new(largest_batch_id, mutation);
            txn.put_json(stores::DOCUMENT_OVERLAYS, self.overlay_key(&key), &overlay)?;
            txn.put_marker(stores::OVERLAYS_BY_BATCH, self.batch_index_key(largest_batch_id, &key))?;
        }
        Ok(())
    }

    /// Removes overlays for `document_keys` that were written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        document_keys: &BTreeSet<DocumentKey>,
        batch_id: BatchId,
    ) -> FirestoreResult<()> {
        for key in document_keys {
            let Some(overlay) = self.get_overlay(txn, key)? else {
                continue;
            };
            if overlay.largest_batch_id == batch_id {
                txn.delete(stores::DOCUMENT_OVERLAYS, &self.overlay_key(key))?;
                txn.delete(stores::OVERLAYS_BY_BATCH, &self.batch_index_key(batch_id, key))?;
            }
        }
        Ok(())
    }

    /// Overlays of documents directly inside `collection` written after
    /// `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let prefix = format!(
            "{}{}",
            keys::prefix(&[&self.user_key]),
            keys::children_prefix(collection)
        );
        let mut result = BTreeMap::new();
        for (_, overlay) in txn.scan_json::<Overlay>(stores::DOCUMENT_OVERLAYS, &KeyRange::Prefix(prefix))? {
            let key = overlay.key().clone();
            if collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id > since_batch_id {
                result.insert(key, overlay);
            }
        }
        Ok(result)
    }

    /// Overlays in `collection_group` newer than `since_batch_id`, returned a
    /// whole batch at a time until at least `count` overlays are collected.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let mut by_batch: BTreeMap<BatchId, Vec<Overlay>> = BTreeMap::new();
        let all = txn.scan_json::<Overlay>(
            stores::DOCUMENT_OVERLAYS,
            &KeyRange::Prefix(keys::prefix(&[&self.user_key])),
        )?;
        for (_, overlay) in all {
            if overlay.key().collection_group() == collection_group
                && overlay.largest_batch_id > since_batch_id
            {
                by_batch.entry(overlay.largest_batch_id).or_default().push(overlay);
            }
        }

        let mut result = BTreeMap::new();
        for (_, overlays) in by_batch {
            for overlay in overlays {
                result.insert(overlay.key().clone(), overlay);
            }
            if result.len() >= count {
                break;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::local::persistence::{MemoryKvStore, Persistence, TransactionMode};
    use crate::firestore::model::ObjectValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn overlays(batch: &[&str]) -> BTreeMap<DocumentKey, Mutation> {
        batch
            .iter()
            .map(|path| (key(path), Mutation::set(key(path), ObjectValue::empty())))
            .collect()
    }

    #[test]
    fn newer_overlays_replace_older_ones() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()));
        let cache = DocumentOverlayCache::for_user(&User::unauthenticated());
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, overlays(&["rooms/a"]))?;
                cache.save_overlays(txn, 2, overlays(&["rooms/a", "rooms/b"]))?;
                let overlay = cache.get_overlay(txn, &key("rooms/a"))?.unwrap();
                assert_eq!(overlay.largest_batch_id, 2);

                // Removing batch 1 leaves the newer overlay in place.
                let affected: BTreeSet<_> = [key("rooms/a")].into_iter().collect();
                cache.remove_overlays_for_batch_id(txn, &affected, 1)?;
                assert!(cache.get_overlay(txn, &key("rooms/a"))?.is_some());
                cache.remove_overlays_for_batch_id(txn, &affected, 2)?;
                assert!(cache.get_overlay(txn, &key("rooms/a"))?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn collection_reads_skip_nested_documents() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()));
        let cache = DocumentOverlayCache::for_user(&User::unauthenticated());
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, overlays(&["rooms/a", "rooms/a/messages/m1"]))?;
                cache.save_overlays(txn, 2, overlays(&["rooms/b"]))?;
                let rooms = ResourcePath::from_string("rooms")?;
                let found = cache.get_overlays_for_collection(txn, &rooms, 0)?;
                assert_eq!(found.len(), 2);
                let newer = cache.get_overlays_for_collection(txn, &rooms, 1)?;
                assert_eq!(newer.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);

                let group = cache.get_overlays_for_collection_group(txn, "rooms", 0, 1)?;
                assert_eq!(group.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
