use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::{keys, stores, KeyRange, PersistenceTransaction};
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument};
use crate::util::hard_assert;

/// Cache of the latest documents received from the backend, ordered by read
/// time within each collection group.
#[derive(Clone, Debug, Default)]
pub struct RemoteDocumentCache {
    index_manager: IndexManager,
}

fn read_time_key(document: &MutableDocument) -> String {
    let key = document.key();
    keys::compose(&[
        key.collection_group(),
        &format!("{:020}", document.read_time().timestamp().to_micros().max(0)),
        &keys::document(key),
    ])
}

impl RemoteDocumentCache {
    pub fn new(index_manager: IndexManager) -> Self {
        Self { index_manager }
    }

    /// Stores `document`, which must carry its read time.
    pub fn add_entry(&self, txn: &mut PersistenceTransaction<'_>, document: &MutableDocument) -> FirestoreResult<()> {
        hard_assert(
            !document.read_time().is_min(),
            "cannot add a document with a minimal read time to the remote cache",
        );
        let key = document.key();
        if let Some(previous) = txn.get_json::<MutableDocument>(stores::REMOTE_DOCUMENTS, &keys::document(key))? {
            txn.delete(stores::REMOTE_DOCUMENT_READ_TIMES, &read_time_key(&previous))?;
        }
        txn.put_json(stores::REMOTE_DOCUMENTS, keys::document(key), document)?;
        txn.put_marker(stores::REMOTE_DOCUMENT_READ_TIMES, read_time_key(document))?;
        self.index_manager
            .add_to_collection_parent_index(txn, &key.collection_path())
    }

    pub fn remove_entry(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        if let Some(previous) = txn.get_json::<MutableDocument>(stores::REMOTE_DOCUMENTS, &keys::document(key))? {
            txn.delete(stores::REMOTE_DOCUMENT_READ_TIMES, &read_time_key(&previous))?;
            txn.delete(stores::REMOTE_DOCUMENTS, &keys::document(key))?;
        }
        Ok(())
    }

    /// Cached state of `key`, or an invalid document when nothing is cached.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        Ok(txn
            .get_json(stores::REMOTE_DOCUMENTS, &keys::document(key))?
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone())))
    }

    pub fn get_entries<'k, I>(
        &self,
        txn: &PersistenceTransaction<'_>,
        document_keys: I,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut result = BTreeMap::new();
        for key in document_keys {
            result.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(result)
    }

    /// Documents directly inside the query's collection that changed after
    /// `offset` and either match the query or appear in `mutated_keys`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        mut context: Option<&mut QueryContext>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let collection = query.path();
        let range = KeyRange::Prefix(keys::children_prefix(collection));
        let mut result = BTreeMap::new();
        for (_, document) in txn.scan_json::<MutableDocument>(stores::REMOTE_DOCUMENTS, &range)? {
            if !collection.is_immediate_parent_of(document.key().path()) {
                continue;
            }
            if let Some(context) = context.as_deref_mut() {
                context.document_read_count += 1;
            }
            if IndexOffset::from_document(&document) <= *offset {
                continue;
            }
            if !mutated_keys.contains(document.key()) && !query.matches(&document) {
                continue;
            }
            result.insert(document.key().clone(), document);
        }
        Ok(result)
    }

    /// Up to `limit` documents of `collection_group` that sort after `offset`,
    /// in read time order.
    pub fn get_next_documents(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> FirestoreResult<Vec<MutableDocument>> {
        let start = keys::prefix(&[
            collection_group,
            &format!("{:020}", offset.read_time.timestamp().to_micros().max(0)),
        ]);
        let end = keys::prefix(&[collection_group, "\u{7f}"]);
        let mut result = Vec::new();
        for entry in txn.scan_keys(stores::REMOTE_DOCUMENT_READ_TIMES, &KeyRange::Between(start, end))? {
            if result.len() >= limit {
                break;
            }
            let Some(key) = keys::decode_document(keys::last_part(&entry)) else {
                continue;
            };
            let document = self.get_entry(txn, &key)?;
            if IndexOffset::from_document(&document) > *offset {
                result.push(document);
            }
        }
        Ok(result)
    }
}

/// Buffers remote document writes within one transaction so that later reads
/// in the same operation observe them, then flushes them in one step.
pub struct RemoteDocumentChangeBuffer<'c> {
    cache: &'c RemoteDocumentCache,
    changes: BTreeMap<DocumentKey, Option<MutableDocument>>,
}

impl<'c> RemoteDocumentChangeBuffer<'c> {
    pub fn new(cache: &'c RemoteDocumentCache) -> Self {
        Self {
            cache,
            changes: BTreeMap::new(),
        }
    }

    pub fn add_entry(&mut self, document: MutableDocument) {
        hard_assert(
            !document.read_time().is_min(),
            "buffered documents must carry a read time",
        );
        self.changes.insert(document.key().clone(), Some(document));
    }

    pub fn remove_entry(&mut self, key: DocumentKey) {
        self.changes.insert(key, None);
    }

    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        match self.changes.get(key) {
            Some(Some(document)) => Ok(document.clone()),
            Some(None) => Ok(MutableDocument::new_invalid(key.clone())),
            None => self.cache.get_entry(txn, key),
        }
    }

    pub fn get_entries<'k, I>(
        &self,
        txn: &PersistenceTransaction<'_>,
        document_keys: I,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut result = BTreeMap::new();
        for key in document_keys {
            result.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(result)
    }

    pub fn apply(self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        for (key, change) in self.changes {
            match change {
                Some(document) if document.is_valid_document() => self.cache.add_entry(txn, &document)?,
                _ => self.cache.remove_entry(txn, &key)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::local::persistence::{MemoryKvStore, Persistence, TransactionMode};
    use crate::firestore::model::{ObjectValue, SnapshotVersion};

    fn doc(path: &str, read_micros: i64) -> MutableDocument {
        let version = SnapshotVersion::from_micros(read_micros);
        let mut document = MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            version,
            ObjectValue::empty(),
        );
        document.set_read_time(version);
        document
    }

    #[test]
    fn query_reads_respect_offset_and_collection() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()));
        let cache = RemoteDocumentCache::default();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, &doc("rooms/a", 10))?;
                cache.add_entry(txn, &doc("rooms/b", 20))?;
                cache.add_entry(txn, &doc("rooms/a/messages/m", 30))?;

                let query = Query::collection("rooms")?;
                let all = cache.get_documents_matching_query(txn, &query, &IndexOffset::none(), &BTreeSet::new(), None)?;
                assert_eq!(all.len(), 2);

                let offset = IndexOffset::new(SnapshotVersion::from_micros(10), None, -1);
                let newer = cache.get_documents_matching_query(txn, &query, &offset, &BTreeSet::new(), None)?;
                assert_eq!(newer.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn next_documents_follow_read_time_order() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()));
        let cache = RemoteDocumentCache::default();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, &doc("rooms/z", 10))?;
                cache.add_entry(txn, &doc("rooms/a", 20))?;
                // Re-adding moves the document to its new read time.
                cache.add_entry(txn, &doc("rooms/z", 30))?;
                let next = cache.get_next_documents(txn, "rooms", &IndexOffset::none(), 10)?;
                let ids: Vec<_> = next.iter().map(|d| d.key().id().to_string()).collect();
                assert_eq!(ids, vec!["a", "z"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn change_buffer_reads_its_own_writes() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()));
        let cache = RemoteDocumentCache::default();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                let mut buffer = RemoteDocumentChangeBuffer::new(&cache);
                buffer.add_entry(doc("rooms/a", 10));
                assert!(buffer.get_entry(txn, &key)?.is_found_document());
                assert!(!cache.get_entry(txn, &key)?.is_valid_document());
                buffer.apply(txn)?;
                assert!(cache.get_entry(txn, &key)?.is_found_document());
                Ok(())
            })
            .unwrap();
    }
}
