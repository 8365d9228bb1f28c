use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::firestore::error::{internal_error, primary_lease_lost, FirestoreResult};

/// Object store names used by the local caches.
pub mod stores {
    pub const MUTATIONS: &str = "mutations";
    pub const DOCUMENT_MUTATIONS: &str = "document_mutations";
    pub const MUTATION_META: &str = "mutation_meta";
    pub const REMOTE_DOCUMENTS: &str = "remote_documents";
    pub const REMOTE_DOCUMENT_READ_TIMES: &str = "remote_document_read_times";
    pub const TARGETS: &str = "targets";
    pub const TARGET_IDS_BY_CANONICAL_ID: &str = "target_ids_by_canonical_id";
    pub const TARGET_DOCUMENTS: &str = "target_documents";
    pub const DOCUMENT_TARGETS: &str = "document_targets";
    pub const TARGET_GLOBALS: &str = "target_globals";
    pub const DOCUMENT_OVERLAYS: &str = "document_overlays";
    pub const OVERLAYS_BY_BATCH: &str = "overlays_by_batch";
    pub const COLLECTION_PARENTS: &str = "collection_parents";
    pub const INDEX_CONFIGURATION: &str = "index_configuration";
    pub const INDEX_ENTRIES: &str = "index_entries";
    pub const INDEX_GLOBALS: &str = "index_globals";
    pub const BUNDLES: &str = "bundles";
    pub const NAMED_QUERIES: &str = "named_queries";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write access that requires holding the primary lease.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

/// Range of keys within one store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyRange {
    All,
    /// Keys starting with the prefix.
    Prefix(String),
    /// Keys in `[start, end)`.
    Between(String, String),
}

impl KeyRange {
    pub fn contains(&self, key: &str) -> bool {
        match self {
            KeyRange::All => true,
            KeyRange::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyRange::Between(start, end) => key >= start.as_str() && key < end.as_str(),
        }
    }
}

/// One transaction against a [`KvStore`]. Dropping it without calling
/// [`KvTransaction::commit`] discards its writes.
pub trait KvTransaction {
    fn get(&self, store: &str, key: &str) -> FirestoreResult<Option<Vec<u8>>>;
    fn put(&mut self, store: &str, key: String, value: Vec<u8>) -> FirestoreResult<()>;
    fn delete(&mut self, store: &str, key: &str) -> FirestoreResult<()>;
    /// Entries within `range`, in ascending key order.
    fn scan(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(String, Vec<u8>)>>;
    fn commit(self: Box<Self>) -> FirestoreResult<()>;
}

/// Transactional, ordered key-value storage backing the local caches.
pub trait KvStore: Send + Sync + 'static {
    fn begin(&self, mode: TransactionMode) -> FirestoreResult<Box<dyn KvTransaction + '_>>;
}

type StoreMap = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// In-process [`KvStore`]. Transactions hold the store lock for their whole
/// lifetime, so they never interleave.
pub struct MemoryKvStore {
    data: Mutex<StoreMap>,
    primary_lease: AtomicBool,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            primary_lease: AtomicBool::new(true),
        }
    }

    /// Simulates another client instance taking (or returning) the lease.
    pub fn set_primary_lease(&self, held: bool) {
        self.primary_lease.store(held, Ordering::SeqCst);
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self, mode: TransactionMode) -> FirestoreResult<Box<dyn KvTransaction + '_>> {
        if mode == TransactionMode::ReadWritePrimary && !self.primary_lease.load(Ordering::SeqCst) {
            return Err(primary_lease_lost());
        }
        let guard = self
            .data
            .lock()
            .map_err(|_| internal_error("memory store lock poisoned"))?;
        Ok(Box::new(MemoryKvTransaction {
            guard,
            mode,
            pending: BTreeMap::new(),
        }))
    }
}

struct MemoryKvTransaction<'a> {
    guard: MutexGuard<'a, StoreMap>,
    mode: TransactionMode,
    pending: BTreeMap<(String, String), Option<Vec<u8>>>,
}

impl MemoryKvTransaction<'_> {
    fn ensure_writable(&self) -> FirestoreResult<()> {
        if self.mode.is_read_only() {
            return Err(internal_error("write attempted in a read-only transaction"));
        }
        Ok(())
    }
}

impl KvTransaction for MemoryKvTransaction<'_> {
    fn get(&self, store: &str, key: &str) -> FirestoreResult<Option<Vec<u8>>> {
        if let Some(pending) = self.pending.get(&(store.to_string(), key.to_string())) {
            return Ok(pending.clone());
        }
        Ok(self
            .guard
            .get(store)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&mut self, store: &str, key: String, value: Vec<u8>) -> FirestoreResult<()> {
        self.ensure_writable()?;
        self.pending.insert((store.to_string(), key), Some(value));
        Ok(())
    }

    fn delete(&mut self, store: &str, key: &str) -> FirestoreResult<()> {
        self.ensure_writable()?;
        self.pending
            .insert((store.to_string(), key.to_string()), None);
        Ok(())
    }

    fn scan(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(String, Vec<u8>)>> {
        let mut merged: BTreeMap<String, Vec<u8>> = match self.guard.get(store) {
            Some(entries) => {
                let iter: Box<dyn Iterator<Item = (&String, &Vec<u8>)>> = match range {
                    KeyRange::All => Box::new(entries.iter()),
                    KeyRange::Prefix(prefix) => Box::new(
                        entries
                            .range(prefix.clone()..)
                            .take_while(|(key, _)| key.starts_with(prefix.as_str())),
                    ),
                    KeyRange::Between(start, end) => {
                        Box::new(entries.range(start.clone()..end.clone()))
                    }
                };
                iter.map(|(key, value)| (key.clone(), value.clone())).collect()
            }
            None => BTreeMap::new(),
        };
        for ((pending_store, key), value) in &self.pending {
            if pending_store != store || !range.contains(key) {
                continue;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn commit(mut self: Box<Self>) -> FirestoreResult<()> {
        let pending = std::mem::take(&mut self.pending);
        for ((store, key), value) in pending {
            let entries = self.guard.entry(store).or_default();
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Entry point for running typed transactions against the key-value store.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn KvStore>,
}

impl Persistence {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Runs `operation` in one transaction and commits it if it succeeds.
    pub fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode, operation: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        log::trace!("starting transaction: {action}");
        let inner = self.store.begin(mode)?;
        let mut transaction = PersistenceTransaction { inner };
        let result = operation(&mut transaction)?;
        transaction.inner.commit()?;
        Ok(result)
    }
}

/// Typed view over a [`KvTransaction`]; values are stored as JSON.
pub struct PersistenceTransaction<'a> {
    inner: Box<dyn KvTransaction + 'a>,
}

impl PersistenceTransaction<'_> {
    pub fn get_json<T: DeserializeOwned>(&self, store: &str, key: &str) -> FirestoreResult<Option<T>> {
        self.inner
            .get(store, key)?
            .map(|bytes| decode(store, &bytes))
            .transpose()
    }

    pub fn put_json<T: Serialize>(&mut self, store: &str, key: String, value: &T) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|err| {
            internal_error(format!("failed to encode {store} record: {err}"))
        })?;
        self.inner.put(store, key, bytes)
    }

    /// Records the presence of `key` without a value.
    pub fn put_marker(&mut self, store: &str, key: String) -> FirestoreResult<()> {
        self.inner.put(store, key, Vec::new())
    }

    pub fn contains(&self, store: &str, key: &str) -> FirestoreResult<bool> {
        Ok(self.inner.get(store, key)?.is_some())
    }

    pub fn delete(&mut self, store: &str, key: &str) -> FirestoreResult<()> {
        self.inner.delete(store, key)
    }

    pub fn scan_json<T: DeserializeOwned>(
        &self,
        store: &str,
        range: &KeyRange,
    ) -> FirestoreResult<Vec<(String, T)>> {
        self.inner
            .scan(store, range)?
            .into_iter()
            .map(|(key, bytes)| decode(store, &bytes).map(|value| (key, value)))
            .collect()
    }

    pub fn scan_keys(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<String>> {
        Ok(self
            .inner
            .scan(store, range)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Deletes every key in `range`.
    pub fn delete_range(&mut self, store: &str, range: &KeyRange) -> FirestoreResult<()> {
        for key in self.scan_keys(store, range)? {
            self.inner.delete(store, &key)?;
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(store: &str, bytes: &[u8]) -> FirestoreResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|err| internal_error(format!("corrupt {store} record: {err}")))
}

/// Key encoding shared by the caches. Path segments are joined with `\u{1}` and
/// key components with `\0`, so byte order of encoded keys matches path order.
pub mod keys {
    use crate::firestore::model::{DocumentKey, ResourcePath};

    pub const SEPARATOR: char = '\0';
    const SEGMENT_SEPARATOR: char = '\u{1}';

    pub fn path(path: &ResourcePath) -> String {
        path.segments().join(&SEGMENT_SEPARATOR.to_string())
    }

    pub fn document(key: &DocumentKey) -> String {
        path(key.path())
    }

    /// Prefix shared by every document directly or indirectly under `parent`.
    pub fn children_prefix(parent: &ResourcePath) -> String {
        if parent.is_empty() {
            String::new()
        } else {
            format!("{}{SEGMENT_SEPARATOR}", path(parent))
        }
    }

    pub fn decode_path(encoded: &str) -> ResourcePath {
        if encoded.is_empty() {
            return ResourcePath::root();
        }
        ResourcePath::from_segments(encoded.split(SEGMENT_SEPARATOR))
    }

    pub fn decode_document(encoded: &str) -> Option<DocumentKey> {
        DocumentKey::from_path(decode_path(encoded)).ok()
    }

    pub fn id(id: i32) -> String {
        format!("{id:010}")
    }

    pub fn compose(parts: &[&str]) -> String {
        parts.join(&SEPARATOR.to_string())
    }

    /// `parts` joined, followed by a trailing separator for prefix scans.
    pub fn prefix(parts: &[&str]) -> String {
        let mut key = compose(parts);
        key.push(SEPARATOR);
        key
    }

    /// Last component of a composed key.
    pub fn last_part(key: &str) -> &str {
        key.rsplit(SEPARATOR).next().unwrap_or_default()
    }

    pub fn parts(key: &str) -> Vec<&str> {
        key.split(SEPARATOR).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DocumentKey;

    fn persistence() -> (Arc<MemoryKvStore>, Persistence) {
        let store = Arc::new(MemoryKvStore::new());
        (Arc::clone(&store), Persistence::new(store))
    }

    #[test]
    fn failed_transactions_roll_back() {
        let (_, persistence) = persistence();
        let result: FirestoreResult<()> =
            persistence.run_transaction("write then fail", TransactionMode::ReadWrite, |txn| {
                txn.put_json(stores::TARGETS, "a".into(), &1)?;
                Err(internal_error("boom"))
            });
        assert!(result.is_err());

        let value: Option<i32> = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                txn.get_json(stores::TARGETS, "a")
            })
            .unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn scans_see_uncommitted_writes_in_order() {
        let (_, persistence) = persistence();
        persistence
            .run_transaction("scan", TransactionMode::ReadWrite, |txn| {
                txn.put_json(stores::TARGETS, keys::compose(&["p", "2"]), &2)?;
                txn.put_json(stores::TARGETS, keys::compose(&["p", "1"]), &1)?;
                txn.put_json(stores::TARGETS, keys::compose(&["q", "3"]), &3)?;
                let values: Vec<i32> = txn
                    .scan_json(stores::TARGETS, &KeyRange::Prefix(keys::prefix(&["p"])))?
                    .into_iter()
                    .map(|(_, value)| value)
                    .collect();
                assert_eq!(values, vec![1, 2]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn primary_transactions_require_lease() {
        let (store, persistence) = persistence();
        store.set_primary_lease(false);
        let err = persistence
            .run_transaction("primary", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PrimaryLeaseLost);
        persistence
            .run_transaction("secondary", TransactionMode::ReadWrite, |_| Ok(()))
            .unwrap();
    }

    #[test]
    fn encoded_paths_sort_like_paths() {
        let parent = DocumentKey::from_string("a/b").unwrap();
        let child = DocumentKey::from_string("a/b/c/d").unwrap();
        let sibling = DocumentKey::from_string("a/ba").unwrap();
        assert!(keys::document(&parent) < keys::document(&child));
        assert!(keys::document(&child) < keys::document(&sibling));
        assert_eq!(keys::decode_document(&keys::document(&child)), Some(child));
    }
}
