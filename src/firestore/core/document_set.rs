use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::firestore::core::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};

pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// Entry of the ordered index. Carries the comparator so that the tree can
/// order documents by query order, falling back to the key.
#[derive(Clone)]
struct Ordered {
    document: MutableDocument,
    comparator: DocumentComparator,
}

impl PartialEq for Ordered {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ordered {}

impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ordered {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.comparator)(&self.document, &other.document)
            .then_with(|| self.document.key().cmp(other.document.key()))
    }
}

/// Documents kept in query order, with lookup by key.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: BTreeSet<Ordered>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: BTreeSet::new(),
        }
    }

    pub fn for_query(query: &Query) -> Self {
        let query = query.clone();
        Self::new(Arc::new(move |left, right| query.compare(left, right)))
    }

    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|left, right| left.key().cmp(right.key())))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first().map(|entry| &entry.document)
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last().map(|entry| &entry.document)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter().map(|entry| &entry.document)
    }

    /// Position of `key` in query order. Linear in the size of the set.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        let probe = self.entry(document.clone());
        Some(self.sorted.range(..probe).count())
    }

    /// Inserts or replaces the document with the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        self.by_key.insert(document.key().clone(), document.clone());
        let entry = self.entry(document);
        self.sorted.insert(entry);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let existing = self.by_key.remove(key)?;
        let entry = self.entry(existing.clone());
        if !self.sorted.remove(&entry) {
            self.sorted.retain(|entry| entry.document.key() != key);
        }
        Some(existing)
    }

    fn entry(&self, document: MutableDocument) -> Ordered {
        Ordered {
            document,
            comparator: Arc::clone(&self.comparator),
        }
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}
