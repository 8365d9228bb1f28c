use std::collections::BTreeSet;

use crate::firestore::local::TargetId;
use crate::firestore::model::DocumentKey;

/// Two-way set of (document, target) references. Lookups by document answer
/// "is anything holding this key", lookups by target enumerate what one target
/// holds.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, TargetId)>,
    by_target: BTreeSet<(TargetId, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, target_id: TargetId) {
        self.by_target.insert((target_id, key.clone()));
        self.by_key.insert((key, target_id));
    }

    pub fn add_references<'k, I>(&mut self, keys: I, target_id: TargetId)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            self.add_reference(key.clone(), target_id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, target_id: TargetId) {
        self.by_target.remove(&(target_id, key.clone()));
        self.by_key.remove(&(key.clone(), target_id));
    }

    pub fn remove_references<'k, I>(&mut self, keys: I, target_id: TargetId)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            self.remove_reference(key, target_id);
        }
    }

    /// Drops every reference held by `target_id` and returns the keys.
    pub fn remove_references_for_id(&mut self, target_id: TargetId) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.references_for_id(target_id).into_iter().collect();
        self.remove_references(&keys, target_id);
        keys
    }

    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let keys = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_target.clear();
        keys
    }

    pub fn references_for_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.by_target
            .range((target_id, DocumentKey::min())..)
            .take_while(|(id, _)| *id == target_id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), TargetId::MIN)..)
            .next()
            .is_some_and(|(candidate, _)| candidate == key)
    }
}
