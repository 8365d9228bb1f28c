use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{stores, PersistenceTransaction};
use crate::firestore::model::SnapshotVersion;

/// Identity of a loaded bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub id: String,
    pub version: i32,
    pub create_time: SnapshotVersion,
}

/// A query shipped inside a bundle, with the time its results were read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

#[derive(Clone, Debug, Default)]
pub struct BundleCache;

impl BundleCache {
    pub fn new() -> Self {
        Self
    }

    pub fn get_bundle_metadata(
        &self,
        txn: &PersistenceTransaction<'_>,
        bundle_id: &str,
    ) -> FirestoreResult<Option<BundleMetadata>> {
        txn.get_json(stores::BUNDLES, bundle_id)
    }

    pub fn save_bundle_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        metadata: &BundleMetadata,
    ) -> FirestoreResult<()> {
        txn.put_json(stores::BUNDLES, metadata.id.clone(), metadata)
    }

    pub fn get_named_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        name: &str,
    ) -> FirestoreResult<Option<NamedQuery>> {
        txn.get_json(stores::NAMED_QUERIES, name)
    }

    pub fn save_named_query(&self, txn: &mut PersistenceTransaction<'_>, query: &NamedQuery) -> FirestoreResult<()> {
        txn.put_json(stores::NAMED_QUERIES, query.name.clone(), query)
    }
}
