use std::collections::BTreeSet;

use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::{IndexManager, IndexType};
use crate::firestore::local::local_documents_view::{DocumentMap, LocalDocumentsView};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    DocumentKey, IndexOffset, MutableDocument, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Controls automatic index creation for queries that scan far more documents
/// than they return.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    /// Collections smaller than this are always scanned.
    pub min_collection_size: usize,
    /// An index is created once a scan reads more than this many documents per
    /// returned document.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: 100,
            relative_index_read_cost_per_document: 2.0,
        }
    }
}

/// Counts the work done by one query execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryContext {
    pub document_read_count: usize,
}

/// Which strategy produced a query result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPath {
    Index,
    PreviousResults,
    FullScan,
}

/// Executes queries against the local cache, picking the cheapest strategy:
/// a field index, the last limbo-free result plus recent changes, or a full
/// collection scan.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    local_documents: LocalDocumentsView,
    index_manager: IndexManager,
    settings: IndexAutoCreationSettings,
}

impl QueryEngine {
    pub fn new(
        local_documents: LocalDocumentsView,
        index_manager: IndexManager,
        settings: IndexAutoCreationSettings,
    ) -> Self {
        Self {
            local_documents,
            index_manager,
            settings,
        }
    }

    /// Rebinds the engine to the document view of a new user.
    pub fn initialize(&mut self, local_documents: LocalDocumentsView, index_manager: IndexManager) {
        self.local_documents = local_documents;
        self.index_manager = index_manager;
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.settings.enabled = enabled;
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        Ok(self
            .get_documents_matching_query_with_path(txn, query, last_limbo_free_snapshot_version, remote_keys)?
            .0)
    }

    /// Like [`Self::get_documents_matching_query`], also reporting the
    /// strategy used.
    pub fn get_documents_matching_query_with_path(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<(DocumentMap, QueryPath)> {
        if let Some(result) = self.perform_query_using_index(txn, query)? {
            log::debug!("query '{}' served from index", query.canonical_id());
            return Ok((result, QueryPath::Index));
        }
        if let Some(result) =
            self.perform_query_using_remote_keys(txn, query, remote_keys, last_limbo_free_snapshot_version)?
        {
            log::debug!(
                "re-using previous result from {last_limbo_free_snapshot_version} for query '{}'",
                query.canonical_id()
            );
            return Ok((result, QueryPath::PreviousResults));
        }

        let mut context = QueryContext::default();
        let result = self
            .local_documents
            .get_documents_matching_query(txn, query, &IndexOffset::none(), Some(&mut context))?;
        log::debug!(
            "full collection scan for query '{}' read {} documents",
            query.canonical_id(),
            context.document_read_count
        );
        if self.settings.enabled {
            self.create_cache_indexes(txn, query, &context, result.len())?;
        }
        Ok((result, QueryPath::FullScan))
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        if context.document_read_count < self.settings.min_collection_size {
            log::debug!(
                "skipping index creation for '{}': {} documents is below the minimum collection size",
                query.canonical_id(),
                context.document_read_count
            );
            return Ok(());
        }
        let threshold = self.settings.relative_index_read_cost_per_document * result_size as f64;
        if context.document_read_count as f64 > threshold {
            log::debug!(
                "creating index for '{}': read {} documents for {result_size} results",
                query.canonical_id(),
                context.document_read_count
            );
            self.index_manager.create_target_indexes(txn, &query.to_target())?;
        }
        Ok(())
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        let target = query.to_target();
        if self.index_manager.get_index_type(txn, &target)? == IndexType::None {
            return Ok(None);
        }
        let Some(keys) = self.index_manager.get_documents_matching_target(txn, &target)? else {
            return Ok(None);
        };
        let sorted_keys: BTreeSet<DocumentKey> = keys.into_iter().collect();
        let documents = self.local_documents.get_documents(txn, &sorted_keys)?;
        let offset = self.index_manager.get_min_offset(txn, &target)?;
        let previous_results = apply_query(query, documents);
        if needs_refill(query, &previous_results, &sorted_keys, offset.read_time) {
            // The index hit sits at the limit edge and may be stale, so run
            // without the limit and let the view cut the result.
            return self.perform_query_using_index(txn, &query.clone().without_limit());
        }
        self.append_remaining_results(txn, previous_results, query, &offset)
            .map(Some)
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<DocumentMap>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }
        let documents = self.local_documents.get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, documents);
        if needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version) {
            return Ok(None);
        }
        let offset = successor_offset(last_limbo_free_snapshot_version);
        self.append_remaining_results(txn, previous_results, query, &offset)
            .map(Some)
    }

    fn append_remaining_results(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        indexed_results: Vec<MutableDocument>,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<DocumentMap> {
        let mut remaining = self
            .local_documents
            .get_documents_matching_query(txn, query, offset, None)?;
        for document in indexed_results {
            remaining.insert(document.key().clone(), document);
        }
        Ok(remaining)
    }
}

/// Documents of `documents` matching `query`, in query order.
fn apply_query(query: &Query, documents: DocumentMap) -> Vec<MutableDocument> {
    let mut matching: Vec<MutableDocument> = documents
        .into_values()
        .filter(|document| query.matches(document))
        .collect();
    matching.sort_by(|left, right| query.compare(left, right));
    matching
}

/// Whether a limit query's previous result cannot be reused: a previous match
/// dropped out, or the document at the limit edge changed since the result was
/// computed.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => document.has_pending_writes() || document.version() > limbo_free_snapshot_version,
        None => false,
    }
}

/// Offset just past everything read at `read_time`.
fn successor_offset(read_time: SnapshotVersion) -> IndexOffset {
    let timestamp = read_time.timestamp();
    let successor = if timestamp.nanos + 1 >= 1_000_000_000 {
        Timestamp::new(timestamp.seconds + 1, 0)
    } else {
        Timestamp::new(timestamp.seconds, timestamp.nanos + 1)
    };
    IndexOffset::new(SnapshotVersion::new(successor), None, BATCH_ID_UNKNOWN)
}
