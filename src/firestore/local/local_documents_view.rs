use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, IndexOffset, MutableDocument, Mutation,
    Overlay, OverlayedDocument, Timestamp,
};

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Documents read for index backfill together with the newest batch whose
/// overlay was applied to them.
#[derive(Debug, Default)]
pub struct NextDocumentsResult {
    pub largest_batch_id: BatchId,
    pub documents: DocumentMap,
}

/// Combines cached remote documents with the pending local writes recorded in
/// the overlay cache to produce the documents a user sees.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        overlays: DocumentOverlayCache,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            index_manager,
        }
    }

    /// Local view of one document. Missing documents come back invalid.
    pub fn get_document(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let overlay = self.overlays.get_overlay(txn, key)?;
        let mut document = self.base_document(txn, key, overlay.as_ref())?;
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        Ok(document)
    }

    /// A set overlay or delete overlay replaces the remote state entirely, so
    /// only patches need the cached document.
    fn base_document(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
        overlay: Option<&Overlay>,
    ) -> FirestoreResult<MutableDocument> {
        match overlay {
            Some(overlay) if !overlay.mutation.is_patch() => Ok(MutableDocument::new_invalid(key.clone())),
            _ => self.remote_documents.get_entry(txn, key),
        }
    }

    pub fn get_documents<'k, I>(&self, txn: &mut PersistenceTransaction<'_>, keys: I) -> FirestoreResult<DocumentMap>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let documents = self.remote_documents.get_entries(txn, keys)?;
        Ok(self
            .get_local_view_of_documents(txn, documents, &BTreeSet::new())?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Applies overlays to `documents`, which hold remote state.
    ///
    /// Keys in `existence_state_changed` had their remote existence flip; their
    /// overlays are recomputed from the mutation queue because a patch
    /// precondition may now evaluate differently.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: DocumentMap,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.overlays.get_overlays(txn, documents.keys())?;
        self.compute_views(txn, documents, &overlays, existence_state_changed)
    }

    /// Like [`Self::get_local_view_of_documents`] without recomputation.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: DocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mut documents: DocumentMap,
        overlays: &BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = DocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let now = Timestamp::now();
        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let needs_recalculation = existence_state_changed.contains(key)
                && overlay.map_or(true, |overlay| overlay.mutation.is_patch());
            if needs_recalculation {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask().cloned();
                mutated_fields.insert(key.clone(), mask.clone());
                overlay.mutation.apply_to_local_view(document, mask, now);
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        let recalculated_masks = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
        mutated_fields.extend(recalculated_masks);
        documents.extend(recalculate);

        Ok(documents
            .into_iter()
            .map(|(key, document)| {
                let mask = mutated_fields.remove(&key).unwrap_or(None);
                (key, OverlayedDocument::new(document, mask))
            })
            .collect())
    }

    /// Replays every queued batch affecting `documents` (updating them in
    /// place), then saves the net overlay of each document under the newest
    /// batch that touched it.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut DocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys)?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks.get(&key).cloned().unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                documents_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        // Newest batch first, so each document's overlay lands under the
        // largest batch id that affected it.
        let mut processed = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch.into_iter().rev() {
            let mut overlays: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(document), Some(mask)) = (documents.get(&key), masks.get(&key)) else {
                    continue;
                };
                if let Some(overlay) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key, overlay);
                }
            }
            self.overlays.save_overlays(txn, batch_id, overlays)?;
        }
        Ok(masks)
    }

    /// Recomputes overlays for `keys` from their cached remote state.
    pub fn recalculate_overlays_for_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_documents.get_entries(txn, keys)?;
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Local view of every document matching `query` that changed after
    /// `offset`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query)
        } else if let Some(collection_id) = query.collection_group_id() {
            self.get_documents_matching_collection_group_query(txn, query, collection_id, offset, context)
        } else {
            self.get_documents_matching_collection_query(txn, query, offset, context)
        }
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        let mut result = DocumentMap::new();
        let key = DocumentKey::from_path(query.path().clone())?;
        let document = self.get_document(txn, &key)?;
        if document.is_found_document() {
            result.insert(key, document);
        }
        Ok(result)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        collection_id: &str,
        offset: &IndexOffset,
        mut context: Option<&mut QueryContext>,
    ) -> FirestoreResult<DocumentMap> {
        let mut result = DocumentMap::new();
        for parent in self.index_manager.get_collection_parents(txn, collection_id)? {
            if !query.path().is_prefix_of(&parent) {
                continue;
            }
            let collection_query = query.as_collection_query_at_path(parent.child(collection_id));
            result.extend(self.get_documents_matching_collection_query(
                txn,
                &collection_query,
                offset,
                context.as_deref_mut(),
            )?);
        }
        Ok(result)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> FirestoreResult<DocumentMap> {
        let overlays = self
            .overlays
            .get_overlays_for_collection(txn, query.path(), offset.largest_batch_id)?;
        let overlaid_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents = self
            .remote_documents
            .get_documents_matching_query(txn, query, offset, &overlaid_keys, context)?;
        // A document may only match because of its overlay.
        for key in overlays.keys() {
            documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid(key.clone()));
        }

        let now = Timestamp::now();
        let mut result = DocumentMap::new();
        for (key, mut document) in documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), now);
            }
            if query.matches(&document) {
                result.insert(key, document);
            }
        }
        Ok(result)
    }

    /// Next documents of `collection_group` after `offset` for index backfill,
    /// with pending writes applied.
    pub fn get_next_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> FirestoreResult<NextDocumentsResult> {
        let remote = self
            .remote_documents
            .get_next_documents(txn, collection_group, offset, count)?;
        let mut documents: DocumentMap = remote
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();

        let overlays = if count > documents.len() {
            self.overlays.get_overlays_for_collection_group(
                txn,
                collection_group,
                offset.largest_batch_id,
                count - documents.len(),
            )?
        } else {
            BTreeMap::new()
        };

        let mut largest_batch_id = offset.largest_batch_id;
        for (key, overlay) in &overlays {
            largest_batch_id = largest_batch_id.max(overlay.largest_batch_id);
            if !documents.contains_key(key) {
                let base = self.base_document(txn, key, Some(overlay))?;
                documents.insert(key.clone(), base);
            }
        }
        let mut all_overlays = self.overlays.get_overlays(txn, documents.keys())?;
        all_overlays.extend(overlays);

        let views = self.compute_views(txn, documents, &all_overlays, &BTreeSet::new())?;
        Ok(NextDocumentsResult {
            largest_batch_id,
            documents: views
                .into_iter()
                .map(|(key, overlayed)| (key, overlayed.document))
                .collect(),
        })
    }
}
