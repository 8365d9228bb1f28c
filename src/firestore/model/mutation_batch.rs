use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::mutation::calculate_overlay_mutation;
use crate::firestore::model::{
    DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Batch id used before any batch was written.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// A document together with the fields changed by the mutations applied to it.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    /// `None` when the whole document was replaced.
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(document: MutableDocument, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}

/// Group of mutations written together by one user operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Mutations that capture the values increments were based on. They are
    /// applied locally but never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn affects(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Applies the acknowledged results of this batch to a cached document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, result);
            }
        }
    }

    /// Applies every mutation targeting `document` as a latency-compensated write.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to a set of documents and returns the overlays that
    /// reproduce the resulting state. Keys in `documents_without_remote_version`
    /// get whole-document overlays.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mutated_fields =
                self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            let mutated_fields = if documents_without_remote_version.contains(&key) {
                None
            } else {
                mutated_fields
            };
            overlayed.mutated_fields = mutated_fields.clone();
            let overlay = calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref());
            if let Some(overlay) = overlay {
                overlays.insert(key.clone(), overlay);
            }
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// Server response to a committed [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    /// Version of each written document after the commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    pub stream_token: Vec<u8>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mismatch between mutations length ({}) and results length ({})",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            doc_versions,
            stream_token,
        })
    }
}
