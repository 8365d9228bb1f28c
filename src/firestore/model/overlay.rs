use serde::{Deserialize, Serialize};

use crate::firestore::model::{BatchId, DocumentKey, Mutation};

/// Net effect of every queued batch on one document, recorded under the id of
/// the newest batch that contributed to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
