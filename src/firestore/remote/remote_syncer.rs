use std::collections::BTreeSet;

use crate::firestore::core::{OnlineState, User};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetId;
use crate::firestore::model::{BatchId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::remote_event::RemoteEvent;

/// Bridge between the remote store and the component that owns local state.
///
/// The remote store calls into it on the async queue, with exclusive access, so
/// every callback is synchronous and takes `&mut self`.
pub trait RemoteSyncer {
    /// Applies a consistent snapshot produced by the watch stream.
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused to serve `target_id`.
    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend permanently rejected a mutation batch.
    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys the local store believes match the target on the server.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// First queued batch with an id greater than `after_batch_id`.
    fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>>;

    fn get_last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion>;

    fn apply_online_state_change(&mut self, online_state: OnlineState);

    /// Switches local state over to `user` while the network is paused.
    fn handle_credential_change(&mut self, user: &User) -> FirestoreResult<()>;

    /// Stream token from the last write acknowledgement.
    fn get_last_stream_token(&mut self) -> FirestoreResult<Vec<u8>>;

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()>;
}
