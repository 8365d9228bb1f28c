use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::firestore::core::{DelayedOperation, OnlineState, TimerId, User};
use crate::firestore::error::{is_permanent_write_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{TargetData, TargetId};
use crate::firestore::model::{
    DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion,
};
use crate::firestore::remote::datastore::{
    Connection, ServerMessage, StreamKind, TokenProviderArc, WriteResponse,
};
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::scheduler::{RemoteStoreEvent, SchedulerArc};
use crate::firestore::remote::stream::{
    discard_stale_handle, StreamEnvironment, StreamSettings,
};
use crate::firestore::remote::streams::{WatchStream, WriteStream, WriteStreamResponse};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::util::{hard_assert, BackoffSettings, ExponentialBackoff};

/// Reasons the remote store is not using the network. The network is used
/// only while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OfflineCause {
    UserDisabled,
    /// Local persistence failed; cleared by a successful probe.
    PersistenceFailed,
    CredentialChange,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemoteStoreSettings {
    pub stream: StreamSettings,
    /// Mutation batches sent but not yet acknowledged.
    pub max_pending_writes: usize,
    pub max_watch_stream_failures: u32,
    pub online_state_timeout: Duration,
}

impl Default for RemoteStoreSettings {
    fn default() -> Self {
        Self {
            stream: StreamSettings::default(),
            max_pending_writes: 10,
            max_watch_stream_failures: 1,
            online_state_timeout: Duration::from_secs(10),
        }
    }
}

struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the listen and write streams and translates between them and the
/// [`RemoteSyncer`].
///
/// Runs entirely on the async queue. Everything that happens on the network
/// comes back in as a [`RemoteStoreEvent`] through [`RemoteStore::handle_event`].
pub struct RemoteStore {
    database_id: DatabaseId,
    env: StreamEnvironment,
    max_pending_writes: usize,
    listen_targets: BTreeMap<TargetId, TargetData>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    /// Present while a watch stream is starting or open.
    aggregator: Option<WatchChangeAggregator>,
    online_state_tracker: OnlineStateTracker,
    persistence_backoff: ExponentialBackoff,
    persistence_probe: Option<DelayedOperation>,
}

impl RemoteStore {
    pub fn new(
        database_id: DatabaseId,
        connection: Arc<dyn Connection>,
        auth: TokenProviderArc,
        app_check: TokenProviderArc,
        scheduler: SchedulerArc,
        settings: RemoteStoreSettings,
    ) -> Self {
        let env = StreamEnvironment {
            connection,
            auth,
            app_check,
            scheduler,
            settings: settings.stream,
        };
        Self {
            database_id,
            max_pending_writes: settings.max_pending_writes,
            listen_targets: BTreeMap::new(),
            write_pipeline: VecDeque::new(),
            offline_causes: BTreeSet::new(),
            watch_stream: WatchStream::new(&env.settings),
            write_stream: WriteStream::new(&env.settings),
            aggregator: None,
            online_state_tracker: OnlineStateTracker::new(
                settings.max_watch_stream_failures,
                settings.online_state_timeout,
            ),
            persistence_backoff: ExponentialBackoff::new(BackoffSettings {
                initial_delay: Duration::from_secs(1),
                ..settings.stream.backoff
            }),
            persistence_probe: None,
            env,
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn offline_causes(&self) -> &BTreeSet<OfflineCause> {
        &self.offline_causes
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn pending_writes(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    /// Brings the network up for the first time.
    pub fn start(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.enable_network_internal(syncer);
    }

    pub fn enable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(syncer);
    }

    pub fn disable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        // Offline rather than unknown so reads are served from cache.
        let changed = self.online_state_tracker.set(OnlineState::Offline);
        broadcast(changed, syncer);
    }

    pub fn shutdown(&mut self, syncer: &mut dyn RemoteSyncer) {
        log::debug!("remote store shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        if let Some(probe) = self.persistence_probe.take() {
            probe.cancel();
        }
        // Unknown avoids raising spurious from-cache events on the way out.
        let changed = self.online_state_tracker.set(OnlineState::Unknown);
        broadcast(changed, syncer);
    }

    /// Pauses the network, lets the syncer switch to `user` and resumes.
    pub fn handle_credential_change(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        user: &User,
    ) -> FirestoreResult<()> {
        log::debug!("remote store restarting streams for new credential");
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        let changed = self.online_state_tracker.set(OnlineState::Unknown);
        broadcast(changed, syncer);
        let result = syncer.handle_credential_change(user);
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal(syncer);
        result
    }

    /// Starts watching `target_data` unless it is already watched.
    pub fn listen(&mut self, syncer: &mut dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&*syncer, &target_data);
        }
    }

    pub fn unlisten(&mut self, syncer: &mut dyn RemoteSyncer, target_id: TargetId) {
        if self.listen_targets.remove(&target_id).is_none() {
            log::debug!("unlisten for target {target_id} that is not being watched");
            return;
        }
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle(&self.env);
            } else if self.can_use_network() {
                // Without a listen there is nothing that could prove the
                // connection healthy.
                let changed = self.online_state_tracker.set(OnlineState::Unknown);
                broadcast(changed, syncer);
            }
        }
    }

    /// Pulls queued batches into the write pipeline until it is full.
    pub fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) {
        let mut last_batch_id = self.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id) {
                Ok(Some(batch)) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch);
                }
                Ok(None) => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle(&self.env);
                    }
                    break;
                }
                Err(error) => {
                    self.disable_network_until_recovery(error, syncer);
                    break;
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream(syncer);
        }
    }

    /// Entry point for everything the stream tasks and timers report.
    pub fn handle_event(&mut self, event: RemoteStoreEvent, syncer: &mut dyn RemoteSyncer) {
        match event {
            RemoteStoreEvent::StreamOpened {
                kind,
                generation,
                handle,
            } => {
                if !self.is_current(kind, generation) {
                    discard_stale_handle(handle);
                    return;
                }
                match kind {
                    StreamKind::Listen => {
                        self.watch_stream.on_opened(&self.env, handle);
                        self.on_watch_stream_open(&*syncer);
                    }
                    StreamKind::Write => {
                        self.write_stream.on_opened(&self.env, handle);
                        self.write_stream.write_handshake(&self.env);
                    }
                }
            }
            RemoteStoreEvent::StreamMessage {
                kind,
                generation,
                message,
            } => {
                if !self.is_current(kind, generation) {
                    return;
                }
                match (kind, message) {
                    (StreamKind::Listen, ServerMessage::Listen(change)) => {
                        self.on_watch_stream_change(change, syncer)
                    }
                    (StreamKind::Write, ServerMessage::Write(response)) => {
                        self.on_write_stream_response(response, syncer)
                    }
                    (kind, message) => {
                        log::warn!("ignoring unexpected message on {kind} stream: {message:?}")
                    }
                }
            }
            RemoteStoreEvent::StreamClosed {
                kind,
                generation,
                error,
            } => {
                if !self.is_current(kind, generation) {
                    return;
                }
                match kind {
                    StreamKind::Listen => {
                        self.watch_stream.handle_stream_close(&error, &self.env);
                        self.on_watch_stream_close(Some(error), syncer);
                    }
                    StreamKind::Write => {
                        self.write_stream.handle_stream_close(&error, &self.env);
                        self.on_write_stream_close(Some(error), syncer);
                    }
                }
            }
            RemoteStoreEvent::BackoffElapsed { kind, generation } => {
                if !self.is_current(kind, generation) {
                    return;
                }
                match kind {
                    StreamKind::Listen => {
                        self.watch_stream.on_backoff_elapsed(&self.env);
                    }
                    StreamKind::Write => {
                        self.write_stream.on_backoff_elapsed(&self.env);
                    }
                }
            }
            RemoteStoreEvent::IdleTimeout { kind, generation } => {
                if !self.is_current(kind, generation) {
                    return;
                }
                match kind {
                    StreamKind::Listen => {
                        if self.watch_stream.on_idle_timeout(&self.env) {
                            self.on_watch_stream_close(None, syncer);
                        }
                    }
                    StreamKind::Write => {
                        if self.write_stream.on_idle_timeout(&self.env) {
                            self.on_write_stream_close(None, syncer);
                        }
                    }
                }
            }
            RemoteStoreEvent::HealthCheck { kind, generation } => {
                if !self.is_current(kind, generation) {
                    return;
                }
                match kind {
                    StreamKind::Listen => self.watch_stream.on_health_check(),
                    StreamKind::Write => self.write_stream.on_health_check(),
                }
            }
            RemoteStoreEvent::OnlineStateTimeout => {
                let changed = self.online_state_tracker.handle_online_state_timeout();
                broadcast(changed, syncer);
            }
            RemoteStoreEvent::PersistenceProbe => self.probe_persistence(syncer),
        }
    }

    fn is_current(&self, kind: StreamKind, generation: u64) -> bool {
        match kind {
            StreamKind::Listen => self.watch_stream.is_current(generation),
            StreamKind::Write => self.write_stream.is_current(generation),
        }
    }

    fn enable_network_internal(&mut self, syncer: &mut dyn RemoteSyncer) {
        if !self.can_use_network() {
            return;
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else {
            let changed = self.online_state_tracker.set(OnlineState::Unknown);
            broadcast(changed, syncer);
        }
        self.fill_write_pipeline(syncer);
    }

    fn disable_network_internal(&mut self) {
        self.write_stream.stop(&self.env);
        self.watch_stream.stop(&self.env);
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.aggregator = None;
    }

    /// Local persistence failed: go offline and probe until it works again.
    /// Any other error is logged and dropped.
    fn disable_network_until_recovery(&mut self, error: FirestoreError, syncer: &mut dyn RemoteSyncer) {
        if !error.is_primary_lease_lost() {
            log::warn!("remote store operation failed: {error}");
            return;
        }
        log::warn!("persistence failed, disabling network until it recovers: {error}");
        self.offline_causes.insert(OfflineCause::PersistenceFailed);
        self.disable_network_internal();
        let changed = self.online_state_tracker.set(OnlineState::Offline);
        broadcast(changed, syncer);
        self.schedule_persistence_probe();
    }

    fn schedule_persistence_probe(&mut self) {
        if let Some(probe) = self.persistence_probe.take() {
            probe.cancel();
        }
        let delay = self.persistence_backoff.next_delay();
        self.persistence_probe = Some(self.env.scheduler.deliver_after(
            TimerId::PersistenceRecovery,
            delay,
            RemoteStoreEvent::PersistenceProbe,
        ));
    }

    fn probe_persistence(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.persistence_probe = None;
        if !self.offline_causes.contains(&OfflineCause::PersistenceFailed) {
            return;
        }
        self.persistence_backoff.record_attempt();
        match syncer.get_last_remote_snapshot_version() {
            Ok(_) => {
                log::debug!("persistence recovered, re-enabling network");
                self.persistence_backoff.reset();
                self.offline_causes.remove(&OfflineCause::PersistenceFailed);
                self.enable_network_internal(syncer);
            }
            Err(error) => {
                log::debug!("persistence still unavailable: {error}");
                self.schedule_persistence_probe();
            }
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, syncer: &mut dyn RemoteSyncer) {
        hard_assert(self.should_start_watch_stream(), "watch stream started unnecessarily");
        self.aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
        self.watch_stream.start(&self.env);
        let changed = self
            .online_state_tracker
            .handle_watch_stream_start(self.env.scheduler.as_ref());
        broadcast(changed, syncer);
    }

    fn send_watch_request(&mut self, syncer: &dyn RemoteSyncer, target_data: &TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let resuming = !target_data.resume_token.is_empty()
            || target_data.snapshot_version > SnapshotVersion::min();
        if resuming {
            let expected_count = syncer.get_remote_keys_for_target(target_id).len() as i32;
            let request = target_data.with_expected_count(expected_count);
            self.watch_stream.watch(&self.env, &request);
        } else {
            self.watch_stream.watch(&self.env, target_data);
        }
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(&self.env, target_id);
    }

    fn on_watch_stream_open(&mut self, syncer: &dyn RemoteSyncer) {
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in &targets {
            self.send_watch_request(syncer, target_data);
        }
    }

    fn on_watch_stream_close(&mut self, error: Option<FirestoreError>, syncer: &mut dyn RemoteSyncer) {
        self.aggregator = None;
        if self.should_start_watch_stream() {
            if let Some(error) = &error {
                let changed = self.online_state_tracker.handle_watch_stream_failure(error);
                broadcast(changed, syncer);
            }
            self.start_watch_stream(syncer);
        } else {
            // No active attempt at connecting, so nothing is known.
            let changed = self.online_state_tracker.set(OnlineState::Unknown);
            broadcast(changed, syncer);
        }
    }

    fn on_watch_stream_change(&mut self, change: WatchChange, syncer: &mut dyn RemoteSyncer) {
        self.watch_stream.reset_backoff();
        let changed = self.online_state_tracker.set(OnlineState::Online);
        broadcast(changed, syncer);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove && target_change.cause.is_some() {
                // Rejected targets are reported right away rather than with the
                // next consistent snapshot.
                if let Err(error) = self.handle_target_error(target_change, syncer) {
                    self.disable_network_until_recovery(error, syncer);
                }
                return;
            }
        }

        let snapshot_version = change.snapshot_version();
        {
            let provider = ListenMetadata {
                listen_targets: &self.listen_targets,
                syncer: &*syncer,
            };
            let Some(aggregator) = self.aggregator.as_mut() else {
                return;
            };
            match &change {
                WatchChange::TargetChange(target_change) => {
                    aggregator.handle_target_change(target_change, &provider)
                }
                WatchChange::DocumentChange(document_change) => {
                    aggregator.handle_document_change(document_change, &provider)
                }
                WatchChange::DocumentDelete(delete) => {
                    aggregator.handle_document_delete(delete, &provider)
                }
                WatchChange::DocumentRemove(remove) => {
                    aggregator.handle_document_remove(remove, &provider)
                }
                WatchChange::ExistenceFilter(filter) => {
                    aggregator.handle_existence_filter(filter, &provider)
                }
            }
        }

        if snapshot_version.is_min() {
            return;
        }
        let result = syncer
            .get_last_remote_snapshot_version()
            .and_then(|last_remote_version| {
                if snapshot_version >= last_remote_version {
                    self.raise_watch_snapshot(snapshot_version, syncer)
                } else {
                    Ok(())
                }
            });
        if let Err(error) = result {
            self.disable_network_until_recovery(error, syncer);
        }
    }

    fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let event = {
            let provider = ListenMetadata {
                listen_targets: &self.listen_targets,
                syncer: &*syncer,
            };
            let Some(aggregator) = self.aggregator.as_mut() else {
                return Ok(());
            };
            aggregator.create_remote_event(snapshot_version, &provider)
        };

        // Keep in-memory resume tokens current; the local store persists them
        // when it applies the event.
        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        // Re-listen from scratch to targets whose existence filter did not
        // match.
        for (&target_id, &purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(&target_id).cloned() else {
                continue;
            };
            let cleared = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
            self.listen_targets.insert(target_id, cleared.clone());
            self.send_unwatch_request(target_id);
            // The mismatch purpose only tags this one request.
            let request = TargetData::new(
                cleared.target.clone(),
                target_id,
                purpose,
                cleared.sequence_number,
            );
            self.send_watch_request(&*syncer, &request);
        }

        syncer.apply_remote_event(event)
    }

    fn handle_target_error(
        &mut self,
        change: &WatchTargetChange,
        syncer: &mut dyn RemoteSyncer,
    ) -> FirestoreResult<()> {
        let Some(cause) = &change.cause else {
            return Ok(());
        };
        for &target_id in &change.target_ids {
            if self.listen_targets.contains_key(&target_id) {
                syncer.reject_listen(target_id, cause.clone())?;
                self.listen_targets.remove(&target_id);
                if let Some(aggregator) = self.aggregator.as_mut() {
                    aggregator.remove_target(target_id);
                }
            }
        }
        Ok(())
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream
                .write_mutations(&self.env, batch.mutations.clone());
        }
        self.write_pipeline.push_back(batch);
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn start_write_stream(&mut self, syncer: &mut dyn RemoteSyncer) {
        match syncer.get_last_stream_token() {
            Ok(stream_token) => self.write_stream.set_last_stream_token(stream_token),
            Err(error) => {
                self.disable_network_until_recovery(error, syncer);
                return;
            }
        }
        self.write_stream.start(&self.env);
    }

    fn on_write_stream_response(&mut self, response: WriteResponse, syncer: &mut dyn RemoteSyncer) {
        match self.write_stream.handle_response(response) {
            Ok(WriteStreamResponse::HandshakeComplete) => {
                let stream_token = self.write_stream.last_stream_token().to_vec();
                if let Err(error) = syncer.set_last_stream_token(stream_token) {
                    self.disable_network_until_recovery(error, syncer);
                    return;
                }
                let batches: Vec<_> = self
                    .write_pipeline
                    .iter()
                    .map(|batch| batch.mutations.clone())
                    .collect();
                for mutations in batches {
                    self.write_stream.write_mutations(&self.env, mutations);
                }
            }
            Ok(WriteStreamResponse::MutationResults {
                commit_version,
                results,
            }) => self.on_mutation_result(commit_version, results, syncer),
            Err(error) => {
                log::warn!("invalid write stream response: {error}");
                self.write_stream.handle_stream_close(&error, &self.env);
                self.on_write_stream_close(Some(error), syncer);
            }
        }
    }

    fn on_mutation_result(
        &mut self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
        syncer: &mut dyn RemoteSyncer,
    ) {
        let Some(batch) = self.write_pipeline.pop_front() else {
            log::warn!("received a write result with an empty write pipeline");
            return;
        };
        let stream_token = self.write_stream.last_stream_token().to_vec();
        let outcome = MutationBatchResult::from(batch, commit_version, results, stream_token)
            .and_then(|result| syncer.apply_successful_write(result));
        if let Err(error) = outcome {
            self.disable_network_until_recovery(error, syncer);
        }
        // The acknowledgement may have freed a slot.
        self.fill_write_pipeline(syncer);
    }

    fn on_write_stream_close(&mut self, error: Option<FirestoreError>, syncer: &mut dyn RemoteSyncer) {
        // After the handshake a failure is about the in-flight write.
        if let Some(error) = error {
            if self.write_stream.handshake_complete() {
                self.handle_write_error(error, syncer);
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream(syncer);
        }
    }

    fn handle_write_error(&mut self, error: FirestoreError, syncer: &mut dyn RemoteSyncer) {
        if !is_permanent_write_error(error.code) {
            // Transient: the retry resends the whole pipeline.
            return;
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return;
        };
        // The request was bad, not the backend, so retry right away.
        self.write_stream.inhibit_backoff();
        if let Err(failure) = syncer.reject_failed_write(batch.batch_id, error) {
            self.disable_network_until_recovery(failure, syncer);
        }
        self.fill_write_pipeline(syncer);
    }
}

fn broadcast(changed: Option<OnlineState>, syncer: &mut dyn RemoteSyncer) {
    if let Some(online_state) = changed {
        syncer.apply_online_state_change(online_state);
    }
}
