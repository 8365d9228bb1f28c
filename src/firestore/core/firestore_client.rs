use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, ListenerId, QueryListener};
use crate::firestore::core::sync_engine::{
    BundleLoadResult, LoadedBundle, RemoteCommand, SyncEngine, SyncEngineEvent,
};
use crate::firestore::core::view::View;
use crate::firestore::core::{
    AsyncQueue, DelayedOperation, OnlineState, Query, TimerId, User, ViewSnapshot,
};
use crate::firestore::error::{cancelled, unavailable, FirestoreResult};
use crate::firestore::local::{
    GarbageCollectionPolicy, IndexAutoCreationSettings, KvStore, LocalStore, NamedQuery,
    Persistence,
};
use crate::firestore::model::{DatabaseId, DocumentKey, FieldIndex, MutableDocument, Mutation};
use crate::firestore::remote::{
    Connection, NoopTokenProvider, RemoteStore, RemoteStoreEvent, RemoteStoreScheduler,
    RemoteStoreSettings, SchedulerArc, TokenProviderArc,
};
use crate::firestore::remote::stream::StreamSettings;
use crate::util::{BackoffSettings, PartialObserver};

/// Tunables for a [`FirestoreClient`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClientSettings {
    pub max_concurrent_limbo_resolutions: usize,
    pub gc_policy: GarbageCollectionPolicy,
    pub index_auto_creation: IndexAutoCreationSettings,
    pub backoff: BackoffSettings,
    /// How long the first connection attempt may take before listeners are
    /// told the client is offline.
    pub online_state_timeout: Duration,
    pub max_watch_stream_failures: u32,
    pub stream_idle_timeout: Duration,
    pub stream_healthy_timeout: Duration,
    pub max_pending_writes: usize,
    /// Capacity of each stream's outbound channel.
    pub stream_send_buffer: usize,
    pub index_backfill_interval: Duration,
    pub index_backfill_max_documents: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: 100,
            gc_policy: GarbageCollectionPolicy::Eager,
            index_auto_creation: IndexAutoCreationSettings::default(),
            backoff: BackoffSettings::default(),
            online_state_timeout: Duration::from_secs(10),
            max_watch_stream_failures: 1,
            stream_idle_timeout: Duration::from_secs(60),
            stream_healthy_timeout: Duration::from_secs(10),
            max_pending_writes: 10,
            stream_send_buffer: 256,
            index_backfill_interval: Duration::from_secs(60),
            index_backfill_max_documents: 50,
        }
    }
}

impl ClientSettings {
    fn remote_store_settings(&self) -> RemoteStoreSettings {
        RemoteStoreSettings {
            stream: StreamSettings {
                backoff: self.backoff,
                idle_timeout: self.stream_idle_timeout,
                healthy_timeout: self.stream_healthy_timeout,
                send_buffer: self.stream_send_buffer,
            },
            max_pending_writes: self.max_pending_writes,
            max_watch_stream_failures: self.max_watch_stream_failures,
            online_state_timeout: self.online_state_timeout,
        }
    }
}

/// Everything a client needs to run: settings, storage, transport, credentials
/// and the user it starts out as.
#[derive(Clone)]
pub struct SyncEngineContext {
    pub database_id: DatabaseId,
    pub settings: ClientSettings,
    pub kv_store: Arc<dyn KvStore>,
    pub connection: Arc<dyn Connection>,
    pub auth: TokenProviderArc,
    pub app_check: TokenProviderArc,
    pub user: User,
}

impl SyncEngineContext {
    /// Context with default settings, no credentials and an unauthenticated
    /// user.
    pub fn new(database_id: DatabaseId, kv_store: Arc<dyn KvStore>, connection: Arc<dyn Connection>) -> Self {
        Self {
            database_id,
            settings: ClientSettings::default(),
            kv_store,
            connection,
            auth: Arc::new(NoopTokenProvider),
            app_check: Arc::new(NoopTokenProvider),
            user: User::unauthenticated(),
        }
    }

    pub fn with_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    pub fn with_auth(mut self, auth: TokenProviderArc) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_app_check(mut self, app_check: TokenProviderArc) -> Self {
        self.app_check = app_check;
        self
    }
}

/// Handle returned by [`FirestoreClient::listen`].
pub struct ListenerRegistration {
    listener_id: ListenerId,
    muted: Arc<AtomicBool>,
    queue: AsyncQueue<ClientCore>,
}

impl ListenerRegistration {
    /// Stops delivering events. Safe to call more than once.
    pub fn remove(&self) {
        if self.muted.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener_id = self.listener_id;
        self.queue
            .enqueue_and_forget(move |core| core.unlisten(listener_id));
    }
}

/// The state owned by the client's async queue.
struct ClientCore {
    sync_engine: SyncEngine,
    remote_store: RemoteStore,
    event_manager: EventManager,
    settings: ClientSettings,
    queue: AsyncQueue<ClientCore>,
    backfill_enabled: bool,
    backfill: Option<DelayedOperation>,
}

impl ClientCore {
    fn start(&mut self) {
        self.remote_store.start(&mut self.sync_engine);
        self.schedule_index_backfill();
        self.dispatch();
    }

    fn shutdown(&mut self) {
        if let Some(backfill) = self.backfill.take() {
            backfill.cancel();
        }
        self.event_manager.clear();
        self.remote_store.shutdown(&mut self.sync_engine);
        self.sync_engine.take_events();
        self.sync_engine.take_remote_commands();
    }

    fn listen(&mut self, listener_id: ListenerId, listener: QueryListener) {
        let sync_engine = &mut self.sync_engine;
        self.event_manager
            .listen(listener_id, listener, |query| sync_engine.listen(query));
        self.dispatch();
    }

    fn unlisten(&mut self, listener_id: ListenerId) {
        if let Some(query) = self.event_manager.unlisten(listener_id) {
            if let Err(error) = self.sync_engine.stop_listening(&query) {
                log::warn!("failed to stop listening to {}: {error}", query.canonical_id());
            }
        }
        self.dispatch();
    }

    fn handle_remote_event(&mut self, event: RemoteStoreEvent) {
        self.remote_store.handle_event(event, &mut self.sync_engine);
        self.dispatch();
    }

    /// Drains what the sync engine produced: listener events first, then
    /// work for the remote store, until neither side has anything left.
    fn dispatch(&mut self) {
        loop {
            let events = self.sync_engine.take_events();
            let commands = self.sync_engine.take_remote_commands();
            if events.is_empty() && commands.is_empty() {
                return;
            }
            for event in events {
                match event {
                    SyncEngineEvent::Snapshots(snapshots) => self.event_manager.on_watch_change(snapshots),
                    SyncEngineEvent::QueryError(query, error) => {
                        self.event_manager.on_watch_error(&query, &error)
                    }
                    SyncEngineEvent::OnlineStateChanged(online_state) => {
                        self.event_manager.on_online_state_change(online_state)
                    }
                }
            }
            for command in commands {
                match command {
                    RemoteCommand::Listen(target_data) => {
                        self.remote_store.listen(&mut self.sync_engine, target_data)
                    }
                    RemoteCommand::Unlisten(target_id) => {
                        self.remote_store.unlisten(&mut self.sync_engine, target_id)
                    }
                    RemoteCommand::FillWritePipeline => {
                        self.remote_store.fill_write_pipeline(&mut self.sync_engine)
                    }
                }
            }
        }
    }

    fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let result = self
            .sync_engine
            .local_store()
            .execute_query(&query, true)?;
        let mut view = View::new(query, result.remote_keys);
        let changes = view.compute_doc_changes(result.documents.values(), None);
        let snapshot = view.apply_changes(changes, false, None, false).snapshot;
        Ok(snapshot.unwrap_or_else(|| view.compute_initial_snapshot()))
    }

    fn schedule_index_backfill(&mut self) {
        let wanted = self.backfill_enabled || self.settings.index_auto_creation.enabled;
        if !wanted || self.backfill.is_some() {
            return;
        }
        self.backfill = Some(self.queue.enqueue_after_delay(
            TimerId::IndexBackfill,
            self.settings.index_backfill_interval,
            |core| {
                core.backfill = None;
                core.run_index_backfill();
                core.schedule_index_backfill();
            },
        ));
    }

    fn run_index_backfill(&mut self) -> usize {
        match self
            .sync_engine
            .local_store()
            .backfill_indexes(self.settings.index_backfill_max_documents)
        {
            Ok(written) => {
                log::debug!("index backfill wrote {written} documents");
                written
            }
            Err(error) if error.is_primary_lease_lost() => {
                log::debug!("skipping index backfill without the primary lease");
                0
            }
            Err(error) => {
                log::warn!("index backfill failed: {error}");
                0
            }
        }
    }
}

struct QueueScheduler {
    queue: AsyncQueue<ClientCore>,
}

impl RemoteStoreScheduler for QueueScheduler {
    fn deliver(&self, event: RemoteStoreEvent) {
        self.queue
            .enqueue_and_forget(move |core| core.handle_remote_event(event));
    }

    fn deliver_after(&self, timer_id: TimerId, delay: Duration, event: RemoteStoreEvent) -> DelayedOperation {
        self.queue
            .enqueue_after_delay(timer_id, delay, move |core| core.handle_remote_event(event))
    }
}

fn muted_observer(observer: PartialObserver<ViewSnapshot>, muted: Arc<AtomicBool>) -> PartialObserver<ViewSnapshot> {
    let next_observer = observer.clone();
    let next_muted = Arc::clone(&muted);
    PartialObserver::new()
        .with_next(move |snapshot| {
            if !next_muted.load(Ordering::SeqCst) {
                next_observer.notify_next(snapshot);
            }
        })
        .with_error(move |error| {
            // A failed listener is dead; it hears about the failure once.
            if !muted.swap(true, Ordering::SeqCst) {
                observer.notify_error(error);
            }
        })
}

/// Entry point for applications: owns the async queue that runs the sync
/// engine, the remote store and the event manager.
///
/// Cloning is cheap and every clone talks to the same client.
#[derive(Clone)]
pub struct FirestoreClient {
    queue: AsyncQueue<ClientCore>,
    next_listener_id: Arc<AtomicU64>,
}

impl FirestoreClient {
    /// Builds every component from `context` and brings the network up.
    pub async fn start(context: SyncEngineContext) -> FirestoreResult<Self> {
        let SyncEngineContext {
            database_id,
            settings,
            kv_store,
            connection,
            auth,
            app_check,
            user,
        } = context;
        log::debug!(
            "starting client for {}/{} as {user}",
            database_id.project_id(),
            database_id.database()
        );

        let queue = AsyncQueue::start_with(move |queue: AsyncQueue<ClientCore>| {
            let local_store = LocalStore::new(
                Persistence::new(kv_store),
                &user,
                settings.gc_policy,
                settings.index_auto_creation.clone(),
            );
            let sync_engine = SyncEngine::new(local_store, user, settings.max_concurrent_limbo_resolutions);
            let scheduler: SchedulerArc = Arc::new(QueueScheduler { queue: queue.clone() });
            let remote_store = RemoteStore::new(
                database_id,
                connection,
                auth,
                app_check,
                scheduler,
                settings.remote_store_settings(),
            );
            ClientCore {
                sync_engine,
                remote_store,
                event_manager: EventManager::new(),
                settings,
                queue,
                backfill_enabled: false,
                backfill: None,
            }
        });
        queue.enqueue(ClientCore::start).await?;
        Ok(Self {
            queue,
            next_listener_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Takes the network down, drops every listener and stops the queue.
    /// Later calls fail with `Cancelled`.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        if self.queue.is_shutting_down() {
            return Ok(());
        }
        self.queue.enqueue(ClientCore::shutdown).await?;
        self.queue.shutdown().await;
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Starts listening to `query`. The observer gets the first snapshot
    /// from the cache and every change after that.
    pub fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: PartialObserver<ViewSnapshot>,
    ) -> ListenerRegistration {
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let muted = Arc::new(AtomicBool::new(false));
        let observer = muted_observer(observer, Arc::clone(&muted));
        if self.queue.is_shutting_down() {
            observer.notify_error(&cancelled("The client has already been shut down"));
        } else {
            let listener = QueryListener::new(query, options, observer);
            self.queue
                .enqueue_and_forget(move |core| core.listen(listener_id, listener));
        }
        ListenerRegistration {
            listener_id,
            muted,
            queue: self.queue.clone(),
        }
    }

    /// Applies `mutations` locally as one batch and resolves once the backend
    /// accepted them. Rejections come back as the backend's error.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (callback, result) = oneshot::channel();
        self.queue
            .enqueue(move |core| {
                core.sync_engine.write(mutations, callback);
                core.dispatch();
            })
            .await?;
        result
            .await
            .map_err(|_| cancelled("The client shut down before the write was acknowledged"))?
    }

    /// Cached document for `key` with local writes applied. `None` when the
    /// cache knows the document does not exist.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<Option<MutableDocument>> {
        let document = self
            .queue
            .enqueue(move |core| core.sync_engine.local_store().get_document(&key))
            .await??;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(format!(
                "Failed to get document {} from cache. The document is not cached.",
                document.key()
            )))
        }
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.queue
            .enqueue(move |core| core.get_documents_from_local_cache(query))
            .await?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|core| {
                core.remote_store.enable_network(&mut core.sync_engine);
                core.dispatch();
            })
            .await
    }

    /// Closes both streams. Listeners see cached results and writes queue up
    /// until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|core| {
                core.remote_store.disable_network(&mut core.sync_engine);
                core.dispatch();
            })
            .await
    }

    pub async fn online_state(&self) -> FirestoreResult<OnlineState> {
        self.queue
            .enqueue(|core| core.remote_store.online_state())
            .await
    }

    /// Switches to `user`. Pending writes of the previous user stay queued
    /// for when they sign back in.
    pub async fn set_user(&self, user: User) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |core| {
                let result = core
                    .remote_store
                    .handle_credential_change(&mut core.sync_engine, &user);
                core.dispatch();
                result
            })
            .await?
    }

    /// Replaces the configured field indexes. Removed indexes are dropped
    /// and new ones are backfilled in the background.
    pub async fn configure_field_index(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |core| -> FirestoreResult<()> {
                core.sync_engine
                    .local_store()
                    .configure_field_indexes(&indexes)?;
                core.backfill_enabled = !indexes.is_empty();
                core.schedule_index_backfill();
                Ok(())
            })
            .await?
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |core| {
                core.settings.index_auto_creation.enabled = enabled;
                core.sync_engine
                    .local_store_mut()
                    .set_index_auto_creation_enabled(enabled);
                core.schedule_index_backfill();
            })
            .await
    }

    /// Runs one index backfill pass now. Returns the number of documents
    /// written to indexes.
    pub async fn backfill_indexes(&self) -> FirestoreResult<usize> {
        self.queue
            .enqueue(|core| {
                core.sync_engine
                    .local_store()
                    .backfill_indexes(core.settings.index_backfill_max_documents)
            })
            .await?
    }

    pub async fn load_bundle(&self, bundle: LoadedBundle) -> FirestoreResult<BundleLoadResult> {
        self.queue
            .enqueue(move |core| {
                let result = core.sync_engine.load_bundle(bundle);
                core.dispatch();
                result
            })
            .await?
    }

    pub async fn get_named_query(&self, name: impl Into<String>) -> FirestoreResult<Option<NamedQuery>> {
        let name = name.into();
        self.queue
            .enqueue(move |core| core.sync_engine.local_store().get_named_query(&name))
            .await?
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::local::{BundleMetadata, MemoryKvStore};
    use crate::firestore::model::{FieldPath, ObjectValue, SnapshotVersion, Timestamp};
    use crate::firestore::remote::{ListenRequest, MockServer, StreamKind};
    use crate::firestore::value::FirestoreValue;

    const WAIT: Duration = Duration::from_secs(5);

    async fn client(server: &MockServer) -> FirestoreClient {
        let context = SyncEngineContext::new(
            DatabaseId::default("project"),
            Arc::new(MemoryKvStore::new()),
            Arc::new(server.connection()),
        );
        FirestoreClient::start(context).await.unwrap()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> ObjectValue {
        let mut object = ObjectValue::empty();
        object.set(&FieldPath::from_dot_separated("x").unwrap(), FirestoreValue::from_integer(value));
        object
    }

    fn snapshot_channel() -> (PartialObserver<ViewSnapshot>, mpsc::UnboundedReceiver<ViewSnapshot>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let observer = PartialObserver::new().with_next(move |snapshot: &ViewSnapshot| {
            let _ = sender.send(snapshot.clone());
        });
        (observer, receiver)
    }

    #[test]
    fn default_settings() {
        let settings = ClientSettings::default();
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.gc_policy, GarbageCollectionPolicy::Eager);
        assert!(!settings.index_auto_creation.enabled);
        assert_eq!(settings.max_pending_writes, 10);
        let remote = settings.remote_store_settings();
        assert_eq!(remote.stream.idle_timeout, Duration::from_secs(60));
        assert_eq!(remote.stream.send_buffer, 256);
        assert_eq!(remote.online_state_timeout, Duration::from_secs(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cache_reads_reflect_local_writes() {
        let server = MockServer::new();
        let client = client(&server).await;
        client.disable_network().await.unwrap();

        let write = tokio::spawn({
            let client = client.clone();
            async move { client.write(vec![Mutation::set(key("rooms/a"), data(1))]).await }
        });
        let document = timeout(WAIT, async {
            loop {
                if let Ok(Some(document)) = client.get_document_from_local_cache(key("rooms/a")).await {
                    return document;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(document.has_local_mutations());

        let missing = client.get_document_from_local_cache(key("rooms/b")).await;
        assert_eq!(missing.unwrap_err().code, FirestoreErrorCode::Unavailable);

        let snapshot = client
            .get_documents_from_local_cache(Query::collection("rooms").unwrap())
            .await
            .unwrap();
        assert!(snapshot.from_cache);
        assert_eq!(snapshot.documents.len(), 1);

        client.shutdown().await.unwrap();
        let outcome = timeout(WAIT, write).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap_err().code, FirestoreErrorCode::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removed_listeners_stop_hearing_and_release_the_target() {
        let server = MockServer::new();
        let client = client(&server).await;
        let (observer, mut snapshots) = snapshot_channel();
        let registration = client.listen(
            Query::collection("rooms").unwrap(),
            ListenOptions::default(),
            observer,
        );
        let added = timeout(WAIT, server.next_listen_request()).await.unwrap().unwrap();
        let ListenRequest::AddTarget(target) = added else {
            panic!("expected an add target request, got {added:?}");
        };

        registration.remove();
        registration.remove();
        let removed = timeout(WAIT, server.next_listen_request()).await.unwrap().unwrap();
        assert_eq!(removed, ListenRequest::RemoveTarget(target.target_id));

        // Nothing reaches a removed listener, even once the target syncs.
        client.disable_network().await.unwrap();
        client.shutdown().await.unwrap();
        assert!(snapshots.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_after_shutdown_are_cancelled() {
        let server = MockServer::new();
        let client = client(&server).await;
        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        assert!(client.is_shut_down());

        let error = client.enable_network().await.unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::Cancelled);

        let (sender, mut errors) = mpsc::unbounded_channel();
        let observer = PartialObserver::new().with_error(move |error: &crate::firestore::error::FirestoreError| {
            let _ = sender.send(error.code);
        });
        client.listen(Query::collection("rooms").unwrap(), ListenOptions::default(), observer);
        assert_eq!(errors.recv().await, Some(FirestoreErrorCode::Cancelled));
        assert_eq!(server.open_count(StreamKind::Write).await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bundles_load_once() {
        let server = MockServer::new();
        let client = client(&server).await;
        let read_time = SnapshotVersion::new(Timestamp::new(5, 0));
        let document = MutableDocument::new_found(key("rooms/a"), read_time, data(3));
        let named_query = NamedQuery {
            name: "all-rooms".to_string(),
            query: Query::collection("rooms").unwrap(),
            read_time,
        };
        let bundle = LoadedBundle {
            metadata: BundleMetadata {
                id: "rooms-bundle".to_string(),
                version: 1,
                create_time: read_time,
            },
            documents: vec![document],
            named_queries: vec![(named_query.clone(), BTreeSet::from([key("rooms/a")]))],
        };

        let first = client.load_bundle(bundle.clone()).await.unwrap();
        assert_eq!(first, BundleLoadResult { documents_loaded: 1, skipped: false });
        let second = client.load_bundle(bundle).await.unwrap();
        assert!(second.skipped);

        let loaded = client.get_named_query("all-rooms").await.unwrap().unwrap();
        assert_eq!(loaded.query, named_query.query);
        let cached = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
        assert!(cached.is_some());
        client.shutdown().await.unwrap();
    }
}
