#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;
use std::time::Duration;

use firestore_sync::firestore::core::{
    ChangeType, FieldFilter, FilterOperator, FirestoreClient, ListenOptions, OrderBy,
    OrderDirection, Query, SyncEngineContext, ViewSnapshot,
};
use firestore_sync::firestore::error::{failed_precondition, FirestoreErrorCode};
use firestore_sync::firestore::local::{MemoryKvStore, TargetPurpose};
use firestore_sync::firestore::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, MutationResult,
    ObjectValue, SnapshotVersion, Timestamp,
};
use firestore_sync::firestore::remote::{
    BloomFilter, DocumentChange, ExistenceFilterChange, ListenRequest, MockServer, StreamKind,
    TargetChangeState, WatchChange, WatchTarget, WatchTargetChange, WriteRequest, WriteResponse,
};
use firestore_sync::firestore::value::FirestoreValue;
use firestore_sync::util::PartialObserver;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn database_id() -> DatabaseId {
    DatabaseId::default("scenarios")
}

async fn start_client(server: &MockServer) -> FirestoreClient {
    let context = SyncEngineContext::new(
        database_id(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(server.connection()),
    );
    FirestoreClient::start(context).await.expect("start client")
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn field(name: &str) -> FieldPath {
    FieldPath::from_dot_separated(name).unwrap()
}

fn object(name: &str, value: i64) -> ObjectValue {
    let mut object = ObjectValue::empty();
    object.set(&field(name), FirestoreValue::from_integer(value));
    object
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn listen(
    client: &FirestoreClient,
    query: Query,
    options: ListenOptions,
) -> mpsc::UnboundedReceiver<ViewSnapshot> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let observer = PartialObserver::new().with_next(move |snapshot: &ViewSnapshot| {
        let _ = sender.send(snapshot.clone());
    });
    // Registrations live as long as the client in these scenarios.
    let _registration = client.listen(query, options, observer);
    receiver
}

/// Waits for the first snapshot accepted by `matches`.
async fn snapshot_where<F>(snapshots: &mut mpsc::UnboundedReceiver<ViewSnapshot>, matches: F) -> ViewSnapshot
where
    F: Fn(&ViewSnapshot) -> bool,
{
    timeout(WAIT, async {
        loop {
            let snapshot = snapshots.recv().await.expect("listener dropped");
            if matches(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("timed out waiting for a snapshot")
}

async fn next_watch_target(server: &MockServer) -> WatchTarget {
    match timeout(WAIT, server.next_listen_request()).await.unwrap().unwrap() {
        ListenRequest::AddTarget(target) => target,
        other => panic!("expected an add target request, got {other:?}"),
    }
}

async fn next_write(server: &MockServer) -> WriteRequest {
    timeout(WAIT, server.next_write_request()).await.unwrap().unwrap()
}

async fn watch(server: &MockServer, change: WatchChange) {
    server.send_watch_change(change).await.unwrap();
}

/// Replays a full initial sync of `documents` into `target_id`.
async fn sync_target(server: &MockServer, target_id: i32, documents: &[MutableDocument], at: i64) {
    watch(
        server,
        WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, vec![target_id])),
    )
    .await;
    for document in documents {
        watch(
            server,
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: Vec::new(),
                document: document.clone(),
            }),
        )
        .await;
    }
    watch(
        server,
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                .with_resume_token(format!("resume-{at}")),
        ),
    )
    .await;
    watch(
        server,
        WatchChange::TargetChange(WatchTargetChange::global_snapshot(version(at), format!("resume-{at}"))),
    )
    .await;
}

fn keys_of(snapshot: &ViewSnapshot) -> Vec<DocumentKey> {
    snapshot.documents.iter().map(|doc| doc.key().clone()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_is_visible_immediately_and_settles_after_ack() {
    let server = MockServer::new();
    let client = start_client(&server).await;
    client.disable_network().await.unwrap();

    let options = ListenOptions {
        include_metadata_changes: true,
        ..ListenOptions::default()
    };
    let mut snapshots = listen(&client, Query::collection("docs").unwrap(), options);

    let pending_write = tokio::spawn({
        let client = client.clone();
        async move { client.write(vec![Mutation::set(key("docs/a"), object("x", 1))]).await }
    });
    let pending = snapshot_where(&mut snapshots, |snapshot| snapshot.documents.len() == 1).await;
    assert_eq!(keys_of(&pending), vec![key("docs/a")]);
    assert!(pending.from_cache);
    assert!(pending.has_pending_writes());

    client.enable_network().await.unwrap();
    assert_eq!(next_write(&server).await, WriteRequest::Handshake);
    server
        .send_write_response(WriteResponse::handshake(b"token-1".to_vec()))
        .await
        .unwrap();
    let WriteRequest::Mutations { mutations, .. } = next_write(&server).await else {
        panic!("expected the queued mutation");
    };
    assert_eq!(mutations, vec![Mutation::set(key("docs/a"), object("x", 1))]);
    server
        .send_write_response(WriteResponse::committed(
            b"token-2".to_vec(),
            version(10),
            vec![MutationResult::new(version(10))],
        ))
        .await
        .unwrap();

    let acknowledged = snapshot_where(&mut snapshots, |snapshot| !snapshot.has_pending_writes()).await;
    assert_eq!(keys_of(&acknowledged), vec![key("docs/a")]);
    timeout(WAIT, pending_write).await.unwrap().unwrap().unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_batch_leaves_only_the_acknowledged_write() {
    let server = MockServer::new();
    let client = start_client(&server).await;

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.write(vec![Mutation::set(key("docs/a"), object("x", 1))]).await }
    });
    assert_eq!(next_write(&server).await, WriteRequest::Handshake);
    server
        .send_write_response(WriteResponse::handshake(b"token-1".to_vec()))
        .await
        .unwrap();
    assert!(matches!(next_write(&server).await, WriteRequest::Mutations { .. }));

    let second = tokio::spawn({
        let client = client.clone();
        async move {
            let patch = Mutation::patch(
                key("docs/a"),
                object("x", 2),
                FieldMask::new(vec![field("x")]),
            );
            client.write(vec![patch]).await
        }
    });
    assert!(matches!(next_write(&server).await, WriteRequest::Mutations { .. }));

    server
        .send_write_response(WriteResponse::committed(
            b"token-2".to_vec(),
            version(10),
            vec![MutationResult::new(version(10))],
        ))
        .await
        .unwrap();
    timeout(WAIT, first).await.unwrap().unwrap().unwrap();

    server
        .fail_stream(StreamKind::Write, failed_precondition("the document changed"))
        .await
        .unwrap();
    let rejection = timeout(WAIT, second).await.unwrap().unwrap().unwrap_err();
    assert_eq!(rejection.code, FirestoreErrorCode::FailedPrecondition);

    let document = client
        .get_document_from_local_cache(key("docs/a"))
        .await
        .unwrap()
        .expect("document should be cached");
    assert_eq!(document.field(&field("x")), Some(&FirestoreValue::from_integer(1)));
    assert!(!document.has_local_mutations());
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn limit_query_swaps_in_a_promoted_document() {
    let server = MockServer::new();
    let client = start_client(&server).await;
    let query = Query::collection("scores")
        .unwrap()
        .with_filter(FieldFilter::new(
            field("score"),
            FilterOperator::GreaterThan,
            FirestoreValue::from_integer(0),
        ))
        .with_order_by(OrderBy::new(field("score"), OrderDirection::Descending))
        .with_limit_to_first(2);
    let mut snapshots = listen(&client, query, ListenOptions::default());

    let target = next_watch_target(&server).await;
    let documents = [("scores/ten", 10), ("scores/seven", 7), ("scores/five", 5)]
        .map(|(path, score)| MutableDocument::new_found(key(path), version(1), object("score", score)));
    sync_target(&server, target.target_id, &documents, 1).await;

    let synced = snapshot_where(&mut snapshots, |snapshot| !snapshot.from_cache).await;
    assert_eq!(keys_of(&synced), vec![key("scores/ten"), key("scores/seven")]);

    watch(
        &server,
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: vec![target.target_id],
            removed_target_ids: Vec::new(),
            document: MutableDocument::new_found(key("scores/five"), version(2), object("score", 12)),
        }),
    )
    .await;
    watch(
        &server,
        WatchChange::TargetChange(WatchTargetChange::global_snapshot(version(2), b"resume-2".to_vec())),
    )
    .await;

    let updated = snapshot_where(&mut snapshots, |snapshot| !snapshot.document_changes.is_empty()).await;
    let changes: Vec<_> = updated
        .document_changes
        .iter()
        .map(|change| (change.change_type, change.document.key().clone()))
        .collect();
    assert_eq!(
        changes,
        vec![
            (ChangeType::Removed, key("scores/seven")),
            (ChangeType::Added, key("scores/five")),
        ]
    );
    assert_eq!(keys_of(&updated), vec![key("scores/five"), key("scores/ten")]);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bloom_filter_drops_missing_document_without_resetting_the_target() {
    let server = MockServer::new();
    let client = start_client(&server).await;
    let mut snapshots = listen(&client, Query::collection("items").unwrap(), ListenOptions::default());

    let target = next_watch_target(&server).await;
    let documents = ["items/k1", "items/k2"]
        .map(|path| MutableDocument::new_found(key(path), version(1), object("n", 1)));
    sync_target(&server, target.target_id, &documents, 1).await;
    let synced = snapshot_where(&mut snapshots, |snapshot| !snapshot.from_cache).await;
    assert_eq!(synced.documents.len(), 2);

    let kept = database_id().document_name(&key("items/k1"));
    let filter = BloomFilter::create(1024, 5, [kept.as_str()]).unwrap();
    watch(
        &server,
        WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id: target.target_id,
            count: 1,
            unchanged_names: Some(filter.to_params()),
        }),
    )
    .await;
    watch(
        &server,
        WatchChange::TargetChange(WatchTargetChange::global_snapshot(version(2), b"resume-2".to_vec())),
    )
    .await;

    // The query target stays as it is; only a limbo lookup for k2 goes out.
    let limbo = next_watch_target(&server).await;
    assert_eq!(limbo.purpose, TargetPurpose::LimboResolution);
    assert!(limbo.target.is_document_target());
    assert_eq!(limbo.target.path, key("items/k2").path().clone());

    sync_target(&server, limbo.target_id, &[], 3).await;
    let resolved = snapshot_where(&mut snapshots, |snapshot| snapshot.documents.len() == 1).await;
    assert_eq!(keys_of(&resolved), vec![key("items/k1")]);
    assert!(resolved
        .document_changes
        .iter()
        .any(|change| change.change_type == ChangeType::Removed && change.document.key() == &key("items/k2")));
    assert_eq!(
        client
            .get_documents_from_local_cache(Query::collection("items").unwrap())
            .await
            .unwrap()
            .documents
            .len(),
        1
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    while server.pending_listen_requests() > 0 {
        let request = server.next_listen_request().await.unwrap();
        assert!(
            !matches!(&request, ListenRequest::AddTarget(t) if t.target_id == target.target_id),
            "query target was reset: {request:?}"
        );
    }
    client.shutdown().await.unwrap();
}
