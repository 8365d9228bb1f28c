use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::error::{failed_precondition, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::remote::watch_change::WatchChange;

use super::{
    ClientMessage, Connection, ListenRequest, ServerMessage, StreamCredentials, StreamHandle,
    StreamKind, WriteRequest, WriteResponse,
};

type Inbound = FirestoreResult<ServerMessage>;

#[derive(Default)]
struct ServerState {
    /// Sender for the most recently opened stream of each kind.
    outbound: HashMap<StreamKind, Sender<Inbound>>,
    open_failures: HashMap<StreamKind, VecDeque<FirestoreError>>,
    open_counts: HashMap<StreamKind, usize>,
    credentials: HashMap<StreamKind, StreamCredentials>,
}

struct ServerInner {
    state: Mutex<ServerState>,
    listen_requests: (Sender<ListenRequest>, Receiver<ListenRequest>),
    write_requests: (Sender<WriteRequest>, Receiver<WriteRequest>),
}

/// Scriptable backend for tests.
///
/// Requests from every stream of a kind land in one queue, and responses go
/// to the most recently opened stream of that kind.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<ServerInner>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                state: Mutex::new(ServerState::default()),
                listen_requests: async_channel::unbounded(),
                write_requests: async_channel::unbounded(),
            }),
        }
    }

    pub fn connection(&self) -> InMemoryConnection {
        InMemoryConnection {
            server: self.clone(),
        }
    }

    /// Waits for the next add or remove target request.
    pub async fn next_listen_request(&self) -> FirestoreResult<ListenRequest> {
        self.inner
            .listen_requests
            .1
            .recv()
            .await
            .map_err(|_| unavailable("mock server stopped"))
    }

    /// Waits for the next handshake or mutation request.
    pub async fn next_write_request(&self) -> FirestoreResult<WriteRequest> {
        self.inner
            .write_requests
            .1
            .recv()
            .await
            .map_err(|_| unavailable("mock server stopped"))
    }

    /// Listen requests received but not yet taken.
    pub fn pending_listen_requests(&self) -> usize {
        self.inner.listen_requests.1.len()
    }

    pub fn pending_write_requests(&self) -> usize {
        self.inner.write_requests.1.len()
    }

    pub async fn send_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        self.send(StreamKind::Listen, Ok(ServerMessage::Listen(change)))
            .await
    }

    pub async fn send_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
        self.send(StreamKind::Write, Ok(ServerMessage::Write(response)))
            .await
    }

    /// Fails the current stream of `kind` with `error`.
    pub async fn fail_stream(&self, kind: StreamKind, error: FirestoreError) -> FirestoreResult<()> {
        let sender = self.inner.state.lock().await.outbound.remove(&kind);
        let Some(sender) = sender else {
            return Err(failed_precondition(format!("no open {kind} stream")));
        };
        // The client may already have hung up; the failure is moot then.
        let _ = sender.send(Err(error)).await;
        sender.close();
        Ok(())
    }

    /// Makes the next attempt to open a stream of `kind` fail.
    pub async fn fail_next_open(&self, kind: StreamKind, error: FirestoreError) {
        self.inner
            .state
            .lock()
            .await
            .open_failures
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// Successful opens of `kind` so far.
    pub async fn open_count(&self, kind: StreamKind) -> usize {
        self.inner
            .state
            .lock()
            .await
            .open_counts
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    pub async fn last_credentials(&self, kind: StreamKind) -> Option<StreamCredentials> {
        self.inner.state.lock().await.credentials.get(&kind).cloned()
    }

    pub async fn has_open_stream(&self, kind: StreamKind) -> bool {
        self.inner
            .state
            .lock()
            .await
            .outbound
            .get(&kind)
            .is_some_and(|sender| !sender.is_closed())
    }

    async fn send(&self, kind: StreamKind, message: Inbound) -> FirestoreResult<()> {
        let sender = self.inner.state.lock().await.outbound.get(&kind).cloned();
        let Some(sender) = sender else {
            return Err(failed_precondition(format!("no open {kind} stream")));
        };
        sender
            .send(message)
            .await
            .map_err(|_| failed_precondition(format!("the {kind} stream was closed by the client")))
    }

    async fn open(&self, kind: StreamKind, credentials: StreamCredentials) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let mut state = self.inner.state.lock().await;
        if let Some(error) = state
            .open_failures
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let (sender, receiver) = async_channel::unbounded();
        if let Some(previous) = state.outbound.insert(kind, sender) {
            previous.close();
        }
        *state.open_counts.entry(kind).or_default() += 1;
        state.credentials.insert(kind, credentials);
        log::debug!("mock server accepted {kind} stream");
        Ok(Arc::new(InMemoryStream {
            kind,
            server: Arc::clone(&self.inner),
            inbound: receiver,
            closed: AtomicBool::new(false),
        }))
    }
}

/// [`Connection`] whose streams talk to a [`MockServer`].
#[derive(Clone)]
pub struct InMemoryConnection {
    server: MockServer,
}

impl InMemoryConnection {
    pub fn server(&self) -> &MockServer {
        &self.server
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> FirestoreResult<Arc<dyn StreamHandle>> {
        self.server.open(kind, credentials).await
    }
}

struct InMemoryStream {
    kind: StreamKind,
    server: Arc<ServerInner>,
    inbound: Receiver<Inbound>,
    closed: AtomicBool,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamHandle for InMemoryStream {
    async fn send(&self, message: ClientMessage) -> FirestoreResult<()> {
        if self.closed.load(Ordering::SeqCst) || self.inbound.is_closed() {
            return Err(unavailable(format!("the {} stream is closed", self.kind)));
        }
        let delivered = match (self.kind, message) {
            (StreamKind::Listen, ClientMessage::Listen(request)) => {
                self.server.listen_requests.0.send(request).await.is_ok()
            }
            (StreamKind::Write, ClientMessage::Write(request)) => {
                self.server.write_requests.0.send(request).await.is_ok()
            }
            (kind, message) => {
                return Err(failed_precondition(format!(
                    "unexpected message on {kind} stream: {message:?}"
                )))
            }
        };
        if delivered {
            Ok(())
        } else {
            Err(unavailable("mock server stopped"))
        }
    }

    async fn next(&self) -> Option<FirestoreResult<ServerMessage>> {
        self.inbound.recv().await.ok()
    }

    async fn close(&self) -> FirestoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::remote::watch_change::{TargetChangeState, WatchTargetChange};

    #[tokio::test]
    async fn requests_and_responses_flow_through_the_current_stream() {
        let server = MockServer::new();
        let connection = server.connection();
        let stream = connection
            .open_stream(StreamKind::Listen, StreamCredentials::default())
            .await
            .unwrap();
        assert_eq!(server.open_count(StreamKind::Listen).await, 1);

        stream
            .send(ClientMessage::Listen(ListenRequest::RemoveTarget(4)))
            .await
            .unwrap();
        assert_eq!(server.next_listen_request().await.unwrap(), ListenRequest::RemoveTarget(4));

        let change = WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, vec![4]));
        server.send_watch_change(change.clone()).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok(ServerMessage::Listen(change))));
    }

    #[tokio::test]
    async fn scripted_open_failures_are_consumed_in_order() {
        let server = MockServer::new();
        server
            .fail_next_open(StreamKind::Write, unavailable("down"))
            .await;
        let connection = server.connection();
        let first = connection
            .open_stream(StreamKind::Write, StreamCredentials::default())
            .await;
        assert!(matches!(first, Err(ref e) if e.code == FirestoreErrorCode::Unavailable));
        assert!(connection
            .open_stream(StreamKind::Write, StreamCredentials::default())
            .await
            .is_ok());
        assert_eq!(server.open_count(StreamKind::Write).await, 1);
    }

    #[tokio::test]
    async fn failing_a_stream_delivers_the_error_then_ends_it() {
        let server = MockServer::new();
        let stream = server
            .connection()
            .open_stream(StreamKind::Listen, StreamCredentials::default())
            .await
            .unwrap();
        server
            .fail_stream(StreamKind::Listen, unavailable("reset"))
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Some(Err(_))));
        assert_eq!(stream.next().await, None);
        assert!(!server.has_open_stream(StreamKind::Listen).await);
    }

    #[tokio::test]
    async fn closed_streams_reject_sends() {
        let server = MockServer::new();
        let stream = server
            .connection()
            .open_stream(StreamKind::Write, StreamCredentials::default())
            .await
            .unwrap();
        stream.close().await.unwrap();
        assert!(stream
            .send(ClientMessage::Write(WriteRequest::Handshake))
            .await
            .is_err());
        assert!(server.send_write_response(WriteResponse::handshake(Vec::<u8>::new())).await.is_err());
    }
}
