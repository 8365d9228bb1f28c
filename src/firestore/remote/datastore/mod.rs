use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::core::Target;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{TargetData, TargetId, TargetPurpose};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::watch_change::WatchChange;

pub mod in_memory;

/// The two long-lived bidirectional streams the client keeps with the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Listen => f.write_str("listen"),
            StreamKind::Write => f.write_str("write"),
        }
    }
}

/// Tokens attached to a stream when it is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

/// Target description sent when the client starts watching a target.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchTarget {
    pub target_id: TargetId,
    pub target: Target,
    pub resume_token: Option<Vec<u8>>,
    pub read_time: Option<SnapshotVersion>,
    /// Number of documents the client believes match, sent with a resume so
    /// the server can answer with an existence filter.
    pub expected_count: Option<i32>,
    pub purpose: TargetPurpose,
}

impl WatchTarget {
    /// Resumes from the token if there is one, otherwise from the snapshot
    /// version when the target was ever synced.
    pub fn from_target_data(target_data: &TargetData) -> Self {
        let mut watch_target = Self {
            target_id: target_data.target_id,
            target: target_data.target.clone(),
            resume_token: None,
            read_time: None,
            expected_count: None,
            purpose: target_data.purpose,
        };
        if !target_data.resume_token.is_empty() {
            watch_target.resume_token = Some(target_data.resume_token.clone());
            watch_target.expected_count = target_data.expected_count;
        } else if target_data.snapshot_version > SnapshotVersion::min() {
            watch_target.read_time = Some(target_data.snapshot_version);
            watch_target.expected_count = target_data.expected_count;
        }
        watch_target
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ListenRequest {
    AddTarget(WatchTarget),
    RemoveTarget(TargetId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// First message on a fresh write stream; carries no mutations.
    Handshake,
    Mutations {
        stream_token: Vec<u8>,
        mutations: Vec<Mutation>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    /// Absent on the handshake response.
    pub commit_version: Option<SnapshotVersion>,
    pub write_results: Vec<MutationResult>,
}

impl WriteResponse {
    pub fn handshake(stream_token: impl Into<Vec<u8>>) -> Self {
        Self {
            stream_token: stream_token.into(),
            commit_version: None,
            write_results: Vec::new(),
        }
    }

    pub fn committed(
        stream_token: impl Into<Vec<u8>>,
        commit_version: SnapshotVersion,
        write_results: Vec<MutationResult>,
    ) -> Self {
        Self {
            stream_token: stream_token.into(),
            commit_version: Some(commit_version),
            write_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Listen(ListenRequest),
    Write(WriteRequest),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Listen(WatchChange),
    Write(WriteResponse),
}

/// One open bidirectional stream.
///
/// `send` and `next` are called from different tasks, so implementations must
/// allow them to run concurrently.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamHandle: Send + Sync + 'static {
    async fn send(&self, message: ClientMessage) -> FirestoreResult<()>;
    /// Next message from the server. `None` once the stream has closed.
    async fn next(&self) -> Option<FirestoreResult<ServerMessage>>;
    async fn close(&self) -> FirestoreResult<()>;
}

/// Transport that can open listen and write streams against a backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> FirestoreResult<Arc<dyn StreamHandle>>;
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

pub use in_memory::{InMemoryConnection, MockServer};
