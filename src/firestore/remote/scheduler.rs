use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::firestore::core::{DelayedOperation, TimerId};
use crate::firestore::error::FirestoreError;
use crate::firestore::remote::datastore::{ServerMessage, StreamHandle, StreamKind};

/// Something that happened outside the async queue and must be handled on it.
///
/// Stream events carry the generation of the stream that produced them so
/// that late events from a stream the client already abandoned are ignored.
pub enum RemoteStoreEvent {
    StreamOpened {
        kind: StreamKind,
        generation: u64,
        handle: Arc<dyn StreamHandle>,
    },
    StreamMessage {
        kind: StreamKind,
        generation: u64,
        message: ServerMessage,
    },
    StreamClosed {
        kind: StreamKind,
        generation: u64,
        error: FirestoreError,
    },
    BackoffElapsed {
        kind: StreamKind,
        generation: u64,
    },
    IdleTimeout {
        kind: StreamKind,
        generation: u64,
    },
    HealthCheck {
        kind: StreamKind,
        generation: u64,
    },
    OnlineStateTimeout,
    PersistenceProbe,
}

impl fmt::Debug for RemoteStoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteStoreEvent::StreamOpened { kind, generation, .. } => {
                write!(f, "StreamOpened({kind}, {generation})")
            }
            RemoteStoreEvent::StreamMessage { kind, generation, .. } => {
                write!(f, "StreamMessage({kind}, {generation})")
            }
            RemoteStoreEvent::StreamClosed { kind, generation, error } => {
                write!(f, "StreamClosed({kind}, {generation}, {error})")
            }
            RemoteStoreEvent::BackoffElapsed { kind, generation } => {
                write!(f, "BackoffElapsed({kind}, {generation})")
            }
            RemoteStoreEvent::IdleTimeout { kind, generation } => {
                write!(f, "IdleTimeout({kind}, {generation})")
            }
            RemoteStoreEvent::HealthCheck { kind, generation } => {
                write!(f, "HealthCheck({kind}, {generation})")
            }
            RemoteStoreEvent::OnlineStateTimeout => f.write_str("OnlineStateTimeout"),
            RemoteStoreEvent::PersistenceProbe => f.write_str("PersistenceProbe"),
        }
    }
}

/// Hands events back to the queue that owns the remote store.
pub trait RemoteStoreScheduler: Send + Sync + 'static {
    fn deliver(&self, event: RemoteStoreEvent);

    fn deliver_after(&self, timer_id: TimerId, delay: Duration, event: RemoteStoreEvent) -> DelayedOperation;
}

pub type SchedulerArc = Arc<dyn RemoteStoreScheduler>;
