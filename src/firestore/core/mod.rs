pub mod async_queue;
pub mod document_set;
pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod sync_engine;
pub mod target;
mod target_id_generator;
mod types;
mod user;
pub mod view;
pub mod view_snapshot;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use document_set::{DocumentComparator, DocumentSet};
pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryListener};
#[doc(inline)]
pub use firestore_client::{ClientSettings, FirestoreClient, ListenerRegistration, SyncEngineContext};
pub use query::{LimitType, Query};
#[doc(inline)]
pub use sync_engine::{
    BundleLoadResult, LoadedBundle, RemoteCommand, SyncEngine, SyncEngineEvent, WriteCallback,
};
pub use target::{Bound, FieldFilter, FilterOperator, OrderBy, OrderDirection, Target};
pub use target_id_generator::TargetIdGenerator;
pub use types::OnlineState;
pub use user::User;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
