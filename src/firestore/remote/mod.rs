pub mod bloom_filter;
pub mod datastore;
mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod scheduler;
pub mod stream;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use datastore::{
    ClientMessage, Connection, InMemoryConnection, ListenRequest, MockServer, NoopTokenProvider,
    ServerMessage, StreamCredentials, StreamHandle, StreamKind, TokenProvider, TokenProviderArc,
    WatchTarget, WriteRequest, WriteResponse,
};
pub use online_state_tracker::OnlineStateTracker;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{OfflineCause, RemoteStore, RemoteStoreSettings};
pub use remote_syncer::RemoteSyncer;
pub use scheduler::{RemoteStoreEvent, RemoteStoreScheduler, SchedulerArc};
pub use watch_change::{
    BloomFilterParams, DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange,
    TargetChangeState, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
