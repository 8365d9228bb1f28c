pub mod bundle_cache;
pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
mod target_data;

#[doc(inline)]
pub use bundle_cache::{BundleMetadata, NamedQuery};
#[doc(inline)]
pub use local_documents_view::DocumentMap;
#[doc(inline)]
pub use local_store::{
    GarbageCollectionPolicy, LocalStore, LocalViewChanges, LocalWriteResult, UserChangeResult,
};
#[doc(inline)]
pub use persistence::{KeyRange, KvStore, KvTransaction, MemoryKvStore, Persistence, TransactionMode};
#[doc(inline)]
pub use query_engine::{IndexAutoCreationSettings, QueryPath};
pub use reference_set::ReferenceSet;
pub use target_data::{
    ListenSequenceNumber, QueryResult, TargetData, TargetId, TargetPurpose, INVALID_SEQUENCE_NUMBER,
};
