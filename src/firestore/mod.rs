//! Client-side cache and synchronization engine for a Firestore-style
//! document database.
//!
//! [`core::FirestoreClient`] is the entry point. It owns the local store, the
//! remote store and the sync engine that ties them together, and runs all of
//! them on a single async queue.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use core::{ClientSettings, FirestoreClient, ListenOptions, ListenerRegistration, SyncEngineContext};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
