pub mod persistent;

pub use persistent::{
    discard_stale_handle, PersistentStream, StreamEnvironment, StreamSettings, StreamState,
};
