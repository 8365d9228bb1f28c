pub mod assert;
pub mod backoff;
pub mod subscribe;

pub use assert::{assertion_error, hard_assert, hard_fail};
pub use backoff::{BackoffSettings, ExponentialBackoff};
pub use subscribe::PartialObserver;
