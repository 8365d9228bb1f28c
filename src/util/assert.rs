/// Panics with an internal-assertion message when `condition` is false.
///
/// Used for broken engine invariants that indicate a bug rather than a recoverable
/// failure.
#[track_caller]
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        panic!("{}", assertion_error(message));
    }
}

/// Unconditional form of [`hard_assert`] for branches that must never run.
#[track_caller]
pub fn hard_fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "firestore-sync ({}) INTERNAL ASSERT FAILED: {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}
