use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Server-assigned version that totally orders document and target states.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn max() -> Self {
        Self(Timestamp::new(253_402_300_799, 999_999_999))
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        ))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_bound_all_versions() {
        let version = SnapshotVersion::from_micros(1_000_001);
        assert!(SnapshotVersion::min() < version);
        assert!(version < SnapshotVersion::max());
        assert_eq!(version.timestamp(), Timestamp::new(1, 1_000));
        assert!(SnapshotVersion::default().is_min());
    }
}
