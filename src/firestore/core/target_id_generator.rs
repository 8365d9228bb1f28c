use crate::firestore::local::TargetId;

/// Hands out target ids from one of two disjoint sequences: even ids for
/// targets stored in the target cache, odd ids for limbo resolution targets
/// that only the sync engine knows about.
#[derive(Debug, Clone)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

const RESERVED_BITS: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GeneratorId {
    TargetCache = 0,
    SyncEngine = 1,
}

impl TargetIdGenerator {
    fn new(generator: GeneratorId, seed: TargetId) -> Self {
        let generator_id = generator as TargetId;
        let mut next_id = seed;
        if next_id & 1 != generator_id {
            next_id = ((next_id >> RESERVED_BITS) << RESERVED_BITS) | generator_id;
            if next_id < seed {
                next_id += 1 << RESERVED_BITS;
            }
        }
        Self { next_id }
    }

    /// Generator for persisted targets, continuing after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let mut generator = Self::new(GeneratorId::TargetCache, highest_target_id);
        if highest_target_id != 0 || generator.next_id == 0 {
            generator.next();
        }
        generator
    }

    pub fn for_sync_engine() -> Self {
        Self::new(GeneratorId::SyncEngine, 1)
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_disjoint() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!(cache.next(), 2);
        assert_eq!(cache.next(), 4);
        assert_eq!(sync.next(), 1);
        assert_eq!(sync.next(), 3);
    }

    #[test]
    fn cache_generator_resumes_after_highest_id() {
        let mut cache = TargetIdGenerator::for_target_cache(6);
        assert_eq!(cache.next(), 8);
    }
}
