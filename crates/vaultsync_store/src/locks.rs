//! Striped per-id write locks.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const SHARDS: usize = 64;

/// Serializes read-modify-write on the same record id.
///
/// Ids hash onto a fixed set of mutexes. Two puts of the same id always
/// take the same mutex; unrelated ids usually take different ones.
pub(crate) struct IdLocks {
    shards: Vec<Mutex<()>>,
}

impl IdLocks {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Locks the shard owning `id`.
    pub(crate) fn lock(&self, id: &str) -> MutexGuard<'_, ()> {
        self.shards[Self::shard_of(id)].lock()
    }

    fn shard_of(id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() as usize) % SHARDS
    }
}

impl Default for IdLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_id_same_shard() {
        assert_eq!(IdLocks::shard_of("c1"), IdLocks::shard_of("c1"));
    }

    #[test]
    fn distinct_ids_can_be_held_together() {
        let locks = IdLocks::new();
        let a = (0..)
            .map(|i| format!("id-{i}"))
            .find(|id| IdLocks::shard_of(id) != IdLocks::shard_of("c1"))
            .unwrap();
        let _first = locks.lock("c1");
        let _second = locks.lock(&a);
    }
}
