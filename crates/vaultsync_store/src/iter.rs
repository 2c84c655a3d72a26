//! Lazy iteration over stored records.

use crate::error::StoreResult;
use crate::store::Inner;
use std::fmt;
use std::sync::Arc;
use vaultsync_protocol::ChangeRecord;

/// A record together with its local arrival sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChange {
    /// Local arrival sequence, starting at 1.
    pub seq: u64,
    /// The record.
    pub record: ChangeRecord,
}

/// A lazy, finite, restartable sequence of stored records.
///
/// - **Finite**: the last sequence is fixed when the iterator is created;
///   records stored afterwards are not yielded.
/// - **Lazy**: each record is read from the log on `next()`.
/// - **Restartable**: [`restart`](Self::restart) rewinds to the first
///   record, and clones iterate independently.
///
/// A record whose frame can no longer be read is yielded as an error and
/// iteration continues with the next one.
#[derive(Clone)]
pub struct Changes {
    inner: Arc<Inner>,
    first: u64,
    last: u64,
    next: u64,
}

impl Changes {
    pub(crate) fn new(inner: Arc<Inner>, after: u64) -> Self {
        let last = inner.len();
        let first = after.saturating_add(1);
        Self {
            inner,
            first,
            last,
            next: first,
        }
    }

    /// Rewinds to the first record.
    pub fn restart(&mut self) {
        self.next = self.first;
    }

    /// Returns the sequence of the last record this iterator will yield.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last
    }
}

impl Iterator for Changes {
    type Item = StoreResult<StoredChange>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.last {
            return None;
        }
        let seq = self.next;
        self.next += 1;
        Some(
            self.inner
                .read_record(seq)
                .map(|record| StoredChange { seq, record }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.last + 1).saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Changes {}

impl fmt::Debug for Changes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changes")
            .field("first", &self.first)
            .field("last", &self.last)
            .field("next", &self.next)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::ChangeStore;
    use vaultsync_protocol::ChangeRecord;

    fn store_with(n: usize) -> ChangeStore {
        let store = ChangeStore::in_memory();
        for i in 0..n {
            store
                .put(&ChangeRecord::new(format!("r{i}"), format!("d{i}")))
                .unwrap();
        }
        store
    }

    #[test]
    fn snapshot_bound_is_fixed() {
        let store = store_with(2);
        let changes = store.get_all();
        store.put(&ChangeRecord::new("late", "x")).unwrap();

        assert_eq!(changes.count(), 2);
        assert_eq!(store.get_all().count(), 3);
    }

    #[test]
    fn restart_rewinds() {
        let store = store_with(3);
        let mut changes = store.get_all();
        assert_eq!(changes.by_ref().count(), 3);
        assert!(changes.next().is_none());

        changes.restart();
        let first = changes.next().unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.record.id(), "r0");
    }

    #[test]
    fn get_since_skips_seen() {
        let store = store_with(4);
        let seqs: Vec<u64> = store.get_since(2).map(|c| c.unwrap().seq).collect();
        assert_eq!(seqs, [3, 4]);
        assert_eq!(store.get_since(4).len(), 0);
        assert_eq!(store.get_since(10).count(), 0);
    }
}
