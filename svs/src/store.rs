//! Local storage for signed data packets.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::name::Name;
use crate::packet::{Data, Interest};

/// Abstraction over the different available storage backends.
///
/// Retention is best effort: implementations may evict, correctness of the
/// layers above only depends on the fetch protocol.
pub trait DataStore: Send + Sync + 'static {
    /// Find a stored packet satisfying the interest, honoring prefix and
    /// freshness selectors.
    fn find(&self, interest: &Interest) -> Option<Data>;

    /// Insert a packet, replacing any packet with the same name.
    fn insert(&self, data: Data);
}

#[derive(Debug)]
struct StoredData {
    data: Data,
    inserted: Instant,
}

/// Name-indexed in-memory store. Entries persist for the lifetime of the
/// instance.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<Name, StoredData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataStore for MemoryStore {
    fn find(&self, interest: &Interest) -> Option<Data> {
        let entries = self.entries.lock().expect("poisoned");
        let now = Instant::now();
        let fresh = |stored: &StoredData| {
            !interest.must_be_fresh()
                || (!stored.data.freshness().is_zero()
                    && now.duration_since(stored.inserted) <= stored.data.freshness())
        };
        if interest.can_be_prefix() {
            entries
                .range(interest.name().clone()..)
                .take_while(|(name, _)| interest.name().is_prefix_of(name))
                .find(|(_, stored)| fresh(stored))
                .map(|(_, stored)| stored.data.clone())
        } else {
            entries
                .get(interest.name())
                .filter(|stored| fresh(stored))
                .map(|stored| stored.data.clone())
        }
    }

    fn insert(&self, data: Data) {
        self.entries.lock().expect("poisoned").insert(
            data.name().clone(),
            StoredData {
                data,
                inserted: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn data(name: &str) -> Data {
        Data::new(Name::from(name), &b"x"[..]).with_freshness(Duration::from_secs(3600))
    }

    #[test]
    fn exact_match() {
        let store = MemoryStore::new();
        store.insert(data("/a/1"));
        assert!(store.find(&Interest::new(Name::from("/a/1"))).is_some());
        assert!(store.find(&Interest::new(Name::from("/a"))).is_none());
        assert!(store.find(&Interest::new(Name::from("/a/2"))).is_none());
    }

    #[test]
    fn prefix_match() {
        let store = MemoryStore::new();
        store.insert(data("/a/1/seg=0"));
        store.insert(data("/a/1/seg=1"));
        store.insert(data("/b"));

        let interest = Interest::new(Name::from("/a/1")).with_can_be_prefix(true);
        let found = store.find(&interest).unwrap();
        assert_eq!(found.name(), &Name::from("/a/1/seg=0"));

        let miss = Interest::new(Name::from("/c")).with_can_be_prefix(true);
        assert!(store.find(&miss).is_none());
    }

    #[test]
    fn replace_same_name() {
        let store = MemoryStore::new();
        store.insert(data("/a"));
        let replacement = Data::new(Name::from("/a"), &b"new"[..]);
        store.insert(replacement.clone());
        assert_eq!(store.len(), 1);
        let found = store.find(&Interest::new(Name::from("/a"))).unwrap();
        assert_eq!(found.content(), replacement.content());
    }

    #[test]
    fn must_be_fresh_skips_stale() {
        let store = MemoryStore::new();
        // freshness zero: immediately stale
        store.insert(Data::new(Name::from("/a"), &b"x"[..]));
        assert!(store
            .find(&Interest::new(Name::from("/a")).with_must_be_fresh(true))
            .is_none());
        assert!(store.find(&Interest::new(Name::from("/a"))).is_some());
    }
}
