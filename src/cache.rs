//! Bounded TTL cache with FIFO eviction.
//!
//! Entries carry their own expiry and are never mutated after insertion.
//! Reads ignore expired entries but leave them in place; they keep
//! occupying a slot until overwritten or evicted. Eviction removes the
//! oldest-inserted entry regardless of how recently it was read.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default lifetime for resolved manifests and proxied resources (3 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// A cached payload and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    /// Returns `true` while `now < expires_at`.
    #[must_use]
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct Slot<T> {
    entry: CacheEntry<T>,
    seq: u64,
}

struct Inner<T> {
    entries: HashMap<String, Slot<T>>,
    // Insertion queue. A key appears again each time it is re-inserted;
    // stale positions are recognised by their sequence number and skipped.
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Thread-safe string-keyed cache with a capacity cap.
pub struct TtlCache<T> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> TtlCache<T> {
    /// Create an empty cache holding at most `capacity` entries.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    /// Return the payload for `key` if present and unexpired.
    pub fn get(&self, key: &str) -> Option<T> {
        let inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(slot) if slot.entry.is_fresh(Instant::now()) => {
                debug!(cache = self.name, key, "cache hit");
                Some(slot.entry.payload.clone())
            }
            Some(_) => {
                debug!(cache = self.name, key, "cache entry expired");
                None
            }
            None => {
                debug!(cache = self.name, key, "cache miss");
                None
            }
        }
    }

    /// Insert or replace `key`, then evict oldest insertions beyond capacity.
    pub fn put(&self, key: impl Into<String>, payload: T, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.lock();

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.clone(),
            Slot {
                entry: CacheEntry {
                    payload,
                    expires_at: Instant::now() + ttl,
                },
                seq,
            },
        );
        inner.order.push_back((key, seq));

        while inner.entries.len() > self.capacity {
            let Some((oldest, oldest_seq)) = inner.order.pop_front() else {
                break;
            };
            let current = inner.entries.get(&oldest).map(|slot| slot.seq);
            if current == Some(oldest_seq) {
                inner.entries.remove(&oldest);
                debug!(cache = self.name, key = %oldest, "evicted oldest entry");
            }
        }

        // Overwrites leave superseded positions behind; drop them once they
        // outnumber live entries.
        if inner.order.len() > inner.entries.len().saturating_mul(2) + 16 {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, s)| entries.get(k).is_some_and(|slot| slot.seq == *s));
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        debug!(cache = self.name, "cache cleared");
    }

    /// Number of physically stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
