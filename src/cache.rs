//! Name→inode metadata cache with expiration and deferred forgets.
//!
//! The cache exists to suppress redundant daemon round trips: a fresh hit on
//! `(parent, name)` lets an operation skip its `LOOKUP` exchange entirely.
//! Every indexed item represents one daemon-side lookup count, so any item
//! that leaves the cache is queued on a deferred forget list that a later
//! `FORGET`/`BATCH_FORGET` exchange drains.
//!
//! Items are shared as [`Arc`]s: an operation that pins an item keeps it
//! alive past expiration; the maps only ever detach items, never free them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::proto::{EntryOut, FuseAttr};

/// One cached `(parent, name) → inode` binding.
#[derive(Debug)]
pub struct CacheItem {
    ino: u64,
    attr: FuseAttr,
    generation: u64,
    cache_gen: u64,
    expires_at: Instant,
}

impl CacheItem {
    /// The child inode number.
    #[must_use]
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Attributes as the daemon last reported them.
    #[must_use]
    pub fn attr(&self) -> &FuseAttr {
        &self.attr
    }

    /// Daemon-side inode generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The cache's invalidation generation when this item was inserted.
    /// A holder can compare against [`Cache::current_generation`] to detect
    /// that the namespace changed underneath it.
    #[must_use]
    pub fn cache_generation(&self) -> u64 {
        self.cache_gen
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Inodes awaiting a forget exchange. Dropping the queue releases the items
/// it still holds.
#[derive(Debug, Default)]
pub struct ForgetQueue {
    items: VecDeque<Arc<CacheItem>>,
}

impl ForgetQueue {
    /// Take the next inode to forget.
    pub fn next_ino(&mut self) -> Option<u64> {
        self.items.pop_front().map(|item| item.ino)
    }

    /// Whether anything is left to forget.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of queued forgets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    fn push(&mut self, item: Arc<CacheItem>) {
        self.items.push_back(item);
    }

    fn append(&mut self, other: &mut ForgetQueue) {
        self.items.append(&mut other.items);
    }
}

type NameKey = (u64, Bytes);

#[derive(Default)]
struct CacheState {
    by_name: FxHashMap<NameKey, Arc<CacheItem>>,
    by_ino: FxHashMap<u64, NameKey>,
    forget: ForgetQueue,
}

/// The metadata cache. One per instance.
pub struct Cache {
    state: Mutex<CacheState>,
    case_insensitive: bool,
    generation: AtomicU64,
}

#[expect(
    clippy::expect_used,
    reason = "Mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl Cache {
    /// An empty cache. `case_insensitive` selects name folding at insert and
    /// lookup.
    #[must_use]
    pub fn new(case_insensitive: bool) -> Self {
        Cache {
            state: Mutex::new(CacheState::default()),
            case_insensitive,
            generation: AtomicU64::new(1),
        }
    }

    fn normalize(&self, name: &[u8]) -> Bytes {
        if !self.case_insensitive {
            return Bytes::copy_from_slice(name);
        }
        match std::str::from_utf8(name) {
            Ok(s) => Bytes::from(s.to_lowercase().into_bytes()),
            Err(_) => Bytes::from(name.to_ascii_lowercase()),
        }
    }

    /// Look up a fresh binding for `name` under `parent`. An expired or
    /// detached item is a miss.
    #[must_use]
    pub fn lookup(&self, parent: u64, name: &[u8]) -> Option<Arc<CacheItem>> {
        let key = (parent, self.normalize(name));
        let state = self.state.lock().expect("poisoned");
        let item = state.by_name.get(&key)?;
        if item.expired(Instant::now()) {
            trace!(parent, ino = item.ino, "cache hit is stale");
            return None;
        }
        Some(Arc::clone(item))
    }

    /// Index the entry the daemon just returned and hand back the item.
    ///
    /// A zero entry TTL means the daemon forbids caching: the item is
    /// returned for the caller's immediate use but queued for forget rather
    /// than indexed. A displaced item under the same key is queued for
    /// forget, which keeps the daemon's per-insert lookup counts balanced.
    pub fn insert(&self, parent: u64, name: &[u8], entry: &EntryOut) -> Arc<CacheItem> {
        let ttl = Duration::new(entry.entry_valid, entry.entry_valid_nsec.min(999_999_999));
        let item = Arc::new(CacheItem {
            ino: entry.nodeid,
            attr: entry.attr,
            generation: entry.generation,
            cache_gen: self.generation.load(Ordering::Acquire),
            expires_at: Instant::now() + ttl,
        });

        let key = (parent, self.normalize(name));
        let mut state = self.state.lock().expect("poisoned");
        if ttl.is_zero() {
            trace!(parent, ino = item.ino, "daemon forbids caching, queueing forget");
            state.forget.push(Arc::clone(&item));
            return item;
        }
        if let Some(displaced) = state.by_name.insert(key.clone(), Arc::clone(&item)) {
            trace!(parent, old = displaced.ino, new = item.ino, "displacing cached entry");
            if state.by_ino.get(&displaced.ino) == Some(&key) {
                state.by_ino.remove(&displaced.ino);
            }
            state.forget.push(displaced);
        }
        state.by_ino.insert(item.ino, key);
        item
    }

    /// Drop the binding for `name` under `parent`, advancing the
    /// invalidation generation. Returns whether anything was removed.
    pub fn invalidate(&self, parent: u64, name: &[u8]) -> bool {
        let key = (parent, self.normalize(name));
        let mut state = self.state.lock().expect("poisoned");
        let Some(item) = state.by_name.remove(&key) else {
            return false;
        };
        if state.by_ino.get(&item.ino) == Some(&key) {
            state.by_ino.remove(&item.ino);
        }
        state.forget.push(item);
        self.generation.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Detach every item that has expired by `now` and return it, together
    /// with all previously deferred forgets, as a queue ready for a forget
    /// exchange.
    pub fn expiration_sweep(&self, now: Instant) -> ForgetQueue {
        let mut out = ForgetQueue::default();
        let mut state = self.state.lock().expect("poisoned");
        out.append(&mut state.forget);

        let expired: Vec<NameKey> = state
            .by_name
            .iter()
            .filter(|(_, item)| item.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(item) = state.by_name.remove(&key) {
                trace!(ino = item.ino, "expiring cached entry");
                if state.by_ino.get(&item.ino) == Some(&key) {
                    state.by_ino.remove(&item.ino);
                }
                out.push(item);
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
        }
        out
    }

    /// Current invalidation generation.
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of indexed bindings.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.state.lock().expect("poisoned").by_name.len()
    }
}
