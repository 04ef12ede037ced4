//! Bounded LRU cache of IP profiles with per-entry TTL.
//!
//! Grounded on `original_source/intel/threat_intel.py::LRUCache` (an
//! `OrderedDict` with `max_size`/`ttl_seconds`, evicting via `popitem(last=False)`)
//! and on the teacher's use of external crates for bookkeeping structures
//! rather than a hand-rolled ordered map; `lru = "0.12"` is used elsewhere in
//! this retrieval pack and gives us exact LRU promotion semantics for free.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use super::profile::IpProfile;

struct Entry {
    profile: IpProfile,
    last_access: Instant,
}

struct CacheInner {
    map: LruCache<String, Entry>,
}

/// Thread-safe mapping from IP literal to [`IpProfile`], bounded to `N`
/// entries with a per-entry TTL `T`. `get` promotes to most-recently-used
/// and purges (returning `None`) an entry that has been idle longer than
/// `T`. `put` evicts the least-recently-used entry while at capacity.
pub struct ProfileCache {
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl ProfileCache {
    /// `capacity` must be non-zero; `ttl_secs == 0` means every read sees a
    /// miss (spec.md §8 boundary behavior).
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        ProfileCache {
            ttl: Duration::from_secs(ttl_secs),
            inner: Mutex::new(CacheInner {
                map: LruCache::new(capacity),
            }),
        }
    }

    /// Returns a clone of the profile for `ip`, promoting it to
    /// most-recently-used, or `None` if absent or expired. An expired entry
    /// is purged as a side effect.
    pub fn get(&self, ip: &str) -> Option<IpProfile> {
        let mut inner = self.inner.lock().expect("profile cache mutex poisoned");
        let now = Instant::now();

        let expired = match inner.map.peek(ip) {
            Some(entry) => now.duration_since(entry.last_access) > self.ttl,
            None => return None,
        };

        if expired {
            inner.map.pop(ip);
            return None;
        }

        let entry = inner.map.get_mut(ip)?;
        entry.last_access = now;
        Some(entry.profile.clone())
    }

    /// Inserts or updates the profile for `ip`, evicting the
    /// least-recently-used entry if the cache is at capacity.
    pub fn put(&self, ip: &str, profile: IpProfile) {
        let mut inner = self.inner.lock().expect("profile cache mutex poisoned");
        inner.map.put(
            ip.to_string(),
            Entry {
                profile,
                last_access: Instant::now(),
            },
        );
    }

    /// Mutates the profile for `ip` in place via `f`, if present and not
    /// expired, without disturbing LRU order any more than a plain `get`
    /// would. Returns whether an entry was found.
    pub fn update<F: FnOnce(&mut IpProfile)>(&self, ip: &str, f: F) -> bool {
        let mut inner = self.inner.lock().expect("profile cache mutex poisoned");
        let now = Instant::now();

        let expired = match inner.map.peek(ip) {
            Some(entry) => now.duration_since(entry.last_access) > self.ttl,
            None => return false,
        };
        if expired {
            inner.map.pop(ip);
            return false;
        }

        if let Some(entry) = inner.map.get_mut(ip) {
            f(&mut entry.profile);
            entry.last_access = now;
            true
        } else {
            false
        }
    }

    /// Snapshot of every live profile, in no particular order. Does not
    /// purge expired entries as a side effect (a read-only view).
    pub fn values(&self) -> Vec<IpProfile> {
        let inner = self.inner.lock().expect("profile cache mutex poisoned");
        inner.map.iter().map(|(_, e)| e.profile.clone()).collect()
    }

    /// Current number of entries, including any not-yet-purged expired ones.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("profile cache mutex poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
