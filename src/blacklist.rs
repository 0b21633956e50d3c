//! Peer blacklists.
//!
//! A blacklisted peer is disconnected from the overlay, its new streams are
//! refused, and messages it forwards or authors are rejected.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::identity::PeerId;

/// Maximum entries in the time-cached blacklist.
/// SECURITY: bounds memory when blacklisting churning identities.
pub const MAX_BLACKLIST_ENTRIES: usize = 10_000;

pub trait Blacklist: Send + Sync {
    /// Returns `true` if the peer was newly added.
    fn add(&self, peer: PeerId) -> bool;
    fn contains(&self, peer: &PeerId) -> bool;
}

/// Permanent, unbounded blacklist.
#[derive(Debug, Default)]
pub struct MapBlacklist {
    peers: RwLock<HashSet<PeerId>>,
}

impl MapBlacklist {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Blacklist for MapBlacklist {
    fn add(&self, peer: PeerId) -> bool {
        self.peers.write().insert(peer)
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().contains(peer)
    }
}

/// Blacklist whose entries expire after a fixed TTL.
pub struct TimeCachedBlacklist {
    ttl: Duration,
    entries: Mutex<LruCache<PeerId, Instant>>,
}

impl TimeCachedBlacklist {
    pub fn new(ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_BLACKLIST_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl Blacklist for TimeCachedBlacklist {
    fn add(&self, peer: PeerId) -> bool {
        let expire = Instant::now() + self.ttl;
        let mut entries = self.entries.lock();
        let fresh = !entries.peek(&peer).is_some_and(|e| *e > Instant::now());
        entries.put(peer, expire);
        fresh
    }

    fn contains(&self, peer: &PeerId) -> bool {
        let mut entries = self.entries.lock();
        match entries.peek(peer) {
            Some(expire) if *expire > Instant::now() => true,
            Some(_) => {
                entries.pop(peer);
                false
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for TimeCachedBlacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeCachedBlacklist")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}
