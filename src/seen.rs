//! # Seen-Message Cache
//!
//! First-seen time cache of message IDs. Entries expire a fixed TTL after they
//! were first inserted; expired entries are swept lazily on insert.
//!
//! `mark_seen` is a single check-and-insert under one lock, so concurrent
//! duplicates entering the validation pipeline are validated at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::messages::MessageId;

/// Default retention for seen message ids.
pub const DEFAULT_SEEN_MESSAGES_TTL: Duration = Duration::from_secs(120);

#[derive(Default)]
struct SeenState {
    entries: HashMap<MessageId, Instant>,
    order: VecDeque<(MessageId, Instant)>,
}

impl SeenState {
    fn sweep(&mut self, now: Instant) {
        while let Some((_, expiry)) = self.order.front() {
            if *expiry > now {
                break;
            }
            if let Some((id, expiry)) = self.order.pop_front()
                && self.entries.get(&id) == Some(&expiry)
            {
                self.entries.remove(&id);
            }
        }
    }
}

#[derive(Clone)]
pub struct SeenMessages {
    ttl: Duration,
    state: Arc<Mutex<SeenState>>,
}

impl SeenMessages {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Arc::new(Mutex::new(SeenState::default())),
        }
    }

    pub fn has(&self, id: &MessageId) -> bool {
        let state = self.state.lock();
        state
            .entries
            .get(id)
            .is_some_and(|expiry| *expiry > Instant::now())
    }

    /// Insert `id`; returns `false` if it was already present.
    pub fn mark_seen(&self, id: &MessageId) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sweep(now);
        if state.entries.contains_key(id) {
            return false;
        }
        let expiry = now + self.ttl;
        state.entries.insert(id.clone(), expiry);
        state.order.push_back((id.clone(), expiry));
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SeenMessages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenMessages")
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish()
    }
}
