//! # Message Cache
//!
//! Sliding window of recently seen messages, one slot per heartbeat.
//!
//! | Window | Use |
//! |--------|-----|
//! | `history` (H) slots | IWANT responses |
//! | newest `gossip` (G ≤ H) slots | IHAVE advertisement |
//!
//! The G/H slack absorbs the IHAVE → IWANT round trip: a peer asking for an id
//! advertised in the oldest gossip slot still finds it one or two heartbeats
//! later. `shift` drops the oldest slot from both the message map and the
//! per-peer retransmission counters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::identity::PeerId;
use crate::messages::{MessageId, ReceivedMessage};

struct CacheEntry {
    id: MessageId,
    topic: String,
}

pub struct MessageCache {
    msgs: HashMap<MessageId, Arc<ReceivedMessage>>,
    peertx: HashMap<MessageId, HashMap<PeerId, u32>>,
    history: VecDeque<Vec<CacheEntry>>,
    gossip: usize,
}

impl MessageCache {
    /// `gossip` is clamped to `history`; both are at least 1.
    pub fn new(gossip: usize, history: usize) -> Self {
        let history = history.max(1);
        let gossip = gossip.clamp(1, history);
        let mut slots = VecDeque::with_capacity(history);
        for _ in 0..history {
            slots.push_back(Vec::new());
        }
        Self {
            msgs: HashMap::new(),
            peertx: HashMap::new(),
            history: slots,
            gossip,
        }
    }

    pub fn put(&mut self, msg: Arc<ReceivedMessage>) {
        let id = msg.id.clone();
        let topic = msg.topic().to_string();
        if self.msgs.insert(id.clone(), msg).is_none()
            && let Some(slot) = self.history.front_mut()
        {
            slot.push(CacheEntry { id, topic });
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&Arc<ReceivedMessage>> {
        self.msgs.get(id)
    }

    /// Look up `id` on behalf of `peer`, returning the message and how many
    /// times this peer has now requested it.
    pub fn get_for_peer(&mut self, id: &MessageId, peer: &PeerId) -> Option<(Arc<ReceivedMessage>, u32)> {
        let msg = self.msgs.get(id)?.clone();
        let count = self
            .peertx
            .entry(id.clone())
            .or_default()
            .entry(*peer)
            .or_insert(0);
        *count += 1;
        Some((msg, *count))
    }

    /// Ids of `topic` messages in the gossip window, newest slot first.
    pub fn get_gossip_ids(&self, topic: &str) -> Vec<MessageId> {
        self.history
            .iter()
            .take(self.gossip)
            .flatten()
            .filter(|entry| entry.topic == topic)
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn shift(&mut self) {
        if let Some(oldest) = self.history.pop_back() {
            for entry in oldest {
                self.msgs.remove(&entry.id);
                self.peertx.remove(&entry.id);
            }
        }
        self.history.push_front(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;

    fn make(topic: &str, n: u64) -> Arc<ReceivedMessage> {
        let message = Message {
            topic: topic.into(),
            data: n.to_be_bytes().to_vec(),
            ..Message::default()
        };
        ReceivedMessage::new(MessageId::new(format!("{topic}-{n}")), message, PeerId::from_seed(0))
    }

    #[test]
    fn put_then_get_before_shift() {
        let mut mc = MessageCache::new(3, 5);
        let m = make("t", 1);
        mc.put(m.clone());
        assert_eq!(mc.get(&m.id).map(|x| x.id.clone()), Some(m.id.clone()));
        assert_eq!(mc.get_gossip_ids("t"), vec![m.id.clone()]);
        assert!(mc.get_gossip_ids("other").is_empty());
    }

    #[test]
    fn evicted_after_history_shifts() {
        let mut mc = MessageCache::new(3, 5);
        let m = make("t", 1);
        mc.put(m.clone());
        for _ in 0..4 {
            mc.shift();
            assert!(mc.get(&m.id).is_some());
        }
        mc.shift();
        assert!(mc.get(&m.id).is_none());
        assert!(mc.is_empty());
    }

    #[test]
    fn gossip_window_is_newest_g_slots() {
        let mut mc = MessageCache::new(3, 5);
        let m = make("t", 1);
        mc.put(m.clone());
        for _ in 0..2 {
            mc.shift();
            assert_eq!(mc.get_gossip_ids("t"), vec![m.id.clone()]);
        }
        mc.shift();
        assert!(mc.get_gossip_ids("t").is_empty());
        assert!(mc.get(&m.id).is_some());
    }

    #[test]
    fn gossip_ids_are_ordered_newest_first() {
        let mut mc = MessageCache::new(3, 5);
        let old = make("t", 1);
        mc.put(old.clone());
        mc.shift();
        let new = make("t", 2);
        mc.put(new.clone());
        assert_eq!(mc.get_gossip_ids("t"), vec![new.id.clone(), old.id.clone()]);
    }

    #[test]
    fn per_peer_counts_increment_and_reset_on_eviction() {
        let mut mc = MessageCache::new(1, 1);
        let m = make("t", 1);
        let peer = PeerId::from_seed(9);
        mc.put(m.clone());

        assert_eq!(mc.get_for_peer(&m.id, &peer).map(|(_, c)| c), Some(1));
        assert_eq!(mc.get_for_peer(&m.id, &peer).map(|(_, c)| c), Some(2));
        assert_eq!(
            mc.get_for_peer(&m.id, &PeerId::from_seed(10)).map(|(_, c)| c),
            Some(1)
        );

        mc.shift();
        assert!(mc.get_for_peer(&m.id, &peer).is_none());
    }

    #[test]
    fn duplicate_put_is_ignored() {
        let mut mc = MessageCache::new(3, 5);
        let m = make("t", 1);
        mc.put(m.clone());
        mc.put(m.clone());
        assert_eq!(mc.get_gossip_ids("t").len(), 1);
    }
}
