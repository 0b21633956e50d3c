//! # Gossip Promise Tracker
//!
//! When we answer an IHAVE with an IWANT, the advertising peer has implicitly
//! promised to deliver. One randomly chosen id per IWANT is tracked with a
//! deadline; if the message has not started validation by then the promise is
//! broken and the router charges the peer a behavioural penalty.
//!
//! Tracking a single random id per request keeps the bookkeeping small while
//! still catching peers that advertise messages they never send.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::identity::PeerId;
use crate::messages::{MessageId, ReceivedMessage};
use crate::trace::RawTracer;
use crate::validation::RejectReason;

#[derive(Default)]
struct PromiseState {
    promises: HashMap<MessageId, HashMap<PeerId, Instant>>,
    peer_promises: HashMap<PeerId, HashSet<MessageId>>,
}

pub struct GossipTracer {
    followup_time: Duration,
    state: Mutex<PromiseState>,
}

impl GossipTracer {
    pub fn new(followup_time: Duration) -> Self {
        Self {
            followup_time,
            state: Mutex::new(PromiseState::default()),
        }
    }

    /// Track a promise from `peer` for one of `ids`.
    pub fn add_promise(&self, peer: &PeerId, ids: &[MessageId]) {
        let Some(id) = ids.choose(&mut rand::thread_rng()) else {
            return;
        };
        let expire = Instant::now() + self.followup_time;
        let mut state = self.state.lock();
        state
            .promises
            .entry(id.clone())
            .or_default()
            .entry(*peer)
            .or_insert(expire);
        state
            .peer_promises
            .entry(*peer)
            .or_default()
            .insert(id.clone());
    }

    /// Per-peer counts of promises whose deadline has passed; they are dropped.
    pub fn broken_promises(&self) -> HashMap<PeerId, usize> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let PromiseState {
            promises,
            peer_promises,
        } = &mut *state;

        let mut broken: HashMap<PeerId, usize> = HashMap::new();
        promises.retain(|id, peers| {
            peers.retain(|peer, expire| {
                if *expire > now {
                    return true;
                }
                *broken.entry(*peer).or_default() += 1;
                if let Some(ids) = peer_promises.get_mut(peer) {
                    ids.remove(id);
                    if ids.is_empty() {
                        peer_promises.remove(peer);
                    }
                }
                false
            });
            !peers.is_empty()
        });
        broken
    }

    fn fulfill(&self, id: &MessageId) {
        let mut state = self.state.lock();
        let Some(peers) = state.promises.remove(id) else {
            return;
        };
        for peer in peers.keys() {
            if let Some(ids) = state.peer_promises.get_mut(peer) {
                ids.remove(id);
                if ids.is_empty() {
                    state.peer_promises.remove(peer);
                }
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().promises.values().map(HashMap::len).sum()
    }
}

impl RawTracer for GossipTracer {
    fn remove_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        let Some(ids) = state.peer_promises.remove(peer) else {
            return;
        };
        for id in ids {
            if let Some(peers) = state.promises.get_mut(&id) {
                peers.remove(peer);
                if peers.is_empty() {
                    state.promises.remove(&id);
                }
            }
        }
    }

    fn validate_message(&self, msg: &ReceivedMessage) {
        // Validation only starts after signature checks pass.
        self.fulfill(&msg.id);
    }

    fn deliver_message(&self, msg: &ReceivedMessage) {
        self.fulfill(&msg.id);
    }

    fn reject_message(&self, msg: &ReceivedMessage, reason: RejectReason) {
        if matches!(reason, RejectReason::MissingSignature | RejectReason::InvalidSignature) {
            return;
        }
        self.fulfill(&msg.id);
    }
}

impl std::fmt::Debug for GossipTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipTracer")
            .field("followup_time", &self.followup_time)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;

    fn received(id: &MessageId, from: PeerId) -> std::sync::Arc<ReceivedMessage> {
        ReceivedMessage::new(id.clone(), Message::default(), from)
    }

    #[test]
    fn expired_promises_are_broken_once() {
        let tracer = GossipTracer::new(Duration::from_millis(10));
        let peer = PeerId::from_seed(1);
        tracer.add_promise(&peer, &[MessageId::from("a")]);
        assert!(tracer.broken_promises().is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let broken = tracer.broken_promises();
        assert_eq!(broken.get(&peer), Some(&1));
        assert!(tracer.broken_promises().is_empty());
        assert_eq!(tracer.outstanding(), 0);
    }

    #[test]
    fn validation_fulfills_promise() {
        let tracer = GossipTracer::new(Duration::from_millis(10));
        let peer = PeerId::from_seed(1);
        let id = MessageId::from("a");
        tracer.add_promise(&peer, std::slice::from_ref(&id));
        tracer.validate_message(&received(&id, peer));

        std::thread::sleep(Duration::from_millis(20));
        assert!(tracer.broken_promises().is_empty());
    }

    #[test]
    fn signature_rejection_does_not_fulfill() {
        let tracer = GossipTracer::new(Duration::from_millis(10));
        let peer = PeerId::from_seed(1);
        let id = MessageId::from("a");
        tracer.add_promise(&peer, std::slice::from_ref(&id));
        tracer.reject_message(&received(&id, peer), RejectReason::InvalidSignature);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tracer.broken_promises().get(&peer), Some(&1));
    }

    #[test]
    fn removed_peer_promises_are_dropped() {
        let tracer = GossipTracer::new(Duration::from_millis(10));
        let peer = PeerId::from_seed(1);
        tracer.add_promise(&peer, &[MessageId::from("a"), MessageId::from("b")]);
        tracer.remove_peer(&peer);
        assert_eq!(tracer.outstanding(), 0);
    }
}
