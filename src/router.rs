//! # Router Seam
//!
//! A router decides who receives what. The actor owns the [`Overlay`] (peer
//! roster, outbound queues, announced topic membership) and lends it to the
//! router for every call, so routers never hold references into actor state.
//!
//! | Router | Forwarding |
//! |--------|-----------|
//! | [`crate::gossipsub::GossipSubRouter`] | mesh + fanout + gossip, scoring, gating |
//! | [`crate::floodsub::FloodSubRouter`] | every topic peer |
//! | [`crate::randomsub::RandomSubRouter`] | random `max(size, sqrt(n))` sample |
//!
//! All router methods run inside the actor loop and must not block.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::filter::PeerFilter;
use crate::identity::PeerId;
use crate::messages::{MessageId, ProtocolId, ReceivedMessage, Rpc};
use crate::protocols::{Host, PeerConnection};
use crate::score::PeerScoreSnapshot;
use crate::score_params::TopicScoreParams;
use crate::seen::SeenMessages;
use crate::trace::{RawTracer, Tracer};

/// How much of a peer's RPC we are willing to process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptStatus {
    /// Graylisted: drop the whole RPC.
    None,
    /// Throttled: process control messages only.
    Control,
    All,
}

/// Everything a router may keep from attach time.
#[derive(Clone)]
pub struct RouterContext {
    pub local: PeerId,
    pub host: Arc<dyn Host>,
    /// Cancelled when the engine shuts down.
    pub cancel: CancellationToken,
}

pub trait PubSubRouter: Send + 'static {
    /// Protocols this router speaks, most preferred first.
    fn protocols(&self) -> Vec<ProtocolId>;

    /// Start background work. Returns observers to register with the tracer.
    fn attach(&mut self, ctx: RouterContext) -> anyhow::Result<Vec<Arc<dyn RawTracer>>>;

    fn add_peer(&mut self, overlay: &Overlay, conn: &PeerConnection);

    fn remove_peer(&mut self, overlay: &Overlay, peer: &PeerId);

    /// Whether enough peers are available to publish on `topic`.
    /// `suggested == 0` means the router's own default.
    fn enough_peers(&self, overlay: &Overlay, topic: &str, suggested: usize) -> bool;

    fn accept_from(&self, peer: &PeerId) -> AcceptStatus;

    /// Process the control part of an RPC.
    fn handle_rpc(&mut self, overlay: &Overlay, from: &PeerId, rpc: &Rpc);

    /// Forward a validated message.
    fn publish(&mut self, overlay: &Overlay, msg: &Arc<ReceivedMessage>);

    fn join(&mut self, overlay: &Overlay, topic: &str);

    fn leave(&mut self, overlay: &Overlay, topic: &str);

    /// `(initial delay, interval)` of the heartbeat, if the router has one.
    fn heartbeat_schedule(&self) -> Option<(Duration, Duration)> {
        None
    }

    fn heartbeat(&mut self, _overlay: &Overlay) {}

    fn set_topic_score_params(&mut self, _topic: &str, _params: TopicScoreParams) -> anyhow::Result<()> {
        bail!("router does not support peer scoring")
    }

    fn peer_scores(&self) -> HashMap<PeerId, PeerScoreSnapshot> {
        HashMap::new()
    }

    /// Peers we eagerly forward `topic` to.
    fn mesh_peers(&self, _topic: &str) -> Vec<PeerId> {
        Vec::new()
    }
}

// ============================================================================
// Overlay
// ============================================================================

#[derive(Debug)]
struct PeerHandle {
    protocol: ProtocolId,
    outbound: bool,
    queue: mpsc::Sender<Rpc>,
}

/// Actor-owned peer roster and topic membership, lent to routers.
pub struct Overlay {
    local: PeerId,
    peers: HashMap<PeerId, PeerHandle>,
    topics: HashMap<String, HashSet<PeerId>>,
    seen: SeenMessages,
    peer_filter: PeerFilter,
    tracer: Tracer,
    max_message_size: usize,
}

impl Overlay {
    pub fn new(local: PeerId, seen: SeenMessages, peer_filter: PeerFilter, max_message_size: usize) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            topics: HashMap::new(),
            seen,
            peer_filter,
            tracer: Tracer::default(),
            max_message_size,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub(crate) fn set_tracer(&mut self, tracer: Tracer) {
        self.tracer = tracer;
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen.has(id)
    }

    /// Whether `topic` may be exchanged with `peer`.
    pub fn peer_filter(&self, peer: &PeerId, topic: &str) -> bool {
        (self.peer_filter)(peer, topic)
    }

    pub fn protocol(&self, peer: &PeerId) -> Option<&str> {
        self.peers.get(peer).map(|h| h.protocol.as_str())
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn is_outbound(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|h| h.outbound)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers that announced `topic`.
    pub fn topic_peers(&self, topic: &str) -> Option<&HashSet<PeerId>> {
        self.topics.get(topic)
    }

    pub fn in_topic(&self, topic: &str, peer: &PeerId) -> bool {
        self.topics.get(topic).is_some_and(|t| t.contains(peer))
    }

    /// Queue an RPC without blocking.
    ///
    /// `Full` hands the RPC back so the caller can trace the drop and retry
    /// control content; `Closed` means the peer is gone.
    pub fn try_send(&self, peer: &PeerId, rpc: Rpc) -> Result<(), TrySendError<Rpc>> {
        let Some(handle) = self.peers.get(peer) else {
            return Err(TrySendError::Closed(rpc));
        };
        handle.queue.try_send(rpc)
    }

    /// Queue an RPC and trace the outcome. Returns `false` if it was dropped.
    pub fn send_or_drop(&self, peer: &PeerId, rpc: Rpc) -> bool {
        let traced = rpc.clone();
        match self.try_send(peer, rpc) {
            Ok(()) => {
                self.tracer.send_rpc(peer, &traced);
                true
            }
            Err(TrySendError::Full(rpc)) => {
                self.tracer.drop_rpc(peer, &rpc);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn insert_peer(&mut self, conn: &PeerConnection, queue: mpsc::Sender<Rpc>) {
        self.peers.insert(
            conn.peer,
            PeerHandle {
                protocol: conn.protocol.clone(),
                outbound: conn.outbound,
                queue,
            },
        );
    }

    /// Forget `peer`; returns the topics it had announced.
    pub(crate) fn remove_peer(&mut self, peer: &PeerId) -> Vec<String> {
        self.peers.remove(peer);
        let mut left = Vec::new();
        for (topic, peers) in self.topics.iter_mut() {
            if peers.remove(peer) {
                left.push(topic.clone());
            }
        }
        self.topics.retain(|_, peers| !peers.is_empty());
        left
    }

    /// Record an announcement; returns `true` if the peer is new to the topic.
    pub(crate) fn add_topic_peer(&mut self, topic: &str, peer: PeerId) -> bool {
        self.topics.entry(topic.to_string()).or_default().insert(peer)
    }

    pub(crate) fn remove_topic_peer(&mut self, topic: &str, peer: &PeerId) -> bool {
        let Some(peers) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = peers.remove(peer);
        if peers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("local", &self.local)
            .field("peers", &self.peers.len())
            .field("topics", &self.topics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::default_peer_filter;
    use crate::messages::GOSSIPSUB_V11_PROTOCOL;

    fn overlay() -> Overlay {
        Overlay::new(
            PeerId::from_seed(0),
            SeenMessages::new(Duration::from_secs(60)),
            default_peer_filter(),
            1024 * 1024,
        )
    }

    #[test]
    fn topic_membership_tracks_removal() {
        let mut ov = overlay();
        let (tx, _rx) = mpsc::channel(4);
        let peer = PeerId::from_seed(1);
        ov.insert_peer(&PeerConnection::new(peer, GOSSIPSUB_V11_PROTOCOL, true), tx);

        assert!(ov.add_topic_peer("a", peer));
        assert!(!ov.add_topic_peer("a", peer));
        assert!(ov.add_topic_peer("b", peer));
        assert!(ov.is_outbound(&peer));

        let mut left = ov.remove_peer(&peer);
        left.sort();
        assert_eq!(left, vec!["a".to_string(), "b".to_string()]);
        assert!(ov.topic_peers("a").is_none());
        assert!(!ov.is_connected(&peer));
    }

    #[test]
    fn full_queue_hands_rpc_back() {
        let mut ov = overlay();
        let (tx, _rx) = mpsc::channel(1);
        let peer = PeerId::from_seed(1);
        ov.insert_peer(&PeerConnection::new(peer, GOSSIPSUB_V11_PROTOCOL, false), tx);

        assert!(ov.send_or_drop(&peer, Rpc::default()));
        assert!(matches!(ov.try_send(&peer, Rpc::default()), Err(TrySendError::Full(_))));
        assert!(matches!(
            ov.try_send(&PeerId::from_seed(2), Rpc::default()),
            Err(TrySendError::Closed(_))
        ));
    }
}
