//! # FloodSub Router
//!
//! Forwards every message to every peer that announced the topic, except the
//! peer it came from and its author. No control traffic, no heartbeat.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::identity::PeerId;
use crate::messages::{FLOODSUB_PROTOCOL, ProtocolId, ReceivedMessage, Rpc};
use crate::protocols::PeerConnection;
use crate::router::{AcceptStatus, Overlay, PubSubRouter, RouterContext};
use crate::trace::RawTracer;

/// Topic peers considered enough to publish when the caller has no opinion.
pub const FLOODSUB_TOPIC_SEARCH_SIZE: usize = 5;

#[derive(Debug, Default)]
pub struct FloodSubRouter {
    protocols: Vec<ProtocolId>,
}

impl FloodSubRouter {
    pub fn new() -> Self {
        Self {
            protocols: vec![FLOODSUB_PROTOCOL.to_string()],
        }
    }

    /// Speak custom protocol ids instead of the floodsub default.
    pub fn with_protocols(protocols: Vec<ProtocolId>) -> Self {
        Self { protocols }
    }
}

impl PubSubRouter for FloodSubRouter {
    fn protocols(&self) -> Vec<ProtocolId> {
        if self.protocols.is_empty() {
            vec![FLOODSUB_PROTOCOL.to_string()]
        } else {
            self.protocols.clone()
        }
    }

    fn attach(&mut self, ctx: RouterContext) -> anyhow::Result<Vec<Arc<dyn RawTracer>>> {
        debug!(local = %ctx.local.short(), "floodsub router attached");
        Ok(Vec::new())
    }

    fn add_peer(&mut self, _overlay: &Overlay, conn: &PeerConnection) {
        trace!(peer = %conn.peer.short(), protocol = %conn.protocol, "PEERUP");
    }

    fn remove_peer(&mut self, _overlay: &Overlay, peer: &PeerId) {
        trace!(peer = %peer.short(), "PEERDOWN");
    }

    fn enough_peers(&self, overlay: &Overlay, topic: &str, suggested: usize) -> bool {
        let suggested = if suggested == 0 {
            FLOODSUB_TOPIC_SEARCH_SIZE
        } else {
            suggested
        };
        overlay.topic_peers(topic).map_or(0, |peers| peers.len()) >= suggested
    }

    fn accept_from(&self, _peer: &PeerId) -> AcceptStatus {
        AcceptStatus::All
    }

    fn handle_rpc(&mut self, _overlay: &Overlay, _from: &PeerId, _rpc: &Rpc) {}

    fn publish(&mut self, overlay: &Overlay, msg: &Arc<ReceivedMessage>) {
        let Some(peers) = overlay.topic_peers(msg.topic()) else {
            return;
        };
        let from = msg.received_from;
        let author = msg.author();
        let rpc = Rpc::with_messages(vec![msg.message.clone()]);

        for peer in peers {
            if *peer == from || Some(*peer) == author {
                continue;
            }
            if !overlay.send_or_drop(peer, rpc.clone()) {
                debug!(peer = %peer.short(), "dropping message to peer: queue full");
            }
        }
    }

    fn join(&mut self, overlay: &Overlay, topic: &str) {
        overlay.tracer().join(topic);
    }

    fn leave(&mut self, overlay: &Overlay, topic: &str) {
        overlay.tracer().leave(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::default_peer_filter;
    use crate::messages::{Message, MessageId};
    use crate::seen::SeenMessages;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn forwards_to_all_topic_peers_but_source_and_author() {
        let mut overlay = Overlay::new(
            PeerId::from_seed(0),
            SeenMessages::new(Duration::from_secs(60)),
            default_peer_filter(),
            1024 * 1024,
        );
        let mut queues = Vec::new();
        for seed in 1..=4 {
            let peer = PeerId::from_seed(seed);
            let (tx, rx) = mpsc::channel(4);
            overlay.insert_peer(&PeerConnection::new(peer, FLOODSUB_PROTOCOL, false), tx);
            overlay.add_topic_peer("t", peer);
            queues.push(rx);
        }

        let mut router = FloodSubRouter::new();
        assert!(!router.enough_peers(&overlay, "t", 0));
        assert!(router.enough_peers(&overlay, "t", 4));

        let message = Message {
            from: Some(PeerId::from_seed(2)),
            topic: "t".into(),
            data: b"hi".to_vec(),
            seqno: Some(1),
            ..Message::default()
        };
        let msg = ReceivedMessage::new(MessageId::from("m"), message, PeerId::from_seed(1));
        router.publish(&overlay, &msg);

        let got: Vec<usize> = queues.iter_mut().map(|rx| usize::from(rx.try_recv().is_ok())).collect();
        assert_eq!(got, vec![0, 0, 1, 1]);
    }
}
