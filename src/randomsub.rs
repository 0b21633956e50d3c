//! # RandomSub Router
//!
//! Forwards each message to every floodsub peer of the topic plus a random
//! sample of the remaining topic peers. The sample size is
//! `max(size, ceil(sqrt(n)))`, so it grows with the network.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::identity::PeerId;
use crate::messages::{FLOODSUB_PROTOCOL, ProtocolId, RANDOMSUB_PROTOCOL, ReceivedMessage, Rpc};
use crate::protocols::PeerConnection;
use crate::router::{AcceptStatus, Overlay, PubSubRouter, RouterContext};
use crate::trace::RawTracer;

/// Default target of random forwards per message.
pub const RANDOMSUB_D: usize = 6;

#[derive(Debug)]
pub struct RandomSubRouter {
    size: usize,
}

impl RandomSubRouter {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }
}

impl Default for RandomSubRouter {
    fn default() -> Self {
        Self::new(RANDOMSUB_D)
    }
}

impl PubSubRouter for RandomSubRouter {
    fn protocols(&self) -> Vec<ProtocolId> {
        vec![RANDOMSUB_PROTOCOL.to_string(), FLOODSUB_PROTOCOL.to_string()]
    }

    fn attach(&mut self, ctx: RouterContext) -> anyhow::Result<Vec<Arc<dyn RawTracer>>> {
        debug!(local = %ctx.local.short(), size = self.size, "randomsub router attached");
        Ok(Vec::new())
    }

    fn add_peer(&mut self, _overlay: &Overlay, conn: &PeerConnection) {
        trace!(peer = %conn.peer.short(), protocol = %conn.protocol, "PEERUP");
    }

    fn remove_peer(&mut self, _overlay: &Overlay, peer: &PeerId) {
        trace!(peer = %peer.short(), "PEERDOWN");
    }

    fn enough_peers(&self, overlay: &Overlay, topic: &str, suggested: usize) -> bool {
        let Some(peers) = overlay.topic_peers(topic) else {
            return false;
        };
        let (mut fs_peers, mut rs_peers) = (0, 0);
        for peer in peers {
            match overlay.protocol(peer) {
                Some(FLOODSUB_PROTOCOL) => fs_peers += 1,
                Some(RANDOMSUB_PROTOCOL) => rs_peers += 1,
                _ => {}
            }
        }
        let suggested = if suggested == 0 { RANDOMSUB_D } else { suggested };
        fs_peers + rs_peers >= suggested || rs_peers >= RANDOMSUB_D
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

        let mut tosend = Vec::new();
        let mut random = Vec::new();
        for peer in peers {
            if *peer == from || Some(*peer) == author {
                continue;
            }
            if overlay.protocol(peer) == Some(FLOODSUB_PROTOCOL) {
                tosend.push(*peer);
            } else {
                random.push(*peer);
            }
        }

        if random.len() > self.size {
            let sqrt = (random.len() as f64).sqrt().ceil() as usize;
            let target = self.size.max(sqrt).min(random.len());
            random.shuffle(&mut rand::thread_rng());
            random.truncate(target);
        }
        tosend.extend(random);

        let rpc = Rpc::with_messages(vec![msg.message.clone()]);
        for peer in &tosend {
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
    fn samples_sqrt_of_large_topics_and_always_floods_floodsub_peers() {
        let mut overlay = Overlay::new(
            PeerId::from_seed(0),
            SeenMessages::new(Duration::from_secs(60)),
            default_peer_filter(),
            1024 * 1024,
        );
        let mut random_queues = Vec::new();
        for seed in 1..=100 {
            let peer = PeerId::from_seed(seed);
            let (tx, rx) = mpsc::channel(4);
            overlay.insert_peer(&PeerConnection::new(peer, RANDOMSUB_PROTOCOL, false), tx);
            overlay.add_topic_peer("t", peer);
            random_queues.push(rx);
        }
        let flood = PeerId::from_seed(1000);
        let (tx, mut flood_rx) = mpsc::channel(4);
        overlay.insert_peer(&PeerConnection::new(flood, FLOODSUB_PROTOCOL, false), tx);
        overlay.add_topic_peer("t", flood);

        let mut router = RandomSubRouter::new(2);
        assert!(router.enough_peers(&overlay, "t", 0));

        let message = Message {
            topic: "t".into(),
            data: b"x".to_vec(),
            ..Message::default()
        };
        let msg = ReceivedMessage::new(MessageId::from("m"), message, PeerId::from_seed(0));
        router.publish(&overlay, &msg);

        let sampled = random_queues.iter_mut().filter_map(|rx| rx.try_recv().ok()).count();
        assert_eq!(sampled, 10);
        assert!(flood_rx.try_recv().is_ok());
    }
}
