//! # In-Memory Host
//!
//! Runs many [`PubSub`] engines inside one process. Each node gets a
//! [`MemoryHost`]; links are negotiated like streams (first protocol of the
//! dialer that the listener also speaks) and every RPC is encoded and decoded
//! with the bounded wire codec, so size limits behave as they would on a
//! socket. RPCs sent while a link is still being set up wait until both
//! sides have registered the peer.
//!
//! Used by the integration tests and the demo binary.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::{PubSubConfig, PubSubHooks};
use crate::identity::{Keypair, PeerId};
use crate::messages::{ProtocolId, Rpc, decode_rpc, encode_rpc};
use crate::protocols::{Host, PeerConnection};
use crate::pubsub::PubSub;
use crate::router::PubSubRouter;

#[derive(Clone)]
struct MemoryNode {
    pubsub: PubSub,
    protocols: Vec<ProtocolId>,
    max_message_size: usize,
}

/// Process-local network of pubsub nodes.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<PeerId, MemoryNode>>,
    /// Undirected links keyed with the smaller id first; `true` once both
    /// sides have accepted the stream.
    links: RwLock<HashMap<(PeerId, PeerId), watch::Sender<bool>>>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a node on this network.
    pub fn spawn_node(
        self: &Arc<Self>,
        keypair: Keypair,
        router: impl PubSubRouter,
        config: PubSubConfig,
        hooks: PubSubHooks,
    ) -> anyhow::Result<PubSub> {
        let local = keypair.peer_id();
        if self.nodes.read().contains_key(&local) {
            bail!("node {} already exists", local.short());
        }
        let host = Arc::new(MemoryHost {
            local,
            network: Arc::clone(self),
        });
        let protocols = router.protocols();
        let max_message_size = config.max_message_size;
        let pubsub = PubSub::spawn(host, keypair, router, config, hooks)?;
        self.nodes.write().insert(
            local,
            MemoryNode {
                pubsub: pubsub.clone(),
                protocols,
                max_message_size,
            },
        );
        debug!(node = %local.short(), "memory node started");
        Ok(pubsub)
    }

    fn node(&self, peer: &PeerId) -> anyhow::Result<MemoryNode> {
        self.nodes
            .read()
            .get(peer)
            .cloned()
            .with_context(|| format!("unknown node {}", peer.short()))
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.nodes.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links
            .read()
            .get(&link_key(*a, *b))
            .is_some_and(|ready| *ready.borrow())
    }

    /// Open a pubsub stream from `dialer` to `listener` and report it to both.
    pub async fn connect(&self, dialer: &PeerId, listener: &PeerId) -> anyhow::Result<()> {
        if dialer == listener {
            bail!("cannot connect a node to itself");
        }
        let a = self.node(dialer)?;
        let b = self.node(listener)?;
        let protocol = a
            .protocols
            .iter()
            .find(|p| b.protocols.contains(p))
            .cloned()
            .with_context(|| {
                format!(
                    "no common protocol between {} and {}",
                    dialer.short(),
                    listener.short()
                )
            })?;

        let key = link_key(*dialer, *listener);
        if self.is_linked(dialer, listener) {
            return Ok(());
        }
        let fresh = {
            let mut links = self.links.write();
            let fresh = !links.contains_key(&key);
            links.entry(key).or_insert_with(|| watch::channel(false).0);
            fresh
        };

        let added = async {
            if fresh {
                // A new stream replaces whatever state either side kept for a
                // link that died underneath it.
                a.pubsub.remove_peer(*listener).await?;
                b.pubsub.remove_peer(*dialer).await?;
            }
            a.pubsub
                .add_peer(PeerConnection::new(*listener, protocol.clone(), true))
                .await?;
            b.pubsub
                .add_peer(PeerConnection::new(*dialer, protocol.clone(), false))
                .await
        }
        .await;
        if let Err(err) = added {
            self.disconnect(dialer, listener).await;
            return Err(err.context("peer refused connection"));
        }
        if let Some(ready) = self.links.read().get(&key) {
            ready.send_replace(true);
        }
        trace!(dialer = %dialer.short(), listener = %listener.short(), protocol = %protocol, "linked");
        Ok(())
    }

    /// Close the link and tell both sides.
    pub async fn disconnect(&self, a: &PeerId, b: &PeerId) {
        self.links.write().remove(&link_key(*a, *b));
        for (node, peer) in [(a, b), (b, a)] {
            if let Ok(node) = self.node(node) {
                let _ = node.pubsub.remove_peer(*peer).await;
            }
        }
    }

    /// Drop the link without telling either side, as a failed transport would.
    /// The next send on it fails.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        self.links.write().remove(&link_key(*a, *b));
    }

    /// Stop a node and drop all of its links.
    pub async fn remove_node(&self, peer: &PeerId) {
        let Some(node) = self.nodes.write().remove(peer) else {
            return;
        };
        let linked: Vec<PeerId> = {
            let mut links = self.links.write();
            let linked = links
                .keys()
                .filter_map(|(x, y)| {
                    if x == peer {
                        Some(*y)
                    } else if y == peer {
                        Some(*x)
                    } else {
                        None
                    }
                })
                .collect();
            links.retain(|(x, y), _| x != peer && y != peer);
            linked
        };
        for other in linked {
            if let Ok(other) = self.node(&other) {
                let _ = other.pubsub.remove_peer(*peer).await;
            }
        }
        node.pubsub.shutdown().await;
    }

    async fn deliver(&self, from: PeerId, to: &PeerId, rpc: Rpc) -> anyhow::Result<()> {
        let mut ready = match self.links.read().get(&link_key(from, *to)) {
            Some(link) => link.subscribe(),
            None => bail!("no link to {}", to.short()),
        };
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| anyhow::anyhow!("link to {} closed", to.short()))?;
        let target = self.node(to)?;
        let bytes = encode_rpc(&rpc).context("failed to encode rpc")?;
        let rpc = decode_rpc(&bytes, target.max_message_size).context("rpc exceeds receiver limit")?;
        target.pubsub.handle_rpc(from, rpc).await
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.nodes.read().len())
            .field("links", &self.links.read().len())
            .finish()
    }
}

/// [`Host`] view of one node on a [`MemoryNetwork`].
pub struct MemoryHost {
    local: PeerId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn send_rpc(&self, to: &PeerId, rpc: Rpc) -> anyhow::Result<()> {
        self.network.deliver(self.local, to, rpc).await
    }

    async fn connect(&self, peer: &PeerId) -> anyhow::Result<()> {
        self.network.connect(&self.local, peer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::floodsub::FloodSubRouter;
    use crate::config::GossipSubConfig;
    use crate::gossipsub::GossipSubRouter;

    #[tokio::test]
    async fn negotiates_common_protocol() {
        let network = MemoryNetwork::new();
        let a = network
            .spawn_node(
                Keypair::generate(),
                GossipSubRouter::new(GossipSubConfig::default()).expect("router"),
                PubSubConfig::default(),
                PubSubHooks::default(),
            )
            .expect("node a");
        let b = network
            .spawn_node(
                Keypair::generate(),
                FloodSubRouter::new(),
                PubSubConfig::default(),
                PubSubHooks::default(),
            )
            .expect("node b");

        network
            .connect(&a.local_peer_id(), &b.local_peer_id())
            .await
            .expect("connect");
        assert!(network.is_linked(&a.local_peer_id(), &b.local_peer_id()));
        assert_eq!(a.list_peers(None).await.expect("peers"), vec![b.local_peer_id()]);
        assert_eq!(b.list_peers(None).await.expect("peers"), vec![a.local_peer_id()]);

        let custom = FloodSubRouter::with_protocols(vec!["/custom/1.0.0".into()]);
        let c = network
            .spawn_node(Keypair::generate(), custom, PubSubConfig::default(), PubSubHooks::default())
            .expect("node c");
        assert!(network.connect(&c.local_peer_id(), &b.local_peer_id()).await.is_err());
        assert!(!network.is_linked(&c.local_peer_id(), &b.local_peer_id()));
    }
}
