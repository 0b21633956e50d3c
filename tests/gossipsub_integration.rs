//! Integration tests for end-to-end dissemination.
//!
//! Every test runs a small swarm of engines over the in-memory host, so the
//! full path is exercised: actor, peer writers, wire codec, validation and
//! the router heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meshsub::{
    AllowlistFilter, FloodSubRouter, GossipSubConfig, GossipSubRouter, Keypair, MemoryNetwork, PeerId, PubSub,
    PubSubConfig, PubSubHooks, PublishOptions, RawTracer, ReceivedMessage, RejectReason, Rpc, Subscription,
    Validator, ValidatorOptions,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

// =============================================================================
// Helper Functions
// =============================================================================

fn fast_config(d: usize, d_lo: usize, d_hi: usize) -> GossipSubConfig {
    let mut config = GossipSubConfig::default().with_degree(d, d_lo, d_hi);
    config.heartbeat_initial_delay = Duration::from_millis(10);
    config.heartbeat_interval = Duration::from_millis(50);
    config
}

fn gossip_node(network: &Arc<MemoryNetwork>, config: GossipSubConfig, hooks: PubSubHooks) -> PubSub {
    network
        .spawn_node(
            Keypair::generate(),
            GossipSubRouter::new(config).expect("router config"),
            PubSubConfig::default(),
            hooks,
        )
        .expect("spawn node")
}

async fn swarm(n: usize, config: &GossipSubConfig) -> (Arc<MemoryNetwork>, Vec<PubSub>) {
    let network = MemoryNetwork::new();
    let nodes: Vec<PubSub> = (0..n)
        .map(|_| gossip_node(&network, config.clone(), PubSubHooks::default()))
        .collect();
    (network, nodes)
}

async fn connect_all(network: &MemoryNetwork, nodes: &[PubSub]) {
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            network
                .connect(&a.local_peer_id(), &b.local_peer_id())
                .await
                .expect("connect");
        }
    }
}

async fn connect_line(network: &MemoryNetwork, nodes: &[PubSub]) {
    for pair in nodes.windows(2) {
        network
            .connect(&pair[0].local_peer_id(), &pair[1].local_peer_id())
            .await
            .expect("connect");
    }
}

async fn recv(sub: &mut Subscription) -> Arc<ReceivedMessage> {
    timeout(TEST_TIMEOUT, sub.next())
        .await
        .expect("timed out waiting for message")
        .expect("subscription closed")
}

async fn assert_quiet(sub: &mut Subscription) {
    assert!(
        timeout(QUIET_PERIOD, sub.next()).await.is_err(),
        "unexpected delivery on {}",
        sub.topic()
    );
}

async fn wait_for_mesh(node: &PubSub, topic: &str, min: usize) {
    timeout(TEST_TIMEOUT, async {
        loop {
            if node.mesh_peers(topic).await.expect("mesh peers").len() >= min {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("mesh did not form");
}

async fn wait_for_topic_peers(node: &PubSub, topic: &str, expected: &[PeerId]) {
    timeout(TEST_TIMEOUT, async {
        loop {
            let peers = node.list_peers(Some(topic)).await.expect("list peers");
            if expected.iter().all(|p| peers.contains(p)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("topic peers never announced");
}

#[derive(Default)]
struct CountingTracer {
    duplicates: AtomicUsize,
    rejected: AtomicUsize,
}

impl RawTracer for CountingTracer {
    fn duplicate_message(&self, _msg: &ReceivedMessage) {
        self.duplicates.fetch_add(1, Ordering::SeqCst);
    }

    fn reject_message(&self, _msg: &ReceivedMessage, reason: RejectReason) {
        if reason == RejectReason::ValidationFailed {
            self.rejected.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Dissemination
// =============================================================================

/// A message published on one node reaches every other subscriber exactly once.
#[tokio::test]
async fn message_reaches_every_subscriber_once() {
    let (network, nodes) = swarm(6, &fast_config(3, 2, 5)).await;
    connect_all(&network, &nodes).await;

    let mut subs = Vec::new();
    for node in &nodes {
        subs.push(node.subscribe("news").await.expect("subscribe"));
    }
    for node in &nodes {
        wait_for_mesh(node, "news", 2).await;
    }

    let id = nodes[0].publish("news", b"hello mesh".to_vec()).await.expect("publish");

    for sub in subs.iter_mut() {
        let msg = recv(sub).await;
        assert_eq!(msg.id, id);
        assert_eq!(msg.data(), b"hello mesh");
        assert_eq!(msg.author(), Some(nodes[0].local_peer_id()));
    }
    for sub in subs.iter_mut() {
        assert_quiet(sub).await;
    }
}

/// After a few heartbeats every mesh sits between D_lo and D_hi.
#[tokio::test]
async fn mesh_degree_converges_within_bounds() {
    let (network, nodes) = swarm(12, &fast_config(4, 3, 6)).await;
    connect_all(&network, &nodes).await;

    let mut _subs = Vec::new();
    for node in &nodes {
        _subs.push(node.subscribe("bounds").await.expect("subscribe"));
    }

    timeout(TEST_TIMEOUT, async {
        loop {
            let mut within = true;
            for node in &nodes {
                let size = node.mesh_peers("bounds").await.expect("mesh peers").len();
                within &= (3..=6).contains(&size);
            }
            if within {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("mesh degree never converged");
}

/// Three peers with D = D_lo = D_hi = 1: every subscriber still gets the
/// message, and replaying it from another peer is a traced duplicate.
#[tokio::test]
async fn degree_one_swarm_delivers_and_suppresses_duplicates() {
    let network = MemoryNetwork::new();
    let config = fast_config(1, 1, 1);
    let tracer = Arc::new(CountingTracer::default());
    let a = gossip_node(&network, config.clone(), PubSubHooks::default());
    let b = gossip_node(&network, config.clone(), PubSubHooks::default());
    let c = gossip_node(&network, config, PubSubHooks::default().with_tracer(tracer.clone()));
    let nodes = [a, b, c];
    connect_all(&network, &nodes).await;

    let mut subs = Vec::new();
    for node in &nodes {
        subs.push(node.subscribe("t").await.expect("subscribe"));
    }
    for node in &nodes {
        wait_for_mesh(node, "t", 1).await;
    }

    let id = nodes[0].publish("t", b"m1".to_vec()).await.expect("publish");
    let mut at_c = None;
    for sub in subs.iter_mut() {
        let msg = recv(sub).await;
        assert_eq!(msg.id, id);
        at_c = Some(msg);
    }
    let m1 = at_c.expect("delivered at c");

    let before = tracer.duplicates.load(Ordering::SeqCst);
    nodes[2]
        .handle_rpc(nodes[1].local_peer_id(), Rpc::with_messages(vec![m1.message.clone()]))
        .await
        .expect("inject duplicate");
    timeout(TEST_TIMEOUT, async {
        while tracer.duplicates.load(Ordering::SeqCst) <= before {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("duplicate never traced");
    assert_quiet(&mut subs[2]).await;
}

/// A relaying node forwards without delivering locally.
#[tokio::test]
async fn relay_forwards_without_local_delivery() {
    let (network, nodes) = swarm(3, &fast_config(2, 1, 4)).await;
    connect_line(&network, &nodes).await;

    let topic_b = nodes[1].join("relay").await.expect("join");
    let _relay = topic_b.relay().await.expect("relay");
    let mut sub_c = nodes[2].subscribe("relay").await.expect("subscribe");
    wait_for_topic_peers(&nodes[0], "relay", &[nodes[1].local_peer_id()]).await;
    wait_for_mesh(&nodes[1], "relay", 1).await;

    let id = nodes[0].publish("relay", b"through b".to_vec()).await.expect("publish");
    assert_eq!(recv(&mut sub_c).await.id, id);
    assert!(nodes[1].topics().await.expect("topics").is_empty());
}

/// Local-only publishes never leave the node.
#[tokio::test]
async fn local_only_publish_is_not_forwarded() {
    let (network, nodes) = swarm(2, &fast_config(2, 1, 4)).await;
    connect_all(&network, &nodes).await;

    let topic_a = nodes[0].join("local").await.expect("join");
    assert!(nodes[0].join("local").await.is_err(), "topic joined twice");
    let mut sub_a = topic_a.subscribe().await.expect("subscribe");
    let mut sub_b = nodes[1].subscribe("local").await.expect("subscribe");
    wait_for_mesh(&nodes[0], "local", 1).await;

    topic_a
        .publish_with(b"only here".to_vec(), PublishOptions::default().local_only())
        .await
        .expect("publish");
    assert_eq!(recv(&mut sub_a).await.data(), b"only here");
    assert_quiet(&mut sub_b).await;

    topic_a.publish(b"everywhere".to_vec()).await.expect("publish");
    assert_eq!(recv(&mut sub_a).await.data(), b"everywhere");
    assert_eq!(recv(&mut sub_b).await.data(), b"everywhere");
}

/// Publishing with a readiness requirement waits for mesh peers.
#[tokio::test]
async fn ready_publish_waits_for_topic_peers() {
    let (network, nodes) = swarm(2, &fast_config(2, 1, 4)).await;
    let topic_a = nodes[0].join("ready").await.expect("join");
    let _sub_a = topic_a.subscribe().await.expect("subscribe");
    let mut sub_b = nodes[1].subscribe("ready").await.expect("subscribe");

    let publisher = tokio::spawn(async move {
        topic_a
            .publish_with(b"when ready".to_vec(), PublishOptions::default().with_readiness(1))
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!publisher.is_finished());

    connect_all(&network, &nodes).await;
    timeout(TEST_TIMEOUT, publisher)
        .await
        .expect("publish never became ready")
        .expect("join publisher")
        .expect("publish");
    assert_eq!(recv(&mut sub_b).await.data(), b"when ready");
}

/// FloodSub and GossipSub nodes interoperate.
#[tokio::test]
async fn floodsub_peer_bridges_gossipsub_nodes() {
    let network = MemoryNetwork::new();
    let a = gossip_node(&network, fast_config(2, 1, 4), PubSubHooks::default());
    let b = network
        .spawn_node(
            Keypair::generate(),
            FloodSubRouter::new(),
            PubSubConfig::default(),
            PubSubHooks::default(),
        )
        .expect("floodsub node");
    let c = gossip_node(&network, fast_config(2, 1, 4), PubSubHooks::default());
    let nodes = [a, b, c];
    connect_line(&network, &nodes).await;

    let mut subs = Vec::new();
    for node in &nodes {
        subs.push(node.subscribe("mixed").await.expect("subscribe"));
    }
    wait_for_topic_peers(&nodes[0], "mixed", &[nodes[1].local_peer_id()]).await;
    wait_for_topic_peers(&nodes[1], "mixed", &[nodes[2].local_peer_id()]).await;

    let id = nodes[0].publish("mixed", b"bridge".to_vec()).await.expect("publish");
    for sub in subs.iter_mut() {
        assert_eq!(recv(sub).await.id, id);
    }
}

// =============================================================================
// Validation and Admission
// =============================================================================

/// A message rejected by an intermediate validator stops there.
#[tokio::test]
async fn validator_rejection_stops_propagation() {
    let network = MemoryNetwork::new();
    let tracer = Arc::new(CountingTracer::default());
    let a = gossip_node(&network, fast_config(2, 1, 4), PubSubHooks::default());
    let b = gossip_node(&network, fast_config(2, 1, 4), PubSubHooks::default().with_tracer(tracer.clone()));
    let c = gossip_node(&network, fast_config(2, 1, 4), PubSubHooks::default());
    b.register_topic_validator(
        "checked",
        Validator::inline_bool(|_, msg| msg.data() != b"bad"),
        ValidatorOptions::default(),
    )
    .expect("register validator");
    let nodes = [a, b, c];
    connect_line(&network, &nodes).await;

    let mut subs = Vec::new();
    for node in &nodes {
        subs.push(node.subscribe("checked").await.expect("subscribe"));
    }
    wait_for_mesh(&nodes[0], "checked", 1).await;
    wait_for_mesh(&nodes[2], "checked", 1).await;

    nodes[0].publish("checked", b"bad".to_vec()).await.expect("publish bad");
    let good = nodes[0].publish("checked", b"good".to_vec()).await.expect("publish good");

    let first_at_c = recv(&mut subs[2]).await;
    assert_eq!(first_at_c.id, good);
    timeout(TEST_TIMEOUT, async {
        while tracer.rejected.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("rejection never traced");
    assert_eq!(tracer.rejected.load(Ordering::SeqCst), 1);
    assert_eq!(recv(&mut subs[1]).await.id, good);
}

/// Blacklisting disconnects the peer and refuses it afterwards.
#[tokio::test]
async fn blacklisted_peer_is_disconnected_and_refused() {
    let (network, nodes) = swarm(2, &fast_config(2, 1, 4)).await;
    connect_all(&network, &nodes).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let mut sub_a = a.subscribe("bl").await.expect("subscribe");
    let _sub_b = b.subscribe("bl").await.expect("subscribe");
    wait_for_topic_peers(a, "bl", &[b.local_peer_id()]).await;

    a.blacklist_peer(b.local_peer_id()).await.expect("blacklist");
    assert!(a.list_peers(None).await.expect("peers").is_empty());

    b.publish("bl", b"ignored".to_vec()).await.expect("publish");
    assert_quiet(&mut sub_a).await;

    network.disconnect(&a.local_peer_id(), &b.local_peer_id()).await;
    assert!(
        network
            .connect(&b.local_peer_id(), &a.local_peer_id())
            .await
            .is_err()
    );
}

/// The subscription filter refuses local joins outside the allow-list.
#[tokio::test]
async fn subscription_filter_limits_local_joins() {
    let network = MemoryNetwork::new();
    let hooks = PubSubHooks::default().with_subscription_filter(Arc::new(AllowlistFilter::new(["allowed"])));
    let node = gossip_node(&network, fast_config(2, 1, 4), hooks);

    assert!(node.join("forbidden").await.is_err());
    let topic = node.join("allowed").await.expect("join");
    assert_eq!(topic.name(), "allowed");
}

// =============================================================================
// Connection Failures
// =============================================================================

/// A failed write drops the peer and a backoff reconnect restores it.
#[tokio::test]
async fn write_failure_triggers_reconnect() {
    let (network, nodes) = swarm(2, &fast_config(2, 1, 4)).await;
    connect_all(&network, &nodes).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    network.sever(&a.local_peer_id(), &b.local_peer_id());
    // The announcement is the first write to hit the dead link.
    let _sub = a.subscribe("after-failure").await.expect("subscribe");

    timeout(TEST_TIMEOUT, async {
        loop {
            let linked = network.is_linked(&a.local_peer_id(), &b.local_peer_id());
            let peers = a.list_peers(None).await.expect("peers");
            if linked && peers.contains(&b.local_peer_id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer never reconnected");

    wait_for_topic_peers(b, "after-failure", &[a.local_peer_id()]).await;
}
