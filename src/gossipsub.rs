//! # GossipSub v1.1 Router
//!
//! Mesh-based publish/subscribe with lazy gossip repair, peer scoring and
//! admission control.
//!
//! ## Overlays
//!
//! | Set | Purpose | Maintained by |
//! |-----|---------|---------------|
//! | Mesh | Eager push for joined topics | GRAFT/PRUNE and the heartbeat |
//! | Fanout | Eager push for published-but-not-joined topics | publish, expired after `fanout_ttl` |
//! | Gossip | IHAVE advertisements to peers outside the mesh | heartbeat |
//! | Direct | Always forwarded to, never meshed | configuration |
//!
//! ## Heartbeat
//!
//! 1. Clear per-heartbeat IHAVE counters, expire stale backoffs every 15 ticks
//! 2. Apply broken IWANT promises as behavioural penalties
//! 3. Reconnect direct peers every `direct_connect_ticks`
//! 4. Per mesh topic: prune negative scores, graft below D_lo, trim above D_hi
//!    (keeping D_score best and D_out outbound), top up outbound, graft
//!    opportunistically, emit gossip
//! 5. Expire and refill fanout, emit gossip
//! 6. Send coalesced GRAFT/PRUNE, flush pending gossip and control, shift cache
//!
//! ## Control Retries
//!
//! Outbound queues never block. A dropped RPC has its GRAFT/PRUNE content
//! re-queued and piggybacked on the next send to that peer; a GRAFT is only
//! retried while the peer is still in our mesh and a PRUNE only while it is not.
//!
//! ## Security Measures
//!
//! - Peers below the graylist threshold are dropped before any processing
//! - IHAVE is capped per heartbeat both in messages and in requested ids
//! - IWANT responses are capped per (message, peer)
//! - GRAFT during backoff is refused and penalized, twice if it floods
//! - Peer exchange is only honoured from peers above the accept-PX threshold

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::GossipSubConfig;
use crate::gossip_tracer::GossipTracer;
use crate::identity::PeerId;
use crate::mcache::MessageCache;
use crate::messages::{
    ControlGraft, ControlIHave, ControlIWant, ControlMessage, ControlPrune, FLOODSUB_PROTOCOL,
    GOSSIPSUB_V10_PROTOCOL, GOSSIPSUB_V11_PROTOCOL, Message, MessageId, PeerInfo, ProtocolId, ReceivedMessage,
    Rpc, fragment_rpc,
};
use crate::peer_gater::PeerGater;
use crate::protocols::{Host, PeerConnection};
use crate::router::{AcceptStatus, Overlay, PubSubRouter, RouterContext};
use crate::score::{PeerScore, PeerScoreSnapshot, ScoreInspectFn};
use crate::score_params::{PeerScoreThresholds, TopicScoreParams};
use crate::trace::RawTracer;

/// Backoffs are swept every this many heartbeats.
const BACKOFF_CLEANUP_TICKS: u64 = 15;

/// Upper bound on a backoff requested by a remote PRUNE.
/// SECURITY: a hostile backoff must not overflow the clock or pin state forever.
pub const MAX_REMOTE_PRUNE_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Protocol Features
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GossipSubFeature {
    /// Mesh membership via GRAFT/PRUNE.
    Mesh,
    /// Peer exchange on PRUNE.
    Px,
}

/// Whether `protocol` supports `feature`.
pub fn supports(feature: GossipSubFeature, protocol: &str) -> bool {
    match feature {
        GossipSubFeature::Mesh => protocol == GOSSIPSUB_V11_PROTOCOL || protocol == GOSSIPSUB_V10_PROTOCOL,
        GossipSubFeature::Px => protocol == GOSSIPSUB_V11_PROTOCOL,
    }
}

fn speaks_mesh(overlay: &Overlay, peer: &PeerId) -> bool {
    overlay
        .protocol(peer)
        .is_some_and(|proto| supports(GossipSubFeature::Mesh, proto))
}

/// Mesh-capable peers of `topic` passing `filter`, shuffled and truncated to
/// `count` (`0` keeps all).
fn get_peers(overlay: &Overlay, topic: &str, count: usize, mut filter: impl FnMut(&PeerId) -> bool) -> Vec<PeerId> {
    let Some(tpeers) = overlay.topic_peers(topic) else {
        return Vec::new();
    };
    let mut peers: Vec<PeerId> = tpeers
        .iter()
        .filter(|p| speaks_mesh(overlay, p) && filter(p) && overlay.peer_filter(p, topic))
        .copied()
        .collect();
    peers.shuffle(&mut rand::thread_rng());
    if count > 0 && peers.len() > count {
        peers.truncate(count);
    }
    peers
}

fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

// ============================================================================
// Heartbeat Plan
// ============================================================================

/// GRAFT/PRUNE decisions collected during one heartbeat and sent coalesced.
#[derive(Default)]
struct HeartbeatPlan {
    tograft: HashMap<PeerId, Vec<String>>,
    toprune: HashMap<PeerId, Vec<String>>,
    no_px: HashSet<PeerId>,
}

impl HeartbeatPlan {
    fn graft(&mut self, overlay: &Overlay, topic: &str, peer: PeerId, mesh: &mut HashSet<PeerId>) {
        debug!(peer = %peer.short(), topic = %topic, "HEARTBEAT: add mesh link");
        overlay.tracer().graft(&peer, topic);
        mesh.insert(peer);
        self.tograft.entry(peer).or_default().push(topic.to_string());
    }

    fn prune(&mut self, overlay: &Overlay, topic: &str, peer: PeerId, mesh: &mut HashSet<PeerId>) {
        debug!(peer = %peer.short(), topic = %topic, "HEARTBEAT: remove mesh link");
        overlay.tracer().prune(&peer, topic);
        mesh.remove(&peer);
        self.toprune.entry(peer).or_default().push(topic.to_string());
    }
}

// ============================================================================
// Router
// ============================================================================

pub struct GossipSubRouter {
    config: GossipSubConfig,
    thresholds: PeerScoreThresholds,

    direct: HashSet<PeerId>,
    /// Shared with connector workers so they skip peers that are already up.
    connected: Arc<RwLock<HashSet<PeerId>>>,

    mesh: HashMap<String, HashSet<PeerId>>,
    fanout: HashMap<String, HashSet<PeerId>>,
    lastpub: HashMap<String, Instant>,
    /// Pending IHAVEs, flushed or piggybacked.
    gossip: HashMap<PeerId, Vec<ControlIHave>>,
    /// Pending GRAFT/PRUNE retries.
    control: HashMap<PeerId, ControlMessage>,
    /// IHAVE messages received per peer this heartbeat.
    peerhave: HashMap<PeerId, usize>,
    /// Ids requested per peer this heartbeat.
    iasked: HashMap<PeerId, usize>,
    backoff: HashMap<String, HashMap<PeerId, Instant>>,

    mcache: MessageCache,
    score: Option<Arc<PeerScore>>,
    score_inspect: Option<(ScoreInspectFn, Duration)>,
    gossip_tracer: Arc<GossipTracer>,
    gater: Option<Arc<PeerGater>>,

    connect_tx: Option<mpsc::Sender<PeerId>>,
    heartbeat_ticks: u64,
}

impl GossipSubRouter {
    pub fn new(config: GossipSubConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let (score, thresholds, score_inspect) = match &config.scoring {
            Some(scoring) => (
                Some(PeerScore::new(scoring.params.clone())?),
                scoring.thresholds.clone(),
                scoring.inspect.clone(),
            ),
            None => (None, PeerScoreThresholds::default(), None),
        };
        let gater = match &config.peer_gater {
            Some(params) => Some(PeerGater::new(params.clone())?),
            None => None,
        };

        Ok(Self {
            thresholds,
            direct: config.direct_peers.iter().copied().collect(),
            connected: Arc::new(RwLock::new(HashSet::new())),
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            lastpub: HashMap::new(),
            gossip: HashMap::new(),
            control: HashMap::new(),
            peerhave: HashMap::new(),
            iasked: HashMap::new(),
            backoff: HashMap::new(),
            mcache: MessageCache::new(config.history_gossip, config.history_length),
            score,
            score_inspect,
            gossip_tracer: Arc::new(GossipTracer::new(config.iwant_followup_time)),
            gater,
            connect_tx: None,
            heartbeat_ticks: 0,
            config,
        })
    }

    pub fn config(&self) -> &GossipSubConfig {
        &self.config
    }

    /// Observers this router needs registered with the engine tracer.
    pub fn tracers(&self) -> Vec<Arc<dyn RawTracer>> {
        let mut tracers: Vec<Arc<dyn RawTracer>> = Vec::new();
        if let Some(score) = &self.score {
            tracers.push(Arc::clone(score) as Arc<dyn RawTracer>);
        }
        tracers.push(Arc::clone(&self.gossip_tracer) as Arc<dyn RawTracer>);
        if let Some(gater) = &self.gater {
            tracers.push(Arc::clone(gater) as Arc<dyn RawTracer>);
        }
        tracers
    }

    pub fn fanout_peers(&self, topic: &str) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.fanout.get(topic).into_iter().flatten().copied().collect();
        peers.sort();
        peers
    }

    /// Whether `peer` is backed off for `topic` right now.
    pub fn is_backed_off(&self, peer: &PeerId, topic: &str) -> bool {
        self.backoff
            .get(topic)
            .and_then(|b| b.get(peer))
            .is_some_and(|expire| Instant::now() < *expire)
    }

    fn score_of(&self, peer: &PeerId) -> f64 {
        self.score.as_ref().map_or(0.0, |s| s.score(peer))
    }

    fn add_penalty(&self, peer: &PeerId, count: usize) {
        if let Some(score) = &self.score {
            score.add_penalty(peer, count);
        }
    }

    // ========================================================================
    // Backoff
    // ========================================================================

    fn add_backoff(&mut self, peer: &PeerId, topic: &str, unsubscribe: bool) {
        let duration = if unsubscribe {
            self.config.unsubscribe_backoff
        } else {
            self.config.prune_backoff
        };
        self.do_add_backoff(peer, topic, duration);
    }

    /// Extend a backoff; an existing later expiry is kept.
    fn do_add_backoff(&mut self, peer: &PeerId, topic: &str, duration: Duration) {
        let now = Instant::now();
        let expire = now
            .checked_add(duration.min(MAX_REMOTE_PRUNE_BACKOFF))
            .unwrap_or(now);
        let entries = self.backoff.entry(topic.to_string()).or_default();
        match entries.get(peer) {
            Some(existing) if *existing >= expire => {}
            _ => {
                entries.insert(*peer, expire);
            }
        }
    }

    fn clear_backoff(&mut self) {
        if self.heartbeat_ticks % BACKOFF_CLEANUP_TICKS != 0 {
            return;
        }
        let now = Instant::now();
        let slack = self.config.heartbeat_interval * 2;
        self.backoff.retain(|_, entries| {
            entries.retain(|_, expire| *expire + slack >= now);
            !entries.is_empty()
        });
    }

    // ========================================================================
    // Control Handlers
    // ========================================================================

    fn handle_ihave(&mut self, overlay: &Overlay, peer: &PeerId, ihaves: &[ControlIHave]) -> Vec<ControlIWant> {
        if ihaves.is_empty() {
            return Vec::new();
        }

        let score = self.score_of(peer);
        if score < self.thresholds.gossip_threshold {
            debug!(peer = %peer.short(), score, "IHAVE: ignoring peer below gossip threshold");
            return Vec::new();
        }

        let have = self.peerhave.entry(*peer).or_default();
        *have += 1;
        if *have > self.config.max_ihave_messages {
            debug!(
                peer = %peer.short(),
                messages = *have,
                "IHAVE: peer has advertised too many times within this heartbeat; ignoring"
            );
            return Vec::new();
        }

        let asked = self.iasked.get(peer).copied().unwrap_or(0);
        if asked >= self.config.max_ihave_length {
            debug!(peer = %peer.short(), asked, "IHAVE: peer has already advertised too many messages; ignoring");
            return Vec::new();
        }

        let mut wanted: HashSet<MessageId> = HashSet::new();
        for ihave in ihaves {
            if !self.mesh.contains_key(&ihave.topic) || !overlay.peer_filter(peer, &ihave.topic) {
                continue;
            }
            for id in &ihave.message_ids {
                if !overlay.has_seen(id) {
                    wanted.insert(id.clone());
                }
            }
        }
        if wanted.is_empty() {
            return Vec::new();
        }

        let iask = wanted.len().min(self.config.max_ihave_length - asked);
        debug!(peer = %peer.short(), wanted = wanted.len(), asking = iask, "IHAVE: asking for messages");

        let mut ids: Vec<MessageId> = wanted.into_iter().collect();
        ids.shuffle(&mut rand::thread_rng());
        ids.truncate(iask);

        *self.iasked.entry(*peer).or_default() += iask;
        self.gossip_tracer.add_promise(peer, &ids);

        vec![ControlIWant { message_ids: ids }]
    }

    fn handle_iwant(&mut self, overlay: &Overlay, peer: &PeerId, iwants: &[ControlIWant]) -> Vec<Message> {
        if iwants.is_empty() {
            return Vec::new();
        }

        let score = self.score_of(peer);
        if score < self.thresholds.gossip_threshold {
            debug!(peer = %peer.short(), score, "IWANT: ignoring peer below gossip threshold");
            return Vec::new();
        }

        let mut served: HashSet<&MessageId> = HashSet::new();
        let mut out = Vec::new();
        for iwant in iwants {
            for id in &iwant.message_ids {
                if !served.insert(id) {
                    continue;
                }
                let Some((msg, count)) = self.mcache.get_for_peer(id, peer) else {
                    continue;
                };
                if !overlay.peer_filter(peer, msg.topic()) {
                    continue;
                }
                if count > self.config.gossip_retransmission {
                    debug!(peer = %peer.short(), id = %id, "IWANT: peer has asked for message too many times; ignoring");
                    continue;
                }
                out.push(msg.message.clone());
            }
        }

        if !out.is_empty() {
            debug!(peer = %peer.short(), count = out.len(), "IWANT: sending cached messages");
        }
        out
    }

    fn handle_graft(&mut self, overlay: &Overlay, peer: &PeerId, grafts: &[ControlGraft]) -> Vec<ControlPrune> {
        let mut prune_topics = Vec::new();
        let mut do_px = self.config.do_px;
        let score = self.score_of(peer);
        let now = Instant::now();

        for graft in grafts {
            let topic = graft.topic.as_str();
            if !overlay.peer_filter(peer, topic) {
                continue;
            }

            let (in_mesh, mesh_len) = match self.mesh.get(topic) {
                Some(peers) => (peers.contains(peer), peers.len()),
                None => {
                    // Unknown topic: no PX so we don't leak our peers.
                    do_px = false;
                    continue;
                }
            };
            if in_mesh {
                continue;
            }

            if self.direct.contains(peer) {
                warn!(peer = %peer.short(), topic = %topic, "GRAFT: ignoring request from direct peer");
                prune_topics.push(topic.to_string());
                do_px = false;
                continue;
            }

            let expire = self.backoff.get(topic).and_then(|b| b.get(peer)).copied();
            if let Some(expire) = expire
                && now < expire
            {
                debug!(peer = %peer.short(), topic = %topic, "GRAFT: ignoring backed off peer");
                self.add_penalty(peer, 1);
                do_px = false;
                let flood_cutoff = (expire + self.config.graft_flood_threshold).checked_sub(self.config.prune_backoff);
                if flood_cutoff.is_some_and(|cutoff| now < cutoff) {
                    self.add_penalty(peer, 1);
                }
                self.add_backoff(peer, topic, false);
                prune_topics.push(topic.to_string());
                continue;
            }

            if score < 0.0 {
                debug!(peer = %peer.short(), topic = %topic, score, "GRAFT: ignoring peer with negative score");
                prune_topics.push(topic.to_string());
                do_px = false;
                self.add_backoff(peer, topic, false);
                continue;
            }

            if mesh_len >= self.config.mesh_n_high && !overlay.is_outbound(peer) {
                prune_topics.push(topic.to_string());
                self.add_backoff(peer, topic, false);
                continue;
            }

            debug!(peer = %peer.short(), topic = %topic, "GRAFT: add mesh link");
            overlay.tracer().graft(peer, topic);
            if let Some(peers) = self.mesh.get_mut(topic) {
                peers.insert(*peer);
            }
        }

        prune_topics
            .iter()
            .map(|topic| self.make_prune(overlay, peer, topic, do_px, false))
            .collect()
    }

    fn handle_prune(&mut self, overlay: &Overlay, peer: &PeerId, prunes: &[ControlPrune]) {
        let score = self.score_of(peer);
        for prune in prunes {
            let topic = prune.topic.as_str();
            let Some(peers) = self.mesh.get_mut(topic) else {
                continue;
            };

            debug!(peer = %peer.short(), topic = %topic, "PRUNE: remove mesh link");
            overlay.tracer().prune(peer, topic);
            peers.remove(peer);

            match prune.backoff {
                Some(secs) if secs > 0 => self.do_add_backoff(peer, topic, Duration::from_secs(secs)),
                _ => self.add_backoff(peer, topic, false),
            }

            if !prune.peers.is_empty() {
                if score < self.thresholds.accept_px_threshold {
                    debug!(peer = %peer.short(), score, "PRUNE: ignoring PX from peer below accept threshold");
                    continue;
                }
                self.px_connect(overlay, &prune.peers);
            }
        }
    }

    fn px_connect(&self, overlay: &Overlay, records: &[PeerInfo]) {
        let Some(tx) = &self.connect_tx else {
            return;
        };
        let mut records = records.to_vec();
        if records.len() > self.config.prune_peers {
            records.shuffle(&mut rand::thread_rng());
            records.truncate(self.config.prune_peers);
        }

        for record in records {
            let peer = record.peer_id;
            if peer == overlay.local_peer_id() || overlay.is_connected(&peer) {
                continue;
            }
            if tx.try_send(peer).is_err() {
                debug!(peer = %peer.short(), "ignoring peer connection attempt; too many pending connections");
            }
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn make_prune(&self, overlay: &Overlay, peer: &PeerId, topic: &str, do_px: bool, unsubscribe: bool) -> ControlPrune {
        let px_capable = overlay
            .protocol(peer)
            .is_some_and(|proto| supports(GossipSubFeature::Px, proto));
        if !px_capable {
            // v1.0 peers only understand the topic.
            return ControlPrune {
                topic: topic.to_string(),
                peers: Vec::new(),
                backoff: None,
            };
        }

        let backoff = if unsubscribe {
            self.config.unsubscribe_backoff
        } else {
            self.config.prune_backoff
        };

        let mut px = Vec::new();
        if do_px {
            px = get_peers(overlay, topic, self.config.prune_peers, |xp| {
                xp != peer && self.score_of(xp) >= 0.0
            })
            .into_iter()
            .map(|peer_id| PeerInfo {
                peer_id,
                signed_peer_record: None,
            })
            .collect();
        }

        ControlPrune {
            topic: topic.to_string(),
            peers: px,
            backoff: Some(backoff.as_secs()),
        }
    }

    fn send_graft(&mut self, overlay: &Overlay, peer: &PeerId, topic: &str) {
        let rpc = Rpc::with_control(ControlMessage {
            graft: vec![ControlGraft {
                topic: topic.to_string(),
            }],
            ..ControlMessage::default()
        });
        self.send_rpc(overlay, peer, rpc);
    }

    fn send_prune(&mut self, overlay: &Overlay, peer: &PeerId, topic: &str, unsubscribe: bool) {
        let prune = self.make_prune(overlay, peer, topic, self.config.do_px && !unsubscribe, unsubscribe);
        let rpc = Rpc::with_control(ControlMessage {
            prune: vec![prune],
            ..ControlMessage::default()
        });
        self.send_rpc(overlay, peer, rpc);
    }

    /// Attach pending control and gossip, then queue (fragmenting if needed).
    fn send_rpc(&mut self, overlay: &Overlay, peer: &PeerId, mut rpc: Rpc) {
        if let Some(ctl) = self.control.remove(peer) {
            self.piggyback_control(peer, &mut rpc, ctl);
        }
        if let Some(ihave) = self.gossip.remove(peer) {
            rpc.control.get_or_insert_with(ControlMessage::default).ihave.extend(ihave);
        }

        if !overlay.is_connected(peer) {
            return;
        }

        let limit = overlay.max_message_size();
        if rpc.encoded_len() < limit {
            self.do_send_rpc(overlay, peer, rpc);
            return;
        }

        let traced = rpc.clone();
        match fragment_rpc(rpc, limit) {
            Ok(fragments) => {
                trace!(peer = %peer.short(), fragments = fragments.len(), "fragmented oversized rpc");
                for fragment in fragments {
                    self.do_send_rpc(overlay, peer, fragment);
                }
            }
            Err(err) => {
                warn!(peer = %peer.short(), error = %err, "dropping rpc that cannot be fragmented");
                overlay.tracer().drop_rpc(peer, &traced);
            }
        }
    }

    fn do_send_rpc(&mut self, overlay: &Overlay, peer: &PeerId, rpc: Rpc) {
        let traced = rpc.clone();
        match overlay.try_send(peer, rpc) {
            Ok(()) => overlay.tracer().send_rpc(peer, &traced),
            Err(TrySendError::Full(rpc)) => {
                debug!(peer = %peer.short(), "dropping message to peer: queue full");
                overlay.tracer().drop_rpc(peer, &rpc);
                if let Some(ctl) = rpc.control {
                    self.push_control(peer, ctl);
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Keep the GRAFT/PRUNE part of a dropped control message for retry.
    fn push_control(&mut self, peer: &PeerId, mut ctl: ControlMessage) {
        ctl.ihave.clear();
        ctl.iwant.clear();
        if !ctl.graft.is_empty() || !ctl.prune.is_empty() {
            self.control.insert(*peer, ctl);
        }
    }

    fn piggyback_control(&self, peer: &PeerId, rpc: &mut Rpc, ctl: ControlMessage) {
        let in_mesh = |topic: &str| self.mesh.get(topic).is_some_and(|m| m.contains(peer));
        let grafts: Vec<ControlGraft> = ctl.graft.into_iter().filter(|g| in_mesh(&g.topic)).collect();
        let prunes: Vec<ControlPrune> = ctl.prune.into_iter().filter(|p| !in_mesh(&p.topic)).collect();
        if grafts.is_empty() && prunes.is_empty() {
            return;
        }
        let out = rpc.control.get_or_insert_with(ControlMessage::default);
        out.graft.extend(grafts);
        out.prune.extend(prunes);
    }

    fn enqueue_gossip(&mut self, peer: PeerId, ihave: ControlIHave) {
        self.gossip.entry(peer).or_default().push(ihave);
    }

    /// Advertise the gossip window of `topic` to eligible peers outside `exclude`.
    fn emit_gossip(&mut self, overlay: &Overlay, topic: &str, exclude: &HashSet<PeerId>, score: &impl Fn(&PeerId) -> f64) {
        let mut ids = self.mcache.get_gossip_ids(topic);
        if ids.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        ids.shuffle(&mut rng);

        let Some(tpeers) = overlay.topic_peers(topic) else {
            return;
        };
        let mut peers: Vec<PeerId> = tpeers
            .iter()
            .filter(|p| {
                !exclude.contains(p)
                    && !self.direct.contains(p)
                    && speaks_mesh(overlay, p)
                    && score(p) >= self.thresholds.gossip_threshold
            })
            .copied()
            .collect();

        let factor = (self.config.gossip_factor * peers.len() as f64) as usize;
        let target = self.config.gossip_lazy.max(factor).min(peers.len());
        peers.shuffle(&mut rng);
        peers.truncate(target);

        for peer in peers {
            let mut peer_ids = ids.clone();
            if peer_ids.len() > self.config.max_ihave_length {
                // Independent sample per peer so every id gets a chance.
                peer_ids.shuffle(&mut rng);
                peer_ids.truncate(self.config.max_ihave_length);
            }
            self.enqueue_gossip(
                peer,
                ControlIHave {
                    topic: topic.to_string(),
                    message_ids: peer_ids,
                },
            );
        }
    }

    fn send_graft_prune(&mut self, overlay: &Overlay, plan: HeartbeatPlan) {
        let HeartbeatPlan {
            tograft,
            mut toprune,
            no_px,
        } = plan;

        for (peer, topics) in tograft {
            let graft = topics.into_iter().map(|topic| ControlGraft { topic }).collect();
            let prune = toprune
                .remove(&peer)
                .unwrap_or_default()
                .iter()
                .map(|topic| self.make_prune(overlay, &peer, topic, self.config.do_px && !no_px.contains(&peer), false))
                .collect();
            let rpc = Rpc::with_control(ControlMessage {
                graft,
                prune,
                ..ControlMessage::default()
            });
            self.send_rpc(overlay, &peer, rpc);
        }

        for (peer, topics) in toprune {
            let prune = topics
                .iter()
                .map(|topic| self.make_prune(overlay, &peer, topic, self.config.do_px && !no_px.contains(&peer), false))
                .collect();
            let rpc = Rpc::with_control(ControlMessage {
                prune,
                ..ControlMessage::default()
            });
            self.send_rpc(overlay, &peer, rpc);
        }
    }

    /// Send pending gossip, then pending control retries.
    fn flush(&mut self, overlay: &Overlay) {
        let gossip: Vec<(PeerId, Vec<ControlIHave>)> = self.gossip.drain().collect();
        for (peer, ihave) in gossip {
            let rpc = Rpc::with_control(ControlMessage {
                ihave,
                ..ControlMessage::default()
            });
            self.send_rpc(overlay, &peer, rpc);
        }

        let control: Vec<(PeerId, ControlMessage)> = self.control.drain().collect();
        for (peer, ctl) in control {
            let rpc = Rpc::with_control(ControlMessage {
                graft: ctl.graft,
                prune: ctl.prune,
                ..ControlMessage::default()
            });
            self.send_rpc(overlay, &peer, rpc);
        }
    }

    // ========================================================================
    // Heartbeat Steps
    // ========================================================================

    fn apply_iwant_penalties(&self) {
        for (peer, count) in self.gossip_tracer.broken_promises() {
            debug!(peer = %peer.short(), count, "peer didn't follow up on IWANT requests; adding penalty");
            self.add_penalty(&peer, count);
        }
    }

    fn direct_connect(&self, overlay: &Overlay) {
        if self.heartbeat_ticks % self.config.direct_connect_ticks != 0 {
            return;
        }
        let Some(tx) = &self.connect_tx else {
            return;
        };
        for peer in &self.direct {
            if !overlay.is_connected(peer) && tx.try_send(*peer).is_err() {
                debug!(peer = %peer.short(), "direct peer reconnect deferred; connector queue full");
            }
        }
    }

    fn maintain_mesh(
        &mut self,
        overlay: &Overlay,
        topic: &str,
        peers: &mut HashSet<PeerId>,
        score: &impl Fn(&PeerId) -> f64,
        plan: &mut HeartbeatPlan,
    ) {
        let d = self.config.mesh_n;

        let negative: Vec<PeerId> = peers.iter().filter(|p| score(p) < 0.0).copied().collect();
        for peer in negative {
            debug!(peer = %peer.short(), topic = %topic, score = score(&peer), "HEARTBEAT: prune peer with negative score");
            plan.prune(overlay, topic, peer, peers);
            self.add_backoff(&peer, topic, false);
            plan.no_px.insert(peer);
        }

        if peers.len() < self.config.mesh_n_low {
            let backoff = self.backoff.get(topic);
            let candidates = get_peers(overlay, topic, d - peers.len(), |p| {
                !peers.contains(p)
                    && !self.direct.contains(p)
                    && !backoff.is_some_and(|b| b.contains_key(p))
                    && score(p) >= 0.0
            });
            for peer in candidates {
                plan.graft(overlay, topic, peer, peers);
            }
        }

        if peers.len() > self.config.mesh_n_high {
            let mut rng = rand::thread_rng();
            let mut ranked: Vec<PeerId> = peers.iter().copied().collect();
            ranked.shuffle(&mut rng);
            ranked.sort_by(|a, b| by_score_desc(score(a), score(b)));
            let keep_best = self.config.mesh_d_score.min(ranked.len());
            ranked[keep_best..].shuffle(&mut rng);

            let mut outbound = ranked[..d].iter().filter(|p| overlay.is_outbound(p)).count();
            if outbound < self.config.mesh_outbound_min {
                // Move outbound peers in the keep window to the front so the
                // inbound ones absorb the displacement.
                if outbound > 0 {
                    let mut have = outbound;
                    let mut i = 1;
                    while i < d && have > 0 {
                        if overlay.is_outbound(&ranked[i]) {
                            ranked[..=i].rotate_right(1);
                            have -= 1;
                        }
                        i += 1;
                    }
                }
                let mut need = self.config.mesh_outbound_min - outbound;
                let mut i = d;
                while i < ranked.len() && need > 0 {
                    if overlay.is_outbound(&ranked[i]) {
                        ranked[..=i].rotate_right(1);
                        need -= 1;
                        outbound += 1;
                    }
                    i += 1;
                }
            }
            trace!(topic = %topic, outbound, "HEARTBEAT: trimming oversubscribed mesh");

            for peer in ranked.drain(d..) {
                plan.prune(overlay, topic, peer, peers);
                self.add_backoff(&peer, topic, false);
            }
        }

        if peers.len() >= self.config.mesh_n_low {
            let outbound = peers.iter().filter(|p| overlay.is_outbound(p)).count();
            if outbound < self.config.mesh_outbound_min {
                let backoff = self.backoff.get(topic);
                let candidates = get_peers(overlay, topic, self.config.mesh_outbound_min - outbound, |p| {
                    !peers.contains(p)
                        && !self.direct.contains(p)
                        && !backoff.is_some_and(|b| b.contains_key(p))
                        && overlay.is_outbound(p)
                        && score(p) >= 0.0
                });
                for peer in candidates {
                    plan.graft(overlay, topic, peer, peers);
                }
            }
        }

        if self.heartbeat_ticks % self.config.opportunistic_graft_ticks == 0 && peers.len() > 1 {
            self.opportunistic_graft(overlay, topic, peers, score, plan);
        }
    }

    /// Graft peers scoring above the mesh median when the median is weak.
    ///
    /// The mesh is ranked by `(score, peer id)` and the median taken at
    /// `len / 2`; candidates are ordered by score descending, then peer id.
    fn opportunistic_graft(
        &self,
        overlay: &Overlay,
        topic: &str,
        peers: &mut HashSet<PeerId>,
        score: &impl Fn(&PeerId) -> f64,
        plan: &mut HeartbeatPlan,
    ) {
        let mut ranked: Vec<(f64, PeerId)> = peers.iter().map(|p| (score(p), *p)).collect();
        ranked.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        let median = ranked[ranked.len() / 2].0;
        if median >= self.thresholds.opportunistic_graft_threshold {
            return;
        }

        let backoff = self.backoff.get(topic);
        let mut candidates = get_peers(overlay, topic, 0, |p| {
            !peers.contains(p)
                && !self.direct.contains(p)
                && !backoff.is_some_and(|b| b.contains_key(p))
                && score(p) > median
        });
        candidates.sort_by(|a, b| by_score_desc(score(a), score(b)).then_with(|| a.cmp(b)));
        candidates.truncate(self.config.opportunistic_graft_peers);

        for peer in candidates {
            debug!(peer = %peer.short(), topic = %topic, median, "HEARTBEAT: opportunistically graft peer");
            plan.graft(overlay, topic, peer, peers);
        }
    }

    fn maintain_fanout(&mut self, overlay: &Overlay, score: &impl Fn(&PeerId) -> f64) {
        let now = Instant::now();
        let ttl = self.config.fanout_ttl;
        let expired: Vec<String> = self
            .lastpub
            .iter()
            .filter(|(_, last)| **last + ttl < now)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in expired {
            trace!(topic = %topic, "HEARTBEAT: fanout expired");
            self.fanout.remove(&topic);
            self.lastpub.remove(&topic);
        }

        let topics: Vec<String> = self.fanout.keys().cloned().collect();
        for topic in topics {
            let Some(mut peers) = self.fanout.remove(&topic) else {
                continue;
            };
            let publish_threshold = self.thresholds.publish_threshold;
            peers.retain(|p| overlay.in_topic(&topic, p) && score(p) >= publish_threshold);

            if peers.len() < self.config.mesh_n {
                let more = get_peers(overlay, &topic, self.config.mesh_n - peers.len(), |p| {
                    !peers.contains(p) && !self.direct.contains(p) && score(p) >= publish_threshold
                });
                peers.extend(more);
            }

            let exclude = peers.clone();
            self.fanout.insert(topic.clone(), peers);
            self.emit_gossip(overlay, &topic, &exclude, score);
        }
    }
}

impl std::fmt::Debug for GossipSubRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipSubRouter")
            .field("mesh_topics", &self.mesh.len())
            .field("fanout_topics", &self.fanout.len())
            .field("direct", &self.direct.len())
            .field("cached_messages", &self.mcache.len())
            .field("heartbeat_ticks", &self.heartbeat_ticks)
            .field("scoring", &self.score.is_some())
            .field("gater", &self.gater.is_some())
            .finish()
    }
}

// ============================================================================
// Connectors
// ============================================================================

async fn connector(
    host: Arc<dyn Host>,
    queue: Arc<AsyncMutex<mpsc::Receiver<PeerId>>>,
    connected: Arc<RwLock<HashSet<PeerId>>>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = async { queue.lock().await.recv().await } => next,
        };
        let Some(peer) = next else { break };
        if connected.read().contains(&peer) {
            continue;
        }

        debug!(peer = %peer.short(), "connecting to peer");
        match tokio::time::timeout(timeout, host.connect(&peer)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(peer = %peer.short(), error = %err, "error connecting to peer"),
            Err(_) => debug!(peer = %peer.short(), "connection attempt timed out"),
        }
    }
    trace!("connector quitting");
}

// ============================================================================
// PubSubRouter
// ============================================================================

impl PubSubRouter for GossipSubRouter {
    fn protocols(&self) -> Vec<ProtocolId> {
        vec![
            GOSSIPSUB_V11_PROTOCOL.to_string(),
            GOSSIPSUB_V10_PROTOCOL.to_string(),
            FLOODSUB_PROTOCOL.to_string(),
        ]
    }

    fn attach(&mut self, ctx: RouterContext) -> anyhow::Result<Vec<Arc<dyn RawTracer>>> {
        if let Some(score) = &self.score {
            score.spawn_background(ctx.cancel.child_token(), self.score_inspect.clone());
        }
        if let Some(gater) = &self.gater {
            gater.spawn_background(ctx.cancel.child_token());
        }

        let (tx, rx) = mpsc::channel(self.config.max_pending_connections);
        let rx = Arc::new(AsyncMutex::new(rx));
        for _ in 0..self.config.connectors {
            tokio::spawn(connector(
                Arc::clone(&ctx.host),
                Arc::clone(&rx),
                Arc::clone(&self.connected),
                self.config.connection_timeout,
                ctx.cancel.child_token(),
            ));
        }

        if !self.direct.is_empty() {
            let direct: Vec<PeerId> = self.direct.iter().copied().collect();
            let delay = self.config.direct_connect_initial_delay;
            let tx = tx.clone();
            let cancel = ctx.cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                for peer in direct {
                    if tx.send(peer).await.is_err() {
                        break;
                    }
                }
            });
        }
        self.connect_tx = Some(tx);

        debug!(local = %ctx.local.short(), "gossipsub router attached");
        Ok(self.tracers())
    }

    fn add_peer(&mut self, _overlay: &Overlay, conn: &PeerConnection) {
        debug!(peer = %conn.peer.short(), protocol = %conn.protocol, outbound = conn.outbound, "PEERUP");
        self.connected.write().insert(conn.peer);
    }

    fn remove_peer(&mut self, _overlay: &Overlay, peer: &PeerId) {
        debug!(peer = %peer.short(), "PEERDOWN");
        self.connected.write().remove(peer);
        for peers in self.mesh.values_mut() {
            peers.remove(peer);
        }
        for peers in self.fanout.values_mut() {
            peers.remove(peer);
        }
        self.gossip.remove(peer);
        self.control.remove(peer);
    }

    fn enough_peers(&self, overlay: &Overlay, topic: &str, suggested: usize) -> bool {
        let Some(tpeers) = overlay.topic_peers(topic) else {
            return false;
        };
        let fs_peers = tpeers.iter().filter(|p| !speaks_mesh(overlay, p)).count();
        let gs_peers = self.mesh.get(topic).map_or(0, HashSet::len);
        let suggested = if suggested == 0 {
            self.config.mesh_n_low
        } else {
            suggested
        };
        fs_peers + gs_peers >= suggested || gs_peers >= self.config.mesh_n_high
    }

    fn accept_from(&self, peer: &PeerId) -> AcceptStatus {
        if self.direct.contains(peer) {
            return AcceptStatus::All;
        }
        let score = self.score_of(peer);
        if score < self.thresholds.graylist_threshold {
            debug!(peer = %peer.short(), score, "graylisted peer; dropping rpc");
            return AcceptStatus::None;
        }
        self.gater.as_ref().map_or(AcceptStatus::All, |g| g.accept_from(peer))
    }

    fn handle_rpc(&mut self, overlay: &Overlay, from: &PeerId, rpc: &Rpc) {
        let Some(ctl) = &rpc.control else {
            return;
        };

        let iwant = self.handle_ihave(overlay, from, &ctl.ihave);
        let ihave = self.handle_iwant(overlay, from, &ctl.iwant);
        let prune = self.handle_graft(overlay, from, &ctl.graft);
        self.handle_prune(overlay, from, &ctl.prune);

        if iwant.is_empty() && ihave.is_empty() && prune.is_empty() {
            return;
        }

        let mut out = Rpc::with_messages(ihave);
        if !iwant.is_empty() || !prune.is_empty() {
            out.control = Some(ControlMessage {
                iwant,
                prune,
                ..ControlMessage::default()
            });
        }
        self.send_rpc(overlay, from, out);
    }

    fn publish(&mut self, overlay: &Overlay, msg: &Arc<ReceivedMessage>) {
        self.mcache.put(Arc::clone(msg));

        let from = msg.received_from;
        let topic = msg.topic();
        let Some(tpeers) = overlay.topic_peers(topic) else {
            return;
        };
        let publish_threshold = self.thresholds.publish_threshold;

        let mut tosend: HashSet<PeerId> = HashSet::new();
        if self.config.flood_publish && from == overlay.local_peer_id() {
            tosend.extend(
                tpeers
                    .iter()
                    .filter(|p| self.direct.contains(p) || self.score_of(p) >= publish_threshold),
            );
        } else {
            tosend.extend(tpeers.iter().filter(|p| self.direct.contains(p)));
            tosend.extend(
                tpeers
                    .iter()
                    .filter(|p| !speaks_mesh(overlay, p) && self.score_of(p) >= publish_threshold),
            );

            match self.mesh.get(topic) {
                Some(mesh) => tosend.extend(mesh.iter()),
                None => {
                    let existing = self.fanout.get(topic).filter(|f| !f.is_empty()).cloned();
                    let fanout = match existing {
                        Some(fanout) => fanout,
                        None => {
                            let peers: HashSet<PeerId> = get_peers(overlay, topic, self.config.mesh_n, |p| {
                                !self.direct.contains(p) && self.score_of(p) >= publish_threshold
                            })
                            .into_iter()
                            .collect();
                            if !peers.is_empty() {
                                self.fanout.insert(topic.to_string(), peers.clone());
                            }
                            peers
                        }
                    };
                    tosend.extend(fanout);
                    self.lastpub.insert(topic.to_string(), Instant::now());
                }
            }
        }

        let author = msg.author();
        let rpc = Rpc::with_messages(vec![msg.message.clone()]);
        for peer in tosend {
            if peer == from || Some(peer) == author {
                continue;
            }
            self.send_rpc(overlay, &peer, rpc.clone());
        }
    }

    fn join(&mut self, overlay: &Overlay, topic: &str) {
        if self.mesh.contains_key(topic) {
            return;
        }
        debug!(topic = %topic, "JOIN");
        overlay.tracer().join(topic);

        let backed_off = |p: &PeerId| self.backoff.get(topic).is_some_and(|b| b.contains_key(p));
        let peers: HashSet<PeerId> = match self.fanout.get(topic) {
            Some(fanout) => {
                let mut peers: HashSet<PeerId> = fanout
                    .iter()
                    .filter(|p| !backed_off(p) && self.score_of(p) >= 0.0)
                    .copied()
                    .collect();
                if peers.len() < self.config.mesh_n {
                    let more = get_peers(overlay, topic, self.config.mesh_n - peers.len(), |p| {
                        !peers.contains(p) && !self.direct.contains(p) && !backed_off(p) && self.score_of(p) >= 0.0
                    });
                    peers.extend(more);
                }
                peers
            }
            None => get_peers(overlay, topic, self.config.mesh_n, |p| {
                !self.direct.contains(p) && !backed_off(p) && self.score_of(p) >= 0.0
            })
            .into_iter()
            .collect(),
        };
        self.fanout.remove(topic);
        self.lastpub.remove(topic);
        self.mesh.insert(topic.to_string(), peers.clone());

        for peer in peers {
            debug!(peer = %peer.short(), topic = %topic, "JOIN: add mesh link");
            overlay.tracer().graft(&peer, topic);
            self.send_graft(overlay, &peer, topic);
        }
    }

    fn leave(&mut self, overlay: &Overlay, topic: &str) {
        let Some(peers) = self.mesh.remove(topic) else {
            return;
        };
        debug!(topic = %topic, "LEAVE");
        overlay.tracer().leave(topic);

        for peer in peers {
            debug!(peer = %peer.short(), topic = %topic, "LEAVE: remove mesh link");
            overlay.tracer().prune(&peer, topic);
            self.send_prune(overlay, &peer, topic, true);
            self.add_backoff(&peer, topic, true);
        }
    }

    fn heartbeat_schedule(&self) -> Option<(Duration, Duration)> {
        Some((self.config.heartbeat_initial_delay, self.config.heartbeat_interval))
    }

    fn heartbeat(&mut self, overlay: &Overlay) {
        let start = Instant::now();
        self.heartbeat_ticks += 1;

        self.clear_backoff();
        self.peerhave.clear();
        self.iasked.clear();
        self.apply_iwant_penalties();
        self.direct_connect(overlay);

        // Scores are read once per heartbeat.
        let scores: HashMap<PeerId, f64> = overlay.peers().map(|p| (*p, self.score_of(p))).collect();
        let score = |p: &PeerId| scores.get(p).copied().unwrap_or(0.0);

        let mut plan = HeartbeatPlan::default();
        let topics: Vec<String> = self.mesh.keys().cloned().collect();
        for topic in topics {
            let Some(mut peers) = self.mesh.remove(&topic) else {
                continue;
            };
            self.maintain_mesh(overlay, &topic, &mut peers, &score, &mut plan);
            let exclude = peers.clone();
            self.mesh.insert(topic.clone(), peers);
            self.emit_gossip(overlay, &topic, &exclude, &score);
        }

        self.maintain_fanout(overlay, &score);

        self.send_graft_prune(overlay, plan);
        self.flush(overlay);
        self.mcache.shift();

        let elapsed = start.elapsed();
        let budget = self.config.heartbeat_interval.mul_f64(self.config.slow_heartbeat_warning);
        if elapsed > budget {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "slow heartbeat");
        }
    }

    fn set_topic_score_params(&mut self, topic: &str, params: TopicScoreParams) -> anyhow::Result<()> {
        match &self.score {
            Some(score) => score.set_topic_score_params(topic, params),
            None => bail!("peer scoring is not enabled"),
        }
    }

    fn peer_scores(&self) -> HashMap<PeerId, PeerScoreSnapshot> {
        self.score.as_ref().map(|s| s.snapshot()).unwrap_or_default()
    }

    fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.mesh.get(topic).into_iter().flatten().copied().collect();
        peers.sort();
        peers
    }
}
