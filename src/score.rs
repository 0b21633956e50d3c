//! # Peer Scoring Engine
//!
//! Decaying per-peer and per-topic counters that produce one scalar score on
//! demand (see [`crate::score_params`] for the component table).
//!
//! ## Inputs
//!
//! The engine is a [`RawTracer`]: it learns about peers, mesh membership and
//! message outcomes from trace events, and the router adds behavioural
//! penalties directly via [`PeerScore::add_penalty`].
//!
//! ## Delivery Records
//!
//! Each message id gets a record on first validation:
//!
//! | Status | Set when | Duplicates from other peers |
//! |--------|----------|-----------------------------|
//! | unknown | validation started | remembered for later |
//! | valid | delivered | count as mesh deliveries inside the window |
//! | invalid | rejected by validation | penalized as invalid |
//! | ignored / throttled | ignored or throttled | not counted |
//!
//! Status moves forward only; records expire after `seen_msg_ttl` and are
//! garbage-collected once a minute.
//!
//! ## Retention
//!
//! SECURITY: a disconnecting peer with a positive score is forgotten; a
//! non-positive score is retained for `retain_score` so a misbehaving peer
//! cannot launder its score by reconnecting.
//!
//! ## Locking
//!
//! All state sits behind one `parking_lot::Mutex`, so operations touching
//! several peer records take a single lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::identity::PeerId;
use crate::messages::{MessageId, ReceivedMessage};
use crate::protocols::PeerConnection;
use crate::score_params::{PeerScoreParams, TopicScoreParams};
use crate::trace::RawTracer;
use crate::validation::RejectReason;

/// Interval between delivery-record garbage collections.
pub const DELIVERY_RECORD_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Callback receiving periodic score snapshots.
pub type ScoreInspectFn = Arc<dyn Fn(HashMap<PeerId, PeerScoreSnapshot>) + Send + Sync>;

// ============================================================================
// Per-peer State
// ============================================================================

#[derive(Clone, Debug, Default)]
struct TopicStats {
    in_mesh: bool,
    graft_time: Option<Instant>,
    mesh_time: Duration,
    /// P2
    first_message_deliveries: f64,
    /// P3
    mesh_message_deliveries: f64,
    mesh_message_deliveries_active: bool,
    /// P3b
    mesh_failure_penalty: f64,
    /// P4
    invalid_message_deliveries: f64,
}

impl TopicStats {
    /// This topic's contribution to the peer score, before the topic weight.
    fn calculate(&self, params: &TopicScoreParams) -> f64 {
        let mut score = 0.0;

        // P1: time in mesh
        if self.in_mesh {
            let quanta = (self.mesh_time.as_secs_f64() / params.time_in_mesh_quantum.as_secs_f64()).floor();
            score += quanta.min(params.time_in_mesh_cap) * params.time_in_mesh_weight;
        }

        // P2: first message deliveries (capped on increment)
        score += self.first_message_deliveries * params.first_message_deliveries_weight;

        // P3: mesh message delivery deficit
        if self.mesh_message_deliveries_active
            && self.mesh_message_deliveries < params.mesh_message_deliveries_threshold
        {
            let deficit = params.mesh_message_deliveries_threshold - self.mesh_message_deliveries;
            score += deficit * deficit * params.mesh_message_deliveries_weight;
        }

        // P3b: sticky mesh failure penalty
        score += self.mesh_failure_penalty * params.mesh_failure_penalty_weight;

        // P4: invalid messages
        score += self.invalid_message_deliveries
            * self.invalid_message_deliveries
            * params.invalid_message_deliveries_weight;

        score
    }

    fn decay(&mut self, params: &TopicScoreParams, decay_to_zero: f64, now: Instant) {
        self.first_message_deliveries =
            decay_counter(self.first_message_deliveries, params.first_message_deliveries_decay, decay_to_zero);
        self.mesh_message_deliveries =
            decay_counter(self.mesh_message_deliveries, params.mesh_message_deliveries_decay, decay_to_zero);
        self.mesh_failure_penalty =
            decay_counter(self.mesh_failure_penalty, params.mesh_failure_penalty_decay, decay_to_zero);
        self.invalid_message_deliveries = decay_counter(
            self.invalid_message_deliveries,
            params.invalid_message_deliveries_decay,
            decay_to_zero,
        );

        if self.in_mesh
            && let Some(graft_time) = self.graft_time
        {
            self.mesh_time = now.saturating_duration_since(graft_time);
            if self.mesh_time > params.mesh_message_deliveries_activation {
                self.mesh_message_deliveries_active = true;
            }
        }
    }

    /// Sticky P3b penalty applied when a peer leaves the mesh under-delivering.
    fn apply_mesh_failure(&mut self, params: &TopicScoreParams) {
        if self.mesh_message_deliveries_active
            && self.mesh_message_deliveries < params.mesh_message_deliveries_threshold
        {
            let deficit = params.mesh_message_deliveries_threshold - self.mesh_message_deliveries;
            self.mesh_failure_penalty += deficit * deficit;
        }
    }
}

fn decay_counter(value: f64, decay: f64, decay_to_zero: f64) -> f64 {
    let decayed = value * decay;
    if decayed < decay_to_zero { 0.0 } else { decayed }
}

#[derive(Clone, Debug)]
struct PeerStats {
    connected: bool,
    expire: Option<Instant>,
    topics: HashMap<String, TopicStats>,
    ips: Vec<IpAddr>,
    ip_whitelist: HashMap<IpAddr, bool>,
    /// P7
    behaviour_penalty: f64,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            connected: true,
            expire: None,
            topics: HashMap::new(),
            ips: Vec::new(),
            ip_whitelist: HashMap::new(),
            behaviour_penalty: 0.0,
        }
    }

    /// Stats for `topic`, created on demand for scored topics only.
    fn topic_stats(&mut self, topic: &str, params: &PeerScoreParams) -> Option<&mut TopicStats> {
        if !self.topics.contains_key(topic) && !params.topics.contains_key(topic) {
            return None;
        }
        Some(self.topics.entry(topic.to_string()).or_default())
    }
}

// ============================================================================
// Delivery Records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeliveryStatus {
    Unknown,
    Valid,
    Invalid,
    Ignored,
    Throttled,
}

#[derive(Debug)]
struct DeliveryRecord {
    status: DeliveryStatus,
    first_seen: Instant,
    validated: Option<Instant>,
    peers: HashSet<PeerId>,
}

#[derive(Debug, Default)]
struct MessageDeliveries {
    records: HashMap<MessageId, DeliveryRecord>,
    queue: VecDeque<(MessageId, Instant)>,
}

impl MessageDeliveries {
    fn record(&mut self, id: &MessageId, ttl: Duration) -> &mut DeliveryRecord {
        let queue = &mut self.queue;
        self.records.entry(id.clone()).or_insert_with(|| {
            let now = Instant::now();
            queue.push_back((id.clone(), now + ttl));
            DeliveryRecord {
                status: DeliveryStatus::Unknown,
                first_seen: now,
                validated: None,
                peers: HashSet::new(),
            }
        })
    }

    fn gc(&mut self, now: Instant) {
        while let Some((_, expire)) = self.queue.front() {
            if *expire > now {
                break;
            }
            if let Some((id, _)) = self.queue.pop_front() {
                self.records.remove(&id);
            }
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TopicScoreSnapshot {
    pub in_mesh: bool,
    pub time_in_mesh: Duration,
    pub first_message_deliveries: f64,
    pub mesh_message_deliveries: f64,
    pub mesh_failure_penalty: f64,
    pub invalid_message_deliveries: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerScoreSnapshot {
    pub score: f64,
    pub connected: bool,
    pub topics: HashMap<String, TopicScoreSnapshot>,
    pub app_specific_score: f64,
    pub ip_colocation_factor: f64,
    pub behaviour_penalty: f64,
    pub ips: Vec<IpAddr>,
}

// ============================================================================
// Engine
// ============================================================================

struct ScoreState {
    params: PeerScoreParams,
    peer_stats: HashMap<PeerId, PeerStats>,
    peer_ips: HashMap<IpAddr, HashSet<PeerId>>,
    deliveries: MessageDeliveries,
}

pub struct PeerScore {
    state: Mutex<ScoreState>,
}

impl PeerScore {
    pub fn new(params: PeerScoreParams) -> anyhow::Result<Arc<Self>> {
        params.validate()?;
        Ok(Arc::new(Self {
            state: Mutex::new(ScoreState {
                params,
                peer_stats: HashMap::new(),
                peer_ips: HashMap::new(),
                deliveries: MessageDeliveries::default(),
            }),
        }))
    }

    pub fn score(&self, peer: &PeerId) -> f64 {
        self.state.lock().score(peer)
    }

    /// Add `count` to the peer's behavioural penalty (P7).
    pub fn add_penalty(&self, peer: &PeerId, count: usize) {
        let mut state = self.state.lock();
        if let Some(stats) = state.peer_stats.get_mut(peer) {
            stats.behaviour_penalty += count as f64;
        }
    }

    /// Install or replace a topic's parameters, clamping existing counters to new caps.
    pub fn set_topic_score_params(&self, topic: &str, params: TopicScoreParams) -> anyhow::Result<()> {
        params.validate()?;
        let mut state = self.state.lock();
        let first_cap = params.first_message_deliveries_cap;
        let mesh_cap = params.mesh_message_deliveries_cap;
        let replaced = state.params.topics.insert(topic.to_string(), params).is_some();
        if !replaced {
            return Ok(());
        }
        for stats in state.peer_stats.values_mut() {
            if let Some(tstats) = stats.topics.get_mut(topic) {
                tstats.first_message_deliveries = tstats.first_message_deliveries.min(first_cap);
                tstats.mesh_message_deliveries = tstats.mesh_message_deliveries.min(mesh_cap);
            }
        }
        Ok(())
    }

    pub fn topic_score_params(&self, topic: &str) -> Option<TopicScoreParams> {
        self.state.lock().params.topics.get(topic).cloned()
    }

    /// Decay counters, refresh time-in-mesh and expire retained disconnected peers.
    pub fn refresh_scores(&self) {
        self.state.lock().refresh_scores(Instant::now());
    }

    pub fn gc_delivery_records(&self) {
        self.state.lock().deliveries.gc(Instant::now());
    }

    pub fn snapshot(&self) -> HashMap<PeerId, PeerScoreSnapshot> {
        let state = self.state.lock();
        state
            .peer_stats
            .keys()
            .map(|peer| (*peer, state.snapshot(peer)))
            .collect()
    }

    pub fn decay_interval(&self) -> Duration {
        self.state.lock().params.decay_interval
    }

    /// Run decay, delivery-record GC and optional inspection until cancelled.
    pub fn spawn_background(
        self: &Arc<Self>,
        cancel: CancellationToken,
        inspect: Option<(ScoreInspectFn, Duration)>,
    ) -> tokio::task::JoinHandle<()> {
        let score = Arc::clone(self);
        let decay_interval = self.decay_interval();
        tokio::spawn(async move {
            let mut refresh = tokio::time::interval(decay_interval);
            refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut gc = tokio::time::interval(DELIVERY_RECORD_GC_INTERVAL);
            gc.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let (inspect_fn, inspect_period) = match inspect {
                Some((f, period)) => (Some(f), period.max(Duration::from_millis(1))),
                None => (None, Duration::from_secs(3600)),
            };
            let mut inspect_tick = tokio::time::interval(inspect_period);
            inspect_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Some(f) = &inspect_fn {
                            f(score.snapshot());
                        }
                        debug!("score background task quitting");
                        break;
                    }
                    _ = refresh.tick() => score.refresh_scores(),
                    _ = gc.tick() => score.gc_delivery_records(),
                    _ = inspect_tick.tick(), if inspect_fn.is_some() => {
                        if let Some(f) = &inspect_fn {
                            f(score.snapshot());
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for PeerScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PeerScore")
            .field("peers", &state.peer_stats.len())
            .field("delivery_records", &state.deliveries.records.len())
            .finish()
    }
}

impl ScoreState {
    fn score(&self, peer: &PeerId) -> f64 {
        let Some(stats) = self.peer_stats.get(peer) else {
            return 0.0;
        };

        let mut score = 0.0;
        for (topic, tstats) in &stats.topics {
            if let Some(params) = self.params.topics.get(topic) {
                score += tstats.calculate(params) * params.topic_weight;
            }
        }

        if self.params.topic_score_cap > 0.0 && score > self.params.topic_score_cap {
            score = self.params.topic_score_cap;
        }

        // P5
        score += (self.params.app_specific_score)(peer) * self.params.app_specific_weight;

        // P6
        score += self.ip_colocation_factor(stats) * self.params.ip_colocation_factor_weight;

        // P7
        if stats.behaviour_penalty > self.params.behaviour_penalty_threshold {
            let excess = stats.behaviour_penalty - self.params.behaviour_penalty_threshold;
            score += excess * excess * self.params.behaviour_penalty_weight;
        }

        score
    }

    fn ip_colocation_factor(&self, stats: &PeerStats) -> f64 {
        let mut result = 0.0;
        for ip in &stats.ips {
            let whitelisted = stats
                .ip_whitelist
                .get(ip)
                .copied()
                .unwrap_or_else(|| self.params.is_whitelisted(ip));
            if whitelisted {
                continue;
            }
            let peers_in_ip = self.peer_ips.get(ip).map_or(0, HashSet::len) as f64;
            if peers_in_ip > self.params.ip_colocation_factor_threshold {
                let surplus = peers_in_ip - self.params.ip_colocation_factor_threshold;
                result += surplus * surplus;
            }
        }
        result
    }

    fn snapshot(&self, peer: &PeerId) -> PeerScoreSnapshot {
        let Some(stats) = self.peer_stats.get(peer) else {
            return PeerScoreSnapshot::default();
        };
        PeerScoreSnapshot {
            score: self.score(peer),
            connected: stats.connected,
            topics: stats
                .topics
                .iter()
                .map(|(topic, t)| {
                    (
                        topic.clone(),
                        TopicScoreSnapshot {
                            in_mesh: t.in_mesh,
                            time_in_mesh: t.mesh_time,
                            first_message_deliveries: t.first_message_deliveries,
                            mesh_message_deliveries: t.mesh_message_deliveries,
                            mesh_failure_penalty: t.mesh_failure_penalty,
                            invalid_message_deliveries: t.invalid_message_deliveries,
                        },
                    )
                })
                .collect(),
            app_specific_score: (self.params.app_specific_score)(peer),
            ip_colocation_factor: self.ip_colocation_factor(stats),
            behaviour_penalty: stats.behaviour_penalty,
            ips: stats.ips.clone(),
        }
    }

    fn refresh_scores(&mut self, now: Instant) {
        let decay_to_zero = self.params.decay_to_zero;
        let mut expired = Vec::new();

        for (peer, stats) in self.peer_stats.iter_mut() {
            if !stats.connected {
                // Retained scores are not decayed.
                if stats.expire.is_some_and(|expire| now > expire) {
                    expired.push(*peer);
                }
                continue;
            }
            for (topic, tstats) in stats.topics.iter_mut() {
                if let Some(params) = self.params.topics.get(topic) {
                    tstats.decay(params, decay_to_zero, now);
                }
            }
            stats.behaviour_penalty =
                decay_counter(stats.behaviour_penalty, self.params.behaviour_penalty_decay, decay_to_zero);
        }

        for peer in expired {
            if let Some(stats) = self.peer_stats.remove(&peer) {
                self.remove_ips(&peer, &stats.ips);
            }
        }
    }

    fn set_ips(&mut self, peer: &PeerId, new_ips: &[IpAddr], old_ips: &[IpAddr]) {
        for ip in new_ips {
            self.peer_ips.entry(*ip).or_default().insert(*peer);
        }
        for ip in old_ips.iter().filter(|ip| !new_ips.contains(ip)) {
            self.remove_ip(peer, ip);
        }
    }

    fn remove_ips(&mut self, peer: &PeerId, ips: &[IpAddr]) {
        for ip in ips {
            self.remove_ip(peer, ip);
        }
    }

    fn remove_ip(&mut self, peer: &PeerId, ip: &IpAddr) {
        if let Some(peers) = self.peer_ips.get_mut(ip) {
            peers.remove(peer);
            if peers.is_empty() {
                self.peer_ips.remove(ip);
            }
        }
    }

    fn mark_invalid_message_delivery(&mut self, peer: &PeerId, topic: &str) {
        let params = &self.params;
        if let Some(stats) = self.peer_stats.get_mut(peer)
            && let Some(tstats) = stats.topic_stats(topic, params)
        {
            tstats.invalid_message_deliveries += 1.0;
        }
    }

    fn mark_first_message_delivery(&mut self, peer: &PeerId, topic: &str) {
        let params = &self.params;
        let Some(topic_params) = params.topics.get(topic) else {
            return;
        };
        if let Some(stats) = self.peer_stats.get_mut(peer)
            && let Some(tstats) = stats.topic_stats(topic, params)
        {
            tstats.first_message_deliveries =
                (tstats.first_message_deliveries + 1.0).min(topic_params.first_message_deliveries_cap);
            if tstats.in_mesh {
                tstats.mesh_message_deliveries =
                    (tstats.mesh_message_deliveries + 1.0).min(topic_params.mesh_message_deliveries_cap);
            }
        }
    }

    /// Credit a near-first duplicate from a mesh peer. `validated` is `None`
    /// when the duplicate arrived before validation finished.
    fn mark_duplicate_message_delivery(&mut self, peer: &PeerId, topic: &str, validated: Option<Instant>) {
        let params = &self.params;
        let Some(topic_params) = params.topics.get(topic) else {
            return;
        };
        let Some(stats) = self.peer_stats.get_mut(peer) else {
            return;
        };
        let Some(tstats) = stats.topic_stats(topic, params) else {
            return;
        };
        if !tstats.in_mesh {
            return;
        }
        if let Some(validated) = validated
            && validated.elapsed() > topic_params.mesh_message_deliveries_window
        {
            return;
        }
        tstats.mesh_message_deliveries =
            (tstats.mesh_message_deliveries + 1.0).min(topic_params.mesh_message_deliveries_cap);
    }
}

impl RawTracer for PeerScore {
    fn add_peer(&self, conn: &PeerConnection) {
        let mut state = self.state.lock();
        let ips = scored_ips(&conn.ips);
        let old_ips = {
            let stats = state
                .peer_stats
                .entry(conn.peer)
                .or_insert_with(PeerStats::new);
            stats.connected = true;
            stats.expire = None;
            std::mem::replace(&mut stats.ips, ips.clone())
        };
        state.set_ips(&conn.peer, &ips, &old_ips);
        let whitelist: HashMap<IpAddr, bool> = ips
            .iter()
            .map(|ip| (*ip, state.params.is_whitelisted(ip)))
            .collect();
        if let Some(stats) = state.peer_stats.get_mut(&conn.peer) {
            stats.ip_whitelist = whitelist;
        }
    }

    fn remove_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        if !state.peer_stats.contains_key(peer) {
            return;
        }

        if state.score(peer) > 0.0 {
            if let Some(stats) = state.peer_stats.remove(peer) {
                state.remove_ips(peer, &stats.ips);
            }
            return;
        }

        let retain = state.params.retain_score;
        let ScoreState {
            params, peer_stats, ..
        } = &mut *state;
        if let Some(stats) = peer_stats.get_mut(peer) {
            for (topic, tstats) in stats.topics.iter_mut() {
                tstats.first_message_deliveries = 0.0;
                if tstats.in_mesh
                    && let Some(topic_params) = params.topics.get(topic)
                {
                    tstats.apply_mesh_failure(topic_params);
                }
                tstats.in_mesh = false;
            }
            stats.connected = false;
            stats.expire = Some(Instant::now() + retain);
        }
    }

    fn graft(&self, peer: &PeerId, topic: &str) {
        let mut state = self.state.lock();
        let ScoreState {
            params, peer_stats, ..
        } = &mut *state;
        if let Some(stats) = peer_stats.get_mut(peer)
            && let Some(tstats) = stats.topic_stats(topic, params)
        {
            tstats.in_mesh = true;
            tstats.graft_time = Some(Instant::now());
            tstats.mesh_time = Duration::ZERO;
            tstats.mesh_message_deliveries_active = false;
        }
    }

    fn prune(&self, peer: &PeerId, topic: &str) {
        let mut state = self.state.lock();
        let ScoreState {
            params, peer_stats, ..
        } = &mut *state;
        let Some(topic_params) = params.topics.get(topic).cloned() else {
            return;
        };
        if let Some(stats) = peer_stats.get_mut(peer)
            && let Some(tstats) = stats.topic_stats(topic, params)
        {
            tstats.apply_mesh_failure(&topic_params);
            tstats.in_mesh = false;
        }
    }

    fn validate_message(&self, msg: &ReceivedMessage) {
        let mut state = self.state.lock();
        let ttl = state.params.seen_msg_ttl;
        state.deliveries.record(&msg.id, ttl);
    }

    fn deliver_message(&self, msg: &ReceivedMessage) {
        let mut state = self.state.lock();
        state.mark_first_message_delivery(&msg.received_from, msg.topic());

        let ttl = state.params.seen_msg_ttl;
        let record = state.deliveries.record(&msg.id, ttl);
        if record.status != DeliveryStatus::Unknown {
            debug!(
                id = %msg.id,
                status = ?record.status,
                age_ms = record.first_seen.elapsed().as_millis() as u64,
                "unexpected delivery trace"
            );
            return;
        }
        let now = Instant::now();
        record.status = DeliveryStatus::Valid;
        record.validated = Some(now);
        let peers: Vec<PeerId> = record.peers.iter().copied().collect();
        for peer in peers.iter().filter(|p| **p != msg.received_from) {
            state.mark_duplicate_message_delivery(peer, msg.topic(), None);
        }
    }

    fn reject_message(&self, msg: &ReceivedMessage, reason: RejectReason) {
        let mut state = self.state.lock();
        match reason {
            RejectReason::MissingSignature
            | RejectReason::InvalidSignature
            | RejectReason::UnexpectedSignature
            | RejectReason::UnexpectedAuthInfo
            | RejectReason::SelfOrigin
            | RejectReason::MessageTooLarge => {
                state.mark_invalid_message_delivery(&msg.received_from, msg.topic());
                return;
            }
            RejectReason::BlacklistedPeer
            | RejectReason::BlacklistedSource
            | RejectReason::ValidationQueueFull => return,
            _ => {}
        }

        let ttl = state.params.seen_msg_ttl;
        let record = state.deliveries.record(&msg.id, ttl);
        if record.status != DeliveryStatus::Unknown {
            debug!(id = %msg.id, status = ?record.status, "unexpected rejection trace");
            return;
        }
        match reason {
            RejectReason::ValidationThrottled => {
                record.status = DeliveryStatus::Throttled;
                record.peers.clear();
            }
            RejectReason::ValidationIgnored => {
                record.status = DeliveryStatus::Ignored;
                record.peers.clear();
            }
            _ => {
                record.status = DeliveryStatus::Invalid;
                let peers: Vec<PeerId> = record.peers.drain().collect();
                state.mark_invalid_message_delivery(&msg.received_from, msg.topic());
                for peer in peers {
                    state.mark_invalid_message_delivery(&peer, msg.topic());
                }
            }
        }
    }

    fn duplicate_message(&self, msg: &ReceivedMessage) {
        let mut state = self.state.lock();
        let ttl = state.params.seen_msg_ttl;
        let record = state.deliveries.record(&msg.id, ttl);
        if record.peers.contains(&msg.received_from) {
            return;
        }
        match record.status {
            DeliveryStatus::Unknown => {
                record.peers.insert(msg.received_from);
            }
            DeliveryStatus::Valid => {
                record.peers.insert(msg.received_from);
                let validated = record.validated;
                state.mark_duplicate_message_delivery(&msg.received_from, msg.topic(), validated);
            }
            DeliveryStatus::Invalid => {
                state.mark_invalid_message_delivery(&msg.received_from, msg.topic());
            }
            DeliveryStatus::Throttled | DeliveryStatus::Ignored => {}
        }
    }
}

/// Addresses counted for colocation: loopback skipped, IPv6 also by /64.
fn scored_ips(ips: &[IpAddr]) -> Vec<IpAddr> {
    let mut out = Vec::with_capacity(ips.len() * 2);
    for ip in ips {
        if ip.is_loopback() {
            continue;
        }
        match ip {
            IpAddr::V4(_) => out.push(*ip),
            IpAddr::V6(v6) => {
                out.push(*ip);
                let masked = u128::from(*v6) & (u128::MAX << 64);
                out.push(IpAddr::V6(masked.into()));
            }
        }
    }
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;

    const TOPIC: &str = "blocks";

    fn params_with_topic(topic_params: TopicScoreParams) -> PeerScoreParams {
        let mut params = PeerScoreParams::default();
        params.topics.insert(TOPIC.into(), topic_params);
        params
    }

    fn p2_only() -> TopicScoreParams {
        TopicScoreParams {
            time_in_mesh_weight: 0.0,
            first_message_deliveries_weight: 1.0,
            first_message_deliveries_decay: 0.9,
            first_message_deliveries_cap: 10.0,
            ..TopicScoreParams::default()
        }
    }

    fn connect(score: &PeerScore, peer: PeerId) {
        score.add_peer(&PeerConnection::new(peer, "/meshsub/1.1.0", false));
    }

    fn msg(n: u64, from: PeerId) -> Arc<ReceivedMessage> {
        let message = Message {
            topic: TOPIC.into(),
            data: n.to_be_bytes().to_vec(),
            ..Message::default()
        };
        ReceivedMessage::new(MessageId::new(n.to_be_bytes().to_vec()), message, from)
    }

    fn deliver(score: &PeerScore, n: u64, from: PeerId) {
        let m = msg(n, from);
        score.validate_message(&m);
        score.deliver_message(&m);
    }

    #[test]
    fn unknown_peer_scores_zero() {
        let score = PeerScore::new(PeerScoreParams::default()).expect("params");
        assert_eq!(score.score(&PeerId::from_seed(1)), 0.0);
    }

    #[test]
    fn first_deliveries_are_monotone_and_capped() {
        let score = PeerScore::new(params_with_topic(p2_only())).expect("params");
        let busy = PeerId::from_seed(1);
        let idle = PeerId::from_seed(2);
        connect(&score, busy);
        connect(&score, idle);

        deliver(&score, 1, busy);
        deliver(&score, 2, busy);
        deliver(&score, 3, idle);

        assert!(score.score(&busy) >= score.score(&idle));
        assert_eq!(score.score(&busy), 2.0);

        for n in 10..40 {
            deliver(&score, n, busy);
        }
        assert_eq!(score.score(&busy), 10.0);
    }

    #[test]
    fn invalid_messages_penalize_sender_and_earlier_duplicates() {
        let score = PeerScore::new(params_with_topic(p2_only())).expect("params");
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        connect(&score, a);
        connect(&score, b);

        let first = msg(1, a);
        score.validate_message(&first);
        score.duplicate_message(&msg(1, b));
        score.reject_message(&first, RejectReason::ValidationFailed);

        // -100 * 1^2 each
        assert_eq!(score.score(&a), -100.0);
        assert_eq!(score.score(&b), -100.0);

        // Later duplicates of a known-invalid message are penalized too.
        score.duplicate_message(&msg(1, b));
        assert_eq!(score.score(&b), -400.0);
    }

    #[test]
    fn ignored_and_queue_full_are_not_penalized() {
        let score = PeerScore::new(params_with_topic(p2_only())).expect("params");
        let a = PeerId::from_seed(1);
        connect(&score, a);

        let m = msg(1, a);
        score.reject_message(&m, RejectReason::ValidationQueueFull);
        score.validate_message(&m);
        score.reject_message(&m, RejectReason::ValidationIgnored);
        score.duplicate_message(&msg(1, PeerId::from_seed(2)));
        assert_eq!(score.score(&a), 0.0);
    }

    #[test]
    fn signature_failures_penalize_without_record() {
        let score = PeerScore::new(params_with_topic(p2_only())).expect("params");
        let a = PeerId::from_seed(1);
        connect(&score, a);
        score.reject_message(&msg(1, a), RejectReason::InvalidSignature);
        assert_eq!(score.score(&a), -100.0);
    }

    #[test]
    fn mesh_duplicates_count_within_window() {
        let topic_params = TopicScoreParams {
            mesh_message_deliveries_window: Duration::from_secs(5),
            ..p2_only()
        };
        let score = PeerScore::new(params_with_topic(topic_params)).expect("params");
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        connect(&score, a);
        connect(&score, b);
        score.graft(&b, TOPIC);

        deliver(&score, 1, a);
        score.duplicate_message(&msg(1, b));

        let snap = score.snapshot();
        let b_topic = &snap[&b].topics[TOPIC];
        assert_eq!(b_topic.mesh_message_deliveries, 1.0);
        assert_eq!(b_topic.first_message_deliveries, 0.0);
    }

    #[test]
    fn behaviour_penalty_above_threshold_is_squared() {
        let params = PeerScoreParams {
            behaviour_penalty_weight: -1.0,
            behaviour_penalty_threshold: 1.0,
            behaviour_penalty_decay: 0.9,
            ..PeerScoreParams::default()
        };
        let score = PeerScore::new(params).expect("params");
        let a = PeerId::from_seed(1);
        connect(&score, a);

        score.add_penalty(&a, 1);
        assert_eq!(score.score(&a), 0.0);
        score.add_penalty(&a, 2);
        assert_eq!(score.score(&a), -4.0);
    }

    #[test]
    fn decay_snaps_to_zero() {
        let score = PeerScore::new(params_with_topic(p2_only())).expect("params");
        let a = PeerId::from_seed(1);
        connect(&score, a);
        deliver(&score, 1, a);

        for _ in 0..100 {
            score.refresh_scores();
        }
        assert_eq!(score.score(&a), 0.0);
    }

    #[test]
    fn negative_score_is_retained_after_disconnect() {
        let score = PeerScore::new(params_with_topic(p2_only())).expect("params");
        let bad = PeerId::from_seed(1);
        let good = PeerId::from_seed(2);
        connect(&score, bad);
        connect(&score, good);
        score.reject_message(&msg(1, bad), RejectReason::InvalidSignature);
        deliver(&score, 2, good);

        score.remove_peer(&bad);
        score.remove_peer(&good);

        let snap = score.snapshot();
        assert!(snap.contains_key(&bad));
        assert!(!snap[&bad].connected);
        assert!(!snap.contains_key(&good));

        // Retained scores do not decay while disconnected.
        score.refresh_scores();
        assert_eq!(score.score(&bad), -100.0);

        connect(&score, bad);
        assert_eq!(score.score(&bad), -100.0);
    }

    #[test]
    fn ip_colocation_penalizes_surplus() {
        let params = PeerScoreParams {
            ip_colocation_factor_weight: -1.0,
            ip_colocation_factor_threshold: 1.0,
            ..PeerScoreParams::default()
        };
        let score = PeerScore::new(params).expect("params");
        let ip: IpAddr = "10.0.0.1".parse().expect("ip");
        let peers: Vec<PeerId> = (0..3).map(PeerId::from_seed).collect();
        for p in &peers {
            score.add_peer(&PeerConnection::new(*p, "/meshsub/1.1.0", false).with_ips(vec![ip]));
        }
        // 3 peers, threshold 1 -> surplus 2 -> -4
        assert_eq!(score.score(&peers[0]), -4.0);

        let loopback = PeerId::from_seed(99);
        score.add_peer(
            &PeerConnection::new(loopback, "/meshsub/1.1.0", false)
                .with_ips(vec!["127.0.0.1".parse().expect("ip")]),
        );
        assert_eq!(score.score(&loopback), 0.0);
    }

    #[test]
    fn whitelisted_ips_are_exempt() {
        let params = PeerScoreParams {
            ip_colocation_factor_weight: -1.0,
            ip_colocation_factor_threshold: 1.0,
            ip_colocation_factor_whitelist: vec!["10.0.0.0/8".parse().expect("cidr")],
            ..PeerScoreParams::default()
        };
        let score = PeerScore::new(params).expect("params");
        let ip: IpAddr = "10.0.0.1".parse().expect("ip");
        for p in 0..3 {
            score.add_peer(&PeerConnection::new(PeerId::from_seed(p), "/meshsub/1.1.0", false).with_ips(vec![ip]));
        }
        assert_eq!(score.score(&PeerId::from_seed(0)), 0.0);
    }

    #[test]
    fn ipv6_counts_address_and_prefix() {
        let ips = scored_ips(&["2001:db8::1".parse().expect("ip")]);
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[1], "2001:db8::".parse::<IpAddr>().expect("ip"));
    }

    #[test]
    fn new_topic_params_clamp_counters() {
        let score = PeerScore::new(params_with_topic(p2_only())).expect("params");
        let a = PeerId::from_seed(1);
        connect(&score, a);
        for n in 0..8 {
            deliver(&score, n, a);
        }
        assert_eq!(score.score(&a), 8.0);

        let tighter = TopicScoreParams {
            first_message_deliveries_cap: 3.0,
            ..p2_only()
        };
        score.set_topic_score_params(TOPIC, tighter).expect("valid params");
        assert_eq!(score.score(&a), 3.0);
    }

    #[test]
    fn delivery_records_expire() {
        let params = PeerScoreParams {
            seen_msg_ttl: Duration::from_millis(10),
            ..params_with_topic(p2_only())
        };
        let score = PeerScore::new(params).expect("params");
        let a = PeerId::from_seed(1);
        connect(&score, a);
        score.validate_message(&msg(1, a));
        std::thread::sleep(Duration::from_millis(20));
        score.gc_delivery_records();
        assert_eq!(score.state.lock().deliveries.records.len(), 0);
    }
}
