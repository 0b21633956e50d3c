//! # Peer Gater
//!
//! Probabilistic admission control in front of the validation queue
//! (Random Early Drop keyed on per-IP goodput).
//!
//! ## Activation
//!
//! The gater only intervenes while the validation pipeline is overloaded:
//!
//! | Condition | Result |
//! |-----------|--------|
//! | no throttle event within `quiet` | accept |
//! | throttle counter decayed to 0 | accept |
//! | `throttle / validate < threshold` | accept |
//! | peer IP has no recorded traffic | accept |
//! | otherwise | accept with probability `(1 + deliver) / (1 + weighted total)` |
//!
//! A refused peer still has its control messages processed, and every peer
//! keeps a non-zero acceptance probability: this is degradation protection,
//! not a blacklist.
//!
//! ## Stats
//!
//! Counters are aggregated per IP (`<unknown>` when the host gave none), so a
//! Sybil swarm behind one address shares one goodput record. Stats survive
//! disconnects for `retain_stats` and are bounded with LRU eviction.
//!
//! Validation queue-full and throttle events feed only the global throttle
//! counter; they are never charged to an IP because the message's validity is
//! unknown.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::identity::PeerId;
use crate::messages::ReceivedMessage;
use crate::protocols::PeerConnection;
use crate::router::AcceptStatus;
use crate::score_params::{DEFAULT_DECAY_INTERVAL, DEFAULT_DECAY_TO_ZERO, score_parameter_decay};
use crate::trace::RawTracer;
use crate::validation::RejectReason;

pub const DEFAULT_PEER_GATER_RETAIN_STATS: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_PEER_GATER_QUIET: Duration = Duration::from_secs(60);
pub const DEFAULT_PEER_GATER_DUPLICATE_WEIGHT: f64 = 0.125;
pub const DEFAULT_PEER_GATER_IGNORE_WEIGHT: f64 = 1.0;
pub const DEFAULT_PEER_GATER_REJECT_WEIGHT: f64 = 16.0;
pub const DEFAULT_PEER_GATER_THRESHOLD: f64 = 0.33;

/// Maximum number of IP records kept.
/// SECURITY: bounds memory under address churn.
pub const MAX_GATER_TRACKED_IPS: usize = 65_536;

const UNKNOWN_IP: &str = "<unknown>";

#[derive(Clone, Debug)]
pub struct PeerGaterParams {
    /// Throttled/validated ratio above which the gater turns on.
    pub threshold: f64,
    pub global_decay: f64,
    pub source_decay: f64,
    pub decay_interval: Duration,
    pub decay_to_zero: f64,
    pub retain_stats: Duration,
    /// Time without throttle events before the gater turns off.
    pub quiet: Duration,
    pub duplicate_weight: f64,
    pub ignore_weight: f64,
    pub reject_weight: f64,
    /// Per-topic delivery weights; unlisted topics weigh 1.
    pub topic_delivery_weights: HashMap<String, f64>,
}

impl Default for PeerGaterParams {
    fn default() -> Self {
        Self::new(
            DEFAULT_PEER_GATER_THRESHOLD,
            score_parameter_decay(Duration::from_secs(2 * 60)),
            score_parameter_decay(Duration::from_secs(60 * 60)),
        )
    }
}

impl PeerGaterParams {
    pub fn new(threshold: f64, global_decay: f64, source_decay: f64) -> Self {
        Self {
            threshold,
            global_decay,
            source_decay,
            decay_interval: DEFAULT_DECAY_INTERVAL,
            decay_to_zero: DEFAULT_DECAY_TO_ZERO,
            retain_stats: DEFAULT_PEER_GATER_RETAIN_STATS,
            quiet: DEFAULT_PEER_GATER_QUIET,
            duplicate_weight: DEFAULT_PEER_GATER_DUPLICATE_WEIGHT,
            ignore_weight: DEFAULT_PEER_GATER_IGNORE_WEIGHT,
            reject_weight: DEFAULT_PEER_GATER_REJECT_WEIGHT,
            topic_delivery_weights: HashMap::new(),
        }
    }

    pub fn with_topic_delivery_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.topic_delivery_weights = weights;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threshold <= 0.0 {
            bail!("invalid Threshold; must be > 0");
        }
        if self.global_decay <= 0.0 || self.global_decay >= 1.0 {
            bail!("invalid GlobalDecay; must be between 0 and 1");
        }
        if self.source_decay <= 0.0 || self.source_decay >= 1.0 {
            bail!("invalid SourceDecay; must be between 0 and 1");
        }
        if self.decay_interval < Duration::from_secs(1) {
            bail!("invalid DecayInterval; must be at least 1s");
        }
        if self.decay_to_zero <= 0.0 || self.decay_to_zero >= 1.0 {
            bail!("invalid DecayToZero; must be between 0 and 1");
        }
        if self.quiet < Duration::from_secs(1) {
            bail!("invalid Quiet interval; must be at least 1s");
        }
        if self.duplicate_weight <= 0.0 {
            bail!("invalid DuplicateWeight; must be > 0");
        }
        if self.ignore_weight < 1.0 {
            bail!("invalid IgnoreWeight; must be >= 1");
        }
        if self.reject_weight < 1.0 {
            bail!("invalid RejectWeight; must be >= 1");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
struct GaterStats {
    connected: u32,
    expire: Option<Instant>,
    deliver: f64,
    duplicate: f64,
    ignore: f64,
    reject: f64,
}

struct GaterState {
    validate: f64,
    throttle: f64,
    last_throttle: Option<Instant>,
    peer_ip: HashMap<PeerId, String>,
    ip_stats: LruCache<String, GaterStats>,
}

impl GaterState {
    fn stats_for(&mut self, peer: &PeerId) -> &mut GaterStats {
        let key = self
            .peer_ip
            .get(peer)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_IP.to_string());
        self.ip_stats.get_or_insert_mut(key, GaterStats::default)
    }
}

pub struct PeerGater {
    params: PeerGaterParams,
    state: Mutex<GaterState>,
}

impl PeerGater {
    pub fn new(params: PeerGaterParams) -> anyhow::Result<Arc<Self>> {
        params.validate()?;
        let capacity = NonZeroUsize::new(MAX_GATER_TRACKED_IPS)
            .ok_or_else(|| anyhow::anyhow!("MAX_GATER_TRACKED_IPS must be non-zero"))?;
        Ok(Arc::new(Self {
            params,
            state: Mutex::new(GaterState {
                validate: 0.0,
                throttle: 0.0,
                last_throttle: None,
                peer_ip: HashMap::new(),
                ip_stats: LruCache::new(capacity),
            }),
        }))
    }

    pub fn accept_from(&self, peer: &PeerId) -> AcceptStatus {
        let mut state = self.state.lock();

        let active = state
            .last_throttle
            .is_some_and(|t| t.elapsed() <= self.params.quiet);
        if !active || state.throttle == 0.0 {
            return AcceptStatus::All;
        }
        if state.validate != 0.0 && state.throttle / state.validate < self.params.threshold {
            return AcceptStatus::All;
        }

        let params = &self.params;
        let st = state.stats_for(peer);
        let total = st.deliver
            + params.duplicate_weight * st.duplicate
            + params.ignore_weight * st.ignore
            + params.reject_weight * st.reject;
        if total == 0.0 {
            return AcceptStatus::All;
        }

        let threshold = (1.0 + st.deliver) / (1.0 + total);
        if rand::thread_rng().r#gen::<f64>() < threshold {
            return AcceptStatus::All;
        }

        debug!(peer = %peer.short(), threshold, "throttling peer");
        AcceptStatus::Control
    }

    pub fn decay_stats(&self) {
        let params = &self.params;
        let mut state = self.state.lock();
        state.validate = decay(state.validate, params.global_decay, params.decay_to_zero);
        state.throttle = decay(state.throttle, params.global_decay, params.decay_to_zero);

        let now = Instant::now();
        let mut expired = Vec::new();
        for (ip, st) in state.ip_stats.iter_mut() {
            if st.connected > 0 {
                st.deliver = decay(st.deliver, params.source_decay, params.decay_to_zero);
                st.duplicate = decay(st.duplicate, params.source_decay, params.decay_to_zero);
                st.ignore = decay(st.ignore, params.source_decay, params.decay_to_zero);
                st.reject = decay(st.reject, params.source_decay, params.decay_to_zero);
            } else if st.expire.is_none_or(|e| e < now) {
                expired.push(ip.clone());
            }
        }
        for ip in expired {
            state.ip_stats.pop(&ip);
        }
    }

    /// Decay counters on the configured interval until cancelled.
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let gater = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(gater.params.decay_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => gater.decay_stats(),
                }
            }
            debug!("peer gater background task quitting");
        })
    }

    pub fn tracked_ips(&self) -> usize {
        self.state.lock().ip_stats.len()
    }
}

fn decay(value: f64, factor: f64, decay_to_zero: f64) -> f64 {
    let v = value * factor;
    if v < decay_to_zero { 0.0 } else { v }
}

impl RawTracer for PeerGater {
    fn add_peer(&self, conn: &PeerConnection) {
        let mut state = self.state.lock();
        let ip = conn
            .ips
            .first()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_IP.to_string());
        state.peer_ip.insert(conn.peer, ip);
        let st = state.stats_for(&conn.peer);
        st.connected += 1;
        st.expire = None;
    }

    fn remove_peer(&self, peer: &PeerId) {
        let retain = self.params.retain_stats;
        let mut state = self.state.lock();
        let st = state.stats_for(peer);
        st.connected = st.connected.saturating_sub(1);
        st.expire = Some(Instant::now() + retain);
        state.peer_ip.remove(peer);
    }

    fn validate_message(&self, _msg: &ReceivedMessage) {
        self.state.lock().validate += 1.0;
    }

    fn deliver_message(&self, msg: &ReceivedMessage) {
        let weight = self
            .params
            .topic_delivery_weights
            .get(msg.topic())
            .copied()
            .filter(|w| *w != 0.0)
            .unwrap_or(1.0);
        let mut state = self.state.lock();
        state.stats_for(&msg.received_from).deliver += weight;
    }

    fn reject_message(&self, msg: &ReceivedMessage, reason: RejectReason) {
        let mut state = self.state.lock();
        match reason {
            RejectReason::ValidationQueueFull | RejectReason::ValidationThrottled => {
                state.last_throttle = Some(Instant::now());
                state.throttle += 1.0;
            }
            RejectReason::ValidationIgnored => {
                state.stats_for(&msg.received_from).ignore += 1.0;
            }
            _ => {
                state.stats_for(&msg.received_from).reject += 1.0;
            }
        }
    }

    fn duplicate_message(&self, msg: &ReceivedMessage) {
        let mut state = self.state.lock();
        state.stats_for(&msg.received_from).duplicate += 1.0;
    }
}

impl std::fmt::Debug for PeerGater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerGater")
            .field("params", &self.params)
            .field("tracked_ips", &self.tracked_ips())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, MessageId};

    fn received(from: PeerId) -> Arc<ReceivedMessage> {
        ReceivedMessage::new(MessageId::from("m"), Message::default(), from)
    }

    fn connect(gater: &PeerGater, peer: PeerId, ip: &str) {
        gater.add_peer(&PeerConnection::new(peer, "/meshsub/1.1.0", false).with_ips(vec![ip.parse().expect("ip")]));
    }

    #[test]
    fn default_params_are_valid() {
        PeerGaterParams::default().validate().expect("defaults");
        let bad = PeerGaterParams {
            ignore_weight: 0.5,
            ..PeerGaterParams::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn inactive_gater_accepts_everyone() {
        let gater = PeerGater::new(PeerGaterParams::default()).expect("gater");
        let peer = PeerId::from_seed(1);
        connect(&gater, peer, "10.0.0.1");
        for _ in 0..10 {
            gater.reject_message(&received(peer), RejectReason::ValidationFailed);
        }
        assert_eq!(gater.accept_from(&peer), AcceptStatus::All);
    }

    #[test]
    fn overloaded_gater_throttles_bad_ips() {
        let gater = PeerGater::new(PeerGaterParams::default()).expect("gater");
        let bad = PeerId::from_seed(1);
        let fresh = PeerId::from_seed(2);
        connect(&gater, bad, "10.0.0.1");
        connect(&gater, fresh, "10.0.0.2");

        let m = received(bad);
        gater.validate_message(&m);
        gater.reject_message(&m, RejectReason::ValidationQueueFull);
        for _ in 0..100 {
            gater.reject_message(&m, RejectReason::ValidationFailed);
        }

        let refused = (0..100)
            .filter(|_| gater.accept_from(&bad) == AcceptStatus::Control)
            .count();
        assert!(refused > 90, "refused only {refused}");

        // No recorded traffic from this IP: always accepted.
        assert_eq!(gater.accept_from(&fresh), AcceptStatus::All);
    }

    #[test]
    fn stats_are_shared_per_ip() {
        let gater = PeerGater::new(PeerGaterParams::default()).expect("gater");
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        connect(&gater, a, "10.0.0.1");
        connect(&gater, b, "10.0.0.1");

        let m = received(a);
        gater.validate_message(&m);
        gater.reject_message(&m, RejectReason::ValidationThrottled);
        for _ in 0..100 {
            gater.reject_message(&received(a), RejectReason::ValidationFailed);
        }

        let refused = (0..100)
            .filter(|_| gater.accept_from(&b) == AcceptStatus::Control)
            .count();
        assert!(refused > 90);
        assert_eq!(gater.tracked_ips(), 1);
    }

    #[test]
    fn disconnected_stats_expire_on_decay() {
        let params = PeerGaterParams {
            retain_stats: Duration::ZERO,
            ..PeerGaterParams::default()
        };
        let gater = PeerGater::new(params).expect("gater");
        let peer = PeerId::from_seed(1);
        connect(&gater, peer, "10.0.0.1");
        gater.remove_peer(&peer);
        std::thread::sleep(Duration::from_millis(5));
        gater.decay_stats();
        assert_eq!(gater.tracked_ips(), 0);
    }
}
