//! # Peer Score Parameters
//!
//! Parameters for the peer scoring engine in [`crate::score`].
//!
//! ## Score Components
//!
//! | Component | Scope | Sign | Description |
//! |-----------|-------|------|-------------|
//! | P1 | topic | + | Time in mesh, capped |
//! | P2 | topic | + | First message deliveries, capped |
//! | P3 | topic | − | Squared mesh delivery deficit (after activation) |
//! | P3b | topic | − | Sticky mesh failure penalty |
//! | P4 | topic | − | Squared invalid message deliveries |
//! | P5 | peer | ± | Application-specific score |
//! | P6 | peer | − | Squared IP colocation surplus |
//! | P7 | peer | − | Squared behavioural penalty surplus |
//!
//! ## Thresholds
//!
//! | Threshold | Effect below it |
//! |-----------|-----------------|
//! | `gossip_threshold` | no gossip to / from the peer |
//! | `publish_threshold` | no flood publishing to the peer |
//! | `graylist_threshold` | all RPCs from the peer are ignored |
//! | `accept_px_threshold` | PX from the peer is ignored (must be ≥ 0) |
//! | `opportunistic_graft_threshold` | median mesh score triggering opportunistic grafts |

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};

use crate::identity::PeerId;

/// Counters below this value decay to zero.
pub const DEFAULT_DECAY_TO_ZERO: f64 = 0.01;

/// Interval between score decay ticks.
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(1);

/// How long a disconnected peer's non-positive score is retained.
/// SECURITY: prevents score laundering by reconnecting.
pub const DEFAULT_RETAIN_SCORE: Duration = Duration::from_secs(60 * 60);

/// Lifetime of per-message delivery records.
pub const DEFAULT_SEEN_MSG_TTL: Duration = Duration::from_secs(120);

/// Application-specific score hook (P5).
pub type AppSpecificScore = Arc<dyn Fn(&PeerId) -> f64 + Send + Sync>;

/// Decay factor that takes a counter to `DEFAULT_DECAY_TO_ZERO` over `decay`,
/// ticking every second.
pub fn score_parameter_decay(decay: Duration) -> f64 {
    score_parameter_decay_with_base(decay, DEFAULT_DECAY_INTERVAL, DEFAULT_DECAY_TO_ZERO)
}

/// Decay factor that takes a counter to `decay_to_zero` over `decay`, ticking every `base`.
pub fn score_parameter_decay_with_base(decay: Duration, base: Duration, decay_to_zero: f64) -> f64 {
    let ticks = decay.as_secs_f64() / base.as_secs_f64();
    decay_to_zero.powf(1.0 / ticks)
}

// ============================================================================
// IP Networks
// ============================================================================

/// A CIDR network used for IP colocation whitelisting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> anyhow::Result<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            bail!("prefix length {} exceeds {} for {}", prefix, max, addr);
        }
        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) }
}

impl FromStr for IpNet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .with_context(|| format!("invalid network address: {}", s))?;
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .with_context(|| format!("invalid prefix length: {}", s))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };
        Self::new(addr, prefix)
    }
}

// ============================================================================
// Thresholds
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerScoreThresholds {
    /// Gossip is neither emitted to nor accepted from peers below this score.
    pub gossip_threshold: f64,
    /// Flood publishing skips peers below this score.
    pub publish_threshold: f64,
    /// RPCs from peers below this score are ignored entirely.
    pub graylist_threshold: f64,
    pub accept_px_threshold: f64,
    pub opportunistic_graft_threshold: f64,
}

impl PeerScoreThresholds {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gossip_threshold > 0.0 || !self.gossip_threshold.is_finite() {
            bail!("invalid gossip threshold; it must be <= 0 and a valid number");
        }
        if self.publish_threshold > 0.0
            || self.publish_threshold > self.gossip_threshold
            || !self.publish_threshold.is_finite()
        {
            bail!("invalid publish threshold; it must be <= 0 and <= gossip threshold and a valid number");
        }
        if self.graylist_threshold > 0.0
            || self.graylist_threshold > self.publish_threshold
            || !self.graylist_threshold.is_finite()
        {
            bail!("invalid graylist threshold; it must be <= 0 and <= publish threshold and a valid number");
        }
        if self.accept_px_threshold < 0.0 || !self.accept_px_threshold.is_finite() {
            bail!("invalid accept PX threshold; it must be >= 0 and a valid number");
        }
        if self.opportunistic_graft_threshold < 0.0 || !self.opportunistic_graft_threshold.is_finite() {
            bail!("invalid opportunistic grafting threshold; it must be >= 0 and a valid number");
        }
        Ok(())
    }
}

// ============================================================================
// Peer Parameters
// ============================================================================

#[derive(Clone)]
pub struct PeerScoreParams {
    /// Per-topic parameters; topics without an entry are not scored.
    pub topics: HashMap<String, TopicScoreParams>,

    /// Cap on the positive part of the summed topic scores; 0 disables the cap.
    pub topic_score_cap: f64,

    // P5
    pub app_specific_score: AppSpecificScore,
    pub app_specific_weight: f64,

    // P6
    pub ip_colocation_factor_weight: f64,
    pub ip_colocation_factor_threshold: f64,
    pub ip_colocation_factor_whitelist: Vec<IpNet>,

    // P7
    pub behaviour_penalty_weight: f64,
    pub behaviour_penalty_threshold: f64,
    pub behaviour_penalty_decay: f64,

    pub decay_interval: Duration,
    pub decay_to_zero: f64,
    pub retain_score: Duration,
    pub seen_msg_ttl: Duration,
}

impl Default for PeerScoreParams {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            topic_score_cap: 0.0,
            app_specific_score: Arc::new(|_| 0.0),
            app_specific_weight: 0.0,
            ip_colocation_factor_weight: 0.0,
            ip_colocation_factor_threshold: 1.0,
            ip_colocation_factor_whitelist: Vec::new(),
            behaviour_penalty_weight: 0.0,
            behaviour_penalty_threshold: 0.0,
            behaviour_penalty_decay: 0.99,
            decay_interval: DEFAULT_DECAY_INTERVAL,
            decay_to_zero: DEFAULT_DECAY_TO_ZERO,
            retain_score: DEFAULT_RETAIN_SCORE,
            seen_msg_ttl: DEFAULT_SEEN_MSG_TTL,
        }
    }
}

impl std::fmt::Debug for PeerScoreParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerScoreParams")
            .field("topics", &self.topics)
            .field("topic_score_cap", &self.topic_score_cap)
            .field("app_specific_weight", &self.app_specific_weight)
            .field("ip_colocation_factor_weight", &self.ip_colocation_factor_weight)
            .field("ip_colocation_factor_threshold", &self.ip_colocation_factor_threshold)
            .field("behaviour_penalty_weight", &self.behaviour_penalty_weight)
            .field("behaviour_penalty_threshold", &self.behaviour_penalty_threshold)
            .field("behaviour_penalty_decay", &self.behaviour_penalty_decay)
            .field("decay_interval", &self.decay_interval)
            .field("decay_to_zero", &self.decay_to_zero)
            .field("retain_score", &self.retain_score)
            .finish_non_exhaustive()
    }
}

impl PeerScoreParams {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (topic, params) in &self.topics {
            params
                .validate()
                .with_context(|| format!("invalid score parameters for topic {}", topic))?;
        }

        if self.topic_score_cap < 0.0 || !self.topic_score_cap.is_finite() {
            bail!("invalid topic score cap; must be positive (or 0 for no cap) and a valid number");
        }

        if !self.app_specific_weight.is_finite() {
            bail!("invalid application specific weight; must be a valid number");
        }

        if self.ip_colocation_factor_weight > 0.0 || !self.ip_colocation_factor_weight.is_finite() {
            bail!("invalid IPColocationFactorWeight; must be negative (or 0 to disable) and a valid number");
        }
        if self.ip_colocation_factor_weight != 0.0 && self.ip_colocation_factor_threshold < 1.0 {
            bail!("invalid IPColocationFactorThreshold; must be at least 1");
        }
        if !self.ip_colocation_factor_threshold.is_finite() {
            bail!("invalid IPColocationFactorThreshold; must be a valid number");
        }

        if self.behaviour_penalty_weight > 0.0 || !self.behaviour_penalty_weight.is_finite() {
            bail!("invalid BehaviourPenaltyWeight; must be negative (or 0 to disable) and a valid number");
        }
        if self.behaviour_penalty_weight != 0.0
            && (self.behaviour_penalty_decay <= 0.0 || self.behaviour_penalty_decay >= 1.0)
        {
            bail!("invalid BehaviourPenaltyDecay; must be between 0 and 1");
        }
        if self.behaviour_penalty_threshold < 0.0 || !self.behaviour_penalty_threshold.is_finite() {
            bail!("invalid BehaviourPenaltyThreshold; must be >= 0 and a valid number");
        }

        if self.decay_interval < Duration::from_secs(1) {
            bail!("invalid DecayInterval; must be at least 1s");
        }
        if self.decay_to_zero <= 0.0 || self.decay_to_zero >= 1.0 || !self.decay_to_zero.is_finite() {
            bail!("invalid DecayToZero; must be between 0 and 1");
        }

        Ok(())
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.ip_colocation_factor_whitelist
            .iter()
            .any(|net| net.contains(ip))
    }
}

// ============================================================================
// Topic Parameters
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct TopicScoreParams {
    /// Weight of this topic's score in the peer's aggregate.
    pub topic_weight: f64,

    // P1
    pub time_in_mesh_weight: f64,
    pub time_in_mesh_quantum: Duration,
    pub time_in_mesh_cap: f64,

    // P2
    pub first_message_deliveries_weight: f64,
    pub first_message_deliveries_decay: f64,
    pub first_message_deliveries_cap: f64,

    // P3
    pub mesh_message_deliveries_weight: f64,
    pub mesh_message_deliveries_decay: f64,
    pub mesh_message_deliveries_cap: f64,
    pub mesh_message_deliveries_threshold: f64,
    /// Duplicates arriving within this window of the first delivery still count.
    pub mesh_message_deliveries_window: Duration,
    /// Time in mesh before the P3 deficit starts counting.
    pub mesh_message_deliveries_activation: Duration,

    // P3b
    pub mesh_failure_penalty_weight: f64,
    pub mesh_failure_penalty_decay: f64,

    // P4
    pub invalid_message_deliveries_weight: f64,
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    fn default() -> Self {
        Self {
            topic_weight: 1.0,
            time_in_mesh_weight: 0.01,
            time_in_mesh_quantum: Duration::from_secs(1),
            time_in_mesh_cap: 3600.0,
            first_message_deliveries_weight: 1.0,
            first_message_deliveries_decay: score_parameter_decay(Duration::from_secs(10 * 60)),
            first_message_deliveries_cap: 100.0,
            mesh_message_deliveries_weight: 0.0,
            mesh_message_deliveries_decay: score_parameter_decay(Duration::from_secs(60)),
            mesh_message_deliveries_cap: 100.0,
            mesh_message_deliveries_threshold: 1.0,
            mesh_message_deliveries_window: Duration::from_millis(10),
            mesh_message_deliveries_activation: Duration::from_secs(30),
            mesh_failure_penalty_weight: 0.0,
            mesh_failure_penalty_decay: score_parameter_decay(Duration::from_secs(60)),
            invalid_message_deliveries_weight: -100.0,
            invalid_message_deliveries_decay: score_parameter_decay(Duration::from_secs(60 * 60)),
        }
    }
}

fn is_unit_interval(v: f64) -> bool {
    v > 0.0 && v < 1.0 && v.is_finite()
}

impl TopicScoreParams {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topic_weight < 0.0 || !self.topic_weight.is_finite() {
            bail!("invalid topic weight; must be >= 0 and a valid number");
        }

        // P1
        if self.time_in_mesh_quantum.is_zero() {
            bail!("invalid TimeInMeshQuantum; must be positive");
        }
        if self.time_in_mesh_weight < 0.0 || !self.time_in_mesh_weight.is_finite() {
            bail!("invalid TimeInMeshWeight; must be positive (or 0 to disable) and a valid number");
        }
        if self.time_in_mesh_weight != 0.0
            && (self.time_in_mesh_cap <= 0.0 || !self.time_in_mesh_cap.is_finite())
        {
            bail!("invalid TimeInMeshCap; must be positive and a valid number");
        }

        // P2
        if self.first_message_deliveries_weight < 0.0 || !self.first_message_deliveries_weight.is_finite() {
            bail!("invalid FirstMessageDeliveriesWeight; must be positive (or 0 to disable) and a valid number");
        }
        if self.first_message_deliveries_weight != 0.0
            && (!is_unit_interval(self.first_message_deliveries_decay)
                || self.first_message_deliveries_cap <= 0.0
                || !self.first_message_deliveries_cap.is_finite())
        {
            bail!("invalid FirstMessageDeliveries parameters; decay must be in (0, 1) and cap positive");
        }

        // P3
        if self.mesh_message_deliveries_weight > 0.0 || !self.mesh_message_deliveries_weight.is_finite() {
            bail!("invalid MeshMessageDeliveriesWeight; must be negative (or 0 to disable) and a valid number");
        }
        if self.mesh_message_deliveries_weight != 0.0 {
            if !is_unit_interval(self.mesh_message_deliveries_decay) {
                bail!("invalid MeshMessageDeliveriesDecay; must be between 0 and 1");
            }
            if self.mesh_message_deliveries_cap <= 0.0 || !self.mesh_message_deliveries_cap.is_finite() {
                bail!("invalid MeshMessageDeliveriesCap; must be positive and a valid number");
            }
            if self.mesh_message_deliveries_threshold <= 0.0
                || !self.mesh_message_deliveries_threshold.is_finite()
            {
                bail!("invalid MeshMessageDeliveriesThreshold; must be positive and a valid number");
            }
            if self.mesh_message_deliveries_activation < Duration::from_secs(1) {
                bail!("invalid MeshMessageDeliveriesActivation; must be at least 1s");
            }
        }

        // P3b
        if self.mesh_failure_penalty_weight > 0.0 || !self.mesh_failure_penalty_weight.is_finite() {
            bail!("invalid MeshFailurePenaltyWeight; must be negative (or 0 to disable) and a valid number");
        }
        if self.mesh_failure_penalty_weight != 0.0 && !is_unit_interval(self.mesh_failure_penalty_decay) {
            bail!("invalid MeshFailurePenaltyDecay; must be between 0 and 1");
        }

        // P4
        if self.invalid_message_deliveries_weight > 0.0 || !self.invalid_message_deliveries_weight.is_finite() {
            bail!("invalid InvalidMessageDeliveriesWeight; must be negative (or 0 to disable) and a valid number");
        }
        if !is_unit_interval(self.invalid_message_deliveries_decay) {
            bail!("invalid InvalidMessageDeliveriesDecay; must be between 0 and 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid() {
        PeerScoreParams::default().validate().expect("peer params");
        TopicScoreParams::default().validate().expect("topic params");
        PeerScoreThresholds::default().validate().expect("thresholds");
    }

    #[test]
    fn threshold_ordering_is_enforced() {
        let ok = PeerScoreThresholds {
            gossip_threshold: -10.0,
            publish_threshold: -50.0,
            graylist_threshold: -80.0,
            accept_px_threshold: 10.0,
            opportunistic_graft_threshold: 2.0,
        };
        ok.validate().expect("ordered thresholds");

        let bad = PeerScoreThresholds {
            publish_threshold: -5.0,
            ..ok.clone()
        };
        assert!(bad.validate().is_err());

        let positive = PeerScoreThresholds {
            gossip_threshold: 1.0,
            ..ok.clone()
        };
        assert!(positive.validate().is_err());

        let nan = PeerScoreThresholds {
            accept_px_threshold: f64::NAN,
            ..ok
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn topic_param_signs_are_enforced() {
        let positive_p4 = TopicScoreParams {
            invalid_message_deliveries_weight: 1.0,
            ..TopicScoreParams::default()
        };
        assert!(positive_p4.validate().is_err());

        let bad_p3 = TopicScoreParams {
            mesh_message_deliveries_weight: -1.0,
            mesh_message_deliveries_activation: Duration::from_millis(10),
            ..TopicScoreParams::default()
        };
        assert!(bad_p3.validate().is_err());

        let mut params = PeerScoreParams::default();
        params.topics.insert("t".into(), positive_p4);
        let err = params.validate().expect_err("invalid topic");
        assert!(format!("{:#}", err).contains("topic t"));
    }

    #[test]
    fn peer_param_bounds() {
        let short_decay = PeerScoreParams {
            decay_interval: Duration::from_millis(100),
            ..PeerScoreParams::default()
        };
        assert!(short_decay.validate().is_err());

        let colocation = PeerScoreParams {
            ip_colocation_factor_weight: -1.0,
            ip_colocation_factor_threshold: 0.5,
            ..PeerScoreParams::default()
        };
        assert!(colocation.validate().is_err());
    }

    #[test]
    fn decay_reaches_decay_to_zero() {
        let decay = score_parameter_decay(Duration::from_secs(10));
        let after = decay.powi(10);
        assert!((after - DEFAULT_DECAY_TO_ZERO).abs() < 1e-9);
    }

    #[test]
    fn cidr_matching() {
        let net: IpNet = "10.1.0.0/16".parse().expect("cidr");
        assert!(net.contains(&"10.1.2.3".parse().expect("ip")));
        assert!(!net.contains(&"10.2.0.1".parse().expect("ip")));
        assert!(!net.contains(&"::1".parse().expect("ip")));

        let v6: IpNet = "2001:db8::/32".parse().expect("cidr");
        assert!(v6.contains(&"2001:db8:1::5".parse().expect("ip")));

        let host: IpNet = "192.168.1.1".parse().expect("host");
        assert!(host.contains(&"192.168.1.1".parse().expect("ip")));
        assert!("10.0.0.0/33".parse::<IpNet>().is_err());
    }
}
