//! # Configuration
//!
//! All tunables are fixed at construction and passed explicitly to every
//! component. There are no process-wide mutable defaults.
//!
//! | Group | Type | Consumer |
//! |-------|------|----------|
//! | engine | [`PubSubConfig`] | actor, validation, writers |
//! | mesh protocol | [`GossipSubConfig`] | gossipsub router |
//! | scoring | [`ScoringConfig`] | score engine, router thresholds |
//! | gating | [`PeerGaterParams`] | peer gater |
//! | pluggable behaviour | [`PubSubHooks`] | actor |
//!
//! Each group has a `validate()`; building the engine fails on invalid values.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};

use crate::backoff::BackoffConfig;
use crate::blacklist::{Blacklist, MapBlacklist};
use crate::filter::{PeerFilter, SubscriptionFilter, default_peer_filter};
use crate::identity::PeerId;
use crate::midgen::{MessageIdFn, default_message_id};
use crate::peer_gater::PeerGaterParams;
use crate::score::ScoreInspectFn;
use crate::score_params::{PeerScoreParams, PeerScoreThresholds};
use crate::seen::DEFAULT_SEEN_MESSAGES_TTL;
use crate::signing::SignaturePolicy;
use crate::trace::RawTracer;
use crate::validation::{
    DEFAULT_VALIDATE_CONCURRENCY, DEFAULT_VALIDATE_QUEUE_SIZE, DEFAULT_VALIDATE_THROTTLE, Validator,
    ValidatorOptions,
};

// ============================================================================
// Engine Defaults
// ============================================================================

/// Maximum encoded size of an RPC (and of a single published message).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Depth of each peer's outbound RPC queue.
pub const DEFAULT_PEER_OUTBOUND_QUEUE_SIZE: usize = 32;

/// Depth of each subscription's delivery queue.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 32;

/// Depth of the actor's request queue.
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 1024;

// ============================================================================
// GossipSub Defaults
// ============================================================================

/// D - target mesh degree.
pub const DEFAULT_MESH_N: usize = 6;
/// D_lo - graft when the mesh falls below this.
pub const DEFAULT_MESH_N_LOW: usize = 5;
/// D_hi - prune when the mesh grows above this.
pub const DEFAULT_MESH_N_HIGH: usize = 12;
/// D_score - peers kept by score when pruning.
pub const DEFAULT_MESH_D_SCORE: usize = 4;
/// D_out - outbound connections the mesh should contain.
pub const DEFAULT_MESH_OUTBOUND_MIN: usize = 2;
/// D_lazy - minimum gossip targets per heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;
pub const DEFAULT_GOSSIP_FACTOR: f64 = 0.25;
pub const DEFAULT_GOSSIP_RETRANSMISSION: u32 = 3;
pub const DEFAULT_HISTORY_LENGTH: usize = 5;
pub const DEFAULT_HISTORY_GOSSIP: usize = 3;

pub const DEFAULT_HEARTBEAT_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Heartbeats slower than this fraction of the interval are logged.
pub const DEFAULT_SLOW_HEARTBEAT_WARNING: f64 = 0.1;
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

pub const DEFAULT_PRUNE_PEERS: usize = 16;
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_UNSUBSCRIBE_BACKOFF: Duration = Duration::from_secs(10);

pub const DEFAULT_CONNECTORS: usize = 8;
pub const DEFAULT_MAX_PENDING_CONNECTIONS: usize = 128;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DIRECT_CONNECT_TICKS: u64 = 300;
pub const DEFAULT_DIRECT_CONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_OPPORTUNISTIC_GRAFT_TICKS: u64 = 60;
pub const DEFAULT_OPPORTUNISTIC_GRAFT_PEERS: usize = 2;
/// A GRAFT this soon after our PRUNE earns an extra penalty.
pub const DEFAULT_GRAFT_FLOOD_THRESHOLD: Duration = Duration::from_secs(10);

/// Maximum message ids accepted from one peer's IHAVEs per heartbeat.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 5000;
/// Maximum IHAVE messages processed from one peer per heartbeat.
pub const DEFAULT_MAX_IHAVE_MESSAGES: usize = 10;
pub const DEFAULT_IWANT_FOLLOWUP_TIME: Duration = Duration::from_secs(3);

// ============================================================================
// Engine Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct PubSubConfig {
    pub max_message_size: usize,
    pub peer_outbound_queue_size: usize,
    pub signature_policy: SignaturePolicy,

    // Validation pipeline
    pub validate_queue_size: usize,
    pub validate_throttle: usize,
    pub validate_workers: usize,
    /// Default per-validator concurrency.
    pub validate_concurrency: usize,

    pub seen_messages_ttl: Duration,
    pub subscription_buffer: usize,
    pub subscription_event_buffer: usize,
    pub command_queue_size: usize,

    /// Backoff for re-opening a failed outbound stream.
    pub reconnect: BackoffConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            peer_outbound_queue_size: DEFAULT_PEER_OUTBOUND_QUEUE_SIZE,
            signature_policy: SignaturePolicy::StrictSign,
            validate_queue_size: DEFAULT_VALIDATE_QUEUE_SIZE,
            validate_throttle: DEFAULT_VALIDATE_THROTTLE,
            validate_workers: workers,
            validate_concurrency: DEFAULT_VALIDATE_CONCURRENCY,
            seen_messages_ttl: DEFAULT_SEEN_MESSAGES_TTL,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            subscription_event_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            reconnect: BackoffConfig::default(),
        }
    }
}

impl PubSubConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size < 1024 {
            bail!("max message size must be at least 1 KiB");
        }
        if self.peer_outbound_queue_size == 0 {
            bail!("peer outbound queue size must be positive");
        }
        if self.validate_queue_size == 0 || self.validate_throttle == 0 || self.validate_workers == 0 {
            bail!("validation queue, throttle and workers must be positive");
        }
        if self.validate_concurrency == 0 {
            bail!("validator concurrency must be positive");
        }
        if self.seen_messages_ttl.is_zero() {
            bail!("seen messages TTL must be positive");
        }
        if self.subscription_buffer == 0 || self.subscription_event_buffer == 0 {
            bail!("subscription buffers must be positive");
        }
        if self.command_queue_size == 0 {
            bail!("command queue size must be positive");
        }
        self.reconnect.validate()
    }
}

// ============================================================================
// Scoring Configuration
// ============================================================================

#[derive(Clone)]
pub struct ScoringConfig {
    pub params: PeerScoreParams,
    pub thresholds: PeerScoreThresholds,
    /// Periodic callback receiving a snapshot of all scores.
    pub inspect: Option<(ScoreInspectFn, Duration)>,
}

impl ScoringConfig {
    pub fn new(params: PeerScoreParams, thresholds: PeerScoreThresholds) -> Self {
        Self {
            params,
            thresholds,
            inspect: None,
        }
    }

    pub fn with_inspect(mut self, f: ScoreInspectFn, period: Duration) -> Self {
        self.inspect = Some((f, period));
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.params.validate().context("invalid peer score parameters")?;
        self.thresholds.validate().context("invalid peer score thresholds")?;
        Ok(())
    }
}

impl std::fmt::Debug for ScoringConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringConfig")
            .field("params", &self.params)
            .field("thresholds", &self.thresholds)
            .field("inspect", &self.inspect.as_ref().map(|(_, period)| period))
            .finish()
    }
}

// ============================================================================
// GossipSub Configuration
// ============================================================================

/// Mesh protocol parameters (GossipSub v1.1).
#[derive(Clone, Debug)]
pub struct GossipSubConfig {
    // ========================================================================
    // Mesh Degree
    // ========================================================================
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub mesh_d_score: usize,
    pub mesh_outbound_min: usize,

    // ========================================================================
    // Gossip
    // ========================================================================
    pub history_length: usize,
    pub history_gossip: usize,
    pub gossip_lazy: usize,
    pub gossip_factor: f64,
    /// Times a message may be sent to one peer in response to IWANTs.
    pub gossip_retransmission: u32,
    pub max_ihave_length: usize,
    pub max_ihave_messages: usize,
    pub iwant_followup_time: Duration,

    // ========================================================================
    // Timing
    // ========================================================================
    pub heartbeat_initial_delay: Duration,
    pub heartbeat_interval: Duration,
    pub slow_heartbeat_warning: f64,
    pub fanout_ttl: Duration,

    // ========================================================================
    // Prune, Backoff and Peer Exchange
    // ========================================================================
    pub prune_peers: usize,
    pub prune_backoff: Duration,
    pub unsubscribe_backoff: Duration,
    pub graft_flood_threshold: Duration,
    /// Emit peer exchange records when pruning.
    pub do_px: bool,
    pub connectors: usize,
    pub max_pending_connections: usize,
    pub connection_timeout: Duration,

    // ========================================================================
    // Direct Peers
    // ========================================================================
    /// Peers we always forward to and never mesh with.
    pub direct_peers: Vec<PeerId>,
    pub direct_connect_ticks: u64,
    pub direct_connect_initial_delay: Duration,

    // ========================================================================
    // Opportunistic Grafting
    // ========================================================================
    pub opportunistic_graft_ticks: u64,
    pub opportunistic_graft_peers: usize,

    /// Publish our own messages to every topic peer above the publish
    /// threshold instead of only the mesh.
    pub flood_publish: bool,

    /// Peer scoring; disabled when `None`.
    pub scoring: Option<ScoringConfig>,
    /// Peer gater; disabled when `None`.
    pub peer_gater: Option<PeerGaterParams>,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            mesh_d_score: DEFAULT_MESH_D_SCORE,
            mesh_outbound_min: DEFAULT_MESH_OUTBOUND_MIN,

            history_length: DEFAULT_HISTORY_LENGTH,
            history_gossip: DEFAULT_HISTORY_GOSSIP,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            gossip_factor: DEFAULT_GOSSIP_FACTOR,
            gossip_retransmission: DEFAULT_GOSSIP_RETRANSMISSION,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_ihave_messages: DEFAULT_MAX_IHAVE_MESSAGES,
            iwant_followup_time: DEFAULT_IWANT_FOLLOWUP_TIME,

            heartbeat_initial_delay: DEFAULT_HEARTBEAT_INITIAL_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            slow_heartbeat_warning: DEFAULT_SLOW_HEARTBEAT_WARNING,
            fanout_ttl: DEFAULT_FANOUT_TTL,

            prune_peers: DEFAULT_PRUNE_PEERS,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            unsubscribe_backoff: DEFAULT_UNSUBSCRIBE_BACKOFF,
            graft_flood_threshold: DEFAULT_GRAFT_FLOOD_THRESHOLD,
            do_px: false,
            connectors: DEFAULT_CONNECTORS,
            max_pending_connections: DEFAULT_MAX_PENDING_CONNECTIONS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,

            direct_peers: Vec::new(),
            direct_connect_ticks: DEFAULT_DIRECT_CONNECT_TICKS,
            direct_connect_initial_delay: DEFAULT_DIRECT_CONNECT_INITIAL_DELAY,

            opportunistic_graft_ticks: DEFAULT_OPPORTUNISTIC_GRAFT_TICKS,
            opportunistic_graft_peers: DEFAULT_OPPORTUNISTIC_GRAFT_PEERS,

            flood_publish: true,
            scoring: None,
            peer_gater: None,
        }
    }
}

impl GossipSubConfig {
    /// Set D and derive Dlo/Dhi/Dscore/Dout the way small test swarms expect.
    pub fn with_degree(mut self, d: usize, d_lo: usize, d_hi: usize) -> Self {
        self.mesh_n = d;
        self.mesh_n_low = d_lo;
        self.mesh_n_high = d_hi;
        self.mesh_d_score = self.mesh_d_score.min(d);
        self.mesh_outbound_min = self.mesh_outbound_min.min(d / 2).min(d_lo.saturating_sub(1));
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn with_peer_gater(mut self, params: PeerGaterParams) -> Self {
        self.peer_gater = Some(params);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.mesh_outbound_min <= self.mesh_n / 2 && self.mesh_n_low <= self.mesh_n && self.mesh_n <= self.mesh_n_high)
        {
            bail!("D_out should be <= D/2 and D_lo <= D <= D_hi");
        }
        if self.mesh_n_low > 0 && self.mesh_outbound_min >= self.mesh_n_low {
            bail!("D_out must be smaller than D_lo");
        }
        if self.mesh_d_score > self.mesh_n {
            bail!("D_score must not exceed D");
        }
        if self.history_gossip > self.history_length {
            bail!("history gossip window must not exceed history length");
        }
        if self.history_length == 0 {
            bail!("history length must be positive");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if !(0.0..=1.0).contains(&self.gossip_factor) {
            bail!("gossip factor must be between 0 and 1");
        }
        if self.connectors == 0 || self.max_pending_connections == 0 {
            bail!("connectors and pending connection queue must be positive");
        }
        if self.opportunistic_graft_ticks == 0 || self.direct_connect_ticks == 0 {
            bail!("tick periods must be positive");
        }
        if let Some(scoring) = &self.scoring {
            scoring.validate()?;
        }
        if let Some(gater) = &self.peer_gater {
            gater.validate().context("invalid peer gater parameters")?;
        }
        Ok(())
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// Pluggable behaviour supplied at construction.
#[derive(Clone)]
pub struct PubSubHooks {
    pub message_id_fn: MessageIdFn,
    pub subscription_filter: Option<Arc<dyn SubscriptionFilter>>,
    pub peer_filter: PeerFilter,
    pub blacklist: Arc<dyn Blacklist>,
    /// Validators applied to every topic, before the topic's own validator.
    pub default_validators: Vec<(Validator, ValidatorOptions)>,
    pub tracers: Vec<Arc<dyn RawTracer>>,
}

impl Default for PubSubHooks {
    fn default() -> Self {
        Self {
            message_id_fn: Arc::new(default_message_id),
            subscription_filter: None,
            peer_filter: default_peer_filter(),
            blacklist: Arc::new(MapBlacklist::new()),
            default_validators: Vec::new(),
            tracers: Vec::new(),
        }
    }
}

impl PubSubHooks {
    pub fn with_message_id_fn(mut self, f: MessageIdFn) -> Self {
        self.message_id_fn = f;
        self
    }

    pub fn with_subscription_filter(mut self, filter: Arc<dyn SubscriptionFilter>) -> Self {
        self.subscription_filter = Some(filter);
        self
    }

    pub fn with_peer_filter(mut self, filter: PeerFilter) -> Self {
        self.peer_filter = filter;
        self
    }

    pub fn with_blacklist(mut self, blacklist: Arc<dyn Blacklist>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn with_default_validator(mut self, validator: Validator, opts: ValidatorOptions) -> Self {
        self.default_validators.push((validator, opts));
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn RawTracer>) -> Self {
        self.tracers.push(tracer);
        self
    }
}

impl std::fmt::Debug for PubSubHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubHooks")
            .field("subscription_filter", &self.subscription_filter.is_some())
            .field("default_validators", &self.default_validators.len())
            .field("tracers", &self.tracers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PubSubConfig::default().validate().expect("pubsub defaults");
        GossipSubConfig::default().validate().expect("gossipsub defaults");
    }

    #[test]
    fn degree_bounds_are_checked() {
        let bad = GossipSubConfig {
            mesh_n_low: 7,
            ..GossipSubConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = GossipSubConfig {
            mesh_outbound_min: 5,
            ..GossipSubConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = GossipSubConfig {
            history_gossip: 6,
            ..GossipSubConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn small_degree_helper_stays_valid() {
        let cfg = GossipSubConfig::default().with_degree(1, 1, 1);
        cfg.validate().expect("D=Dlo=Dhi=1");
        assert_eq!(cfg.mesh_outbound_min, 0);
        assert_eq!(cfg.mesh_d_score, 1);

        let cfg = GossipSubConfig::default().with_degree(3, 2, 4);
        cfg.validate().expect("small swarm");
    }

    #[test]
    fn invalid_scoring_is_rejected() {
        let thresholds = PeerScoreThresholds {
            gossip_threshold: 1.0,
            ..PeerScoreThresholds::default()
        };
        let cfg = GossipSubConfig::default().with_scoring(ScoringConfig::new(PeerScoreParams::default(), thresholds));
        assert!(cfg.validate().is_err());
    }
}
