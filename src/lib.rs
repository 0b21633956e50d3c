//! # Meshsub - Topic-Based Publish/Subscribe Engine
//!
//! Meshsub disseminates messages among peers that share interest in named
//! topics. It provides:
//!
//! - **GossipSub v1.1**: per-topic meshes of bounded degree, lazy IHAVE/IWANT
//!   gossip repair, fanout for publish-only topics, peer exchange on PRUNE
//! - **FloodSub / RandomSub**: simple flooding and random-sample routers
//! - **Peer Scoring**: per-topic delivery accounting, IP colocation and
//!   behavioural penalties, graylisting
//! - **Validation**: signature policy plus inline and asynchronous validators
//!   with throttling and timeouts
//! - **Admission Control**: probabilistic peer gater under validation pressure
//!
//! ## Architecture
//!
//! The engine follows the **Actor Pattern**:
//! - [`PubSub`] is a cheap, cloneable handle; one private actor owns the peer
//!   roster, topic membership and subscriber lists
//! - Routers implement [`PubSubRouter`] and are driven synchronously by the
//!   actor, which lends them the [`Overlay`]
//! - Validation, score decay, gater decay and PX connects run as independent
//!   tasks and report back through bounded channels
//! - Transport is abstracted behind [`Host`]; [`MemoryNetwork`] runs many
//!   engines in one process
//!
//! ## Security Model
//!
//! - Ed25519 identities; peer id = public key
//! - Messages are signed by default and verified against the declared author
//! - Every queue is bounded; overflow drops and traces instead of blocking
//! - Misbehaving peers lose score, get pruned, throttled and finally graylisted
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `pubsub` | Public API, coordinating actor, peer writers |
//! | `router` | Router trait and the actor-owned overlay |
//! | `gossipsub` | Mesh router with gossip, scoring and gating |
//! | `floodsub` | Flooding router |
//! | `randomsub` | Random-sample router |
//! | `validation` | Validator pipeline and reject reasons |
//! | `score` / `score_params` | Peer scoring engine and its parameters |
//! | `peer_gater` | Random early drop under validation pressure |
//! | `gossip_tracer` | IWANT promise tracking |
//! | `mcache` | Sliding message window for gossip |
//! | `seen` / `midgen` | Duplicate suppression and message ids |
//! | `backoff` | Reconnect backoff |
//! | `filter` / `blacklist` | Subscription filters and peer blacklists |
//! | `identity` / `signing` | Keypairs, peer ids, message signatures |
//! | `messages` | Wire types, bounded codec, fragmentation |
//! | `protocols` | Host seam |
//! | `memory` | In-process host |
//! | `trace` | Event tracing hooks |
//! | `config` | Engine, router and scoring configuration |

mod backoff;
mod blacklist;
mod config;
mod filter;
mod floodsub;
mod gossip_tracer;
mod gossipsub;
mod identity;
mod mcache;
mod memory;
mod messages;
mod midgen;
mod peer_gater;
mod protocols;
mod pubsub;
mod randomsub;
mod router;
mod score;
mod score_params;
mod seen;
mod signing;
mod trace;
mod validation;

pub use backoff::{Backoff, BackoffConfig, BackoffExhausted};
pub use blacklist::{Blacklist, MapBlacklist, TimeCachedBlacklist};
pub use config::{GossipSubConfig, PubSubConfig, PubSubHooks, ScoringConfig};
pub use filter::{
    AllowlistFilter, LimitFilter, PeerFilter, PredicateFilter, SubscriptionFilter, TooManySubscriptions,
    default_peer_filter,
};
pub use floodsub::FloodSubRouter;
pub use gossipsub::{GossipSubFeature, GossipSubRouter, supports};
pub use identity::{Keypair, PeerId};
pub use memory::{MemoryHost, MemoryNetwork};
pub use messages::{
    ControlGraft, ControlIHave, ControlIWant, ControlMessage, ControlPrune, FLOODSUB_PROTOCOL,
    GOSSIPSUB_V10_PROTOCOL, GOSSIPSUB_V11_PROTOCOL, Message, MessageId, PeerInfo, ProtocolId,
    RANDOMSUB_PROTOCOL, ReceivedMessage, Rpc, SubOpts, decode_rpc, encode_rpc,
};
pub use midgen::{MessageIdFn, MessageIdGenerator, default_message_id};
pub use peer_gater::PeerGaterParams;
pub use protocols::{Host, PeerConnection};
pub use pubsub::{
    PeerEvent, PeerEventType, PubSub, PublishOptions, RelayHandle, Subscription, Topic, TopicEventHandler,
};
pub use randomsub::RandomSubRouter;
pub use router::{AcceptStatus, Overlay, PubSubRouter, RouterContext};
pub use score::{PeerScoreSnapshot, ScoreInspectFn, TopicScoreSnapshot};
pub use score_params::{IpNet, PeerScoreParams, PeerScoreThresholds, TopicScoreParams};
pub use signing::{SignatureError, SignaturePolicy};
pub use trace::{RawTracer, Tracer};
pub use validation::{RejectReason, ValidationError, ValidationResult, Validator, ValidatorOptions};
