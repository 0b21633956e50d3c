//! Host trait definitions for the pubsub engine's networking seam.
//!
//! The engine never opens sockets itself. Connection management, stream
//! framing and identity are the host's job; the engine only needs to hand a
//! peer an RPC and occasionally ask for a connection.
//!
//! ## Seam
//!
//! | Direction | API | Purpose |
//! |-----------|-----|---------|
//! | engine → host | [`Host::send_rpc`] | Deliver one RPC on the peer's pubsub stream |
//! | engine → host | [`Host::connect`] | Dial a peer (direct peers, peer exchange, reconnect) |
//! | host → engine | `PubSub::add_peer` | A pubsub stream to a peer is open |
//! | host → engine | `PubSub::remove_peer` | The peer disconnected |
//! | host → engine | `PubSub::handle_rpc` | An RPC arrived from a peer |
//!
//! ## Design
//!
//! The trait is defined separately from implementations so the engine can be
//! driven by a real transport or by [`crate::memory::MemoryNetwork`] in tests
//! without either depending on the other.

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::PeerId;
use crate::messages::{ProtocolId, Rpc};

/// Transport operations the engine relies on.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Send an RPC to a connected peer.
    async fn send_rpc(&self, to: &PeerId, rpc: Rpc) -> Result<()>;

    /// Establish a connection to `peer`; the host reports success via `add_peer`.
    async fn connect(&self, peer: &PeerId) -> Result<()>;
}

/// A newly opened pubsub stream, as reported by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConnection {
    pub peer: PeerId,
    /// Protocol negotiated for the stream.
    pub protocol: ProtocolId,
    /// Whether we dialed the connection.
    pub outbound: bool,
    /// Remote addresses, used for IP colocation scoring and gating.
    pub ips: Vec<IpAddr>,
}

impl PeerConnection {
    pub fn new(peer: PeerId, protocol: impl Into<ProtocolId>, outbound: bool) -> Self {
        Self {
            peer,
            protocol: protocol.into(),
            outbound,
            ips: Vec::new(),
        }
    }

    pub fn with_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.ips = ips;
        self
    }
}
