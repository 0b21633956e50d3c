//! # Event Tracing
//!
//! Internal observers hook into the engine through [`RawTracer`]. Every method
//! has a no-op default so an observer only implements the events it needs.
//!
//! | Observer | Events used |
//! |----------|-------------|
//! | `PeerScore` | peers, graft/prune, validate/deliver/reject/duplicate |
//! | `GossipTracer` | validate/deliver/reject, peer removal |
//! | `PeerGater` | peers, validate/deliver/reject/duplicate |
//! | user tracers | anything |
//!
//! [`Tracer`] fans events out to all registered observers in registration
//! order and emits a `tracing` event for each, so running with
//! `RUST_LOG=meshsub=trace` yields a full protocol trace.

use std::sync::Arc;

use tracing::trace;

use crate::identity::PeerId;
use crate::messages::{ReceivedMessage, Rpc};
use crate::protocols::PeerConnection;
use crate::validation::RejectReason;

/// Synchronous observer of engine events.
///
/// Methods are invoked from the actor or validation workers and must not block.
pub trait RawTracer: Send + Sync {
    fn add_peer(&self, _conn: &PeerConnection) {}
    fn remove_peer(&self, _peer: &PeerId) {}
    fn join(&self, _topic: &str) {}
    fn leave(&self, _topic: &str) {}
    fn graft(&self, _peer: &PeerId, _topic: &str) {}
    fn prune(&self, _peer: &PeerId, _topic: &str) {}
    fn validate_message(&self, _msg: &ReceivedMessage) {}
    fn deliver_message(&self, _msg: &ReceivedMessage) {}
    fn reject_message(&self, _msg: &ReceivedMessage, _reason: RejectReason) {}
    fn duplicate_message(&self, _msg: &ReceivedMessage) {}
    fn throttle_peer(&self, _peer: &PeerId) {}
    fn recv_rpc(&self, _from: &PeerId, _rpc: &Rpc) {}
    fn send_rpc(&self, _to: &PeerId, _rpc: &Rpc) {}
    fn drop_rpc(&self, _to: &PeerId, _rpc: &Rpc) {}
    fn undeliverable_message(&self, _msg: &ReceivedMessage) {}
    fn publish_message(&self, _msg: &ReceivedMessage) {}
}

/// Fan-out over registered raw tracers.
#[derive(Clone, Default)]
pub struct Tracer {
    raw: Arc<Vec<Arc<dyn RawTracer>>>,
}

impl Tracer {
    pub fn new(raw: Vec<Arc<dyn RawTracer>>) -> Self {
        Self { raw: Arc::new(raw) }
    }

    pub fn add_peer(&self, conn: &PeerConnection) {
        trace!(peer = %conn.peer.short(), protocol = %conn.protocol, outbound = conn.outbound, "add peer");
        self.raw.iter().for_each(|t| t.add_peer(conn));
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        trace!(peer = %peer.short(), "remove peer");
        self.raw.iter().for_each(|t| t.remove_peer(peer));
    }

    pub fn join(&self, topic: &str) {
        trace!(topic = %topic, "join");
        self.raw.iter().for_each(|t| t.join(topic));
    }

    pub fn leave(&self, topic: &str) {
        trace!(topic = %topic, "leave");
        self.raw.iter().for_each(|t| t.leave(topic));
    }

    pub fn graft(&self, peer: &PeerId, topic: &str) {
        trace!(peer = %peer.short(), topic = %topic, "graft");
        self.raw.iter().for_each(|t| t.graft(peer, topic));
    }

    pub fn prune(&self, peer: &PeerId, topic: &str) {
        trace!(peer = %peer.short(), topic = %topic, "prune");
        self.raw.iter().for_each(|t| t.prune(peer, topic));
    }

    pub fn validate_message(&self, msg: &ReceivedMessage) {
        trace!(id = %msg.id, topic = %msg.topic(), "validate message");
        self.raw.iter().for_each(|t| t.validate_message(msg));
    }

    pub fn deliver_message(&self, msg: &ReceivedMessage) {
        trace!(id = %msg.id, topic = %msg.topic(), "deliver message");
        self.raw.iter().for_each(|t| t.deliver_message(msg));
    }

    pub fn reject_message(&self, msg: &ReceivedMessage, reason: RejectReason) {
        trace!(id = %msg.id, topic = %msg.topic(), from = %msg.received_from.short(), %reason, "reject message");
        self.raw.iter().for_each(|t| t.reject_message(msg, reason));
    }

    pub fn duplicate_message(&self, msg: &ReceivedMessage) {
        trace!(id = %msg.id, from = %msg.received_from.short(), "duplicate message");
        self.raw.iter().for_each(|t| t.duplicate_message(msg));
    }

    pub fn throttle_peer(&self, peer: &PeerId) {
        trace!(peer = %peer.short(), "throttle peer");
        self.raw.iter().for_each(|t| t.throttle_peer(peer));
    }

    pub fn recv_rpc(&self, from: &PeerId, rpc: &Rpc) {
        trace!(peer = %from.short(), msgs = rpc.publish.len(), subs = rpc.subscriptions.len(), "recv rpc");
        self.raw.iter().for_each(|t| t.recv_rpc(from, rpc));
    }

    pub fn send_rpc(&self, to: &PeerId, rpc: &Rpc) {
        trace!(peer = %to.short(), msgs = rpc.publish.len(), subs = rpc.subscriptions.len(), "send rpc");
        self.raw.iter().for_each(|t| t.send_rpc(to, rpc));
    }

    pub fn drop_rpc(&self, to: &PeerId, rpc: &Rpc) {
        trace!(peer = %to.short(), msgs = rpc.publish.len(), "drop rpc");
        self.raw.iter().for_each(|t| t.drop_rpc(to, rpc));
    }

    pub fn undeliverable_message(&self, msg: &ReceivedMessage) {
        trace!(id = %msg.id, topic = %msg.topic(), "undeliverable message");
        self.raw.iter().for_each(|t| t.undeliverable_message(msg));
    }

    pub fn publish_message(&self, msg: &ReceivedMessage) {
        trace!(id = %msg.id, topic = %msg.topic(), "publish message");
        self.raw.iter().for_each(|t| t.publish_message(msg));
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("observers", &self.raw.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl RawTracer for Recorder {
        fn join(&self, topic: &str) {
            self.events.lock().push(format!("join:{topic}"));
        }
        fn graft(&self, _peer: &PeerId, topic: &str) {
            self.events.lock().push(format!("graft:{topic}"));
        }
    }

    #[test]
    fn fans_out_in_registration_order() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let observers: Vec<Arc<dyn RawTracer>> = vec![a.clone(), b.clone()];
        let tracer = Tracer::new(observers);

        tracer.join("t");
        tracer.graft(&PeerId::from_seed(1), "t");
        tracer.leave("t");

        for r in [&a, &b] {
            assert_eq!(*r.events.lock(), vec!["join:t".to_string(), "graft:t".to_string()]);
        }
    }

    #[test]
    fn empty_tracer_is_noop() {
        let tracer = Tracer::default();
        tracer.throttle_peer(&PeerId::from_seed(1));
    }
}
