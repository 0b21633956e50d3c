//! # Wire Protocol Messages
//!
//! This module defines the RPC envelope exchanged between pubsub peers and the
//! helpers that keep outbound frames under the size ceiling.
//! Frames are serialized using bincode with size limits to prevent memory exhaustion.
//!
//! ## Envelope
//!
//! | Part | Type | Purpose |
//! |------|------|---------|
//! | Subscriptions | `SubOpts` | Announce / retract interest in a topic |
//! | Publish | `Message` | Application payloads |
//! | Control | `ControlMessage` | GRAFT, PRUNE, IHAVE, IWANT |
//!
//! ## Protocol IDs
//!
//! | Protocol | Mesh | Peer exchange |
//! |----------|------|---------------|
//! | `/meshsub/1.1.0` | yes | yes |
//! | `/meshsub/1.0.0` | yes | no |
//! | `/floodsub/1.0.0` | no | no |
//! | `/randomsub/1.0.0` | no | no |
//!
//! ## Fragmentation
//!
//! [`fragment_rpc`] splits an oversized RPC greedily: published messages
//! first, then subscriptions, then control. Control is sent whole when it fits,
//! otherwise GRAFT and PRUNE entries are packed individually and IWANT/IHAVE id
//! lists are bucketed so every fragment stays below the limit. Each fragment is
//! a self-contained RPC.

use std::sync::Arc;
use std::time::Instant;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::identity::PeerId;

pub const GOSSIPSUB_V11_PROTOCOL: &str = "/meshsub/1.1.0";
pub const GOSSIPSUB_V10_PROTOCOL: &str = "/meshsub/1.0.0";
pub const FLOODSUB_PROTOCOL: &str = "/floodsub/1.0.0";
pub const RANDOMSUB_PROTOCOL: &str = "/randomsub/1.0.0";

/// Negotiated protocol identifier.
pub type ProtocolId = String;

/// Upper bound on topic name length accepted from the wire or locally.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
}

fn sizing_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

/// Exact encoded length of a value under the wire encoding.
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    sizing_options()
        .serialized_size(value)
        .map_or(usize::MAX, |n| n as usize)
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(
    bytes: &[u8],
    limit: usize,
) -> Result<T, bincode::Error> {
    bincode_options(limit as u64).deserialize(bytes)
}

pub fn encode_rpc(rpc: &Rpc) -> Result<Vec<u8>, bincode::Error> {
    sizing_options().serialize(rpc)
}

pub fn decode_rpc(bytes: &[u8], limit: usize) -> Result<Rpc, bincode::Error> {
    deserialize_bounded(bytes, limit)
}

// ============================================================================
// Message IDs
// ============================================================================

/// Canonical message identifier; the sole deduplication key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Vec<u8>);

impl MessageId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.0[..self.0.len().min(8)];
        write!(f, "MessageId({})", hex::encode(shown))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for MessageId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rpc {
    pub subscriptions: Vec<SubOpts>,
    pub publish: Vec<Message>,
    pub control: Option<ControlMessage>,
}

impl Rpc {
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.publish.is_empty()
            && self.control.as_ref().is_none_or(ControlMessage::is_empty)
    }

    pub fn encoded_len(&self) -> usize {
        encoded_len(self)
    }

    pub fn with_control(control: ControlMessage) -> Self {
        Self {
            control: Some(control),
            ..Self::default()
        }
    }

    pub fn with_subscriptions(subscriptions: Vec<SubOpts>) -> Self {
        Self {
            subscriptions,
            ..Self::default()
        }
    }

    pub fn with_messages(publish: Vec<Message>) -> Self {
        Self {
            publish,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOpts {
    pub topic: String,
    pub subscribe: bool,
}

/// A published message as carried on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author. Absent for anonymous messages.
    pub from: Option<PeerId>,
    pub data: Vec<u8>,
    /// Per-author monotonic sequence number.
    pub seqno: Option<u64>,
    pub topic: String,
    pub signature: Option<Vec<u8>>,
    /// Explicit public key; when absent the author id is the key.
    pub key: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub ihave: Vec<ControlIHave>,
    pub iwant: Vec<ControlIWant>,
    pub graft: Vec<ControlGraft>,
    pub prune: Vec<ControlPrune>,
}

impl ControlMessage {
    pub fn is_empty(&self) -> bool {
        self.ihave.is_empty() && self.iwant.is_empty() && self.graft.is_empty() && self.prune.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlIHave {
    pub topic: String,
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlIWant {
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlGraft {
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlPrune {
    pub topic: String,
    /// Peer exchange records.
    pub peers: Vec<PeerInfo>,
    /// Backoff in seconds before the pruned peer may GRAFT again.
    pub backoff: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub signed_peer_record: Option<Vec<u8>>,
}

// ============================================================================
// Received Messages
// ============================================================================

/// A message inside the engine: the wire envelope plus local metadata.
///
/// Shared as `Arc<ReceivedMessage>` between validation, the message cache,
/// routing and subscribers.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub message: Message,
    /// Peer that forwarded the message to us (ourselves for local publishes).
    pub received_from: PeerId,
    /// Delivered locally only, never forwarded.
    pub local: bool,
    pub received_at: Instant,
}

impl ReceivedMessage {
    pub fn new(id: MessageId, message: Message, received_from: PeerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            message,
            received_from,
            local: false,
            received_at: Instant::now(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn data(&self) -> &[u8] {
        &self.message.data
    }

    pub fn author(&self) -> Option<PeerId> {
        self.message.from
    }
}

// ============================================================================
// Fragmentation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// A single published message cannot fit in any fragment.
    MessageTooLarge { size: usize, limit: usize },
}

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragmentError::MessageTooLarge { size, limit } => {
                write!(f, "message of {} bytes exceeds frame limit of {} bytes", size, limit)
            }
        }
    }
}

impl std::error::Error for FragmentError {}

/// Accumulates fragments, tracking each fragment's exact encoded size.
struct Fragmenter {
    out: Vec<Rpc>,
    sizes: Vec<usize>,
    limit: usize,
    empty_rpc: usize,
    empty_control: usize,
}

impl Fragmenter {
    fn new(limit: usize) -> Self {
        let empty_rpc = encoded_len(&Rpc::default());
        Self {
            out: vec![Rpc::default()],
            sizes: vec![empty_rpc],
            limit,
            empty_rpc,
            empty_control: encoded_len(&ControlMessage::default()),
        }
    }

    /// Returns the fragment that can take `add` more bytes, opening a new one if needed.
    fn slot(&mut self, add: usize, with_control: bool) -> &mut Rpc {
        let mut idx = self.out.len() - 1;
        let mut needed = add;
        if with_control && self.out[idx].control.is_none() {
            needed += self.empty_control;
        }
        if self.sizes[idx] + needed >= self.limit && !self.out[idx].is_empty() {
            self.out.push(Rpc::default());
            self.sizes.push(self.empty_rpc);
            idx += 1;
            needed = add + if with_control { self.empty_control } else { 0 };
        }
        self.sizes[idx] += needed;
        let rpc = &mut self.out[idx];
        if with_control && rpc.control.is_none() {
            rpc.control = Some(ControlMessage::default());
        }
        rpc
    }

    fn control_slot(&mut self, add: usize) -> &mut ControlMessage {
        self.slot(add, true)
            .control
            .get_or_insert_with(ControlMessage::default)
    }

    fn finish(self) -> Vec<Rpc> {
        self.out.into_iter().filter(|rpc| !rpc.is_empty()).collect()
    }
}

/// Split `rpc` into self-contained RPCs whose encoding stays below `limit` bytes.
pub fn fragment_rpc(rpc: Rpc, limit: usize) -> Result<Vec<Rpc>, FragmentError> {
    if rpc.encoded_len() < limit {
        return Ok(vec![rpc]);
    }

    let mut frag = Fragmenter::new(limit);

    for msg in rpc.publish {
        let size = encoded_len(&msg);
        if frag.empty_rpc + size >= limit {
            return Err(FragmentError::MessageTooLarge { size, limit });
        }
        frag.slot(size, false).publish.push(msg);
    }

    for sub in rpc.subscriptions {
        let size = encoded_len(&sub);
        frag.slot(size, false).subscriptions.push(sub);
    }

    let Some(ctl) = rpc.control else {
        return Ok(frag.finish());
    };

    let ctl_size = encoded_len(&ctl);
    if frag.empty_rpc + ctl_size < limit {
        let slot = frag.slot(ctl_size, false);
        slot.control = Some(ctl);
        return Ok(frag.finish());
    }

    for graft in ctl.graft {
        let size = encoded_len(&graft);
        frag.control_slot(size).graft.push(graft);
    }

    for prune in ctl.prune {
        let size = encoded_len(&prune);
        frag.control_slot(size).prune.push(prune);
    }

    for iwant in ctl.iwant {
        let overhead = frag.empty_rpc + frag.empty_control + encoded_len(&ControlIWant::default());
        for bucket in bucket_message_ids(iwant.message_ids, limit.saturating_sub(overhead)) {
            let entry = ControlIWant { message_ids: bucket };
            let size = encoded_len(&entry);
            frag.control_slot(size).iwant.push(entry);
        }
    }

    for ihave in ctl.ihave {
        let empty = ControlIHave {
            topic: ihave.topic.clone(),
            message_ids: Vec::new(),
        };
        let overhead = frag.empty_rpc + frag.empty_control + encoded_len(&empty);
        for bucket in bucket_message_ids(ihave.message_ids, limit.saturating_sub(overhead)) {
            let entry = ControlIHave {
                topic: ihave.topic.clone(),
                message_ids: bucket,
            };
            let size = encoded_len(&entry);
            frag.control_slot(size).ihave.push(entry);
        }
    }

    Ok(frag.finish())
}

/// Group ids into buckets whose encoded id lists each stay below `budget` bytes.
/// Ids that cannot fit even alone are dropped with a warning.
pub fn bucket_message_ids(ids: Vec<MessageId>, budget: usize) -> Vec<Vec<MessageId>> {
    let mut buckets: Vec<Vec<MessageId>> = Vec::new();
    let mut current: Vec<MessageId> = Vec::new();
    let mut current_size = 0usize;

    for id in ids {
        let cost = encoded_len(&id);
        if cost >= budget {
            warn!(id_len = id.len(), budget, "message id too large for any fragment; dropping");
            continue;
        }
        if current_size + cost >= budget {
            buckets.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += cost;
        current.push(id);
    }
    if !current.is_empty() {
        buckets.push(current);
    }
    buckets
}

/// Whether a topic name is acceptable.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_TOPIC_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize, len: usize) -> Vec<MessageId> {
        (0..n)
            .map(|i| {
                let mut bytes = vec![0u8; len];
                bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());
                MessageId::new(bytes)
            })
            .collect()
    }

    fn msg(topic: &str, len: usize) -> Message {
        Message {
            data: vec![7u8; len],
            topic: topic.to_string(),
            ..Message::default()
        }
    }

    #[test]
    fn bounded_decode_accepts_normal_and_rejects_garbage() {
        let rpc = Rpc::with_messages(vec![msg("t", 100)]);
        let bytes = encode_rpc(&rpc).expect("encode");
        assert_eq!(bytes.len(), rpc.encoded_len());
        assert_eq!(decode_rpc(&bytes, 1024).expect("decode"), rpc);

        assert!(decode_rpc(&[0xFF, 0xFE, 0xFD], 1024).is_err());
        assert!(decode_rpc(&bytes, 16).is_err());
    }

    #[test]
    fn small_rpc_is_not_fragmented() {
        let rpc = Rpc::with_messages(vec![msg("t", 10)]);
        let frags = fragment_rpc(rpc.clone(), 1024).expect("fragment");
        assert_eq!(frags, vec![rpc]);
    }

    #[test]
    fn messages_are_packed_under_limit() {
        let rpc = Rpc::with_messages((0..10).map(|_| msg("t", 300)).collect());
        let frags = fragment_rpc(rpc, 1024).expect("fragment");
        assert!(frags.len() > 1);
        let total: usize = frags.iter().map(|f| f.publish.len()).sum();
        assert_eq!(total, 10);
        for f in &frags {
            assert!(f.encoded_len() < 1024);
        }
    }

    #[test]
    fn single_oversized_message_is_an_error() {
        let rpc = Rpc::with_messages(vec![msg("t", 2048)]);
        assert!(matches!(
            fragment_rpc(rpc, 1024),
            Err(FragmentError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn ihave_ids_are_bucketed() {
        let control = ControlMessage {
            ihave: vec![ControlIHave {
                topic: "t".into(),
                message_ids: ids(200, 32),
            }],
            graft: vec![ControlGraft { topic: "g".into() }],
            ..ControlMessage::default()
        };
        let frags = fragment_rpc(Rpc::with_control(control), 1024).expect("fragment");
        assert!(frags.len() > 1);

        let mut seen = 0;
        let mut grafts = 0;
        for f in &frags {
            assert!(f.encoded_len() < 1024, "fragment too large: {}", f.encoded_len());
            let ctl = f.control.as_ref().expect("control fragment");
            grafts += ctl.graft.len();
            seen += ctl.ihave.iter().map(|h| h.message_ids.len()).sum::<usize>();
        }
        assert_eq!(seen, 200);
        assert_eq!(grafts, 1);
    }

    #[test]
    fn oversized_ids_are_skipped() {
        let mut list = ids(3, 16);
        list.push(MessageId::new(vec![1u8; 4096]));
        let buckets = bucket_message_ids(list, 512);
        let total: usize = buckets.iter().map(Vec::len).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("blocks"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
    }
}
