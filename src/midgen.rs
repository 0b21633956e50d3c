//! # Message ID Generation
//!
//! Message IDs are the sole deduplication key. The default function:
//!
//! | Message | ID |
//! |---------|----|
//! | authored | `author (32 bytes) || seqno (big-endian u64)` |
//! | anonymous | `blake3(topic || 0x00 || data)` |
//!
//! Applications may override the function globally or per topic; the per-topic
//! table is behind its own lock so ids can be computed off the actor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::messages::{Message, MessageId};

pub type MessageIdFn = Arc<dyn Fn(&Message) -> MessageId + Send + Sync>;

pub fn default_message_id(msg: &Message) -> MessageId {
    match (msg.from, msg.seqno) {
        (Some(author), Some(seqno)) => {
            let mut id = Vec::with_capacity(40);
            id.extend_from_slice(author.as_bytes());
            id.extend_from_slice(&seqno.to_be_bytes());
            MessageId::new(id)
        }
        _ => {
            let mut hasher = blake3::Hasher::new();
            hasher.update(msg.topic.as_bytes());
            hasher.update(&[0u8]);
            hasher.update(&msg.data);
            MessageId::new(hasher.finalize().as_bytes().to_vec())
        }
    }
}

pub struct MessageIdGenerator {
    default: MessageIdFn,
    topic_fns: RwLock<HashMap<String, MessageIdFn>>,
}

impl MessageIdGenerator {
    pub fn new(default: MessageIdFn) -> Self {
        Self {
            default,
            topic_fns: RwLock::new(HashMap::new()),
        }
    }

    /// Override the id function for one topic.
    pub fn set(&self, topic: impl Into<String>, f: MessageIdFn) {
        self.topic_fns.write().insert(topic.into(), f);
    }

    pub fn unset(&self, topic: &str) {
        self.topic_fns.write().remove(topic);
    }

    pub fn id(&self, msg: &Message) -> MessageId {
        let topic_fn = self.topic_fns.read().get(&msg.topic).cloned();
        match topic_fn {
            Some(f) => f(msg),
            None => (self.default)(msg),
        }
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new(Arc::new(default_message_id))
    }
}

impl std::fmt::Debug for MessageIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIdGenerator")
            .field("topic_overrides", &self.topic_fns.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;

    fn msg(topic: &str, data: &[u8], author: Option<PeerId>, seqno: Option<u64>) -> Message {
        Message {
            from: author,
            seqno,
            topic: topic.into(),
            data: data.to_vec(),
            ..Message::default()
        }
    }

    #[test]
    fn authored_id_is_author_and_seqno() {
        let author = PeerId::from_seed(1);
        let id = default_message_id(&msg("t", b"x", Some(author), Some(7)));
        assert_eq!(&id.as_bytes()[..32], author.as_bytes());
        assert_eq!(&id.as_bytes()[32..], &7u64.to_be_bytes());
    }

    #[test]
    fn anonymous_id_is_content_hash() {
        let a = default_message_id(&msg("t", b"x", None, None));
        let b = default_message_id(&msg("t", b"x", None, None));
        let c = default_message_id(&msg("u", b"x", None, None));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn topic_override_takes_precedence() {
        let generator = MessageIdGenerator::default();
        generator.set("custom", Arc::new(|m: &Message| MessageId::new(m.data.clone())));

        let custom = msg("custom", b"abc", None, None);
        assert_eq!(generator.id(&custom), MessageId::from("abc"));

        let other = msg("other", b"abc", None, None);
        assert_eq!(generator.id(&other), default_message_id(&other));

        generator.unset("custom");
        assert_eq!(generator.id(&custom), default_message_id(&custom));
    }
}
