//! Subscription filters.
//!
//! A filter decides which topics we may join locally and which remote
//! subscription announcements we track. Incoming lists are deduplicated:
//! the first entry per topic wins, and a topic announced with conflicting
//! subscribe flags in the same RPC is dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::identity::PeerId;
use crate::messages::SubOpts;

/// Peer filter consulted before announcing a topic to, or accepting it from, a peer.
pub type PeerFilter = Arc<dyn Fn(&PeerId, &str) -> bool + Send + Sync>;

pub fn default_peer_filter() -> PeerFilter {
    Arc::new(|_, _| true)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TooManySubscriptions {
    pub count: usize,
    pub limit: usize,
}

impl fmt::Display for TooManySubscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "too many subscriptions in rpc ({} > {})", self.count, self.limit)
    }
}

impl std::error::Error for TooManySubscriptions {}

pub trait SubscriptionFilter: Send + Sync {
    /// Whether we may join `topic` locally.
    fn can_subscribe(&self, topic: &str) -> bool;

    /// Filter the subscription list of an incoming RPC.
    ///
    /// An error drops the whole RPC.
    fn filter_incoming(&self, from: &PeerId, subs: Vec<SubOpts>) -> Result<Vec<SubOpts>, TooManySubscriptions>;
}

/// Keep subscriptions accepted by `allow`, deduplicated per topic.
pub fn filter_subscriptions(subs: Vec<SubOpts>, allow: impl Fn(&str) -> bool) -> Vec<SubOpts> {
    let mut accepted: HashMap<String, bool> = HashMap::new();
    let mut order = Vec::new();
    for sub in subs {
        if !allow(&sub.topic) {
            continue;
        }
        match accepted.get(&sub.topic) {
            Some(&existing) if existing != sub.subscribe => {
                accepted.remove(&sub.topic);
            }
            Some(_) => {}
            None => {
                accepted.insert(sub.topic.clone(), sub.subscribe);
                order.push(sub.topic);
            }
        }
    }

    let mut out = Vec::with_capacity(accepted.len());
    for topic in order {
        if let Some(subscribe) = accepted.remove(&topic) {
            out.push(SubOpts { topic, subscribe });
        }
    }
    out
}

/// Fixed allow-list of topics.
#[derive(Clone, Debug, Default)]
pub struct AllowlistFilter {
    topics: HashSet<String>,
}

impl AllowlistFilter {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }
}

impl SubscriptionFilter for AllowlistFilter {
    fn can_subscribe(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    fn filter_incoming(&self, _from: &PeerId, subs: Vec<SubOpts>) -> Result<Vec<SubOpts>, TooManySubscriptions> {
        Ok(filter_subscriptions(subs, |t| self.can_subscribe(t)))
    }
}

/// Topic predicate, e.g. a namespace prefix check.
pub struct PredicateFilter {
    predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl PredicateFilter {
    pub fn new(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

impl SubscriptionFilter for PredicateFilter {
    fn can_subscribe(&self, topic: &str) -> bool {
        (self.predicate)(topic)
    }

    fn filter_incoming(&self, _from: &PeerId, subs: Vec<SubOpts>) -> Result<Vec<SubOpts>, TooManySubscriptions> {
        Ok(filter_subscriptions(subs, |t| self.can_subscribe(t)))
    }
}

/// Wraps another filter and refuses RPCs carrying too many subscriptions.
pub struct LimitFilter<F> {
    inner: F,
    limit: usize,
}

impl<F: SubscriptionFilter> LimitFilter<F> {
    pub fn new(inner: F, limit: usize) -> Self {
        Self { inner, limit }
    }
}

impl<F: SubscriptionFilter> SubscriptionFilter for LimitFilter<F> {
    fn can_subscribe(&self, topic: &str) -> bool {
        self.inner.can_subscribe(topic)
    }

    fn filter_incoming(&self, from: &PeerId, subs: Vec<SubOpts>) -> Result<Vec<SubOpts>, TooManySubscriptions> {
        if subs.len() > self.limit {
            return Err(TooManySubscriptions {
                count: subs.len(),
                limit: self.limit,
            });
        }
        self.inner.filter_incoming(from, subs)
    }
}
