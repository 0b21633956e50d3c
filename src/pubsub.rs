//! # PubSub Engine
//!
//! [`PubSub`] is a cheap handle to one actor task that owns the peer roster,
//! announced topic membership and local subscriber lists. Every mutation is a
//! [`Command`] processed in order by the actor loop, so none of them race.
//!
//! | Task | Count | Role |
//! |------|-------|------|
//! | actor | 1 | commands, inbound RPCs, delivery, heartbeat |
//! | peer writer | 1 per peer | drains the peer's outbound queue into the host |
//! | validation worker | `validate_workers` | remote message validation |
//! | router background | router-defined | score decay, gater decay, PX connects |
//!
//! ## Inbound Path
//!
//! 1. Drop RPCs from unknown peers, apply the subscription filter
//! 2. Record announced subscriptions and emit topic peer events
//! 3. Ask the router whether to take messages, control only, or nothing
//! 4. Per message: blacklist, size, signature policy, self-origin, seen cache
//! 5. Validate; accepted messages reach local subscribers, then the router
//!
//! ## Local Publish
//!
//! The message is built, signed and validated in the caller's task, so a
//! validator rejection surfaces as the publish error. Only accepted messages
//! enter the actor.
//!
//! ## Announcements
//!
//! A topic is announced when its combined subscription and relay count goes
//! from zero to one, and withdrawn on the way back. An announcement dropped on
//! a full peer queue is retried after a random 1-1000 ms if still relevant.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::backoff::Backoff;
use crate::blacklist::Blacklist;
use crate::config::{PubSubConfig, PubSubHooks};
use crate::filter::SubscriptionFilter;
use crate::identity::{Keypair, PeerId, initial_seqno};
use crate::messages::{
    Message, MessageId, ProtocolId, ReceivedMessage, Rpc, SubOpts, encoded_len, is_valid_topic,
};
use crate::midgen::MessageIdGenerator;
use crate::protocols::{Host, PeerConnection};
use crate::router::{AcceptStatus, Overlay, PubSubRouter, RouterContext};
use crate::score::PeerScoreSnapshot;
use crate::score_params::TopicScoreParams;
use crate::seen::SeenMessages;
use crate::signing::{SignaturePolicy, sign_message};
use crate::trace::Tracer;
use crate::validation::{RejectReason, Validation, ValidationError, Validator, ValidatorOptions};

/// Poll period while a publish waits for the router to report enough peers.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound of the random delay before retrying a dropped announcement.
pub const MAX_ANNOUNCE_RETRY_DELAY_MS: u64 = 1000;

// ============================================================================
// Commands
// ============================================================================

enum Command {
    AddPeer {
        conn: PeerConnection,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    RemovePeer(PeerId),
    /// The writer for connection `generation` failed to send.
    PeerFailed {
        peer: PeerId,
        generation: u64,
    },
    IncomingRpc {
        from: PeerId,
        rpc: Rpc,
    },
    Join {
        topic: String,
        create_only: bool,
        reply: oneshot::Sender<anyhow::Result<Arc<TopicState>>>,
    },
    CloseTopic {
        state: Arc<TopicState>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<(u64, mpsc::Receiver<Arc<ReceivedMessage>>)>,
    },
    Unsubscribe {
        topic: String,
        id: u64,
    },
    AddRelay {
        topic: String,
        reply: oneshot::Sender<()>,
    },
    RemoveRelay {
        topic: String,
    },
    AddEventHandler {
        topic: String,
        log: Arc<EventLog>,
        reply: oneshot::Sender<u64>,
    },
    RemoveEventHandler {
        topic: String,
        id: u64,
    },
    Topics(oneshot::Sender<Vec<String>>),
    ListPeers {
        topic: Option<String>,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    MeshPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    BlacklistPeer(PeerId),
    EnoughPeers {
        topic: String,
        suggested: usize,
        reply: oneshot::Sender<bool>,
    },
    SetTopicScoreParams {
        topic: String,
        params: TopicScoreParams,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    PeerScores(oneshot::Sender<HashMap<PeerId, PeerScoreSnapshot>>),
    /// Deferred retry of an announcement dropped on a full queue.
    AnnounceRetry {
        peer: PeerId,
        topic: String,
        subscribe: bool,
    },
    Quit,
}

// ============================================================================
// Public Handle
// ============================================================================

struct Inner {
    local: PeerId,
    keypair: Keypair,
    policy: SignaturePolicy,
    max_message_size: usize,
    seqno: AtomicU64,
    midgen: Arc<MessageIdGenerator>,
    validation: Validation,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

/// Handle to a running pubsub engine. Cheap to clone.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl PubSub {
    /// Start the engine over `host` with the given router.
    ///
    /// Must be called from within a Tokio runtime. The actor stops when
    /// [`PubSub::shutdown`] is called or every handle is dropped.
    pub fn spawn(
        host: Arc<dyn Host>,
        keypair: Keypair,
        router: impl PubSubRouter,
        config: PubSubConfig,
        hooks: PubSubHooks,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid pubsub configuration")?;
        let local = keypair.peer_id();
        if host.local_peer_id() != local {
            bail!(
                "host identity {} does not match keypair identity {}",
                host.local_peer_id().short(),
                local.short()
            );
        }

        let cancel = CancellationToken::new();
        let seen = SeenMessages::new(config.seen_messages_ttl);
        let mut overlay = Overlay::new(local, seen.clone(), hooks.peer_filter.clone(), config.max_message_size);

        let mut router: Box<dyn PubSubRouter> = Box::new(router);
        let protocols = router.protocols();
        let mut observers = router
            .attach(RouterContext {
                local,
                host: Arc::clone(&host),
                cancel: cancel.child_token(),
            })
            .context("failed to attach router")?;
        observers.extend(hooks.tracers.iter().cloned());
        let tracer = Tracer::new(observers);
        overlay.set_tracer(tracer.clone());

        let (deliver_tx, deliver_rx) = mpsc::channel(config.validate_queue_size);
        let (validation, _workers) = Validation::spawn(
            &config,
            hooks.default_validators.clone(),
            seen.clone(),
            tracer.clone(),
            deliver_tx,
            cancel.child_token(),
        );
        let midgen = Arc::new(MessageIdGenerator::new(Arc::clone(&hooks.message_id_fn)));

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_size);
        let actor = Actor {
            local,
            host,
            overlay,
            router,
            protocols,
            validation: validation.clone(),
            seen,
            midgen: Arc::clone(&midgen),
            blacklist: Arc::clone(&hooks.blacklist),
            subscription_filter: hooks.subscription_filter.clone(),
            tracer,
            topics: HashMap::new(),
            subs: HashMap::new(),
            relays: HashMap::new(),
            generations: HashMap::new(),
            reconnect: Backoff::new(config.reconnect.clone()),
            next_id: 0,
            cmd_tx: cmd_tx.downgrade(),
            cancel: cancel.clone(),
            config: config.clone(),
        };
        tokio::spawn(actor.run(cmd_rx, deliver_rx));

        info!(local = %local.short(), policy = ?config.signature_policy, "pubsub started");

        Ok(Self {
            inner: Arc::new(Inner {
                local,
                keypair,
                policy: config.signature_policy,
                max_message_size: config.max_message_size,
                seqno: AtomicU64::new(initial_seqno()),
                midgen,
                validation,
                cmd_tx,
                cancel,
            }),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local
    }

    /// Per-topic message id functions, shared with the actor.
    pub fn message_id_generator(&self) -> &MessageIdGenerator {
        &self.inner.midgen
    }

    async fn send(&self, cmd: Command) -> anyhow::Result<()> {
        if self.inner.cancel.is_cancelled() {
            bail!("pubsub is shut down");
        }
        tokio::select! {
            _ = self.inner.cancel.cancelled() => bail!("pubsub is shut down"),
            res = self.inner.cmd_tx.send(cmd) => res.map_err(|_| anyhow!("pubsub actor closed")),
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        tokio::select! {
            _ = self.inner.cancel.cancelled() => bail!("pubsub is shut down"),
            res = rx => res.map_err(|_| anyhow!("pubsub actor closed")),
        }
    }

    /// Join `topic`, failing if it is already joined.
    pub async fn join(&self, topic: &str) -> anyhow::Result<Topic> {
        self.join_topic(topic, true).await
    }

    async fn join_topic(&self, topic: &str, create_only: bool) -> anyhow::Result<Topic> {
        let state = self
            .request(|reply| Command::Join {
                topic: topic.to_string(),
                create_only,
                reply,
            })
            .await??;
        Ok(Topic {
            pubsub: self.clone(),
            state,
        })
    }

    /// Subscribe to `topic`, joining it first if needed.
    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<Subscription> {
        self.join_topic(topic, false).await?.subscribe().await
    }

    /// Publish on `topic`, joining it first if needed.
    pub async fn publish(&self, topic: &str, data: impl Into<Vec<u8>>) -> anyhow::Result<MessageId> {
        self.join_topic(topic, false).await?.publish(data).await
    }

    /// Topics with at least one local subscription.
    pub async fn topics(&self) -> anyhow::Result<Vec<String>> {
        self.request(Command::Topics).await
    }

    /// Connected peers, or the peers that announced `topic`.
    pub async fn list_peers(&self, topic: Option<&str>) -> anyhow::Result<Vec<PeerId>> {
        self.request(|reply| Command::ListPeers {
            topic: topic.map(str::to_string),
            reply,
        })
        .await
    }

    /// Peers we eagerly forward `topic` to.
    pub async fn mesh_peers(&self, topic: &str) -> anyhow::Result<Vec<PeerId>> {
        self.request(|reply| Command::MeshPeers {
            topic: topic.to_string(),
            reply,
        })
        .await
    }

    /// Blacklist `peer` and disconnect it from the overlay.
    pub async fn blacklist_peer(&self, peer: PeerId) -> anyhow::Result<()> {
        self.send(Command::BlacklistPeer(peer)).await
    }

    pub fn register_topic_validator(
        &self,
        topic: &str,
        validator: Validator,
        opts: ValidatorOptions,
    ) -> anyhow::Result<()> {
        self.inner.validation.add_validator(topic, validator, opts)
    }

    pub fn unregister_topic_validator(&self, topic: &str) -> anyhow::Result<()> {
        self.inner.validation.remove_validator(topic)
    }

    pub async fn peer_scores(&self) -> anyhow::Result<HashMap<PeerId, PeerScoreSnapshot>> {
        self.request(Command::PeerScores).await
    }

    /// Host callback: a pubsub stream to `conn.peer` is open.
    pub async fn add_peer(&self, conn: PeerConnection) -> anyhow::Result<()> {
        self.request(|reply| Command::AddPeer { conn, reply }).await?
    }

    /// Host callback: the connection to `peer` is gone.
    pub async fn remove_peer(&self, peer: PeerId) -> anyhow::Result<()> {
        self.send(Command::RemovePeer(peer)).await
    }

    /// Host callback: an RPC arrived from `from`.
    pub async fn handle_rpc(&self, from: PeerId, rpc: Rpc) -> anyhow::Result<()> {
        self.send(Command::IncomingRpc { from, rpc }).await
    }

    /// Stop the actor and every background task.
    pub async fn shutdown(&self) {
        let _ = self.inner.cmd_tx.send(Command::Quit).await;
        self.inner.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("local", &self.inner.local)
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Topics
// ============================================================================

struct TopicState {
    name: String,
    closed: AtomicBool,
}

/// Options for [`Topic::publish_with`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PublishOptions {
    /// Deliver to local subscribers only; do not forward.
    pub local: bool,
    /// Wait until the router has this many topic peers (0 = router default).
    pub min_topic_peers: Option<usize>,
}

impl PublishOptions {
    pub fn local_only(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn with_readiness(mut self, min_topic_peers: usize) -> Self {
        self.min_topic_peers = Some(min_topic_peers);
        self
    }
}

/// A joined topic.
#[derive(Clone)]
pub struct Topic {
    pubsub: PubSub,
    state: Arc<TopicState>,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.state.closed.load(Ordering::Acquire) {
            bail!("topic {} is closed", self.state.name);
        }
        Ok(())
    }

    pub async fn subscribe(&self) -> anyhow::Result<Subscription> {
        self.ensure_open()?;
        let (id, rx) = self
            .pubsub
            .request(|reply| Command::Subscribe {
                topic: self.state.name.clone(),
                reply,
            })
            .await?;
        Ok(Subscription {
            topic: self.state.name.clone(),
            id,
            rx,
            cmd_tx: self.pubsub.inner.cmd_tx.clone(),
            cancelled: false,
        })
    }

    /// Announce and forward the topic without delivering it locally.
    pub async fn relay(&self) -> anyhow::Result<RelayHandle> {
        self.ensure_open()?;
        self.pubsub
            .request(|reply| Command::AddRelay {
                topic: self.state.name.clone(),
                reply,
            })
            .await?;
        Ok(RelayHandle {
            topic: self.state.name.clone(),
            cmd_tx: self.pubsub.inner.cmd_tx.clone(),
            cancelled: false,
        })
    }

    pub async fn publish(&self, data: impl Into<Vec<u8>>) -> anyhow::Result<MessageId> {
        self.publish_with(data, PublishOptions::default()).await
    }

    /// Build, sign and validate a message, then hand it to the actor.
    ///
    /// With a readiness requirement this waits until the router reports enough
    /// peers; wrap the call in `tokio::time::timeout` to bound the wait.
    pub async fn publish_with(&self, data: impl Into<Vec<u8>>, opts: PublishOptions) -> anyhow::Result<MessageId> {
        self.ensure_open()?;
        let inner = &self.pubsub.inner;

        let mut message = Message {
            data: data.into(),
            topic: self.state.name.clone(),
            ..Message::default()
        };
        if inner.policy.must_sign() {
            message.from = Some(inner.local);
            message.seqno = Some(inner.seqno.fetch_add(1, Ordering::Relaxed));
            sign_message(&inner.keypair, &mut message);
        }
        if encoded_len(&message) > inner.max_message_size {
            return Err(ValidationError::from(RejectReason::MessageTooLarge).into());
        }

        if let Some(min_peers) = opts.min_topic_peers {
            self.wait_ready(min_peers).await?;
        }

        let id = inner.midgen.id(&message);
        let msg = Arc::new(ReceivedMessage {
            id: id.clone(),
            message,
            received_from: inner.local,
            local: opts.local,
            received_at: Instant::now(),
        });
        inner.validation.push_local(msg).await?;
        Ok(id)
    }

    async fn wait_ready(&self, min_peers: usize) -> anyhow::Result<()> {
        loop {
            let ready = self
                .pubsub
                .request(|reply| Command::EnoughPeers {
                    topic: self.state.name.clone(),
                    suggested: min_peers,
                    reply,
                })
                .await?;
            if ready {
                return Ok(());
            }
            tokio::select! {
                _ = self.pubsub.inner.cancel.cancelled() => bail!("pubsub is shut down"),
                _ = tokio::time::sleep(READINESS_POLL_INTERVAL) => {}
            }
        }
    }

    /// Stream of peers joining and leaving this topic.
    ///
    /// The handler starts with a join event for every peer already in the
    /// topic. A join followed by a leave of the same peer before either is
    /// read cancels out.
    pub async fn event_handler(&self) -> anyhow::Result<TopicEventHandler> {
        self.ensure_open()?;
        let log = Arc::new(EventLog::default());
        let id = self
            .pubsub
            .request(|reply| Command::AddEventHandler {
                topic: self.state.name.clone(),
                log: Arc::clone(&log),
                reply,
            })
            .await?;
        Ok(TopicEventHandler {
            topic: self.state.name.clone(),
            id,
            log,
            cmd_tx: self.pubsub.inner.cmd_tx.clone(),
            cancelled: false,
        })
    }

    /// Peers that announced this topic.
    pub async fn list_peers(&self) -> anyhow::Result<Vec<PeerId>> {
        self.pubsub.list_peers(Some(&self.state.name)).await
    }

    pub async fn set_score_params(&self, params: TopicScoreParams) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.pubsub
            .request(|reply| Command::SetTopicScoreParams {
                topic: self.state.name.clone(),
                params,
                reply,
            })
            .await?
    }

    /// Leave the topic handle. Fails while subscriptions, relays or event
    /// handlers are still active.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.state.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.pubsub
            .request(|reply| Command::CloseTopic {
                state: Arc::clone(&self.state),
                reply,
            })
            .await?
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.state.name)
            .field("closed", &self.state.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Send `cmd` from a synchronous context such as `Drop`.
fn send_detached(cmd_tx: &mpsc::Sender<Command>, cmd: Command) {
    if let Err(TrySendError::Full(cmd)) = cmd_tx.try_send(cmd)
        && let Ok(handle) = tokio::runtime::Handle::try_current()
    {
        let cmd_tx = cmd_tx.clone();
        handle.spawn(async move {
            let _ = cmd_tx.send(cmd).await;
        });
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Local delivery queue for one topic. Cancelled on drop.
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<Arc<ReceivedMessage>>,
    cmd_tx: mpsc::Sender<Command>,
    cancelled: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next delivered message. Fails once the subscription is cancelled and
    /// drained, or the engine shut down.
    pub async fn next(&mut self) -> anyhow::Result<Arc<ReceivedMessage>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("subscription to {} cancelled", self.topic))
    }

    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.rx.close();
        send_detached(
            &self.cmd_tx,
            Command::Unsubscribe {
                topic: self.topic.clone(),
                id: self.id,
            },
        );
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

/// Keeps a topic relayed while alive.
#[derive(Debug)]
pub struct RelayHandle {
    topic: String,
    cmd_tx: mpsc::Sender<Command>,
    cancelled: bool,
}

impl RelayHandle {
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        send_detached(
            &self.cmd_tx,
            Command::RemoveRelay {
                topic: self.topic.clone(),
            },
        );
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::AddPeer { .. } => "AddPeer",
            Command::RemovePeer(_) => "RemovePeer",
            Command::PeerFailed { .. } => "PeerFailed",
            Command::IncomingRpc { .. } => "IncomingRpc",
            Command::Join { .. } => "Join",
            Command::CloseTopic { .. } => "CloseTopic",
            Command::Subscribe { .. } => "Subscribe",
            Command::Unsubscribe { .. } => "Unsubscribe",
            Command::AddRelay { .. } => "AddRelay",
            Command::RemoveRelay { .. } => "RemoveRelay",
            Command::AddEventHandler { .. } => "AddEventHandler",
            Command::RemoveEventHandler { .. } => "RemoveEventHandler",
            Command::Topics(_) => "Topics",
            Command::ListPeers { .. } => "ListPeers",
            Command::MeshPeers { .. } => "MeshPeers",
            Command::BlacklistPeer(_) => "BlacklistPeer",
            Command::EnoughPeers { .. } => "EnoughPeers",
            Command::SetTopicScoreParams { .. } => "SetTopicScoreParams",
            Command::PeerScores(_) => "PeerScores",
            Command::AnnounceRetry { .. } => "AnnounceRetry",
            Command::Quit => "Quit",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Topic Peer Events
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerEventType {
    Join,
    Leave,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerEvent {
    pub kind: PeerEventType,
    pub peer: PeerId,
}

/// Pending events, at most one per peer.
#[derive(Default)]
struct EventLog {
    events: Mutex<HashMap<PeerId, PeerEventType>>,
    notify: Notify,
    closed: AtomicBool,
}

impl EventLog {
    fn push(&self, peer: PeerId, kind: PeerEventType) {
        let mut events = self.events.lock();
        match events.get(&peer) {
            None => {
                events.insert(peer, kind);
                drop(events);
                self.notify.notify_one();
            }
            Some(pending) if *pending != kind => {
                events.remove(&peer);
            }
            Some(_) => {}
        }
    }

    fn pop(&self) -> Option<PeerEvent> {
        let mut events = self.events.lock();
        let peer = *events.keys().next()?;
        let kind = events.remove(&peer)?;
        Some(PeerEvent { kind, peer })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

pub struct TopicEventHandler {
    topic: String,
    id: u64,
    log: Arc<EventLog>,
    cmd_tx: mpsc::Sender<Command>,
    cancelled: bool,
}

impl TopicEventHandler {
    pub async fn next_peer_event(&self) -> anyhow::Result<PeerEvent> {
        loop {
            if let Some(event) = self.log.pop() {
                return Ok(event);
            }
            if self.log.closed.load(Ordering::Acquire) {
                bail!("event handler for {} cancelled", self.topic);
            }
            self.log.notify.notified().await;
        }
    }

    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.log.close();
        send_detached(
            &self.cmd_tx,
            Command::RemoveEventHandler {
                topic: self.topic.clone(),
                id: self.id,
            },
        );
    }
}

impl Drop for TopicEventHandler {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for TopicEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicEventHandler")
            .field("topic", &self.topic)
            .field("pending", &self.log.events.lock().len())
            .finish()
    }
}

// ============================================================================
// Actor
// ============================================================================

struct JoinedTopic {
    state: Arc<TopicState>,
    handlers: HashMap<u64, Arc<EventLog>>,
}

struct Actor {
    local: PeerId,
    config: PubSubConfig,
    host: Arc<dyn Host>,
    overlay: Overlay,
    router: Box<dyn PubSubRouter>,
    protocols: Vec<ProtocolId>,
    validation: Validation,
    seen: SeenMessages,
    midgen: Arc<MessageIdGenerator>,
    blacklist: Arc<dyn Blacklist>,
    subscription_filter: Option<Arc<dyn SubscriptionFilter>>,
    tracer: Tracer,
    topics: HashMap<String, JoinedTopic>,
    subs: HashMap<String, HashMap<u64, mpsc::Sender<Arc<ReceivedMessage>>>>,
    relays: HashMap<String, usize>,
    /// Connection generation per peer; failures of older writers are ignored.
    generations: HashMap<PeerId, u64>,
    reconnect: Backoff,
    next_id: u64,
    cmd_tx: mpsc::WeakSender<Command>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut deliver_rx: mpsc::Receiver<Arc<ReceivedMessage>>,
    ) {
        let schedule = self.router.heartbeat_schedule();
        let (delay, period) = schedule.unwrap_or((Duration::from_secs(1), Duration::from_secs(1)));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + delay, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let cleanup_every = self.reconnect.cleanup_interval();
        let mut cleanup = tokio::time::interval_at(tokio::time::Instant::now() + cleanup_every, cleanup_every);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                Some(msg) = deliver_rx.recv() => {
                    self.publish_message(msg);
                }
                _ = heartbeat.tick(), if schedule.is_some() => {
                    self.router.heartbeat(&self.overlay);
                }
                _ = cleanup.tick() => {
                    self.reconnect.cleanup();
                }
            }
        }

        self.cancel.cancel();
        for joined in self.topics.values() {
            for log in joined.handlers.values() {
                log.close();
            }
        }
        debug!(local = %self.local.short(), "pubsub actor quitting");
    }

    fn handle_command(&mut self, cmd: Command) {
        trace!(command = ?cmd, "actor command");
        match cmd {
            Command::AddPeer { conn, reply } => {
                let _ = reply.send(self.handle_add_peer(conn));
            }
            Command::RemovePeer(peer) => {
                self.drop_peer(&peer);
            }
            Command::PeerFailed { peer, generation } => {
                if self.generations.get(&peer) == Some(&generation) && self.drop_peer(&peer) {
                    self.schedule_reconnect(peer);
                }
            }
            Command::IncomingRpc { from, rpc } => self.handle_incoming_rpc(from, rpc),
            Command::Join {
                topic,
                create_only,
                reply,
            } => {
                let _ = reply.send(self.handle_join(topic, create_only));
            }
            Command::CloseTopic { state, reply } => {
                let _ = reply.send(self.handle_close_topic(&state));
            }
            Command::Subscribe { topic, reply } => {
                let _ = reply.send(self.handle_subscribe(topic));
            }
            Command::Unsubscribe { topic, id } => self.handle_unsubscribe(&topic, id),
            Command::AddRelay { topic, reply } => {
                self.handle_add_relay(topic);
                let _ = reply.send(());
            }
            Command::RemoveRelay { topic } => self.handle_remove_relay(&topic),
            Command::AddEventHandler { topic, log, reply } => {
                let _ = reply.send(self.handle_add_event_handler(&topic, log));
            }
            Command::RemoveEventHandler { topic, id } => {
                if let Some(joined) = self.topics.get_mut(&topic) {
                    joined.handlers.remove(&id);
                }
            }
            Command::Topics(reply) => {
                let mut topics: Vec<String> = self.subs.keys().cloned().collect();
                topics.sort();
                let _ = reply.send(topics);
            }
            Command::ListPeers { topic, reply } => {
                let mut peers: Vec<PeerId> = match topic {
                    None => self.overlay.peers().copied().collect(),
                    Some(topic) => self
                        .overlay
                        .topic_peers(&topic)
                        .map(|peers| peers.iter().copied().collect())
                        .unwrap_or_default(),
                };
                peers.sort();
                let _ = reply.send(peers);
            }
            Command::MeshPeers { topic, reply } => {
                let _ = reply.send(self.router.mesh_peers(&topic));
            }
            Command::BlacklistPeer(peer) => {
                if self.blacklist.add(peer) {
                    debug!(peer = %peer.short(), "blacklisting peer");
                }
                self.drop_peer(&peer);
            }
            Command::EnoughPeers {
                topic,
                suggested,
                reply,
            } => {
                let _ = reply.send(self.router.enough_peers(&self.overlay, &topic, suggested));
            }
            Command::SetTopicScoreParams { topic, params, reply } => {
                let _ = reply.send(self.router.set_topic_score_params(&topic, params));
            }
            Command::PeerScores(reply) => {
                let _ = reply.send(self.router.peer_scores());
            }
            Command::AnnounceRetry { peer, topic, subscribe } => {
                self.handle_announce_retry(peer, topic, subscribe);
            }
            Command::Quit => {}
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_active(&self, topic: &str) -> bool {
        self.subs.contains_key(topic) || self.relays.contains_key(topic)
    }

    // ------------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------------

    fn handle_add_peer(&mut self, conn: PeerConnection) -> anyhow::Result<()> {
        let peer = conn.peer;
        if peer == self.local {
            bail!("refusing pubsub stream to ourselves");
        }
        if self.blacklist.contains(&peer) {
            debug!(peer = %peer.short(), "ignoring connection from blacklisted peer");
            bail!("peer {} is blacklisted", peer.short());
        }
        if !self.protocols.contains(&conn.protocol) {
            bail!("unsupported protocol {}", conn.protocol);
        }
        if self.overlay.is_connected(&peer) {
            debug!(peer = %peer.short(), "already have connection to peer");
            return Ok(());
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.config.peer_outbound_queue_size);
        let generation = self.next_id();
        self.generations.insert(peer, generation);
        tokio::spawn(peer_writer(
            Arc::clone(&self.host),
            peer,
            queue_rx,
            self.cmd_tx.clone(),
            generation,
            self.cancel.child_token(),
        ));

        self.overlay.insert_peer(&conn, queue_tx);
        self.tracer.add_peer(&conn);
        let hello = self.hello_packet(&peer);
        if !hello.is_empty() {
            self.overlay.send_or_drop(&peer, hello);
        }
        self.router.add_peer(&self.overlay, &conn);
        debug!(peer = %peer.short(), protocol = %conn.protocol, outbound = conn.outbound, "peer added");
        Ok(())
    }

    /// Our active topics, sent to every new peer.
    fn hello_packet(&self, peer: &PeerId) -> Rpc {
        let topics: BTreeSet<&String> = self.subs.keys().chain(self.relays.keys()).collect();
        let subscriptions = topics
            .into_iter()
            .filter(|topic| self.overlay.peer_filter(peer, topic))
            .map(|topic| SubOpts {
                topic: topic.clone(),
                subscribe: true,
            })
            .collect();
        Rpc::with_subscriptions(subscriptions)
    }

    /// Forget `peer`. Returns `false` if it was not connected.
    fn drop_peer(&mut self, peer: &PeerId) -> bool {
        if !self.overlay.is_connected(peer) {
            return false;
        }
        self.generations.remove(peer);
        let left = self.overlay.remove_peer(peer);
        for topic in &left {
            self.notify_event(topic, *peer, PeerEventType::Leave);
        }
        self.tracer.remove_peer(peer);
        self.router.remove_peer(&self.overlay, peer);
        debug!(peer = %peer.short(), topics = left.len(), "peer removed");
        true
    }

    fn schedule_reconnect(&mut self, peer: PeerId) {
        if self.blacklist.contains(&peer) {
            return;
        }
        let delay = match self.reconnect.update_and_get(&peer) {
            Ok(delay) => delay,
            Err(err) => {
                debug!(peer = %peer.short(), error = %err, "giving up reconnecting to peer");
                return;
            }
        };
        debug!(peer = %peer.short(), delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let host = Arc::clone(&self.host);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(err) = host.connect(&peer).await {
                        debug!(peer = %peer.short(), error = %err, "reconnect failed");
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Topics and Subscriptions
    // ------------------------------------------------------------------------

    fn handle_join(&mut self, topic: String, create_only: bool) -> anyhow::Result<Arc<TopicState>> {
        if !is_valid_topic(&topic) {
            bail!("invalid topic name");
        }
        if let Some(filter) = &self.subscription_filter
            && !filter.can_subscribe(&topic)
        {
            bail!("topic {} is not allowed by the subscription filter", topic);
        }
        if let Some(joined) = self.topics.get(&topic) {
            if create_only {
                bail!("topic {} already exists", topic);
            }
            return Ok(Arc::clone(&joined.state));
        }
        let state = Arc::new(TopicState {
            name: topic.clone(),
            closed: AtomicBool::new(false),
        });
        self.topics.insert(
            topic,
            JoinedTopic {
                state: Arc::clone(&state),
                handlers: HashMap::new(),
            },
        );
        Ok(state)
    }

    fn handle_close_topic(&mut self, state: &Arc<TopicState>) -> anyhow::Result<()> {
        let Some(joined) = self.topics.get(&state.name) else {
            return Ok(());
        };
        if !Arc::ptr_eq(&joined.state, state) {
            return Ok(());
        }
        if !joined.handlers.is_empty() || self.is_active(&state.name) {
            bail!(
                "cannot close topic {}: outstanding event handlers or subscriptions",
                state.name
            );
        }
        self.topics.remove(&state.name);
        state.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn activate(&mut self, topic: &str) {
        if !self.is_active(topic) {
            self.announce(topic, true);
            self.router.join(&self.overlay, topic);
        }
    }

    fn deactivate(&mut self, topic: &str) {
        if !self.is_active(topic) {
            self.announce(topic, false);
            self.router.leave(&self.overlay, topic);
        }
    }

    fn handle_subscribe(&mut self, topic: String) -> (u64, mpsc::Receiver<Arc<ReceivedMessage>>) {
        self.activate(&topic);
        let (tx, rx) = mpsc::channel(self.config.subscription_buffer);
        let id = self.next_id();
        self.subs.entry(topic).or_default().insert(id, tx);
        (id, rx)
    }

    fn handle_unsubscribe(&mut self, topic: &str, id: u64) {
        let Some(subs) = self.subs.get_mut(topic) else {
            return;
        };
        if subs.remove(&id).is_none() {
            return;
        }
        if subs.is_empty() {
            self.subs.remove(topic);
            self.deactivate(topic);
        }
    }

    fn handle_add_relay(&mut self, topic: String) {
        self.activate(&topic);
        *self.relays.entry(topic).or_default() += 1;
    }

    fn handle_remove_relay(&mut self, topic: &str) {
        let Some(count) = self.relays.get_mut(topic) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.relays.remove(topic);
            self.deactivate(topic);
        }
    }

    fn handle_add_event_handler(&mut self, topic: &str, log: Arc<EventLog>) -> u64 {
        let id = self.next_id();
        if let Some(peers) = self.overlay.topic_peers(topic) {
            for peer in peers {
                log.push(*peer, PeerEventType::Join);
            }
        }
        match self.topics.get_mut(topic) {
            Some(joined) => {
                joined.handlers.insert(id, log);
            }
            None => log.close(),
        }
        id
    }

    fn notify_event(&self, topic: &str, peer: PeerId, kind: PeerEventType) {
        if let Some(joined) = self.topics.get(topic) {
            for log in joined.handlers.values() {
                log.push(peer, kind);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Announcements
    // ------------------------------------------------------------------------

    fn announce(&mut self, topic: &str, subscribe: bool) {
        let peers: Vec<PeerId> = self.overlay.peers().copied().collect();
        for peer in peers {
            if self.overlay.peer_filter(&peer, topic) {
                self.send_announce(peer, topic, subscribe);
            }
        }
    }

    fn send_announce(&self, peer: PeerId, topic: &str, subscribe: bool) {
        let rpc = Rpc::with_subscriptions(vec![SubOpts {
            topic: topic.to_string(),
            subscribe,
        }]);
        let traced = rpc.clone();
        match self.overlay.try_send(&peer, rpc) {
            Ok(()) => self.tracer.send_rpc(&peer, &traced),
            Err(TrySendError::Full(rpc)) => {
                debug!(peer = %peer.short(), topic = %topic, "can't send announce message to peer: queue full; scheduling retry");
                self.tracer.drop_rpc(&peer, &rpc);
                self.schedule_announce_retry(peer, topic.to_string(), subscribe);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn schedule_announce_retry(&self, peer: PeerId, topic: String, subscribe: bool) {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(1..=MAX_ANNOUNCE_RETRY_DELAY_MS));
        let cmd_tx = self.cmd_tx.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(tx) = cmd_tx.upgrade() {
                        let _ = tx.send(Command::AnnounceRetry { peer, topic, subscribe }).await;
                    }
                }
            }
        });
    }

    fn handle_announce_retry(&self, peer: PeerId, topic: String, subscribe: bool) {
        if !self.overlay.is_connected(&peer) {
            return;
        }
        if self.is_active(&topic) == subscribe {
            self.send_announce(peer, &topic, subscribe);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn handle_incoming_rpc(&mut self, from: PeerId, mut rpc: Rpc) {
        if !self.overlay.is_connected(&from) {
            debug!(peer = %from.short(), "ignoring rpc from unknown peer");
            return;
        }
        self.tracer.recv_rpc(&from, &rpc);

        let mut subscriptions = std::mem::take(&mut rpc.subscriptions);
        if !subscriptions.is_empty()
            && let Some(filter) = &self.subscription_filter
        {
            match filter.filter_incoming(&from, subscriptions) {
                Ok(filtered) => subscriptions = filtered,
                Err(err) => {
                    debug!(peer = %from.short(), error = %err, "subscription filter rejected rpc");
                    return;
                }
            }
        }
        for sub in &subscriptions {
            if sub.subscribe {
                if self.overlay.add_topic_peer(&sub.topic, from) {
                    self.notify_event(&sub.topic, from, PeerEventType::Join);
                }
            } else if self.overlay.remove_topic_peer(&sub.topic, &from) {
                self.notify_event(&sub.topic, from, PeerEventType::Leave);
            }
        }
        rpc.subscriptions = subscriptions;

        let publish = std::mem::take(&mut rpc.publish);
        match self.router.accept_from(&from) {
            AcceptStatus::None => {
                debug!(peer = %from.short(), "received rpc from graylisted peer; ignoring");
                return;
            }
            AcceptStatus::Control => {
                if !publish.is_empty() {
                    debug!(peer = %from.short(), messages = publish.len(), "peer is throttled; ignoring messages");
                    self.tracer.throttle_peer(&from);
                }
            }
            AcceptStatus::All => {
                for message in publish {
                    if !self.is_active(&message.topic) {
                        trace!(peer = %from.short(), topic = %message.topic, "message in topic we are not subscribed to; ignoring");
                        continue;
                    }
                    self.push_msg(from, message);
                }
            }
        }

        self.router.handle_rpc(&self.overlay, &from, &rpc);
    }

    fn push_msg(&mut self, from: PeerId, message: Message) {
        let id = self.midgen.id(&message);
        let msg = ReceivedMessage::new(id, message, from);

        if self.blacklist.contains(&from) {
            debug!(peer = %from.short(), "dropping message from blacklisted peer");
            self.tracer.reject_message(&msg, RejectReason::BlacklistedPeer);
            return;
        }
        if let Some(author) = msg.author()
            && self.blacklist.contains(&author)
        {
            debug!(peer = %from.short(), author = %author.short(), "dropping message from blacklisted source");
            self.tracer.reject_message(&msg, RejectReason::BlacklistedSource);
            return;
        }
        if encoded_len(&msg.message) > self.config.max_message_size {
            debug!(peer = %from.short(), "dropping oversized message");
            self.tracer.reject_message(&msg, RejectReason::MessageTooLarge);
            return;
        }
        if self.validation.check_signing_policy(&msg).is_err() {
            return;
        }
        // SECURITY: a remote peer may not inject messages under our identity.
        if msg.author() == Some(self.local) {
            debug!(peer = %from.short(), "dropping message claiming to be from ourselves");
            self.tracer.reject_message(&msg, RejectReason::SelfOrigin);
            return;
        }
        if self.overlay.has_seen(&msg.id) {
            self.tracer.duplicate_message(&msg);
            return;
        }

        if self.validation.push(Arc::clone(&msg)) && self.seen.mark_seen(&msg.id) {
            self.publish_message(msg);
        }
    }

    /// Deliver an accepted message locally and forward it.
    fn publish_message(&mut self, msg: Arc<ReceivedMessage>) {
        self.tracer.deliver_message(&msg);
        self.notify_subs(&msg);
        if !msg.local {
            self.router.publish(&self.overlay, &msg);
        }
    }

    fn notify_subs(&self, msg: &Arc<ReceivedMessage>) {
        let Some(subs) = self.subs.get(msg.topic()) else {
            return;
        };
        for tx in subs.values() {
            match tx.try_send(Arc::clone(msg)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(topic = %msg.topic(), "subscriber too slow; dropping message");
                    self.tracer.undeliverable_message(msg);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Drain one peer's outbound queue into the host.
async fn peer_writer(
    host: Arc<dyn Host>,
    peer: PeerId,
    mut queue: mpsc::Receiver<Rpc>,
    cmd_tx: mpsc::WeakSender<Command>,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        let rpc = tokio::select! {
            _ = cancel.cancelled() => break,
            rpc = queue.recv() => match rpc {
                Some(rpc) => rpc,
                None => break,
            },
        };
        if let Err(err) = host.send_rpc(&peer, rpc).await {
            debug!(peer = %peer.short(), error = %err, "error writing rpc to peer");
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx.send(Command::PeerFailed { peer, generation }).await;
            }
            break;
        }
    }
    trace!(peer = %peer.short(), "peer writer exiting");
}
