//! # Message Validation Pipeline
//!
//! Every message id is validated at most once. The seen cache is marked as
//! the message enters validation, so concurrent duplicates are classified as
//! duplicates instead of being validated twice.
//!
//! ## Stages
//!
//! | Stage | Where | Failure |
//! |-------|-------|---------|
//! | signing policy | actor, before the seen check | `MissingSignature`, `UnexpectedSignature`, `UnexpectedAuthInfo` |
//! | front queue | bounded `mpsc`, served by a worker pool | `ValidationQueueFull` (never charged to the peer) |
//! | signature check | worker | `InvalidSignature` |
//! | inline validators | worker, sequential | `ValidationFailed` / `ValidationIgnored` |
//! | async validators | spawned under the global throttle | `ValidationThrottled` when the throttle is exhausted |
//!
//! ## Combining Results
//!
//! All applicable validators (defaults first, then the topic validator) must
//! accept. A reject short-circuits. An ignore sticks unless a later validator
//! rejects. A per-validator concurrency overflow yields "throttled", which is
//! forwarded like an ignore but reported separately.
//!
//! Local publishes run every validator synchronously in the publisher's task
//! and surface failures as [`ValidationError`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::PubSubConfig;
use crate::identity::PeerId;
use crate::messages::ReceivedMessage;
use crate::seen::SeenMessages;
use crate::signing::{SignaturePolicy, verify_message};
use crate::trace::Tracer;

pub const DEFAULT_VALIDATE_QUEUE_SIZE: usize = 32;
pub const DEFAULT_VALIDATE_CONCURRENCY: usize = 1024;
pub const DEFAULT_VALIDATE_THROTTLE: usize = 8192;

// ============================================================================
// Results and Errors
// ============================================================================

/// Verdict of a single validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    Accept,
    /// Invalid: dropped and charged to the forwarding peer.
    Reject,
    /// Not forwarded, not penalized.
    Ignore,
}

/// Why a message was dropped before delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    MissingSignature,
    InvalidSignature,
    UnexpectedSignature,
    UnexpectedAuthInfo,
    SelfOrigin,
    BlacklistedPeer,
    BlacklistedSource,
    ValidationQueueFull,
    ValidationThrottled,
    ValidationFailed,
    ValidationIgnored,
    MessageTooLarge,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::MissingSignature => "missing signature",
            RejectReason::InvalidSignature => "invalid signature",
            RejectReason::UnexpectedSignature => "unexpected signature",
            RejectReason::UnexpectedAuthInfo => "unexpected auth info",
            RejectReason::SelfOrigin => "self originated message",
            RejectReason::BlacklistedPeer => "blacklisted peer",
            RejectReason::BlacklistedSource => "blacklisted source",
            RejectReason::ValidationQueueFull => "validation queue full",
            RejectReason::ValidationThrottled => "validation throttled",
            RejectReason::ValidationFailed => "validation failed",
            RejectReason::ValidationIgnored => "validation ignored",
            RejectReason::MessageTooLarge => "message too large",
        };
        f.write_str(s)
    }
}

/// A locally published message failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub reason: RejectReason,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message rejected: {}", self.reason)
    }
}

impl std::error::Error for ValidationError {}

impl From<RejectReason> for ValidationError {
    fn from(reason: RejectReason) -> Self {
        Self { reason }
    }
}

// ============================================================================
// Validators
// ============================================================================

pub type ValidatorFuture = Pin<Box<dyn Future<Output = ValidationResult> + Send>>;
type InlineFn = Arc<dyn Fn(&PeerId, &ReceivedMessage) -> ValidationResult + Send + Sync>;
type AsyncFn = Arc<dyn Fn(PeerId, Arc<ReceivedMessage>) -> ValidatorFuture + Send + Sync>;

/// A message predicate, resolved to one shape at registration.
///
/// Boolean predicates map `true` to accept and `false` to reject.
#[derive(Clone)]
pub enum Validator {
    /// Runs on the validation worker; must be cheap.
    Inline(InlineFn),
    /// Spawned under the global throttle and the validator's concurrency limit.
    Async(AsyncFn),
}

impl Validator {
    pub fn inline<F>(f: F) -> Self
    where
        F: Fn(&PeerId, &ReceivedMessage) -> ValidationResult + Send + Sync + 'static,
    {
        Validator::Inline(Arc::new(f))
    }

    pub fn inline_bool<F>(f: F) -> Self
    where
        F: Fn(&PeerId, &ReceivedMessage) -> bool + Send + Sync + 'static,
    {
        Validator::Inline(Arc::new(move |from, msg| verdict(f(from, msg))))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(PeerId, Arc<ReceivedMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ValidationResult> + Send + 'static,
    {
        Validator::Async(Arc::new(move |from, msg| Box::pin(f(from, msg))))
    }

    pub fn asynchronous_bool<F, Fut>(f: F) -> Self
    where
        F: Fn(PeerId, Arc<ReceivedMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let f = Arc::new(f);
        Validator::Async(Arc::new(move |from, msg| {
            let fut = f(from, msg);
            Box::pin(async move { verdict(fut.await) })
        }))
    }

    fn is_inline(&self) -> bool {
        matches!(self, Validator::Inline(_))
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Inline(_) => f.write_str("Validator::Inline"),
            Validator::Async(_) => f.write_str("Validator::Async"),
        }
    }
}

fn verdict(ok: bool) -> ValidationResult {
    if ok {
        ValidationResult::Accept
    } else {
        ValidationResult::Reject
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ValidatorOptions {
    /// Async validators still running after this are treated as ignore.
    pub timeout: Option<Duration>,
    /// Concurrent executions allowed for this validator (default 1024).
    pub concurrency: Option<usize>,
}

impl ValidatorOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

struct RegisteredValidator {
    topic: String,
    validator: Validator,
    timeout: Option<Duration>,
    concurrency: Arc<Semaphore>,
}

impl RegisteredValidator {
    fn new(topic: String, validator: Validator, opts: ValidatorOptions, default_concurrency: usize) -> Self {
        let permits = opts.concurrency.filter(|c| *c > 0).unwrap_or(default_concurrency);
        Self {
            topic,
            validator,
            timeout: opts.timeout.filter(|t| !t.is_zero()),
            concurrency: Arc::new(Semaphore::new(permits)),
        }
    }

    async fn run(&self, from: PeerId, msg: &Arc<ReceivedMessage>) -> ValidationResult {
        let start = Instant::now();
        let result = match &self.validator {
            Validator::Inline(f) => f(&from, msg),
            Validator::Async(f) => {
                let fut = f(from, Arc::clone(msg));
                match self.timeout {
                    Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                        debug!(topic = %self.topic, "validator timed out");
                        ValidationResult::Ignore
                    }),
                    None => fut.await,
                }
            }
        };
        trace!(topic = %self.topic, elapsed_us = start.elapsed().as_micros() as u64, ?result, "validation done");
        result
    }
}

/// Internal combined verdict; `Throttled` never comes from a validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Accept,
    Reject,
    Ignore,
    Throttled,
}

impl From<ValidationResult> for Outcome {
    fn from(r: ValidationResult) -> Self {
        match r {
            ValidationResult::Accept => Outcome::Accept,
            ValidationResult::Reject => Outcome::Reject,
            ValidationResult::Ignore => Outcome::Ignore,
        }
    }
}

fn combine(acc: Outcome, next: Outcome) -> Outcome {
    match (acc, next) {
        (Outcome::Reject, _) | (_, Outcome::Reject) => Outcome::Reject,
        (Outcome::Throttled, _) | (_, Outcome::Throttled) => Outcome::Throttled,
        (Outcome::Ignore, _) | (_, Outcome::Ignore) => Outcome::Ignore,
        _ => Outcome::Accept,
    }
}

// ============================================================================
// Pipeline
// ============================================================================

struct ValidateRequest {
    vals: Vec<Arc<RegisteredValidator>>,
    msg: Arc<ReceivedMessage>,
}

struct Shared {
    topic_vals: RwLock<HashMap<String, Arc<RegisteredValidator>>>,
    default_vals: Vec<Arc<RegisteredValidator>>,
    default_concurrency: usize,
    throttle: Arc<Semaphore>,
    policy: SignaturePolicy,
    seen: SeenMessages,
    tracer: Tracer,
    deliver_tx: mpsc::Sender<Arc<ReceivedMessage>>,
    cancel: CancellationToken,
}

/// Handle to the validation pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Validation {
    shared: Arc<Shared>,
    queue_tx: mpsc::Sender<ValidateRequest>,
}

impl Validation {
    /// Start the worker pool. Accepted messages are sent on `deliver_tx`.
    pub fn spawn(
        config: &PubSubConfig,
        default_validators: Vec<(Validator, ValidatorOptions)>,
        seen: SeenMessages,
        tracer: Tracer,
        deliver_tx: mpsc::Sender<Arc<ReceivedMessage>>,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let default_concurrency = config.validate_concurrency.max(1);
        let default_vals = default_validators
            .into_iter()
            .map(|(v, opts)| Arc::new(RegisteredValidator::new(String::new(), v, opts, default_concurrency)))
            .collect();

        let shared = Arc::new(Shared {
            topic_vals: RwLock::new(HashMap::new()),
            default_vals,
            default_concurrency,
            throttle: Arc::new(Semaphore::new(config.validate_throttle.max(1))),
            policy: config.signature_policy,
            seen,
            tracer,
            deliver_tx,
            cancel,
        });

        let (queue_tx, queue_rx) = mpsc::channel(config.validate_queue_size.max(1));
        let queue_rx = Arc::new(AsyncMutex::new(queue_rx));
        let workers = (0..config.validate_workers.max(1))
            .map(|_| tokio::spawn(validate_worker(Arc::clone(&shared), Arc::clone(&queue_rx))))
            .collect();

        (Self { shared, queue_tx }, workers)
    }

    pub fn add_validator(&self, topic: &str, validator: Validator, opts: ValidatorOptions) -> anyhow::Result<()> {
        let mut vals = self.shared.topic_vals.write();
        if vals.contains_key(topic) {
            bail!("duplicate validator for topic {}", topic);
        }
        let val = RegisteredValidator::new(topic.to_string(), validator, opts, self.shared.default_concurrency);
        vals.insert(topic.to_string(), Arc::new(val));
        debug!(topic = %topic, "registered topic validator");
        Ok(())
    }

    pub fn remove_validator(&self, topic: &str) -> anyhow::Result<()> {
        match self.shared.topic_vals.write().remove(topic) {
            Some(_) => Ok(()),
            None => bail!("no validator for topic {}", topic),
        }
    }

    /// Enforce the signature policy before the message id is even computed.
    pub fn check_signing_policy(&self, msg: &ReceivedMessage) -> Result<(), ValidationError> {
        let reason = match self.shared.policy {
            SignaturePolicy::StrictSign if msg.message.signature.is_none() => Some(RejectReason::MissingSignature),
            SignaturePolicy::StrictNoSign if msg.message.signature.is_some() => Some(RejectReason::UnexpectedSignature),
            SignaturePolicy::StrictNoSign
                if msg.message.seqno.is_some() || msg.message.from.is_some() || msg.message.key.is_some() =>
            {
                Some(RejectReason::UnexpectedAuthInfo)
            }
            _ => None,
        };
        match reason {
            Some(reason) => {
                self.shared.tracer.reject_message(msg, reason);
                Err(reason.into())
            }
            None => Ok(()),
        }
    }

    /// Queue a remote message for validation.
    ///
    /// Returns `true` when no validation work is needed and the caller should
    /// mark the message seen and deliver it directly.
    pub fn push(&self, msg: Arc<ReceivedMessage>) -> bool {
        let vals = self.shared.validators_for(msg.topic());
        if vals.is_empty() && msg.message.signature.is_none() {
            return true;
        }

        let from = msg.received_from;
        if let Err(err) = self.queue_tx.try_send(ValidateRequest { vals, msg }) {
            let req = match err {
                mpsc::error::TrySendError::Full(req) | mpsc::error::TrySendError::Closed(req) => req,
            };
            debug!(peer = %from.short(), "validation queue full; dropping message");
            self.shared.tracer.reject_message(&req.msg, RejectReason::ValidationQueueFull);
        }
        false
    }

    /// Validate a locally published message in the caller's task.
    pub async fn push_local(&self, msg: Arc<ReceivedMessage>) -> Result<(), ValidationError> {
        self.shared.tracer.publish_message(&msg);
        self.check_signing_policy(&msg)?;
        let vals = self.shared.validators_for(msg.topic());
        self.shared.validate(vals, msg, true).await
    }

    pub fn topic_validators(&self) -> Vec<String> {
        self.shared.topic_vals.read().keys().cloned().collect()
    }
}

impl fmt::Debug for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validation")
            .field("topic_validators", &self.shared.topic_vals.read().len())
            .field("default_validators", &self.shared.default_vals.len())
            .finish()
    }
}

async fn validate_worker(shared: Arc<Shared>, queue: Arc<AsyncMutex<mpsc::Receiver<ValidateRequest>>>) {
    loop {
        let req = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            req = async { queue.lock().await.recv().await } => req,
        };
        let Some(req) = req else { break };
        // Remote failures are already traced.
        let _ = shared.validate(req.vals, req.msg, false).await;
    }
    trace!("validation worker quitting");
}

impl Shared {
    fn validators_for(&self, topic: &str) -> Vec<Arc<RegisteredValidator>> {
        let mut vals = self.default_vals.clone();
        if let Some(val) = self.topic_vals.read().get(topic) {
            vals.push(Arc::clone(val));
        }
        vals
    }

    async fn validate(
        self: &Arc<Self>,
        vals: Vec<Arc<RegisteredValidator>>,
        msg: Arc<ReceivedMessage>,
        synchronous: bool,
    ) -> Result<(), ValidationError> {
        let from = msg.received_from;

        if msg.message.signature.is_some()
            && let Err(err) = verify_message(&msg.message)
        {
            debug!(peer = %from.short(), error = %err, "message signature validation failed");
            self.tracer.reject_message(&msg, RejectReason::InvalidSignature);
            return Err(RejectReason::InvalidSignature.into());
        }

        if !self.seen.mark_seen(&msg.id) {
            self.tracer.duplicate_message(&msg);
            return Ok(());
        }
        self.tracer.validate_message(&msg);

        let (inline, deferred): (Vec<_>, Vec<_>) = vals
            .into_iter()
            .partition(|val| synchronous || val.validator.is_inline());

        let mut result = Outcome::Accept;
        for val in &inline {
            result = combine(result, val.run(from, &msg).await.into());
            if result == Outcome::Reject {
                break;
            }
        }

        if result == Outcome::Reject {
            debug!(peer = %from.short(), "message validation failed");
            self.tracer.reject_message(&msg, RejectReason::ValidationFailed);
            return Err(RejectReason::ValidationFailed.into());
        }

        if !deferred.is_empty() {
            match Arc::clone(&self.throttle).try_acquire_owned() {
                Ok(permit) => {
                    let shared = Arc::clone(self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let cancel = shared.cancel.clone();
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = shared.validate_deferred(deferred, msg, result) => {}
                        }
                    });
                }
                Err(_) => {
                    debug!(peer = %from.short(), "message validation throttled");
                    self.tracer.reject_message(&msg, RejectReason::ValidationThrottled);
                }
            }
            return Ok(());
        }

        if result == Outcome::Ignore {
            self.tracer.reject_message(&msg, RejectReason::ValidationIgnored);
            return Err(RejectReason::ValidationIgnored.into());
        }

        self.deliver(msg).await;
        Ok(())
    }

    async fn validate_deferred(&self, vals: Vec<Arc<RegisteredValidator>>, msg: Arc<ReceivedMessage>, prior: Outcome) {
        let from = msg.received_from;
        let result = combine(prior, self.run_concurrently(vals, &msg).await);

        match result {
            Outcome::Accept => self.deliver(msg).await,
            Outcome::Reject => {
                debug!(peer = %from.short(), "message validation failed");
                self.tracer.reject_message(&msg, RejectReason::ValidationFailed);
            }
            Outcome::Ignore => {
                debug!(peer = %from.short(), "message validation punted");
                self.tracer.reject_message(&msg, RejectReason::ValidationIgnored);
            }
            Outcome::Throttled => {
                debug!(peer = %from.short(), "message validation throttled");
                self.tracer.reject_message(&msg, RejectReason::ValidationThrottled);
            }
        }
    }

    async fn run_concurrently(&self, vals: Vec<Arc<RegisteredValidator>>, msg: &Arc<ReceivedMessage>) -> Outcome {
        let from = msg.received_from;
        let mut result = Outcome::Accept;
        let mut set = JoinSet::new();

        for val in vals {
            let Ok(permit) = Arc::clone(&val.concurrency).try_acquire_owned() else {
                debug!(topic = %val.topic, "validation throttled for topic");
                result = combine(result, Outcome::Throttled);
                continue;
            };
            let msg = Arc::clone(msg);
            set.spawn(async move {
                let _permit = permit;
                Outcome::from(val.run(from, &msg).await)
            });
        }

        while let Some(joined) = set.join_next().await {
            let outcome = joined.unwrap_or_else(|err| {
                warn!(error = %err, "validator task failed; ignoring message");
                Outcome::Ignore
            });
            result = combine(result, outcome);
            if result == Outcome::Reject {
                // Dropping the set aborts the remaining validators.
                break;
            }
        }
        result
    }

    async fn deliver(&self, msg: Arc<ReceivedMessage>) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            res = self.deliver_tx.send(msg) => {
                if res.is_err() {
                    trace!("delivery channel closed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messages::{Message, MessageId};
    use crate::signing::sign_message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(policy: SignaturePolicy) -> PubSubConfig {
        PubSubConfig {
            signature_policy: policy,
            validate_workers: 2,
            ..PubSubConfig::default()
        }
    }

    fn start(config: &PubSubConfig) -> (Validation, mpsc::Receiver<Arc<ReceivedMessage>>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (validation, _workers) = Validation::spawn(
            config,
            Vec::new(),
            SeenMessages::new(Duration::from_secs(60)),
            Tracer::default(),
            tx,
            cancel.clone(),
        );
        (validation, rx, cancel)
    }

    fn signed(topic: &str, data: &[u8]) -> Arc<ReceivedMessage> {
        let keypair = Keypair::generate();
        let mut msg = Message {
            data: data.to_vec(),
            seqno: Some(1),
            topic: topic.to_string(),
            ..Message::default()
        };
        sign_message(&keypair, &mut msg);
        ReceivedMessage::new(MessageId::new(data.to_vec()), msg, PeerId::from_seed(9))
    }

    #[test]
    fn combine_prefers_reject_then_throttled() {
        assert_eq!(combine(Outcome::Ignore, Outcome::Reject), Outcome::Reject);
        assert_eq!(combine(Outcome::Ignore, Outcome::Throttled), Outcome::Throttled);
        assert_eq!(combine(Outcome::Throttled, Outcome::Ignore), Outcome::Throttled);
        assert_eq!(combine(Outcome::Accept, Outcome::Ignore), Outcome::Ignore);
        assert_eq!(combine(Outcome::Accept, Outcome::Accept), Outcome::Accept);
    }

    #[tokio::test]
    async fn unsigned_without_validators_skips_pipeline() {
        let (validation, _rx, cancel) = start(&config(SignaturePolicy::LaxSign));
        let msg = ReceivedMessage::new(MessageId::from("a"), Message::default(), PeerId::from_seed(1));
        assert!(validation.push(msg));
        cancel.cancel();
    }

    #[tokio::test]
    async fn signed_message_is_verified_and_delivered() {
        let (validation, mut rx, cancel) = start(&config(SignaturePolicy::StrictSign));
        let msg = signed("t", b"hello");
        assert!(!validation.push(Arc::clone(&msg)));

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("delivered");
        assert_eq!(delivered.id, msg.id);
        cancel.cancel();
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let (validation, mut rx, cancel) = start(&config(SignaturePolicy::StrictSign));
        let msg = signed("t", b"hello");
        let mut tampered = msg.message.clone();
        tampered.data = b"bye".to_vec();
        let tampered = ReceivedMessage::new(msg.id.clone(), tampered, msg.received_from);

        let err = validation.push_local(tampered).await.expect_err("must fail");
        assert_eq!(err.reason, RejectReason::InvalidSignature);
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn strict_no_sign_rejects_auth_info() {
        let (validation, _rx, cancel) = start(&config(SignaturePolicy::StrictNoSign));
        let msg = ReceivedMessage::new(
            MessageId::from("a"),
            Message {
                seqno: Some(7),
                ..Message::default()
            },
            PeerId::from_seed(1),
        );
        let err = validation.check_signing_policy(&msg).expect_err("must fail");
        assert_eq!(err.reason, RejectReason::UnexpectedAuthInfo);
        cancel.cancel();
    }

    #[tokio::test]
    async fn duplicate_local_publish_is_validated_once() {
        let (validation, mut rx, cancel) = start(&config(SignaturePolicy::LaxSign));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        validation
            .add_validator(
                "t",
                Validator::inline_bool(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }),
                ValidatorOptions::default(),
            )
            .expect("register");

        let msg = ReceivedMessage::new(
            MessageId::from("a"),
            Message {
                topic: "t".into(),
                ..Message::default()
            },
            PeerId::from_seed(1),
        );
        validation.push_local(Arc::clone(&msg)).await.expect("first");
        validation.push_local(msg).await.expect("duplicate is not an error");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn reject_short_circuits_and_ignore_sticks() {
        let (validation, _rx, cancel) = start(&config(SignaturePolicy::LaxSign));
        validation
            .add_validator("ignored", Validator::inline(|_, _| ValidationResult::Ignore), ValidatorOptions::default())
            .expect("register");
        validation
            .add_validator("rejected", Validator::inline_bool(|_, _| false), ValidatorOptions::default())
            .expect("register");

        let make = |topic: &str| {
            ReceivedMessage::new(
                MessageId::new(topic.as_bytes().to_vec()),
                Message {
                    topic: topic.into(),
                    ..Message::default()
                },
                PeerId::from_seed(1),
            )
        };
        let err = validation.push_local(make("ignored")).await.expect_err("ignored");
        assert_eq!(err.reason, RejectReason::ValidationIgnored);
        let err = validation.push_local(make("rejected")).await.expect_err("rejected");
        assert_eq!(err.reason, RejectReason::ValidationFailed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn async_validator_timeout_is_ignore() {
        let (validation, mut rx, cancel) = start(&config(SignaturePolicy::StrictSign));
        validation
            .add_validator(
                "t",
                Validator::asynchronous(|_, _| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    ValidationResult::Accept
                }),
                ValidatorOptions::default().with_timeout(Duration::from_millis(20)),
            )
            .expect("register");

        let msg = signed("t", b"slow");
        assert!(!validation.push(msg));
        let res = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(res.is_err(), "timed out validator must not deliver");
        cancel.cancel();
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let (validation, _rx, cancel) = start(&config(SignaturePolicy::LaxSign));
        validation
            .add_validator("t", Validator::inline_bool(|_, _| true), ValidatorOptions::default())
            .expect("first");
        assert!(
            validation
                .add_validator("t", Validator::inline_bool(|_, _| true), ValidatorOptions::default())
                .is_err()
        );
        validation.remove_validator("t").expect("remove");
        assert!(validation.remove_validator("t").is_err());
        cancel.cancel();
    }
}
