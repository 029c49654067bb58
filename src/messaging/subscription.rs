//! Subscriptions and the per-subscription consume worker.

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::messaging::codec::{self, Codec};
use crate::messaging::context::MessageContext;
use crate::messaging::dead_letter::{DeadLetterReason, DeadLetterRecord, DeadLetterSink};
use crate::messaging::envelope::Message;
use crate::messaging::error::TransportError;
use crate::messaging::handler::MessageHandler;
use crate::messaging::transport::{Delivery, DeliveryStream};
use crate::error::PipelineError;
use crate::poison::{PoisonDecision, PoisonMessageGuard};
use crate::retry::RetryExecutor;
use crate::telemetry::TelemetrySink;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifier returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who acknowledges a successfully handled delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The pipeline acks after the handler returns `Ok`
    #[default]
    Auto,
    /// The handler acks through its [`MessageContext`]
    Manual,
}

/// How a failed delivery gets back to the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeliveryMode {
    /// Reject with requeue and let the broker schedule redelivery
    #[default]
    TransportManaged,
    /// Wait the retry backoff for the attempt, then reject with requeue
    Immediate,
}

/// Options for one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Destination to consume; defaults to the one derived from the message type
    pub destination: Option<String>,

    /// Deliveries the transport may hand out ahead of acknowledgement
    pub prefetch: usize,

    /// Competing-consumer group, where the transport supports one
    pub group: Option<String>,

    pub ack_mode: AckMode,

    pub redelivery: RedeliveryMode,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            destination: None,
            prefetch: 16,
            group: None,
            ack_mode: AckMode::Auto,
            redelivery: RedeliveryMode::TransportManaged,
        }
    }
}

impl SubscriptionOptions {
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn redelivery(mut self, redelivery: RedeliveryMode) -> Self {
        self.redelivery = redelivery;
        self
    }
}

/// Public view of an active subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub destination: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

/// Registry entry owning the worker task
pub(crate) struct ActiveSubscription {
    pub(crate) info: SubscriptionInfo,
    pub(crate) token: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
}

impl ActiveSubscription {
    /// Cancel the worker and wait for the in-flight delivery to finish
    pub(crate) async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!(subscription_id = %self.info.id, "Consume worker panicked");
            }
        }
    }
}

/// Shared pieces a worker needs; cloned out of the pipeline so workers do
/// not keep the pipeline itself alive.
#[derive(Clone)]
pub(crate) struct ConsumeContext {
    pub(crate) codec: Arc<dyn Codec>,
    /// Upper bound on a decompressed payload
    pub(crate) max_message_size: usize,
    pub(crate) breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) poison: PoisonMessageGuard,
    pub(crate) retry: RetryExecutor,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
}

/// Outcome of one delivery, used for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Retry,
    Quarantined,
    DecodeFailure,
    Dropped,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retry => "retry",
            Outcome::Quarantined => "quarantined",
            Outcome::DecodeFailure => "decode_failure",
            Outcome::Dropped => "dropped",
        }
    }
}

/// Drives one subscription: pulls deliveries and runs the handler on each,
/// strictly one at a time.
pub(crate) struct ConsumeWorker<M, H> {
    pub(crate) id: SubscriptionId,
    pub(crate) destination: String,
    pub(crate) options: SubscriptionOptions,
    pub(crate) handler: Arc<H>,
    pub(crate) ctx: ConsumeContext,
    pub(crate) token: CancellationToken,
    pub(crate) _message: PhantomData<fn() -> M>,
}

impl<M, H> ConsumeWorker<M, H>
where
    M: Message,
    H: MessageHandler<M> + 'static,
{
    pub(crate) async fn run(self, mut stream: Box<dyn DeliveryStream>) {
        info!(
            subscription_id = %self.id,
            destination = %self.destination,
            message_type = M::MESSAGE_TYPE,
            "Consume worker started"
        );

        let mut consecutive_errors = 0u32;
        loop {
            // Only the wait for a delivery is raced against cancellation; a
            // delivery already handed out is always processed to the end.
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = stream.next_delivery() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    consecutive_errors = 0;
                    self.process(delivery).await;
                }
                Ok(None) => {
                    info!(subscription_id = %self.id, "Delivery stream ended");
                    break;
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = self.ctx.retry.delay_for_attempt(consecutive_errors);
                    warn!(
                        subscription_id = %self.id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Receive failed, backing off"
                    );
                    self.ctx.telemetry.counter(
                        "messaging.receive.error",
                        &[("destination", self.destination.as_str())],
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(subscription_id = %self.id, destination = %self.destination, "Consume worker stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let start = Instant::now();
        let message_id = delivery
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| fallback_message_id(&delivery.payload));

        let outcome = match self.decode(&delivery) {
            Ok(message) => self.handle(message, message_id.clone(), &delivery).await,
            Err(e) => self.dead_letter_undecodable(&message_id, &delivery, e).await,
        };

        let outcome_tag = outcome.as_str();
        let tags = [
            ("destination", self.destination.as_str()),
            ("outcome", outcome_tag),
        ];
        self.ctx.telemetry.counter("messaging.consume.count", &tags);
        self.ctx.telemetry.histogram(
            "messaging.consume.duration",
            start.elapsed().as_secs_f64(),
            &tags,
        );
        debug!(
            subscription_id = %self.id,
            message_id = %message_id,
            outcome = outcome_tag,
            "Processed delivery"
        );
    }

    fn decode(&self, delivery: &Delivery) -> Result<M, PipelineError> {
        let value = codec::decode(
            self.ctx.codec.as_ref(),
            &delivery.payload,
            &delivery.headers,
            self.ctx.max_message_size,
        )?;
        Ok(serde_json::from_value(value)?)
    }

    fn context(&self, message_id: String, delivery: &Delivery) -> MessageContext {
        MessageContext::new(
            self.id,
            self.destination.clone(),
            message_id,
            delivery.headers.clone(),
            delivery.redelivery_count,
            delivery.acknowledger(),
            self.ctx.breakers.for_settlement(&self.destination),
        )
    }

    async fn handle(&self, message: M, message_id: String, delivery: &Delivery) -> Outcome {
        let ctx = self.context(message_id.clone(), delivery);

        let result = AssertUnwindSafe(self.handler.handle(message, ctx.clone()))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        };

        match failure {
            None => {
                if self.options.ack_mode == AckMode::Auto {
                    self.settle_ack(&ctx).await;
                }
                self.ctx.poison.record_success(&self.destination, &message_id).await;
                Outcome::Success
            }
            Some(error) => self.handle_failure(&ctx, delivery, error).await,
        }
    }

    async fn handle_failure(&self, ctx: &MessageContext, delivery: &Delivery, error: String) -> Outcome {
        let message_id = ctx.message_id();
        let decision = self
            .ctx
            .poison
            .record_failure(&self.destination, message_id, &error)
            .await;

        match decision {
            PoisonDecision::Retry { attempts } => {
                warn!(
                    subscription_id = %self.id,
                    message_id,
                    attempts,
                    error = %error,
                    "Handler failed, message will be redelivered"
                );
                if self.options.redelivery == RedeliveryMode::Immediate {
                    let delay = self.ctx.retry.delay_for_attempt(attempts);
                    tokio::select! {
                        _ = self.token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                self.settle_reject(ctx, true).await;
                Outcome::Retry
            }
            PoisonDecision::Quarantine { attempts } => {
                let record = DeadLetterRecord {
                    original_destination: self.destination.clone(),
                    payload: delivery.payload.clone(),
                    headers: delivery.headers.clone(),
                    reason: DeadLetterReason::PoisonThreshold,
                    attempts,
                    last_error: error,
                    dead_lettered_at: Utc::now(),
                };

                match self.ctx.dead_letters.send(record).await {
                    Ok(()) => {
                        let quarantined = PipelineError::PoisonMessageQuarantined {
                            message_id: message_id.to_string(),
                            attempts,
                        };
                        error!(subscription_id = %self.id, error = %quarantined, "Message dead-lettered");
                        self.ctx
                            .telemetry
                            .counter("messaging.dead_letter.count", &[("destination", self.destination.as_str())]);
                        // An unacked message comes back; the record keeps it quarantined
                        if self.settle_ack(ctx).await {
                            self.ctx.poison.release(&self.destination, message_id).await;
                        }
                        Outcome::Quarantined
                    }
                    Err(e) => {
                        // Start counting again rather than lose the message
                        error!(
                            subscription_id = %self.id,
                            message_id,
                            error = %e,
                            "Dead-lettering failed, requeueing"
                        );
                        self.ctx.poison.release(&self.destination, message_id).await;
                        self.settle_reject(ctx, true).await;
                        Outcome::Retry
                    }
                }
            }
            PoisonDecision::AlreadyQuarantined { attempts } => {
                warn!(
                    subscription_id = %self.id,
                    message_id,
                    attempts,
                    "Dropping redelivery of a quarantined message"
                );
                if self.settle_ack(ctx).await {
                    self.ctx.poison.release(&self.destination, message_id).await;
                }
                Outcome::Dropped
            }
        }
    }

    async fn dead_letter_undecodable(
        &self,
        message_id: &str,
        delivery: &Delivery,
        decode_error: PipelineError,
    ) -> Outcome {
        error!(
            subscription_id = %self.id,
            message_id,
            error = %decode_error,
            "Failed to decode delivery"
        );
        let ctx = self.context(message_id.to_string(), delivery);
        let record = DeadLetterRecord {
            original_destination: self.destination.clone(),
            payload: delivery.payload.clone(),
            headers: delivery.headers.clone(),
            reason: DeadLetterReason::DecodeFailure,
            attempts: delivery.redelivery_count.saturating_add(1),
            last_error: decode_error.to_string(),
            dead_lettered_at: Utc::now(),
        };

        match self.ctx.dead_letters.send(record).await {
            Ok(()) => {
                self.ctx
                    .telemetry
                    .counter("messaging.dead_letter.count", &[("destination", self.destination.as_str())]);
                self.settle_ack(&ctx).await;
            }
            Err(e) => {
                error!(subscription_id = %self.id, message_id, error = %e, "Dead-lettering failed");
                self.settle_reject(&ctx, true).await;
            }
        }
        Outcome::DecodeFailure
    }

    /// Returns whether the delivery is now acknowledged
    async fn settle_ack(&self, ctx: &MessageContext) -> bool {
        match ctx.ack().await {
            Ok(()) => true,
            Err(e) => {
                warn!(subscription_id = %self.id, message_id = ctx.message_id(), error = %e, "Ack failed");
                false
            }
        }
    }

    async fn settle_reject(&self, ctx: &MessageContext, requeue: bool) {
        if let Err(e) = ctx.reject(requeue).await {
            warn!(subscription_id = %self.id, message_id = ctx.message_id(), error = %e, "Reject failed");
        }
    }
}

/// Stable id for deliveries that arrive without a message-id header
fn fallback_message_id(payload: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    format!("payload-{:016x}", hasher.finish())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
