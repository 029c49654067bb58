//! The message pipeline: typed publish and subscribe over any transport.

use crate::backpressure::{BackpressureController, BackpressureSnapshot};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::ResilienceConfig;
use crate::error::{PipelineError, Result};
use crate::messaging::codec::{self, Codec, JsonCodec, MessageValidator, LZ4_ENCODING};
use crate::messaging::dead_letter::{DeadLetterSink, TransportDeadLetterSink};
use crate::messaging::envelope::{Envelope, Headers, Message};
use crate::messaging::handler::MessageHandler;
use crate::messaging::subscription::{
    ActiveSubscription, ConsumeContext, ConsumeWorker, SubscriptionId, SubscriptionInfo,
    SubscriptionOptions,
};
use crate::messaging::transport::{BrokerTransport, TransportSubscribeOptions};
use crate::poison::PoisonMessageGuard;
use crate::retry::RetryExecutor;
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use chrono::Utc;
use dashmap::DashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-publish overrides
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Target destination; defaults to `<destination_prefix>.<message type>`
    pub destination: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub routing_key: Option<String>,
    /// Extra application headers
    pub headers: Headers,
}

impl PublishOptions {
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

struct PipelineInner {
    config: ResilienceConfig,
    transport: Arc<dyn BrokerTransport>,
    codec: Arc<dyn Codec>,
    validator: Option<Arc<dyn MessageValidator>>,
    breakers: Arc<CircuitBreakerRegistry>,
    backpressure: BackpressureController,
    poison: PoisonMessageGuard,
    retry: RetryExecutor,
    dead_letters: Arc<dyn DeadLetterSink>,
    telemetry: Arc<dyn TelemetrySink>,
    subscriptions: DashMap<SubscriptionId, ActiveSubscription>,
    shutdown_token: CancellationToken,
    shut_down: AtomicBool,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        // Workers hold no reference back to the pipeline; stop them here
        self.shutdown_token.cancel();
    }
}

/// Typed publish/subscribe with circuit breaking, backpressure, retries,
/// poison-message quarantine and dead-lettering.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MessagePipeline {
    inner: Arc<PipelineInner>,
}

/// Builder for [`MessagePipeline`]
pub struct MessagePipelineBuilder {
    transport: Arc<dyn BrokerTransport>,
    config: ResilienceConfig,
    codec: Arc<dyn Codec>,
    validator: Option<Arc<dyn MessageValidator>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl MessagePipelineBuilder {
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Validator run on every outgoing message before encoding
    pub fn validator(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Where dead letters go; defaults to `messaging.dead_letter_destination`
    /// on the pipeline's own transport
    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn build(self) -> Result<MessagePipeline> {
        self.config.validate()?;

        let name = self.transport.name().to_string();
        let dead_letters = self.dead_letters.unwrap_or_else(|| {
            Arc::new(TransportDeadLetterSink::new(
                self.transport.clone(),
                self.config.messaging.dead_letter_destination.clone(),
            ))
        });

        info!(
            transport = %name,
            max_inflight = self.config.backpressure.max_inflight,
            poison_threshold = self.config.poison.threshold,
            "Building message pipeline"
        );

        let inner = PipelineInner {
            breakers: Arc::new(CircuitBreakerRegistry::with_telemetry(
                self.config.circuit_breaker.clone(),
                self.telemetry.clone(),
            )),
            backpressure: BackpressureController::with_telemetry(
                name.clone(),
                self.config.backpressure.clone(),
                self.telemetry.clone(),
            ),
            poison: PoisonMessageGuard::new(self.config.poison.clone()),
            retry: RetryExecutor::with_telemetry(
                name,
                self.config.retry.clone(),
                self.telemetry.clone(),
            ),
            config: self.config,
            transport: self.transport,
            codec: self.codec,
            validator: self.validator,
            dead_letters,
            telemetry: self.telemetry,
            subscriptions: DashMap::new(),
            shutdown_token: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        };

        Ok(MessagePipeline {
            inner: Arc::new(inner),
        })
    }
}

impl MessagePipeline {
    /// Start building a pipeline over `transport` with default configuration
    pub fn builder(transport: Arc<dyn BrokerTransport>) -> MessagePipelineBuilder {
        MessagePipelineBuilder {
            transport,
            config: ResilienceConfig::default(),
            codec: Arc::new(JsonCodec),
            validator: None,
            dead_letters: None,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    /// Circuit breakers, one per destination
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn backpressure(&self) -> BackpressureSnapshot {
        self.inner.backpressure.snapshot()
    }

    pub fn poison_guard(&self) -> &PoisonMessageGuard {
        &self.inner.poison
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Publish a message and return its message id.
    ///
    /// The call is admitted by the backpressure controller, then the
    /// transport publish runs through the destination's circuit breaker,
    /// with transient failures retried under the retry policy.
    pub async fn publish<M: Message>(&self, message: &M, options: PublishOptions) -> Result<String> {
        if self.is_shut_down() {
            return Err(PipelineError::ShutDown);
        }

        let destination = options
            .destination
            .clone()
            .unwrap_or_else(|| self.inner.config.messaging.destination_for(M::MESSAGE_TYPE));

        let start = Instant::now();
        let result = self.publish_to(message, &destination, options).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.error_code(),
        };
        let tags = [
            ("destination", destination.as_str()),
            ("message_type", M::MESSAGE_TYPE),
            ("outcome", outcome),
        ];
        self.inner.telemetry.counter("messaging.publish.count", &tags);
        self.inner.telemetry.histogram(
            "messaging.publish.duration",
            start.elapsed().as_secs_f64(),
            &tags,
        );

        match &result {
            Ok(message_id) => debug!(destination = %destination, message_id = %message_id, "Published message"),
            Err(e) => warn!(destination = %destination, error = %e, "Publish failed"),
        }
        result
    }

    async fn publish_to<M: Message>(
        &self,
        message: &M,
        destination: &str,
        options: PublishOptions,
    ) -> Result<String> {
        let value = serde_json::to_value(message)?;
        if value.is_null() {
            return Err(PipelineError::Validation("message must not be null".to_string()));
        }
        if let Some(validator) = &self.inner.validator {
            validator
                .validate(M::MESSAGE_TYPE, &value)
                .map_err(PipelineError::Validation)?;
        }

        let messaging = &self.inner.config.messaging;
        let encoded = codec::encode(self.inner.codec.as_ref(), &messaging.compression, &value)?;
        // Consumers refuse to inflate past the same limit
        if encoded.max_len() > messaging.max_message_size {
            return Err(PipelineError::Validation(format!(
                "encoded message is {} bytes, limit is {}",
                encoded.max_len(),
                messaging.max_message_size
            )));
        }

        let mut builder = Envelope::builder(M::MESSAGE_TYPE)
            .source(messaging.source.clone())
            .content_type(encoded.content_type);
        if encoded.compressed {
            builder = builder.content_encoding(LZ4_ENCODING);
        }
        if let Some(id) = options.message_id {
            builder = builder.message_id(id);
        }
        if let Some(id) = options.correlation_id {
            builder = builder.correlation_id(id);
        }
        if let Some(key) = options.routing_key {
            builder = builder.routing_key(key);
        }
        for (key, value) in options.headers {
            builder = builder.header(key, value);
        }
        let envelope = builder.build(encoded.bytes);
        let message_id = envelope.message_id().unwrap_or_default().to_string();

        let _permit = self.inner.backpressure.acquire().await?;

        let breaker = self.inner.breakers.for_destination(destination);
        let breaker = &breaker;
        let transport = &self.inner.transport;
        let payload = envelope.payload();
        let headers = envelope.headers();

        self.inner
            .retry
            .execute(|| async move {
                breaker
                    .call(|| async move {
                        transport
                            .publish_raw(destination, payload, headers)
                            .await
                            .map_err(PipelineError::from)
                    })
                    .await
            })
            .await?;

        Ok(message_id)
    }

    /// Start consuming messages of type `M` with `handler`.
    ///
    /// Each subscription gets one worker task that handles deliveries one at
    /// a time, in arrival order.
    pub async fn subscribe<M, H>(&self, handler: H, options: SubscriptionOptions) -> Result<SubscriptionId>
    where
        M: Message,
        H: MessageHandler<M> + 'static,
    {
        if self.is_shut_down() {
            return Err(PipelineError::ShutDown);
        }

        let destination = options
            .destination
            .clone()
            .unwrap_or_else(|| self.inner.config.messaging.destination_for(M::MESSAGE_TYPE));

        let stream = self
            .inner
            .transport
            .subscribe(
                &destination,
                &TransportSubscribeOptions {
                    prefetch: options.prefetch,
                    group: options.group.clone(),
                },
            )
            .await?;

        // Shutdown may have started while the transport was subscribing
        if self.is_shut_down() {
            debug!(destination = %destination, "Pipeline shut down during subscribe");
            return Err(PipelineError::ShutDown);
        }

        let id = SubscriptionId::new();
        let token = self.inner.shutdown_token.child_token();
        let worker = ConsumeWorker::<M, H> {
            id,
            destination: destination.clone(),
            options,
            handler: Arc::new(handler),
            ctx: ConsumeContext {
                codec: self.inner.codec.clone(),
                max_message_size: self.inner.config.messaging.max_message_size,
                breakers: self.inner.breakers.clone(),
                poison: self.inner.poison.clone(),
                retry: self.inner.retry.clone(),
                dead_letters: self.inner.dead_letters.clone(),
                telemetry: self.inner.telemetry.clone(),
            },
            token: token.clone(),
            _message: PhantomData,
        };
        let handle = tokio::spawn(worker.run(stream));

        self.inner.subscriptions.insert(
            id,
            ActiveSubscription {
                info: SubscriptionInfo {
                    id,
                    destination: destination.clone(),
                    message_type: M::MESSAGE_TYPE.to_string(),
                    created_at: Utc::now(),
                },
                token,
                handle,
            },
        );

        // Shutdown either saw the insert above or set its flag before this
        // load; whichever side removes the entry stops the worker
        if self.is_shut_down() {
            if let Some((_, subscription)) = self.inner.subscriptions.remove(&id) {
                subscription.stop().await;
            }
            return Err(PipelineError::ShutDown);
        }

        info!(subscription_id = %id, destination = %destination, "Subscribed");
        Ok(id)
    }

    /// Stop one subscription, waiting for its in-flight delivery
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let (_, subscription) = self
            .inner
            .subscriptions
            .remove(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("subscription {}", id)))?;

        subscription.stop().await;
        info!(subscription_id = %id, "Unsubscribed");
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .subscriptions
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect()
    }

    /// Stop all workers, refuse new work and close the transport.
    ///
    /// In-flight deliveries finish first. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down message pipeline");
        self.inner.shutdown_token.cancel();

        let ids: Vec<SubscriptionId> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            if let Some((_, subscription)) = self.inner.subscriptions.remove(&id) {
                subscription.stop().await;
            }
        }

        self.inner.backpressure.close();
        self.inner.transport.close().await?;
        info!("Message pipeline shut down");
        Ok(())
    }
}

impl std::fmt::Debug for MessagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePipeline")
            .field("transport", &self.inner.transport.name())
            .field("subscriptions", &self.inner.subscriptions.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::dead_letter::InMemoryDeadLetterSink;
    use crate::messaging::envelope::headers;
    use crate::messaging::error::TransportError;
    use crate::messaging::memory::InMemoryTransport;
    use crate::telemetry::testing::RecordingTelemetry;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        amount: u64,
    }

    impl Message for OrderPlaced {
        const MESSAGE_TYPE: &'static str = "order_placed";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Nothing;

    impl Message for Nothing {
        const MESSAGE_TYPE: &'static str = "nothing";
    }

    fn order() -> OrderPlaced {
        OrderPlaced {
            order_id: "o-1".to_string(),
            amount: 42,
        }
    }

    fn fast_config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.retry.initial_delay = std::time::Duration::from_millis(1);
        config.retry.max_delay = std::time::Duration::from_millis(5);
        config
    }

    #[tokio::test]
    async fn test_publish_enqueues_envelope() {
        let transport = InMemoryTransport::new();
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .build()
            .unwrap();

        let id = pipeline
            .publish(&order(), PublishOptions::default().routing_key("eu"))
            .await
            .unwrap();

        let queued = transport.queued_headers("messages.order_placed");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0][headers::MESSAGE_ID], id);
        assert_eq!(queued[0][headers::MESSAGE_TYPE], "order_placed");
        assert_eq!(queued[0][headers::ROUTING_KEY], "eu");
        assert_eq!(queued[0][headers::SOURCE], "resilient-messaging");
    }

    #[tokio::test]
    async fn test_null_message_is_rejected() {
        let transport = InMemoryTransport::new();
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .build()
            .unwrap();

        let result = pipeline.publish(&Nothing, PublishOptions::default()).await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
        assert_eq!(transport.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn test_validator_runs_before_transport() {
        let transport = InMemoryTransport::new();
        let validator = |_: &str, value: &Value| {
            if value["amount"].as_u64() == Some(0) {
                Err("amount must be positive".to_string())
            } else {
                Ok(())
            }
        };
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .validator(Arc::new(validator))
            .build()
            .unwrap();

        let bad = OrderPlaced {
            order_id: "o-2".to_string(),
            amount: 0,
        };
        assert!(matches!(
            pipeline.publish(&bad, PublishOptions::default()).await,
            Err(PipelineError::Validation(_))
        ));
        assert_eq!(transport.publish_attempts(), 0);
        assert!(pipeline.publish(&order(), PublishOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let transport = InMemoryTransport::new();
        let mut config = ResilienceConfig::default();
        config.messaging.max_message_size = 8;
        config.messaging.compression.enabled = false;
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .config(config)
            .build()
            .unwrap();

        assert!(matches!(
            pipeline.publish(&order(), PublishOptions::default()).await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_size_limit_applies_before_compression() {
        let transport = InMemoryTransport::new();
        let mut config = ResilienceConfig::default();
        config.messaging.max_message_size = 2048;
        config.messaging.compression.threshold_bytes = 64;
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .config(config)
            .build()
            .unwrap();

        // Compresses far below the limit but inflates past it
        let big = OrderPlaced {
            order_id: "x".repeat(8192),
            amount: 1,
        };
        assert!(matches!(
            pipeline.publish(&big, PublishOptions::default()).await,
            Err(PipelineError::Validation(_))
        ));
        assert_eq!(transport.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transport = InMemoryTransport::new();
        transport.fail_next_publishes(2, TransportError::Timeout("slow".to_string()));
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .config(fast_config())
            .build()
            .unwrap();

        pipeline.publish(&order(), PublishOptions::default()).await.unwrap();
        assert_eq!(transport.publish_attempts(), 3);
        assert_eq!(transport.queue_depth("messages.order_placed"), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let transport = InMemoryTransport::new();
        transport.fail_next_publishes(1, TransportError::InvalidDestination("bad".to_string()));
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .config(fast_config())
            .build()
            .unwrap();

        assert!(matches!(
            pipeline.publish(&order(), PublishOptions::default()).await,
            Err(PipelineError::PermanentTransport(_))
        ));
        assert_eq!(transport.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn test_publish_records_telemetry() {
        let transport = InMemoryTransport::new();
        let telemetry = Arc::new(RecordingTelemetry::default());
        let pipeline = MessagePipeline::builder(Arc::new(transport))
            .telemetry(telemetry.clone())
            .build()
            .unwrap();

        pipeline.publish(&order(), PublishOptions::default()).await.unwrap();
        assert_eq!(telemetry.count("messaging.publish.count"), 1);
        assert!(telemetry
            .histograms
            .lock()
            .iter()
            .any(|(name, _)| name == "messaging.publish.duration"));
    }

    #[tokio::test]
    async fn test_large_payload_is_compressed() {
        let transport = InMemoryTransport::new();
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .build()
            .unwrap();

        let big = OrderPlaced {
            order_id: "x".repeat(10_000),
            amount: 1,
        };
        pipeline.publish(&big, PublishOptions::default()).await.unwrap();

        let queued = transport.queued_headers("messages.order_placed");
        assert_eq!(queued[0][headers::CONTENT_ENCODING], LZ4_ENCODING);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let transport = InMemoryTransport::new();
        let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
            .dead_letter_sink(Arc::new(InMemoryDeadLetterSink::new()))
            .build()
            .unwrap();

        pipeline.shutdown().await.unwrap();
        pipeline.shutdown().await.unwrap();

        assert!(transport.is_closed());
        assert!(matches!(
            pipeline.publish(&order(), PublishOptions::default()).await,
            Err(PipelineError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id() {
        let pipeline = MessagePipeline::builder(Arc::new(InMemoryTransport::new()))
            .build()
            .unwrap();

        assert!(matches!(
            pipeline.unsubscribe(SubscriptionId::new()).await,
            Err(PipelineError::NotFound(_))
        ));
    }
}
