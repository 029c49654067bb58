//! End-to-end pipeline behaviour over the in-memory transport

use async_trait::async_trait;
use resilient_messaging::messaging::{
    headers, AckMode, BrokerTransport, DeadLetterReason, HandlerError, HandlerResult,
    Headers, InMemoryDeadLetterSink, InMemoryTransport, Message, MessageContext, MessageHandler,
    DeliveryStream, MessagePipeline, PublishOptions, RedeliveryMode, SubscriptionOptions,
    TransportError, TransportResult, TransportSubscribeOptions,
};
use resilient_messaging::backpressure::ThrottlePolicy;
use resilient_messaging::circuit_breaker::CircuitBreakerState;
use resilient_messaging::{PipelineError, ResilienceConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    amount: u64,
}

impl Message for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "order_placed";
}

const DESTINATION: &str = "messages.order_placed";

fn order(id: &str) -> OrderPlaced {
    OrderPlaced {
        order_id: id.to_string(),
        amount: 10,
    }
}

struct Harness {
    transport: InMemoryTransport,
    dead_letters: InMemoryDeadLetterSink,
    pipeline: MessagePipeline,
}

fn harness(config: ResilienceConfig) -> Harness {
    let transport = InMemoryTransport::new();
    let dead_letters = InMemoryDeadLetterSink::new();
    let pipeline = MessagePipeline::builder(Arc::new(transport.clone()))
        .config(config)
        .dead_letter_sink(Arc::new(dead_letters.clone()))
        .build()
        .unwrap();
    Harness {
        transport,
        dead_letters,
        pipeline,
    }
}

fn fast_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Fails the first `failures` calls, then succeeds
struct FlakyHandler {
    calls: Arc<AtomicU32>,
    failures: u32,
}

#[async_trait]
impl MessageHandler<OrderPlaced> for FlakyHandler {
    async fn handle(&self, _message: OrderPlaced, _ctx: MessageContext) -> HandlerResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(format!("failure #{}", call).into())
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_publish_and_consume() {
    let h = harness(fast_config());
    let (tx, mut rx) = mpsc::unbounded_channel();

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            move |order: OrderPlaced, ctx: MessageContext| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((order, ctx.correlation_id().map(String::from)));
                    Ok::<_, HandlerError>(())
                }
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    h.pipeline
        .publish(&order("o-1"), PublishOptions::default().correlation_id("checkout-7"))
        .await
        .unwrap();

    let (received, correlation_id) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, order("o-1"));
    assert_eq!(correlation_id.as_deref(), Some("checkout-7"));

    eventually(|| h.transport.ack_count() == 1).await;
    assert_eq!(h.transport.queue_depth(DESTINATION), 0);
    assert!(h.dead_letters.is_empty());
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_always_failing_handler_is_quarantined_after_threshold() {
    let h = harness(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            FlakyHandler {
                calls: calls.clone(),
                failures: u32::MAX,
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    let message_id = h
        .pipeline
        .publish(&order("o-1"), PublishOptions::default())
        .await
        .unwrap();

    eventually(|| h.dead_letters.len() == 1).await;
    // Give a stray redelivery the chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let records = h.dead_letters.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::PoisonThreshold);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(records[0].original_destination, DESTINATION);
    assert_eq!(records[0].message_id(), Some(message_id.as_str()));
    assert_eq!(records[0].last_error, "failure #3");

    assert_eq!(h.transport.queue_depth(DESTINATION), 0);
    assert!(h
        .pipeline
        .poison_guard()
        .record(DESTINATION, &message_id)
        .await
        .is_none());
    h.pipeline.shutdown().await.unwrap();
}

/// Always fails; makes the transport refuse the settle that follows the
/// third failure
struct AckBreakingHandler {
    calls: Arc<AtomicU32>,
    transport: InMemoryTransport,
}

#[async_trait]
impl MessageHandler<OrderPlaced> for AckBreakingHandler {
    async fn handle(&self, _message: OrderPlaced, _ctx: MessageContext) -> HandlerResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 3 {
            self.transport.fail_next_acks(1);
        }
        Err(format!("failure #{}", call).into())
    }
}

#[tokio::test]
async fn test_failed_quarantine_ack_does_not_dead_letter_twice() {
    let h = harness(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            AckBreakingHandler {
                calls: calls.clone(),
                transport: h.transport.clone(),
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    let message_id = h
        .pipeline
        .publish(&order("o-1"), PublishOptions::default())
        .await
        .unwrap();

    // The unacked message comes back once and is dropped with an ack
    eventually(|| h.transport.ack_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.dead_letters.len(), 1);
    assert_eq!(h.transport.queue_depth(DESTINATION), 0);
    assert!(h
        .pipeline
        .poison_guard()
        .record(DESTINATION, &message_id)
        .await
        .is_none());
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_recovering_below_threshold_is_not_dead_lettered() {
    let h = harness(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            FlakyHandler {
                calls: calls.clone(),
                failures: 2,
            },
            SubscriptionOptions::default().redelivery(RedeliveryMode::Immediate),
        )
        .await
        .unwrap();

    h.pipeline
        .publish(&order("o-1"), PublishOptions::default())
        .await
        .unwrap();

    eventually(|| h.transport.ack_count() == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.transport.reject_count(), 2);
    assert!(h.dead_letters.is_empty());
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_does_not_kill_the_worker() {
    let h = harness(fast_config());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            move |order: OrderPlaced, _ctx: MessageContext| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if order.order_id == "bad" {
                        panic!("cannot handle {}", order.order_id);
                    }
                    Ok::<_, HandlerError>(())
                }
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    h.pipeline
        .publish(&order("bad"), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| h.dead_letters.len() == 1).await;
    assert!(h.dead_letters.records()[0].last_error.contains("cannot handle bad"));

    h.pipeline
        .publish(&order("good"), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| h.transport.ack_count() == 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_payload_is_dead_lettered() {
    let h = harness(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            FlakyHandler {
                calls: calls.clone(),
                failures: 0,
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    let mut raw_headers = Headers::new();
    raw_headers.insert(headers::MESSAGE_ID.to_string(), "raw-1".to_string());
    raw_headers.insert(headers::MESSAGE_TYPE.to_string(), "order_placed".to_string());
    h.transport
        .publish_raw(DESTINATION, b"{not json", &raw_headers)
        .await
        .unwrap();

    eventually(|| h.dead_letters.len() == 1).await;
    let records = h.dead_letters.records();
    let record = &records[0];
    assert_eq!(record.reason, DeadLetterReason::DecodeFailure);
    assert_eq!(record.message_id(), Some("raw-1"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    eventually(|| h.transport.ack_count() == 1).await;
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_compressed_payload_over_size_limit_is_dead_lettered() {
    let mut config = fast_config();
    config.messaging.max_message_size = 4096;
    let h = harness(config);
    let calls = Arc::new(AtomicU32::new(0));

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            FlakyHandler {
                calls: calls.clone(),
                failures: 0,
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    // Size prefix claims ~4 GiB
    let mut payload = vec![0xff, 0xff, 0xff, 0xff];
    payload.extend_from_slice(&[0x1f; 32]);
    let mut raw_headers = Headers::new();
    raw_headers.insert(headers::MESSAGE_ID.to_string(), "lz4-1".to_string());
    raw_headers.insert(headers::MESSAGE_TYPE.to_string(), "order_placed".to_string());
    raw_headers.insert(headers::CONTENT_ENCODING.to_string(), "lz4".to_string());
    h.transport
        .publish_raw(DESTINATION, &payload, &raw_headers)
        .await
        .unwrap();

    eventually(|| h.dead_letters.len() == 1).await;
    let records = h.dead_letters.records();
    assert_eq!(records[0].reason, DeadLetterReason::DecodeFailure);
    assert_eq!(records[0].message_id(), Some("lz4-1"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_ack_mode() {
    let h = harness(fast_config());

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            |_order: OrderPlaced, ctx: MessageContext| async move {
                ctx.ack().await?;
                Ok::<_, HandlerError>(())
            },
            SubscriptionOptions::default().ack_mode(AckMode::Manual),
        )
        .await
        .unwrap();

    h.pipeline
        .publish(&order("o-1"), PublishOptions::default())
        .await
        .unwrap();

    eventually(|| h.transport.ack_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.transport.ack_count(), 1);
    assert_eq!(h.transport.queue_depth(DESTINATION), 0);
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_open_circuit_fails_publish_fast() {
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 2;
    config.retry.max_attempts = 1;
    let h = harness(config);
    h.transport
        .set_publish_failure(Some(TransportError::Timeout("broker slow".to_string())));

    for _ in 0..2 {
        assert!(matches!(
            h.pipeline.publish(&order("o-1"), PublishOptions::default()).await,
            Err(PipelineError::TransientTransport(_))
        ));
    }
    assert!(matches!(
        h.pipeline.publish(&order("o-1"), PublishOptions::default()).await,
        Err(PipelineError::CircuitOpen(_))
    ));
    assert_eq!(h.transport.publish_attempts(), 2);

    // Other destinations are unaffected
    h.transport.set_publish_failure(None);
    h.pipeline
        .publish(&order("o-2"), PublishOptions::default().destination("audit"))
        .await
        .unwrap();
    assert_eq!(h.transport.queue_depth("audit"), 1);
}

fn single_slot_config(retry_delay: Duration) -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.backpressure.max_inflight = 1;
    config.backpressure.policy = ThrottlePolicy::RejectImmediately;
    config.retry.initial_delay = retry_delay;
    config.retry.max_delay = retry_delay;
    config.retry.jitter = false;
    config
}

#[tokio::test]
async fn test_publish_rejected_while_slot_is_held() {
    let h = harness(single_slot_config(Duration::from_millis(300)));
    // First attempt fails, so the publish sits in its retry delay holding the slot
    h.transport
        .fail_next_publishes(1, TransportError::Timeout("broker slow".to_string()));

    let first = {
        let pipeline = h.pipeline.clone();
        tokio::spawn(async move { pipeline.publish(&order("o-1"), PublishOptions::default()).await })
    };
    eventually(|| h.pipeline.backpressure().in_flight == 1).await;

    assert!(matches!(
        h.pipeline.publish(&order("o-2"), PublishOptions::default()).await,
        Err(PipelineError::BackpressureRejected(_))
    ));

    first.await.unwrap().unwrap();
    assert_eq!(h.pipeline.backpressure().in_flight, 0);
    h.pipeline
        .publish(&order("o-3"), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(h.transport.queue_depth(DESTINATION), 2);
}

#[tokio::test]
async fn test_failed_publish_releases_its_slot() {
    let h = harness(single_slot_config(Duration::from_millis(1)));

    h.transport
        .set_publish_failure(Some(TransportError::InvalidDestination("gone".to_string())));
    assert!(matches!(
        h.pipeline.publish(&order("o-1"), PublishOptions::default()).await,
        Err(PipelineError::PermanentTransport(_))
    ));
    assert_eq!(h.pipeline.backpressure().in_flight, 0);

    // Transient failures that exhaust the retries as well
    h.transport
        .set_publish_failure(Some(TransportError::Timeout("broker slow".to_string())));
    assert!(matches!(
        h.pipeline.publish(&order("o-2"), PublishOptions::default()).await,
        Err(PipelineError::TransientTransport(_))
    ));
    assert_eq!(h.pipeline.backpressure().in_flight, 0);

    h.transport.set_publish_failure(None);
    h.pipeline
        .publish(&order("o-3"), PublishOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_publish_releases_its_slot() {
    let h = harness(single_slot_config(Duration::from_secs(30)));
    h.transport
        .fail_next_publishes(1, TransportError::Timeout("broker slow".to_string()));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        h.pipeline.publish(&order("o-1"), PublishOptions::default()),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(h.pipeline.backpressure().in_flight, 0);

    h.pipeline
        .publish(&order("o-2"), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(h.transport.queue_depth(DESTINATION), 1);
}

#[tokio::test]
async fn test_open_settlement_breaker_leaves_publish_open() {
    let h = harness(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    h.pipeline
        .subscribe::<OrderPlaced, _>(
            FlakyHandler {
                calls: calls.clone(),
                failures: 0,
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    h.pipeline
        .publish(&order("o-1"), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| h.transport.ack_count() == 1).await;

    let settle = h.pipeline.breakers().for_settlement(DESTINATION);
    assert_eq!(settle.name(), format!("{}#ack", DESTINATION));
    settle.isolate();

    // Acks now fail fast and the unsettled delivery comes back; publishes still go through
    h.pipeline
        .publish(&order("o-2"), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| calls.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(
        h.pipeline.breakers().for_destination(DESTINATION).state(),
        CircuitBreakerState::Closed
    );
    assert_eq!(h.transport.ack_count(), 1);
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_stops_consumption() {
    let h = harness(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    let id = h
        .pipeline
        .subscribe::<OrderPlaced, _>(
            FlakyHandler {
                calls: calls.clone(),
                failures: 0,
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(h.pipeline.subscriptions().len(), 1);

    h.pipeline.unsubscribe(id).await.unwrap();
    assert!(h.pipeline.subscriptions().is_empty());

    h.pipeline
        .publish(&order("o-1"), PublishOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.transport.queue_depth(DESTINATION), 1);
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let h = harness(fast_config());
    h.pipeline
        .subscribe::<OrderPlaced, _>(
            FlakyHandler {
                calls: Arc::new(AtomicU32::new(0)),
                failures: 0,
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    h.pipeline.shutdown().await.unwrap();

    assert!(h.pipeline.is_shut_down());
    assert!(h.pipeline.subscriptions().is_empty());
    assert!(h.transport.is_closed());
    assert!(matches!(
        h.pipeline
            .subscribe::<OrderPlaced, _>(
                FlakyHandler {
                    calls: Arc::new(AtomicU32::new(0)),
                    failures: 0,
                },
                SubscriptionOptions::default(),
            )
            .await,
        Err(PipelineError::ShutDown)
    ));
}

/// Parks every subscribe call, after the broker subscription exists, until released
struct GatedTransport {
    inner: InMemoryTransport,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl BrokerTransport for GatedTransport {
    fn name(&self) -> &str {
        "gated"
    }

    async fn publish_raw(&self, destination: &str, payload: &[u8], headers: &Headers) -> TransportResult<()> {
        self.inner.publish_raw(destination, payload, headers).await
    }

    async fn subscribe(
        &self,
        destination: &str,
        options: &TransportSubscribeOptions,
    ) -> TransportResult<Box<dyn DeliveryStream>> {
        // The broker side succeeds before the call returns
        let stream = self.inner.subscribe(destination, options).await;
        self.entered.notify_one();
        self.release.notified().await;
        stream
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_subscribe_racing_shutdown_leaves_no_worker() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let transport = GatedTransport {
        inner: InMemoryTransport::new(),
        entered: entered.clone(),
        release: release.clone(),
    };
    let pipeline = MessagePipeline::builder(Arc::new(transport))
        .config(fast_config())
        .build()
        .unwrap();

    let pending = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .subscribe::<OrderPlaced, _>(
                    FlakyHandler {
                        calls: Arc::new(AtomicU32::new(0)),
                        failures: 0,
                    },
                    SubscriptionOptions::default(),
                )
                .await
        })
    };
    entered.notified().await;

    pipeline.shutdown().await.unwrap();
    release.notify_one();

    assert!(matches!(pending.await.unwrap(), Err(PipelineError::ShutDown)));
    assert!(pipeline.subscriptions().is_empty());
}
