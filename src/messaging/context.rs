//! Per-delivery context handed to message handlers.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{PipelineError, Result};
use crate::messaging::envelope::{headers, Headers};
use crate::messaging::subscription::SubscriptionId;
use crate::messaging::transport::Acknowledger;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct ContextInner {
    subscription_id: SubscriptionId,
    destination: String,
    message_id: String,
    headers: Headers,
    redelivery_count: u32,
    received_at: DateTime<Utc>,
    acknowledger: Arc<dyn Acknowledger>,
    breaker: Arc<CircuitBreaker>,
    settled: AtomicBool,
}

/// Metadata and settlement callbacks for one delivery.
///
/// Cloning is cheap; all clones settle the same delivery. Only the first
/// successful `ack` or `reject` reaches the transport, later calls are no-ops.
#[derive(Clone)]
pub struct MessageContext {
    inner: Arc<ContextInner>,
}

impl MessageContext {
    pub(crate) fn new(
        subscription_id: SubscriptionId,
        destination: String,
        message_id: String,
        headers: Headers,
        redelivery_count: u32,
        acknowledger: Arc<dyn Acknowledger>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                subscription_id,
                destination,
                message_id,
                headers,
                redelivery_count,
                received_at: Utc::now(),
                acknowledger,
                breaker,
                settled: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.inner.subscription_id
    }

    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.inner.headers.get(key).map(String::as_str)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header(headers::MESSAGE_TYPE)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.header(headers::ROUTING_KEY)
    }

    /// Times the transport delivered this message before
    pub fn redelivery_count(&self) -> u32 {
        self.inner.redelivery_count
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.inner.received_at
    }

    /// Whether the delivery has been acked or rejected
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// Acknowledge the delivery through the destination's circuit breaker
    pub async fn ack(&self) -> Result<()> {
        self.settle("ack", |acknowledger| async move {
            acknowledger.ack().await.map_err(PipelineError::from)
        })
        .await
    }

    /// Reject the delivery; `requeue` asks the transport to redeliver it
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle("reject", |acknowledger| async move {
            acknowledger.reject(requeue).await.map_err(PipelineError::from)
        })
        .await
    }

    async fn settle<F, Fut>(&self, action: &str, op: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn Acknowledger>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if self
            .inner
            .settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(message_id = %self.inner.message_id, action, "Delivery already settled");
            return Ok(());
        }

        let acknowledger = self.inner.acknowledger.clone();
        let result = self.inner.breaker.call(|| op(acknowledger)).await;
        if result.is_err() {
            // Let a later attempt settle it
            self.inner.settled.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("subscription_id", &self.inner.subscription_id)
            .field("destination", &self.inner.destination)
            .field("message_id", &self.inner.message_id)
            .field("redelivery_count", &self.inner.redelivery_count)
            .field("settled", &self.is_settled())
            .finish()
    }
}
