//! Broker transport abstraction.
//!
//! One implementation per broker. The pipeline only ever talks to
//! `dyn BrokerTransport`, so swapping brokers never touches handler code.

use crate::messaging::envelope::{headers, Headers};
use crate::messaging::error::TransportResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Transport-level subscription settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSubscribeOptions {
    /// Deliveries the broker may push ahead of acknowledgement
    pub prefetch: usize,

    /// Competing-consumer group, where the broker supports one
    pub group: Option<String>,
}

impl Default for TransportSubscribeOptions {
    fn default() -> Self {
        Self {
            prefetch: 16,
            group: None,
        }
    }
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> TransportResult<()>;

    /// Negative acknowledgement; `requeue` asks the broker to redeliver
    async fn reject(&self, requeue: bool) -> TransportResult<()>;
}

/// Acknowledger for at-most-once transports where settling is a no-op
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAcknowledger;

#[async_trait]
impl Acknowledger for NoopAcknowledger {
    async fn ack(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> TransportResult<()> {
        Ok(())
    }
}

/// One raw message handed over by a transport
pub struct Delivery {
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// How many times the broker has delivered this message before
    pub redelivery_count: u32,
    acknowledger: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        headers: Headers,
        redelivery_count: u32,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            headers,
            redelivery_count,
            acknowledger,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID).map(String::as_str)
    }

    pub fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        self.acknowledger.clone()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("redelivery_count", &self.redelivery_count)
            .finish()
    }
}

/// Stream of deliveries for one subscription
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery; `None` once the subscription has ended.
    ///
    /// Must be cancel safe: dropping the future loses no delivery.
    async fn next_delivery(&mut self) -> TransportResult<Option<Delivery>>;
}

/// Raw publish/subscribe primitives of one broker
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    async fn publish_raw(
        &self,
        destination: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> TransportResult<()>;

    async fn subscribe(
        &self,
        destination: &str,
        options: &TransportSubscribeOptions,
    ) -> TransportResult<Box<dyn DeliveryStream>>;

    async fn close(&self) -> TransportResult<()>;
}
