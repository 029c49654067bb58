//! NATS transport (core NATS, at-most-once).
//!
//! Core NATS has no broker-side acknowledgement, so ack and reject are
//! no-ops and a rejected message is not redelivered. Poison tracking still
//! applies; use a queue-semantics transport where redelivery matters.

use crate::messaging::config::NatsConfig;
use crate::messaging::envelope::{headers, Headers};
use crate::messaging::error::{TransportError, TransportResult};
use crate::messaging::transport::{
    BrokerTransport, Delivery, DeliveryStream, NoopAcknowledger, TransportSubscribeOptions,
};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Header keys forwarded to and from NATS message headers
const FORWARDED_HEADERS: &[&str] = &[
    headers::MESSAGE_ID,
    headers::MESSAGE_TYPE,
    headers::CORRELATION_ID,
    headers::ROUTING_KEY,
    headers::TIMESTAMP,
    headers::CONTENT_TYPE,
    headers::CONTENT_ENCODING,
    headers::SOURCE,
    headers::DEAD_LETTER_REASON,
    headers::DEAD_LETTER_ATTEMPTS,
    headers::ORIGINAL_DESTINATION,
];

/// Session-topic transport over `async-nats`
pub struct NatsTransport {
    client: Arc<Client>,
    config: NatsConfig,
}

impl NatsTransport {
    /// Connect to the first configured server
    pub async fn connect(config: NatsConfig) -> TransportResult<Self> {
        let server = config.servers.first().cloned().ok_or_else(|| {
            TransportError::ConnectionFailed("no NATS servers configured".to_string())
        })?;

        let mut options = ConnectOptions::new()
            .name(&config.connection_name)
            .ping_interval(config.ping_interval)
            .request_timeout(Some(config.request_timeout));
        if let Some(max_reconnects) = config.max_reconnects {
            options = options.max_reconnects(max_reconnects);
        }

        let client = async_nats::connect_with_options(server.as_str(), options)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("NATS connection failed: {}", e)))?;

        info!(server = %server, name = %config.connection_name, "Connected to NATS");
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

fn to_nats_headers(headers: &Headers) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    for (key, value) in headers {
        if FORWARDED_HEADERS.contains(&key.as_str()) {
            map.insert(key.as_str(), value.as_str());
        }
    }
    map
}

fn from_nats_headers(map: Option<&async_nats::HeaderMap>) -> Headers {
    let mut headers = Headers::new();
    if let Some(map) = map {
        for key in FORWARDED_HEADERS {
            if let Some(value) = map.get(*key) {
                headers.insert(key.to_string(), value.as_str().to_string());
            }
        }
    }
    headers
}

#[async_trait]
impl BrokerTransport for NatsTransport {
    fn name(&self) -> &str {
        "nats"
    }

    async fn publish_raw(
        &self,
        destination: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> TransportResult<()> {
        self.client
            .publish_with_headers(
                destination.to_string(),
                to_nats_headers(headers),
                payload.to_vec().into(),
            )
            .await
            .map_err(|e| TransportError::PublishFailed(format!("NATS publish failed: {}", e)))?;

        debug!(destination, size = payload.len(), "Published to NATS");
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        options: &TransportSubscribeOptions,
    ) -> TransportResult<Box<dyn DeliveryStream>> {
        let subscriber = match &options.group {
            Some(group) => {
                self.client
                    .queue_subscribe(destination.to_string(), group.clone())
                    .await
            }
            None => self.client.subscribe(destination.to_string()).await,
        }
        .map_err(|e| TransportError::SubscribeFailed(format!("NATS subscribe failed: {}", e)))?;

        Ok(Box::new(NatsDeliveryStream { subscriber }))
    }

    async fn close(&self) -> TransportResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("NATS flush failed: {}", e)))
    }
}

struct NatsDeliveryStream {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl DeliveryStream for NatsDeliveryStream {
    async fn next_delivery(&mut self) -> TransportResult<Option<Delivery>> {
        Ok(self.subscriber.next().await.map(|message| {
            Delivery::new(
                message.payload.to_vec(),
                from_nats_headers(message.headers.as_ref()),
                0,
                Arc::new(NoopAcknowledger),
            )
        }))
    }
}
