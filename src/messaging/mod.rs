//! Typed, broker-agnostic messaging with built-in resilience.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               MessagePipeline                    │
//! ├─────────────────────────────────────────────────┤
//! │  publish()  subscribe()  unsubscribe()          │
//! │  shutdown()                                      │
//! └─────────────────────────────────────────────────┘
//!      │ publish                    ▲ deliveries
//!      ▼                            │
//! ┌──────────────────┐    ┌──────────────────────────┐
//! │ validate, encode │    │ decode, handle           │
//! │ backpressure     │    │ poison tracking          │
//! │ retry, breaker   │    │ dead-letter, ack/reject  │
//! └──────────────────┘    └──────────────────────────┘
//!           │                        │
//!           ▼                        │
//! ┌─────────────────────────────────────────────────┐
//! │     BrokerTransport (in-memory, NATS, ...)       │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use resilient_messaging::messaging::{
//!     HandlerError, InMemoryTransport, Message, MessageContext, MessagePipeline,
//!     PublishOptions, SubscriptionOptions,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: String,
//! }
//!
//! impl Message for OrderPlaced {
//!     const MESSAGE_TYPE: &'static str = "order_placed";
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = MessagePipeline::builder(Arc::new(InMemoryTransport::new())).build()?;
//!
//!     pipeline
//!         .subscribe::<OrderPlaced, _>(
//!             |order: OrderPlaced, _ctx: MessageContext| async move {
//!                 println!("placed {}", order.order_id);
//!                 Ok::<_, HandlerError>(())
//!             },
//!             SubscriptionOptions::default(),
//!         )
//!         .await?;
//!
//!     let order = OrderPlaced { order_id: "o-1".to_string() };
//!     pipeline.publish(&order, PublishOptions::default()).await?;
//!
//!     pipeline.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod codec;
mod config;
mod context;
mod dead_letter;
mod envelope;
mod error;
mod handler;
mod memory;
mod nats;
mod pipeline;
mod subscription;
mod transport;

pub use codec::{compress, decode, decompress, encode, Codec, EncodedPayload, JsonCodec, MessageValidator, LZ4_ENCODING};
pub use config::{CompressionConfig, MessagingConfig, NatsConfig};
pub use context::MessageContext;
pub use dead_letter::{
    DeadLetterReason, DeadLetterRecord, DeadLetterSink, InMemoryDeadLetterSink,
    TransportDeadLetterSink,
};
pub use envelope::{headers, Envelope, EnvelopeBuilder, Headers, Message};
pub use error::{TransportError, TransportResult};
pub use handler::{HandlerError, HandlerResult, MessageHandler};
pub use memory::InMemoryTransport;
pub use nats::NatsTransport;
pub use pipeline::{MessagePipeline, MessagePipelineBuilder, PublishOptions};
pub use subscription::{AckMode, RedeliveryMode, SubscriptionId, SubscriptionInfo, SubscriptionOptions};
pub use transport::{
    Acknowledger, BrokerTransport, Delivery, DeliveryStream, NoopAcknowledger,
    TransportSubscribeOptions,
};
