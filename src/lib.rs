//! Transport-agnostic message resilience pipeline.
//!
//! `resilient-messaging` sits between application handlers and broker
//! transports and gives every transport the same delivery, failure-isolation
//! and compensation behaviour:
//!
//! - [`circuit_breaker`]: per-destination failure isolation
//! - [`backpressure`]: admission control for publishes
//! - [`poison`]: per-message failure tracking and quarantine
//! - [`retry`]: transient-error classification and backoff
//! - [`messaging`]: envelopes, codecs, transports and the [`MessagePipeline`]
//! - [`saga`]: compensating multi-step workflows
//!
//! Configuration lives in [`ResilienceConfig`]; metrics go through a
//! [`telemetry::TelemetrySink`].

pub mod backpressure;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod messaging;
pub mod poison;
pub mod retry;
pub mod saga;
pub mod telemetry;

pub use backpressure::{BackpressureController, BackpressureConfig, ThrottlePolicy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState};
pub use config::ResilienceConfig;
pub use error::{PipelineError, PipelineResult};
pub use messaging::{
    BrokerTransport, Envelope, InMemoryTransport, Message, MessageContext, MessageHandler,
    MessagePipeline, PublishOptions, SubscriptionOptions,
};
pub use poison::{PoisonDecision, PoisonMessageGuard};
pub use retry::{RetryConfig, RetryExecutor};
pub use saga::{SagaDefinition, SagaOrchestrator, SagaState, SagaStep};
pub use telemetry::{NoopTelemetry, PrometheusTelemetry, TelemetrySink};
