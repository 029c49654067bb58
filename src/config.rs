use crate::backpressure::BackpressureConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::Result;
use crate::messaging::MessagingConfig;
use crate::poison::PoisonConfig;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix, e.g. `RESILIENCE__RETRY__MAX_ATTEMPTS=5`
const ENV_PREFIX: &str = "RESILIENCE";

/// Aggregate configuration for a pipeline and its resilience components
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Breaker settings applied to every destination
    pub circuit_breaker: CircuitBreakerConfig,

    /// Admission control for publishes
    pub backpressure: BackpressureConfig,

    /// Poison-message quarantine
    pub poison: PoisonConfig,

    /// Local retry policy for transport calls
    pub retry: RetryConfig,

    /// Destinations, compression and transport settings
    pub messaging: MessagingConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl ResilienceConfig {
    /// Load configuration from the embedded defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ));

        // Override with config file if it exists
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let loaded: Self = builder
            // Override with environment variables (prefix: RESILIENCE__)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker.validate()?;
        self.backpressure.validate()?;
        self.poison.validate()?;
        self.retry.validate()?;
        self.messaging.validate()?;
        Ok(())
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_level: String,

    /// Emit JSON formatted log lines
    pub json_logs: bool,

    /// Prefix for exported Prometheus metrics
    pub metrics_namespace: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "resilient_messaging=info".to_string(),
            json_logs: false,
            metrics_namespace: "resilient_messaging".to_string(),
        }
    }
}

/// (De)serialize a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    /// Same as the parent module for `Option<Duration>`
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
