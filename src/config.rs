//! Typed configuration surface consumed at `Supervisor::initialize` (spec §6, §9).
//!
//! The core never loads or merges config files itself (external, per
//! Non-goals) — it only owns this struct tree and the single validation
//! phase (`Config::validate`) that must run before any I/O, generalizing
//! the teacher's flat `Config`/`ExchangeConfig` into the nested surface
//! spec §6 names.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub service: ServiceConfig,
    pub adapters: Vec<AdapterConfig>,
    pub dataflow: DataflowConfig,
    pub publisher: PublisherConfig,
    pub broadcast: BroadcastConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Single validation phase run before any I/O (design note §9:
    /// "dynamic per-call configuration objects ... validation is a
    /// single phase before any I/O").
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.adapters.iter().all(|a| !a.enabled) {
            return Err(ConfigError::NoEnabledAdapters);
        }
        for adapter in &self.adapters {
            if adapter.enabled && adapter.subscription.symbols.is_empty() {
                return Err(ConfigError::EmptySymbolList(adapter.name.clone()));
            }
            if adapter.connection.heartbeat_interval.is_zero() {
                return Err(ConfigError::ZeroHeartbeatInterval(adapter.name.clone()));
            }
        }
        if self.dataflow.performance.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.dataflow.performance.backpressure_threshold > self.dataflow.performance.max_queue_size {
            return Err(ConfigError::BackpressureThresholdExceedsQueueSize);
        }
        if self.publisher.batching.max_messages == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.broadcast.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no enabled adapters in configuration")]
    NoEnabledAdapters,
    #[error("adapter '{0}' has an empty symbol list")]
    EmptySymbolList(String),
    #[error("adapter '{0}' has a zero heartbeat interval")]
    ZeroHeartbeatInterval(String),
    #[error("dataflow.performance.maxQueueSize must be non-zero")]
    ZeroQueueSize,
    #[error("dataflow.performance.backpressureThreshold must not exceed maxQueueSize")]
    BackpressureThresholdExceedsQueueSize,
    #[error("publisher.batching.maxMessages must be non-zero")]
    ZeroBatchSize,
    #[error("broadcast.maxConnections must be non-zero")]
    ZeroMaxConnections,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    pub name: String,
    pub enabled: bool,
    pub endpoints: AdapterEndpoints,
    pub connection: AdapterConnectionConfig,
    pub subscription: AdapterSubscriptionConfig,
    #[serde(default)]
    pub extensions: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterEndpoints {
    pub ws: String,
    #[serde(default)]
    pub rest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConnectionConfig {
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub retry_interval: Duration,
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSubscriptionConfig {
    pub symbols: Vec<String>,
    pub data_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataflowConfig {
    pub batching: DataflowBatchingConfig,
    pub performance: DataflowPerformanceConfig,
    pub error_handling: DataflowErrorHandlingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataflowBatchingConfig {
    pub enabled: bool,
    pub batch_size: usize,
    #[serde(with = "duration_millis")]
    pub flush_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataflowPerformanceConfig {
    pub max_queue_size: usize,
    #[serde(with = "duration_millis")]
    pub processing_timeout: Duration,
    pub enable_backpressure: bool,
    pub backpressure_threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataflowErrorHandlingConfig {
    pub retry_count: u32,
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    pub enable_circuit_breaker: bool,
    pub circuit_breaker_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherConfig {
    pub batching: PublisherBatchingConfig,
    pub retry: PublisherRetryConfig,
    pub flow_control: PublisherFlowControlConfig,
    pub compression: PublisherCompressionConfig,
    pub topic_settings: PublisherTopicSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherBatchingConfig {
    pub max_messages: usize,
    pub max_bytes: usize,
    #[serde(with = "duration_millis")]
    pub max_milliseconds: Duration,
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherRetryConfig {
    #[serde(default)]
    pub retry_codes: Vec<String>,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_retry_delay: Duration,
    pub retry_delay_multiplier: f64,
    #[serde(with = "duration_millis")]
    pub max_retry_delay: Duration,
    #[serde(with = "duration_millis")]
    pub total_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherFlowControlConfig {
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
    pub allow_excess_messages: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherCompressionConfig {
    pub enabled: bool,
    pub threshold: usize,
    pub algorithm: CompressionAlgorithm,
    #[serde(default)]
    pub adaptive_floor_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherTopicSettings {
    pub auto_create: bool,
    pub retention_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastConfig {
    pub max_connections: usize,
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
    pub rate_limit: BroadcastRateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRateLimitConfig {
    pub max_messages_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    pub max_size: usize,
    #[serde(with = "duration_millis")]
    pub ttl: Duration,
}

/// (De)serializes a `Duration` from a plain millisecond integer, the
/// format every `*IntervalMs`/`*TimeoutMs` field in spec §6 uses.
mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "service": { "host": "0.0.0.0", "port": 8080, "environment": "test" },
            "adapters": [{
                "name": "binance",
                "enabled": true,
                "endpoints": { "ws": "wss://stream.binance.com:9443" },
                "connection": {
                    "timeout": 5000,
                    "maxRetries": 5,
                    "retryInterval": 1000,
                    "heartbeatInterval": 30000
                },
                "subscription": { "symbols": ["BTC/USDT"], "dataTypes": ["trade"] }
            }],
            "dataflow": {
                "batching": { "enabled": true, "batchSize": 100, "flushTimeout": 250 },
                "performance": {
                    "maxQueueSize": 1024,
                    "processingTimeout": 5000,
                    "enableBackpressure": true,
                    "backpressureThreshold": 800
                },
                "errorHandling": {
                    "retryCount": 3,
                    "retryDelay": 500,
                    "enableCircuitBreaker": true,
                    "circuitBreakerThreshold": 5
                }
            },
            "publisher": {
                "batching": {
                    "maxMessages": 50,
                    "maxBytes": 1048576,
                    "maxMilliseconds": 200,
                    "maxOutstandingMessages": 500,
                    "maxOutstandingBytes": 10485760
                },
                "retry": {
                    "retryCodes": ["BATCH_FAILED_TRANSIENT"],
                    "maxRetries": 5,
                    "initialRetryDelay": 100,
                    "retryDelayMultiplier": 2.0,
                    "maxRetryDelay": 5000,
                    "totalTimeout": 30000
                },
                "flowControl": {
                    "maxOutstandingMessages": 500,
                    "maxOutstandingBytes": 10485760,
                    "allowExcessMessages": false
                },
                "compression": { "enabled": true, "threshold": 1024, "algorithm": "gzip" },
                "topicSettings": { "autoCreate": true, "retentionSeconds": 3600 }
            },
            "broadcast": {
                "maxConnections": 1000,
                "idleTimeout": 60000,
                "cleanupInterval": 30000,
                "rateLimit": { "maxMessagesPerMinute": 120 }
            },
            "cache": { "maxSize": 10000, "ttl": 60000 }
        }))
        .expect("sample config must deserialize")
    }

    #[test]
    fn sample_config_passes_validation() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn validation_rejects_no_enabled_adapters() {
        let mut cfg = sample_config();
        cfg.adapters[0].enabled = false;
        assert_eq!(cfg.validate(), Err(ConfigError::NoEnabledAdapters));
    }

    #[test]
    fn validation_rejects_empty_symbol_list() {
        let mut cfg = sample_config();
        cfg.adapters[0].subscription.symbols.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptySymbolList("binance".into())));
    }

    #[test]
    fn validation_rejects_backpressure_above_queue_size() {
        let mut cfg = sample_config();
        cfg.dataflow.performance.backpressure_threshold = cfg.dataflow.performance.max_queue_size + 1;
        assert_eq!(cfg.validate(), Err(ConfigError::BackpressureThresholdExceedsQueueSize));
    }
}
