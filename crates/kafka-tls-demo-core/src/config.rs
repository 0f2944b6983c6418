//! Configuration types for the Kafka TLS demos.
//!
//! Everything is built once at startup, either from command-line flags or
//! from an optional YAML file with flags layered on top, validated, and
//! then passed by reference into the client and runners.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};

/// Root of the optional YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DemoConfig {
    /// Broker address, topic and TLS material.
    #[serde(default)]
    pub connection: ConnectionParams,

    /// Connection and request timeouts.
    #[serde(default)]
    pub client: ClientConfig,

    /// Producer acknowledgement and retry policy.
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Partition consumer tuning.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where to connect and how to secure the connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionParams {
    /// Broker address, e.g. "kafka.bj.baidubce.com:9091".
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Topic to produce to or consume from. Required.
    #[serde(default)]
    pub topic: String,

    /// Whether to wrap broker connections in TLS.
    #[serde(default = "default_enable_tls")]
    pub enable_tls: bool,

    /// Client certificate (PEM) presented to the broker.
    #[serde(default = "default_client_pem")]
    pub client_pem: PathBuf,

    /// Private key (PEM) for the client certificate.
    #[serde(default = "default_client_key")]
    pub client_key: PathBuf,

    /// CA certificate (PEM) the broker certificate must chain to.
    #[serde(default = "default_ca_pem")]
    pub ca_pem: PathBuf,

    /// Skip broker certificate chain and hostname verification.
    ///
    /// INSECURE: anyone able to intercept the connection can impersonate
    /// the broker. Only meant for brokers whose certificate does not match
    /// the address used to reach them.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// TLS material for broker connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrokerTlsConfig {
    /// Client certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Client private key (PEM).
    pub key_path: PathBuf,

    /// CA certificate(s) to trust (PEM).
    pub ca_cert_path: PathBuf,

    /// Whether to skip server certificate verification (INSECURE).
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Connection level settings shared by producer and consumer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Client ID sent in every request header.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Pause before retrying a metadata lookup for a leaderless partition.
    #[serde(default = "default_metadata_retry_backoff_ms")]
    pub metadata_retry_backoff_ms: u64,
}

/// How many replicas must persist a record before the broker acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAcks {
    /// Fire and forget; the broker sends no response.
    NoResponse,
    /// Wait for the partition leader to write the record to its log.
    #[default]
    WaitForLocal,
    /// Wait for every in-sync replica.
    WaitForAll,
}

impl RequiredAcks {
    /// Value of the `acks` field in a Produce request.
    #[must_use]
    pub fn as_i16(self) -> i16 {
        match self {
            Self::NoResponse => 0,
            Self::WaitForLocal => 1,
            Self::WaitForAll => -1,
        }
    }
}

/// Producer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    /// Acknowledgement policy.
    #[serde(default)]
    pub required_acks: RequiredAcks,

    /// Retries per message before the send is reported as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between retries in milliseconds.
    #[serde(default = "default_producer_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long the broker may wait for replica acknowledgements.
    #[serde(default = "default_produce_timeout_ms")]
    pub timeout_ms: i32,

    /// Number of demo messages the producer runner sends.
    #[serde(default = "default_message_count")]
    pub message_count: usize,
}

/// What a consumer runner does when one partition stream fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorPolicy {
    /// Stop every partition worker and exit with the error.
    #[default]
    FailFast,
    /// Record the failure and keep the other partitions streaming.
    Isolate,
}

/// Partition consumer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Longest time the broker holds a fetch waiting for `min_bytes`.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: i32,

    /// Minimum bytes the broker accumulates before answering a fetch.
    #[serde(default = "default_min_bytes")]
    pub min_bytes: i32,

    /// Upper bound for a whole fetch response.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: i32,

    /// Upper bound of record data per partition in a fetch response.
    #[serde(default = "default_max_bytes")]
    pub partition_max_bytes: i32,

    /// Capacity of the message and error channels of a partition stream.
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    /// Pause before retrying a fetch that failed with a transient error.
    #[serde(default = "default_consumer_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Reaction to a failed partition stream.
    #[serde(default)]
    pub on_stream_error: StreamErrorPolicy,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

// Default value functions

/// Default broker of the managed Kafka service the demos were written for.
pub const DEFAULT_BROKER: &str = "kafka.bj.baidubce.com:9091";

fn default_broker() -> String {
    DEFAULT_BROKER.to_string()
}

fn default_enable_tls() -> bool {
    true
}

fn default_client_pem() -> PathBuf {
    PathBuf::from("client.pem")
}

fn default_client_key() -> PathBuf {
    PathBuf::from("client.key")
}

fn default_ca_pem() -> PathBuf {
    PathBuf::from("ca.pem")
}

fn default_client_id() -> String {
    "kafka-tls-demo".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_metadata_retry_backoff_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    5
}

fn default_producer_retry_backoff_ms() -> u64 {
    100
}

fn default_produce_timeout_ms() -> i32 {
    10_000
}

fn default_message_count() -> usize {
    10
}

fn default_max_wait_ms() -> i32 {
    500
}

fn default_min_bytes() -> i32 {
    1
}

fn default_max_bytes() -> i32 {
    1024 * 1024
}

fn default_channel_buffer_size() -> usize {
    256
}

fn default_consumer_retry_backoff_ms() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            topic: String::new(),
            enable_tls: default_enable_tls(),
            client_pem: default_client_pem(),
            client_key: default_client_key(),
            ca_pem: default_ca_pem(),
            insecure_skip_verify: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            metadata_retry_backoff_ms: default_metadata_retry_backoff_ms(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            required_acks: RequiredAcks::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_producer_retry_backoff_ms(),
            timeout_ms: default_produce_timeout_ms(),
            message_count: default_message_count(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            min_bytes: default_min_bytes(),
            max_bytes: default_max_bytes(),
            partition_max_bytes: default_max_bytes(),
            channel_buffer_size: default_channel_buffer_size(),
            retry_backoff_ms: default_consumer_retry_backoff_ms(),
            on_stream_error: StreamErrorPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ConnectionParams {
    /// Check the parameters that must hold before any client is built.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is empty or the broker address is not
    /// of the form `host:port`.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::MissingTopic);
        }
        if self.broker.trim().is_empty() {
            return Err(ConfigError::MissingBroker);
        }
        self.parse_broker_address()?;
        Ok(())
    }

    /// Split the broker address into host and port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_broker_address(&self) -> ConfigResult<(String, u16)> {
        let (host, port) = self
            .broker
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(self.broker.clone()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidAddress(self.broker.clone()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.broker.clone()))?;
        Ok((host.to_string(), port))
    }

    /// TLS material for the broker connections, present only when TLS is on.
    #[must_use]
    pub fn tls_config(&self) -> Option<BrokerTlsConfig> {
        self.enable_tls.then(|| BrokerTlsConfig {
            cert_path: self.client_pem.clone(),
            key_path: self.client_key.clone(),
            ca_cert_path: self.ca_pem.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
        })
    }
}

impl ConsumerConfig {
    /// Validate the consumer settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel would have no capacity or a fetch
    /// limit is not positive.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.channel_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.channel_buffer_size",
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_bytes <= 0 || self.partition_max_bytes <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.max_bytes",
                message: "fetch limits must be positive".to_string(),
            });
        }
        if self.max_wait_ms < 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.max_wait_ms",
                message: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

// Configuration loading and validation

impl DemoConfig {
    /// Load configuration from a YAML file.
    ///
    /// The topic is not checked here since it usually comes from the
    /// command line; [`ConnectionParams::validate`] runs before connecting.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the settings that do not depend on command-line input.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.consumer.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(topic: &str) -> ConnectionParams {
        ConnectionParams {
            topic: topic.to_string(),
            ..ConnectionParams::default()
        }
    }

    #[test]
    fn test_defaults_match_cli_contract() {
        let p = ConnectionParams::default();
        assert_eq!(p.broker, "kafka.bj.baidubce.com:9091");
        assert!(p.topic.is_empty());
        assert!(p.enable_tls);
        assert_eq!(p.client_pem, PathBuf::from("client.pem"));
        assert_eq!(p.client_key, PathBuf::from("client.key"));
        assert_eq!(p.ca_pem, PathBuf::from("ca.pem"));
        assert!(!p.insecure_skip_verify);
    }

    #[test]
    fn test_empty_topic_rejected() {
        assert!(matches!(params("").validate(), Err(ConfigError::MissingTopic)));
        assert!(matches!(params("  ").validate(), Err(ConfigError::MissingTopic)));
        assert!(params("orders").validate().is_ok());
    }

    #[test]
    fn test_broker_address_parsing() {
        let mut p = params("t");
        assert_eq!(
            p.parse_broker_address().unwrap(),
            ("kafka.bj.baidubce.com".to_string(), 9091)
        );

        p.broker = "localhost".to_string();
        assert!(matches!(p.validate(), Err(ConfigError::InvalidAddress(_))));

        p.broker = ":9092".to_string();
        assert!(matches!(p.validate(), Err(ConfigError::InvalidAddress(_))));

        p.broker = String::new();
        assert!(matches!(p.validate(), Err(ConfigError::MissingBroker)));
    }

    #[test]
    fn test_tls_config_only_when_enabled() {
        let mut p = params("t");
        let tls = p.tls_config().unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("client.pem"));
        assert_eq!(tls.ca_cert_path, PathBuf::from("ca.pem"));

        p.enable_tls = false;
        assert!(p.tls_config().is_none());
    }

    #[test]
    fn test_producer_defaults() {
        let p = ProducerConfig::default();
        assert_eq!(p.required_acks, RequiredAcks::WaitForLocal);
        assert_eq!(p.required_acks.as_i16(), 1);
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.message_count, 10);
    }

    #[test]
    fn test_zero_channel_buffer_rejected() {
        let config = ConsumerConfig {
            channel_buffer_size: 0,
            ..ConsumerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_yaml_string() {
        let yaml = r"
connection:
  broker: 'localhost:9093'
  topic: 'orders'
  enable_tls: false
producer:
  required_acks: wait_for_all
  max_retries: 2
consumer:
  on_stream_error: isolate
logging:
  level: debug
";
        let config = DemoConfig::from_str(yaml).unwrap();
        assert_eq!(config.connection.broker, "localhost:9093");
        assert_eq!(config.connection.topic, "orders");
        assert!(!config.connection.enable_tls);
        assert_eq!(config.connection.ca_pem, PathBuf::from("ca.pem"));
        assert_eq!(config.producer.required_acks, RequiredAcks::WaitForAll);
        assert_eq!(config.producer.max_retries, 2);
        assert_eq!(config.producer.message_count, 10);
        assert_eq!(config.consumer.on_stream_error, StreamErrorPolicy::Isolate);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = DemoConfig::from_str("{}").unwrap();
        assert_eq!(config.connection.broker, DEFAULT_BROKER);
        assert_eq!(config.client.request_timeout_ms, 30_000);
        assert_eq!(config.consumer.max_wait_ms, 500);
    }

    #[test]
    fn test_invalid_yaml() {
        let result = DemoConfig::from_str("connection: [");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = DemoConfig::from_file("/nonexistent/demo.yaml");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }
}
