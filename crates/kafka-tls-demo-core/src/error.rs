//! Domain error types for the Kafka TLS demos.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! Every variant is fatal for the demo binaries; the split only tells the
//! operator which stage failed.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
///
/// These are detected before any network I/O happens.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The topic argument was empty.
    #[error("argument topic is required")]
    MissingTopic,

    /// The broker address was empty.
    #[error("argument broker is required")]
    MissingBroker,

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// A numeric setting is outside its allowed range.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Errors raised while building or using the TLS security context.
#[derive(Error, Debug)]
pub enum TlsError {
    /// A certificate or key file does not exist or cannot be opened.
    #[error("certificate file '{path}' could not be opened: {source}")]
    CertificateFileMissing {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A certificate or key file exists but is empty.
    #[error("please replace {0} with your own")]
    EmptyCertificateFile(String),

    /// Failed to read a certificate file.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Failed to read a private key file.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// The file contained no usable certificates.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// The file contained no usable private key.
    #[error("no private key found in '{0}'")]
    NoPrivateKeys(String),

    /// The rustls configuration could not be built.
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// The TLS handshake with the broker failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

/// Errors that occur while talking to the Kafka cluster.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid configuration, detected before connecting.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TLS context could not be built or the handshake failed.
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Failed to decode a Kafka protocol message.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to encode a Kafka protocol message.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// Broker is not available or connection failed.
    #[error("broker {broker_id} unavailable: {message}")]
    BrokerUnavailable { broker_id: i32, message: String },

    /// Topic was not found in metadata.
    #[error("topic not found: {topic}")]
    TopicNotFound { topic: String },

    /// Partition is not part of the topic metadata.
    #[error("partition {partition} not found for topic {topic}")]
    PartitionNotFound { topic: String, partition: i32 },

    /// The partition currently has no leader.
    #[error("no leader available for {topic}/{partition}")]
    LeaderNotAvailable { topic: String, partition: i32 },

    /// The broker answered with a Kafka error code.
    #[error("{api} failed for {topic}/{partition}: {} (code {code})", crate::protocol::error_codes::describe(*.code))]
    Broker {
        api: &'static str,
        topic: String,
        partition: i32,
        code: i16,
    },

    /// Request correlation ID mismatch.
    #[error("correlation ID mismatch: expected {expected}, got {actual}")]
    CorrelationIdMismatch { expected: i32, actual: i32 },

    /// A send kept failing after all retries.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    /// The partition stream ended without reporting an error.
    #[error("partition stream for {topic}/{partition} closed unexpectedly")]
    StreamClosed { topic: String, partition: i32 },

    /// A worker task panicked or was cancelled.
    #[error("partition worker failed: {0}")]
    Worker(String),
}

impl ClientError {
    /// Whether retrying the same request after a backoff may succeed.
    ///
    /// Connection-level failures are always retriable; Kafka errors are
    /// retriable when the broker flags them so.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::BrokerUnavailable { .. }
            | Self::LeaderNotAvailable { .. } => true,
            Self::Broker { code, .. } => crate::protocol::error_codes::is_retriable(*code),
            _ => false,
        }
    }

    /// Whether the partition leader should be looked up again before retrying.
    #[must_use]
    pub fn requires_metadata_refresh(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::BrokerUnavailable { .. }
            | Self::LeaderNotAvailable { .. } => true,
            Self::Broker { code, .. } => {
                crate::protocol::error_codes::requires_metadata_refresh(*code)
            }
            _ => false,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
