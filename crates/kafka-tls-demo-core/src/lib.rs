//! Kafka TLS Demo Core Library
//!
//! A small Kafka client and the two demo programs built on it: a producer
//! that sends ten messages and a consumer that streams every partition of
//! a topic, both over mutual TLS to a managed Kafka service.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Connection parameters and tuning, YAML loading and validation
//! - [`error`] - Domain-specific error types
//! - [`tls`] - TLS security context built from PEM files
//! - [`protocol`] - Frame codec, record batches and Kafka error codes
//! - [`broker`] - Broker connections and the connection pool
//! - [`client`] - Metadata, synchronous producer and partition consumer
//! - [`runner`] - The producer and consumer demo programs
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_tls_demo_core::config::{ClientConfig, ConnectionParams, ProducerConfig};
//! use kafka_tls_demo_core::runner::run_producer;
//!
//! let params = ConnectionParams { topic: "orders".into(), ..Default::default() };
//! let report = run_producer(&params, &ClientConfig::default(), &ProducerConfig::default()).await?;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod runner;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use broker::{BrokerConnection, BrokerPool, BrokerStream};
pub use client::{ConsumedMessage, KafkaClient, Offset, PartitionConsumer, ProducerMessage, SyncProducer};
pub use config::{
    BrokerTlsConfig, ClientConfig, ConnectionParams, ConsumerConfig, DemoConfig, LoggingConfig,
    ProducerConfig, RequiredAcks, StreamErrorPolicy,
};
pub use error::{ClientError, ConfigError, Result, TlsError};
pub use runner::{
    run_consumer, run_producer, ConsumeReport, ConsumerRunner, LogMessageHandler, MessageHandler,
    Outcome, PartitionSummary, ProduceReport, Shutdown, ShutdownSignal,
};
pub use tls::{build_tls_connector, TlsConnector};
