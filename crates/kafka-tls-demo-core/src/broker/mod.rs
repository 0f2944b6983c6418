//! Broker connection management.
//!
//! This module provides:
//! - Connections to single Kafka brokers, plain or TLS
//! - Typed request/response exchange with correlation checks
//! - A pool with the bootstrap connection, discovered brokers and cached
//!   partition leaders

pub mod connection;
pub mod pool;
pub mod stream;

pub use connection::{BrokerConnection, ConnectionSettings};
pub use pool::{BrokerInfo, BrokerPool, PartitionMetadata, TopicMetadata};
pub use stream::BrokerStream;
