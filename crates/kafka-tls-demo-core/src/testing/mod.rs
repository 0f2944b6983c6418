//! Test utilities for the Kafka TLS demos.
//!
//! - [`MockBroker`] - an in-process single-node broker, plain or TLS
//! - [`certs`] - a self-signed certificate and a small CA with signed server
//!   and client leaves, written to temp files on demand
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_tls_demo_core::testing::MockBroker;
//!
//! #[tokio::test]
//! async fn test_produce() {
//!     let broker = MockBroker::start(&[("orders", 3)]).await;
//!     // point ConnectionParams::broker at broker.address() ...
//!     assert_eq!(broker.values("orders", 0), vec!["0-hello kafka"]);
//! }
//! ```

pub mod certs;
pub mod mock_broker;

pub use mock_broker::{BrokerCall, MockBroker};
