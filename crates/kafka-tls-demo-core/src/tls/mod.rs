//! TLS support for broker connections.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kafka_tls_demo_core::tls::build_tls_connector;
//!
//! let connector = build_tls_connector(&params.tls_config().unwrap())?;
//! let tls_stream = connector.connect("kafka.example.com", tcp_stream).await?;
//! ```

pub mod client;
pub mod verifier;

pub use client::{build_tls_connector, check_file, TlsConnector};
pub use verifier::NoServerVerification;
