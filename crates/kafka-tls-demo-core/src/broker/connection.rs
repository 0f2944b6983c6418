//! Single Kafka broker connection.
//!
//! Manages a TCP connection to a single Kafka broker with correlation ID
//! tracking for request/response matching. Supports both plain TCP and TLS
//! connections. Requests are serialized over the connection by a mutex.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use kafka_protocol::messages::{RequestHeader, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Request, StrBytes};
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::protocol::FrameCodec;
use crate::tls::TlsConnector;

use super::stream::BrokerStream;

/// Settings shared by every connection a client opens.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Client ID sent in request headers.
    pub client_id: String,
    /// TCP connect timeout (the TLS handshake has its own request timeout).
    pub connect_timeout: Duration,
    /// Timeout for one request/response exchange.
    pub request_timeout: Duration,
    /// TLS connector; `None` for plaintext.
    pub tls: Option<TlsConnector>,
}

impl ConnectionSettings {
    /// Derive the settings from the client configuration.
    #[must_use]
    pub fn new(config: &ClientConfig, tls: Option<TlsConnector>) -> Self {
        Self {
            client_id: config.client_id.clone(),
            connect_timeout: Duration::from_millis(config.connection_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            tls,
        }
    }
}

/// A connection to a single Kafka broker.
///
/// The underlying stream is opened lazily and dropped after any I/O error
/// or timeout, so the next request reconnects instead of reading a
/// half-consumed response.
pub struct BrokerConnection {
    broker_id: i32,
    address: String,
    client_id: StrBytes,
    stream: Mutex<Option<Framed<BrokerStream, FrameCodec>>>,
    correlation_id: AtomicI32,
    connect_timeout: Duration,
    request_timeout: Duration,
    tls_connector: Option<TlsConnector>,
}

impl BrokerConnection {
    /// Create a new broker connection (not yet connected).
    #[must_use]
    pub fn new(broker_id: i32, address: String, settings: &ConnectionSettings) -> Self {
        Self {
            broker_id,
            address,
            client_id: StrBytes::from_string(settings.client_id.clone()),
            stream: Mutex::new(None),
            correlation_id: AtomicI32::new(0),
            connect_timeout: settings.connect_timeout,
            request_timeout: settings.request_timeout,
            tls_connector: settings.tls.clone(),
        }
    }

    /// Get the broker ID (-1 for the bootstrap connection).
    #[must_use]
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check if the connection is established.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Connect to the broker if not already connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection fails or times out, or if the
    /// TLS handshake fails.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_stream().await?);
        }
        Ok(())
    }

    /// Close the connection. A later request reconnects.
    pub async fn close(&self) {
        if let Some(mut framed) = self.stream.lock().await.take() {
            let _ = framed.get_mut().shutdown().await;
            debug!(broker_id = self.broker_id, "connection closed");
        }
    }

    #[instrument(skip(self), fields(broker_id = self.broker_id, address = %self.address, tls = self.tls_connector.is_some()))]
    async fn open_stream(&self) -> Result<Framed<BrokerStream, FrameCodec>> {
        let tcp_stream =
            match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to connect to broker");
                    return Err(ClientError::BrokerUnavailable {
                        broker_id: self.broker_id,
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!("connection timeout");
                    return Err(ClientError::BrokerUnavailable {
                        broker_id: self.broker_id,
                        message: "connection timeout".to_string(),
                    });
                }
            };
        let _ = tcp_stream.set_nodelay(true);

        debug!("TCP connection established");

        let Some(connector) = &self.tls_connector else {
            return Ok(Framed::new(BrokerStream::plain(tcp_stream), FrameCodec::new()));
        };

        let server_name = self
            .address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host);

        debug!(server_name, "performing TLS handshake");

        let tls_stream = match timeout(
            self.request_timeout,
            connector.connect(server_name, tcp_stream),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: "TLS handshake timeout".to_string(),
                })
            }
        };

        debug!("TLS handshake completed");
        Ok(Framed::new(BrokerStream::tls(tls_stream), FrameCodec::new()))
    }

    /// Send a typed request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established, the
    /// exchange fails or times out, the correlation ID does not match, or
    /// the response cannot be decoded.
    pub async fn call<R: Request>(&self, request: &R, api_version: i16) -> Result<R::Response> {
        let (correlation_id, frame) = self.encode_request(request, api_version)?;
        let Some(body) = self.exchange(correlation_id, frame, true).await? else {
            return Err(ClientError::ProtocolDecode {
                message: format!("api key {}: no response", R::KEY),
            });
        };
        let mut body = body.freeze();

        let header = ResponseHeader::decode(&mut body, R::Response::header_version(api_version))
            .map_err(|e| ClientError::ProtocolDecode {
                message: format!("response header: {e}"),
            })?;

        if header.correlation_id != correlation_id {
            return Err(ClientError::CorrelationIdMismatch {
                expected: correlation_id,
                actual: header.correlation_id,
            });
        }

        R::Response::decode(&mut body, api_version).map_err(|e| ClientError::ProtocolDecode {
            message: format!("api key {}: {e}", R::KEY),
        })
    }

    /// Send a typed request for which the broker sends no response.
    ///
    /// Only Produce with `acks = 0` behaves like this.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be written.
    pub async fn send_without_response<R: Request>(
        &self,
        request: &R,
        api_version: i16,
    ) -> Result<()> {
        let (correlation_id, frame) = self.encode_request(request, api_version)?;
        self.exchange(correlation_id, frame, false).await?;
        Ok(())
    }

    fn encode_request<R: Request>(&self, request: &R, api_version: i16) -> Result<(i32, Bytes)> {
        let correlation_id = self.next_correlation_id();
        let header = RequestHeader::default()
            .with_request_api_key(R::KEY)
            .with_request_api_version(api_version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(self.client_id.clone()));

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, R::header_version(api_version))
            .map_err(|e| ClientError::ProtocolEncode {
                message: format!("request header: {e}"),
            })?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| ClientError::ProtocolEncode {
                message: format!("api key {}: {e}", R::KEY),
            })?;

        Ok((correlation_id, buf.freeze()))
    }

    /// Send one request payload and, if asked, wait for the next frame
    /// (response header and body, length prefix stripped).
    async fn exchange(
        &self,
        correlation_id: i32,
        frame: Bytes,
        expect_response: bool,
    ) -> Result<Option<BytesMut>> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_stream().await?);
        }
        let Some(framed) = guard.as_mut() else {
            return Err(ClientError::BrokerUnavailable {
                broker_id: self.broker_id,
                message: "not connected".to_string(),
            });
        };

        debug!(
            broker_id = self.broker_id,
            correlation_id,
            request_len = frame.len(),
            "sending request"
        );

        let result = timeout(self.request_timeout, async {
            framed.send(frame).await?;
            if !expect_response {
                return Ok(None);
            }
            match framed.next().await {
                Some(response) => response.map(Some),
                None => Err(ClientError::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "broker closed the connection",
                ))),
            }
        })
        .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                // The stream position is unknown now; reconnect next time.
                *guard = None;
                if matches!(e, ClientError::ProtocolDecode { .. }) {
                    warn!(
                        broker_id = self.broker_id,
                        tls = self.tls_connector.is_some(),
                        error = %e,
                        "unreadable response frame, check the enableTLS setting"
                    );
                }
                return Err(e);
            }
            Err(_) => {
                *guard = None;
                return Err(ClientError::BrokerUnavailable {
                    broker_id: self.broker_id,
                    message: "request timeout".to_string(),
                });
            }
        };

        if let Some(body) = &response {
            debug!(correlation_id, response_len = body.len(), "received response");
        }

        Ok(response)
    }

    /// Generate a new correlation ID.
    #[must_use]
    pub fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::MetadataRequest;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            client_id: "test".to_string(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(500),
            tls: None,
        }
    }

    #[test]
    fn test_broker_connection_new() {
        let conn = BrokerConnection::new(1, "localhost:9092".to_string(), &settings());
        assert_eq!(conn.broker_id(), 1);
        assert_eq!(conn.address(), "localhost:9092");
    }

    #[test]
    fn test_correlation_id_generation() {
        let conn = BrokerConnection::new(1, "localhost:9092".to_string(), &settings());
        assert_eq!(conn.next_correlation_id(), 0);
        assert_eq!(conn.next_correlation_id(), 1);
        assert_eq!(conn.next_correlation_id(), 2);
    }

    #[test]
    fn test_encoded_request_starts_with_header() {
        let conn = BrokerConnection::new(1, "localhost:9092".to_string(), &settings());
        let (id, frame) = conn
            .encode_request(&MetadataRequest::default(), crate::protocol::versions::METADATA)
            .unwrap();
        assert_eq!(id, 0);
        // api key 3 (Metadata), version 1, correlation id 0
        assert_eq!(&frame[..8], &[0, 3, 0, 1, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_tls_listener_reply_is_rejected_without_retry() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            // TLS alert record: protocol_version
            let _ = socket
                .write_all(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x46])
                .await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let conn = BrokerConnection::new(-1, addr.to_string(), &settings());
        let err = conn
            .call(&MetadataRequest::default(), crate::protocol::versions::METADATA)
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ClientError::ProtocolDecode { message } if message.contains("exceeds maximum")),
            "got {err}"
        );
        assert!(!err.is_retriable());
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = BrokerConnection::new(-1, addr.to_string(), &settings());
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::BrokerUnavailable { broker_id: -1, .. }));
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_call_against_mock_broker() {
        let broker = crate::testing::MockBroker::start(&[("orders", 2)]).await;
        let conn = BrokerConnection::new(-1, broker.address(), &settings());

        let response = conn
            .call(&MetadataRequest::default(), crate::protocol::versions::METADATA)
            .await
            .unwrap();
        assert_eq!(response.brokers.len(), 1);
        assert!(conn.is_connected().await);

        conn.close().await;
        assert!(!conn.is_connected().await);
    }
}
