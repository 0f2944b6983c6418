//! Broker connection pool.
//!
//! Holds the bootstrap connection, one connection per broker discovered
//! from Metadata responses, and the cached partition leaders of the topics
//! the client has looked at.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::MetadataRequest;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::protocol::{error_codes, topic_name, versions};

use super::connection::{BrokerConnection, ConnectionSettings};

/// Broker ID used for the bootstrap connection.
pub const BOOTSTRAP_BROKER_ID: i32 = -1;

/// Manages connections to Kafka brokers.
pub struct BrokerPool {
    settings: ConnectionSettings,
    /// Connection to the configured broker address.
    bootstrap: Arc<BrokerConnection>,
    /// Connections indexed by broker ID.
    connections: DashMap<i32, Arc<BrokerConnection>>,
    /// Known brokers indexed by broker ID.
    brokers: DashMap<i32, BrokerInfo>,
    /// Cached topic metadata indexed by topic name.
    topics: DashMap<String, TopicMetadata>,
    metadata_retry_backoff: Duration,
}

impl BrokerPool {
    /// Create a new broker pool for the given bootstrap address.
    #[must_use]
    pub fn new(
        bootstrap_address: String,
        settings: ConnectionSettings,
        metadata_retry_backoff: Duration,
    ) -> Self {
        let bootstrap = Arc::new(BrokerConnection::new(
            BOOTSTRAP_BROKER_ID,
            bootstrap_address,
            &settings,
        ));
        Self {
            settings,
            bootstrap,
            connections: DashMap::new(),
            brokers: DashMap::new(),
            topics: DashMap::new(),
            metadata_retry_backoff,
        }
    }

    /// Connect to the bootstrap broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the TLS handshake fails.
    pub async fn connect(&self) -> Result<()> {
        self.bootstrap.connect().await?;
        info!(
            server = %self.bootstrap.address(),
            tls = self.settings.tls.is_some(),
            "connected to bootstrap server"
        );
        Ok(())
    }

    /// Get the connection to a specific broker by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is not known.
    pub fn get_broker(&self, broker_id: i32) -> Result<Arc<BrokerConnection>> {
        if let Some(conn) = self.connections.get(&broker_id) {
            return Ok(Arc::clone(conn.value()));
        }

        Err(ClientError::BrokerUnavailable {
            broker_id,
            message: "broker not in pool".to_string(),
        })
    }

    /// Open a new connection to a broker that nobody else shares.
    ///
    /// Partition streams use these so a long-polling fetch never queues
    /// behind, or is cancelled in the middle of, another request.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unknown or cannot be reached.
    pub async fn open_dedicated(&self, broker_id: i32) -> Result<BrokerConnection> {
        let address = self
            .brokers
            .get(&broker_id)
            .map(|b| b.address())
            .ok_or_else(|| ClientError::BrokerUnavailable {
                broker_id,
                message: "broker not in pool".to_string(),
            })?;

        let conn = BrokerConnection::new(broker_id, address, &self.settings);
        conn.connect().await?;
        debug!(broker_id, address = %conn.address(), "opened dedicated connection");
        Ok(conn)
    }

    /// Fetch metadata for one topic and update the broker and leader caches.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the topic does not exist, or
    /// the broker reports an error for the topic.
    pub async fn refresh_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let request = MetadataRequest::default().with_topics(Some(vec![
            MetadataRequestTopic::default().with_name(Some(topic_name(topic))),
        ]));

        let response = match self.bootstrap.call(&request, versions::METADATA).await {
            Ok(response) => response,
            Err(e) => {
                // Fall back to any broker we already know about.
                let Some(conn) = self.any_broker() else {
                    return Err(e);
                };
                warn!(error = %e, fallback = conn.broker_id(), "bootstrap metadata request failed");
                conn.call(&request, versions::METADATA).await?
            }
        };

        self.update_brokers(
            response
                .brokers
                .iter()
                .map(|b| BrokerInfo::new(b.node_id.0, b.host.to_string(), b.port))
                .collect(),
        );

        let topic_response = response
            .topics
            .iter()
            .find(|t| t.name.as_ref().is_some_and(|n| &*n.0 == topic))
            .ok_or_else(|| ClientError::TopicNotFound {
                topic: topic.to_string(),
            })?;

        match topic_response.error_code {
            error_codes::NONE => {}
            error_codes::UNKNOWN_TOPIC_OR_PARTITION => {
                return Err(ClientError::TopicNotFound {
                    topic: topic.to_string(),
                })
            }
            code => {
                return Err(ClientError::Broker {
                    api: "Metadata",
                    topic: topic.to_string(),
                    partition: -1,
                    code,
                })
            }
        }

        let partitions = topic_response
            .partitions
            .iter()
            .map(|p| {
                (
                    p.partition_index,
                    PartitionMetadata {
                        leader: p.leader_id.0,
                        error_code: p.error_code,
                    },
                )
            })
            .collect();
        let metadata = TopicMetadata { partitions };

        debug!(
            topic,
            partitions = metadata.partitions.len(),
            brokers = self.brokers.len(),
            "refreshed metadata"
        );
        self.topics.insert(topic.to_string(), metadata.clone());
        Ok(metadata)
    }

    /// Cached metadata for a topic, fetched on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata has to be fetched and that fails.
    pub async fn topic_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        if let Some(cached) = self.topics.get(topic) {
            return Ok(cached.value().clone());
        }
        self.refresh_metadata(topic).await
    }

    /// ID of the broker currently leading a partition.
    ///
    /// A partition without a leader gets one more metadata refresh after
    /// the configured backoff before the lookup gives up.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::PartitionNotFound`] or
    /// [`ClientError::LeaderNotAvailable`], or any metadata error.
    pub async fn leader_id(&self, topic: &str, partition: i32) -> Result<i32> {
        let metadata = self.topic_metadata(topic).await?;
        match metadata.leader(partition) {
            Some(leader) if leader >= 0 => return Ok(leader),
            Some(_) => {}
            None => {
                return Err(ClientError::PartitionNotFound {
                    topic: topic.to_string(),
                    partition,
                })
            }
        }

        tokio::time::sleep(self.metadata_retry_backoff).await;
        let metadata = self.refresh_metadata(topic).await?;
        match metadata.leader(partition) {
            Some(leader) if leader >= 0 => Ok(leader),
            _ => Err(ClientError::LeaderNotAvailable {
                topic: topic.to_string(),
                partition,
            }),
        }
    }

    /// Shared connection to the leader of a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the leader cannot be determined.
    pub async fn leader_for(&self, topic: &str, partition: i32) -> Result<Arc<BrokerConnection>> {
        let leader = self.leader_id(topic, partition).await?;
        self.get_broker(leader)
    }

    /// Register brokers from a Metadata response.
    ///
    /// Connections are created lazily; a broker whose address changed gets
    /// a fresh connection.
    pub fn update_brokers(&self, brokers: Vec<BrokerInfo>) {
        for broker in brokers {
            let address = broker.address();
            let unchanged = self
                .connections
                .get(&broker.node_id)
                .is_some_and(|c| c.address() == address);
            if !unchanged {
                debug!(broker_id = broker.node_id, address = %address, "registered broker");
                self.connections.insert(
                    broker.node_id,
                    Arc::new(BrokerConnection::new(broker.node_id, address, &self.settings)),
                );
            }
            self.brokers.insert(broker.node_id, broker);
        }
    }

    fn any_broker(&self) -> Option<Arc<BrokerConnection>> {
        self.connections
            .iter()
            .next()
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Get the number of known brokers (excluding bootstrap).
    #[must_use]
    pub fn broker_count(&self) -> usize {
        self.connections.len()
    }

    /// Disconnect all brokers.
    pub async fn disconnect_all(&self) {
        self.bootstrap.close().await;

        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in connections {
            conn.close().await;
        }
    }
}

/// Information about a Kafka broker.
#[derive(Debug, Clone)]
pub struct BrokerInfo {
    /// The broker node ID.
    pub node_id: i32,
    /// The broker hostname.
    pub host: String,
    /// The broker port.
    pub port: i32,
}

impl BrokerInfo {
    /// Create a new broker info.
    #[must_use]
    pub fn new(node_id: i32, host: String, port: i32) -> Self {
        Self {
            node_id,
            host,
            port,
        }
    }

    /// Address in `host:port` form.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Partition leaders of one topic.
#[derive(Debug, Clone, Default)]
pub struct TopicMetadata {
    /// Partition metadata indexed by partition ID.
    pub partitions: BTreeMap<i32, PartitionMetadata>,
}

impl TopicMetadata {
    /// Partition IDs in ascending order.
    #[must_use]
    pub fn partition_ids(&self) -> Vec<i32> {
        self.partitions.keys().copied().collect()
    }

    /// Leader broker ID of a partition, `-1` when it has none.
    #[must_use]
    pub fn leader(&self, partition: i32) -> Option<i32> {
        self.partitions.get(&partition).map(|p| p.leader)
    }
}

/// Leader and error state of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMetadata {
    /// Leader broker ID, `-1` when leaderless.
    pub leader: i32,
    /// Error code the broker reported for the partition.
    pub error_code: i16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            client_id: "test".to_string(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(1000),
            tls: None,
        }
    }

    fn pool(address: String) -> BrokerPool {
        BrokerPool::new(address, settings(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = pool("localhost:9092".to_string());
        assert_eq!(pool.broker_count(), 0);
    }

    #[tokio::test]
    async fn test_get_broker_not_found() {
        let pool = pool("localhost:9092".to_string());
        let result = pool.get_broker(1);
        assert!(matches!(result, Err(ClientError::BrokerUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_connect_to_invalid_bootstrap() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool(addr.to_string());
        assert!(matches!(
            pool.connect().await,
            Err(ClientError::BrokerUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata_discovers_leaders() {
        let broker = MockBroker::start(&[("orders", 3)]).await;
        let pool = pool(broker.address());
        pool.connect().await.unwrap();

        let metadata = pool.refresh_metadata("orders").await.unwrap();
        assert_eq!(metadata.partition_ids(), vec![0, 1, 2]);
        assert_eq!(pool.broker_count(), 1);

        let leader = pool.leader_for("orders", 1).await.unwrap();
        assert_eq!(leader.broker_id(), broker.node_id());
        assert_eq!(leader.address(), broker.address());
    }

    #[tokio::test]
    async fn test_unknown_topic_and_partition() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        let pool = pool(broker.address());

        assert!(matches!(
            pool.refresh_metadata("missing").await,
            Err(ClientError::TopicNotFound { .. })
        ));
        assert!(matches!(
            pool.leader_id("orders", 7).await,
            Err(ClientError::PartitionNotFound { partition: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_open_dedicated_is_a_new_connection() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        let pool = pool(broker.address());
        pool.refresh_metadata("orders").await.unwrap();
        let before = broker.connection_count();

        let conn = pool.open_dedicated(broker.node_id()).await.unwrap();
        assert!(conn.is_connected().await);
        broker.wait_for_connections(before + 1).await;

        pool.disconnect_all().await;
        assert!(conn.is_connected().await);
    }

    #[test]
    fn test_broker_info() {
        let info = BrokerInfo::new(1, "broker1.example.com".to_string(), 9092);
        assert_eq!(info.node_id, 1);
        assert_eq!(info.address(), "broker1.example.com:9092");
    }
}
