//! Minimal Kafka client used by the demos.
//!
//! [`KafkaClient`] owns the broker pool and answers metadata and offset
//! lookups. [`SyncProducer`] sends one message at a time and waits for the
//! broker's acknowledgement. [`PartitionConsumer`] streams one partition
//! from a starting offset.

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumedMessage, PartitionConsumer};
pub use producer::{ProducerMessage, SyncProducer};

use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};
use kafka_protocol::messages::{BrokerId, ListOffsetsRequest};
use tracing::{debug, info};

use crate::broker::{BrokerConnection, BrokerPool, ConnectionSettings};
use crate::config::{ClientConfig, ConnectionParams, ConsumerConfig};
use crate::error::{ClientError, Result};
use crate::protocol::{error_codes, topic_name, versions, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP};
use crate::tls::build_tls_connector;

/// Where a partition consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// The next message appended after the consumer starts.
    Newest,
    /// The oldest message still retained.
    Oldest,
    /// An explicit offset.
    At(i64),
}

/// Connection to one Kafka cluster.
///
/// Read-only after [`KafkaClient::connect`]; share it through an [`Arc`].
pub struct KafkaClient {
    pool: BrokerPool,
}

impl KafkaClient {
    /// Validate the parameters, build the TLS context if enabled and
    /// connect to the bootstrap broker.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty topic or malformed broker
    /// address before touching any file or socket, a TLS error if the
    /// security context cannot be built, or a connection error.
    pub async fn connect(params: &ConnectionParams, config: &ClientConfig) -> Result<Self> {
        params.validate()?;

        let tls = params
            .tls_config()
            .map(|tls| build_tls_connector(&tls))
            .transpose()?;

        let pool = BrokerPool::new(
            params.broker.clone(),
            ConnectionSettings::new(config, tls),
            Duration::from_millis(config.metadata_retry_backoff_ms),
        );
        pool.connect().await?;

        info!(broker = %params.broker, tls = params.enable_tls, "kafka client connected");
        Ok(Self { pool })
    }

    /// The underlying broker pool.
    #[must_use]
    pub fn pool(&self) -> &BrokerPool {
        &self.pool
    }

    /// Sorted partition IDs of a topic, fetched fresh from the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TopicNotFound`] for an unknown topic, or any
    /// error from the metadata request.
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        Ok(self.pool.refresh_metadata(topic).await?.partition_ids())
    }

    /// Resolve a starting position to a concrete offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the ListOffsets request fails or the broker
    /// reports an error for the partition.
    pub async fn resolve_offset(&self, topic: &str, partition: i32, offset: Offset) -> Result<i64> {
        let timestamp = match offset {
            Offset::At(offset) => return Ok(offset),
            Offset::Newest => LATEST_TIMESTAMP,
            Offset::Oldest => EARLIEST_TIMESTAMP,
        };

        let leader = self.pool.leader_for(topic, partition).await?;
        let request = ListOffsetsRequest::default()
            .with_replica_id(BrokerId(-1))
            .with_topics(vec![ListOffsetsTopic::default()
                .with_name(topic_name(topic))
                .with_partitions(vec![ListOffsetsPartition::default()
                    .with_partition_index(partition)
                    .with_timestamp(timestamp)])]);

        let response = leader.call(&request, versions::LIST_OFFSETS).await?;
        let partition_response = response
            .topics
            .iter()
            .filter(|t| &*t.name.0 == topic)
            .flat_map(|t| t.partitions.iter())
            .find(|p| p.partition_index == partition)
            .ok_or_else(|| ClientError::ProtocolDecode {
                message: format!("ListOffsets response missing {topic}/{partition}"),
            })?;

        if partition_response.error_code != error_codes::NONE {
            return Err(ClientError::Broker {
                api: "ListOffsets",
                topic: topic.to_string(),
                partition,
                code: partition_response.error_code,
            });
        }

        debug!(topic, partition, ?offset, resolved = partition_response.offset, "resolved offset");
        Ok(partition_response.offset)
    }

    /// Start streaming one partition from `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the starting offset cannot be resolved or the
    /// partition leader cannot be reached.
    pub async fn consume_partition(
        self: &Arc<Self>,
        topic: &str,
        partition: i32,
        offset: Offset,
        config: &ConsumerConfig,
    ) -> Result<PartitionConsumer> {
        let start = self.resolve_offset(topic, partition, offset).await?;
        let conn = self.leader_connection(topic, partition).await?;
        Ok(PartitionConsumer::spawn(
            Arc::clone(self),
            conn,
            topic.to_string(),
            partition,
            start,
            config.clone(),
        ))
    }

    /// Open a dedicated connection to the current leader of a partition.
    pub(crate) async fn leader_connection(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<BrokerConnection> {
        let leader = self.pool.leader_id(topic, partition).await?;
        self.pool.open_dedicated(leader).await
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.disconnect_all().await;
    }
}
