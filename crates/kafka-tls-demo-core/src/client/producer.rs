//! Synchronous producer: one message per request, acknowledged before the
//! call returns.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::ProduceRequest;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::{ProducerConfig, RequiredAcks};
use crate::error::{ClientError, Result};
use crate::protocol::records::{encode_batch, producer_record};
use crate::protocol::{error_codes, topic_name, versions};

use super::KafkaClient;

/// A message to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMessage {
    pub topic: String,
    /// Keyed messages always land on the same partition.
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ProducerMessage {
    /// A keyless message with a UTF-8 payload.
    pub fn new(topic: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: Bytes::from(value.into()),
        }
    }

    /// Set the message key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Sends messages one at a time and waits for each acknowledgement.
pub struct SyncProducer {
    client: Arc<KafkaClient>,
    config: ProducerConfig,
}

impl SyncProducer {
    /// Create a producer on top of a connected client.
    #[must_use]
    pub fn new(client: Arc<KafkaClient>, config: ProducerConfig) -> Self {
        Self { client, config }
    }

    /// Send one message and return the partition and offset it was stored at.
    ///
    /// Retriable failures are retried up to `max_retries` times; errors
    /// that point at a stale leader refresh metadata first. With `acks = 0` the broker does
    /// not answer and the returned offset is `-1`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::RetriesExhausted`] when every attempt failed
    /// with a retriable error, or the first non-retriable error.
    pub async fn send_message(&self, message: &ProducerMessage) -> Result<(i32, i64)> {
        let topic = message.topic.as_str();
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut partition = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = match partition {
                Some(p) => self.produce(message, p).await,
                None => match self.choose_partition(message).await {
                    Ok(p) => {
                        partition = Some(p);
                        self.produce(message, p).await
                    }
                    Err(e) => Err(e),
                },
            };

            let err = match result {
                Ok(sent) => return Ok(sent),
                Err(e) if e.is_retriable() => e,
                Err(e) => return Err(e),
            };

            if attempt > self.config.max_retries {
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                topic,
                partition = ?partition,
                attempt,
                max_retries = self.config.max_retries,
                error = %err,
                "produce failed, retrying"
            );
            tokio::time::sleep(backoff).await;

            if err.requires_metadata_refresh() {
                if let Err(e) = self.client.pool().refresh_metadata(topic).await {
                    debug!(topic, error = %e, "metadata refresh before retry failed");
                }
            }
        }
    }

    /// Close the producer and its connections.
    pub async fn close(&self) {
        self.client.close().await;
    }

    async fn choose_partition(&self, message: &ProducerMessage) -> Result<i32> {
        let partitions = self
            .client
            .pool()
            .topic_metadata(&message.topic)
            .await?
            .partition_ids();
        if partitions.is_empty() {
            return Err(ClientError::TopicNotFound {
                topic: message.topic.clone(),
            });
        }

        let index = match &message.key {
            Some(key) => fnv1a(key) as usize % partitions.len(),
            None => rand::thread_rng().gen_range(0..partitions.len()),
        };
        Ok(partitions[index])
    }

    async fn produce(&self, message: &ProducerMessage, partition: i32) -> Result<(i32, i64)> {
        let topic = message.topic.as_str();
        let leader = self.client.pool().leader_for(topic, partition).await?;

        let record = producer_record(0, message.key.clone(), Some(message.value.clone()));
        let records = encode_batch(&[record])?;

        let request = ProduceRequest::default()
            .with_acks(self.config.required_acks.as_i16())
            .with_timeout_ms(self.config.timeout_ms)
            .with_topic_data(vec![TopicProduceData::default()
                .with_name(topic_name(topic))
                .with_partition_data(vec![PartitionProduceData::default()
                    .with_index(partition)
                    .with_records(Some(records))])]);

        if self.config.required_acks == RequiredAcks::NoResponse {
            leader
                .send_without_response(&request, versions::PRODUCE)
                .await?;
            return Ok((partition, -1));
        }

        let response = leader.call(&request, versions::PRODUCE).await?;
        let partition_response = response
            .responses
            .iter()
            .filter(|t| &*t.name.0 == topic)
            .flat_map(|t| t.partition_responses.iter())
            .find(|p| p.index == partition)
            .ok_or_else(|| ClientError::ProtocolDecode {
                message: format!("Produce response missing {topic}/{partition}"),
            })?;

        if partition_response.error_code != error_codes::NONE {
            return Err(ClientError::Broker {
                api: "Produce",
                topic: topic.to_string(),
                partition,
                code: partition_response.error_code,
            });
        }

        Ok((partition, partition_response.base_offset))
    }
}

/// 32-bit FNV-1a hash of a message key.
fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(0x0100_0193)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ConnectionParams};
    use crate::testing::MockBroker;

    async fn producer(broker: &MockBroker, config: ProducerConfig) -> SyncProducer {
        let params = ConnectionParams {
            broker: broker.address(),
            topic: "orders".to_string(),
            enable_tls: false,
            ..ConnectionParams::default()
        };
        let client = KafkaClient::connect(&params, &ClientConfig::default())
            .await
            .unwrap();
        SyncProducer::new(Arc::new(client), config)
    }

    fn fast_retries(max_retries: u32) -> ProducerConfig {
        ProducerConfig {
            max_retries,
            retry_backoff_ms: 1,
            ..ProducerConfig::default()
        }
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
    }

    #[tokio::test]
    async fn test_offsets_increase_per_partition() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        let producer = producer(&broker, ProducerConfig::default()).await;

        for expected in 0..3 {
            let (partition, offset) = producer
                .send_message(&ProducerMessage::new("orders", format!("{expected}-hello kafka")))
                .await
                .unwrap();
            assert_eq!(partition, 0);
            assert_eq!(offset, expected);
        }
        assert_eq!(broker.values("orders", 0), vec!["0-hello kafka", "1-hello kafka", "2-hello kafka"]);
    }

    #[tokio::test]
    async fn test_keyed_messages_stick_to_one_partition() {
        let broker = MockBroker::start(&[("orders", 4)]).await;
        let producer = producer(&broker, ProducerConfig::default()).await;

        let message = ProducerMessage::new("orders", "v").with_key("customer-42");
        let (first, _) = producer.send_message(&message).await.unwrap();
        for _ in 0..5 {
            let (partition, _) = producer.send_message(&message).await.unwrap();
            assert_eq!(partition, first);
        }
    }

    #[tokio::test]
    async fn test_retriable_errors_within_budget() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        broker.fail_next_produces(&[
            error_codes::NOT_LEADER_OR_FOLLOWER,
            error_codes::REQUEST_TIMED_OUT,
        ]);
        let producer = producer(&broker, fast_retries(5)).await;

        let (_, offset) = producer
            .send_message(&ProducerMessage::new("orders", "x"))
            .await
            .unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        broker.fail_next_produces(&[error_codes::NOT_LEADER_OR_FOLLOWER; 4]);
        let producer = producer(&broker, fast_retries(2)).await;

        let err = producer
            .send_message(&ProducerMessage::new("orders", "x"))
            .await
            .unwrap_err();
        match err {
            ClientError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ClientError::Broker { code: 6, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(broker.values("orders", 0).is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        broker.fail_next_produces(&[error_codes::MESSAGE_TOO_LARGE]);
        let producer = producer(&broker, fast_retries(5)).await;

        let err = producer
            .send_message(&ProducerMessage::new("orders", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Broker { code: 10, .. }));
    }

    #[tokio::test]
    async fn test_acks_zero_returns_unknown_offset() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        let config = ProducerConfig {
            required_acks: RequiredAcks::NoResponse,
            ..ProducerConfig::default()
        };
        let producer = producer(&broker, config).await;

        let (partition, offset) = producer
            .send_message(&ProducerMessage::new("orders", "fire"))
            .await
            .unwrap();
        assert_eq!((partition, offset), (0, -1));
        broker.wait_for_messages("orders", 0, 1).await;
    }
}
