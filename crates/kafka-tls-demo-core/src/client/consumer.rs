//! Partition consumer.
//!
//! A background task long-polls the partition leader over a dedicated
//! connection and feeds two bounded channels: one with messages in offset
//! order, one with the error that ended the stream. Transient failures are
//! retried inside the task and never reach the error channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
use kafka_protocol::messages::{BrokerId, FetchRequest};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::broker::BrokerConnection;
use crate::config::ConsumerConfig;
use crate::error::{ClientError, Result};
use crate::protocol::records::decode_batches;
use crate::protocol::{error_codes, topic_name, versions};

use super::KafkaClient;

/// A message read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since the epoch, as stored in the record.
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl ConsumedMessage {
    /// The value as text, lossily decoded.
    #[must_use]
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.value.as_deref().unwrap_or_default())
    }
}

/// A running stream over one partition.
pub struct PartitionConsumer {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<ConsumedMessage>,
    errors: mpsc::Receiver<ClientError>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PartitionConsumer {
    pub(crate) fn spawn(
        client: Arc<KafkaClient>,
        conn: BrokerConnection,
        topic: String,
        partition: i32,
        offset: i64,
        config: ConsumerConfig,
    ) -> Self {
        let (message_tx, messages) = mpsc::channel(config.channel_buffer_size);
        let (error_tx, errors) = mpsc::channel(config.channel_buffer_size);
        let (stop, stop_rx) = watch::channel(false);

        let fetcher = Fetcher {
            client,
            conn,
            topic: topic.clone(),
            partition,
            offset,
            config,
            messages: message_tx,
            stop: stop_rx,
        };
        let task = tokio::spawn(async move {
            if let Err(e) = fetcher.run().await {
                // The receiver is gone only if the consumer was dropped.
                let _ = error_tx.send(e).await;
            }
        });

        debug!(topic = %topic, partition, offset, "partition consumer started");
        Self {
            topic,
            partition,
            messages,
            errors,
            stop,
            task: Some(task),
        }
    }

    /// Topic being consumed.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition being consumed.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// The message and error channels, borrowed together so both can be
    /// awaited in one `select!`.
    pub fn channels(
        &mut self,
    ) -> (
        &mut mpsc::Receiver<ConsumedMessage>,
        &mut mpsc::Receiver<ClientError>,
    ) {
        (&mut self.messages, &mut self.errors)
    }

    /// Receive the next message; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ConsumedMessage> {
        self.messages.recv().await
    }

    /// Receive the error that ended the stream, if any.
    pub async fn recv_error(&mut self) -> Option<ClientError> {
        self.errors.recv().await
    }

    /// Stop the fetch task and release its connection.
    pub async fn close(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(topic = %self.topic, partition = self.partition, error = %e, "fetch task failed");
            }
        }
        debug!(topic = %self.topic, partition = self.partition, "partition consumer closed");
    }
}

impl Drop for PartitionConsumer {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// State of the background fetch loop.
struct Fetcher {
    client: Arc<KafkaClient>,
    conn: BrokerConnection,
    topic: String,
    partition: i32,
    offset: i64,
    config: ConsumerConfig,
    messages: mpsc::Sender<ConsumedMessage>,
    stop: watch::Receiver<bool>,
}

/// What a single fetch round asks the loop to do next.
enum Step {
    Continue,
    Retry(ClientError),
    Stop,
}

impl Fetcher {
    /// Fetch until stopped; returns the error that ended the stream.
    async fn run(mut self) -> Result<()> {
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);

        loop {
            let step = match self.fetch_once().await {
                Ok(step) => step,
                Err(e) if e.is_retriable() => Step::Retry(e),
                Err(e) => return Err(e),
            };

            match step {
                Step::Continue => {}
                Step::Stop => {
                    self.conn.close().await;
                    return Ok(());
                }
                Step::Retry(err) => {
                    warn!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = self.offset,
                        error = %err,
                        "fetch failed, retrying"
                    );
                    if !self.sleep_unless_stopped(backoff).await {
                        return Ok(());
                    }
                    if err.requires_metadata_refresh() {
                        self.reconnect().await?;
                    }
                }
            }
        }
    }

    async fn fetch_once(&mut self) -> Result<Step> {
        let request = FetchRequest::default()
            .with_replica_id(BrokerId(-1))
            .with_max_wait_ms(self.config.max_wait_ms)
            .with_min_bytes(self.config.min_bytes)
            .with_max_bytes(self.config.max_bytes)
            .with_isolation_level(0)
            .with_topics(vec![FetchTopic::default()
                .with_topic(topic_name(&self.topic))
                .with_partitions(vec![FetchPartition::default()
                    .with_partition(self.partition)
                    .with_fetch_offset(self.offset)
                    .with_partition_max_bytes(self.config.partition_max_bytes)])]);

        let response = tokio::select! {
            _ = self.stop.wait_for(|stopped| *stopped) => return Ok(Step::Stop),
            response = self.conn.call(&request, versions::FETCH) => response?,
        };

        let topic = self.topic.as_str();
        let partition = self.partition;
        let Some(data) = response
            .responses
            .into_iter()
            .filter(|t| &*t.topic.0 == topic)
            .flat_map(|t| t.partitions.into_iter())
            .find(|p| p.partition_index == partition)
        else {
            return Err(ClientError::ProtocolDecode {
                message: format!("Fetch response missing {topic}/{partition}"),
            });
        };

        if data.error_code != error_codes::NONE {
            let err = ClientError::Broker {
                api: "Fetch",
                topic: topic.to_string(),
                partition,
                code: data.error_code,
            };
            if err.is_retriable() {
                return Ok(Step::Retry(err));
            }
            return Err(err);
        }

        let Some(records) = data.records else {
            return Ok(Step::Continue);
        };

        for record in decode_batches(records)? {
            // A batch may start before the requested offset.
            if record.offset < self.offset {
                continue;
            }

            let message = ConsumedMessage {
                topic: self.topic.clone(),
                partition,
                offset: record.offset,
                timestamp: record.timestamp,
                key: record.key,
                value: record.value,
            };
            trace!(topic, partition, offset = message.offset, "fetched message");

            tokio::select! {
                _ = self.stop.wait_for(|stopped| *stopped) => return Ok(Step::Stop),
                sent = self.messages.send(message) => {
                    if sent.is_err() {
                        return Ok(Step::Stop);
                    }
                }
            }
            self.offset = record.offset + 1;
        }

        Ok(Step::Continue)
    }

    /// Refresh metadata and connect to whichever broker leads the partition now.
    async fn reconnect(&mut self) -> Result<()> {
        if let Err(e) = self.client.pool().refresh_metadata(&self.topic).await {
            if !e.is_retriable() {
                return Err(e);
            }
            debug!(topic = %self.topic, error = %e, "metadata refresh failed");
            return Ok(());
        }

        match self
            .client
            .leader_connection(&self.topic, self.partition)
            .await
        {
            Ok(conn) => {
                self.conn.close().await;
                self.conn = conn;
                Ok(())
            }
            Err(e) if e.is_retriable() => {
                debug!(topic = %self.topic, partition = self.partition, error = %e, "leader not reachable yet");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns `false` if the consumer was stopped while sleeping.
    async fn sleep_unless_stopped(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.wait_for(|stopped| *stopped) => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Offset;
    use crate::config::{ClientConfig, ConnectionParams};
    use crate::testing::MockBroker;
    use tokio::time::timeout;

    async fn client(broker: &MockBroker) -> Arc<KafkaClient> {
        let params = ConnectionParams {
            broker: broker.address(),
            topic: "orders".to_string(),
            enable_tls: false,
            ..ConnectionParams::default()
        };
        Arc::new(
            KafkaClient::connect(&params, &ClientConfig::default())
                .await
                .unwrap(),
        )
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            max_wait_ms: 50,
            retry_backoff_ms: 10,
            ..ConsumerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_newest_skips_existing_messages() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        broker.append("orders", 0, &["old-1", "old-2"]);
        let client = client(&broker).await;

        let mut consumer = client
            .consume_partition("orders", 0, Offset::Newest, &fast_config())
            .await
            .unwrap();
        broker.append("orders", 0, &["new-1", "new-2"]);

        let first = timeout(Duration::from_secs(5), consumer.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(5), consumer.recv()).await.unwrap().unwrap();
        assert_eq!((first.offset, first.value_str().as_ref()), (2, "new-1"));
        assert_eq!((second.offset, second.value_str().as_ref()), (3, "new-2"));

        consumer.close().await;
    }

    #[tokio::test]
    async fn test_oldest_reads_everything_in_order() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        broker.append("orders", 0, &["a", "b", "c"]);
        let client = client(&broker).await;

        let mut consumer = client
            .consume_partition("orders", 0, Offset::Oldest, &fast_config())
            .await
            .unwrap();

        for (expected_offset, expected) in ["a", "b", "c"].iter().enumerate() {
            let message = timeout(Duration::from_secs(5), consumer.recv()).await.unwrap().unwrap();
            assert_eq!(message.offset, expected_offset as i64);
            assert_eq!(message.value_str(), *expected);
        }
        consumer.close().await;
    }

    #[tokio::test]
    async fn test_fatal_fetch_error_reaches_error_channel() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        let client = client(&broker).await;
        let mut consumer = client
            .consume_partition("orders", 0, Offset::Newest, &fast_config())
            .await
            .unwrap();

        broker.fail_fetches("orders", 0, error_codes::TOPIC_AUTHORIZATION_FAILED);

        let err = timeout(Duration::from_secs(5), consumer.recv_error())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, ClientError::Broker { api: "Fetch", code: 29, .. }));
        assert!(consumer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_transient_fetch_error_is_retried() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        let client = client(&broker).await;
        let mut consumer = client
            .consume_partition("orders", 0, Offset::Newest, &fast_config())
            .await
            .unwrap();

        broker.fail_fetches("orders", 0, error_codes::NOT_LEADER_OR_FOLLOWER);
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.clear_fetch_failure("orders", 0);
        broker.append("orders", 0, &["after-recovery"]);

        let message = timeout(Duration::from_secs(5), consumer.recv()).await.unwrap().unwrap();
        assert_eq!(message.value_str(), "after-recovery");
        consumer.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_fetch_task() {
        let broker = MockBroker::start(&[("orders", 1)]).await;
        let client = client(&broker).await;
        let mut consumer = client
            .consume_partition("orders", 0, Offset::Newest, &fast_config())
            .await
            .unwrap();

        timeout(Duration::from_secs(5), consumer.close()).await.unwrap();
        assert!(consumer.recv().await.is_none());
        assert!(consumer.recv_error().await.is_none());
    }
}
