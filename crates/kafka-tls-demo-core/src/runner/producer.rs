//! Producer runner: send `message_count` demo messages, one at a time.

use std::sync::Arc;

use tracing::{error, info};

use crate::client::{KafkaClient, ProducerMessage, SyncProducer};
use crate::config::{ClientConfig, ConnectionParams, ProducerConfig};
use crate::error::Result;

/// Where each message landed, in send order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceReport {
    pub sent: Vec<(i32, i64)>,
}

/// Payload of the `index`-th demo message.
#[must_use]
pub fn demo_payload(index: usize) -> String {
    format!("{index}-hello kafka")
}

/// Connect, send the demo messages and close the producer.
///
/// Each send is acknowledged before the next one starts. The first failed
/// send ends the run; earlier messages stay sent.
///
/// # Errors
///
/// Returns the configuration, TLS or connection error that prevented the
/// producer from starting, or the error of the first failed send.
pub async fn run_producer(
    params: &ConnectionParams,
    client_config: &ClientConfig,
    producer_config: &ProducerConfig,
) -> Result<ProduceReport> {
    let client = Arc::new(KafkaClient::connect(params, client_config).await?);
    let producer = SyncProducer::new(client, producer_config.clone());
    let mut report = ProduceReport::default();

    for index in 0..producer_config.message_count {
        let message = ProducerMessage::new(params.topic.clone(), demo_payload(index));
        match producer.send_message(&message).await {
            Ok((partition, offset)) => {
                info!(topic = %params.topic, partition, offset, "message sent");
                report.sent.push((partition, offset));
            }
            Err(e) => {
                error!(topic = %params.topic, error = %e, "failed to send message");
                producer.close().await;
                return Err(e);
            }
        }
    }

    producer.close().await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_payload() {
        assert_eq!(demo_payload(0), "0-hello kafka");
        assert_eq!(demo_payload(9), "9-hello kafka");
    }
}
