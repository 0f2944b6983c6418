//! Consumer runner: one worker task per partition, stopped by a shared
//! shutdown broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::{KafkaClient, Offset};
use crate::config::{ClientConfig, ConnectionParams, ConsumerConfig, StreamErrorPolicy};
use crate::error::{ClientError, Result};

use super::{MessageHandler, Shutdown, ShutdownSignal};

/// Lifecycle of a partition worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Resolving the newest offset and connecting to the leader.
    Starting,
    /// Handing messages to the handler.
    Streaming,
    /// Closing the partition stream.
    Draining,
    /// Done; the runner has been told how it ended.
    Closed,
}

/// How a partition worker ended.
#[derive(Debug)]
pub enum Outcome {
    /// Stopped by the shutdown broadcast.
    Stopped,
    /// The partition stream failed.
    Failed(ClientError),
}

/// Result of one partition worker.
#[derive(Debug)]
pub struct PartitionSummary {
    pub partition: i32,
    /// Messages handed to the handler.
    pub messages: u64,
    pub outcome: Outcome,
}

impl PartitionSummary {
    /// Whether the worker failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

/// Per-partition results of a consumer run, sorted by partition.
#[derive(Debug, Default)]
pub struct ConsumeReport {
    pub partitions: Vec<PartitionSummary>,
}

impl ConsumeReport {
    /// Partitions whose worker failed.
    pub fn failed(&self) -> impl Iterator<Item = &PartitionSummary> {
        self.partitions.iter().filter(|p| p.is_failed())
    }

    /// Whether every worker stopped cleanly.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Total messages handled across partitions.
    #[must_use]
    pub fn total_messages(&self) -> u64 {
        self.partitions.iter().map(|p| p.messages).sum()
    }
}

/// Streams every partition of one topic.
pub struct ConsumerRunner {
    client: Arc<KafkaClient>,
    topic: String,
    config: ConsumerConfig,
}

impl ConsumerRunner {
    #[must_use]
    pub fn new(client: Arc<KafkaClient>, topic: impl Into<String>, config: ConsumerConfig) -> Self {
        Self {
            client,
            topic: topic.into(),
            config,
        }
    }

    /// Consume until `shutdown` fires or, with [`StreamErrorPolicy::FailFast`],
    /// until the first partition fails.
    ///
    /// Returns only after every worker has closed its stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the partitions cannot be listed, or the first
    /// worker error under [`StreamErrorPolicy::FailFast`].
    pub async fn run(
        &self,
        mut shutdown: ShutdownSignal,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumeReport> {
        let partitions = self.client.partitions(&self.topic).await?;

        // Workers listen to a local broadcast so a failing worker can stop
        // its siblings without touching the caller's.
        let local = Shutdown::new();
        let forward = {
            let local = local.clone();
            tokio::spawn(async move {
                shutdown.wait().await;
                local.trigger();
            })
        };

        let mut workers = JoinSet::new();
        let mut task_partitions = HashMap::new();
        for partition in partitions {
            info!(topic = %self.topic, partition, "consume partition");
            let worker = Worker {
                client: Arc::clone(&self.client),
                topic: self.topic.clone(),
                partition,
                config: self.config.clone(),
                state: WorkerState::Starting,
                messages: 0,
            };
            let handle = workers.spawn(worker.run(local.signal(), Arc::clone(&handler)));
            task_partitions.insert(handle.id(), partition);
        }

        let mut report = ConsumeReport::default();
        let mut first_error = None;

        while let Some(joined) = workers.join_next().await {
            let summary = match joined {
                Ok(summary) => summary,
                Err(e) => PartitionSummary {
                    partition: task_partitions.get(&e.id()).copied().unwrap_or(-1),
                    messages: 0,
                    outcome: Outcome::Failed(ClientError::Worker(e.to_string())),
                },
            };

            let Outcome::Failed(err) = &summary.outcome else {
                report.partitions.push(summary);
                continue;
            };

            match self.config.on_stream_error {
                StreamErrorPolicy::FailFast => {
                    error!(topic = %self.topic, partition = summary.partition, error = %err, "partition failed, stopping all workers");
                    local.trigger();
                    if first_error.is_none() {
                        first_error = Some(summary);
                        continue;
                    }
                }
                StreamErrorPolicy::Isolate => {
                    warn!(topic = %self.topic, partition = summary.partition, error = %err, "partition failed, other partitions keep streaming");
                }
            }
            report.partitions.push(summary);
        }

        forward.abort();

        if let Some(PartitionSummary {
            outcome: Outcome::Failed(err),
            ..
        }) = first_error
        {
            return Err(err);
        }

        report.partitions.sort_by_key(|p| p.partition);
        Ok(report)
    }
}

/// Connect and stream every partition of `params.topic` until shut down.
///
/// # Errors
///
/// Returns the error that prevented the client from starting, or the error
/// returned by [`ConsumerRunner::run`].
pub async fn run_consumer(
    params: &ConnectionParams,
    client_config: &ClientConfig,
    consumer_config: &ConsumerConfig,
    shutdown: ShutdownSignal,
    handler: Arc<dyn MessageHandler>,
) -> Result<ConsumeReport> {
    consumer_config.validate()?;
    let client = Arc::new(KafkaClient::connect(params, client_config).await?);
    let runner = ConsumerRunner::new(Arc::clone(&client), params.topic.clone(), consumer_config.clone());
    let result = runner.run(shutdown, handler).await;
    client.close().await;
    result
}

struct Worker {
    client: Arc<KafkaClient>,
    topic: String,
    partition: i32,
    config: ConsumerConfig,
    state: WorkerState,
    messages: u64,
}

impl Worker {
    fn transition(&mut self, next: WorkerState) {
        debug!(topic = %self.topic, partition = self.partition, from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    async fn run(
        mut self,
        mut shutdown: ShutdownSignal,
        handler: Arc<dyn MessageHandler>,
    ) -> PartitionSummary {
        let consumer = tokio::select! {
            () = shutdown.wait() => None,
            consumer = self.client.consume_partition(&self.topic, self.partition, Offset::Newest, &self.config) => Some(consumer),
        };

        let result = match consumer {
            None => {
                info!(topic = %self.topic, partition = self.partition, "stop consuming partition");
                Ok(())
            }
            Some(Err(e)) => Err(e),
            Some(Ok(mut consumer)) => {
                self.transition(WorkerState::Streaming);
                let result = self.stream(&mut consumer, &mut shutdown, handler.as_ref()).await;
                self.transition(WorkerState::Draining);
                consumer.close().await;
                result
            }
        };

        self.transition(WorkerState::Closed);
        PartitionSummary {
            partition: self.partition,
            messages: self.messages,
            outcome: match result {
                Ok(()) => Outcome::Stopped,
                Err(e) => Outcome::Failed(e),
            },
        }
    }

    async fn stream(
        &mut self,
        consumer: &mut crate::client::PartitionConsumer,
        shutdown: &mut ShutdownSignal,
        handler: &dyn MessageHandler,
    ) -> Result<()> {
        let (messages, errors) = consumer.channels();

        loop {
            tokio::select! {
                biased;
                () = shutdown.wait() => {
                    info!(topic = %self.topic, partition = self.partition, "stop consuming partition");
                    return Ok(());
                }
                message = messages.recv() => match message {
                    Some(message) => {
                        handler.on_message(&message);
                        self.messages += 1;
                    }
                    None => {
                        // Queued messages are handed over first; the error,
                        // if any, follows once the message channel closes.
                        return Err(errors.recv().await.unwrap_or_else(|| ClientError::StreamClosed {
                            topic: self.topic.clone(),
                            partition: self.partition,
                        }));
                    }
                },
                Some(err) = errors.recv() => return Err(err),
            }
        }
    }
}
