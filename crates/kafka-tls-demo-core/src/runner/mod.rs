//! The two demo programs as library functions.
//!
//! - [`run_producer`] sends a fixed number of messages and reports where
//!   each one landed.
//! - [`ConsumerRunner`] streams every partition of a topic from the newest
//!   offset until shut down.

pub mod consumer;
pub mod producer;

pub use consumer::{
    run_consumer, ConsumeReport, ConsumerRunner, Outcome, PartitionSummary, WorkerState,
};
pub use producer::{run_producer, ProduceReport};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::client::ConsumedMessage;

/// Receives every message a consumer worker reads.
///
/// Called from the worker tasks, so implementations must be thread-safe
/// and should not block.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &ConsumedMessage);
}

/// Logs each message at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessageHandler;

impl MessageHandler for LogMessageHandler {
    fn on_message(&self, message: &ConsumedMessage) {
        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            message = %message.value_str(),
            "message received"
        );
    }
}

/// Owner side of a one-shot shutdown broadcast.
///
/// Triggering is idempotent. Every [`ShutdownSignal`] observes it, including
/// signals created after the trigger.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the broadcast.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the broadcast has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new receiver for the broadcast.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown was triggered, or once every [`Shutdown`]
    /// handle is gone.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    /// Whether shutdown was already triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_every_signal_sees_the_trigger() {
        let shutdown = Shutdown::new();
        let mut early = shutdown.signal();
        let waiter = tokio::spawn(async move { early.wait().await });

        shutdown.trigger();
        shutdown.trigger();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        let mut late = shutdown.signal();
        assert!(late.is_triggered());
        timeout(Duration::from_secs(1), late.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_untriggered_signal_keeps_waiting() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!shutdown.is_triggered());
        assert!(timeout(Duration::from_millis(50), signal.wait()).await.is_err());
    }
}
