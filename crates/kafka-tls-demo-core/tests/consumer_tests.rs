//! Consumer runner tests: per-partition workers, shutdown and stream error
//! policies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use kafka_protocol::messages::ApiKey;
use kafka_tls_demo_core::client::{ConsumedMessage, KafkaClient};
use kafka_tls_demo_core::config::{ClientConfig, ConnectionParams, ConsumerConfig, StreamErrorPolicy};
use kafka_tls_demo_core::error::ClientError;
use kafka_tls_demo_core::protocol::error_codes;
use kafka_tls_demo_core::runner::{
    run_consumer, ConsumerRunner, MessageHandler, Outcome, Shutdown,
};
use kafka_tls_demo_core::testing::MockBroker;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Records `(partition, offset, value)` for every message handed over.
#[derive(Default)]
struct Collector {
    seen: Mutex<Vec<(i32, i64, String)>>,
}

impl Collector {
    fn seen(&self) -> Vec<(i32, i64, String)> {
        self.seen.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) {
        while self.seen.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl MessageHandler for Collector {
    fn on_message(&self, message: &ConsumedMessage) {
        self.seen.lock().unwrap().push((
            message.partition,
            message.offset,
            message.value_str().into_owned(),
        ));
    }
}

/// Blocks inside the first `on_message` until released, so later messages
/// pile up in the partition channel.
struct GatedHandler {
    entered: AtomicBool,
    release: Mutex<mpsc::Receiver<()>>,
    seen: Collector,
}

impl GatedHandler {
    fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let handler = Self {
            entered: AtomicBool::new(false),
            release: Mutex::new(rx),
            seen: Collector::default(),
        };
        (handler, tx)
    }
}

impl MessageHandler for GatedHandler {
    fn on_message(&self, message: &ConsumedMessage) {
        if !self.entered.swap(true, Ordering::SeqCst) {
            let _ = self.release.lock().unwrap().recv();
        }
        self.seen.on_message(message);
    }
}

fn params(broker: &MockBroker) -> ConnectionParams {
    ConnectionParams {
        broker: broker.address(),
        topic: "events".to_string(),
        enable_tls: false,
        ..ConnectionParams::default()
    }
}

fn fast_config(policy: StreamErrorPolicy) -> ConsumerConfig {
    ConsumerConfig {
        max_wait_ms: 50,
        retry_backoff_ms: 50,
        on_stream_error: policy,
        ..ConsumerConfig::default()
    }
}

async fn connect(broker: &MockBroker) -> Arc<KafkaClient> {
    Arc::new(
        KafkaClient::connect(&params(broker), &ClientConfig::default())
            .await
            .unwrap(),
    )
}

/// Wait until every worker has resolved its starting offset.
async fn wait_for_workers(broker: &MockBroker, partitions: usize) {
    let resolved = async {
        while broker.get_calls_for_api(ApiKey::ListOffsets).len() < partitions {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(TEST_TIMEOUT, resolved)
        .await
        .expect("workers never asked for their starting offsets");
    // Let the offset responses reach the workers.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_streams_every_partition_from_newest_until_shutdown() {
    let broker = MockBroker::start(&[("events", 3)]).await;
    for partition in 0..3 {
        broker.append("events", partition, &["old-a", "old-b"]);
    }

    let client = connect(&broker).await;
    let runner = ConsumerRunner::new(client, "events", fast_config(StreamErrorPolicy::FailFast));
    let shutdown = Shutdown::new();
    let collector = Arc::new(Collector::default());

    let run = {
        let signal = shutdown.signal();
        let handler: Arc<dyn MessageHandler> = collector.clone();
        tokio::spawn(async move { runner.run(signal, handler).await })
    };

    wait_for_workers(&broker, 3).await;
    for partition in 0..3 {
        broker.append("events", partition, &["new-1", "new-2"]);
    }
    timeout(TEST_TIMEOUT, collector.wait_for(6)).await.unwrap();

    shutdown.trigger();
    let report = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap().unwrap();

    assert!(report.is_success());
    assert_eq!(report.total_messages(), 6);
    let partitions: Vec<i32> = report.partitions.iter().map(|p| p.partition).collect();
    assert_eq!(partitions, vec![0, 1, 2]);
    for summary in &report.partitions {
        assert!(matches!(summary.outcome, Outcome::Stopped));
        assert_eq!(summary.messages, 2);
    }

    let seen = collector.seen();
    for partition in 0..3 {
        let in_partition: Vec<(i64, String)> = seen
            .iter()
            .filter(|(p, _, _)| *p == partition)
            .map(|(_, offset, value)| (*offset, value.clone()))
            .collect();
        assert_eq!(
            in_partition,
            vec![(2, "new-1".to_string()), (3, "new-2".to_string())],
            "partition {partition}"
        );
    }
}

#[tokio::test]
async fn test_shutdown_before_start_stops_every_worker() {
    let broker = MockBroker::start(&[("events", 2)]).await;
    let client = connect(&broker).await;
    let runner = ConsumerRunner::new(client, "events", fast_config(StreamErrorPolicy::FailFast));

    let shutdown = Shutdown::new();
    shutdown.trigger();

    let report = timeout(TEST_TIMEOUT, runner.run(shutdown.signal(), Arc::new(Collector::default())))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.partitions.len(), 2);
    assert!(report
        .partitions
        .iter()
        .all(|p| matches!(p.outcome, Outcome::Stopped) && p.messages == 0));
}

#[tokio::test]
async fn test_fail_fast_stops_all_workers_on_first_failure() {
    let broker = MockBroker::start(&[("events", 3)]).await;
    broker.fail_fetches("events", 1, error_codes::TOPIC_AUTHORIZATION_FAILED);

    let client = connect(&broker).await;
    let runner = ConsumerRunner::new(client, "events", fast_config(StreamErrorPolicy::FailFast));
    let shutdown = Shutdown::new();

    let err = timeout(TEST_TIMEOUT, runner.run(shutdown.signal(), Arc::new(Collector::default())))
        .await
        .expect("a failing partition should end the run")
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Broker { code: 29, partition: 1, .. }),
        "got {err}"
    );
    assert!(!shutdown.is_triggered());
}

#[tokio::test]
async fn test_isolate_keeps_other_partitions_streaming() {
    let broker = MockBroker::start(&[("events", 3)]).await;
    broker.fail_fetches("events", 1, error_codes::TOPIC_AUTHORIZATION_FAILED);

    let client = connect(&broker).await;
    let runner = ConsumerRunner::new(client, "events", fast_config(StreamErrorPolicy::Isolate));
    let shutdown = Shutdown::new();
    let collector = Arc::new(Collector::default());

    let run = {
        let signal = shutdown.signal();
        let handler: Arc<dyn MessageHandler> = collector.clone();
        tokio::spawn(async move { runner.run(signal, handler).await })
    };

    wait_for_workers(&broker, 3).await;
    broker.append("events", 0, &["zero"]);
    broker.append("events", 2, &["two"]);
    timeout(TEST_TIMEOUT, collector.wait_for(2)).await.unwrap();

    shutdown.trigger();
    let report = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap().unwrap();

    assert!(!report.is_success());
    let failed: Vec<i32> = report.failed().map(|p| p.partition).collect();
    assert_eq!(failed, vec![1]);
    assert!(matches!(report.partitions[0].outcome, Outcome::Stopped));
    assert!(matches!(report.partitions[2].outcome, Outcome::Stopped));
    assert_eq!(report.total_messages(), 2);
}

#[tokio::test]
async fn test_run_consumer_rejects_invalid_consumer_config() {
    let broker = MockBroker::start(&[("events", 1)]).await;
    let config = ConsumerConfig {
        channel_buffer_size: 0,
        ..ConsumerConfig::default()
    };
    let shutdown = Shutdown::new();

    let err = run_consumer(
        &params(&broker),
        &ClientConfig::default(),
        &config,
        shutdown.signal(),
        Arc::new(Collector::default()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_run_consumer_unknown_topic() {
    let broker = MockBroker::start(&[("events", 1)]).await;
    let mut params = params(&broker);
    params.topic = "missing".to_string();
    let shutdown = Shutdown::new();

    let err = run_consumer(
        &params,
        &ClientConfig::default(),
        &ConsumerConfig::default(),
        shutdown.signal(),
        Arc::new(Collector::default()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ClientError::TopicNotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_messages_are_handled_before_the_stream_error() {
    let broker = MockBroker::start(&[("events", 1)]).await;
    let client = connect(&broker).await;
    let runner = ConsumerRunner::new(client, "events", fast_config(StreamErrorPolicy::Isolate));
    let shutdown = Shutdown::new();
    let (handler, release) = GatedHandler::new();
    let handler = Arc::new(handler);

    let run = {
        let signal = shutdown.signal();
        let handler: Arc<dyn MessageHandler> = handler.clone();
        tokio::spawn(async move { runner.run(signal, handler).await })
    };

    wait_for_workers(&broker, 1).await;
    broker.append("events", 0, &["a", "b", "c"]);
    timeout(TEST_TIMEOUT, async {
        while !handler.entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // "b" and "c" are queued; make the next fetch fail for good.
    broker.fail_fetches("events", 0, error_codes::TOPIC_AUTHORIZATION_FAILED);
    let fetches = broker.get_calls_for_api(ApiKey::Fetch).len();
    timeout(TEST_TIMEOUT, async {
        while broker.get_calls_for_api(ApiKey::Fetch).len() <= fetches {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    release.send(()).unwrap();

    let report = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    let summary = &report.partitions[0];
    assert!(
        matches!(summary.outcome, Outcome::Failed(ClientError::Broker { code: 29, .. })),
        "got {:?}",
        summary.outcome
    );
    assert_eq!(summary.messages, 3);
    let values: Vec<String> = handler.seen.seen().into_iter().map(|(_, _, v)| v).collect();
    assert_eq!(values, vec!["a", "b", "c"]);
}
