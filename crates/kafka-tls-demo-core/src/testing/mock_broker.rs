//! Mock Kafka broker for integration testing.
//!
//! A single-node, in-memory broker that:
//! - Accepts Kafka protocol connections, plain or TLS
//! - Answers Metadata, Produce, ListOffsets and Fetch
//! - Records every request and counts accepted connections
//! - Injects produce and fetch error codes on demand

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use kafka_protocol::messages::fetch_response::{FetchableTopicResponse, PartitionData};
use kafka_protocol::messages::list_offsets_response::{
    ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::produce_response::{
    PartitionProduceResponse, TopicProduceResponse,
};
use kafka_protocol::messages::{
    ApiKey, BrokerId, FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse,
    MetadataRequest, MetadataResponse, ProduceRequest, ProduceResponse, RequestHeader,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Request, StrBytes};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use crate::protocol::records::{decode_batches, encode_batch, producer_record};
use crate::protocol::{error_codes, topic_name, FrameCodec, EARLIEST_TIMESTAMP};

/// How often a waiting fetch or helper re-checks the log.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// The API key of the request.
    pub api_key: ApiKey,
    /// The API version of the request.
    pub api_version: i16,
    /// The correlation ID.
    pub correlation_id: i32,
}

/// A message stored in a partition log; its offset is its index.
#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<Bytes>,
    value: Option<Bytes>,
    timestamp: i64,
}

#[derive(Default)]
struct BrokerState {
    topics: Mutex<HashMap<String, Vec<Vec<StoredMessage>>>>,
    produce_errors: Mutex<VecDeque<i16>>,
    fetch_errors: Mutex<HashMap<(String, i32), i16>>,
    call_log: Mutex<Vec<BrokerCall>>,
    connections: AtomicUsize,
}

/// Lock a mutex, ignoring poisoning from a panicked test thread.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Mock Kafka broker for testing.
///
/// The broker is node 0 and advertises its own listening address, so a
/// client bootstrapped against it also uses it as partition leader.
pub struct MockBroker {
    address: String,
    state: Arc<BrokerState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockBroker {
    /// Node ID the broker reports in metadata.
    pub const NODE_ID: i32 = 0;

    /// Start a plaintext broker hosting `topics` as `(name, partitions)`.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn start(topics: &[(&str, i32)]) -> Self {
        Self::try_start(topics, None)
            .await
            .expect("bind mock broker")
    }

    /// Start a broker that requires a TLS handshake before any request.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn start_tls(topics: &[(&str, i32)], acceptor: TlsAcceptor) -> Self {
        Self::try_start(topics, Some(acceptor))
            .await
            .expect("bind mock broker")
    }

    /// Start the broker on an ephemeral local port.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn try_start(
        topics: &[(&str, i32)],
        acceptor: Option<TlsAcceptor>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        let state = Arc::new(BrokerState::default());
        {
            let mut logs = lock(&state.topics);
            for (name, partitions) in topics {
                let count = usize::try_from(*partitions).unwrap_or_default();
                logs.insert((*name).to_string(), vec![Vec::new(); count]);
            }
        }

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (host, port) = split_address(&address);

        let accept_state = Arc::clone(&state);
        let accept_shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, _addr)) = result else { break };
                        accept_state.connections.fetch_add(1, Ordering::SeqCst);

                        let conn = Connection {
                            state: Arc::clone(&accept_state),
                            host: host.clone(),
                            port,
                        };
                        let shutdown_rx = accept_shutdown.subscribe();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor {
                                Some(acceptor) => {
                                    // A failed handshake just drops the socket.
                                    if let Ok(tls) = acceptor.accept(stream).await {
                                        conn.serve(tls, shutdown_rx).await;
                                    }
                                }
                                None => conn.serve(stream, shutdown_rx).await,
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            address,
            state,
            shutdown_tx,
        })
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// The broker address.
    #[must_use]
    pub fn address(&self) -> String {
        self.address.clone()
    }

    /// The broker node ID.
    #[must_use]
    pub fn node_id(&self) -> i32 {
        Self::NODE_ID
    }

    /// Number of TCP connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` connections have been accepted.
    pub async fn wait_for_connections(&self, count: usize) {
        while self.connection_count() < count {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Append messages with the given values, as if produced by someone else.
    ///
    /// # Panics
    ///
    /// Panics if the partition does not exist.
    pub fn append(&self, topic: &str, partition: i32, values: &[&str]) {
        let mut logs = lock(&self.state.topics);
        let log = partition_log(&mut logs, topic, partition).expect("unknown partition");
        for value in values {
            log.push(StoredMessage {
                key: None,
                value: Some(Bytes::copy_from_slice(value.as_bytes())),
                timestamp: 0,
            });
        }
    }

    /// Values stored in a partition, in offset order.
    #[must_use]
    pub fn values(&self, topic: &str, partition: i32) -> Vec<String> {
        let mut logs = lock(&self.state.topics);
        partition_log(&mut logs, topic, partition)
            .map(|log| {
                log.iter()
                    .map(|m| String::from_utf8_lossy(m.value.as_deref().unwrap_or_default()).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Wait until a partition holds at least `count` messages.
    pub async fn wait_for_messages(&self, topic: &str, partition: i32, count: usize) {
        while self.values(topic, partition).len() < count {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Answer the next produce requests with these error codes, in order.
    pub fn fail_next_produces(&self, codes: &[i16]) {
        lock(&self.state.produce_errors).extend(codes.iter().copied());
    }

    /// Answer every fetch of a partition with an error code until cleared.
    pub fn fail_fetches(&self, topic: &str, partition: i32, code: i16) {
        lock(&self.state.fetch_errors).insert((topic.to_string(), partition), code);
    }

    /// Stop injecting fetch errors for a partition.
    pub fn clear_fetch_failure(&self, topic: &str, partition: i32) {
        lock(&self.state.fetch_errors).remove(&(topic.to_string(), partition));
    }

    /// Get all recorded calls.
    #[must_use]
    pub fn get_calls(&self) -> Vec<BrokerCall> {
        lock(&self.state.call_log).clone()
    }

    /// Get calls filtered by API key.
    #[must_use]
    pub fn get_calls_for_api(&self, api_key: ApiKey) -> Vec<BrokerCall> {
        lock(&self.state.call_log)
            .iter()
            .filter(|c| c.api_key == api_key)
            .cloned()
            .collect()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A request payload with the leading header fields read ahead.
struct RequestFrame {
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    bytes: Bytes,
}

impl RequestFrame {
    /// Read api key, api version and correlation id, which every request
    /// header version starts with.
    fn parse(payload: BytesMut) -> io::Result<Self> {
        let mut peek = payload.get(..8).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "request shorter than its header")
        })?;
        let raw_key = peek.get_i16();
        let api_version = peek.get_i16();
        let correlation_id = peek.get_i32();
        let api_key = ApiKey::try_from(raw_key).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, format!("unknown api key {raw_key}"))
        })?;

        Ok(Self {
            api_key,
            api_version,
            correlation_id,
            bytes: payload.freeze(),
        })
    }
}

/// One accepted client connection.
struct Connection {
    state: Arc<BrokerState>,
    host: String,
    port: i32,
}

impl Connection {
    async fn serve<S>(self, stream: S, mut shutdown_rx: broadcast::Receiver<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, FrameCodec::new());

        loop {
            let payload = tokio::select! {
                _ = shutdown_rx.recv() => break,
                payload = framed.next() => match payload {
                    Some(Ok(payload)) => payload,
                    _ => break,
                },
            };
            let Ok(frame) = RequestFrame::parse(payload) else {
                break;
            };

            lock(&self.state.call_log).push(BrokerCall {
                api_key: frame.api_key,
                api_version: frame.api_version,
                correlation_id: frame.correlation_id,
            });

            let correlation_id = frame.correlation_id;
            let body = match self.handle(frame).await {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(_) => break,
            };

            // Response header v0 is just the correlation id.
            let mut response = BytesMut::with_capacity(4 + body.len());
            response.put_i32(correlation_id);
            response.extend_from_slice(&body);

            if framed.send(response.freeze()).await.is_err() {
                break;
            }
        }
    }

    /// Produce the response body, or `None` when the request expects no
    /// response.
    async fn handle(&self, frame: RequestFrame) -> io::Result<Option<BytesMut>> {
        let version = frame.api_version;
        match frame.api_key {
            ApiKey::Metadata => {
                let request: MetadataRequest = decode_request(frame)?;
                encode_response(&self.metadata(&request), version).map(Some)
            }
            ApiKey::Produce => {
                let request: ProduceRequest = decode_request(frame)?;
                let response = self.produce(&request);
                if request.acks == 0 {
                    return Ok(None);
                }
                encode_response(&response, version).map(Some)
            }
            ApiKey::ListOffsets => {
                let request: ListOffsetsRequest = decode_request(frame)?;
                encode_response(&self.list_offsets(&request), version).map(Some)
            }
            ApiKey::Fetch => {
                let request: FetchRequest = decode_request(frame)?;
                let response = self.fetch(&request).await?;
                encode_response(&response, version).map(Some)
            }
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("mock broker does not implement {other:?}"),
            )),
        }
    }

    fn metadata(&self, request: &MetadataRequest) -> MetadataResponse {
        let logs = lock(&self.state.topics);

        let requested: Vec<String> = match &request.topics {
            Some(topics) => topics
                .iter()
                .filter_map(|t| t.name.as_ref().map(|n| n.0.to_string()))
                .collect(),
            None => logs.keys().cloned().collect(),
        };

        let topics = requested
            .into_iter()
            .map(|name| {
                let topic = MetadataResponseTopic::default().with_name(Some(topic_name(&name)));
                match logs.get(&name) {
                    Some(partitions) => topic.with_partitions(
                        (0..partitions.len())
                            .map(|index| {
                                MetadataResponsePartition::default()
                                    .with_partition_index(index as i32)
                                    .with_leader_id(BrokerId(MockBroker::NODE_ID))
                                    .with_replica_nodes(vec![BrokerId(MockBroker::NODE_ID)])
                                    .with_isr_nodes(vec![BrokerId(MockBroker::NODE_ID)])
                            })
                            .collect(),
                    ),
                    None => topic.with_error_code(error_codes::UNKNOWN_TOPIC_OR_PARTITION),
                }
            })
            .collect();

        MetadataResponse::default()
            .with_brokers(vec![MetadataResponseBroker::default()
                .with_node_id(BrokerId(MockBroker::NODE_ID))
                .with_host(StrBytes::from_string(self.host.clone()))
                .with_port(self.port)])
            .with_controller_id(BrokerId(MockBroker::NODE_ID))
            .with_topics(topics)
    }

    fn produce(&self, request: &ProduceRequest) -> ProduceResponse {
        let mut logs = lock(&self.state.topics);

        let responses = request
            .topic_data
            .iter()
            .map(|topic| {
                let partition_responses = topic
                    .partition_data
                    .iter()
                    .map(|data| {
                        let response = PartitionProduceResponse::default().with_index(data.index);
                        if let Some(code) = lock(&self.state.produce_errors).pop_front() {
                            return response.with_error_code(code).with_base_offset(-1);
                        }
                        let Some(log) = partition_log(&mut logs, &topic.name.0, data.index) else {
                            return response
                                .with_error_code(error_codes::UNKNOWN_TOPIC_OR_PARTITION)
                                .with_base_offset(-1);
                        };
                        let records = match data.records.clone().map(decode_batches) {
                            Some(Ok(records)) => records,
                            None => Vec::new(),
                            Some(Err(_)) => {
                                return response
                                    .with_error_code(error_codes::CORRUPT_MESSAGE)
                                    .with_base_offset(-1)
                            }
                        };

                        let base_offset = log.len() as i64;
                        log.extend(records.into_iter().map(|r| StoredMessage {
                            key: r.key,
                            value: r.value,
                            timestamp: r.timestamp,
                        }));
                        response.with_base_offset(base_offset)
                    })
                    .collect();

                TopicProduceResponse::default()
                    .with_name(topic.name.clone())
                    .with_partition_responses(partition_responses)
            })
            .collect();

        ProduceResponse::default().with_responses(responses)
    }

    fn list_offsets(&self, request: &ListOffsetsRequest) -> ListOffsetsResponse {
        let mut logs = lock(&self.state.topics);

        let topics = request
            .topics
            .iter()
            .map(|topic| {
                let partitions = topic
                    .partitions
                    .iter()
                    .map(|p| {
                        let response = ListOffsetsPartitionResponse::default()
                            .with_partition_index(p.partition_index)
                            .with_timestamp(-1);
                        match partition_log(&mut logs, &topic.name.0, p.partition_index) {
                            Some(_) if p.timestamp == EARLIEST_TIMESTAMP => {
                                response.with_offset(0)
                            }
                            Some(log) => response.with_offset(log.len() as i64),
                            None => response
                                .with_error_code(error_codes::UNKNOWN_TOPIC_OR_PARTITION)
                                .with_offset(-1),
                        }
                    })
                    .collect();
                ListOffsetsTopicResponse::default()
                    .with_name(topic.name.clone())
                    .with_partitions(partitions)
            })
            .collect();

        ListOffsetsResponse::default().with_topics(topics)
    }

    async fn fetch(&self, request: &FetchRequest) -> io::Result<FetchResponse> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(u64::try_from(request.max_wait_ms).unwrap_or_default());

        loop {
            let (response, has_data) = self.fetch_once(request)?;
            if has_data || tokio::time::Instant::now() >= deadline {
                return Ok(response);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn fetch_once(&self, request: &FetchRequest) -> io::Result<(FetchResponse, bool)> {
        let mut logs = lock(&self.state.topics);
        let fetch_errors = lock(&self.state.fetch_errors);
        let mut has_data = false;
        let mut responses = Vec::new();

        for topic in &request.topics {
            let mut partitions = Vec::new();
            for p in &topic.partitions {
                let data = PartitionData::default().with_partition_index(p.partition);
                let key = (topic.topic.0.to_string(), p.partition);

                if let Some(code) = fetch_errors.get(&key) {
                    has_data = true;
                    partitions.push(data.with_error_code(*code).with_high_watermark(-1));
                    continue;
                }

                let Some(log) = partition_log(&mut logs, &topic.topic.0, p.partition) else {
                    has_data = true;
                    partitions.push(
                        data.with_error_code(error_codes::UNKNOWN_TOPIC_OR_PARTITION)
                            .with_high_watermark(-1),
                    );
                    continue;
                };

                let high_watermark = log.len() as i64;
                if p.fetch_offset < 0 || p.fetch_offset > high_watermark {
                    has_data = true;
                    partitions.push(
                        data.with_error_code(error_codes::OFFSET_OUT_OF_RANGE)
                            .with_high_watermark(high_watermark),
                    );
                    continue;
                }

                let records: Vec<_> = log
                    .iter()
                    .enumerate()
                    .skip(p.fetch_offset as usize)
                    .map(|(offset, m)| {
                        let mut record =
                            producer_record(offset as i64, m.key.clone(), m.value.clone());
                        record.timestamp = m.timestamp;
                        record
                    })
                    .collect();

                let data = data
                    .with_high_watermark(high_watermark)
                    .with_last_stable_offset(high_watermark);
                if records.is_empty() {
                    partitions.push(data.with_records(Some(Bytes::new())));
                } else {
                    has_data = true;
                    let batch = encode_batch(&records)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    partitions.push(data.with_records(Some(batch)));
                }
            }

            responses.push(
                FetchableTopicResponse::default()
                    .with_topic(topic.topic.clone())
                    .with_partitions(partitions),
            );
        }

        Ok((FetchResponse::default().with_responses(responses), has_data))
    }
}

fn partition_log<'a>(
    logs: &'a mut HashMap<String, Vec<Vec<StoredMessage>>>,
    topic: &str,
    partition: i32,
) -> Option<&'a mut Vec<StoredMessage>> {
    let index = usize::try_from(partition).ok()?;
    logs.get_mut(topic)?.get_mut(index)
}

fn split_address(address: &str) -> (String, i32) {
    let (host, port) = address.rsplit_once(':').unwrap_or((address, "0"));
    (host.to_string(), port.parse().unwrap_or_default())
}

fn decode_request<R: Request>(frame: RequestFrame) -> io::Result<R> {
    let version = frame.api_version;
    let mut buf = frame.bytes;
    RequestHeader::decode(&mut buf, R::header_version(version))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    R::decode(&mut buf, version).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn encode_response<M: Encodable>(message: &M, version: i16) -> io::Result<BytesMut> {
    let mut body = BytesMut::new();
    message
        .encode(&mut body, version)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(body)
}
