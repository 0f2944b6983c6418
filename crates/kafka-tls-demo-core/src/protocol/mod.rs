//! Kafka wire protocol helpers shared by the client and the mock broker.
//!
//! - [`codec`] - length-prefixed frame codec with a size limit
//! - [`error_codes`] - the Kafka error codes the client reacts to
//! - [`records`] - RecordBatch v2 encoding and decoding
//! - [`versions`] - the API versions this client speaks

pub mod codec;
pub mod error_codes;
pub mod records;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};

use kafka_protocol::messages::TopicName;
use kafka_protocol::protocol::StrBytes;

/// API versions used by the client.
///
/// All of them are non-flexible, so requests carry header v1 and responses
/// header v0. Produce v3 / Fetch v4 are the first versions carrying
/// RecordBatch v2.
pub mod versions {
    pub const METADATA: i16 = 1;
    pub const PRODUCE: i16 = 3;
    pub const LIST_OFFSETS: i16 = 1;
    pub const FETCH: i16 = 4;
}

/// ListOffsets timestamp asking for the log end offset.
pub const LATEST_TIMESTAMP: i64 = -1;

/// ListOffsets timestamp asking for the log start offset.
pub const EARLIEST_TIMESTAMP: i64 = -2;

/// Wrap a topic string for use in a request.
#[must_use]
pub fn topic_name(topic: &str) -> TopicName {
    TopicName(StrBytes::from_string(topic.to_string()))
}
