//! RecordBatch helpers.
//!
//! The `kafka-protocol` crate does the v2 batch encoding (CRC, varints,
//! attributes). This module builds producer records and splits fetched
//! record data into complete batches before decoding, because a broker may
//! truncate the last batch of a fetch response at `partition_max_bytes`.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use kafka_protocol::records::{
    Compression, Record, RecordBatchDecoder, RecordBatchEncoder, RecordEncodeOptions,
    TimestampType,
};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Base offset (8 bytes) plus batch length (4 bytes).
const BATCH_LENGTH_PREFIX: usize = 12;

/// Build a non-idempotent, non-transactional record.
///
/// `offset` is the position inside the batch being built; the broker
/// assigns the real offsets on append.
#[must_use]
pub fn producer_record(offset: i64, key: Option<Bytes>, value: Option<Bytes>) -> Record {
    Record {
        transactional: false,
        control: false,
        partition_leader_epoch: -1,
        producer_id: -1,
        producer_epoch: -1,
        timestamp_type: TimestampType::Creation,
        offset,
        sequence: -1,
        timestamp: now_millis(),
        key,
        value,
        headers: Default::default(),
    }
}

/// Encode records as a single uncompressed RecordBatch v2.
///
/// # Errors
///
/// Returns an error if the batch cannot be encoded.
pub fn encode_batch(records: &[Record]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    RecordBatchEncoder::encode(
        &mut buf,
        records.iter(),
        &RecordEncodeOptions {
            version: 2,
            compression: Compression::None,
        },
    )
    .map_err(|e| ClientError::ProtocolEncode {
        message: format!("failed to encode record batch: {e}"),
    })?;
    Ok(buf.freeze())
}

/// Decode every complete batch in a fetch response's record data.
///
/// A trailing partial batch is dropped; the next fetch starts from the
/// offset after the last decoded record and picks it up again.
///
/// # Errors
///
/// Returns an error if a complete batch is malformed.
pub fn decode_batches(mut data: Bytes) -> Result<Vec<Record>> {
    let mut records = Vec::new();

    while data.len() >= BATCH_LENGTH_PREFIX {
        let batch_length = i32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        if batch_length < 0 {
            return Err(ClientError::ProtocolDecode {
                message: format!("negative record batch length: {batch_length}"),
            });
        }

        let total = BATCH_LENGTH_PREFIX + batch_length as usize;
        if data.len() < total {
            debug!(
                remaining = data.len(),
                needed = total,
                "ignoring incomplete trailing record batch"
            );
            break;
        }

        let mut batch = data.split_to(total);
        let record_set =
            RecordBatchDecoder::decode(&mut batch).map_err(|e| ClientError::ProtocolDecode {
                message: format!("failed to decode record batch: {e}"),
            })?;
        records.extend(record_set.records);
    }

    Ok(records)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_producer_record_is_not_idempotent() {
        let record = producer_record(0, None, value("0-hello kafka"));
        assert_eq!(record.producer_id, -1);
        assert_eq!(record.sequence, -1);
        assert!(!record.transactional);
        assert!(record.timestamp > 0);
    }

    #[test]
    fn test_decode_encoded_batch() {
        let records = vec![
            producer_record(0, None, value("0-hello kafka")),
            producer_record(1, value("k"), value("1-hello kafka")),
        ];
        let encoded = encode_batch(&records).unwrap();

        let decoded = decode_batches(encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].value, value("0-hello kafka"));
        assert_eq!(decoded[1].key, value("k"));
        assert_eq!(decoded[1].offset, 1);
    }

    #[test]
    fn test_truncated_trailing_batch_is_ignored() {
        let first = encode_batch(&[producer_record(0, None, value("a"))]).unwrap();
        let second = encode_batch(&[producer_record(1, None, value("b"))]).unwrap();

        let mut data = BytesMut::new();
        data.extend_from_slice(&first);
        data.extend_from_slice(&second[..second.len() - 3]);

        let decoded = decode_batches(data.freeze()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].value, value("a"));
    }

    #[test]
    fn test_empty_data() {
        assert!(decode_batches(Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn test_negative_batch_length_is_rejected() {
        let mut data = BytesMut::new();
        data.extend_from_slice(&0i64.to_be_bytes());
        data.extend_from_slice(&(-5i32).to_be_bytes());
        assert!(matches!(
            decode_batches(data.freeze()),
            Err(ClientError::ProtocolDecode { .. })
        ));
    }
}
