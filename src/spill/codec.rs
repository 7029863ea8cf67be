//! Record codecs
//!
//! A codec turns an application record into the opaque bytes stored in a
//! spill file and back. An absent record is always the empty byte sequence,
//! which keeps "no record" distinct from a record whose encoding happens to
//! be short.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::{CodecError, CodecResult};

/// Strategy for converting records of type `T` to and from bytes
pub trait RecordCodec<T>: Send + Sync {
    /// Encode a record; `None` encodes to an empty vector
    fn encode(&self, record: Option<&T>) -> CodecResult<Vec<u8>>;

    /// Decode a record; empty input decodes to `None`
    fn decode(&self, bytes: &[u8]) -> CodecResult<Option<T>>;
}

/// JSON codec for any serde type
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Create a JSON codec
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecordCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, record: Option<&T>) -> CodecResult<Vec<u8>> {
        match record {
            None => Ok(Vec::new()),
            Some(record) => serde_json::to_vec(record).map_err(|e| CodecError::Encode {
                type_name: std::any::type_name::<T>(),
                message: e.to_string(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Option<T>> {
        if bytes.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|e| CodecError::Decode {
                type_name: std::any::type_name::<T>(),
                len: bytes.len(),
                message: e.to_string(),
            })
    }
}

/// Presence tag written before raw payloads
const RAW_PRESENT: u8 = 1;

/// Codec for records that are already bytes
///
/// A one-byte tag precedes the payload so an empty `Vec` survives the
/// round trip as `Some(vec![])` rather than collapsing into `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl RecordCodec<Vec<u8>> for RawCodec {
    fn encode(&self, record: Option<&Vec<u8>>) -> CodecResult<Vec<u8>> {
        Ok(match record {
            None => Vec::new(),
            Some(bytes) => {
                let mut buf = Vec::with_capacity(bytes.len() + 1);
                buf.push(RAW_PRESENT);
                buf.extend_from_slice(bytes);
                buf
            },
        })
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Option<Vec<u8>>> {
        match bytes.split_first() {
            None => Ok(None),
            Some((&RAW_PRESENT, payload)) => Ok(Some(payload.to_vec())),
            Some((tag, _)) => Err(CodecError::Decode {
                type_name: "Vec<u8>",
                len: bytes.len(),
                message: format!("unknown presence tag {:#04x}", tag),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ChannelSample {
        channel_id: String,
        ert_ms: i64,
        dn: f64,
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec::<ChannelSample>::new();
        let sample = ChannelSample {
            channel_id: "A-0001".to_string(),
            ert_ms: 1_700_000_000_000,
            dn: 42.5,
        };

        let bytes = codec.encode(Some(&sample)).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(codec.decode(&bytes).unwrap(), Some(sample));
    }

    #[test]
    fn test_json_absent_record() {
        let codec = JsonCodec::<ChannelSample>::new();
        let bytes = codec.encode(None).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(codec.decode(&bytes).unwrap(), None);
    }

    #[test]
    fn test_json_empty_string_is_a_record() {
        let codec = JsonCodec::<String>::new();
        let bytes = codec.encode(Some(&String::new())).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), Some(String::new()));
    }

    #[test]
    fn test_json_wrong_type_is_codec_error() {
        let codec = JsonCodec::<ChannelSample>::new();
        let bytes = JsonCodec::<u32>::new().encode(Some(&7)).unwrap();

        match codec.decode(&bytes) {
            Err(CodecError::Decode { len, .. }) => assert_eq!(len, bytes.len()),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_round_trip_including_empty() {
        let codec = RawCodec;

        for record in [vec![], vec![0u8], vec![1, 2, 3, 255]] {
            let bytes = codec.encode(Some(&record)).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), Some(record));
        }

        assert!(codec.encode(None).unwrap().is_empty());
        assert_eq!(codec.decode(&[]).unwrap(), None);
    }

    #[test]
    fn test_raw_bad_tag() {
        assert!(matches!(
            RawCodec.decode(&[9, 1, 2]),
            Err(CodecError::Decode { .. })
        ));
    }
}
