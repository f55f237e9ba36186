use super::Codec;
use crate::error::CodecError;
use crate::event::Event;

/// 基于 bincode 的紧凑二进制编解码器
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn content_type(&self) -> &'static str {
        "application/x-bincode"
    }

    fn encode<E: Event>(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(event).map_err(|e| CodecError::Encode {
            event_type: E::EVENT_TYPE,
            reason: e.to_string(),
        })
    }

    fn decode<E: Event>(&self, bytes: &[u8]) -> Result<E, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode {
            event_type: E::EVENT_TYPE,
            reason: e.to_string(),
        })
    }
}
