use super::Codec;
use crate::error::CodecError;
use crate::event::Event;

/// 基于 serde_json 的默认编解码器
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<E: Event>(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(|e| CodecError::Encode {
            event_type: E::EVENT_TYPE,
            reason: e.to_string(),
        })
    }

    fn decode<E: Event>(&self, bytes: &[u8]) -> Result<E, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            event_type: E::EVENT_TYPE,
            reason: e.to_string(),
        })
    }
}
