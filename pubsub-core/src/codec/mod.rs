//! 编解码器（Codec）
//!
//! 负责事件值与字节之间的转换，纯函数、无状态、可替换。
//! 编解码失败属于永久错误，不参与发布重试。
//!
#[cfg(feature = "bincode")]
mod binary;
mod json;

#[cfg(feature = "bincode")]
pub use binary::BincodeCodec;
pub use json::JsonCodec;

use crate::error::CodecError;
use crate::event::Event;

/// 事件编解码协议
pub trait Codec: Clone + Default + Send + Sync + 'static {
    /// 写入信封的内容类型（如 `application/json`）
    fn content_type(&self) -> &'static str;

    fn encode<E: Event>(&self, event: &E) -> Result<Vec<u8>, CodecError>;

    fn decode<E: Event>(&self, bytes: &[u8]) -> Result<E, CodecError>;
}
